//! Fill-pattern decomposition for node-graph back ends.
//!
//! Node-graph drivers bound the element width a single memset node can
//! write (1, 2 or 4 bytes). A wider pattern is decomposed into strided
//! steps: one node covering the leading native-width chunk of every
//! pattern repetition, then one single-byte node per remaining pattern
//! byte. Ordering across the decomposition is preserved by chaining each
//! step on all previously emitted steps of the same fill.

/// One strided write: `elem` at `base + offset + i * pitch` for
/// `i in 0..count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillStep {
    /// Byte offset of the step's first write from the fill destination.
    pub offset: usize,
    /// Bytes written at each stride.
    pub elem: Vec<u8>,
    /// Distance between consecutive writes; always the pattern width.
    pub pitch: usize,
    /// Number of writes; always the pattern repetition count.
    pub count: usize,
}

/// Plan the strided steps implementing `pattern` repeated over `len`
/// bytes, given the element widths the native memset node accepts.
///
/// Callers guarantee `pattern` is a non-empty power-of-two width and
/// `len` a multiple of it.
pub fn plan_fill_steps(pattern: &[u8], len: usize, native_widths: &[usize]) -> Vec<FillStep> {
    let width = pattern.len();
    let reps = len / width;

    if native_widths.contains(&width) {
        return vec![FillStep { offset: 0, elem: pattern.to_vec(), pitch: width, count: reps }];
    }

    // Widest chunk the native node can carry leads each repetition.
    let chunk = native_widths.iter().copied().max().unwrap_or(1);
    let mut steps =
        vec![FillStep { offset: 0, elem: pattern[..chunk].to_vec(), pitch: width, count: reps }];
    for byte in chunk..width {
        steps.push(FillStep {
            offset: byte,
            elem: vec![pattern[byte]],
            pitch: width,
            count: reps,
        });
    }
    steps
}
