//! ND-range execution geometry for recorded kernel launches.

use gantry_core::error::{Error, Result, check_work_dim};
use serde::{Deserialize, Serialize};

/// Work geometry of one kernel dispatch.
///
/// Unused dimensions carry a global size of 1 and an offset of 0. A local
/// size of 0 in a used dimension leaves the work-group shape to the
/// driver model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdRange {
    work_dim: u32,
    global_offset: [usize; 3],
    global_size: [usize; 3],
    local_size: [usize; 3],
}

impl NdRange {
    /// Range over `global_size`, padding unused dimensions.
    pub fn new(work_dim: u32, global_size: &[usize]) -> Result<Self> {
        check_work_dim(work_dim)?;
        if global_size.len() != work_dim as usize {
            return Err(Error::InvalidValue(format!(
                "global size has {} entries for work dimension {work_dim}",
                global_size.len(),
            )));
        }
        let mut global = [1; 3];
        global[..global_size.len()].copy_from_slice(global_size);
        Ok(Self { work_dim, global_offset: [0; 3], global_size: global, local_size: [0; 3] })
    }

    /// One-dimensional range of `n` work items.
    pub fn linear(n: usize) -> Self {
        Self { work_dim: 1, global_offset: [0; 3], global_size: [n, 1, 1], local_size: [0; 3] }
    }

    /// Builder – set the global offset (entries beyond the work
    /// dimension are ignored at validation).
    #[must_use]
    pub const fn with_global_offset(mut self, offset: [usize; 3]) -> Self {
        self.global_offset = offset;
        self
    }

    /// Builder – set an explicit work-group shape.
    #[must_use]
    pub const fn with_local_size(mut self, local: [usize; 3]) -> Self {
        self.local_size = local;
        self
    }

    pub const fn work_dim(&self) -> u32 {
        self.work_dim
    }

    pub const fn global_offset(&self) -> [usize; 3] {
        self.global_offset
    }

    pub const fn global_size(&self) -> [usize; 3] {
        self.global_size
    }

    pub const fn local_size(&self) -> [usize; 3] {
        self.local_size
    }

    /// True when no work items would execute.
    pub fn is_zero_range(&self) -> bool {
        self.global_size[..self.work_dim as usize].contains(&0)
    }

    /// Total work items across all dimensions.
    pub const fn work_item_count(&self) -> usize {
        self.global_size[0] * self.global_size[1] * self.global_size[2]
    }

    /// Check dimensionality, padding, and group-size divisibility.
    pub fn validate(&self) -> Result<()> {
        check_work_dim(self.work_dim)?;
        let dim = self.work_dim as usize;
        // Global size of unused dimensions must be 1.
        for (i, &size) in self.global_size.iter().enumerate().skip(dim) {
            if size != 1 {
                return Err(Error::InvalidValue(format!(
                    "global size must be 1 in unused dimension {i}, got {size}",
                )));
            }
        }
        for i in 0..dim {
            let local = self.local_size[i];
            if local != 0 && self.global_size[i] % local != 0 {
                return Err(Error::InvalidSize(format!(
                    "global size {} is not a multiple of the group size {local} in dimension {i}",
                    self.global_size[i],
                )));
            }
        }
        Ok(())
    }

    /// Apply sparse new geometry, keeping the recorded dimensionality.
    pub(crate) fn apply(
        &mut self,
        global_offset: Option<[usize; 3]>,
        global_size: Option<[usize; 3]>,
        local_size: Option<[usize; 3]>,
    ) {
        if let Some(offset) = global_offset {
            self.global_offset = offset;
        }
        if let Some(global) = global_size {
            self.global_size = global;
        }
        if let Some(local) = local_size {
            self.local_size = local;
        }
    }
}
