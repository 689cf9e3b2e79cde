//! Device memory model: byte arenas keyed by allocation id.
//!
//! Back ends never see raw pointers. A [`DevicePtr`] is an index-based
//! handle (allocation id + byte offset) into the owning context's
//! [`MemoryPool`], resolved and bounds-checked at every access. Host-side
//! staging memory for recorded read/write commands lives in shared
//! [`HostBuffer`]s so a recorded command can reference it after the append
//! call returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

// ── Handles ────────────────────────────────────────────────────────────────

/// Identifier of one allocation inside a [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(pub(crate) u64);

/// An offset view into an allocation. The device-pointer analogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    alloc: AllocId,
    offset: usize,
}

impl DevicePtr {
    /// Allocation this pointer refers to.
    pub const fn alloc(&self) -> AllocId {
        self.alloc
    }

    /// Byte offset from the start of the allocation.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Pointer advanced by `delta` bytes. Bounds are checked on access,
    /// not here.
    #[must_use]
    pub const fn offset_by(self, delta: usize) -> Self {
        Self { alloc: self.alloc, offset: self.offset + delta }
    }
}

// ── Rect geometry ──────────────────────────────────────────────────────────

/// Origin of a 3D region in elements of bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RectOffset {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl RectOffset {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }
}

/// Extent of a 3D region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectRegion {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl RectRegion {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }

    /// Total bytes covered by the region.
    pub const fn byte_count(&self) -> usize {
        self.width * self.height * self.depth
    }
}

/// Row/slice pitches with the zero-means-packed convention: a zero row
/// pitch defaults to the region width, a zero slice pitch to
/// `height * row_pitch`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RectPitches {
    pub row: usize,
    pub slice: usize,
}

impl RectPitches {
    pub const fn new(row: usize, slice: usize) -> Self {
        Self { row, slice }
    }

    /// Resolve defaults against a region.
    #[must_use]
    pub const fn resolve(self, region: &RectRegion) -> Self {
        let row = if self.row == 0 { region.width } else { self.row };
        let slice = if self.slice == 0 { region.height * row } else { self.slice };
        Self { row, slice }
    }

    /// Linear byte offset of `(x, y, z)` under these (resolved) pitches.
    pub const fn linearize(&self, origin: &RectOffset, x: usize, y: usize, z: usize) -> usize {
        (origin.z + z) * self.slice + (origin.y + y) * self.row + origin.x + x
    }
}

// ── Host staging ───────────────────────────────────────────────────────────

/// Shared host staging storage referenced by recorded read/write commands.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Zero-initialised host buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { bytes: Arc::new(Mutex::new(vec![0; len])) }
    }

    /// Host buffer initialised from `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self { bytes: Arc::new(Mutex::new(data.to_vec())) }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().expect("host buffer lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffer contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().expect("host buffer lock").clone()
    }

    /// Read `dst.len()` bytes starting at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock().expect("host buffer lock");
        let end = offset.checked_add(dst.len()).ok_or_else(range_overflow)?;
        if end > bytes.len() {
            return Err(Error::InvalidSize(format!(
                "host read of {} bytes at offset {offset} exceeds buffer of {} bytes",
                dst.len(),
                bytes.len(),
            )));
        }
        dst.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    /// Write `src` starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock().expect("host buffer lock");
        let end = offset.checked_add(src.len()).ok_or_else(range_overflow)?;
        if end > bytes.len() {
            return Err(Error::InvalidSize(format!(
                "host write of {} bytes at offset {offset} exceeds buffer of {} bytes",
                src.len(),
                bytes.len(),
            )));
        }
        bytes[offset..end].copy_from_slice(src);
        Ok(())
    }
}

/// Either side of a recorded copy: device memory or host staging.
#[derive(Debug, Clone)]
pub enum MemLocation {
    Device(DevicePtr),
    Host { buf: HostBuffer, offset: usize },
}

impl MemLocation {
    /// Location advanced by `delta` bytes.
    #[must_use]
    pub fn offset_by(&self, delta: usize) -> Self {
        match self {
            Self::Device(ptr) => Self::Device(ptr.offset_by(delta)),
            Self::Host { buf, offset } => Self::Host { buf: buf.clone(), offset: offset + delta },
        }
    }
}

// ── Memory objects ─────────────────────────────────────────────────────────

/// A sized buffer object wrapping one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemObject {
    base: DevicePtr,
    size: usize,
}

impl MemObject {
    pub(crate) const fn new(base: DevicePtr, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn base(&self) -> DevicePtr {
        self.base
    }

    /// Device pointer `offset` bytes into the buffer; the access range
    /// `[offset, offset + len)` must stay inside the buffer.
    pub fn ptr_with_offset(&self, offset: usize, len: usize) -> Result<DevicePtr> {
        let end = offset.checked_add(len).ok_or_else(range_overflow)?;
        if end > self.size {
            return Err(Error::InvalidSize(format!(
                "access of {len} bytes at offset {offset} exceeds buffer of {} bytes",
                self.size,
            )));
        }
        Ok(self.base.offset_by(offset))
    }
}

// ── Pool ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PoolInner {
    allocations: HashMap<AllocId, Vec<u8>>,
    next_id: u64,
}

/// Byte arenas standing in for device allocations. One pool per context;
/// all accesses are bounds checked against the owning allocation.
#[derive(Debug, Default)]
pub struct MemoryPool {
    inner: Mutex<PoolInner>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` zero-initialised bytes (the USM-style entry point).
    pub fn alloc(&self, size: usize) -> Result<DevicePtr> {
        if size == 0 {
            return Err(Error::InvalidSize("zero-sized allocation".into()));
        }
        let mut inner = self.inner.lock().expect("memory pool lock");
        let id = AllocId(inner.next_id);
        inner.next_id += 1;
        inner.allocations.insert(id, vec![0; size]);
        Ok(DevicePtr { alloc: id, offset: 0 })
    }

    /// Allocate a sized buffer object.
    pub fn alloc_buffer(&self, size: usize) -> Result<MemObject> {
        Ok(MemObject::new(self.alloc(size)?, size))
    }

    /// Release an allocation. The pointer must refer to offset zero of a
    /// live allocation.
    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.offset != 0 {
            return Err(Error::InvalidValue("free of interior pointer".into()));
        }
        let mut inner = self.inner.lock().expect("memory pool lock");
        inner
            .allocations
            .remove(&ptr.alloc)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidValue(format!("unknown allocation {:?}", ptr.alloc)))
    }

    /// Size in bytes of a live allocation.
    pub fn size_of(&self, alloc: AllocId) -> Result<usize> {
        let inner = self.inner.lock().expect("memory pool lock");
        inner
            .allocations
            .get(&alloc)
            .map(Vec::len)
            .ok_or_else(|| Error::InvalidValue(format!("unknown allocation {alloc:?}")))
    }

    /// Check that `[ptr, ptr + len)` lies inside its allocation.
    pub fn check_range(&self, ptr: DevicePtr, len: usize) -> Result<()> {
        let size = self.size_of(ptr.alloc)?;
        let end = ptr.offset.checked_add(len).ok_or_else(range_overflow)?;
        if end > size {
            return Err(Error::InvalidSize(format!(
                "access of {len} bytes at offset {} exceeds allocation of {size} bytes",
                ptr.offset,
            )));
        }
        Ok(())
    }

    /// Read `dst.len()` bytes from device memory.
    pub fn read(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().expect("memory pool lock");
        let bytes = inner
            .allocations
            .get(&src.alloc)
            .ok_or_else(|| Error::InvalidValue(format!("unknown allocation {:?}", src.alloc)))?;
        let end = src.offset.checked_add(dst.len()).ok_or_else(range_overflow)?;
        if end > bytes.len() {
            return Err(Error::InvalidSize(format!(
                "read of {} bytes at offset {} exceeds allocation of {} bytes",
                dst.len(),
                src.offset,
                bytes.len(),
            )));
        }
        dst.copy_from_slice(&bytes[src.offset..end]);
        Ok(())
    }

    /// Write `src` to device memory.
    pub fn write(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory pool lock");
        let bytes = inner
            .allocations
            .get_mut(&dst.alloc)
            .ok_or_else(|| Error::InvalidValue(format!("unknown allocation {:?}", dst.alloc)))?;
        let end = dst.offset.checked_add(src.len()).ok_or_else(range_overflow)?;
        if end > bytes.len() {
            return Err(Error::InvalidSize(format!(
                "write of {} bytes at offset {} exceeds allocation of {} bytes",
                src.len(),
                dst.offset,
                bytes.len(),
            )));
        }
        bytes[dst.offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Device-to-device copy. Staged through a host temporary so that
    /// overlapping and same-allocation copies behave like `memmove`.
    pub fn copy(&self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<()> {
        let mut tmp = vec![0; len];
        self.read(src, &mut tmp)?;
        self.write(dst, &tmp)
    }

    /// Repeat `pattern` over `len` bytes at `dst`. `len` must be a
    /// multiple of the pattern width.
    pub fn fill(&self, dst: DevicePtr, pattern: &[u8], len: usize) -> Result<()> {
        if pattern.is_empty() || len % pattern.len() != 0 {
            return Err(Error::InvalidSize(format!(
                "fill of {len} bytes is not a multiple of pattern width {}",
                pattern.len(),
            )));
        }
        let mut tmp = Vec::with_capacity(len);
        while tmp.len() < len {
            tmp.extend_from_slice(pattern);
        }
        self.write(dst, &tmp)
    }

    /// Write `elem` at `dst + i * pitch` for `i in 0..count`. The strided
    /// primitive the node-graph memset decomposition lowers to.
    pub fn fill_strided(
        &self,
        dst: DevicePtr,
        elem: &[u8],
        pitch: usize,
        count: usize,
    ) -> Result<()> {
        for i in 0..count {
            self.write(dst.offset_by(i * pitch), elem)?;
        }
        Ok(())
    }

    /// Copy of `[ptr, ptr + len)` for inspection.
    pub fn snapshot(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.read(ptr, &mut out)?;
        Ok(out)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.inner.lock().expect("memory pool lock").allocations.len()
    }
}

fn range_overflow() -> Error {
    Error::InvalidSize("byte range overflows".into())
}
