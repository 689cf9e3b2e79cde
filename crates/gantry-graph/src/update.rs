//! The update engine: sparse post-finalize mutation of recorded kernel
//! dispatches.
//!
//! Callers stage any mix of argument and ND-range changes into a
//! [`KernelLaunchUpdate`], which the command handle resolves against the
//! recorded dimensionality and hands to the back end as one batched
//! [`KernelNodeUpdate`] — one native mutate call per update request.

use gantry_core::{DevicePtr, Error, KernelArg, MemObject, Result};
use serde::{Deserialize, Serialize};

/// Execution-info flags a kernel command can be switched to after
/// finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecInfoFlag {
    /// The kernel may dereference USM pointers it was not passed as
    /// arguments.
    UsmIndirectAccess,
    /// An explicit USM pointer set accompanies the dispatch.
    UsmPointers,
    /// Preferred cache configuration hint.
    CacheConfig,
}

/// Sparse mutation request against one recorded kernel launch.
#[derive(Debug, Clone, Default)]
pub struct KernelLaunchUpdate {
    args: Vec<(u32, KernelArg)>,
    exec_infos: Vec<ExecInfoFlag>,
    work_dim: Option<u32>,
    global_offset: Option<Vec<usize>>,
    global_size: Option<Vec<usize>>,
    local_size: Option<Vec<usize>>,
}

impl KernelLaunchUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a plain-value argument.
    #[must_use]
    pub fn set_value_arg(mut self, index: u32, bytes: &[u8]) -> Self {
        self.args.push((index, KernelArg::Value(bytes.to_vec())));
        self
    }

    /// Replace a memory-object argument.
    #[must_use]
    pub fn set_mem_object_arg(mut self, index: u32, mem: MemObject) -> Self {
        self.args.push((index, KernelArg::MemObject(mem)));
        self
    }

    /// Replace a USM pointer argument.
    #[must_use]
    pub fn set_pointer_arg(mut self, index: u32, ptr: DevicePtr) -> Self {
        self.args.push((index, KernelArg::UsmPtr(ptr)));
        self
    }

    /// Switch on an execution-info flag.
    #[must_use]
    pub fn with_exec_info(mut self, flag: ExecInfoFlag) -> Self {
        self.exec_infos.push(flag);
        self
    }

    /// Request a (necessarily unchanged) work dimensionality. A value
    /// differing from the recorded one is rejected at resolution.
    #[must_use]
    pub fn with_work_dim(mut self, dim: u32) -> Self {
        self.work_dim = Some(dim);
        self
    }

    #[must_use]
    pub fn with_global_offset(mut self, offset: &[usize]) -> Self {
        self.global_offset = Some(offset.to_vec());
        self
    }

    #[must_use]
    pub fn with_global_size(mut self, global: &[usize]) -> Self {
        self.global_size = Some(global.to_vec());
        self
    }

    #[must_use]
    pub fn with_local_size(mut self, local: &[usize]) -> Self {
        self.local_size = Some(local.to_vec());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
            && self.exec_infos.is_empty()
            && self.global_offset.is_none()
            && self.global_size.is_none()
            && self.local_size.is_none()
    }

    /// Validate against the recorded dimensionality and produce the
    /// batched form the back end consumes.
    pub(crate) fn resolve(
        &self,
        recorded_dim: u32,
        backend: &'static str,
    ) -> Result<KernelNodeUpdate> {
        if let Some(dim) = self.work_dim {
            if dim != recorded_dim {
                return Err(Error::unsupported(
                    backend,
                    format!(
                        "changing work dimensionality of a recorded command ({recorded_dim} -> {dim})",
                    ),
                ));
            }
        }
        Ok(KernelNodeUpdate {
            args: self.args.clone(),
            exec_infos: self.exec_infos.clone(),
            global_offset: pad_geometry(self.global_offset.as_deref(), recorded_dim, 0)?,
            global_size: pad_geometry(self.global_size.as_deref(), recorded_dim, 1)?,
            local_size: pad_geometry(self.local_size.as_deref(), recorded_dim, 0)?,
        })
    }
}

/// Fully resolved, dimension-checked mutation applied by a back end in
/// one call.
#[derive(Debug, Clone)]
pub struct KernelNodeUpdate {
    pub args: Vec<(u32, KernelArg)>,
    pub exec_infos: Vec<ExecInfoFlag>,
    pub global_offset: Option<[usize; 3]>,
    pub global_size: Option<[usize; 3]>,
    pub local_size: Option<[usize; 3]>,
}

fn pad_geometry(values: Option<&[usize]>, dim: u32, pad: usize) -> Result<Option<[usize; 3]>> {
    let Some(values) = values else {
        return Ok(None);
    };
    if values.len() != dim as usize {
        return Err(Error::InvalidValue(format!(
            "geometry has {} entries for work dimension {dim}",
            values.len(),
        )));
    }
    let mut out = [pad; 3];
    out[..values.len()].copy_from_slice(values);
    Ok(Some(out))
}
