//! Kernel objects: a native function handle stand-in with an argument
//! table mutated by index.
//!
//! The command-graph layer snapshots the argument table when a launch is
//! recorded; later `set_arg` calls on the kernel do not affect already
//! recorded commands (post-finalize mutation goes through the update
//! engine instead).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::memory::{DevicePtr, MemObject};

static NEXT_KERNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One kernel argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    /// Plain value bytes, copied at set time.
    Value(Vec<u8>),
    /// A buffer object argument.
    MemObject(MemObject),
    /// A USM pointer argument.
    UsmPtr(DevicePtr),
}

/// A compiled device function with its argument index table.
pub struct Kernel {
    id: u64,
    name: String,
    context_id: u64,
    args: Mutex<BTreeMap<u32, KernelArg>>,
    local_mem_size: Mutex<usize>,
}

impl Kernel {
    pub fn new(context: &Arc<Context>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            context_id: context.id(),
            args: Mutex::new(BTreeMap::new()),
            local_mem_size: Mutex::new(0),
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the context this kernel was built against.
    pub const fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Set or replace the argument at `index`.
    pub fn set_arg(&self, index: u32, arg: KernelArg) {
        self.args.lock().expect("kernel arg lock").insert(index, arg);
    }

    /// Copy of the current argument table.
    pub fn snapshot_args(&self) -> BTreeMap<u32, KernelArg> {
        self.args.lock().expect("kernel arg lock").clone()
    }

    pub fn set_local_mem_size(&self, bytes: usize) {
        *self.local_mem_size.lock().expect("local mem lock") = bytes;
    }

    pub fn local_mem_size(&self) -> usize {
        *self.local_mem_size.lock().expect("local mem lock")
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kernel(id={}, '{}', ctx={})", self.id, self.name, self.context_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceCaps, HintPolicy};

    fn ctx() -> Arc<Context> {
        let caps = DeviceCaps {
            kernel_update: false,
            event_rebind: false,
            usm_ops: true,
            host_transfer: true,
            native_fill_widths: vec![1],
            max_fill_pattern_width: 16,
            hint_policy: HintPolicy::Inert,
        };
        Context::new(vec![Device::new("dev", caps)])
    }

    #[test]
    fn snapshot_is_detached() {
        let ctx = ctx();
        let kernel = Kernel::new(&ctx, "axpy");
        kernel.set_arg(0, KernelArg::Value(vec![1, 2, 3, 4]));
        let snap = kernel.snapshot_args();
        kernel.set_arg(0, KernelArg::Value(vec![9]));
        match snap.get(&0) {
            Some(KernelArg::Value(bytes)) => assert_eq!(bytes, &[1, 2, 3, 4]),
            other => panic!("unexpected arg: {other:?}"),
        }
    }

    #[test]
    fn args_replace_by_index() {
        let ctx = ctx();
        let kernel = Kernel::new(&ctx, "scale");
        kernel.set_arg(2, KernelArg::Value(vec![1]));
        kernel.set_arg(2, KernelArg::Value(vec![2]));
        assert_eq!(kernel.snapshot_args().len(), 1);
    }

    #[test]
    fn local_mem_roundtrip() {
        let ctx = ctx();
        let kernel = Kernel::new(&ctx, "reduce");
        assert_eq!(kernel.local_mem_size(), 0);
        kernel.set_local_mem_size(4096);
        assert_eq!(kernel.local_mem_size(), 4096);
    }
}
