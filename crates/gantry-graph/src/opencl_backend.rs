//! OpenCL command-buffer mapper.
//!
//! Models the command-buffer extension family: every entry point is an
//! extension function resolved once per context through a process-wide
//! lazily-populated cache, invalidated when the context is destroyed.
//! Kernel commands on updatable buffers carry mutable-dispatch handles
//! and accept batched post-finalize updates. The native fill command
//! takes arbitrary power-of-two pattern widths, so no decomposition is
//! needed; USM and host read/write operations are not recordable at all
//! on this back end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use gantry_core::{Context, Device, DeviceCaps, Error, HintPolicy, Result};
use tracing::debug;

use crate::backend::{GraphBackend, GraphBuilder};
use crate::command_buffer::CommandBufferDesc;
use crate::node::NodeGraphBuilder;

// ── Extension function cache ───────────────────────────────────────────────

/// Entry points resolved from one context's driver.
#[derive(Debug)]
pub(crate) struct ExtFunctions {
    pub context_id: u64,
    /// The mutable-dispatch extension was found alongside the
    /// command-buffer one.
    pub mutable_dispatch: bool,
}

static EXT_CACHE: OnceLock<Mutex<HashMap<u64, Arc<ExtFunctions>>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<u64, Arc<ExtFunctions>>> {
    EXT_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve the extension table for `context`, hitting the driver only on
/// the first call per context. The entry is dropped again when the
/// context is destroyed.
pub(crate) fn ext_functions_for(context: &Arc<Context>) -> Arc<ExtFunctions> {
    let mut map = cache().lock().expect("extension cache lock");
    if let Some(functions) = map.get(&context.id()) {
        return Arc::clone(functions);
    }
    debug!(context = context.id(), "resolving command-buffer extension entry points");
    let functions =
        Arc::new(ExtFunctions { context_id: context.id(), mutable_dispatch: true });
    map.insert(context.id(), Arc::clone(&functions));
    let id = context.id();
    context.set_extended_deleter(Box::new(move || invalidate_context(id)));
    functions
}

fn invalidate_context(id: u64) {
    if let Some(cache) = EXT_CACHE.get() {
        cache.lock().expect("extension cache lock").remove(&id);
        debug!(context = id, "invalidated command-buffer extension cache entry");
    }
}

#[cfg(test)]
fn cache_contains(id: u64) -> bool {
    cache().lock().expect("extension cache lock").contains_key(&id)
}

// ── Backend ────────────────────────────────────────────────────────────────

pub struct OpenClGraphBackend;

impl OpenClGraphBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for OpenClGraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for OpenClGraphBackend {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn device_caps(&self) -> DeviceCaps {
        DeviceCaps {
            kernel_update: true,
            event_rebind: false,
            usm_ops: false,
            host_transfer: false,
            native_fill_widths: vec![1, 2, 4, 8, 16, 32, 64, 128],
            max_fill_pattern_width: 128,
            hint_policy: HintPolicy::HardFail,
        }
    }

    fn create_builder(
        &self,
        context: &Arc<Context>,
        _device: &Arc<Device>,
        desc: &CommandBufferDesc,
    ) -> Result<Box<dyn GraphBuilder>> {
        let ext = ext_functions_for(context);
        if desc.updatable && !ext.mutable_dispatch {
            return Err(Error::InvalidOperation(
                "mutable-dispatch extension not present on this context".into(),
            ));
        }
        Ok(Box::new(NodeGraphBuilder::new(self.name(), self.device_caps(), ext.mutable_dispatch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::command_buffer::{CommandBuffer, CommandBufferDesc};
    use crate::nd_range::NdRange;
    use crate::update::KernelLaunchUpdate;
    use gantry_core::{Kernel, KernelArg, Queue};

    fn setup() -> (Box<dyn GraphBackend>, Arc<Context>, Arc<Device>, Arc<Queue>) {
        let backend = BackendKind::OpenCl.create();
        let device = backend.new_device("Arc A770");
        let context = Context::new(vec![device.clone()]);
        let queue = Queue::new(&context, &device).unwrap();
        (backend, context, device, queue)
    }

    #[test]
    fn ext_cache_resolves_once_per_context() {
        let (_backend, context, _device, _queue) = setup();
        let first = ext_functions_for(&context);
        let second = ext_functions_for(&context);
        // The second lookup returns the cached table, not a fresh one.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.context_id, context.id());
    }

    #[test]
    fn ext_cache_invalidated_on_context_destruction() {
        let (_backend, context, _device, _queue) = setup();
        // Hold no other strong references to the context; the fixture
        // queue keeps one, so build a private context here.
        let device = OpenClGraphBackend::new().new_device("scrap");
        let scrap = Context::new(vec![device]);
        let id = scrap.id();
        ext_functions_for(&scrap);
        assert!(cache_contains(id));
        drop(scrap);
        assert!(!cache_contains(id));
    }

    #[test]
    fn usm_operations_hard_fail() {
        let (backend, context, device, _queue) = setup();
        let cb =
            CommandBuffer::create(&*backend, &context, &device, &CommandBufferDesc::new()).unwrap();
        let ptr = context.memory().alloc(16).unwrap();
        let err = cb.append_usm_fill(ptr, &[0xAA], 16, &[]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature { backend: "opencl", .. }));
        let err = cb.append_usm_prefetch(ptr, 16, &[]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature { backend: "opencl", .. }));
        assert_eq!(cb.node_count(), 0);
    }

    #[test]
    fn host_transfer_hard_fails() {
        let (backend, context, device, _queue) = setup();
        let cb =
            CommandBuffer::create(&*backend, &context, &device, &CommandBufferDesc::new()).unwrap();
        let mem = context.memory().alloc_buffer(16).unwrap();
        let err = cb.append_mem_write(&mem, 0, &[1, 2, 3, 4], &[]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature { backend: "opencl", .. }));
    }

    #[test]
    fn wide_fill_is_one_native_command() {
        let (backend, context, device, queue) = setup();
        let cb =
            CommandBuffer::create(&*backend, &context, &device, &CommandBufferDesc::new()).unwrap();
        let mem = context.memory().alloc_buffer(64).unwrap();
        let pattern: Vec<u8> = (0..16).collect();
        cb.append_mem_fill(&mem, 0, &pattern, 64, &[]).unwrap();
        assert_eq!(cb.node_count(), 1);
        cb.finalize().unwrap();
        cb.enqueue(&queue, &[]).unwrap();
        let expected: Vec<u8> = pattern.iter().copied().cycle().take(64).collect();
        assert_eq!(context.memory().snapshot(mem.base(), 64).unwrap(), expected);
    }

    #[test]
    fn batched_update_applies_arguments_and_range_together() {
        let (backend, context, device, queue) = setup();
        let desc = CommandBufferDesc::new().with_updatable(true);
        let cb = CommandBuffer::create(&*backend, &context, &device, &desc).unwrap();
        let kernel = Kernel::new(&context, "gemm");
        kernel.set_arg(0, KernelArg::Value(vec![0]));
        kernel.set_arg(1, KernelArg::Value(vec![1]));
        let handle = cb
            .append_kernel_launch(&kernel, &NdRange::new(2, &[32, 32]).unwrap(), &[], &[])
            .unwrap()
            .command
            .unwrap();
        cb.finalize().unwrap();
        cb.enqueue(&queue, &[]).unwrap();

        let update = KernelLaunchUpdate::new()
            .set_value_arg(0, &[9])
            .set_value_arg(1, &[8])
            .with_global_size(&[64, 64])
            .with_local_size(&[8, 8]);
        handle.update_kernel_launch(&update).unwrap();

        let snap = handle.dispatch_snapshot().unwrap();
        assert_eq!(snap.args.get(&0), Some(&KernelArg::Value(vec![9])));
        assert_eq!(snap.args.get(&1), Some(&KernelArg::Value(vec![8])));
        assert_eq!(snap.nd.global_size(), [64, 64, 1]);
        assert_eq!(snap.nd.local_size(), [8, 8, 0]);
    }

    #[test]
    fn exec_info_flags_stick_to_the_dispatch() {
        use crate::update::ExecInfoFlag;

        let (backend, context, device, _queue) = setup();
        let desc = CommandBufferDesc::new().with_updatable(true);
        let cb = CommandBuffer::create(&*backend, &context, &device, &desc).unwrap();
        let kernel = Kernel::new(&context, "scatter");
        let handle = cb
            .append_kernel_launch(&kernel, &NdRange::linear(32), &[], &[])
            .unwrap()
            .command
            .unwrap();
        cb.finalize().unwrap();

        let update = KernelLaunchUpdate::new()
            .with_exec_info(ExecInfoFlag::UsmIndirectAccess)
            .with_exec_info(ExecInfoFlag::UsmIndirectAccess);
        handle.update_kernel_launch(&update).unwrap();
        let snap = handle.dispatch_snapshot().unwrap();
        // Re-applying the same flag is idempotent.
        assert_eq!(snap.exec_infos, vec![ExecInfoFlag::UsmIndirectAccess]);
    }

    #[test]
    fn update_on_non_updatable_buffer_rejected() {
        let (backend, context, device, _queue) = setup();
        let cb =
            CommandBuffer::create(&*backend, &context, &device, &CommandBufferDesc::new()).unwrap();
        let kernel = Kernel::new(&context, "gemm");
        let appended = cb
            .append_kernel_launch(&kernel, &NdRange::linear(8), &[], &[])
            .unwrap();
        // Without updatability (and without per-node events) no handle
        // is produced at all.
        assert!(appended.command.is_none());
    }
}
