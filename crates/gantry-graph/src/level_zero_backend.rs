//! Level Zero command-list mapper.
//!
//! Models a driver whose graph is a closed command list synchronised
//! with explicit events: every recorded command carries a signal event
//! and an optional external wait list, finalize closes the list behind a
//! suffix barrier, and each enqueue resets the per-command events before
//! replaying so repeated submissions start from the non-signaled state.
//! Because synchronization primitives are bound per node, this back end
//! supports rebinding a command's wait and signal events after finalize
//! — independently of the (unsupported) kernel argument update path.
//! Prefetch and advise are real commands here, not degraded stubs.

use std::sync::{Arc, Mutex};

use gantry_core::{
    Context, Device, DeviceCaps, DevicePtr, Error, Event, HintPolicy, Kernel, MemLocation, Queue,
    Result,
};
use tracing::debug;

use crate::backend::{
    CopyRectParams, DispatchSnapshot, ExecutableGraph, GraphBackend, GraphBuilder, MemAdvice,
    NodeId,
};
use crate::command_buffer::CommandBufferDesc;
use crate::nd_range::NdRange;
use crate::node::{KernelDispatch, NodeOp, execute_op};

// ── Command list model ─────────────────────────────────────────────────────

struct ZeCommand {
    op: NodeOp,
    /// Signaled when this command completes; replaced by
    /// `update_signal_event`.
    signal: Event,
    /// Structural dependencies on earlier commands of the same list.
    dep_nodes: Vec<NodeId>,
    /// External events this command waits on before executing.
    external_waits: Vec<Event>,
}

struct ZeCommandList {
    commands: Vec<ZeCommand>,
}

impl ZeCommandList {
    fn push(&mut self, op: NodeOp, deps: &[NodeId]) -> Result<NodeId> {
        for dep in deps {
            if dep.index() >= self.commands.len() {
                return Err(Error::InvalidValue(format!(
                    "dependency on unknown command {}",
                    dep.index(),
                )));
            }
        }
        let id = NodeId(self.commands.len());
        self.commands.push(ZeCommand {
            op,
            signal: Event::new(),
            dep_nodes: deps.to_vec(),
            external_waits: Vec::new(),
        });
        Ok(id)
    }
}

// ── Builder ────────────────────────────────────────────────────────────────

pub(crate) struct LevelZeroBuilder {
    list: ZeCommandList,
}

impl LevelZeroBuilder {
    fn new() -> Self {
        Self { list: ZeCommandList { commands: Vec::new() } }
    }
}

impl GraphBuilder for LevelZeroBuilder {
    fn backend_name(&self) -> &'static str {
        "level_zero"
    }

    fn node_count(&self) -> usize {
        self.list.commands.len()
    }

    fn add_empty_node(&mut self, deps: &[NodeId]) -> Result<NodeId> {
        self.list.push(NodeOp::Empty, deps)
    }

    fn add_kernel_node(
        &mut self,
        kernel: &Arc<Kernel>,
        nd: &NdRange,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        self.list.push(NodeOp::Kernel(KernelDispatch::from_kernel(kernel, nd)), deps)
    }

    fn add_copy_node(
        &mut self,
        dst: MemLocation,
        src: MemLocation,
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        self.list.push(NodeOp::Copy { dst, src, len }, deps)
    }

    fn add_copy_rect_node(&mut self, params: CopyRectParams, deps: &[NodeId]) -> Result<NodeId> {
        self.list.push(NodeOp::CopyRect(Box::new(params)), deps)
    }

    fn add_fill_node(
        &mut self,
        dst: DevicePtr,
        pattern: &[u8],
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        // The native fill takes the whole pattern up to the device
        // maximum, already checked by the caller.
        self.list.push(NodeOp::Fill { dst, pattern: pattern.to_vec(), len }, deps)
    }

    fn add_prefetch_node(&mut self, ptr: DevicePtr, len: usize, deps: &[NodeId]) -> Result<NodeId> {
        self.list.push(NodeOp::Prefetch { ptr, len }, deps)
    }

    fn add_advise_node(
        &mut self,
        ptr: DevicePtr,
        len: usize,
        advice: MemAdvice,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        self.list.push(NodeOp::Advise { ptr, len, advice }, deps)
    }

    fn bind_wait_events(&mut self, node: NodeId, events: &[Event]) -> Result<()> {
        let command = self
            .list
            .commands
            .get_mut(node.index())
            .ok_or_else(|| Error::InvalidValue(format!("unknown command {}", node.index())))?;
        command.external_waits = events.to_vec();
        Ok(())
    }

    fn finalize(&mut self) -> Result<Arc<dyn ExecutableGraph>> {
        debug!(commands = self.list.commands.len(), "closing command list");
        Ok(Arc::new(LevelZeroExec {
            commands: Mutex::new(std::mem::take(&mut self.list.commands)),
        }))
    }
}

// ── Executable ─────────────────────────────────────────────────────────────

pub(crate) struct LevelZeroExec {
    commands: Mutex<Vec<ZeCommand>>,
}

impl ExecutableGraph for LevelZeroExec {
    fn backend_name(&self) -> &'static str {
        "level_zero"
    }

    fn node_count(&self) -> usize {
        self.commands.lock().expect("command list lock").len()
    }

    fn launch(&self, queue: &Queue) -> Result<()> {
        let mut commands = self.commands.lock().expect("command list lock");
        // Reset per-command events so this submission starts from the
        // non-signaled state.
        for command in commands.iter() {
            command.signal.reset();
        }
        let pool = queue.context().memory();
        for index in 0..commands.len() {
            for wait in commands[index].external_waits.clone() {
                wait.wait()?;
            }
            // Structural dependencies reference earlier commands only,
            // which the in-order replay has already signaled.
            debug_assert!(commands[index].dep_nodes.iter().all(|d| d.index() < index));
            execute_op(&mut commands[index].op, pool)?;
            commands[index].signal.record();
        }
        Ok(())
    }

    fn update_wait_events(&self, node: NodeId, events: &[Event]) -> Result<()> {
        let mut commands = self.commands.lock().expect("command list lock");
        let count = commands.len();
        let command = commands.get_mut(node.index()).ok_or_else(|| {
            Error::InvalidValue(format!("command {} out of range ({count} commands)", node.index()))
        })?;
        command.external_waits = events.to_vec();
        Ok(())
    }

    fn update_signal_event(&self, node: NodeId) -> Result<Event> {
        let mut commands = self.commands.lock().expect("command list lock");
        let count = commands.len();
        let command = commands.get_mut(node.index()).ok_or_else(|| {
            Error::InvalidValue(format!("command {} out of range ({count} commands)", node.index()))
        })?;
        let event = Event::new();
        command.signal = event.clone();
        Ok(event)
    }

    fn dispatch_snapshot(&self, node: NodeId) -> Option<DispatchSnapshot> {
        let commands = self.commands.lock().expect("command list lock");
        match &commands.get(node.index())?.op {
            NodeOp::Kernel(dispatch) => Some(dispatch.snapshot()),
            _ => None,
        }
    }
}

// ── Backend ────────────────────────────────────────────────────────────────

pub struct LevelZeroGraphBackend;

impl LevelZeroGraphBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for LevelZeroGraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for LevelZeroGraphBackend {
    fn name(&self) -> &'static str {
        "level_zero"
    }

    fn device_caps(&self) -> DeviceCaps {
        DeviceCaps {
            kernel_update: false,
            event_rebind: true,
            usm_ops: true,
            host_transfer: true,
            native_fill_widths: vec![1, 2, 4, 8, 16, 32, 64, 128],
            max_fill_pattern_width: 128,
            hint_policy: HintPolicy::Native,
        }
    }

    fn create_builder(
        &self,
        _context: &Arc<Context>,
        _device: &Arc<Device>,
        _desc: &CommandBufferDesc,
    ) -> Result<Box<dyn GraphBuilder>> {
        Ok(Box::new(LevelZeroBuilder::new()))
    }
}
