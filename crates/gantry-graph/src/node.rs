//! Shared node arena for the node-graph back ends.
//!
//! cuda, hip and cpu all model a driver whose graph is an arena of typed
//! nodes with predecessor edges. Wait lists can only name sync points
//! minted earlier, so insertion order is a topological order and
//! execution walks the arena front to back.

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::{
    DevicePtr, Error, Kernel, KernelArg, MemLocation, MemoryPool, Result,
};
use tracing::debug;

use crate::backend::{CopyRectParams, DispatchSnapshot, MemAdvice, NodeId};
use crate::nd_range::NdRange;
use crate::update::{ExecInfoFlag, KernelNodeUpdate};

// ── Kernel dispatch state ──────────────────────────────────────────────────

/// Mutable state of one recorded kernel dispatch.
#[derive(Debug, Clone)]
pub(crate) struct KernelDispatch {
    pub kernel_name: String,
    pub nd: NdRange,
    pub args: BTreeMap<u32, KernelArg>,
    pub exec_infos: Vec<ExecInfoFlag>,
    pub local_mem_size: usize,
    pub launch_count: u64,
}

impl KernelDispatch {
    pub fn from_kernel(kernel: &Arc<Kernel>, nd: &NdRange) -> Self {
        Self {
            kernel_name: kernel.name().to_string(),
            nd: *nd,
            args: kernel.snapshot_args(),
            exec_infos: Vec::new(),
            local_mem_size: kernel.local_mem_size(),
            launch_count: 0,
        }
    }

    /// Apply one batched mutation.
    pub fn apply_update(&mut self, update: &KernelNodeUpdate) {
        for (index, arg) in &update.args {
            self.args.insert(*index, arg.clone());
        }
        for flag in &update.exec_infos {
            if !self.exec_infos.contains(flag) {
                self.exec_infos.push(*flag);
            }
        }
        self.nd.apply(update.global_offset, update.global_size, update.local_size);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            kernel_name: self.kernel_name.clone(),
            nd: self.nd,
            args: self.args.clone(),
            exec_infos: self.exec_infos.clone(),
            local_mem_size: self.local_mem_size,
            launch_count: self.launch_count,
        }
    }
}

// ── Node ops ───────────────────────────────────────────────────────────────

/// Operation payload of one graph node.
#[derive(Debug, Clone)]
pub(crate) enum NodeOp {
    Empty,
    Kernel(KernelDispatch),
    Copy { dst: MemLocation, src: MemLocation, len: usize },
    CopyRect(Box<CopyRectParams>),
    Fill { dst: DevicePtr, pattern: Vec<u8>, len: usize },
    FillStrided { dst: DevicePtr, elem: Vec<u8>, pitch: usize, count: usize },
    Prefetch { ptr: DevicePtr, len: usize },
    Advise { ptr: DevicePtr, len: usize, advice: MemAdvice },
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub op: NodeOp,
    pub deps: Vec<NodeId>,
}

// ── Arena ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Insert a node; dependencies must reference earlier nodes.
    pub fn add(&mut self, op: NodeOp, deps: &[NodeId]) -> Result<NodeId> {
        for dep in deps {
            if dep.index() >= self.nodes.len() {
                return Err(Error::InvalidValue(format!(
                    "dependency on unknown node {}",
                    dep.index(),
                )));
            }
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { op, deps: deps.to_vec() });
        Ok(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        let count = self.nodes.len();
        self.nodes
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidValue(format!(
                "node {} out of range (graph has {count} nodes)",
                id.index(),
            )))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Execute every node in dependency order against `pool`.
    pub fn execute(&mut self, pool: &MemoryPool) -> Result<()> {
        for node in &mut self.nodes {
            execute_op(&mut node.op, pool)?;
        }
        Ok(())
    }
}

/// Apply one node's effect to device/host memory.
pub(crate) fn execute_op(op: &mut NodeOp, pool: &MemoryPool) -> Result<()> {
    match op {
        NodeOp::Empty => Ok(()),
        NodeOp::Kernel(dispatch) => {
            if !dispatch.nd.is_zero_range() {
                dispatch.launch_count += 1;
                debug!(
                    kernel = %dispatch.kernel_name,
                    work_items = dispatch.nd.work_item_count(),
                    "dispatching kernel node"
                );
            }
            Ok(())
        }
        NodeOp::Copy { dst, src, len } => {
            let bytes = read_location(src, *len, pool)?;
            write_location(dst, &bytes, pool)
        }
        NodeOp::CopyRect(params) => execute_copy_rect(params, pool),
        NodeOp::Fill { dst, pattern, len } => pool.fill(*dst, pattern, *len),
        NodeOp::FillStrided { dst, elem, pitch, count } => {
            pool.fill_strided(*dst, elem, *pitch, *count)
        }
        NodeOp::Prefetch { ptr, len } => {
            pool.check_range(*ptr, *len)?;
            debug!(bytes = *len, "prefetch hint");
            Ok(())
        }
        NodeOp::Advise { ptr, len, advice } => {
            pool.check_range(*ptr, *len)?;
            debug!(bytes = *len, ?advice, "memory advice hint");
            Ok(())
        }
    }
}

fn read_location(src: &MemLocation, len: usize, pool: &MemoryPool) -> Result<Vec<u8>> {
    let mut bytes = vec![0; len];
    match src {
        MemLocation::Device(ptr) => pool.read(*ptr, &mut bytes)?,
        MemLocation::Host { buf, offset } => buf.read(*offset, &mut bytes)?,
    }
    Ok(bytes)
}

fn write_location(dst: &MemLocation, bytes: &[u8], pool: &MemoryPool) -> Result<()> {
    match dst {
        MemLocation::Device(ptr) => pool.write(*ptr, bytes),
        MemLocation::Host { buf, offset } => buf.write(*offset, bytes),
    }
}

fn execute_copy_rect(params: &CopyRectParams, pool: &MemoryPool) -> Result<()> {
    let region = params.region;
    let src_pitches = params.src_pitches.resolve(&region);
    let dst_pitches = params.dst_pitches.resolve(&region);
    for z in 0..region.depth {
        for y in 0..region.height {
            let src_off = src_pitches.linearize(&params.src_origin, 0, y, z);
            let dst_off = dst_pitches.linearize(&params.dst_origin, 0, y, z);
            let row = read_location(&params.src.offset_by(src_off), region.width, pool)?;
            write_location(&params.dst.offset_by(dst_off), &row, pool)?;
        }
    }
    Ok(())
}

// ── Node-graph builder / executable ────────────────────────────────────────

/// Builder-phase graph for back ends modeling a node-graph driver.
pub(crate) struct NodeGraphBuilder {
    backend: &'static str,
    caps: gantry_core::DeviceCaps,
    kernel_update: bool,
    arena: NodeArena,
}

impl NodeGraphBuilder {
    pub fn new(
        backend: &'static str,
        caps: gantry_core::DeviceCaps,
        kernel_update: bool,
    ) -> Self {
        Self { backend, caps, kernel_update, arena: NodeArena::default() }
    }
}

impl crate::backend::GraphBuilder for NodeGraphBuilder {
    fn backend_name(&self) -> &'static str {
        self.backend
    }

    fn node_count(&self) -> usize {
        self.arena.len()
    }

    fn add_empty_node(&mut self, deps: &[NodeId]) -> Result<NodeId> {
        self.arena.add(NodeOp::Empty, deps)
    }

    fn add_kernel_node(
        &mut self,
        kernel: &Arc<Kernel>,
        nd: &NdRange,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        if nd.is_zero_range() {
            // Zero work items dispatch nothing; an empty node keeps the
            // dependency edges intact.
            debug!(backend = self.backend, kernel = kernel.name(), "zero-range launch, inserting empty node");
            return self.arena.add(NodeOp::Empty, deps);
        }
        self.arena.add(NodeOp::Kernel(KernelDispatch::from_kernel(kernel, nd)), deps)
    }

    fn add_copy_node(
        &mut self,
        dst: MemLocation,
        src: MemLocation,
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        self.arena.add(NodeOp::Copy { dst, src, len }, deps)
    }

    fn add_copy_rect_node(&mut self, params: CopyRectParams, deps: &[NodeId]) -> Result<NodeId> {
        self.arena.add(NodeOp::CopyRect(Box::new(params)), deps)
    }

    fn add_fill_node(
        &mut self,
        dst: DevicePtr,
        pattern: &[u8],
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        let steps = crate::fill::plan_fill_steps(pattern, len, &self.caps.native_fill_widths);
        // Each step orders after every earlier step of the same fill; the
        // caller binds its sync point to the node returned, i.e. the last
        // of the chain.
        let mut chain = deps.to_vec();
        let mut last = None;
        for step in steps {
            let node = self.arena.add(
                NodeOp::FillStrided {
                    dst: dst.offset_by(step.offset),
                    elem: step.elem,
                    pitch: step.pitch,
                    count: step.count,
                },
                &chain,
            )?;
            chain.push(node);
            last = Some(node);
        }
        last.ok_or_else(|| Error::adapter(self.backend, "fill decomposition produced no nodes"))
    }

    fn finalize(&mut self) -> Result<Arc<dyn crate::backend::ExecutableGraph>> {
        debug!(backend = self.backend, nodes = self.arena.len(), "instantiating node graph");
        Ok(Arc::new(NodeGraphExec {
            backend: self.backend,
            kernel_update: self.kernel_update,
            nodes: std::sync::Mutex::new(std::mem::take(&mut self.arena)),
        }))
    }
}

/// Launch-phase graph shared by concurrent enqueues. Node state is
/// guarded so a racing update and launch stay well-defined.
pub(crate) struct NodeGraphExec {
    backend: &'static str,
    kernel_update: bool,
    nodes: std::sync::Mutex<NodeArena>,
}

impl crate::backend::ExecutableGraph for NodeGraphExec {
    fn backend_name(&self) -> &'static str {
        self.backend
    }

    fn node_count(&self) -> usize {
        self.nodes.lock().expect("node graph lock").len()
    }

    fn launch(&self, queue: &gantry_core::Queue) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("node graph lock");
        nodes.execute(queue.context().memory())
    }

    fn update_kernel(&self, node: NodeId, update: &KernelNodeUpdate) -> Result<()> {
        if !self.kernel_update {
            return Err(Error::unsupported(self.backend, "kernel command update"));
        }
        let mut nodes = self.nodes.lock().expect("node graph lock");
        match &mut nodes.node_mut(node)?.op {
            NodeOp::Kernel(dispatch) => {
                dispatch.apply_update(update);
                Ok(())
            }
            _ => Err(Error::InvalidValue(format!(
                "node {} is not a kernel dispatch",
                node.index(),
            ))),
        }
    }

    fn dispatch_snapshot(&self, node: NodeId) -> Option<DispatchSnapshot> {
        let nodes = self.nodes.lock().expect("node graph lock");
        match &nodes.node(node)?.op {
            NodeOp::Kernel(dispatch) => Some(dispatch.snapshot()),
            _ => None,
        }
    }
}
