//! The capability-set interface between the command-buffer layer and its
//! per-vendor graph mappers.
//!
//! A back end is selected once, at configuration time, through
//! [`BackendKind::create`]; from there every abstract append operation
//! dispatches through [`GraphBuilder`], and every post-finalize operation
//! through [`ExecutableGraph`]. Node identity crossing this seam is the
//! arena index [`NodeId`], never a native handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gantry_core::{
    Context, Device, DeviceCaps, DevicePtr, Error, Event, Kernel, KernelArg, MemLocation, Queue,
    RectOffset, RectPitches, RectRegion, Result,
};
use serde::{Deserialize, Serialize};

use crate::command_buffer::CommandBufferDesc;
use crate::nd_range::NdRange;
use crate::update::KernelNodeUpdate;

// ── Node identity ──────────────────────────────────────────────────────────

/// Index of one native node inside its builder's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub const fn index(&self) -> usize {
        self.0
    }
}

// ── Selection ──────────────────────────────────────────────────────────────

/// Back ends a command buffer can be mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Cuda,
    Hip,
    OpenCl,
    LevelZero,
    Cpu,
}

impl BackendKind {
    /// Instantiate the mapper for this back end.
    pub fn create(self) -> Box<dyn GraphBackend> {
        match self {
            Self::Cuda => Box::new(crate::cuda_backend::CudaGraphBackend::new()),
            Self::Hip => Box::new(crate::hip_backend::HipGraphBackend::new()),
            Self::OpenCl => Box::new(crate::opencl_backend::OpenClGraphBackend::new()),
            Self::LevelZero => Box::new(crate::level_zero_backend::LevelZeroGraphBackend::new()),
            Self::Cpu => Box::new(crate::cpu_backend::CpuGraphBackend::new()),
        }
    }

    /// All selectable back ends.
    pub const fn all() -> [Self; 5] {
        [Self::Cuda, Self::Hip, Self::OpenCl, Self::LevelZero, Self::Cpu]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Hip => write!(f, "hip"),
            Self::OpenCl => write!(f, "opencl"),
            Self::LevelZero => write!(f, "level_zero"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

// ── Payload types ──────────────────────────────────────────────────────────

/// Memory advice hints recordable through `append_usm_advise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemAdvice {
    SetReadMostly,
    ClearReadMostly,
    SetPreferredLocation,
    ClearPreferredLocation,
    BiasCached,
    BiasUncached,
}

/// Fully resolved geometry of a rectangular copy.
#[derive(Debug, Clone)]
pub struct CopyRectParams {
    pub dst: MemLocation,
    pub src: MemLocation,
    pub dst_origin: RectOffset,
    pub src_origin: RectOffset,
    pub region: RectRegion,
    pub dst_pitches: RectPitches,
    pub src_pitches: RectPitches,
}

/// Introspection view of one recorded kernel dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSnapshot {
    pub kernel_name: String,
    pub nd: NdRange,
    pub args: BTreeMap<u32, KernelArg>,
    pub exec_infos: Vec<crate::update::ExecInfoFlag>,
    pub local_mem_size: usize,
    /// Times this dispatch has executed across enqueues.
    pub launch_count: u64,
}

// ── Traits ─────────────────────────────────────────────────────────────────

/// One per-vendor mapper, instantiated at configuration time.
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capability set devices on this back end report.
    fn device_caps(&self) -> DeviceCaps;

    /// A device carrying this back end's capabilities.
    fn new_device(&self, name: &str) -> Arc<Device> {
        Device::new(name, self.device_caps())
    }

    /// Allocate the builder-phase native graph for one command buffer.
    fn create_builder(
        &self,
        context: &Arc<Context>,
        device: &Arc<Device>,
        desc: &CommandBufferDesc,
    ) -> Result<Box<dyn GraphBuilder>>;
}

/// Builder-phase native graph, exclusively owned by its command buffer
/// while recording. Dependencies passed to the `add_*` methods always
/// reference nodes inserted earlier.
pub trait GraphBuilder: Send {
    fn backend_name(&self) -> &'static str;

    fn node_count(&self) -> usize;

    /// Inert pass-through node carrying only dependency edges.
    fn add_empty_node(&mut self, deps: &[NodeId]) -> Result<NodeId>;

    fn add_kernel_node(
        &mut self,
        kernel: &Arc<Kernel>,
        nd: &NdRange,
        deps: &[NodeId],
    ) -> Result<NodeId>;

    fn add_copy_node(
        &mut self,
        dst: MemLocation,
        src: MemLocation,
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId>;

    fn add_copy_rect_node(&mut self, params: CopyRectParams, deps: &[NodeId]) -> Result<NodeId>;

    /// Insert the node (or node chain) implementing a pattern fill; the
    /// returned id is the last node of the chain.
    fn add_fill_node(
        &mut self,
        dst: DevicePtr,
        pattern: &[u8],
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId>;

    fn add_prefetch_node(
        &mut self,
        ptr: DevicePtr,
        len: usize,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        let _ = (ptr, len, deps);
        Err(Error::unsupported(self.backend_name(), "usm prefetch node"))
    }

    fn add_advise_node(
        &mut self,
        ptr: DevicePtr,
        len: usize,
        advice: MemAdvice,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        let _ = (ptr, len, advice, deps);
        Err(Error::unsupported(self.backend_name(), "usm advise node"))
    }

    /// Bind external wait events to a node, for back ends whose nodes
    /// carry explicit synchronization primitives.
    fn bind_wait_events(&mut self, node: NodeId, events: &[Event]) -> Result<()> {
        let _ = (node, events);
        Err(Error::unsupported(self.backend_name(), "per-node wait events"))
    }

    /// Compile the recording into its immutable executable form. Called
    /// at most once; on failure the builder is left intact.
    fn finalize(&mut self) -> Result<Arc<dyn ExecutableGraph>>;
}

/// Launch-phase native graph. Shared by concurrent enqueues; mutation
/// entry points guard their own state.
pub trait ExecutableGraph: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn node_count(&self) -> usize;

    /// Execute the graph against the queue's context.
    fn launch(&self, queue: &Queue) -> Result<()>;

    /// Apply one batched mutation to a recorded kernel dispatch.
    fn update_kernel(&self, node: NodeId, update: &KernelNodeUpdate) -> Result<()> {
        let _ = (node, update);
        Err(Error::unsupported(self.backend_name(), "kernel command update"))
    }

    /// Replace the external wait events of a recorded command.
    fn update_wait_events(&self, node: NodeId, events: &[Event]) -> Result<()> {
        let _ = (node, events);
        Err(Error::unsupported(self.backend_name(), "wait event rebinding"))
    }

    /// Mint and bind a fresh signal event for a recorded command.
    fn update_signal_event(&self, node: NodeId) -> Result<Event> {
        let _ = node;
        Err(Error::unsupported(self.backend_name(), "signal event rebinding"))
    }

    /// Introspect a recorded kernel dispatch, if `node` is one.
    fn dispatch_snapshot(&self, node: NodeId) -> Option<DispatchSnapshot> {
        let _ = node;
        None
    }
}
