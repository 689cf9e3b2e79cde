//! Explicit command-buffer / command-graph subsystem.
//!
//! Record kernel launches, copies, fills and USM operations with
//! explicit dependency edges into a [`CommandBuffer`], finalize it into
//! an immutable executable graph, and enqueue it repeatedly with low
//! per-submission overhead. Back ends able to do so additionally allow
//! mutating recorded commands — arguments, ND-range, wait/signal events
//! — through [`CommandHandle`]s, without re-recording the graph.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`backend`] | `GraphBackend`/`GraphBuilder`/`ExecutableGraph` seam, backend selection |
//! | [`command_buffer`] | Aggregate root: recording, finalize, enqueue |
//! | [`command`] | Handles to recorded commands, update entry points |
//! | [`sync_point`] | Opaque dependency tokens and their registry |
//! | [`update`] | Sparse kernel-launch mutation descriptors |
//! | [`fill`] | Fill-pattern decomposition planning |
//! | [`nd_range`] | Kernel dispatch geometry |
//! | `*_backend` | One mapper per vendor: cuda, hip, opencl, level_zero, cpu |

pub mod backend;
pub mod command;
pub mod command_buffer;
pub mod cpu_backend;
pub mod cuda_backend;
pub mod fill;
pub mod hip_backend;
pub mod level_zero_backend;
pub mod nd_range;
pub mod opencl_backend;
pub mod sync_point;
pub mod update;

mod node;

pub use backend::{
    BackendKind, CopyRectParams, DispatchSnapshot, ExecutableGraph, GraphBackend, GraphBuilder,
    MemAdvice, NodeId,
};
pub use command::{CommandHandle, CommandInfo, CommandKind};
pub use command_buffer::{Appended, CommandBuffer, CommandBufferDesc, CommandBufferInfo};
pub use fill::{FillStep, plan_fill_steps};
pub use nd_range::NdRange;
pub use sync_point::SyncPoint;
pub use update::{ExecInfoFlag, KernelLaunchUpdate, KernelNodeUpdate};
