//! Collaborator surface consumed by the gantry command-graph layer.
//!
//! CPU-reference models of the native driver objects the graph layer
//! records against: contexts with teardown callbacks and the
//! thread-bound activation protocol, devices with capability snapshots,
//! queues, kernels with argument tables, device memory as bounds-checked
//! byte arenas behind index handles, host staging buffers, and events.

pub mod context;
pub mod device;
pub mod error;
pub mod event;
pub mod kernel;
pub mod memory;
pub mod queue;

pub use context::{ActiveContextGuard, Context, ExtendedDeleter, active_context_id};
pub use device::{Device, DeviceCaps, HintPolicy};
pub use error::{Error, Result, check_work_dim};
pub use event::Event;
pub use kernel::{Kernel, KernelArg};
pub use memory::{
    AllocId, DevicePtr, HostBuffer, MemLocation, MemObject, MemoryPool, RectOffset, RectPitches,
    RectRegion,
};
pub use queue::Queue;
