//! Queues: the submission target for executable graphs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::Context;
use crate::device::Device;
use crate::error::{Error, Result};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// An in-order execution queue bound to one (context, device) pair.
///
/// Command buffers also create one of these privately at construction for
/// back ends whose native command-buffer object must be bound to a queue
/// or stream from the start.
pub struct Queue {
    id: u64,
    context: Arc<Context>,
    device: Arc<Device>,
    submissions: AtomicU64,
}

impl Queue {
    /// Create a queue. The device must belong to the context.
    pub fn new(context: &Arc<Context>, device: &Arc<Device>) -> Result<Arc<Self>> {
        if !context.devices().iter().any(|d| d.id() == device.id()) {
            return Err(Error::InvalidValue(format!(
                "device {} does not belong to context {}",
                device.id(),
                context.id(),
            )));
        }
        Ok(Arc::new(Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            context: Arc::clone(context),
            device: Arc::clone(device),
            submissions: AtomicU64::new(0),
        }))
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Count one graph submission.
    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of graph submissions this queue has seen.
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Queue(id={}, ctx={}, dev={}, submissions={})",
            self.id,
            self.context.id(),
            self.device.id(),
            self.submission_count(),
        )
    }
}
