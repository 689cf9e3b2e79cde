//! Events: completion markers bracketing a graph launch.
//!
//! The command-graph layer is synchronous, so an event is either still
//! pending (its producer was never enqueued, or it is an internal
//! per-command event between submissions) or complete with a
//! start/end timestamp pair. Waiting on a pending event is reported as
//! caller misuse rather than blocking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct EventInner {
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

/// Shared completion marker. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Event {
    id: u64,
    inner: Arc<Mutex<EventInner>>,
}

impl Event {
    /// New pending event.
    pub fn new() -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(EventInner::default())),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Timestamp the start of the bracketed work.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("event lock");
        inner.started_at = Some(Instant::now());
    }

    /// Mark the event complete, timestamping the end of the work.
    /// Elapsed time is only available when [`Event::start`] was called
    /// too (profiling enabled on the producer).
    pub fn record(&self) {
        let mut inner = self.inner.lock().expect("event lock");
        inner.completed_at = Some(Instant::now());
    }

    /// Return the event to the pending, unsignaled state. Used by the
    /// command-list back end between submissions of the same buffer.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("event lock");
        inner.started_at = None;
        inner.completed_at = None;
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().expect("event lock").completed_at.is_some()
    }

    /// Wait for completion. Pending here can only mean the producing
    /// buffer was never enqueued, so this fails instead of blocking.
    pub fn wait(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "wait on pending event {}; its producer was never enqueued",
                self.id,
            )))
        }
    }

    /// Wall time between the start and completion timestamps.
    pub fn elapsed(&self) -> Result<Duration> {
        let inner = self.inner.lock().expect("event lock");
        match (inner.started_at, inner.completed_at) {
            (Some(start), Some(end)) => Ok(end.duration_since(start)),
            _ => Err(Error::InvalidOperation(format!("event {} has not completed", self.id))),
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_complete() { "complete" } else { "pending" };
        write!(f, "Event(id={}, {state})", self.id)
    }
}
