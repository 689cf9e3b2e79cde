//! Contexts: device set, memory pool, teardown callbacks, and the
//! thread-bound active-context protocol.
//!
//! Some native APIs are thread-bound rather than object-bound: the
//! driver call operates on whichever context is active on the calling
//! thread. [`ActiveContextGuard`] models the scope-guarded
//! activate/restore protocol such back ends need: activate on entry if
//! the desired context differs from the current one, restore on exit
//! unless no context was previously active, in which case the new one is
//! deliberately left installed to avoid switch churn.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::memory::MemoryPool;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Callback run when the owning context is destroyed. Registration is
/// thread-safe; invocation happens exactly once, on drop.
pub type ExtendedDeleter = Box<dyn FnOnce() + Send>;

/// Execution context: a device set plus the memory arena allocations
/// live in.
pub struct Context {
    id: u64,
    devices: Vec<Arc<Device>>,
    memory: MemoryPool,
    deleters: Mutex<Vec<ExtendedDeleter>>,
}

impl Context {
    pub fn new(devices: Vec<Arc<Device>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            devices,
            memory: MemoryPool::new(),
            deleters: Mutex::new(Vec::new()),
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Device at `index`, or `InvalidValue`.
    pub fn device(&self, index: usize) -> Result<Arc<Device>> {
        self.devices
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidValue(format!("no device at index {index}")))
    }

    pub const fn memory(&self) -> &MemoryPool {
        &self.memory
    }

    /// Register a teardown callback, run when the context is destroyed.
    pub fn set_extended_deleter(&self, deleter: ExtendedDeleter) {
        self.deleters.lock().expect("deleter list lock").push(deleter);
    }

    fn invoke_extended_deleters(&self) {
        let deleters = {
            let mut guard = self.deleters.lock().expect("deleter list lock");
            std::mem::take(&mut *guard)
        };
        for deleter in deleters {
            deleter();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!(context = self.id, "destroying context");
        self.invoke_extended_deleters();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

// ── Active context ─────────────────────────────────────────────────────────

thread_local! {
    static ACTIVE_CONTEXT: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Context currently active on this thread, if any.
pub fn active_context_id() -> Option<u64> {
    ACTIVE_CONTEXT.with(Cell::get)
}

/// RAII guard installing a context as the thread's active one.
#[derive(Debug)]
pub struct ActiveContextGuard {
    original: Option<u64>,
    need_to_recover: bool,
}

impl ActiveContextGuard {
    /// Activate `ctx` on the current thread.
    ///
    /// When no context was previously active the new one stays installed
    /// after the guard drops; repeated activations of the already-active
    /// context do nothing.
    pub fn activate(ctx: &Context) -> Self {
        let desired = ctx.id();
        let original = ACTIVE_CONTEXT.with(Cell::get);
        let mut need_to_recover = false;
        if original != Some(desired) {
            ACTIVE_CONTEXT.with(|a| a.set(Some(desired)));
            // An empty slot means this thread had never touched a
            // context; leaving the new one active avoids a switch on
            // every subsequent call.
            need_to_recover = original.is_some();
        }
        Self { original, need_to_recover }
    }
}

impl Drop for ActiveContextGuard {
    fn drop(&mut self) {
        if self.need_to_recover {
            ACTIVE_CONTEXT.with(|a| a.set(self.original));
        }
    }
}
