//! Command handles: mutable references to one recorded operation.
//!
//! A handle holds a strong reference to its parent buffer, so the buffer
//! (and its native graph) outlives every live handle; the buffer itself
//! only tracks its handles weakly. The recorded work dimensionality is
//! fixed at append time and can never be changed by an update.

use std::fmt;
use std::sync::Arc;

use gantry_core::{Error, Event, Result};

use crate::backend::{DispatchSnapshot, NodeId};
use crate::command_buffer::CommandBuffer;
use crate::update::KernelLaunchUpdate;

/// Kind of operation a command handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    KernelLaunch,
    MemCopy,
    MemCopyRect,
    MemFill,
    MemRead,
    MemWrite,
    MemReadRect,
    MemWriteRect,
    UsmMemcpy,
    UsmFill,
    UsmPrefetch,
    UsmAdvise,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KernelLaunch => "kernel launch",
            Self::MemCopy => "mem copy",
            Self::MemCopyRect => "mem copy rect",
            Self::MemFill => "mem fill",
            Self::MemRead => "mem read",
            Self::MemWrite => "mem write",
            Self::MemReadRect => "mem read rect",
            Self::MemWriteRect => "mem write rect",
            Self::UsmMemcpy => "usm memcpy",
            Self::UsmFill => "usm fill",
            Self::UsmPrefetch => "usm prefetch",
            Self::UsmAdvise => "usm advise",
        };
        write!(f, "{name}")
    }
}

/// Queryable properties of a command handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandInfo {
    ReferenceCount,
    WorkDim,
}

#[derive(Debug)]
pub(crate) struct CommandRecord {
    pub buffer: Arc<CommandBuffer>,
    pub node: NodeId,
    pub kind: CommandKind,
    pub work_dim: u32,
}

/// Handle to one recorded command. Clones alias the same command.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    inner: Arc<CommandRecord>,
}

impl CommandHandle {
    pub(crate) fn new(record: CommandRecord) -> Self {
        Self { inner: Arc::new(record) }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<CommandRecord> {
        Arc::downgrade(&self.inner)
    }

    pub fn kind(&self) -> CommandKind {
        self.inner.kind
    }

    /// Dimensionality recorded at append time.
    pub fn work_dim(&self) -> u32 {
        self.inner.work_dim
    }

    pub fn buffer(&self) -> &Arc<CommandBuffer> {
        &self.inner.buffer
    }

    /// Number of live aliases of this handle.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn info(&self, prop: CommandInfo) -> u64 {
        match prop {
            CommandInfo::ReferenceCount => self.reference_count() as u64,
            CommandInfo::WorkDim => u64::from(self.inner.work_dim),
        }
    }

    /// Apply a batched argument/ND-range mutation to the live executable
    /// graph. Requires an updatable, finalized parent and a kernel-launch
    /// command; the recorded work dimensionality cannot change.
    pub fn update_kernel_launch(&self, update: &KernelLaunchUpdate) -> Result<()> {
        let record = &*self.inner;
        if record.kind != CommandKind::KernelLaunch {
            return Err(Error::InvalidOperation(format!(
                "kernel launch update on a {} command",
                record.kind,
            )));
        }
        if !record.buffer.is_updatable() {
            return Err(Error::InvalidOperation(
                "command buffer was not created updatable".into(),
            ));
        }
        let backend = record.buffer.backend_name();
        if !record.buffer.device().caps().kernel_update {
            return Err(Error::unsupported(backend, "kernel command update"));
        }
        let exec = record.buffer.executable()?;
        let resolved = update.resolve(record.work_dim, backend)?;
        exec.update_kernel(record.node, &resolved)
    }

    /// Rebind the command's external wait events on the live executable
    /// graph. Independent of the argument-update path; gated only on the
    /// back end binding explicit per-node synchronization.
    pub fn update_wait_events(&self, events: &[Event]) -> Result<()> {
        let record = &*self.inner;
        if !record.buffer.device().caps().event_rebind {
            return Err(Error::unsupported(
                record.buffer.backend_name(),
                "wait event rebinding",
            ));
        }
        let exec = record.buffer.executable()?;
        exec.update_wait_events(record.node, events)
    }

    /// Mint a fresh signal event for the command, replacing the one
    /// bound at record time. The returned event completes on each
    /// subsequent enqueue of the parent buffer.
    pub fn update_signal_event(&self) -> Result<Event> {
        let record = &*self.inner;
        if !record.buffer.device().caps().event_rebind {
            return Err(Error::unsupported(
                record.buffer.backend_name(),
                "signal event rebinding",
            ));
        }
        let exec = record.buffer.executable()?;
        exec.update_signal_event(record.node)
    }

    /// Introspect the recorded dispatch, if this is a kernel command on
    /// a finalized buffer.
    pub fn dispatch_snapshot(&self) -> Option<DispatchSnapshot> {
        let exec = self.inner.buffer.executable().ok()?;
        exec.dispatch_snapshot(self.inner.node)
    }
}
