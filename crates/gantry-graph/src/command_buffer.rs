//! Command buffers: the recorded, finalizable, repeatedly enqueueable
//! graph of device operations.
//!
//! A buffer starts in the recording phase, where append calls insert
//! native nodes with explicit dependency edges resolved from sync
//! points. `finalize` compiles the recording into an immutable
//! executable graph exactly once; from then on the buffer can be
//! enqueued any number of times, concurrently, and — when created
//! updatable on a capable back end — mutated through its command
//! handles without re-recording.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use gantry_core::{
    ActiveContextGuard, Context, Device, DevicePtr, Error, Event, HintPolicy, HostBuffer, Kernel,
    MemLocation, MemObject, Queue, RectOffset, RectPitches, RectRegion, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{
    CopyRectParams, ExecutableGraph, GraphBackend, GraphBuilder, MemAdvice, NodeId,
};
use crate::command::{CommandHandle, CommandKind, CommandRecord};
use crate::nd_range::NdRange;
use crate::sync_point::{SyncPoint, SyncPointRegistry};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

// ── Descriptor ─────────────────────────────────────────────────────────────

/// Creation-time configuration of a command buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBufferDesc {
    /// Allow post-finalize mutation of recorded kernel commands. The
    /// device must report kernel-update support.
    pub updatable: bool,
    /// Timestamp enqueue events so callers can read elapsed time.
    pub enable_profiling: bool,
}

impl CommandBufferDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder – request update support.
    #[must_use]
    pub const fn with_updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    /// Builder – toggle profiling timestamps.
    #[must_use]
    pub const fn with_profiling(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }
}

/// Queryable properties of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferInfo {
    ReferenceCount,
    NodeCount,
    CommandCount,
}

/// Result of one append call: the minted sync point, plus a command
/// handle when the operation is update-capable on this back end.
#[derive(Debug, Clone)]
pub struct Appended {
    pub sync_point: SyncPoint,
    pub command: Option<CommandHandle>,
}

// ── State ──────────────────────────────────────────────────────────────────

enum Phase {
    Recording(Box<dyn GraphBuilder>),
    Finalized(Arc<dyn ExecutableGraph>),
}

struct BufferState {
    phase: Phase,
    sync_points: SyncPointRegistry,
    commands: Vec<Weak<CommandRecord>>,
}

fn recording(phase: &mut Phase) -> Result<&mut Box<dyn GraphBuilder>> {
    match phase {
        Phase::Recording(builder) => Ok(builder),
        Phase::Finalized(_) => {
            Err(Error::InvalidOperation("append to a finalized command buffer".into()))
        }
    }
}

// ── Command buffer ─────────────────────────────────────────────────────────

/// The aggregate root: native graph, sync-point registry, command
/// handles and lifecycle flags.
pub struct CommandBuffer {
    id: u64,
    backend_name: &'static str,
    context: Arc<Context>,
    device: Arc<Device>,
    desc: CommandBufferDesc,
    /// Helper queue bound at creation for back ends that require a
    /// stream binding before recording starts.
    internal_queue: Arc<Queue>,
    /// Back-pointer to the owning `Arc`, needed to hand strong parent
    /// references to command handles.
    self_weak: Weak<CommandBuffer>,
    state: Mutex<BufferState>,
}

impl CommandBuffer {
    /// Create a buffer recording against `device` in `context`.
    ///
    /// Fails with `InvalidOperation` when update support is requested
    /// but the device does not report it.
    pub fn create(
        backend: &dyn GraphBackend,
        context: &Arc<Context>,
        device: &Arc<Device>,
        desc: &CommandBufferDesc,
    ) -> Result<Arc<Self>> {
        if desc.updatable && !device.supports_kernel_update() {
            return Err(Error::InvalidOperation(format!(
                "device '{}' does not support command-buffer update",
                device.name(),
            )));
        }
        let internal_queue = Queue::new(context, device)?;
        let builder = backend.create_builder(context, device, desc)?;
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        debug!(buffer = id, backend = backend.name(), updatable = desc.updatable, "created command buffer");
        Ok(Arc::new_cyclic(|self_weak| Self {
            id,
            backend_name: backend.name(),
            context: Arc::clone(context),
            device: Arc::clone(device),
            desc: *desc,
            internal_queue,
            self_weak: self_weak.clone(),
            state: Mutex::new(BufferState {
                phase: Phase::Recording(builder),
                sync_points: SyncPointRegistry::new(id),
                commands: Vec::new(),
            }),
        }))
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub const fn internal_queue(&self) -> &Arc<Queue> {
        &self.internal_queue
    }

    pub fn is_updatable(&self) -> bool {
        self.desc.updatable
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.lock().phase, Phase::Finalized(_))
    }

    /// Nodes inserted so far (a fill may insert several per append).
    pub fn node_count(&self) -> usize {
        let state = self.lock();
        match &state.phase {
            Phase::Recording(builder) => builder.node_count(),
            Phase::Finalized(exec) => exec.node_count(),
        }
    }

    /// Sync points minted so far.
    pub fn sync_point_count(&self) -> usize {
        self.lock().sync_points.len()
    }

    /// Live command handles registered on this buffer.
    pub fn command_count(&self) -> usize {
        self.lock().commands.iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn info(&self, prop: CommandBufferInfo) -> u64 {
        match prop {
            CommandBufferInfo::ReferenceCount => self.reference_count() as u64,
            CommandBufferInfo::NodeCount => self.node_count() as u64,
            CommandBufferInfo::CommandCount => self.command_count() as u64,
        }
    }

    /// Live strong references: caller clones plus command handles.
    pub fn reference_count(&self) -> usize {
        Weak::strong_count(&self.self_weak)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().expect("command buffer state lock")
    }

    pub(crate) fn executable(&self) -> Result<Arc<dyn ExecutableGraph>> {
        match &self.lock().phase {
            Phase::Finalized(exec) => Ok(Arc::clone(exec)),
            Phase::Recording(_) => {
                Err(Error::InvalidOperation("command buffer is not finalized".into()))
            }
        }
    }

    // ── Append operations ──────────────────────────────────────────────

    /// Record a kernel launch. Snapshots the kernel's current argument
    /// table; later `set_arg` calls do not affect the recording.
    pub fn append_kernel_launch(
        &self,
        kernel: &Arc<Kernel>,
        nd: &NdRange,
        waits: &[SyncPoint],
        wait_events: &[Event],
    ) -> Result<Appended> {
        nd.validate()?;
        if kernel.context_id() != self.context.id() {
            return Err(Error::InvalidValue(format!(
                "kernel '{}' belongs to another context",
                kernel.name(),
            )));
        }
        self.check_external_waits(wait_events)?;

        let mut guard = self.lock();
        let state = &mut *guard;
        let builder = recording(&mut state.phase)?;
        let deps = state.sync_points.resolve(waits)?;
        let node = builder.add_kernel_node(kernel, nd, &deps)?;
        if !wait_events.is_empty() {
            builder.bind_wait_events(node, wait_events)?;
        }
        let sync_point = state.sync_points.mint(node);
        let command = self.register_command(state, node, CommandKind::KernelLaunch, nd.work_dim());
        Ok(Appended { sync_point, command })
    }

    /// Record a device-to-device buffer copy.
    pub fn append_mem_copy(
        &self,
        src: &MemObject,
        src_offset: usize,
        dst: &MemObject,
        dst_offset: usize,
        len: usize,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        let src_ptr = src.ptr_with_offset(src_offset, len)?;
        let dst_ptr = dst.ptr_with_offset(dst_offset, len)?;
        self.append_copy(
            MemLocation::Device(dst_ptr),
            MemLocation::Device(src_ptr),
            len,
            waits,
            CommandKind::MemCopy,
        )
    }

    /// Record a rectangular device-to-device copy.
    #[allow(clippy::too_many_arguments)]
    pub fn append_mem_copy_rect(
        &self,
        src: &MemObject,
        src_origin: RectOffset,
        src_pitches: RectPitches,
        dst: &MemObject,
        dst_origin: RectOffset,
        dst_pitches: RectPitches,
        region: RectRegion,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        let src_span = rect_span(&src_origin, &region, &src_pitches)?;
        let dst_span = rect_span(&dst_origin, &region, &dst_pitches)?;
        let src_base = src.ptr_with_offset(0, src_span)?;
        let dst_base = dst.ptr_with_offset(0, dst_span)?;
        let params = CopyRectParams {
            dst: MemLocation::Device(dst_base),
            src: MemLocation::Device(src_base),
            dst_origin,
            src_origin,
            region,
            dst_pitches,
            src_pitches,
        };
        self.append_copy_rect(params, waits, CommandKind::MemCopyRect)
    }

    /// Record a pattern fill over a buffer range.
    pub fn append_mem_fill(
        &self,
        dst: &MemObject,
        offset: usize,
        pattern: &[u8],
        len: usize,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_fill_pattern(pattern)?;
        let width = pattern.len();
        if offset % width != 0 || len % width != 0 {
            return Err(Error::InvalidSize(format!(
                "fill offset {offset} and size {len} must be multiples of the pattern width {width}",
            )));
        }
        let dst_ptr = dst.ptr_with_offset(offset, len)?;
        self.append_fill(dst_ptr, pattern, len, waits, CommandKind::MemFill)
    }

    /// Record a buffer-to-host read into shared staging storage.
    pub fn append_mem_read(
        &self,
        src: &MemObject,
        src_offset: usize,
        dst: &HostBuffer,
        dst_offset: usize,
        len: usize,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_host_transfer()?;
        let src_ptr = src.ptr_with_offset(src_offset, len)?;
        check_host_range(dst, dst_offset, len)?;
        self.append_copy(
            MemLocation::Host { buf: dst.clone(), offset: dst_offset },
            MemLocation::Device(src_ptr),
            len,
            waits,
            CommandKind::MemRead,
        )
    }

    /// Record a host-to-buffer write. `data` is snapshotted now, at
    /// record time.
    pub fn append_mem_write(
        &self,
        dst: &MemObject,
        dst_offset: usize,
        data: &[u8],
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_host_transfer()?;
        let dst_ptr = dst.ptr_with_offset(dst_offset, data.len())?;
        self.append_copy(
            MemLocation::Device(dst_ptr),
            MemLocation::Host { buf: HostBuffer::from_bytes(data), offset: 0 },
            data.len(),
            waits,
            CommandKind::MemWrite,
        )
    }

    /// Record a rectangular buffer-to-host read.
    #[allow(clippy::too_many_arguments)]
    pub fn append_mem_read_rect(
        &self,
        src: &MemObject,
        buffer_origin: RectOffset,
        buffer_pitches: RectPitches,
        dst: &HostBuffer,
        host_origin: RectOffset,
        host_pitches: RectPitches,
        region: RectRegion,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_host_transfer()?;
        let src_span = rect_span(&buffer_origin, &region, &buffer_pitches)?;
        let dst_span = rect_span(&host_origin, &region, &host_pitches)?;
        let src_base = src.ptr_with_offset(0, src_span)?;
        check_host_range(dst, 0, dst_span)?;
        let params = CopyRectParams {
            dst: MemLocation::Host { buf: dst.clone(), offset: 0 },
            src: MemLocation::Device(src_base),
            dst_origin: host_origin,
            src_origin: buffer_origin,
            region,
            dst_pitches: host_pitches,
            src_pitches: buffer_pitches,
        };
        self.append_copy_rect(params, waits, CommandKind::MemReadRect)
    }

    /// Record a rectangular host-to-buffer write; `data` is snapshotted
    /// at record time.
    #[allow(clippy::too_many_arguments)]
    pub fn append_mem_write_rect(
        &self,
        dst: &MemObject,
        buffer_origin: RectOffset,
        buffer_pitches: RectPitches,
        data: &[u8],
        host_origin: RectOffset,
        host_pitches: RectPitches,
        region: RectRegion,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_host_transfer()?;
        let dst_span = rect_span(&buffer_origin, &region, &buffer_pitches)?;
        let src_span = rect_span(&host_origin, &region, &host_pitches)?;
        let dst_base = dst.ptr_with_offset(0, dst_span)?;
        if src_span > data.len() {
            return Err(Error::InvalidSize(format!(
                "host region needs {src_span} bytes but {} were provided",
                data.len(),
            )));
        }
        let params = CopyRectParams {
            dst: MemLocation::Device(dst_base),
            src: MemLocation::Host { buf: HostBuffer::from_bytes(data), offset: 0 },
            dst_origin: buffer_origin,
            src_origin: host_origin,
            region,
            dst_pitches: buffer_pitches,
            src_pitches: host_pitches,
        };
        self.append_copy_rect(params, waits, CommandKind::MemWriteRect)
    }

    /// Record a USM pointer-to-pointer copy.
    pub fn append_usm_memcpy(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_usm_ops()?;
        self.context.memory().check_range(src, len)?;
        self.context.memory().check_range(dst, len)?;
        self.append_copy(
            MemLocation::Device(dst),
            MemLocation::Device(src),
            len,
            waits,
            CommandKind::UsmMemcpy,
        )
    }

    /// Record a pattern fill over USM memory.
    pub fn append_usm_fill(
        &self,
        ptr: DevicePtr,
        pattern: &[u8],
        len: usize,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.check_usm_ops()?;
        self.check_fill_pattern(pattern)?;
        if len % pattern.len() != 0 {
            return Err(Error::InvalidSize(format!(
                "fill size {len} must be a multiple of the pattern width {}",
                pattern.len(),
            )));
        }
        self.context.memory().check_range(ptr, len)?;
        self.append_fill(ptr, pattern, len, waits, CommandKind::UsmFill)
    }

    /// Record a USM prefetch hint. Treatment follows the back end's hint
    /// policy: a native command, an inert pass-through node, or an
    /// unsupported-feature failure.
    pub fn append_usm_prefetch(
        &self,
        ptr: DevicePtr,
        len: usize,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.context.memory().check_range(ptr, len)?;
        self.append_hint(waits, CommandKind::UsmPrefetch, |builder, deps, policy| {
            match policy {
                HintPolicy::Native => builder.add_prefetch_node(ptr, len, deps),
                HintPolicy::Inert => builder.add_empty_node(deps),
                HintPolicy::DegradeWarn => {
                    warn!(
                        backend = builder.backend_name(),
                        "prefetch hint ignored and replaced with an empty node; \
                         prefetch is not supported by this graph back end"
                    );
                    builder.add_empty_node(deps)
                }
                HintPolicy::HardFail => {
                    Err(Error::unsupported(builder.backend_name(), "usm prefetch in command buffer"))
                }
            }
        })
    }

    /// Record a USM memory-advice hint; same policy treatment as
    /// prefetch.
    pub fn append_usm_advise(
        &self,
        ptr: DevicePtr,
        len: usize,
        advice: MemAdvice,
        waits: &[SyncPoint],
    ) -> Result<Appended> {
        self.context.memory().check_range(ptr, len)?;
        self.append_hint(waits, CommandKind::UsmAdvise, |builder, deps, policy| {
            match policy {
                HintPolicy::Native => builder.add_advise_node(ptr, len, advice, deps),
                HintPolicy::Inert => builder.add_empty_node(deps),
                HintPolicy::DegradeWarn => {
                    warn!(
                        backend = builder.backend_name(),
                        "memory advice ignored and replaced with an empty node; \
                         advice is not supported by this graph back end"
                    );
                    builder.add_empty_node(deps)
                }
                HintPolicy::HardFail => {
                    Err(Error::unsupported(builder.backend_name(), "usm advise in command buffer"))
                }
            }
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Compile the recording into its immutable executable form. One-way
    /// and rejected on a second call.
    pub fn finalize(&self) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match &mut state.phase {
            Phase::Recording(builder) => {
                let exec = builder.finalize()?;
                debug!(buffer = self.id, nodes = exec.node_count(), "finalized command buffer");
                state.phase = Phase::Finalized(exec);
                Ok(())
            }
            Phase::Finalized(_) => {
                Err(Error::InvalidOperation("command buffer is already finalized".into()))
            }
        }
    }

    /// Submit the executable graph on `queue` after the external wait
    /// events have completed. May be called repeatedly and from multiple
    /// threads; the buffer itself is not mutated.
    pub fn enqueue(&self, queue: &Arc<Queue>, wait_events: &[Event]) -> Result<Event> {
        if queue.context().id() != self.context.id() {
            return Err(Error::InvalidValue(
                "queue belongs to a different context than the command buffer".into(),
            ));
        }
        let exec = self.executable().map_err(|_| {
            Error::InvalidOperation("enqueue of a command buffer that is not finalized".into())
        })?;

        let _active = ActiveContextGuard::activate(&self.context);
        for event in wait_events {
            event.wait()?;
        }

        let completion = Event::new();
        if self.desc.enable_profiling {
            completion.start();
        }
        queue.record_submission();
        debug!(buffer = self.id, queue = queue.id(), "launching command graph");
        exec.launch(queue)?;
        completion.record();
        Ok(completion)
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn append_copy(
        &self,
        dst: MemLocation,
        src: MemLocation,
        len: usize,
        waits: &[SyncPoint],
        kind: CommandKind,
    ) -> Result<Appended> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let builder = recording(&mut state.phase)?;
        let deps = state.sync_points.resolve(waits)?;
        let node = builder.add_copy_node(dst, src, len, &deps)?;
        let sync_point = state.sync_points.mint(node);
        let command = self.register_command(state, node, kind, 0);
        Ok(Appended { sync_point, command })
    }

    fn append_copy_rect(
        &self,
        params: CopyRectParams,
        waits: &[SyncPoint],
        kind: CommandKind,
    ) -> Result<Appended> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let builder = recording(&mut state.phase)?;
        let deps = state.sync_points.resolve(waits)?;
        let node = builder.add_copy_rect_node(params, &deps)?;
        let sync_point = state.sync_points.mint(node);
        let command = self.register_command(state, node, kind, 0);
        Ok(Appended { sync_point, command })
    }

    fn append_fill(
        &self,
        dst: DevicePtr,
        pattern: &[u8],
        len: usize,
        waits: &[SyncPoint],
        kind: CommandKind,
    ) -> Result<Appended> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let builder = recording(&mut state.phase)?;
        let deps = state.sync_points.resolve(waits)?;
        // A decomposed fill inserts a chain; the sync point binds to the
        // last node so dependents order after the whole fill.
        let node = builder.add_fill_node(dst, pattern, len, &deps)?;
        let sync_point = state.sync_points.mint(node);
        let command = self.register_command(state, node, kind, 0);
        Ok(Appended { sync_point, command })
    }

    fn append_hint(
        &self,
        waits: &[SyncPoint],
        kind: CommandKind,
        insert: impl FnOnce(&mut dyn GraphBuilder, &[NodeId], HintPolicy) -> Result<NodeId>,
    ) -> Result<Appended> {
        let policy = self.device.caps().hint_policy;
        let mut guard = self.lock();
        let state = &mut *guard;
        let builder = recording(&mut state.phase)?;
        let deps = state.sync_points.resolve(waits)?;
        let node = insert(builder.as_mut(), &deps, policy)?;
        let sync_point = state.sync_points.mint(node);
        let command = self.register_command(state, node, kind, 0);
        Ok(Appended { sync_point, command })
    }

    /// Construct and register a command handle when the operation is
    /// update-capable here: kernel launches on updatable buffers, and
    /// every command on back ends with per-node event binding.
    fn register_command(
        &self,
        state: &mut BufferState,
        node: NodeId,
        kind: CommandKind,
        work_dim: u32,
    ) -> Option<CommandHandle> {
        let caps = self.device.caps();
        let kernel_updatable =
            self.desc.updatable && caps.kernel_update && kind == CommandKind::KernelLaunch;
        if !kernel_updatable && !caps.event_rebind {
            return None;
        }
        let buffer = self.self_weak.upgrade().expect("buffer is alive during its own append");
        let handle = CommandHandle::new(CommandRecord { buffer, node, kind, work_dim });
        state.commands.push(handle.downgrade());
        Some(handle)
    }

    fn check_external_waits(&self, wait_events: &[Event]) -> Result<()> {
        if wait_events.is_empty() || self.device.caps().event_rebind {
            Ok(())
        } else {
            Err(Error::unsupported(self.backend_name, "external wait events on recorded commands"))
        }
    }

    fn check_usm_ops(&self) -> Result<()> {
        if self.device.caps().usm_ops {
            Ok(())
        } else {
            Err(Error::unsupported(self.backend_name, "usm operations in command buffers"))
        }
    }

    fn check_host_transfer(&self) -> Result<()> {
        if self.device.caps().host_transfer {
            Ok(())
        } else {
            Err(Error::unsupported(self.backend_name, "host read/write in command buffers"))
        }
    }

    fn check_fill_pattern(&self, pattern: &[u8]) -> Result<()> {
        let width = pattern.len();
        if width == 0 || !width.is_power_of_two() {
            return Err(Error::InvalidSize(format!(
                "fill pattern width must be a non-zero power of two, got {width}",
            )));
        }
        let max = self.device.caps().max_fill_pattern_width;
        if width > max {
            return Err(Error::InvalidSize(format!(
                "fill pattern width {width} exceeds the device maximum of {max}",
            )));
        }
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // Native graph and executable resources are released with the
        // phase; the last holder (caller clone or command handle) gets
        // here.
        debug!(buffer = self.id, "destroying command buffer");
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("backend", &self.backend_name)
            .field("updatable", &self.desc.updatable)
            .field("finalized", &self.is_finalized())
            .finish_non_exhaustive()
    }
}

// ── Geometry checks ────────────────────────────────────────────────────────

fn rect_span(origin: &RectOffset, region: &RectRegion, pitches: &RectPitches) -> Result<usize> {
    if region.width == 0 || region.height == 0 || region.depth == 0 {
        return Err(Error::InvalidSize("copy region has a zero extent".into()));
    }
    let resolved = pitches.resolve(region);
    if resolved.row < region.width || resolved.slice < region.height * resolved.row {
        return Err(Error::InvalidSize(format!(
            "pitches ({}, {}) are smaller than the region {}x{}",
            resolved.row, resolved.slice, region.width, region.height,
        )));
    }
    Ok(resolved.linearize(origin, region.width - 1, region.height - 1, region.depth - 1) + 1)
}

fn check_host_range(buf: &HostBuffer, offset: usize, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::InvalidSize("byte range overflows".into()))?;
    if end > buf.len() {
        return Err(Error::InvalidSize(format!(
            "host access of {len} bytes at offset {offset} exceeds buffer of {} bytes",
            buf.len(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    struct Fixture {
        backend: Box<dyn GraphBackend>,
        context: Arc<Context>,
        device: Arc<Device>,
        queue: Arc<Queue>,
    }

    fn fixture(kind: BackendKind) -> Fixture {
        let backend = kind.create();
        let device = backend.new_device("test device");
        let context = Context::new(vec![device.clone()]);
        let queue = Queue::new(&context, &device).unwrap();
        Fixture { backend, context, device, queue }
    }

    fn buffer(fx: &Fixture, desc: &CommandBufferDesc) -> Arc<CommandBuffer> {
        CommandBuffer::create(&*fx.backend, &fx.context, &fx.device, desc).unwrap()
    }

    #[test]
    fn updatable_requires_device_support() {
        let fx = fixture(BackendKind::Hip);
        let desc = CommandBufferDesc::new().with_updatable(true);
        let err = CommandBuffer::create(&*fx.backend, &fx.context, &fx.device, &desc).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn append_after_finalize_rejected_and_node_count_unchanged() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let mem = fx.context.memory().alloc_buffer(16).unwrap();
        cb.append_mem_fill(&mem, 0, &[0xFF], 16, &[]).unwrap();
        cb.finalize().unwrap();
        let nodes = cb.node_count();
        let err = cb.append_mem_fill(&mem, 0, &[0xEE], 16, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(cb.node_count(), nodes);
    }

    #[test]
    fn enqueue_before_finalize_rejected() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let err = cb.enqueue(&fx.queue, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn finalize_twice_rejected() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        cb.finalize().unwrap();
        assert!(matches!(cb.finalize(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn foreign_sync_point_rejected() {
        let fx = fixture(BackendKind::Cpu);
        let a = buffer(&fx, &CommandBufferDesc::new());
        let b = buffer(&fx, &CommandBufferDesc::new());
        let mem = fx.context.memory().alloc_buffer(8).unwrap();
        let appended = a.append_mem_fill(&mem, 0, &[1], 8, &[]).unwrap();
        let err = b.append_mem_fill(&mem, 0, &[2], 8, &[appended.sync_point]).unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }

    #[test]
    fn failed_append_mints_no_sync_point() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let mem = fx.context.memory().alloc_buffer(9).unwrap();
        // Pattern width 3 is not a power of two.
        let err = cb.append_mem_fill(&mem, 0, &[1, 2, 3], 9, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidSize(_)));
        assert_eq!(cb.sync_point_count(), 0);
        assert_eq!(cb.node_count(), 0);
    }

    #[test]
    fn fill_offset_must_be_pattern_aligned() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let mem = fx.context.memory().alloc_buffer(16).unwrap();
        assert!(cb.append_mem_fill(&mem, 2, &[0; 4], 8, &[]).is_err());
    }

    #[test]
    fn fill_and_copy_execute_on_enqueue() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let src = fx.context.memory().alloc_buffer(8).unwrap();
        let dst = fx.context.memory().alloc_buffer(8).unwrap();
        let fill = cb.append_mem_fill(&src, 0, &[0xA5], 8, &[]).unwrap();
        cb.append_mem_copy(&src, 0, &dst, 0, 8, &[fill.sync_point]).unwrap();
        cb.finalize().unwrap();
        cb.enqueue(&fx.queue, &[]).unwrap();
        assert_eq!(fx.context.memory().snapshot(dst.base(), 8).unwrap(), vec![0xA5; 8]);
    }

    #[test]
    fn enqueue_is_repeatable() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let mem = fx.context.memory().alloc_buffer(4).unwrap();
        cb.append_mem_fill(&mem, 0, &[7], 4, &[]).unwrap();
        cb.finalize().unwrap();
        cb.enqueue(&fx.queue, &[]).unwrap();
        cb.enqueue(&fx.queue, &[]).unwrap();
        assert_eq!(fx.queue.submission_count(), 2);
        assert_eq!(fx.context.memory().snapshot(mem.base(), 4).unwrap(), vec![7; 4]);
    }

    #[test]
    fn enqueue_waits_on_external_events() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        cb.finalize().unwrap();
        let pending = Event::new();
        assert!(cb.enqueue(&fx.queue, &[pending]).is_err());
    }

    #[test]
    fn profiling_gates_elapsed_time() {
        let fx = fixture(BackendKind::Cpu);
        let plain = buffer(&fx, &CommandBufferDesc::new());
        plain.finalize().unwrap();
        let ev = plain.enqueue(&fx.queue, &[]).unwrap();
        assert!(ev.elapsed().is_err());

        let profiled = buffer(&fx, &CommandBufferDesc::new().with_profiling(true));
        profiled.finalize().unwrap();
        let ev = profiled.enqueue(&fx.queue, &[]).unwrap();
        assert!(ev.elapsed().is_ok());
    }

    #[test]
    fn kernel_from_foreign_context_rejected() {
        let fx = fixture(BackendKind::Cpu);
        let other = Context::new(vec![fx.backend.new_device("other")]);
        let kernel = Kernel::new(&other, "foreign");
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let err = cb
            .append_kernel_launch(&kernel, &NdRange::linear(1), &[], &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }

    #[test]
    fn handle_keeps_buffer_alive() {
        let fx = fixture(BackendKind::OpenCl);
        let cb = buffer(&fx, &CommandBufferDesc::new().with_updatable(true));
        let kernel = Kernel::new(&fx.context, "scale");
        let appended =
            cb.append_kernel_launch(&kernel, &NdRange::linear(8), &[], &[]).unwrap();
        let handle = appended.command.expect("updatable kernel launch yields a handle");
        assert_eq!(cb.command_count(), 1);
        let buffer_id = cb.id();
        drop(cb);
        // The handle's strong parent reference keeps the buffer alive.
        assert_eq!(handle.buffer().id(), buffer_id);
    }

    #[test]
    fn info_reports_reference_and_node_counts() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        let mem = fx.context.memory().alloc_buffer(4).unwrap();
        cb.append_mem_fill(&mem, 0, &[1], 4, &[]).unwrap();
        assert_eq!(cb.info(CommandBufferInfo::NodeCount), 1);
        assert_eq!(cb.info(CommandBufferInfo::ReferenceCount), 1);
        let alias = Arc::clone(&cb);
        assert_eq!(alias.info(CommandBufferInfo::ReferenceCount), 2);
    }

    #[test]
    fn queue_context_mismatch_rejected() {
        let fx = fixture(BackendKind::Cpu);
        let cb = buffer(&fx, &CommandBufferDesc::new());
        cb.finalize().unwrap();
        let other_dev = fx.backend.new_device("other");
        let other_ctx = Context::new(vec![other_dev.clone()]);
        let other_queue = Queue::new(&other_ctx, &other_dev).unwrap();
        assert!(cb.enqueue(&other_queue, &[]).is_err());
    }
}
