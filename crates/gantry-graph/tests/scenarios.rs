//! End-to-end command-buffer scenarios across the back ends.

use std::sync::Arc;

use gantry_core::{Context, Device, Error, Event, Queue};
use gantry_graph::{BackendKind, CommandBuffer, CommandBufferDesc, GraphBackend};

struct Rig {
    backend: Box<dyn GraphBackend>,
    context: Arc<Context>,
    device: Arc<Device>,
    queue: Arc<Queue>,
}

fn rig(kind: BackendKind) -> Rig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let backend = kind.create();
    let device = backend.new_device("test device");
    let context = Context::new(vec![device.clone()]);
    let queue = Queue::new(&context, &device).unwrap();
    Rig { backend, context, device, queue }
}

fn buffer(rig: &Rig) -> Arc<CommandBuffer> {
    CommandBuffer::create(&*rig.backend, &rig.context, &rig.device, &CommandBufferDesc::new())
        .unwrap()
}

#[test]
fn append_after_finalize_fails_on_every_backend() {
    for kind in BackendKind::all() {
        let rig = rig(kind);
        let cb = buffer(&rig);
        let mem = rig.context.memory().alloc_buffer(8).unwrap();
        cb.append_mem_fill(&mem, 0, &[1], 8, &[]).unwrap();
        cb.finalize().unwrap();
        let nodes = cb.node_count();
        let err = cb.append_mem_fill(&mem, 0, &[2], 8, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)), "{kind}: {err}");
        assert_eq!(cb.node_count(), nodes, "{kind}: node count changed");
    }
}

#[test]
fn enqueue_before_finalize_fails_on_every_backend() {
    for kind in BackendKind::all() {
        let rig = rig(kind);
        let cb = buffer(&rig);
        let err = cb.enqueue(&rig.queue, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)), "{kind}: {err}");
    }
}

#[test]
fn non_power_of_two_pattern_mints_no_sync_point() {
    for kind in BackendKind::all() {
        let rig = rig(kind);
        let cb = buffer(&rig);
        let mem = rig.context.memory().alloc_buffer(9).unwrap();
        let err = cb.append_mem_fill(&mem, 0, &[1, 2, 3], 9, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidSize(_)), "{kind}: {err}");
        assert_eq!(cb.sync_point_count(), 0, "{kind}: sync point minted on failure");
    }
}

#[test]
fn independent_fills_commute_across_recording_order() {
    let expected = {
        let rig = rig(BackendKind::Cpu);
        let cb = buffer(&rig);
        let a = rig.context.memory().alloc_buffer(8).unwrap();
        let b = rig.context.memory().alloc_buffer(8).unwrap();
        cb.append_mem_fill(&a, 0, &[0x11], 8, &[]).unwrap();
        cb.append_mem_fill(&b, 0, &[0x22], 8, &[]).unwrap();
        cb.finalize().unwrap();
        cb.enqueue(&rig.queue, &[]).unwrap();
        (
            rig.context.memory().snapshot(a.base(), 8).unwrap(),
            rig.context.memory().snapshot(b.base(), 8).unwrap(),
        )
    };

    // Same fills recorded in the opposite order; no dependency edges
    // exist between them, so the outcome is identical.
    let rig = rig(BackendKind::Cpu);
    let cb = buffer(&rig);
    let a = rig.context.memory().alloc_buffer(8).unwrap();
    let b = rig.context.memory().alloc_buffer(8).unwrap();
    cb.append_mem_fill(&b, 0, &[0x22], 8, &[]).unwrap();
    cb.append_mem_fill(&a, 0, &[0x11], 8, &[]).unwrap();
    cb.finalize().unwrap();
    cb.enqueue(&rig.queue, &[]).unwrap();
    assert_eq!(rig.context.memory().snapshot(a.base(), 8).unwrap(), expected.0);
    assert_eq!(rig.context.memory().snapshot(b.base(), 8).unwrap(), expected.1);
}

#[test]
fn dependent_copy_observes_fill_on_every_backend() {
    for kind in [BackendKind::Cuda, BackendKind::Hip, BackendKind::LevelZero, BackendKind::Cpu] {
        let rig = rig(kind);
        let cb = buffer(&rig);
        let a = rig.context.memory().alloc(16).unwrap();
        let b = rig.context.memory().alloc(16).unwrap();
        let fill = cb.append_usm_fill(a, &[0xA5], 16, &[]).unwrap();
        cb.append_usm_memcpy(b, a, 16, &[fill.sync_point]).unwrap();
        cb.finalize().unwrap();
        cb.enqueue(&rig.queue, &[]).unwrap();
        assert_eq!(
            rig.context.memory().snapshot(b, 16).unwrap(),
            vec![0xA5; 16],
            "{kind}: dependent copy missed the fill",
        );
    }
}

#[test]
fn repeated_enqueue_is_independent() {
    let rig = rig(BackendKind::Cuda);
    let cb = buffer(&rig);
    let a = rig.context.memory().alloc(8).unwrap();
    let b = rig.context.memory().alloc(8).unwrap();
    let fill = cb.append_usm_fill(a, &[0x3C], 8, &[]).unwrap();
    cb.append_usm_memcpy(b, a, 8, &[fill.sync_point]).unwrap();
    cb.finalize().unwrap();

    let first = cb.enqueue(&rig.queue, &[]).unwrap();
    assert!(first.is_complete());
    // Perturb destination memory between submissions; the second
    // execution restores it from the recorded graph alone.
    rig.context.memory().write(b, &[0u8; 8]).unwrap();
    let second = cb.enqueue(&rig.queue, &[]).unwrap();
    assert!(second.is_complete());
    assert_eq!(rig.context.memory().snapshot(b, 8).unwrap(), vec![0x3C; 8]);
    assert_eq!(rig.queue.submission_count(), 2);
}

#[test]
fn cross_buffer_dependency_through_external_event() {
    let rig = rig(BackendKind::Cpu);
    let a = rig.context.memory().alloc_buffer(8).unwrap();
    let b = rig.context.memory().alloc_buffer(8).unwrap();

    let producer = buffer(&rig);
    producer.append_mem_fill(&a, 0, &[0x7E], 8, &[]).unwrap();
    producer.finalize().unwrap();

    let consumer = buffer(&rig);
    consumer.append_mem_copy(&a, 0, &b, 0, 8, &[]).unwrap();
    consumer.finalize().unwrap();

    // Consumer first refuses to run while the producer has not been
    // submitted (its completion event is still pending).
    let gate = Event::new();
    assert!(consumer.enqueue(&rig.queue, &[gate.clone()]).is_err());

    let done = producer.enqueue(&rig.queue, &[]).unwrap();
    consumer.enqueue(&rig.queue, &[done]).unwrap();
    assert_eq!(rig.context.memory().snapshot(b.base(), 8).unwrap(), vec![0x7E; 8]);
}

#[test]
fn wait_event_rebinding_regates_a_live_graph() {
    // Level Zero binds synchronization per command, so a recorded fill's
    // wait list can be swapped after finalize without re-recording.
    let rig = rig(BackendKind::LevelZero);
    let a = rig.context.memory().alloc(8).unwrap();
    let b = rig.context.memory().alloc(8).unwrap();

    let cb = buffer(&rig);
    let fill = cb.append_usm_fill(a, &[0xA1], 8, &[]).unwrap();
    let copy = cb.append_usm_memcpy(b, a, 8, &[fill.sync_point]).unwrap();
    let fill_handle = fill.command.expect("level_zero hands out command handles");
    let copy_handle = copy.command.expect("level_zero hands out command handles");
    cb.finalize().unwrap();

    // First submission: B observes the fill through the sync-point edge,
    // and the copy's rebound signal event completes.
    let copy_done = copy_handle.update_signal_event().unwrap();
    cb.enqueue(&rig.queue, &[]).unwrap();
    assert!(copy_done.is_complete());
    assert_eq!(rig.context.memory().snapshot(b, 8).unwrap(), vec![0xA1; 8]);

    // Rebind the fill onto an upstream producer recorded after finalize.
    let upstream = buffer(&rig);
    upstream.append_usm_fill(a, &[0x5A], 8, &[]).unwrap();
    upstream.finalize().unwrap();
    let upstream_done = upstream.enqueue(&rig.queue, &[]).unwrap();

    fill_handle.update_wait_events(&[upstream_done]).unwrap();
    cb.enqueue(&rig.queue, &[]).unwrap();
    assert_eq!(rig.context.memory().snapshot(b, 8).unwrap(), vec![0xA1; 8]);

    // A pending gate swapped in the same way blocks the next submission:
    // the mutation took effect on the live graph, not a re-recording.
    let gate = Event::new();
    fill_handle.update_wait_events(&[gate.clone()]).unwrap();
    assert!(cb.enqueue(&rig.queue, &[]).is_err());
    gate.record();
    cb.enqueue(&rig.queue, &[]).unwrap();
}

#[test]
fn host_write_snapshots_data_at_record_time() {
    let rig = rig(BackendKind::Cpu);
    let cb = buffer(&rig);
    let mem = rig.context.memory().alloc_buffer(4).unwrap();
    let mut staged = vec![1, 2, 3, 4];
    cb.append_mem_write(&mem, 0, &staged, &[]).unwrap();
    // Mutating the caller's copy after the append has no effect on the
    // recording.
    staged[0] = 99;
    cb.finalize().unwrap();
    cb.enqueue(&rig.queue, &[]).unwrap();
    assert_eq!(rig.context.memory().snapshot(mem.base(), 4).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn host_read_lands_in_shared_staging() {
    let rig = rig(BackendKind::LevelZero);
    let cb = buffer(&rig);
    let mem = rig.context.memory().alloc_buffer(8).unwrap();
    let staging = gantry_core::HostBuffer::zeroed(8);
    let fill = cb.append_mem_fill(&mem, 0, &[0xEE], 8, &[]).unwrap();
    cb.append_mem_read(&mem, 0, &staging, 0, 8, &[fill.sync_point]).unwrap();
    cb.finalize().unwrap();
    cb.enqueue(&rig.queue, &[]).unwrap();
    assert_eq!(staging.to_vec(), vec![0xEE; 8]);
}

#[test]
fn rect_copy_moves_a_subregion() {
    use gantry_core::{RectOffset, RectPitches, RectRegion};

    let rig = rig(BackendKind::Hip);
    let cb = buffer(&rig);
    // 4x4 byte image, copy the inner 2x2 into a packed destination.
    let src = rig.context.memory().alloc_buffer(16).unwrap();
    let dst = rig.context.memory().alloc_buffer(4).unwrap();
    let image: Vec<u8> = (0..16).collect();
    let write = cb.append_mem_write(&src, 0, &image, &[]).unwrap();
    cb.append_mem_copy_rect(
        &src,
        RectOffset::new(1, 1, 0),
        RectPitches::new(4, 0),
        &dst,
        RectOffset::default(),
        RectPitches::new(2, 0),
        RectRegion::new(2, 2, 1),
        &[write.sync_point],
    )
    .unwrap();
    cb.finalize().unwrap();
    cb.enqueue(&rig.queue, &[]).unwrap();
    assert_eq!(rig.context.memory().snapshot(dst.base(), 4).unwrap(), vec![5, 6, 9, 10]);
}

#[test]
fn concurrent_enqueues_of_one_buffer() {
    let rig = rig(BackendKind::Cpu);
    let cb = buffer(&rig);
    let mem = rig.context.memory().alloc_buffer(64).unwrap();
    cb.append_mem_fill(&mem, 0, &[0x55], 64, &[]).unwrap();
    cb.finalize().unwrap();

    let queues: Vec<_> =
        (0..4).map(|_| Queue::new(&rig.context, &rig.device).unwrap()).collect();
    std::thread::scope(|scope| {
        for queue in &queues {
            let cb = Arc::clone(&cb);
            scope.spawn(move || {
                for _ in 0..8 {
                    cb.enqueue(queue, &[]).unwrap();
                }
            });
        }
    });
    assert_eq!(rig.context.memory().snapshot(mem.base(), 64).unwrap(), vec![0x55; 64]);
}
