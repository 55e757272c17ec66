//! End-to-end capture tests: transport events in, finalized sessions and
//! recallable segments out.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use voice_recall::blob::{BlobStore, FsBlobStore};
use voice_recall::db::{MetadataStore, SessionStatus};
use voice_recall::encode::{EncoderFactory, OpusSegmentEncoder, SegmentEncoder};
use voice_recall::error::CaptureError;
use voice_recall::transport::{AudioPacket, TransportEvent};
use voice_recall::{CaptureConfig, RecallIndex, SessionCoordinator};

fn test_config(dir: &Path) -> CaptureConfig {
    CaptureConfig {
        archive_dir: dir.to_path_buf(),
        retry_backoff_ms: 1,
        stop_timeout_ms: 5_000,
        ..CaptureConfig::default()
    }
}

fn setup(dir: &Path) -> (Arc<MetadataStore>, SessionCoordinator) {
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    let blob = Arc::new(FsBlobStore::new(&dir.join("segments")).unwrap());
    let coordinator = SessionCoordinator::new(Arc::clone(&db), blob, test_config(dir));
    (db, coordinator)
}

/// 20 ms of quiet (but non-silent) 48 kHz mono audio.
fn packet(participant: u64, sequence: u32) -> TransportEvent {
    TransportEvent::Packet(AudioPacket {
        participant,
        sequence,
        timestamp_ms: sequence as i64 * 20,
        pcm: vec![100i16; 960],
    })
}

/// Wait for the demultiplexer to route everything queued so far.
fn drain_events(events: &crossbeam_channel::Sender<TransportEvent>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !events.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(100));
}

#[test]
fn two_participants_record_five_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let (db, coordinator) = setup(dir.path());

    let started = coordinator.start(42).unwrap();
    for seq in 0..250u32 {
        started.events.send(packet(1, seq)).unwrap();
        started.events.send(packet(2, seq)).unwrap();
    }
    drain_events(&started.events);

    let status = coordinator.stop(&started.session_id).unwrap();
    assert_eq!(status, SessionStatus::Closed);

    let index = RecallIndex::new(Arc::clone(&db));
    let blob = FsBlobStore::new(&dir.path().join("segments")).unwrap();
    for participant in [1u64, 2] {
        let timeline = index
            .resolve(&started.session_id, Some(&[participant]), None)
            .unwrap();
        assert!(!timeline.is_empty());
        let total: i64 = timeline.iter().map(|e| e.duration_ms).sum();
        assert_eq!(total, 5_000);
        assert!(timeline[0].offset_ms < 500);
        for entry in &timeline {
            assert!(entry.committed);
            assert_eq!(entry.dropped_frames, 0);
            assert_eq!(entry.gap_ms, 0);
            let artifact = blob.get(&entry.storage_ref).unwrap();
            assert!(artifact.starts_with(b"OggS"));
            assert_eq!(artifact.len() as i64, entry.byte_size);
            assert_eq!(crc32fast::hash(&artifact), entry.checksum);
        }
        // Strictly increasing start offsets within the track
        for pair in timeline.windows(2) {
            assert!(pair[0].offset_ms < pair[1].offset_ms);
        }
    }
}

#[test]
fn missing_sequence_is_annotated_as_gap() {
    let dir = tempfile::tempdir().unwrap();
    let (db, coordinator) = setup(dir.path());

    let started = coordinator.start(7).unwrap();
    for seq in [0u32, 1, 2, 4] {
        started.events.send(packet(9, seq)).unwrap();
    }
    drain_events(&started.events);
    assert_eq!(
        coordinator.stop(&started.session_id).unwrap(),
        SessionStatus::Closed
    );

    let index = RecallIndex::new(db);
    let timeline = index.resolve(&started.session_id, None, None).unwrap();
    assert_eq!(timeline.len(), 1);
    // Five packet slots (0..=4) with one silence-filled hole
    assert_eq!(timeline[0].duration_ms, 100);
    assert_eq!(timeline[0].gap_ms, 20);
    assert!(timeline[0].committed);
}

#[test]
fn opted_out_participant_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let (db, coordinator) = setup(dir.path());
    db.set_participant_can_record(1, false).unwrap();

    let started = coordinator.start(3).unwrap();
    for seq in 0..50u32 {
        started.events.send(packet(1, seq)).unwrap();
        started.events.send(packet(2, seq)).unwrap();
    }
    drain_events(&started.events);
    coordinator.stop(&started.session_id).unwrap();

    let tracks = db.tracks_for_session(&started.session_id).unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].participant_id, 2);
}

#[test]
fn transport_loss_fails_the_session_but_keeps_audio() {
    let dir = tempfile::tempdir().unwrap();
    let (db, coordinator) = setup(dir.path());

    let started = coordinator.start(11).unwrap();
    for seq in 0..50u32 {
        started.events.send(packet(5, seq)).unwrap();
    }
    started.events.send(TransportEvent::Disconnected).unwrap();

    // The session tears itself down; wait for the terminal record.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = db.session_status(&started.session_id).unwrap().unwrap();
        if status.is_terminal() {
            assert_eq!(status, SessionStatus::Failed);
            break;
        }
        assert!(Instant::now() < deadline, "session never finalized");
        thread::sleep(Duration::from_millis(20));
    }

    // Whatever was flushed before the loss is still recallable.
    let index = RecallIndex::new(Arc::clone(&db));
    let timeline = index.resolve(&started.session_id, None, None).unwrap();
    let total: i64 = timeline.iter().map(|e| e.duration_ms).sum();
    assert_eq!(total, 1_000);

    // Stopping a session that already ended is a no-op.
    assert_eq!(
        coordinator.stop(&started.session_id).unwrap(),
        SessionStatus::Failed
    );

    // The channel is free again.
    let second = coordinator.start(11).unwrap();
    coordinator.stop(&second.session_id).unwrap();
}

struct BrokenEncoder;

impl SegmentEncoder for BrokenEncoder {
    fn encode(&mut self, _pcm: &[i16]) -> voice_recall::Result<Vec<u8>> {
        Err(CaptureError::EncodingFailure(
            "synthetic encoder fault".to_string(),
        ))
    }
}

#[test]
fn one_failing_track_does_not_fail_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    let blob = Arc::new(FsBlobStore::new(&dir.path().join("segments")).unwrap());
    let config = CaptureConfig {
        archive_dir: dir.path().to_path_buf(),
        retry_backoff_ms: 1,
        max_flush_retries: 2,
        stop_timeout_ms: 5_000,
        ..CaptureConfig::default()
    };

    // The first track created gets a permanently broken encoder.
    let spawned = AtomicUsize::new(0);
    let factory: EncoderFactory = Arc::new(move || {
        if spawned.fetch_add(1, Ordering::SeqCst) == 0 {
            Box::new(BrokenEncoder)
        } else {
            Box::new(OpusSegmentEncoder::new(48_000, 24))
        }
    });
    let coordinator =
        SessionCoordinator::with_encoder_factory(Arc::clone(&db), blob, config, factory);

    let started = coordinator.start(21).unwrap();
    // Participant 1 speaks first so their track owns the broken encoder.
    started.events.send(packet(1, 0)).unwrap();
    drain_events(&started.events);
    for seq in 0..50u32 {
        started.events.send(packet(2, seq)).unwrap();
    }
    drain_events(&started.events);

    // The healthy track keeps the session recoverable.
    assert_eq!(
        coordinator.stop(&started.session_id).unwrap(),
        SessionStatus::Closed
    );

    let index = RecallIndex::new(db);
    let timeline = index.resolve(&started.session_id, None, None).unwrap();
    let broken: Vec<_> = timeline.iter().filter(|e| e.participant_id == 1).collect();
    assert_eq!(broken.len(), 1);
    assert!(!broken[0].committed);
    assert!(broken[0].storage_ref.is_empty());
    assert_eq!(broken[0].byte_size, 0);

    let healthy: Vec<_> = timeline.iter().filter(|e| e.participant_id == 2).collect();
    assert!(healthy.iter().all(|e| e.committed));
    assert_eq!(healthy.iter().map(|e| e.duration_ms).sum::<i64>(), 1_000);
}

#[test]
fn participant_leave_closes_their_track_early() {
    let dir = tempfile::tempdir().unwrap();
    let (db, coordinator) = setup(dir.path());

    let started = coordinator.start(8).unwrap();
    for seq in 0..25u32 {
        started.events.send(packet(1, seq)).unwrap();
    }
    started.events.send(TransportEvent::Leave(1)).unwrap();
    for seq in 0..50u32 {
        started.events.send(packet(2, seq)).unwrap();
    }
    drain_events(&started.events);
    coordinator.stop(&started.session_id).unwrap();

    // The leaver's writer finishes on its own thread; poll for the close.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let tracks = db.tracks_for_session(&started.session_id).unwrap();
        assert_eq!(tracks.len(), 2);
        let leaver = tracks.iter().find(|t| t.participant_id == 1).unwrap();
        let stayer = tracks.iter().find(|t| t.participant_id == 2).unwrap();
        assert_eq!(stayer.leave_reason.as_deref(), Some("disconnected"));
        if leaver.leave_reason.as_deref() == Some("natural") {
            break;
        }
        assert!(Instant::now() < deadline, "leaver track never closed");
        thread::sleep(Duration::from_millis(20));
    }
}
