//! Segment writer failure handling: retries, failed-segment records, and
//! loss accounting.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;

use voice_recall::blob::{BlobStore, FsBlobStore};
use voice_recall::buffer::RawFrame;
use voice_recall::db::{LeaveReason, MetadataStore, SegmentStatus};
use voice_recall::encode::SegmentEncoder;
use voice_recall::error::CaptureError;
use voice_recall::writer::{spawn_writer, WriterContext, WriterMsg};
use voice_recall::CaptureConfig;

/// Fails a fixed number of times, then produces a placeholder artifact.
struct FlakyEncoder {
    failures_left: u32,
}

impl SegmentEncoder for FlakyEncoder {
    fn encode(&mut self, pcm: &[i16]) -> voice_recall::Result<Vec<u8>> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(CaptureError::EncodingFailure(
                "synthetic encoder fault".to_string(),
            ));
        }
        Ok(vec![0xAB; pcm.len() / 100 + 16])
    }
}

fn setup(dir: &Path, max_flush_retries: u32) -> (Arc<WriterContext>, i64) {
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    db.insert_session("s1", 9, 0).unwrap();
    let track_id = db.insert_track("s1", 77, 0).unwrap();
    let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir).unwrap());
    let config = CaptureConfig {
        retry_backoff_ms: 1,
        max_flush_retries,
        ..CaptureConfig::default()
    };
    let ctx = Arc::new(WriterContext {
        session_id: "s1".to_string(),
        channel_id: 9,
        db,
        blob,
        config,
    });
    (ctx, track_id)
}

fn frame(sequence: u32) -> WriterMsg {
    WriterMsg::Frame(RawFrame {
        sequence,
        timestamp_ms: sequence as i64 * 20,
        pcm: vec![100i16; 960],
    })
}

#[test]
fn transient_encoder_faults_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, track_id) = setup(dir.path(), 4);
    let (done_tx, done_rx) = unbounded();

    let handle = spawn_writer(
        Arc::clone(&ctx),
        track_id,
        77,
        Box::new(FlakyEncoder { failures_left: 3 }),
        done_tx,
    );
    for seq in 0..10u32 {
        handle.sender.send(frame(seq)).unwrap();
    }
    handle.sender.send(WriterMsg::Close(LeaveReason::Natural)).unwrap();

    let done = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    handle.join.join().unwrap();
    assert_eq!(done.committed_segments, 1);
    assert_eq!(done.failed_segments, 0);

    let segments = ctx.db.segments_for_track(track_id).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].status, SegmentStatus::Committed);
    assert!(!segments[0].storage_ref.is_empty());
    assert!(segments[0].byte_size > 0);
    assert_eq!(segments[0].duration_ms, 200);
}

#[test]
fn exhausted_retries_record_a_failed_segment() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, track_id) = setup(dir.path(), 3);
    let (done_tx, done_rx) = unbounded();

    let handle = spawn_writer(
        Arc::clone(&ctx),
        track_id,
        77,
        Box::new(FlakyEncoder { failures_left: 99 }),
        done_tx,
    );
    for seq in 0..10u32 {
        handle.sender.send(frame(seq)).unwrap();
    }
    handle.sender.send(WriterMsg::Close(LeaveReason::Natural)).unwrap();

    let done = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    handle.join.join().unwrap();
    assert_eq!(done.committed_segments, 0);
    assert_eq!(done.failed_segments, 1);

    // The failed segment keeps its timeline slot with an empty reference.
    let segments = ctx.db.segments_for_track(track_id).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].status, SegmentStatus::Failed);
    assert!(segments[0].storage_ref.is_empty());
    assert_eq!(segments[0].byte_size, 0);
    assert_eq!(segments[0].checksum, 0);
    assert_eq!(segments[0].duration_ms, 200);

    // The track still closed normally.
    let tracks = ctx.db.tracks_for_session("s1").unwrap();
    assert!(tracks[0].left_at_ms.is_some());
    assert_eq!(tracks[0].leave_reason.as_deref(), Some("natural"));
}

#[test]
fn enqueue_overflow_is_charged_to_the_next_segment() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, track_id) = setup(dir.path(), 4);
    let (done_tx, done_rx) = unbounded();

    let handle = spawn_writer(
        Arc::clone(&ctx),
        track_id,
        77,
        Box::new(FlakyEncoder { failures_left: 0 }),
        done_tx,
    );
    // Simulate five frames the demultiplexer could not enqueue.
    handle.overflow.fetch_add(5, Ordering::Relaxed);
    handle.sender.send(frame(0)).unwrap();
    handle.sender.send(WriterMsg::Close(LeaveReason::Natural)).unwrap();

    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    handle.join.join().unwrap();

    let segments = ctx.db.segments_for_track(track_id).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].dropped_frames, 5);
}
