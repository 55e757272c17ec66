//! Recall index: timeline resolution, filters, and export.

use std::io::Cursor;
use std::sync::Arc;

use voice_recall::blob::{BlobStore, FsBlobStore};
use voice_recall::db::{MetadataStore, NewSegment, SegmentStatus, SessionStatus};
use voice_recall::encode::{decode_artifact, OpusSegmentEncoder, SegmentEncoder};
use voice_recall::error::CaptureError;
use voice_recall::recall::{RecallIndex, TimeWindow};

fn seed_session(db: &MetadataStore) -> (i64, i64) {
    db.insert_session("s1", 1, 1_000).unwrap();
    // Participant 100 joins at session start, 200 joins two seconds in.
    let t1 = db.insert_track("s1", 100, 1_000).unwrap();
    let t2 = db.insert_track("s1", 200, 3_000).unwrap();

    for (track_id, offset, storage_ref) in [
        (t1, 0, "1/s1/a.ogg"),
        (t1, 2_000, "1/s1/b.ogg"),
        (t2, 0, "1/s1/c.ogg"),
    ] {
        db.insert_segment(&NewSegment {
            track_id,
            start_offset_ms: offset,
            duration_ms: 2_000,
            byte_size: 64,
            storage_ref: storage_ref.to_string(),
            checksum: 1,
            status: SegmentStatus::Committed,
            dropped_frames: 0,
            gap_ms: 0,
        })
        .unwrap();
    }
    db.finalize_session("s1", SessionStatus::Closed, 9_000)
        .unwrap();
    (t1, t2)
}

#[test]
fn offsets_are_session_relative_and_ordered() {
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    seed_session(&db);
    let index = RecallIndex::new(db);

    let timeline = index.resolve("s1", None, None).unwrap();
    assert_eq!(timeline.len(), 3);
    // Track 2 joined 2 s after the session started, so its first segment
    // lands at offset 2000 and ties with track 1's second segment; the
    // tie breaks on participant id.
    assert_eq!(timeline[0].offset_ms, 0);
    assert_eq!(timeline[0].participant_id, 100);
    assert_eq!(timeline[1].offset_ms, 2_000);
    assert_eq!(timeline[1].participant_id, 100);
    assert_eq!(timeline[2].offset_ms, 2_000);
    assert_eq!(timeline[2].participant_id, 200);
}

#[test]
fn participant_and_window_filters() {
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    seed_session(&db);
    let index = RecallIndex::new(db);

    let only_200 = index.resolve("s1", Some(&[200]), None).unwrap();
    assert_eq!(only_200.len(), 1);
    assert_eq!(only_200[0].participant_id, 200);

    // A window inside the second half touches only the later segments.
    let window = TimeWindow {
        start_ms: 2_500,
        end_ms: 3_500,
    };
    let windowed = index.resolve("s1", None, Some(window)).unwrap();
    assert_eq!(windowed.len(), 2);
    assert!(windowed.iter().all(|e| e.offset_ms == 2_000));
}

#[test]
fn live_sessions_are_not_recallable() {
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    db.insert_session("live", 2, 0).unwrap();
    let index = RecallIndex::new(Arc::clone(&db));

    assert!(matches!(
        index.resolve("live", None, None),
        Err(CaptureError::ConcurrencyConflict(_))
    ));
    // Once finalization begins, committed rows become visible.
    db.update_session_status("live", SessionStatus::Finalizing)
        .unwrap();
    assert!(index.resolve("live", None, None).is_ok());

    db.finalize_session("live", SessionStatus::Failed, 100)
        .unwrap();
    assert!(index.resolve("live", None, None).is_ok());

    assert!(matches!(
        index.resolve("nonexistent", None, None),
        Err(CaptureError::ConcurrencyConflict(_))
    ));
}

#[test]
fn sessions_since_filters_and_sorts() {
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    db.insert_session("old", 1, 1_000).unwrap();
    db.insert_session("mid", 1, 50_000).unwrap();
    db.insert_session("new", 2, 90_000).unwrap();
    let index = RecallIndex::new(db);

    let recent = index.sessions_since(100_000, 60_000).unwrap();
    let ids: Vec<_> = recent.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "mid"]);
}

fn sine(duration_ms: u64) -> Vec<i16> {
    let samples = (48_000 * duration_ms / 1_000) as usize;
    (0..samples)
        .map(|i| {
            let t = i as f32 / 48_000.0;
            ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 16_000.0) as i16
        })
        .collect()
}

#[test]
fn export_concatenates_and_silence_fills() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MetadataStore::open_in_memory().unwrap());
    let blob = FsBlobStore::new(dir.path()).unwrap();

    db.insert_session("s1", 5, 0).unwrap();
    let track = db.insert_track("s1", 100, 0).unwrap();

    let mut encoder = OpusSegmentEncoder::new(48_000, 24);
    // Two 100 ms segments with a 200 ms hole between them.
    for (key, offset) in [("5/s1/a.ogg", 0i64), ("5/s1/b.ogg", 300)] {
        let artifact = encoder.encode(&sine(100)).unwrap();
        blob.put(key, &artifact).unwrap();
        db.insert_segment(&NewSegment {
            track_id: track,
            start_offset_ms: offset,
            duration_ms: 100,
            byte_size: artifact.len() as i64,
            storage_ref: key.to_string(),
            checksum: crc32fast::hash(&artifact),
            status: SegmentStatus::Committed,
            dropped_frames: 0,
            gap_ms: 0,
        })
        .unwrap();
    }
    db.finalize_session("s1", SessionStatus::Closed, 1_000)
        .unwrap();

    let index = RecallIndex::new(db);

    let mut ogg = Vec::new();
    let bytes = index.export_ogg(&blob, "s1", 100, &mut ogg).unwrap();
    assert_eq!(bytes as usize, ogg.len());
    assert!(ogg.starts_with(b"OggS"));
    // Chained stream: everything decodes back out.
    let pcm = decode_artifact(&ogg, 48_000).unwrap();
    assert_eq!(pcm.len(), 9_600);

    // WAV output carries the hole as silence: 100 ms + 200 ms + 100 ms.
    let mut wav = Cursor::new(Vec::new());
    let samples = index
        .export_wav(&blob, "s1", 100, 48_000, &mut wav)
        .unwrap();
    assert_eq!(samples, 19_200);

    // Exporting a participant with no audio is an error.
    let mut sink: Vec<u8> = Vec::new();
    assert!(index.export_ogg(&blob, "s1", 999, &mut sink).is_err());
}
