//! Per-track segment writer.
//!
//! One thread per track drains the participant buffer, invokes the
//! encoder, persists the artifact, and commits the segment row. A single
//! thread per track is what guarantees strictly increasing start-time
//! order for a track's segments no matter which flush trigger fired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};

use crate::blob::{segment_key, BlobStore};
use crate::buffer::{FrameBatch, ParticipantBuffer, PushOutcome, RawFrame};
use crate::config::CaptureConfig;
use crate::db::{LeaveReason, MetadataStore, NewSegment, SegmentStatus};
use crate::encode::SegmentEncoder;
use crate::error::Result;
use crate::transport::{ChannelId, ParticipantId};

/// Messages a track's writer thread accepts.
pub enum WriterMsg {
    Frame(RawFrame),
    /// Drain and flush whatever is buffered now.
    Flush,
    /// Final flush, close the track row, then exit.
    Close(LeaveReason),
}

/// Completion report sent back when a writer shuts down.
#[derive(Debug)]
pub struct TrackDone {
    pub track_id: i64,
    pub participant: ParticipantId,
    pub committed_segments: u64,
    pub failed_segments: u64,
}

/// Demultiplexer-side handle to a running writer.
pub struct TrackHandle {
    pub track_id: i64,
    pub participant: ParticipantId,
    pub sender: Sender<WriterMsg>,
    /// Frames the demultiplexer could not enqueue (channel full). The
    /// writer folds this into the next segment's loss annotation.
    pub overflow: Arc<AtomicU64>,
    pub join: thread::JoinHandle<()>,
}

/// Shared collaborators for all writers of one session.
pub struct WriterContext {
    pub session_id: String,
    pub channel_id: ChannelId,
    pub db: Arc<MetadataStore>,
    pub blob: Arc<dyn BlobStore>,
    pub config: CaptureConfig,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Backoff before flush attempt `attempt + 1`.
fn flush_backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    match attempt {
        0 => base_ms,
        1 => base_ms * 2,
        2 => base_ms * 4,
        3 => base_ms * 8,
        _ => base_ms * 10,
    }
}

pub fn spawn_writer(
    ctx: Arc<WriterContext>,
    track_id: i64,
    participant: ParticipantId,
    encoder: Box<dyn SegmentEncoder>,
    done_tx: Sender<TrackDone>,
) -> TrackHandle {
    // Sized so the buffer's duration threshold, not the channel, is what
    // normally applies backpressure.
    let capacity = ((ctx.config.buffer_max_ms / ctx.config.packet_interval_ms) as usize * 2)
        .max(64);
    let (tx, rx) = bounded::<WriterMsg>(capacity);
    let overflow = Arc::new(AtomicU64::new(0));

    let thread_overflow = Arc::clone(&overflow);
    let join = thread::Builder::new()
        .name(format!("segwriter-{}", track_id))
        .spawn(move || {
            let mut writer = SegmentWriter::new(ctx, track_id, participant, encoder, thread_overflow);
            let done = writer.run(rx);
            let _ = done_tx.send(done);
        })
        .expect("failed to spawn segment writer thread");

    TrackHandle {
        track_id,
        participant,
        sender: tx,
        overflow,
        join,
    }
}

struct SegmentWriter {
    ctx: Arc<WriterContext>,
    track_id: i64,
    participant: ParticipantId,
    buffer: ParticipantBuffer,
    encoder: Box<dyn SegmentEncoder>,
    overflow: Arc<AtomicU64>,
    committed: u64,
    failed: u64,
}

impl SegmentWriter {
    fn new(
        ctx: Arc<WriterContext>,
        track_id: i64,
        participant: ParticipantId,
        encoder: Box<dyn SegmentEncoder>,
        overflow: Arc<AtomicU64>,
    ) -> Self {
        let buffer = ParticipantBuffer::new(
            ctx.config.sample_rate,
            ctx.config.packet_interval_ms,
            ctx.config.buffer_max_ms,
        );
        Self {
            ctx,
            track_id,
            participant,
            buffer,
            encoder,
            overflow,
            committed: 0,
            failed: 0,
        }
    }

    fn run(&mut self, rx: Receiver<WriterMsg>) -> TrackDone {
        let flush_interval = Duration::from_millis(self.ctx.config.flush_interval_ms);
        let mut reason = LeaveReason::Disconnected;

        loop {
            match rx.recv_timeout(flush_interval) {
                Ok(WriterMsg::Frame(frame)) => {
                    let lost = self.overflow.swap(0, Ordering::Relaxed);
                    if lost > 0 {
                        self.buffer.note_dropped(lost);
                    }
                    match self.buffer.push(frame) {
                        PushOutcome::NeedsFlush => self.flush(),
                        PushOutcome::Rejected => {
                            debug!("track {}: discarded stale frame", self.track_id)
                        }
                        PushOutcome::Buffered => {}
                    }
                }
                Ok(WriterMsg::Flush) => self.flush(),
                Ok(WriterMsg::Close(r)) => {
                    reason = r;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => self.flush(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Final flush covers in-flight and pending frames.
        self.flush();
        if let Err(e) = self
            .ctx
            .db
            .close_track(self.track_id, now_ms(), reason)
        {
            error!("track {}: failed to close track row: {}", self.track_id, e);
        }

        TrackDone {
            track_id: self.track_id,
            participant: self.participant,
            committed_segments: self.committed,
            failed_segments: self.failed,
        }
    }

    fn flush(&mut self) {
        let Some(batch) = self.buffer.drain() else {
            return;
        };

        let max_attempts = self.ctx.config.max_flush_retries.max(1);
        let base_ms = self.ctx.config.retry_backoff_ms;
        let mut attempt = 0u32;

        let (status, storage_ref, checksum, byte_size) = loop {
            match self.encode_and_store(&batch) {
                Ok((key, crc, size)) => break (SegmentStatus::Committed, key, crc, size),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        warn!(
                            "track {}: flush failed after {} attempts, marking segment failed: {}",
                            self.track_id, attempt, e
                        );
                        // A failed segment still gets a row so the gap in
                        // recall is explainable. Empty storage ref.
                        break (SegmentStatus::Failed, String::new(), 0u32, 0i64);
                    }
                    let backoff = flush_backoff_ms(base_ms, attempt - 1);
                    warn!(
                        "track {}: flush attempt {} failed ({}), retrying in {}ms",
                        self.track_id, attempt, e, backoff
                    );
                    thread::sleep(Duration::from_millis(backoff));
                }
            }
        };

        let segment = NewSegment {
            track_id: self.track_id,
            start_offset_ms: batch.start_offset_ms,
            duration_ms: batch.duration_ms,
            byte_size,
            storage_ref,
            checksum,
            status,
            dropped_frames: batch.dropped_frames as i64,
            gap_ms: batch.gap_ms,
        };
        self.commit_with_retry(&segment);
    }

    fn encode_and_store(&mut self, batch: &FrameBatch) -> Result<(String, u32, i64)> {
        let artifact = self.encoder.encode(&batch.pcm)?;
        let checksum = crc32fast::hash(&artifact);
        // Fresh key per attempt: blob keys are write-once.
        let key = segment_key(self.ctx.channel_id, &self.ctx.session_id, self.track_id);
        self.ctx.blob.put(&key, &artifact)?;
        Ok((key, checksum, artifact.len() as i64))
    }

    fn commit_with_retry(&mut self, segment: &NewSegment) {
        let max_attempts = self.ctx.config.max_flush_retries.max(1);
        let base_ms = self.ctx.config.retry_backoff_ms;
        for attempt in 0..max_attempts {
            match self.ctx.db.insert_segment(segment) {
                Ok(id) => {
                    match segment.status {
                        SegmentStatus::Committed => self.committed += 1,
                        SegmentStatus::Failed => self.failed += 1,
                    }
                    debug!(
                        "track {}: committed segment {} [{} + {}ms, {} bytes, {:?}]",
                        self.track_id,
                        id,
                        segment.start_offset_ms,
                        segment.duration_ms,
                        segment.byte_size,
                        segment.status
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "track {}: segment metadata commit attempt {} failed: {}",
                        self.track_id,
                        attempt + 1,
                        e
                    );
                    thread::sleep(Duration::from_millis(flush_backoff_ms(base_ms, attempt)));
                }
            }
        }
        error!(
            "track {}: giving up on segment metadata commit; audio at '{}' is orphaned",
            self.track_id, segment.storage_ref
        );
        self.failed += 1;
    }
}
