//! Per-participant frame buffer with gap fill and backpressure.
//!
//! Owned by a single segment writer thread; the demultiplexer never
//! touches it directly (frames arrive over the track's channel).

use std::collections::VecDeque;

/// One timestamped chunk of mono PCM for a participant. In-memory only.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub sequence: u32,
    pub timestamp_ms: i64,
    pub pcm: Vec<i16>,
}

/// Everything drained since the last flush, concatenated in sequence
/// order with silence filled in for detected gaps.
#[derive(Debug)]
pub struct FrameBatch {
    /// Offset of the batch start from the track's join time.
    pub start_offset_ms: i64,
    pub duration_ms: i64,
    pub pcm: Vec<i16>,
    /// Frames lost to overload since the previous drain.
    pub dropped_frames: u64,
    /// Total silence inserted for sequence gaps in this batch.
    pub gap_ms: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Buffered duration crossed the threshold; flush now.
    NeedsFlush,
    /// Stale or duplicate sequence number; the frame was discarded.
    Rejected,
}

pub struct ParticipantBuffer {
    frames: VecDeque<RawFrame>,
    expected_seq: Option<u32>,
    buffered_ms: i64,
    /// Track-relative offset where the next drained batch starts.
    cursor_ms: i64,
    dropped: u64,
    gap_ms: i64,
    sample_rate: u32,
    packet_interval_ms: i64,
    samples_per_packet: usize,
    max_buffered_ms: i64,
}

impl ParticipantBuffer {
    pub fn new(sample_rate: u32, packet_interval_ms: i64, max_buffered_ms: i64) -> Self {
        Self {
            frames: VecDeque::new(),
            expected_seq: None,
            buffered_ms: 0,
            cursor_ms: 0,
            dropped: 0,
            gap_ms: 0,
            sample_rate,
            packet_interval_ms,
            samples_per_packet: (sample_rate as i64 * packet_interval_ms / 1000) as usize,
            max_buffered_ms,
        }
    }

    fn frame_duration_ms(&self, frame: &RawFrame) -> i64 {
        frame.pcm.len() as i64 * 1000 / self.sample_rate as i64
    }

    /// Accept a frame in arrival order. Fills sequence gaps with silence
    /// of the implied duration so the track timeline stays aligned.
    ///
    /// Fill is bounded by the hard cap: a gap larger than the cap would
    /// be shed straight back out, so the excess is skipped by advancing
    /// the cursor and counted as dropped instead of materialized.
    pub fn push(&mut self, frame: RawFrame) -> PushOutcome {
        if let Some(expected) = self.expected_seq {
            if frame.sequence < expected {
                return PushOutcome::Rejected;
            }
            let missing = (frame.sequence - expected) as u64;
            let fill_limit =
                (self.max_buffered_ms * 2 / self.packet_interval_ms) as u64;
            let fill_limit = fill_limit.saturating_sub(1);
            if missing > fill_limit {
                // Everything buffered predates the jump and would be shed
                // by the cap anyway; drop it now so the skip stays at the
                // front of the next batch where the cursor can express it.
                while let Some(old) = self.frames.pop_front() {
                    let dur = self.frame_duration_ms(&old);
                    self.buffered_ms -= dur;
                    self.cursor_ms += dur;
                    self.dropped += 1;
                }
                let skipped = missing - fill_limit;
                self.cursor_ms += skipped as i64 * self.packet_interval_ms;
                self.dropped += skipped;
            }
            let fill = missing.min(fill_limit) as u32;
            for i in 0..fill {
                let silence = RawFrame {
                    sequence: frame.sequence - fill + i,
                    timestamp_ms: frame.timestamp_ms,
                    pcm: vec![0i16; self.samples_per_packet],
                };
                self.buffered_ms += self.packet_interval_ms;
                self.gap_ms += self.packet_interval_ms;
                self.frames.push_back(silence);
            }
        }
        self.expected_seq = Some(frame.sequence + 1);
        self.buffered_ms += self.frame_duration_ms(&frame);
        self.frames.push_back(frame);

        // Hard cap: shed oldest frames rather than grow unbounded. The
        // shed time advances the cursor so later segments stay aligned.
        while self.buffered_ms > self.max_buffered_ms * 2 {
            if let Some(old) = self.frames.pop_front() {
                let dur = self.frame_duration_ms(&old);
                self.buffered_ms -= dur;
                self.cursor_ms += dur;
                self.dropped += 1;
            } else {
                break;
            }
        }

        if self.buffered_ms >= self.max_buffered_ms {
            PushOutcome::NeedsFlush
        } else {
            PushOutcome::Buffered
        }
    }

    /// Record a frame lost before it ever reached this buffer (e.g. the
    /// track channel was full).
    pub fn note_dropped(&mut self, count: u64) {
        self.dropped += count;
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn buffered_ms(&self) -> i64 {
        self.buffered_ms
    }

    /// Snapshot and clear everything buffered since the last drain.
    pub fn drain(&mut self) -> Option<FrameBatch> {
        if self.frames.is_empty() {
            return None;
        }

        let mut pcm = Vec::with_capacity(
            self.frames.iter().map(|f| f.pcm.len()).sum::<usize>(),
        );
        for frame in self.frames.drain(..) {
            pcm.extend_from_slice(&frame.pcm);
        }
        let duration_ms = pcm.len() as i64 * 1000 / self.sample_rate as i64;

        let batch = FrameBatch {
            start_offset_ms: self.cursor_ms,
            duration_ms,
            pcm,
            dropped_frames: self.dropped,
            gap_ms: self.gap_ms,
        };

        self.cursor_ms += duration_ms;
        self.buffered_ms = 0;
        self.dropped = 0;
        self.gap_ms = 0;

        Some(batch)
    }
}
