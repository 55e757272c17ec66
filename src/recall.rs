//! Recall index: read-side queries over finalized sessions.
//!
//! Resolution maps each committed segment onto the session timeline
//! (offsets relative to the session start, not the track join) and the
//! export paths materialize a participant's audio as chained Ogg or WAV.

use std::io::Write;
use std::sync::Arc;

use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;
use serde::Serialize;

use crate::blob::BlobStore;
use crate::db::{MetadataStore, SegmentStatus, SessionRow, SessionStatus};
use crate::encode::decode_artifact;
use crate::error::{CaptureError, Result};
use crate::transport::ParticipantId;

/// Session-relative half-open window, in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    fn overlaps(&self, offset_ms: i64, duration_ms: i64) -> bool {
        offset_ms < self.end_ms && offset_ms + duration_ms > self.start_ms
    }
}

/// One segment placed on the session timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub participant_id: ParticipantId,
    pub track_id: i64,
    /// Offset from the session start.
    pub offset_ms: i64,
    pub duration_ms: i64,
    pub storage_ref: String,
    pub byte_size: i64,
    pub checksum: u32,
    pub committed: bool,
    pub dropped_frames: i64,
    pub gap_ms: i64,
}

pub struct RecallIndex {
    db: Arc<MetadataStore>,
}

impl RecallIndex {
    pub fn new(db: Arc<MetadataStore>) -> Self {
        Self { db }
    }

    /// Active sessions are invisible to recall; everything from
    /// Finalizing onward only exposes durably committed rows anyway.
    fn recallable_session(&self, session_id: &str) -> Result<SessionRow> {
        let session = self.db.session_by_id(session_id)?.ok_or_else(|| {
            CaptureError::ConcurrencyConflict(format!("unknown session '{}'", session_id))
        })?;
        if session.status == SessionStatus::Active {
            return Err(CaptureError::ConcurrencyConflict(format!(
                "session '{}' is still active; its audio is not yet recallable",
                session_id
            )));
        }
        Ok(session)
    }

    /// Resolve a session into an ordered timeline. Ordered by offset,
    /// then participant id for entries starting together.
    pub fn resolve(
        &self,
        session_id: &str,
        participants: Option<&[ParticipantId]>,
        window: Option<TimeWindow>,
    ) -> Result<Vec<TimelineEntry>> {
        let session = self.recallable_session(session_id)?;

        let mut timeline = Vec::new();
        for track in self.db.tracks_for_session(session_id)? {
            if let Some(wanted) = participants {
                if !wanted.contains(&track.participant_id) {
                    continue;
                }
            }
            let track_offset_ms = track.joined_at_ms - session.started_at_ms;
            for segment in self.db.segments_for_track(track.id)? {
                let offset_ms = track_offset_ms + segment.start_offset_ms;
                if let Some(window) = window {
                    if !window.overlaps(offset_ms, segment.duration_ms) {
                        continue;
                    }
                }
                timeline.push(TimelineEntry {
                    participant_id: track.participant_id,
                    track_id: track.id,
                    offset_ms,
                    duration_ms: segment.duration_ms,
                    storage_ref: segment.storage_ref,
                    byte_size: segment.byte_size,
                    checksum: segment.checksum,
                    committed: segment.status == SegmentStatus::Committed,
                    dropped_frames: segment.dropped_frames,
                    gap_ms: segment.gap_ms,
                });
            }
        }
        timeline.sort_by(|a, b| {
            a.offset_ms
                .cmp(&b.offset_ms)
                .then(a.participant_id.cmp(&b.participant_id))
        });

        debug!(
            "resolved session {} to {} timeline entries",
            session_id,
            timeline.len()
        );
        Ok(timeline)
    }

    /// Sessions whose start falls within the last `window_ms` before
    /// `now_ms`, newest first.
    pub fn sessions_since(&self, now_ms: i64, window_ms: i64) -> Result<Vec<SessionRow>> {
        let cutoff = now_ms - window_ms;
        let mut sessions: Vec<SessionRow> = self
            .db
            .list_sessions()?
            .into_iter()
            .filter(|s| s.started_at_ms >= cutoff)
            .collect();
        sessions.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms));
        Ok(sessions)
    }

    /// Concatenate a participant's committed artifacts into one chained
    /// Ogg stream. Each artifact is already a self-contained logical
    /// stream with its own serial, so plain concatenation plays through.
    pub fn export_ogg(
        &self,
        blob: &dyn BlobStore,
        session_id: &str,
        participant_id: ParticipantId,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let timeline = self.resolve(session_id, Some(&[participant_id]), None)?;
        let mut written = 0u64;
        for entry in timeline.iter().filter(|e| e.committed) {
            let artifact = blob.get(&entry.storage_ref)?;
            out.write_all(&artifact)?;
            written += artifact.len() as u64;
        }
        if written == 0 {
            return Err(CaptureError::StorageFailure(format!(
                "no committed audio for participant {} in session '{}'",
                participant_id, session_id
            )));
        }
        Ok(written)
    }

    /// Decode a participant's timeline to a single WAV, filling the space
    /// between segments (and any failed segments) with silence so offsets
    /// in the output match offsets in the metadata.
    pub fn export_wav<W>(
        &self,
        blob: &dyn BlobStore,
        session_id: &str,
        participant_id: ParticipantId,
        sample_rate: u32,
        out: W,
    ) -> Result<u64>
    where
        W: Write + std::io::Seek,
    {
        let timeline = self.resolve(session_id, Some(&[participant_id]), None)?;
        if timeline.is_empty() {
            return Err(CaptureError::StorageFailure(format!(
                "no audio for participant {} in session '{}'",
                participant_id, session_id
            )));
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::new(out, spec)
            .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;

        let base_ms = timeline[0].offset_ms;
        let mut samples_written = 0u64;
        for entry in &timeline {
            let target = ((entry.offset_ms - base_ms) * sample_rate as i64 / 1000) as u64;
            while samples_written < target {
                writer
                    .write_sample(0i16)
                    .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;
                samples_written += 1;
            }
            if !entry.committed {
                continue;
            }
            let artifact = blob.get(&entry.storage_ref)?;
            for sample in decode_artifact(&artifact, sample_rate)? {
                writer
                    .write_sample(sample)
                    .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;
                samples_written += 1;
            }
        }
        writer
            .finalize()
            .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;
        Ok(samples_written)
    }
}

/// Parse a duration shorthand like "90s", "15m", "2h", "7d" or "1w" into
/// milliseconds.
pub fn parse_shorthand(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    if trimmed.len() < 2 {
        return Err(CaptureError::TransportAnomaly(format!(
            "invalid duration '{}'",
            input
        )));
    }
    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    let value: i64 = digits.parse().map_err(|_| {
        CaptureError::TransportAnomaly(format!("invalid duration '{}'", input))
    })?;
    if value <= 0 {
        return Err(CaptureError::TransportAnomaly(format!(
            "duration '{}' must be positive",
            input
        )));
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        other => {
            return Err(CaptureError::TransportAnomaly(format!(
                "unknown duration unit '{}'",
                other
            )))
        }
    };
    Ok(value * unit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_units() {
        assert_eq!(parse_shorthand("30s").unwrap(), 30_000);
        assert_eq!(parse_shorthand("5m").unwrap(), 300_000);
        assert_eq!(parse_shorthand("2h").unwrap(), 7_200_000);
        assert_eq!(parse_shorthand("1d").unwrap(), 86_400_000);
        assert_eq!(parse_shorthand("1w").unwrap(), 604_800_000);
    }

    #[test]
    fn shorthand_rejects_garbage() {
        assert!(parse_shorthand("").is_err());
        assert!(parse_shorthand("h").is_err());
        assert!(parse_shorthand("10x").is_err());
        assert!(parse_shorthand("-5m").is_err());
        assert!(parse_shorthand("0s").is_err());
    }

    #[test]
    fn window_overlap_is_half_open() {
        let window = TimeWindow {
            start_ms: 1000,
            end_ms: 2000,
        };
        assert!(window.overlaps(500, 600)); // crosses the start
        assert!(window.overlaps(1500, 100)); // inside
        assert!(window.overlaps(1900, 500)); // crosses the end
        assert!(!window.overlaps(0, 1000)); // ends exactly at start
        assert!(!window.overlaps(2000, 100)); // begins exactly at end
    }
}
