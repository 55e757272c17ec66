//! Metadata store: SQLite behind a single locked connection.
//!
//! Every write is one atomic statement; no transaction ever spans more
//! than one Session/Track/Segment record, so concurrent segment writers
//! for different tracks never contend on the same row.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use log::debug;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{CaptureError, Result};
use crate::queries;
use crate::transport::{ChannelId, ParticipantId};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Finalizing,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "finalizing" => Ok(SessionStatus::Finalizing),
            "closed" => Ok(SessionStatus::Closed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(CaptureError::StorageFailure(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

/// Why a track stopped receiving audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The participant left the channel.
    Natural,
    /// The session ended (stop command or transport loss) while the
    /// participant was still present.
    Disconnected,
    /// The track was force-closed after the finalize timeout.
    TimedOut,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Natural => "natural",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::TimedOut => "timed_out",
        }
    }
}

/// Segment commit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Committed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Committed => "committed",
            SegmentStatus::Failed => "failed",
        }
    }
}

impl FromStr for SegmentStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "committed" => Ok(SegmentStatus::Committed),
            "failed" => Ok(SegmentStatus::Failed),
            other => Err(CaptureError::StorageFailure(format!(
                "unknown segment status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub channel_id: ChannelId,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct TrackRow {
    pub id: i64,
    pub session_id: String,
    pub participant_id: ParticipantId,
    pub joined_at_ms: i64,
    pub left_at_ms: Option<i64>,
    pub leave_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SegmentRow {
    pub id: i64,
    pub track_id: i64,
    /// Offset from the track's join timestamp.
    pub start_offset_ms: i64,
    pub duration_ms: i64,
    pub byte_size: i64,
    pub storage_ref: String,
    pub checksum: u32,
    pub status: SegmentStatus,
    pub dropped_frames: i64,
    pub gap_ms: i64,
}

/// A segment about to be committed.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub track_id: i64,
    pub start_offset_ms: i64,
    pub duration_ms: i64,
    pub byte_size: i64,
    pub storage_ref: String,
    pub checksum: u32,
    pub status: SegmentStatus,
    pub dropped_frames: i64,
    pub gap_ms: i64,
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (or create) the archive database. Enables WAL mode and
    /// foreign keys.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        for sql in [
            queries::ddl::create_sessions_table(),
            queries::ddl::create_tracks_table(),
            queries::ddl::create_segments_table(),
            queries::ddl::create_participants_table(),
            queries::ddl::create_channels_table(),
            queries::ddl::create_sessions_channel_status_index(),
            queries::ddl::create_tracks_session_index(),
            queries::ddl::create_segments_track_index(),
        ] {
            conn.execute(&sql, [])?;
        }
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a writer panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- sessions ---

    pub fn insert_session(
        &self,
        id: &str,
        channel_id: ChannelId,
        started_at_ms: i64,
    ) -> Result<()> {
        let sql = queries::sessions::insert(
            id,
            channel_id as i64,
            started_at_ms,
            SessionStatus::Active.as_str(),
        );
        self.conn().execute(&sql, [])?;
        debug!("opened session {} in channel {}", id, channel_id);
        Ok(())
    }

    pub fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let sql = queries::sessions::update_status(id, status.as_str());
        self.conn().execute(&sql, [])?;
        Ok(())
    }

    /// Commit the terminal status and end timestamp. A no-op if the
    /// session was already finalized.
    pub fn finalize_session(
        &self,
        id: &str,
        status: SessionStatus,
        ended_at_ms: i64,
    ) -> Result<()> {
        let sql = queries::sessions::finalize(id, status.as_str(), ended_at_ms);
        let updated = self.conn().execute(&sql, [])?;
        if updated > 0 {
            debug!("finalized session {} as {}", id, status);
        }
        Ok(())
    }

    pub fn session_status(&self, id: &str) -> Result<Option<SessionStatus>> {
        let sql = queries::sessions::select_status(id);
        let conn = self.conn();
        let status: Option<String> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        status.map(|s| s.parse()).transpose()
    }

    pub fn session_by_id(&self, id: &str) -> Result<Option<SessionRow>> {
        let sql = queries::sessions::select_by_id(id);
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([], session_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Id of a live (active or finalizing) session in the channel, if any.
    pub fn live_session_for_channel(&self, channel_id: ChannelId) -> Result<Option<String>> {
        let sql = queries::sessions::select_live_for_channel(channel_id as i64);
        let conn = self.conn();
        conn.query_row(&sql, [], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let sql = queries::sessions::select_all();
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], session_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // --- tracks ---

    pub fn insert_track(
        &self,
        session_id: &str,
        participant_id: ParticipantId,
        joined_at_ms: i64,
    ) -> Result<i64> {
        let sql = queries::tracks::insert(session_id, participant_id as i64, joined_at_ms);
        let conn = self.conn();
        conn.execute(&sql, [])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn close_track(&self, track_id: i64, left_at_ms: i64, reason: LeaveReason) -> Result<()> {
        let sql = queries::tracks::close(track_id, left_at_ms, reason.as_str());
        self.conn().execute(&sql, [])?;
        Ok(())
    }

    pub fn tracks_for_session(&self, session_id: &str) -> Result<Vec<TrackRow>> {
        let sql = queries::tracks::select_for_session(session_id);
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(TrackRow {
                id: row.get(0)?,
                session_id: row.get(1)?,
                participant_id: row.get::<_, i64>(2)? as ParticipantId,
                joined_at_ms: row.get(3)?,
                left_at_ms: row.get(4)?,
                leave_reason: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // --- segments ---

    pub fn insert_segment(&self, seg: &NewSegment) -> Result<i64> {
        let sql = queries::segments::insert(
            seg.track_id,
            seg.start_offset_ms,
            seg.duration_ms,
            seg.byte_size,
            &seg.storage_ref,
            seg.checksum as i64,
            seg.status.as_str(),
            seg.dropped_frames,
            seg.gap_ms,
        );
        let conn = self.conn();
        conn.execute(&sql, [])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn segments_for_track(&self, track_id: i64) -> Result<Vec<SegmentRow>> {
        let sql = queries::segments::select_for_track(track_id);
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(SegmentRow {
                id: row.get(0)?,
                track_id: row.get(1)?,
                start_offset_ms: row.get(2)?,
                duration_ms: row.get(3)?,
                byte_size: row.get(4)?,
                storage_ref: row.get(5)?,
                checksum: row.get::<_, i64>(6)? as u32,
                status: row
                    .get::<_, String>(7)?
                    .parse()
                    .unwrap_or(SegmentStatus::Failed),
                dropped_frames: row.get(8)?,
                gap_ms: row.get(9)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn committed_segment_count(&self, session_id: &str) -> Result<i64> {
        let sql = queries::segments::count_committed_for_session(session_id);
        let conn = self.conn();
        conn.query_row(&sql, [], |row| row.get(0)).map_err(Into::into)
    }

    // --- privacy ---

    /// Whether this participant may be recorded. Unknown participants are
    /// recordable; they cannot have opted out yet.
    pub fn participant_can_record(&self, participant_id: ParticipantId) -> Result<bool> {
        let sql = queries::privacy::select_participant(participant_id as i64);
        let conn = self.conn();
        let flag: Option<i64> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        Ok(flag.map(|v| v != 0).unwrap_or(true))
    }

    pub fn set_participant_can_record(
        &self,
        participant_id: ParticipantId,
        can_record: bool,
    ) -> Result<()> {
        let sql = queries::privacy::upsert_participant(participant_id as i64, can_record);
        self.conn().execute(&sql, [])?;
        Ok(())
    }

    pub fn channel_can_record(&self, channel_id: ChannelId) -> Result<bool> {
        let sql = queries::privacy::select_channel(channel_id as i64);
        let conn = self.conn();
        let flag: Option<i64> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        Ok(flag.map(|v| v != 0).unwrap_or(true))
    }

    pub fn set_channel_can_record(&self, channel_id: ChannelId, can_record: bool) -> Result<()> {
        let sql = queries::privacy::upsert_channel(channel_id as i64, can_record);
        self.conn().execute(&sql, [])?;
        Ok(())
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        channel_id: row.get::<_, i64>(1)? as ChannelId,
        started_at_ms: row.get(2)?,
        ended_at_ms: row.get(3)?,
        status: row
            .get::<_, String>(4)?
            .parse()
            .unwrap_or(SessionStatus::Failed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle_round_trip() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.insert_session("s1", 42, 1000).unwrap();
        assert_eq!(
            store.session_status("s1").unwrap(),
            Some(SessionStatus::Active)
        );
        assert_eq!(store.live_session_for_channel(42).unwrap(), Some("s1".into()));

        store
            .update_session_status("s1", SessionStatus::Finalizing)
            .unwrap();
        store
            .finalize_session("s1", SessionStatus::Closed, 6000)
            .unwrap();
        let row = store.session_by_id("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Closed);
        assert_eq!(row.ended_at_ms, Some(6000));
        assert_eq!(store.live_session_for_channel(42).unwrap(), None);
    }

    #[test]
    fn finalize_is_one_shot() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.insert_session("s1", 42, 1000).unwrap();
        store
            .finalize_session("s1", SessionStatus::Closed, 6000)
            .unwrap();
        // A later finalize must not overwrite the terminal record.
        store
            .finalize_session("s1", SessionStatus::Failed, 9999)
            .unwrap();
        let row = store.session_by_id("s1").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Closed);
        assert_eq!(row.ended_at_ms, Some(6000));
    }

    #[test]
    fn tracks_and_segments_belong_to_sessions() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.insert_session("s1", 7, 0).unwrap();
        let track_id = store.insert_track("s1", 1001, 100).unwrap();
        store
            .insert_segment(&NewSegment {
                track_id,
                start_offset_ms: 0,
                duration_ms: 2000,
                byte_size: 512,
                storage_ref: "7/s1/seg_a.ogg".into(),
                checksum: 0xDEADBEEF,
                status: SegmentStatus::Committed,
                dropped_frames: 0,
                gap_ms: 40,
            })
            .unwrap();

        let tracks = store.tracks_for_session("s1").unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].participant_id, 1001);

        let segments = store.segments_for_track(track_id).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].checksum, 0xDEADBEEF);
        assert_eq!(segments[0].gap_ms, 40);
        assert_eq!(store.committed_segment_count("s1").unwrap(), 1);
    }

    #[test]
    fn lookup_failures_are_not_missing_rows() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert_eq!(store.session_status("nope").unwrap(), None);
        assert_eq!(store.live_session_for_channel(1).unwrap(), None);

        // A broken schema must surface as a storage failure, not as
        // "no such row".
        store.conn().execute("DROP TABLE segments", []).unwrap();
        store.conn().execute("DROP TABLE tracks", []).unwrap();
        store.conn().execute("DROP TABLE sessions", []).unwrap();
        store.conn().execute("DROP TABLE participants", []).unwrap();
        assert!(matches!(
            store.session_status("nope"),
            Err(CaptureError::StorageFailure(_))
        ));
        assert!(matches!(
            store.live_session_for_channel(1),
            Err(CaptureError::StorageFailure(_))
        ));
        assert!(matches!(
            store.participant_can_record(1),
            Err(CaptureError::StorageFailure(_))
        ));
    }

    #[test]
    fn privacy_defaults_to_recordable() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert!(store.participant_can_record(5).unwrap());
        store.set_participant_can_record(5, false).unwrap();
        assert!(!store.participant_can_record(5).unwrap());
        store.set_participant_can_record(5, true).unwrap();
        assert!(store.participant_can_record(5).unwrap());

        assert!(store.channel_can_record(9).unwrap());
        store.set_channel_can_record(9, false).unwrap();
        assert!(!store.channel_can_record(9).unwrap());
    }
}
