use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{Channels, Participants, Segments, Sessions, Tracks};

/// CREATE TABLE IF NOT EXISTS sessions (
///     id TEXT PRIMARY KEY,
///     channel_id INTEGER NOT NULL,
///     started_at_ms INTEGER NOT NULL,
///     ended_at_ms INTEGER,
///     status TEXT NOT NULL
/// )
pub fn create_sessions_table() -> String {
    Table::create()
        .table(Sessions::Table)
        .if_not_exists()
        .col(ColumnDef::new(Sessions::Id).string().primary_key())
        .col(ColumnDef::new(Sessions::ChannelId).big_integer().not_null())
        .col(
            ColumnDef::new(Sessions::StartedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Sessions::EndedAtMs).big_integer())
        .col(ColumnDef::new(Sessions::Status).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS tracks (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
///     participant_id INTEGER NOT NULL,
///     joined_at_ms INTEGER NOT NULL,
///     left_at_ms INTEGER,
///     leave_reason TEXT
/// )
pub fn create_tracks_table() -> String {
    Table::create()
        .table(Tracks::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Tracks::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Tracks::SessionId).string().not_null())
        .col(
            ColumnDef::new(Tracks::ParticipantId)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Tracks::JoinedAtMs).big_integer().not_null())
        .col(ColumnDef::new(Tracks::LeftAtMs).big_integer())
        .col(ColumnDef::new(Tracks::LeaveReason).string())
        .foreign_key(
            ForeignKey::create()
                .from(Tracks::Table, Tracks::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS segments (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     track_id INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
///     start_offset_ms INTEGER NOT NULL,
///     duration_ms INTEGER NOT NULL,
///     byte_size INTEGER NOT NULL,
///     storage_ref TEXT NOT NULL,
///     checksum INTEGER NOT NULL,
///     status TEXT NOT NULL,
///     dropped_frames INTEGER NOT NULL DEFAULT 0,
///     gap_ms INTEGER NOT NULL DEFAULT 0
/// )
pub fn create_segments_table() -> String {
    Table::create()
        .table(Segments::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Segments::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(Segments::TrackId).big_integer().not_null())
        .col(
            ColumnDef::new(Segments::StartOffsetMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Segments::DurationMs).big_integer().not_null())
        .col(ColumnDef::new(Segments::ByteSize).big_integer().not_null())
        .col(ColumnDef::new(Segments::StorageRef).string().not_null())
        .col(ColumnDef::new(Segments::Checksum).big_integer().not_null())
        .col(ColumnDef::new(Segments::Status).string().not_null())
        .col(
            ColumnDef::new(Segments::DroppedFrames)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(Segments::GapMs)
                .big_integer()
                .not_null()
                .default(0),
        )
        .foreign_key(
            ForeignKey::create()
                .from(Segments::Table, Segments::TrackId)
                .to(Tracks::Table, Tracks::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS participants (
///     participant_id INTEGER PRIMARY KEY,
///     can_record INTEGER NOT NULL DEFAULT 1
/// )
pub fn create_participants_table() -> String {
    Table::create()
        .table(Participants::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Participants::ParticipantId)
                .big_integer()
                .primary_key(),
        )
        .col(
            ColumnDef::new(Participants::CanRecord)
                .integer()
                .not_null()
                .default(1),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS channels (
///     channel_id INTEGER PRIMARY KEY,
///     can_record INTEGER NOT NULL DEFAULT 1
/// )
pub fn create_channels_table() -> String {
    Table::create()
        .table(Channels::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Channels::ChannelId)
                .big_integer()
                .primary_key(),
        )
        .col(
            ColumnDef::new(Channels::CanRecord)
                .integer()
                .not_null()
                .default(1),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_sessions_channel_status ON sessions(channel_id, status)
pub fn create_sessions_channel_status_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_sessions_channel_status")
        .table(Sessions::Table)
        .col(Sessions::ChannelId)
        .col(Sessions::Status)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_tracks_session ON tracks(session_id)
pub fn create_tracks_session_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_tracks_session")
        .table(Tracks::Table)
        .col(Tracks::SessionId)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_segments_track ON segments(track_id, start_offset_ms)
pub fn create_segments_track_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_segments_track")
        .table(Segments::Table)
        .col(Segments::TrackId)
        .col(Segments::StartOffsetMs)
        .to_string(SqliteQueryBuilder)
}
