use sea_query::{Expr, Func, Order, Query, SqliteQueryBuilder};

use crate::schema::Segments;

/// INSERT INTO segments (track_id, start_offset_ms, duration_ms, byte_size,
/// storage_ref, checksum, status, dropped_frames, gap_ms) VALUES (...)
#[allow(clippy::too_many_arguments)]
pub fn insert(
    track_id: i64,
    start_offset_ms: i64,
    duration_ms: i64,
    byte_size: i64,
    storage_ref: &str,
    checksum: i64,
    status: &str,
    dropped_frames: i64,
    gap_ms: i64,
) -> String {
    Query::insert()
        .into_table(Segments::Table)
        .columns([
            Segments::TrackId,
            Segments::StartOffsetMs,
            Segments::DurationMs,
            Segments::ByteSize,
            Segments::StorageRef,
            Segments::Checksum,
            Segments::Status,
            Segments::DroppedFrames,
            Segments::GapMs,
        ])
        .values_panic([
            track_id.into(),
            start_offset_ms.into(),
            duration_ms.into(),
            byte_size.into(),
            storage_ref.into(),
            checksum.into(),
            status.into(),
            dropped_frames.into(),
            gap_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, track_id, start_offset_ms, duration_ms, byte_size, storage_ref,
/// checksum, status, dropped_frames, gap_ms
/// FROM segments WHERE track_id = ? ORDER BY start_offset_ms
pub fn select_for_track(track_id: i64) -> String {
    Query::select()
        .columns([
            Segments::Id,
            Segments::TrackId,
            Segments::StartOffsetMs,
            Segments::DurationMs,
            Segments::ByteSize,
            Segments::StorageRef,
            Segments::Checksum,
            Segments::Status,
            Segments::DroppedFrames,
            Segments::GapMs,
        ])
        .from(Segments::Table)
        .and_where(Expr::col(Segments::TrackId).eq(track_id))
        .order_by(Segments::StartOffsetMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM segments
/// JOIN tracks ON segments.track_id = tracks.id
/// WHERE tracks.session_id = ? AND segments.status = 'committed'
pub fn count_committed_for_session(session_id: &str) -> String {
    use crate::schema::Tracks;
    Query::select()
        .expr(Func::count(Expr::col((Segments::Table, Segments::Id))))
        .from(Segments::Table)
        .inner_join(
            Tracks::Table,
            Expr::col((Segments::Table, Segments::TrackId))
                .equals((Tracks::Table, Tracks::Id)),
        )
        .and_where(Expr::col((Tracks::Table, Tracks::SessionId)).eq(session_id))
        .and_where(Expr::col((Segments::Table, Segments::Status)).eq("committed"))
        .to_string(SqliteQueryBuilder)
}
