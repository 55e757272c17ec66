use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Tracks;

/// INSERT INTO tracks (session_id, participant_id, joined_at_ms) VALUES (?, ?, ?)
pub fn insert(session_id: &str, participant_id: i64, joined_at_ms: i64) -> String {
    Query::insert()
        .into_table(Tracks::Table)
        .columns([Tracks::SessionId, Tracks::ParticipantId, Tracks::JoinedAtMs])
        .values_panic([session_id.into(), participant_id.into(), joined_at_ms.into()])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE tracks SET left_at_ms = ?, leave_reason = ? WHERE id = ? AND left_at_ms IS NULL
pub fn close(id: i64, left_at_ms: i64, leave_reason: &str) -> String {
    Query::update()
        .table(Tracks::Table)
        .value(Tracks::LeftAtMs, left_at_ms)
        .value(Tracks::LeaveReason, leave_reason)
        .and_where(Expr::col(Tracks::Id).eq(id))
        .and_where(Expr::col(Tracks::LeftAtMs).is_null())
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, session_id, participant_id, joined_at_ms, left_at_ms, leave_reason
/// FROM tracks WHERE session_id = ? ORDER BY id
pub fn select_for_session(session_id: &str) -> String {
    Query::select()
        .columns([
            Tracks::Id,
            Tracks::SessionId,
            Tracks::ParticipantId,
            Tracks::JoinedAtMs,
            Tracks::LeftAtMs,
            Tracks::LeaveReason,
        ])
        .from(Tracks::Table)
        .and_where(Expr::col(Tracks::SessionId).eq(session_id))
        .order_by(Tracks::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
