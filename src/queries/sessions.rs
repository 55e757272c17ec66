use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Sessions;

/// INSERT INTO sessions (id, channel_id, started_at_ms, status) VALUES (?, ?, ?, ?)
pub fn insert(id: &str, channel_id: i64, started_at_ms: i64, status: &str) -> String {
    Query::insert()
        .into_table(Sessions::Table)
        .columns([
            Sessions::Id,
            Sessions::ChannelId,
            Sessions::StartedAtMs,
            Sessions::Status,
        ])
        .values_panic([
            id.into(),
            channel_id.into(),
            started_at_ms.into(),
            status.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE sessions SET status = ? WHERE id = ?
pub fn update_status(id: &str, status: &str) -> String {
    Query::update()
        .table(Sessions::Table)
        .value(Sessions::Status, status)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE sessions SET status = ?, ended_at_ms = ? WHERE id = ? AND ended_at_ms IS NULL
///
/// The null guard keeps session finalization a one-shot operation.
pub fn finalize(id: &str, status: &str, ended_at_ms: i64) -> String {
    Query::update()
        .table(Sessions::Table)
        .value(Sessions::Status, status)
        .value(Sessions::EndedAtMs, ended_at_ms)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .and_where(Expr::col(Sessions::EndedAtMs).is_null())
        .to_string(SqliteQueryBuilder)
}

/// SELECT status FROM sessions WHERE id = ?
pub fn select_status(id: &str) -> String {
    Query::select()
        .column(Sessions::Status)
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, channel_id, started_at_ms, ended_at_ms, status FROM sessions WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns([
            Sessions::Id,
            Sessions::ChannelId,
            Sessions::StartedAtMs,
            Sessions::EndedAtMs,
            Sessions::Status,
        ])
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT id FROM sessions WHERE channel_id = ? AND status IN ('active', 'finalizing')
pub fn select_live_for_channel(channel_id: i64) -> String {
    Query::select()
        .column(Sessions::Id)
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::ChannelId).eq(channel_id))
        .and_where(Expr::col(Sessions::Status).is_in(["active", "finalizing"]))
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, channel_id, started_at_ms, ended_at_ms, status FROM sessions ORDER BY started_at_ms
pub fn select_all() -> String {
    Query::select()
        .columns([
            Sessions::Id,
            Sessions::ChannelId,
            Sessions::StartedAtMs,
            Sessions::EndedAtMs,
            Sessions::Status,
        ])
        .from(Sessions::Table)
        .order_by(Sessions::StartedAtMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
