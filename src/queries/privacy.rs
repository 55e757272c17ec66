use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};

use crate::schema::{Channels, Participants};

/// SELECT can_record FROM participants WHERE participant_id = ?
pub fn select_participant(participant_id: i64) -> String {
    Query::select()
        .column(Participants::CanRecord)
        .from(Participants::Table)
        .and_where(Expr::col(Participants::ParticipantId).eq(participant_id))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO participants (participant_id, can_record) VALUES (?, ?)
/// ON CONFLICT (participant_id) DO UPDATE SET can_record = excluded.can_record
pub fn upsert_participant(participant_id: i64, can_record: bool) -> String {
    Query::insert()
        .into_table(Participants::Table)
        .columns([Participants::ParticipantId, Participants::CanRecord])
        .values_panic([participant_id.into(), (can_record as i32).into()])
        .on_conflict(
            OnConflict::column(Participants::ParticipantId)
                .update_column(Participants::CanRecord)
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT can_record FROM channels WHERE channel_id = ?
pub fn select_channel(channel_id: i64) -> String {
    Query::select()
        .column(Channels::CanRecord)
        .from(Channels::Table)
        .and_where(Expr::col(Channels::ChannelId).eq(channel_id))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO channels (channel_id, can_record) VALUES (?, ?)
/// ON CONFLICT (channel_id) DO UPDATE SET can_record = excluded.can_record
pub fn upsert_channel(channel_id: i64, can_record: bool) -> String {
    Query::insert()
        .into_table(Channels::Table)
        .columns([Channels::ChannelId, Channels::CanRecord])
        .values_panic([channel_id.into(), (can_record as i32).into()])
        .on_conflict(
            OnConflict::column(Channels::ChannelId)
                .update_column(Channels::CanRecord)
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}
