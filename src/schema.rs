use sea_query::Iden;

/// Sessions table - one row per capture activation in a channel
#[derive(Iden)]
pub enum Sessions {
    Table,
    Id,
    ChannelId,
    StartedAtMs,
    EndedAtMs,
    Status,
}

/// Tracks table - one participant's contribution within a session
#[derive(Iden)]
pub enum Tracks {
    Table,
    Id,
    SessionId,
    ParticipantId,
    JoinedAtMs,
    LeftAtMs,
    LeaveReason,
}

/// Segments table - immutable encoded artifacts covering a track time range
#[derive(Iden)]
pub enum Segments {
    Table,
    Id,
    TrackId,
    StartOffsetMs,
    DurationMs,
    ByteSize,
    StorageRef,
    Checksum,
    Status,
    DroppedFrames,
    GapMs,
}

/// Participants table - per-participant privacy settings
#[derive(Iden)]
pub enum Participants {
    Table,
    ParticipantId,
    CanRecord,
}

/// Channels table - per-channel privacy settings
#[derive(Iden)]
pub enum Channels {
    Table,
    ChannelId,
    CanRecord,
}
