use thiserror::Error;

/// Failure taxonomy for the capture pipeline.
///
/// Per-segment and per-track failures stay isolated; only session
/// finalization inspects them in aggregate.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Dropped, duplicated, or misrouted transport data. Never fatal.
    #[error("transport anomaly: {0}")]
    TransportAnomaly(String),

    /// The encoder collaborator returned an error after retries.
    #[error("encoding failure: {0}")]
    EncodingFailure(String),

    /// Metadata store or blob store failure.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Rejected immediately, never retried (e.g. duplicate start for a
    /// channel that already has an active session).
    #[error("conflict: {0}")]
    ConcurrencyConflict(String),

    /// Privacy settings forbid recording this channel or participant.
    #[error("recording forbidden: {0}")]
    RecordingForbidden(String),
}

impl From<rusqlite::Error> for CaptureError {
    fn from(e: rusqlite::Error) -> Self {
        CaptureError::StorageFailure(e.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::StorageFailure(e.to_string())
    }
}

impl From<opus::Error> for CaptureError {
    fn from(e: opus::Error) -> Self {
        CaptureError::EncodingFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
