use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{CaptureError, Result};

fn default_sample_rate() -> u32 {
    48000
}

fn default_bitrate_kbps() -> u32 {
    24
}

fn default_packet_interval_ms() -> i64 {
    20
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_buffer_max_ms() -> i64 {
    3_000
}

fn default_max_flush_retries() -> u32 {
    4
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archive")
}

/// Capture pipeline configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// PCM sample rate of inbound frames. Must be an Opus rate
    /// (8000/12000/16000/24000/48000).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Opus bitrate in kbps.
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    /// Duration implied by one transport packet. Sequence gaps are filled
    /// with this much silence per missing packet.
    #[serde(default = "default_packet_interval_ms")]
    pub packet_interval_ms: i64,
    /// Periodic flush interval per track. Bounds segment length.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Buffered duration threshold that forces an immediate flush.
    /// Twice this value is the hard cap beyond which frames are dropped
    /// oldest-first.
    #[serde(default = "default_buffer_max_ms")]
    pub buffer_max_ms: i64,
    /// Encode/store attempts per segment before it is marked failed.
    #[serde(default = "default_max_flush_retries")]
    pub max_flush_retries: u32,
    /// Base backoff between flush attempts (doubles per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long stop() waits for in-flight flushes before force-closing
    /// the remaining tracks.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Root directory holding the metadata database and audio artifacts.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            bitrate_kbps: default_bitrate_kbps(),
            packet_interval_ms: default_packet_interval_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            buffer_max_ms: default_buffer_max_ms(),
            max_flush_retries: default_max_flush_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            archive_dir: default_archive_dir(),
        }
    }
}

impl CaptureConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::StorageFailure(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: CaptureConfig = toml::from_str(&content).map_err(|e| {
            CaptureError::StorageFailure(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];
        if !OPUS_RATES.contains(&self.sample_rate) {
            return Err(CaptureError::EncodingFailure(format!(
                "sample rate {} is not a valid Opus rate",
                self.sample_rate
            )));
        }
        if self.packet_interval_ms <= 0 {
            return Err(CaptureError::TransportAnomaly(
                "packet_interval_ms must be positive".to_string(),
            ));
        }
        if self.buffer_max_ms < self.packet_interval_ms {
            return Err(CaptureError::TransportAnomaly(
                "buffer_max_ms must cover at least one packet interval".to_string(),
            ));
        }
        Ok(())
    }
}
