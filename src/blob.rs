//! Blob store for encoded audio artifacts.
//!
//! A storage reference is an opaque relative key; the filesystem
//! implementation maps it to a path under the archive root.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{CaptureError, Result};

pub trait BlobStore: Send + Sync {
    /// Write an artifact. A key resolves to exactly one artifact; writing
    /// an existing key is a storage failure.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            CaptureError::StorageFailure(format!(
                "failed to create blob root '{}': {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(CaptureError::StorageFailure(format!(
                "invalid storage key '{}'",
                key
            )));
        }
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            return Err(CaptureError::StorageFailure(format!(
                "storage key '{}' already exists",
                key
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        let mut file = File::open(&path).map_err(|e| {
            CaptureError::StorageFailure(format!("artifact '{}' unreadable: {}", key, e))
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Generate a segment storage key: `<channel>/<session>/<track>_<suffix>.ogg`
pub fn segment_key(channel_id: u64, session_id: &str, track_id: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}/{}/{}_{}.ogg", channel_id, session_id, track_id, suffix)
}
