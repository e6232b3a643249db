use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::Subscription;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of reading the persisted record, before any expiry check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Missing,
    Malformed(String),
    Present(Subscription),
}

/// Durable home of the single tracked subscription.
///
/// Writes go to a sibling temp file which is then renamed over the record, so
/// a reader sees either the previous record or the new one, never a mix.
#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    path: PathBuf,
}

impl SubscriptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<StoredRecord, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredRecord::Missing)
            }
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_str::<Subscription>(&raw) {
            Ok(subscription) => Ok(StoredRecord::Present(subscription)),
            Err(error) => {
                warn!(
                    path = %self.path.display(),
                    error = %error,
                    "persisted subscription record is unreadable"
                );
                Ok(StoredRecord::Malformed(error.to_string()))
            }
        }
    }

    /// Reads the record, folding malformed content into `None`.
    pub fn load(&self) -> Result<Option<Subscription>, StoreError> {
        match self.read()? {
            StoredRecord::Present(subscription) => Ok(Some(subscription)),
            StoredRecord::Missing | StoredRecord::Malformed(_) => Ok(None),
        }
    }

    pub fn save(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(subscription)?;

        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "subscription.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = (|| -> Result<(), StoreError> {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&payload)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &self.path)?;
            Ok(())
        })();

        if written.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        written
    }

    /// Removes the record. Returns whether a record existed.
    pub fn remove(&self) -> Result<bool, StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
