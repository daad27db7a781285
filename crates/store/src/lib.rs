use std::path::{Path, PathBuf};

use fedra_contracts::TransitionError;

pub mod audit;
pub mod jobs;
pub mod requests;
pub mod results;

pub use audit::AuditLog;
pub use jobs::JobStore;
pub use requests::{RequestFilter, RequestStore, StateUpdate};
pub use results::ResultStore;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Transition(TransitionError),
    Encode(String),
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record `{}` not found", id),
            StoreError::Transition(err) => write!(f, "{}", err),
            StoreError::Encode(detail) => write!(f, "record encoding failed: {}", detail),
            StoreError::Io(err) => write!(f, "store io error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        StoreError::Io(value)
    }
}

impl From<TransitionError> for StoreError {
    fn from(value: TransitionError) -> Self {
        StoreError::Transition(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Encode(value.to_string())
    }
}

/// Durable single-record write: temp file in the same directory, then rename.
/// Readers observe either the previous or the new record, never a torn one.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Encode("record path has no parent".to_string()))?;

    let tmp: PathBuf = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "record".to_string()),
        ulid::Ulid::new()
    ));

    tokio::fs::write(&tmp, bytes).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(StoreError::Io(err))
        }
    }
}
