use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use fedra_contracts::{ReleasedResult, ResultRecord};
use tokio::io::AsyncWriteExt;

use crate::StoreError;

/// Append-only result rows, one JSONL file per request id under
/// `state/results/`. Row order is `save_results` call order; the last
/// released row is the canonical result for the request.
pub struct ResultStore {
    dir: PathBuf,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResultStore {
    pub fn open(state_root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = state_root.into().join("results");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub async fn append(&self, record: &ResultRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock_for(&record.request_id).lock_owned().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.rows_path(&record.request_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every stored row, blocked ones included. Admin view.
    pub async fn all(&self, request_id: &str) -> Result<Vec<ResultRecord>, StoreError> {
        let contents = match tokio::fs::read_to_string(self.rows_path(request_id)).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(err)),
        };

        let mut rows = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(line)?);
        }
        rows.sort_by_key(|r: &ResultRecord| r.seq);
        Ok(rows)
    }

    /// External view: released rows only, original payloads never included.
    pub async fn released(&self, request_id: &str) -> Result<Vec<ReleasedResult>, StoreError> {
        Ok(self
            .all(request_id)
            .await?
            .iter()
            .filter(|row| row.released)
            .map(|row| row.external())
            .collect())
    }

    pub async fn last_released(&self, request_id: &str) -> Result<Option<ReleasedResult>, StoreError> {
        Ok(self.released(request_id).await?.into_iter().last())
    }

    fn rows_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", request_id))
    }

    fn lock_for(&self, request_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
