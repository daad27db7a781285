use std::path::PathBuf;

use fedra_contracts::JobRecord;

use crate::{StoreError, write_atomic};

/// One frozen JSON record per job under `state/jobs/`. Records are written by
/// the owning supervisor only; after the terminal write nothing mutates them.
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn open(state_root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = state_root.into().join("jobs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.dir.join(format!("{}.json", record.id)), &bytes).await
    }

    pub async fn get(&self, id: &str) -> Result<JobRecord, StoreError> {
        let path = self.dir.join(format!("{}.json", id));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fedra_contracts::JobStatus;

    #[tokio::test]
    async fn put_get_round_trip_and_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(dir.path()).expect("open");

        let record = JobRecord {
            id: "job-1".to_string(),
            request_id: "r1".to_string(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            signal: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            artifact_path: None,
            records_processed: None,
            error: None,
        };
        store.put(&record).await.expect("put");

        let loaded = store.get("job-1").await.expect("get");
        assert_eq!(loaded, record);
        assert_eq!(store.count().await.expect("count"), 1);

        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
