use std::path::PathBuf;

use chrono::Utc;
use fedra_contracts::{AuditRecord, RequestState, canonical};
use tokio::io::AsyncWriteExt;

use crate::StoreError;

/// Append-only transition log. One JSON object per line; records are hashed
/// over their canonical form so tampering is detectable after the fact.
/// Nothing is ever rewritten.
pub struct AuditLog {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn record(
        &self,
        request_id: &str,
        prev_state: Option<RequestState>,
        new_state: RequestState,
        actor: &str,
        notes: Option<String>,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let record = AuditRecord {
            ts: Utc::now(),
            request_id: request_id.to_string(),
            prev_state,
            new_state,
            actor: actor.to_string(),
            notes,
            payload_hash: canonical::hash_canonical_json(payload),
        };
        self.append(&record).await
    }

    pub async fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// All records, oldest first. Intended for diagnostics and tests.
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(err)),
        };

        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_are_monotone_and_hashed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("audit.log"));

        let payload = serde_json::json!({"state": "pending"});
        log.record("r1", None, RequestState::Submitted, "system", None, &payload)
            .await
            .expect("append");
        log.record(
            "r1",
            Some(RequestState::Submitted),
            RequestState::Pending,
            "system",
            None,
            &payload,
        )
        .await
        .expect("append");

        let records = log.read_all().await.expect("read");
        assert_eq!(records.len(), 2);
        assert!(records[0].ts <= records[1].ts);
        assert_eq!(records[1].prev_state, Some(RequestState::Submitted));
        assert_eq!(
            records[0].payload_hash,
            canonical::hash_canonical_json(&payload)
        );

        // A third append never disturbs earlier lines.
        let before = tokio::fs::read_to_string(dir.path().join("audit.log"))
            .await
            .expect("read file");
        log.record("r2", None, RequestState::Submitted, "system", None, &payload)
            .await
            .expect("append");
        let after = tokio::fs::read_to_string(dir.path().join("audit.log"))
            .await
            .expect("read file");
        assert!(after.starts_with(&before));
    }
}
