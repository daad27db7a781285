use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fedra_contracts::{AnalysisRequest, DecisionRecord, RequestState, transition};

use crate::{AuditLog, StoreError, write_atomic};

/// Attributed state change. `decision` and `job_id` are written onto the
/// record when present.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub new_state: RequestState,
    pub decision: Option<DecisionRecord>,
    pub job_id: Option<String>,
    pub actor: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub state: Option<RequestState>,
    pub requester_email: Option<String>,
    pub catalog_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// One durable JSON record per request id under `state/requests/`.
///
/// All mutations for a given id run under that id's async mutex, so readers
/// observe either the pre- or post-state of an update. Requests are never
/// deleted.
pub struct RequestStore {
    dir: PathBuf,
    audit: Arc<AuditLog>,
    pending_ttl: Option<Duration>,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RequestStore {
    pub fn open(
        state_root: impl Into<PathBuf>,
        audit: Arc<AuditLog>,
        pending_ttl: Option<std::time::Duration>,
    ) -> Result<Self, StoreError> {
        let dir = state_root.into().join("requests");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            audit,
            pending_ttl: pending_ttl.and_then(|ttl| Duration::from_std(ttl).ok()),
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Persists a freshly submitted request. The record lands in `pending`
    /// (submission → pending is automatic) and both steps are audited.
    pub async fn create(&self, request: AnalysisRequest) -> Result<AnalysisRequest, StoreError> {
        let mut request = request;
        request.state = RequestState::Pending;

        let _guard = self.lock_for(&request.id).lock_owned().await;
        self.persist(&request).await?;

        let payload = serde_json::to_value(&request)?;
        self.audit
            .record(&request.id, None, RequestState::Submitted, "system", None, &payload)
            .await?;
        self.audit
            .record(
                &request.id,
                Some(RequestState::Submitted),
                RequestState::Pending,
                "system",
                None,
                &payload,
            )
            .await?;

        Ok(request)
    }

    pub async fn get(&self, id: &str) -> Result<AnalysisRequest, StoreError> {
        let request = self.read(id).await?;
        self.apply_expiry(request).await
    }

    pub async fn list(&self, filter: &RequestFilter) -> Result<Vec<AnalysisRequest>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut requests = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(id).await {
                Ok(request) => requests.push(request),
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => {
                    tracing::warn!(request_id = %id, error = %err, "skipping unreadable request");
                }
            }
        }

        requests.retain(|r| {
            filter.state.is_none_or(|s| r.state == s)
                && filter
                    .requester_email
                    .as_deref()
                    .is_none_or(|email| r.requester.email == email)
                && filter
                    .catalog_id
                    .as_deref()
                    .is_none_or(|catalog| r.catalog_id == catalog)
                && filter.since.is_none_or(|since| r.created_at >= since)
        });
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            requests.truncate(limit);
        }

        Ok(requests)
    }

    /// Applies a state transition under the per-id lock. Expiry is applied
    /// first, so deciding a stale pending request fails with the transition
    /// error from the terminal `expired` state.
    pub async fn update_state(
        &self,
        id: &str,
        update: StateUpdate,
    ) -> Result<AnalysisRequest, StoreError> {
        let _guard = self.lock_for(id).lock_owned().await;

        let request = self.read(id).await?;
        let mut request = self.expire_locked(request).await?;

        let prev = request.state;
        transition(prev, update.new_state)?;

        request.state = update.new_state;
        request.updated_at = Utc::now();
        if let Some(decision) = update.decision {
            request.decision = Some(decision);
        }
        if let Some(job_id) = update.job_id {
            request.job_id = Some(job_id);
        }

        self.persist(&request).await?;

        let payload = serde_json::to_value(&request)?;
        self.audit
            .record(
                id,
                Some(prev),
                update.new_state,
                &update.actor,
                update.notes,
                &payload,
            )
            .await?;

        Ok(request)
    }

    async fn apply_expiry(&self, request: AnalysisRequest) -> Result<AnalysisRequest, StoreError> {
        if !self.is_expired(&request) {
            return Ok(request);
        }

        // Re-read under the lock: another touch may have expired it already.
        let _guard = self.lock_for(&request.id).lock_owned().await;
        let request = self.read(&request.id).await?;
        self.expire_locked(request).await
    }

    async fn expire_locked(
        &self,
        mut request: AnalysisRequest,
    ) -> Result<AnalysisRequest, StoreError> {
        if !self.is_expired(&request) {
            return Ok(request);
        }

        let prev = request.state;
        request.state = RequestState::Expired;
        request.updated_at = Utc::now();
        self.persist(&request).await?;

        let payload = serde_json::to_value(&request)?;
        self.audit
            .record(
                &request.id,
                Some(prev),
                RequestState::Expired,
                "system",
                Some("pending ttl exceeded".to_string()),
                &payload,
            )
            .await?;

        tracing::info!(request_id = %request.id, "pending request expired");
        Ok(request)
    }

    fn is_expired(&self, request: &AnalysisRequest) -> bool {
        let Some(ttl) = self.pending_ttl else {
            return false;
        };
        request.state == RequestState::Pending && Utc::now() - request.created_at > ttl
    }

    async fn read(&self, id: &str) -> Result<AnalysisRequest, StoreError> {
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn persist(&self, request: &AnalysisRequest) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(request)?;
        write_atomic(&self.record_path(&request.id), &bytes).await
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedra_contracts::{AnalysisKind, DecisionKind, Priority, Requester, ScriptLanguage};

    fn sample_request(id: &str) -> AnalysisRequest {
        AnalysisRequest {
            id: id.to_string(),
            requester: Requester {
                name: "Ada".to_string(),
                institution: "Institute".to_string(),
                email: "ada@example.org".to_string(),
                affiliation: None,
            },
            title: "Demographics".to_string(),
            description: "Summaries".to_string(),
            research_question: None,
            methodology: None,
            expected_outcomes: None,
            catalog_id: "clinical_trial_data".to_string(),
            selected_score: Some("UPDRS_total".to_string()),
            selected_timeline: Some("baseline".to_string()),
            kind: AnalysisKind::Demographics,
            language: ScriptLanguage::Python,
            script: "print('hi')".to_string(),
            script_hash: "hash".to_string(),
            uploaded_files: Vec::new(),
            priority: Priority::Normal,
            estimated_duration: None,
            state: RequestState::Submitted,
            decision: None,
            job_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn store(dir: &tempfile::TempDir, ttl: Option<std::time::Duration>) -> RequestStore {
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log")));
        RequestStore::open(dir.path(), audit, ttl).expect("open store")
    }

    #[tokio::test]
    async fn create_lands_in_pending_with_two_audit_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log")));
        let store = RequestStore::open(dir.path(), audit.clone(), None).expect("open");

        let created = store.create(sample_request("r1")).await.expect("create");
        assert_eq!(created.state, RequestState::Pending);

        let records = audit.read_all().await.expect("audit");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].new_state, RequestState::Submitted);
        assert_eq!(records[1].new_state, RequestState::Pending);
    }

    #[tokio::test]
    async fn update_rejects_illegal_transitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, None);
        store.create(sample_request("r1")).await.expect("create");

        let err = store
            .update_state(
                "r1",
                StateUpdate {
                    new_state: RequestState::Completed,
                    decision: None,
                    job_id: None,
                    actor: "test".to_string(),
                    notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));

        // Stored record is untouched.
        let request = store.get("r1").await.expect("get");
        assert_eq!(request.state, RequestState::Pending);
    }

    #[tokio::test]
    async fn approval_writes_decision_and_running_writes_job_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, None);
        store.create(sample_request("r1")).await.expect("create");

        let approved = store
            .update_state(
                "r1",
                StateUpdate {
                    new_state: RequestState::Approved,
                    decision: Some(DecisionRecord {
                        approver: "op".to_string(),
                        decision: DecisionKind::Approve,
                        notes: None,
                        decided_at: Utc::now(),
                    }),
                    job_id: None,
                    actor: "op".to_string(),
                    notes: None,
                },
            )
            .await
            .expect("approve");
        assert_eq!(approved.decision.as_ref().map(|d| d.decision), Some(DecisionKind::Approve));

        let running = store
            .update_state(
                "r1",
                StateUpdate {
                    new_state: RequestState::Running,
                    decision: None,
                    job_id: Some("job-1".to_string()),
                    actor: "job-runner".to_string(),
                    notes: None,
                },
            )
            .await
            .expect("run");
        assert_eq!(running.job_id.as_deref(), Some("job-1"));
        assert!(running.decision.is_some());
    }

    #[tokio::test]
    async fn stale_pending_requests_expire_on_touch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, Some(std::time::Duration::from_millis(10)));

        let mut request = sample_request("r1");
        request.created_at = Utc::now() - Duration::seconds(60);
        store.create(request).await.expect("create");

        let request = store.get("r1").await.expect("get");
        assert_eq!(request.state, RequestState::Expired);

        // The expired row is terminal: decisions now fail.
        let err = store
            .update_state(
                "r1",
                StateUpdate {
                    new_state: RequestState::Approved,
                    decision: None,
                    job_id: None,
                    actor: "op".to_string(),
                    notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
    }

    #[tokio::test]
    async fn list_filters_and_sorts_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, None);

        let mut first = sample_request("r1");
        first.created_at = Utc::now() - Duration::seconds(10);
        store.create(first).await.expect("create");

        let mut second = sample_request("r2");
        second.catalog_id = "other_catalog".to_string();
        store.create(second).await.expect("create");

        let all = store.list(&RequestFilter::default()).await.expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "r2");

        let filtered = store
            .list(&RequestFilter {
                catalog_id: Some("other_catalog".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "r2");

        let pending = store
            .list(&RequestFilter {
                state: Some(RequestState::Pending),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(pending.len(), 1);
    }
}
