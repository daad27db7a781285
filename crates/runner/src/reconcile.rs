use chrono::Utc;
use fedra_contracts::{FailureReason, JobError, JobStatus, RequestState};
use fedra_store::{JobStore, RequestFilter, RequestStore, StateUpdate, StoreError};

/// Startup pass: after a node restart no supervisor owns a child, so every
/// request persisted as `running` lost its process. Each one is marked
/// failed without touching the possibly-partial artifact in its workspace.
pub async fn recover_interrupted(
    requests: &RequestStore,
    jobs: &JobStore,
) -> Result<u32, StoreError> {
    let running = requests
        .list(&RequestFilter {
            state: Some(RequestState::Running),
            ..Default::default()
        })
        .await?;

    let mut recovered = 0;
    for request in running {
        if let Some(job_id) = &request.job_id {
            match jobs.get(job_id).await {
                Ok(mut job) => {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                    job.error = Some(JobError {
                        reason: FailureReason::InterruptedBeforeCompletion,
                        message: "node restarted while the job was running".to_string(),
                    });
                    if let Err(err) = jobs.put(&job).await {
                        tracing::warn!(job_id = %job_id, error = %err, "could not freeze interrupted job");
                    }
                }
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "interrupted job record missing");
                }
            }
        }

        requests
            .update_state(
                &request.id,
                StateUpdate {
                    new_state: RequestState::Failed,
                    decision: None,
                    job_id: None,
                    actor: "reconciler".to_string(),
                    notes: Some("interrupted-before-completion".to_string()),
                },
            )
            .await?;

        tracing::warn!(request_id = %request.id, "running request reconciled as failed");
        recovered += 1;
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fedra_contracts::{
        AnalysisKind, AnalysisRequest, JobRecord, Priority, Requester, ScriptLanguage,
    };
    use fedra_store::AuditLog;
    use std::sync::Arc;

    fn running_request(id: &str, job_id: &str) -> AnalysisRequest {
        AnalysisRequest {
            id: id.to_string(),
            requester: Requester {
                name: "Ada".to_string(),
                institution: "Institute".to_string(),
                email: "ada@example.org".to_string(),
                affiliation: None,
            },
            title: "t".to_string(),
            description: "d".to_string(),
            research_question: None,
            methodology: None,
            expected_outcomes: None,
            catalog_id: "trial".to_string(),
            selected_score: None,
            selected_timeline: None,
            kind: AnalysisKind::Demographics,
            language: ScriptLanguage::Python,
            script: "pass".to_string(),
            script_hash: "h".to_string(),
            uploaded_files: Vec::new(),
            priority: Priority::Normal,
            estimated_duration: None,
            state: RequestState::Submitted,
            decision: None,
            job_id: Some(job_id.to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn running_requests_are_failed_without_reading_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log")));
        let requests = RequestStore::open(dir.path(), audit, None).expect("requests");
        let jobs = JobStore::open(dir.path()).expect("jobs");

        // Walk a request into running the legal way, then simulate a restart.
        requests
            .create(running_request("r1", "job-1"))
            .await
            .expect("create");
        requests
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
            .expect("approve");
        requests
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

        jobs.put(&JobRecord {
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
        })
        .await
        .expect("job put");

        let recovered = recover_interrupted(&requests, &jobs).await.expect("recover");
        assert_eq!(recovered, 1);

        let request = requests.get("r1").await.expect("get");
        assert_eq!(request.state, RequestState::Failed);

        let job = jobs.get("job-1").await.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_ref().map(|e| e.reason),
            Some(FailureReason::InterruptedBeforeCompletion)
        );
        assert!(job.finished_at.is_some());

        // Idempotent: a second pass finds nothing.
        let again = recover_interrupted(&requests, &jobs).await.expect("recover");
        assert_eq!(again, 0);
    }
}
