use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use fedra_contracts::{
    AnalysisRequest, CatalogSpec, FailureReason, JobError, JobRecord, JobStatus, RequestState,
    ResultRecord,
};
use fedra_store::StateUpdate;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use ulid::Ulid;

use crate::workspace::WorkspacePlan;
use crate::{JobContext, metrics, sandbox, workspace};

/// Stdout/stderr tails keep the newest 64 KiB.
pub const TAIL_CAP: usize = 64 * 1024;

/// Bounded byte ring: pushes beyond capacity evict the oldest bytes.
pub struct RingTail {
    cap: usize,
    buf: VecDeque<u8>,
}

impl RingTail {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: VecDeque::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<_>>()).to_string()
    }
}

/// Replaces the node root in user-visible text so host paths never leak
/// through job errors or tails.
pub fn scrub_paths(text: &str, node_root: &std::path::Path) -> String {
    let root = node_root.to_string_lossy();
    if root.is_empty() || root == "/" {
        return text.to_string();
    }
    text.replace(root.as_ref(), "<node>")
}

struct ExecDone {
    status: JobStatus,
    exit_code: Option<i32>,
    signal: Option<i32>,
    stdout_tail: String,
    stderr_tail: String,
    artifact_path: Option<String>,
    records_processed: Option<u64>,
    error: Option<JobError>,
}

impl ExecDone {
    fn failed(reason: FailureReason, message: String) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code: None,
            signal: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            artifact_path: None,
            records_processed: None,
            error: Some(JobError { reason, message }),
        }
    }
}

/// Owns one job from workspace construction to collection. The request must
/// be `approved` when the slot picks it up.
pub(crate) async fn run_job(
    ctx: Arc<JobContext>,
    request_id: String,
    cancel: watch::Receiver<bool>,
) {
    let request = match ctx.requests.get(&request_id).await {
        Ok(request) if request.state == RequestState::Approved => request,
        Ok(request) => {
            tracing::warn!(
                request_id = %request_id,
                state = request.state.as_str(),
                "slot picked up request that is no longer approved"
            );
            return;
        }
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "request vanished before execution");
            return;
        }
    };

    let job_id = Ulid::new().to_string();
    let started = Instant::now();
    let mut job = JobRecord {
        id: job_id.clone(),
        request_id: request_id.clone(),
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

    if let Err(err) = ctx.jobs.put(&job).await {
        tracing::error!(job_id = %job_id, error = %err, "failed to persist job record");
        return;
    }
    if let Err(err) = ctx
        .requests
        .update_state(
            &request_id,
            StateUpdate {
                new_state: RequestState::Running,
                decision: None,
                job_id: Some(job_id.clone()),
                actor: "job-runner".to_string(),
                notes: None,
            },
        )
        .await
    {
        tracing::error!(request_id = %request_id, error = %err, "could not enter running state");
        return;
    }

    tracing::info!(
        request_id = %request_id,
        job_id = %job_id,
        catalog_id = %request.catalog_id,
        kind = request.kind.as_str(),
        "job started"
    );

    let done = execute(&ctx, &request, &job_id, cancel).await;

    job.status = done.status;
    job.finished_at = Some(Utc::now());
    job.exit_code = done.exit_code;
    job.signal = done.signal;
    job.stdout_tail = scrub_paths(&done.stdout_tail, &ctx.config.node_root);
    job.stderr_tail = scrub_paths(&done.stderr_tail, &ctx.config.node_root);
    job.artifact_path = done.artifact_path;
    job.records_processed = done.records_processed;
    job.error = done.error.map(|e| JobError {
        reason: e.reason,
        message: scrub_paths(&e.message, &ctx.config.node_root),
    });

    if let Err(err) = ctx.jobs.put(&job).await {
        tracing::error!(job_id = %job_id, error = %err, "failed to freeze job record");
    }

    let (new_state, notes) = match job.status {
        JobStatus::Completed => (RequestState::Completed, None),
        _ => (
            RequestState::Failed,
            job.error
                .as_ref()
                .map(|e| format!("{}: {}", e.reason.as_str(), e.message)),
        ),
    };
    if let Err(err) = ctx
        .requests
        .update_state(
            &request_id,
            StateUpdate {
                new_state,
                decision: None,
                job_id: None,
                actor: "job-runner".to_string(),
                notes,
            },
        )
        .await
    {
        tracing::error!(request_id = %request_id, error = %err, "could not record job outcome");
    }

    metrics::observe_job(
        if new_state == RequestState::Completed {
            "completed"
        } else {
            "failed"
        },
        started.elapsed(),
    );
    tracing::info!(
        request_id = %request_id,
        job_id = %job_id,
        outcome = job.status.as_str(),
        "job finished"
    );
}

async fn execute(
    ctx: &JobContext,
    request: &AnalysisRequest,
    job_id: &str,
    mut cancel: watch::Receiver<bool>,
) -> ExecDone {
    let catalog = match ctx.registry.get_catalog(&request.catalog_id) {
        Ok(catalog) => catalog,
        Err(err) => {
            return ExecDone::failed(
                FailureReason::Internal,
                format!("target catalog unavailable: {}", err),
            );
        }
    };

    let plan = match workspace::build(
        &ctx.config,
        &ctx.registry,
        &ctx.uploads,
        request,
        &catalog,
        job_id,
    ) {
        Ok(plan) => plan,
        Err(err) => {
            return ExecDone::failed(
                FailureReason::Internal,
                format!("workspace construction failed: {}", err),
            );
        }
    };

    let spec = sandbox::SandboxSpec {
        cpu_secs: ctx.config.max_cpu_secs,
        mem_bytes: ctx.config.max_mem_bytes,
        out_bytes: ctx.config.max_out_bytes,
        unshare_net: ctx.config.unshare_net,
        run_as_uid: ctx.config.run_as_uid,
    };
    let mut child = match sandbox::command(&plan, job_id, &spec).spawn() {
        Ok(child) => child,
        Err(err) => {
            return ExecDone::failed(
                FailureReason::Internal,
                format!("failed to spawn analysis process: {}", err),
            );
        }
    };
    let pid = child.id().unwrap_or_default();

    let stdout_ring = Arc::new(Mutex::new(RingTail::new(TAIL_CAP)));
    let stderr_ring = Arc::new(Mutex::new(RingTail::new(TAIL_CAP)));
    let stdout_task = child.stdout.take().map(|pipe| drain(pipe, stdout_ring.clone()));
    let stderr_task = child.stderr.take().map(|pipe| drain(pipe, stderr_ring.clone()));

    let poll = Duration::from_millis(ctx.config.poll_interval_ms.max(1));
    let grace = Duration::from_secs(ctx.config.grace_secs);
    let deadline = Instant::now() + Duration::from_secs(ctx.config.max_wall_secs.max(1));
    let mut kill_reason: Option<FailureReason> = None;
    let mut term_sent_at: Option<Instant> = None;

    let wait = loop {
        match tokio::time::timeout(poll, child.wait()).await {
            Ok(result) => break result,
            Err(_) => {}
        }

        let now = Instant::now();
        if let Some(sent) = term_sent_at {
            if now >= sent + grace {
                let _ = child.start_kill();
            }
            continue;
        }

        if *cancel.borrow_and_update() {
            kill_reason = Some(FailureReason::Cancelled);
            push_notice(&stderr_ring, "fedra: job cancelled; terminating analysis process\n");
            sandbox::terminate_group(pid);
            term_sent_at = Some(now);
        } else if now >= deadline {
            kill_reason = Some(FailureReason::Timeout);
            push_notice(
                &stderr_ring,
                "fedra: wall-clock limit exceeded; terminating analysis process\n",
            );
            sandbox::terminate_group(pid);
            term_sent_at = Some(now);
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let stdout_tail = stdout_ring.lock().unwrap_or_else(|e| e.into_inner()).snapshot();
    let stderr_tail = stderr_ring.lock().unwrap_or_else(|e| e.into_inner()).snapshot();

    let status = match wait {
        Ok(status) => status,
        Err(err) => {
            let mut done = ExecDone::failed(
                FailureReason::Internal,
                format!("waiting on analysis process failed: {}", err),
            );
            done.stdout_tail = stdout_tail;
            done.stderr_tail = stderr_tail;
            return done;
        }
    };

    let exit_code = status.code();
    let signal = exit_signal(&status);

    let (job_status, artifact_path, records_processed, error) = if let Some(reason) = kill_reason {
        let message = match reason {
            FailureReason::Timeout => format!(
                "wall-clock limit of {} seconds exceeded",
                ctx.config.max_wall_secs
            ),
            _ => "job cancelled before completion".to_string(),
        };
        (JobStatus::Failed, None, None, Some(JobError { reason, message }))
    } else if let Some(reason) = signal.and_then(sandbox::limit_signal) {
        let message = match reason {
            FailureReason::Timeout => {
                format!("cpu limit of {} seconds exceeded", ctx.config.max_cpu_secs)
            }
            _ => format!(
                "artifact write exceeded the {} byte cap",
                ctx.config.max_out_bytes
            ),
        };
        (JobStatus::Failed, None, None, Some(JobError { reason, message }))
    } else if exit_code == Some(0) {
        match collect(ctx, request, &catalog, &plan).await {
            Ok((artifact_path, records_processed)) => {
                (JobStatus::Completed, artifact_path, records_processed, None)
            }
            Err(error) => (JobStatus::Failed, None, None, Some(error)),
        }
    } else {
        let message = match (exit_code, signal) {
            (Some(code), _) => format!("analysis process exited with code {}", code),
            (None, Some(signal)) => format!("analysis process killed by signal {}", signal),
            (None, None) => "analysis process ended without status".to_string(),
        };
        (
            JobStatus::Failed,
            None,
            None,
            Some(JobError {
                reason: FailureReason::ChildCrash,
                message,
            }),
        )
    };

    ExecDone {
        status: job_status,
        exit_code,
        signal,
        stdout_tail,
        stderr_tail,
        artifact_path,
        records_processed,
        error,
    }
}

/// Reads the canonical artifact and the per-call results log, gates every
/// row, and appends the result records. Exit 0 with no artifact is a
/// completed job with an empty result list.
async fn collect(
    ctx: &JobContext,
    request: &AnalysisRequest,
    catalog: &CatalogSpec,
    plan: &WorkspacePlan,
) -> Result<(Option<String>, Option<u64>), JobError> {
    let metadata = match std::fs::metadata(&plan.output_file) {
        Ok(metadata) => metadata,
        Err(_) => return Ok((None, None)),
    };

    if ctx.config.max_out_bytes > 0 && metadata.len() > ctx.config.max_out_bytes {
        return Err(JobError {
            reason: FailureReason::ArtifactTooLarge,
            message: format!(
                "artifact is {} bytes; the cap is {}",
                metadata.len(),
                ctx.config.max_out_bytes
            ),
        });
    }

    let bytes = std::fs::read(&plan.output_file).map_err(|err| JobError {
        reason: FailureReason::Internal,
        message: format!("artifact could not be read: {}", err),
    })?;
    let artifact: serde_json::Value = serde_json::from_slice(&bytes).map_err(|_| JobError {
        reason: FailureReason::ChildCrash,
        message: "canonical artifact is not valid JSON".to_string(),
    })?;

    let records_processed = artifact.get("_records_processed").and_then(|v| v.as_u64());

    let mut rows: Vec<(String, serde_json::Value)> = Vec::new();
    if let Ok(log) = std::fs::read_to_string(&plan.results_log) {
        for line in log.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                tracing::warn!(request_id = %request.id, "unparseable results log line skipped");
                continue;
            };
            let result_type = value
                .get("result_type")
                .and_then(|v| v.as_str())
                .unwrap_or("analysis")
                .to_string();
            let payload = value.get("payload").cloned().unwrap_or(value);
            rows.push((result_type, payload));
        }
    }
    if rows.is_empty() {
        rows.push(("analysis".to_string(), artifact));
    }

    for (seq, (result_type, payload)) in rows.into_iter().enumerate() {
        let decision =
            fedra_policy::evaluate(&payload, catalog.min_cohort_size, catalog.privacy_level);
        let record = ResultRecord {
            request_id: request.id.clone(),
            seq: seq as u64,
            result_type,
            released: decision.released,
            payload: decision.external_payload(&payload),
            original: (!decision.released).then_some(payload),
            created_at: Utc::now(),
        };
        ctx.results.append(&record).await.map_err(|err| JobError {
            reason: FailureReason::Internal,
            message: format!("result row could not be persisted: {}", err),
        })?;
        metrics::observe_result(decision.released);

        if !decision.released {
            tracing::info!(
                request_id = %request.id,
                observed = ?decision.observed,
                min_cohort_size = catalog.min_cohort_size,
                "result blocked by privacy gate"
            );
        }
    }

    Ok((Some("output/result.json".to_string()), records_processed))
}

fn drain(
    mut pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ring: Arc<Mutex<RingTail>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
                    ring.push(&buf[..n]);
                }
            }
        }
    })
}

fn push_notice(ring: &Arc<Mutex<RingTail>>, notice: &str) {
    let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
    ring.push(notice.as_bytes());
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
