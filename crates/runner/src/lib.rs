use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fedra_catalog::CatalogRegistry;
use fedra_contracts::{Priority, RequestState};
use fedra_store::{JobStore, RequestStore, ResultStore};
use fedra_uploads::UploadStore;
use tokio::sync::{mpsc, watch};

pub mod metrics;
pub mod reconcile;
pub mod sandbox;
pub mod supervise;
pub mod workspace;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub node_root: PathBuf,
    pub work_root: PathBuf,
    pub slots: usize,
    pub max_cpu_secs: u64,
    pub max_wall_secs: u64,
    pub max_mem_bytes: u64,
    pub max_out_bytes: u64,
    pub grace_secs: u64,
    pub poll_interval_ms: u64,
    pub retention_secs: u64,
    pub python_bin: String,
    pub rscript_bin: String,
    pub unshare_net: bool,
    pub run_as_uid: Option<u32>,
}

impl RunnerConfig {
    pub fn new(node_root: impl Into<PathBuf>) -> Self {
        let node_root = node_root.into();
        let work_root = node_root.join("work");
        Self {
            node_root,
            work_root,
            slots: 2,
            max_cpu_secs: 300,
            max_wall_secs: 600,
            max_mem_bytes: 2 * 1024 * 1024 * 1024,
            max_out_bytes: 100 * 1024 * 1024,
            grace_secs: 5,
            poll_interval_ms: 250,
            retention_secs: 24 * 60 * 60,
            python_bin: "python3".to_string(),
            rscript_bin: "Rscript".to_string(),
            unshare_net: false,
            run_as_uid: None,
        }
    }
}

pub(crate) struct JobContext {
    pub config: RunnerConfig,
    pub registry: Arc<CatalogRegistry>,
    pub uploads: Arc<UploadStore>,
    pub requests: Arc<RequestStore>,
    pub jobs: Arc<JobStore>,
    pub results: Arc<ResultStore>,
}

enum Msg {
    Submit(String),
    Cancel(String),
    Done(String),
}

/// Handle to the executor pool. Cheap to clone; messages go to the single
/// dispatcher task that owns the queue and the running set.
#[derive(Clone)]
pub struct JobRunner {
    tx: mpsc::UnboundedSender<Msg>,
}

impl JobRunner {
    /// Queues an approved request for execution.
    pub fn submit(&self, request_id: &str) {
        let _ = self.tx.send(Msg::Submit(request_id.to_string()));
    }

    /// Signals the owning supervisor to stop a running job.
    pub fn cancel(&self, request_id: &str) {
        let _ = self.tx.send(Msg::Cancel(request_id.to_string()));
    }
}

pub fn spawn(
    config: RunnerConfig,
    registry: Arc<CatalogRegistry>,
    uploads: Arc<UploadStore>,
    requests: Arc<RequestStore>,
    jobs: Arc<JobStore>,
    results: Arc<ResultStore>,
) -> JobRunner {
    let retention = std::time::Duration::from_secs(config.retention_secs);
    workspace::spawn_retention_sweeper(config.work_root.clone(), retention);

    let ctx = Arc::new(JobContext {
        config,
        registry,
        uploads,
        requests,
        jobs,
        results,
    });

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatch(ctx, tx.clone(), rx));
    JobRunner { tx }
}

#[derive(Debug, Clone)]
struct Queued {
    request_id: String,
    high: bool,
    created_at: DateTime<Utc>,
}

/// High priority ahead of everything else; ties by submission time, oldest
/// first.
fn sort_queue(queue: &mut [Queued]) {
    queue.sort_by(|a, b| {
        b.high
            .cmp(&a.high)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.request_id.cmp(&b.request_id))
    });
}

async fn dispatch(
    ctx: Arc<JobContext>,
    tx: mpsc::UnboundedSender<Msg>,
    mut rx: mpsc::UnboundedReceiver<Msg>,
) {
    let mut queue: Vec<Queued> = Vec::new();
    let mut running: HashMap<String, watch::Sender<bool>> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::Submit(request_id) => {
                let already_known = running.contains_key(&request_id)
                    || queue.iter().any(|q| q.request_id == request_id);
                if already_known {
                    continue;
                }

                match ctx.requests.get(&request_id).await {
                    Ok(request) if request.state == RequestState::Approved => {
                        queue.push(Queued {
                            request_id,
                            high: request.priority == Priority::High,
                            created_at: request.created_at,
                        });
                        sort_queue(&mut queue);
                    }
                    Ok(request) => {
                        tracing::warn!(
                            request_id = %request_id,
                            state = request.state.as_str(),
                            "ignoring submission of non-approved request"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(request_id = %request_id, error = %err, "submission lookup failed");
                    }
                }
            }
            Msg::Cancel(request_id) => {
                if let Some(flag) = running.get(&request_id) {
                    let _ = flag.send(true);
                } else {
                    tracing::warn!(request_id = %request_id, "cancel for job that is not running");
                }
            }
            Msg::Done(request_id) => {
                running.remove(&request_id);
            }
        }

        while running.len() < ctx.config.slots.max(1) && !queue.is_empty() {
            let next = queue.remove(0);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            running.insert(next.request_id.clone(), cancel_tx);

            let ctx = ctx.clone();
            let done_tx = tx.clone();
            let request_id = next.request_id.clone();
            tokio::spawn(async move {
                supervise::run_job(ctx, request_id.clone(), cancel_rx).await;
                let _ = done_tx.send(Msg::Done(request_id));
            });
        }

        metrics::set_queue_depth(queue.len() as i64);
    }
}
