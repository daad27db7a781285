#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fedra_catalog::CatalogRegistry;
use fedra_contracts::{
    AnalysisKind, AnalysisRequest, DecisionKind, DecisionRecord, FailureReason, Priority,
    RequestState, Requester, ScriptLanguage, canonical,
};
use fedra_runner::{JobRunner, RunnerConfig};
use fedra_store::{AuditLog, JobStore, RequestStore, ResultStore, StateUpdate};
use fedra_uploads::UploadStore;

struct Node {
    _root: tempfile::TempDir,
    registry: Arc<CatalogRegistry>,
    uploads: Arc<UploadStore>,
    requests: Arc<RequestStore>,
    jobs: Arc<JobStore>,
    results: Arc<ResultStore>,
    runner: JobRunner,
}

fn manifest() -> serde_json::Value {
    serde_json::json!({
        "version": "1.0",
        "catalogs": [{
            "id": "clinical_trial_data",
            "name": "Clinical Trial Data",
            "privacy_level": "high",
            "min_cohort_size": 10,
            "files": [
                {"name": "subjects", "path": "data/catalogs/trial/subjects.csv", "type": "csv"}
            ]
        }]
    })
}

fn node(tune: impl FnOnce(&mut RunnerConfig)) -> Node {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(root.path().join("data/catalogs/trial")).expect("mkdir");
    std::fs::create_dir_all(root.path().join("state")).expect("mkdir");

    let mut subjects = String::from("subject_id,age,sex\n");
    for i in 0..150 {
        subjects.push_str(&format!("S{:03},{},{}\n", i, 40 + (i % 40), if i % 2 == 0 { "F" } else { "M" }));
    }
    std::fs::write(root.path().join("data/catalogs/trial/subjects.csv"), subjects).expect("csv");
    std::fs::write(
        root.path().join("data/manifest.json"),
        serde_json::to_vec(&manifest()).expect("encode"),
    )
    .expect("manifest");

    let registry = Arc::new(CatalogRegistry::new(
        root.path(),
        root.path().join("data/manifest.json"),
    ));
    let uploads = Arc::new(UploadStore::open(root.path(), 0, registry.clone()).expect("uploads"));
    let audit = Arc::new(AuditLog::new(root.path().join("state/audit.log")));
    let requests = Arc::new(
        RequestStore::open(root.path().join("state"), audit, None).expect("requests"),
    );
    let jobs = Arc::new(JobStore::open(root.path().join("state")).expect("jobs"));
    let results = Arc::new(ResultStore::open(root.path().join("state")).expect("results"));

    let mut config = RunnerConfig::new(root.path());
    // The lifecycle tests drive shell scripts through the interpreter knob,
    // so they run anywhere without a Python toolchain.
    config.python_bin = "/bin/sh".to_string();
    config.max_wall_secs = 20;
    config.poll_interval_ms = 25;
    config.grace_secs = 1;
    tune(&mut config);

    let runner = fedra_runner::spawn(
        config,
        registry.clone(),
        uploads.clone(),
        requests.clone(),
        jobs.clone(),
        results.clone(),
    );

    Node {
        _root: root,
        registry,
        uploads,
        requests,
        jobs,
        results,
        runner,
    }
}

fn request(id: &str, script: &str) -> AnalysisRequest {
    AnalysisRequest {
        id: id.to_string(),
        requester: Requester {
            name: "Ada".to_string(),
            institution: "Institute".to_string(),
            email: "ada@example.org".to_string(),
            affiliation: None,
        },
        title: "Demographics".to_string(),
        description: "Cohort summaries".to_string(),
        research_question: None,
        methodology: None,
        expected_outcomes: None,
        catalog_id: "clinical_trial_data".to_string(),
        selected_score: Some("UPDRS_total".to_string()),
        selected_timeline: Some("baseline".to_string()),
        kind: AnalysisKind::Demographics,
        language: ScriptLanguage::Python,
        script: script.to_string(),
        script_hash: canonical::sha256_hex(script.as_bytes()),
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

async fn approve_and_run(node: &Node, id: &str) {
    node.requests
        .update_state(
            id,
            StateUpdate {
                new_state: RequestState::Approved,
                decision: Some(DecisionRecord {
                    approver: "operator".to_string(),
                    decision: DecisionKind::Approve,
                    notes: None,
                    decided_at: Utc::now(),
                }),
                job_id: None,
                actor: "operator".to_string(),
                notes: None,
            },
        )
        .await
        .expect("approve");
    node.runner.submit(id);
}

async fn wait_terminal(node: &Node, id: &str, budget: Duration) -> AnalysisRequest {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let request = node.requests.get(id).await.expect("get request");
        if request.state.is_terminal() {
            return request;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "request {} still {} after {:?}",
            id,
            request.state.as_str(),
            budget
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_releases_result_and_orders_timestamps() {
    let node = node(|_| {});
    let script = r#"echo "started demographics run" >&2
cat > "$OUTPUT_FILE" <<'EOF'
{"sample_size": 150, "age_statistics": {"mean": 57.5}, "_records_processed": 150}
EOF
"#;
    node.requests.create(request("r-happy", script)).await.expect("create");
    approve_and_run(&node, "r-happy").await;

    let done = wait_terminal(&node, "r-happy", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Completed);

    let job = node
        .jobs
        .get(done.job_id.as_deref().expect("job id"))
        .await
        .expect("job");
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(job.records_processed, Some(150));
    assert_eq!(job.artifact_path.as_deref(), Some("output/result.json"));
    assert!(job.stderr_tail.contains("started demographics run"));

    // approval <= run start <= run end
    let approved_at = done.decision.as_ref().expect("decision").decided_at;
    assert!(approved_at <= job.started_at);
    assert!(job.started_at <= job.finished_at.expect("finished"));

    let released = node.results.released("r-happy").await.expect("released");
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload["sample_size"], serde_json::json!(150));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn below_cohort_results_complete_but_stay_blocked() {
    let node = node(|_| {});
    let script = r#"printf '{"sample_size": 3, "mean": 1.0}' > "$OUTPUT_FILE""#;
    node.requests.create(request("r-small", script)).await.expect("create");
    approve_and_run(&node, "r-small").await;

    let done = wait_terminal(&node, "r-small", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Completed);

    assert!(node.results.released("r-small").await.expect("released").is_empty());

    let admin = node.results.all("r-small").await.expect("all");
    assert_eq!(admin.len(), 1);
    assert!(!admin[0].released);
    assert_eq!(admin[0].payload["reason"], serde_json::json!("cohort-below-minimum"));
    assert_eq!(admin[0].payload["min_cohort_size"], serde_json::json!(10));
    assert_eq!(admin[0].payload["observed"], serde_json::json!(3));
    assert_eq!(
        admin[0].original.as_ref().expect("original")["sample_size"],
        serde_json::json!(3)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wall_timeout_fails_with_notice_in_stderr_tail() {
    let node = node(|config| {
        config.max_wall_secs = 1;
    });
    let script = "sleep 10\n";
    node.requests.create(request("r-slow", script)).await.expect("create");
    approve_and_run(&node, "r-slow").await;

    let done = wait_terminal(&node, "r-slow", Duration::from_secs(20)).await;
    assert_eq!(done.state, RequestState::Failed);

    let job = node
        .jobs
        .get(done.job_id.as_deref().expect("job id"))
        .await
        .expect("job");
    assert_eq!(
        job.error.as_ref().map(|e| e.reason),
        Some(FailureReason::Timeout)
    );
    assert!(job.stderr_tail.contains("wall-clock limit exceeded"));
    assert!(node.results.released("r-slow").await.expect("released").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonzero_exit_is_a_child_crash_with_tails() {
    let node = node(|_| {});
    let script = "echo boom-detail >&2\nexit 3\n";
    node.requests.create(request("r-crash", script)).await.expect("create");
    approve_and_run(&node, "r-crash").await;

    let done = wait_terminal(&node, "r-crash", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Failed);

    let job = node
        .jobs
        .get(done.job_id.as_deref().expect("job id"))
        .await
        .expect("job");
    assert_eq!(job.exit_code, Some(3));
    assert_eq!(
        job.error.as_ref().map(|e| e.reason),
        Some(FailureReason::ChildCrash)
    );
    assert!(job.stderr_tail.contains("boom-detail"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_save_results_completes_with_empty_results() {
    let node = node(|_| {});
    let script = "echo did nothing useful\n";
    node.requests.create(request("r-silent", script)).await.expect("create");
    approve_and_run(&node, "r-silent").await;

    let done = wait_terminal(&node, "r-silent", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Completed);
    assert!(node.results.all("r-silent").await.expect("all").is_empty());

    let job = node
        .jobs
        .get(done.job_id.as_deref().expect("job id"))
        .await
        .expect("job");
    assert_eq!(job.artifact_path, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_slots_queue_jobs_until_one_frees() {
    let node = node(|config| {
        config.slots = 1;
    });
    let slow = r#"sleep 1
printf '{"sample_size": 20}' > "$OUTPUT_FILE"
"#;
    let fast = r#"printf '{"sample_size": 30}' > "$OUTPUT_FILE""#;

    node.requests.create(request("r-first", slow)).await.expect("create");
    node.requests.create(request("r-second", fast)).await.expect("create");
    approve_and_run(&node, "r-first").await;
    approve_and_run(&node, "r-second").await;

    // While the first job holds the only slot, the second stays approved.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let waiting = node.requests.get("r-second").await.expect("get");
    assert_eq!(waiting.state, RequestState::Approved);

    let first = wait_terminal(&node, "r-first", Duration::from_secs(20)).await;
    let second = wait_terminal(&node, "r-second", Duration::from_secs(20)).await;
    assert_eq!(first.state, RequestState::Completed);
    assert_eq!(second.state, RequestState::Completed);

    let first_job = node.jobs.get(first.job_id.as_deref().expect("id")).await.expect("job");
    let second_job = node.jobs.get(second.job_id.as_deref().expect("id")).await.expect("job");
    assert!(first_job.finished_at.expect("finished") <= second_job.started_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_kills_a_running_job() {
    let node = node(|_| {});
    let script = "sleep 30\n";
    node.requests.create(request("r-cancel", script)).await.expect("create");
    approve_and_run(&node, "r-cancel").await;

    // Let it reach running, then cancel.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = node.requests.get("r-cancel").await.expect("get");
        if current.state == RequestState::Running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never reached running");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    node.runner.cancel("r-cancel");

    let done = wait_terminal(&node, "r-cancel", Duration::from_secs(20)).await;
    assert_eq!(done.state, RequestState::Failed);

    let job = node
        .jobs
        .get(done.job_id.as_deref().expect("job id"))
        .await
        .expect("job");
    assert_eq!(
        job.error.as_ref().map(|e| e.reason),
        Some(FailureReason::Cancelled)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn artifact_at_exact_cap_succeeds() {
    let node = node(|config| {
        config.max_out_bytes = 64;
    });

    let payload = format!(r#"{{"sample_size":20,"pad":"{}"}}"#, "x".repeat(37));
    assert_eq!(payload.len(), 64);
    let script = format!(r#"printf '%s' '{}' > "$OUTPUT_FILE""#, payload);

    node.requests.create(request("r-exact", &script)).await.expect("create");
    approve_and_run(&node, "r-exact").await;

    let done = wait_terminal(&node, "r-exact", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Completed);

    let released = node.results.released("r-exact").await.expect("released");
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload["sample_size"], serde_json::json!(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_artifact_fails_resource_exhausted() {
    let node = node(|config| {
        config.max_out_bytes = 64;
    });
    // One write well past the cap: the kernel file-size limit stops the
    // child mid-write and the failure classifies as artifact-too-large.
    let script = format!(
        r#"printf '%s' '{{"pad":"{}"}}' > "$OUTPUT_FILE""#,
        "x".repeat(200)
    );
    node.requests.create(request("r-big", &script)).await.expect("create");
    approve_and_run(&node, "r-big").await;

    let done = wait_terminal(&node, "r-big", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Failed);

    let job = node
        .jobs
        .get(done.job_id.as_deref().expect("job id"))
        .await
        .expect("job");
    assert_eq!(
        job.error.as_ref().map(|e| e.reason),
        Some(FailureReason::ArtifactTooLarge)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploaded_files_are_exposed_to_the_child() {
    let node = node(|_| {});
    let uploaded = node
        .uploads
        .put_data("connectivity_map.nii.gz", b"not a real volume")
        .expect("upload");

    let script = r#"count=$(ls input/uploads | wc -l)
printf '{"sample_size": 40, "uploads_seen": %s}' "$count" > "$OUTPUT_FILE"
"#;
    let mut req = request("r-upload", script);
    req.kind = AnalysisKind::DamageScore;
    req.uploaded_files = vec![uploaded.id.clone()];
    node.requests.create(req).await.expect("create");
    approve_and_run(&node, "r-upload").await;

    let done = wait_terminal(&node, "r-upload", Duration::from_secs(15)).await;
    assert_eq!(done.state, RequestState::Completed);

    let released = node.results.released("r-upload").await.expect("released");
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload["uploads_seen"], serde_json::json!(1));
    assert_eq!(released[0].payload["sample_size"], serde_json::json!(40));

    let _ = node.registry.get_catalog("clinical_trial_data").expect("catalog");
}
