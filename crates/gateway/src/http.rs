use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use fedra_catalog::{CatalogError, CatalogRegistry};
use fedra_contracts::RequestState;
use fedra_runner::JobRunner;
use fedra_store::{AuditLog, JobStore, RequestFilter, RequestStore, ResultStore, StoreError};
use fedra_uploads::{UploadError, UploadStore};
use serde::Serialize;

use crate::config::{NodeConfig, StartupError};
use crate::metrics;
use crate::rate_limit::SubmissionThrottle;

mod catalogs;
mod requests;
mod uploads;

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub config: NodeConfig,
    registry: Arc<CatalogRegistry>,
    uploads: Arc<UploadStore>,
    requests: Arc<RequestStore>,
    jobs: Arc<JobStore>,
    results: Arc<ResultStore>,
    runner: JobRunner,
    throttle: SubmissionThrottle,
    started_at: Instant,
}

pub async fn router(config: NodeConfig) -> Result<Router, StartupError> {
    let state_root = config.node_root.join("state");
    std::fs::create_dir_all(&state_root).map_err(|err| StartupError {
        code: "ERR_STATE_DIR",
        message: format!("failed to create state directory: {}", err),
    })?;

    let registry = Arc::new(
        CatalogRegistry::new(&config.node_root, &config.manifest_path)
            .with_sample_rows(config.infer_sample_rows),
    );
    let uploads = Arc::new(
        UploadStore::open(&config.node_root, config.max_upload_bytes, registry.clone()).map_err(
            |err| StartupError {
                code: "ERR_UPLOAD_STORE",
                message: format!("failed to initialize upload store: {}", err),
            },
        )?,
    );

    let audit = Arc::new(AuditLog::new(state_root.join("audit.log")));
    let requests = Arc::new(
        RequestStore::open(&state_root, audit, config.pending_ttl()).map_err(|err| {
            StartupError {
                code: "ERR_REQUEST_STORE",
                message: format!("failed to initialize request store: {}", err),
            }
        })?,
    );
    let jobs = Arc::new(JobStore::open(&state_root).map_err(|err| StartupError {
        code: "ERR_JOB_STORE",
        message: format!("failed to initialize job store: {}", err),
    })?);
    let results = Arc::new(ResultStore::open(&state_root).map_err(|err| StartupError {
        code: "ERR_RESULT_STORE",
        message: format!("failed to initialize result store: {}", err),
    })?);

    // Requests stranded in `running` by a previous process lose their jobs
    // before any new work is accepted.
    match fedra_runner::reconcile::recover_interrupted(&requests, &jobs).await {
        Ok(0) => {}
        Ok(recovered) => {
            tracing::warn!(recovered, "reconciled interrupted jobs from previous run");
        }
        Err(err) => {
            return Err(StartupError {
                code: "ERR_RECONCILE",
                message: format!("failed to reconcile interrupted jobs: {}", err),
            });
        }
    }

    let runner = fedra_runner::spawn(
        config.runner_config(),
        registry.clone(),
        uploads.clone(),
        requests.clone(),
        jobs.clone(),
        results.clone(),
    );

    let body_limit = (config.max_upload_bytes as usize).max(2 * 1024 * 1024) + 64 * 1024;
    let state = AppState {
        throttle: SubmissionThrottle::per_minute(config.submit_rate_limit),
        config,
        registry,
        uploads,
        requests,
        jobs,
        results,
        runner,
        started_at: Instant::now(),
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .route("/api/v1/catalogs", get(catalogs::list))
        .route("/api/v1/catalogs/{id}", get(catalogs::get_one))
        .route("/api/v1/catalogs/{id}/score-timeline", get(catalogs::score_timeline))
        .route("/api/v1/catalogs/{id}/files/{name}/schema", get(catalogs::schema))
        .route("/api/v1/uploads/script", post(uploads::put_script))
        .route("/api/v1/uploads/data", post(uploads::put_data))
        .route("/api/v1/uploads", get(uploads::list))
        .route("/api/v1/requests", post(requests::create).get(requests::list))
        .route("/api/v1/requests/{id}", get(requests::get_one))
        .route("/api/v1/requests/{id}/decision", post(requests::decide))
        .route("/api/v1/requests/{id}/cancel", post(requests::cancel))
        .route("/api/v1/requests/{id}/results", get(requests::results))
        .route("/api/v1/requests/{id}/job", get(requests::job))
        .route("/api/v1/admin/requests/{id}/results", get(requests::admin_results))
        .layer(middleware::from_fn(track_http))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state))
}

async fn track_http(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    metrics::observe_http_request(&route, &method, response.status().as_u16(), started.elapsed());
    response
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node: String,
    version: &'static str,
    uptime_secs: u64,
    active_jobs: u64,
    total_jobs: u64,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let running = state
        .requests
        .list(&RequestFilter {
            state: Some(RequestState::Running),
            ..Default::default()
        })
        .await
        .map(|v| v.len() as u64)
        .unwrap_or(0);
    let queued = state
        .requests
        .list(&RequestFilter {
            state: Some(RequestState::Approved),
            ..Default::default()
        })
        .await
        .map(|v| v.len() as u64)
        .unwrap_or(0);
    let total_jobs = state.jobs.count().await.unwrap_or(0);

    Json(HealthResponse {
        status: "ok",
        node: state.config.node_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_jobs: running + queued,
        total_jobs,
    })
}

async fn render_metrics() -> Result<([(http::HeaderName, String); 1], Vec<u8>), ApiError> {
    let (body, content_type) = metrics::render().map_err(|_| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "failed to render metrics".to_string(),
            false,
        )
    })?;
    Ok(([(http::header::CONTENT_TYPE, content_type)], body))
}

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

/// Requester attribution is an opaque header; nothing authenticates it.
pub(crate) fn principal_of(headers: &HeaderMap) -> String {
    headers
        .get("x-fedra-principal")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

pub(crate) fn catalog_error(err: CatalogError) -> ApiError {
    match err {
        CatalogError::ManifestMissing => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_MANIFEST_MISSING",
            "data manifest not found".to_string(),
            true,
        ),
        CatalogError::ManifestInvalid(detail) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_MANIFEST_INVALID",
            format!("data manifest invalid: {}", detail),
            false,
        ),
        CatalogError::UnknownCatalog(id) => json_error(
            StatusCode::NOT_FOUND,
            "ERR_UNKNOWN_CATALOG",
            format!("unknown catalog `{}`", id),
            false,
        ),
        CatalogError::UnknownFile { catalog, file } => json_error(
            StatusCode::NOT_FOUND,
            "ERR_UNKNOWN_FILE",
            format!("unknown file `{}` in catalog `{}`", file, catalog),
            false,
        ),
        CatalogError::Io(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "catalog read failed".to_string(),
            true,
        ),
    }
}

pub(crate) fn upload_error(err: UploadError) -> ApiError {
    match err {
        UploadError::InvalidExtension(ext) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_EXTENSION",
            format!("file extension `{}` is not allowed", ext),
            false,
        ),
        UploadError::TooLarge { limit } => json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "ERR_TOO_LARGE",
            format!("upload exceeds the {} byte limit", limit),
            false,
        ),
        UploadError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "ERR_UPLOAD_NOT_FOUND",
            format!("uploaded file `{}` not found", id),
            false,
        ),
        UploadError::Io(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "upload storage failed".to_string(),
            true,
        ),
    }
}

pub(crate) fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "ERR_REQUEST_NOT_FOUND",
            format!("request `{}` not found", id),
            false,
        ),
        StoreError::Transition(err) => json_error(
            StatusCode::CONFLICT,
            "ERR_STATE_CONFLICT",
            err.to_string(),
            false,
        ),
        StoreError::Encode(_) | StoreError::Io(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "request storage failed".to_string(),
            true,
        ),
    }
}
