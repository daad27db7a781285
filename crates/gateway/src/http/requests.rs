use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use fedra_contracts::{
    AnalysisRequest, DecisionKind, DecisionRecord, JobRecord, OptionKind, Priority, ReleasedResult,
    RequestState, Requester, ResultRecord, ScriptLanguage, canonical,
};
use fedra_store::{RequestFilter, StateUpdate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{ApiError, AppState, catalog_error, json_error, principal_of, store_error};
use crate::{lint, metrics};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct CreateRequestBody {
    requester: Requester,
    title: String,
    description: String,
    #[serde(default)]
    research_question: Option<String>,
    #[serde(default)]
    methodology: Option<String>,
    #[serde(default)]
    expected_outcomes: Option<String>,
    catalog_id: String,
    #[serde(default)]
    selected_score: Option<String>,
    #[serde(default)]
    selected_timeline: Option<String>,
    kind: fedra_contracts::AnalysisKind,
    #[serde(default)]
    language: ScriptLanguage,
    script: String,
    #[serde(default)]
    uploaded_files: Vec<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    estimated_duration: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateRequestResponse {
    request_id: String,
    state: RequestState,
}

fn invalid(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", message, false)
}

pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateRequestBody>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateRequestResponse>), ApiError> {
    let Json(body) = body.map_err(|_| invalid("invalid JSON body"))?;
    let principal = principal_of(&headers);

    let throttle_key = if principal == "anonymous" {
        body.requester.email.clone()
    } else {
        principal.clone()
    };
    if !state.throttle.allow(&throttle_key) {
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "submission rate limit reached; try again later".to_string(),
            true,
        ));
    }

    body.requester.validate().map_err(invalid)?;
    if body.title.trim().is_empty() {
        return Err(invalid("title is required"));
    }
    if body.description.trim().is_empty() {
        return Err(invalid("description is required"));
    }
    if body.script.trim().is_empty() {
        return Err(invalid("script body is required"));
    }

    let catalog = state
        .registry
        .get_catalog(&body.catalog_id)
        .map_err(catalog_error)?;

    let options = state
        .registry
        .score_timeline(&catalog.id)
        .map_err(catalog_error)?;
    validate_option(&options, OptionKind::Score, body.selected_score.as_deref())?;
    validate_option(&options, OptionKind::Timeline, body.selected_timeline.as_deref())?;

    for upload_id in &body.uploaded_files {
        if !state.uploads.exists(upload_id) {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "ERR_UPLOAD_NOT_FOUND",
                format!("attached uploaded file `{}` does not exist", upload_id),
                false,
            ));
        }
    }

    let language = match body.kind {
        fedra_contracts::AnalysisKind::Custom => body.language,
        _ => ScriptLanguage::Python,
    };
    let findings = lint::scan(&body.script, language);
    if !findings.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_SCRIPT_REJECTED",
            format!("script contains disallowed patterns: {}", findings.join(", ")),
            false,
        ));
    }

    let now = Utc::now();
    let request = AnalysisRequest {
        id: Ulid::new().to_string(),
        requester: body.requester,
        title: body.title,
        description: body.description,
        research_question: body.research_question,
        methodology: body.methodology,
        expected_outcomes: body.expected_outcomes,
        catalog_id: catalog.id.clone(),
        selected_score: body.selected_score,
        selected_timeline: body.selected_timeline,
        kind: body.kind,
        language: body.language,
        script_hash: canonical::sha256_hex(body.script.as_bytes()),
        script: body.script,
        uploaded_files: body.uploaded_files,
        priority: body.priority,
        estimated_duration: body.estimated_duration,
        state: RequestState::Submitted,
        decision: None,
        job_id: None,
        created_at: now,
        updated_at: now,
    };

    let created = state.requests.create(request).await.map_err(store_error)?;
    metrics::inc_request_created();
    tracing::info!(
        request_id = %created.id,
        catalog_id = %created.catalog_id,
        kind = created.kind.as_str(),
        principal = %principal,
        script_hash = %created.script_hash,
        "request created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateRequestResponse {
            request_id: created.id,
            state: created.state,
        }),
    ))
}

fn validate_option(
    options: &[fedra_contracts::ScoreTimelineOption],
    kind: OptionKind,
    selected: Option<&str>,
) -> Result<(), ApiError> {
    let Some(selected) = selected else {
        return Ok(());
    };
    let known = options
        .iter()
        .filter(|o| o.kind == kind)
        .map(|o| o.value.as_str())
        .collect::<Vec<_>>();
    if known.is_empty() || known.contains(&selected) {
        return Ok(());
    }
    Err(invalid(format!(
        "selected option `{}` is not offered by this catalog",
        selected
    )))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    requester: Option<String>,
    #[serde(default)]
    catalog: Option<String>,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AnalysisRequest>>, ApiError> {
    let state_filter = match &query.state {
        None => None,
        Some(raw) => Some(
            raw.parse::<RequestState>()
                .map_err(|_| invalid(format!("unknown state `{}`", raw)))?,
        ),
    };
    let since = match &query.since {
        None => None,
        Some(raw) => Some(
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| invalid("since must be an RFC 3339 timestamp"))?,
        ),
    };

    let filter = RequestFilter {
        state: state_filter,
        requester_email: query.requester.clone(),
        catalog_id: query.catalog.clone(),
        since,
        limit: Some(query.limit.unwrap_or(100).min(1000)),
    };
    let requests = state.requests.list(&filter).await.map_err(store_error)?;
    Ok(Json(requests))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisRequest>, ApiError> {
    let request = state.requests.get(&id).await.map_err(store_error)?;
    Ok(Json(request))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct DecisionBody {
    approver: String,
    decision: DecisionKind,
    #[serde(default)]
    notes: Option<String>,
}

pub(super) async fn decide(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<DecisionBody>, JsonRejection>,
) -> Result<Json<AnalysisRequest>, ApiError> {
    let Json(body) = body.map_err(|_| invalid("invalid JSON body"))?;

    let approver = body.approver.trim();
    if approver.is_empty() {
        return Err(invalid("approver identity is required"));
    }

    let request = state.requests.get(&id).await.map_err(store_error)?;

    match (request.state, body.decision) {
        (RequestState::Pending, DecisionKind::Approve) => {
            let updated = apply_decision(&state, &id, approver, DecisionKind::Approve, body.notes)
                .await?;
            state.runner.submit(&id);
            metrics::observe_decision("approve");
            tracing::info!(request_id = %id, approver = %approver, "request approved");
            Ok(Json(updated))
        }
        (RequestState::Pending, DecisionKind::Deny) => {
            let notes = body
                .notes
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            if notes.is_none() {
                return Err(invalid("denial requires notes"));
            }
            let updated =
                apply_decision(&state, &id, approver, DecisionKind::Deny, notes).await?;
            metrics::observe_decision("deny");
            tracing::info!(request_id = %id, approver = %approver, "request denied");
            Ok(Json(updated))
        }
        // Re-approval of an approved request is a no-op returning the
        // existing decision record.
        (RequestState::Approved, DecisionKind::Approve) => Ok(Json(request)),
        (RequestState::Approved, DecisionKind::Deny) => Err(json_error(
            StatusCode::CONFLICT,
            "ERR_STATE_CONFLICT",
            "request is already approved; the first decision wins".to_string(),
            false,
        )),
        (other, _) => Err(json_error(
            StatusCode::CONFLICT,
            "ERR_STATE_CONFLICT",
            format!("request is {} and cannot be decided", other.as_str()),
            false,
        )),
    }
}

async fn apply_decision(
    state: &AppState,
    id: &str,
    approver: &str,
    decision: DecisionKind,
    notes: Option<String>,
) -> Result<AnalysisRequest, ApiError> {
    let new_state = match decision {
        DecisionKind::Approve => RequestState::Approved,
        DecisionKind::Deny => RequestState::Denied,
    };

    state
        .requests
        .update_state(
            id,
            StateUpdate {
                new_state,
                decision: Some(DecisionRecord {
                    approver: approver.to_string(),
                    decision,
                    notes: notes.clone(),
                    decided_at: Utc::now(),
                }),
                job_id: None,
                actor: approver.to_string(),
                notes,
            },
        )
        .await
        .map_err(store_error)
}

#[derive(Debug, Serialize)]
pub(super) struct CancelResponse {
    request_id: String,
    status: &'static str,
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let request = state.requests.get(&id).await.map_err(store_error)?;

    match request.state {
        // Cancelling a pending request is a denial by the requester.
        RequestState::Pending => {
            let email = request.requester.email.clone();
            apply_decision(
                &state,
                &id,
                &email,
                DecisionKind::Deny,
                Some("cancelled by requester".to_string()),
            )
            .await?;
            Ok((
                StatusCode::OK,
                Json(CancelResponse {
                    request_id: id,
                    status: "denied",
                }),
            ))
        }
        RequestState::Running => {
            state.runner.cancel(&id);
            Ok((
                StatusCode::ACCEPTED,
                Json(CancelResponse {
                    request_id: id,
                    status: "cancelling",
                }),
            ))
        }
        other => Err(json_error(
            StatusCode::CONFLICT,
            "ERR_STATE_CONFLICT",
            format!("request is {} and cannot be cancelled", other.as_str()),
            false,
        )),
    }
}

pub(super) async fn results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ReleasedResult>>, ApiError> {
    // 404 for unknown ids, empty list for known ones without results.
    state.requests.get(&id).await.map_err(store_error)?;
    let released = state.results.released(&id).await.map_err(store_error)?;
    Ok(Json(released))
}

pub(super) async fn admin_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ResultRecord>>, ApiError> {
    state.requests.get(&id).await.map_err(store_error)?;
    let rows = state.results.all(&id).await.map_err(store_error)?;
    Ok(Json(rows))
}

pub(super) async fn job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let request = state.requests.get(&id).await.map_err(store_error)?;
    let Some(job_id) = request.job_id.as_deref() else {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "ERR_NO_JOB",
            "request has not started execution".to_string(),
            false,
        ));
    };
    let job = state.jobs.get(job_id).await.map_err(store_error)?;
    Ok(Json(job))
}
