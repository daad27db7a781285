use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use fedra_contracts::{UploadKind, UploadedFile};
use serde::Deserialize;

use super::{ApiError, AppState, json_error, principal_of, upload_error};
use crate::metrics;

#[derive(Debug, Deserialize)]
pub(super) struct UploadQuery {
    original_name: String,
}

pub(super) async fn put_script(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadedFile>), ApiError> {
    store(state, query, headers, body, UploadKind::Script)
}

pub(super) async fn put_data(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadedFile>), ApiError> {
    store(state, query, headers, body, UploadKind::Data)
}

fn store(
    state: AppState,
    query: UploadQuery,
    headers: HeaderMap,
    body: Bytes,
    kind: UploadKind,
) -> Result<(StatusCode, Json<UploadedFile>), ApiError> {
    let original_name = query.original_name.trim();
    if original_name.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "original_name is required".to_string(),
            false,
        ));
    }
    if body.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "upload body is empty".to_string(),
            false,
        ));
    }

    let uploaded = match kind {
        UploadKind::Script => state.uploads.put_script(original_name, &body),
        UploadKind::Data => state.uploads.put_data(original_name, &body),
    }
    .map_err(upload_error)?;

    metrics::observe_upload(kind.as_str());
    tracing::info!(
        upload_id = %uploaded.id,
        kind = kind.as_str(),
        principal = %principal_of(&headers),
        size_bytes = uploaded.size_bytes,
        "upload accepted"
    );

    Ok((StatusCode::CREATED, Json(uploaded)))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    kind: String,
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<UploadedFile>>, ApiError> {
    let kind = match query.kind.as_str() {
        "script" => UploadKind::Script,
        "data" => UploadKind::Data,
        other => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PARAMS",
                format!("kind must be `script` or `data`, got `{}`", other),
                false,
            ));
        }
    };

    let listed = state.uploads.list(kind).map_err(upload_error)?;
    Ok(Json(listed))
}
