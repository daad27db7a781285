use axum::Json;
use axum::extract::{Path, State};
use fedra_contracts::{CatalogSpec, Column, ScoreTimelineOption};

use super::{ApiError, AppState, catalog_error};

pub(super) async fn list(State(state): State<AppState>) -> Result<Json<Vec<CatalogSpec>>, ApiError> {
    let catalogs = state.registry.list_catalogs().map_err(catalog_error)?;
    Ok(Json(catalogs))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CatalogSpec>, ApiError> {
    let catalog = state.registry.get_catalog(&id).map_err(catalog_error)?;
    Ok(Json(catalog))
}

pub(super) async fn score_timeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ScoreTimelineOption>>, ApiError> {
    let options = state.registry.score_timeline(&id).map_err(catalog_error)?;
    Ok(Json(options))
}

pub(super) async fn schema(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<Vec<Column>>, ApiError> {
    let columns = state.registry.schema_of(&id, &name).map_err(catalog_error)?;
    Ok(Json(columns))
}
