//! Read-only translation lookups.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use forumport_core::idmap::SourceKey;

use crate::error::AppError;
use crate::json::TranslationResponse;
use crate::AppState;

/// Translation routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/translations/:entity_type/:source_id", get(lookup))
}

/// Look up one `(entity_type, source_id)` pair.
async fn lookup(
    State(state): State<AppState>,
    Path((entity_type, source_id)): Path<(String, String)>,
) -> Result<Json<TranslationResponse>, AppError> {
    if entity_type.is_empty() || source_id.is_empty() {
        return Err(AppError::BadRequest("entity type and source id are required".into()));
    }
    let lookup = state
        .lookup
        .lookup(&entity_type, &SourceKey::from(source_id.as_str()))?;
    Ok(Json(TranslationResponse::new(entity_type, source_id, lookup)))
}
