//! Legacy URL redirects.

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use forumport_core::redirect::Resolution;

use crate::error::AppError;
use crate::AppState;

/// Fallback handler: permanent redirect for a resolvable legacy URL, the
/// ordinary 404 otherwise.
pub async fn legacy_redirect(State(state): State<AppState>, uri: Uri) -> Response {
    let not_found = || AppError::NotFound(format!("no route for {}", uri.path())).into_response();
    if !state.config.redirects_enabled {
        return not_found();
    }

    let request = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    match state.resolver.resolve(request) {
        Resolution::Redirect(location) => {
            (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
        }
        Resolution::PassThrough => not_found(),
    }
}
