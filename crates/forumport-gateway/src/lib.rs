//! Forumport HTTP gateway.
//!
//! Serves the legacy URL redirect resolver over HTTP: requests for source
//! board URLs are answered with a permanent redirect to the imported content,
//! everything else gets the ordinary 404. The gateway only ever reads the
//! import table.

pub mod config;
pub mod error;
pub mod json;
pub mod routes;

pub use config::{Args, GatewayConfig};
pub use error::AppError;

use std::sync::Arc;

use axum::Router;
use forumport_core::idmap::TranslationLookup;
use forumport_core::redirect::{LegacyUrlResolver, LinkBuilder};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Read-only view of the import table.
    pub lookup: Arc<dyn TranslationLookup>,
    /// Legacy URL resolver over `lookup`.
    pub resolver: LegacyUrlResolver,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        lookup: Arc<dyn TranslationLookup>,
        config: GatewayConfig,
    ) -> Result<Self, forumport_core::Error> {
        let resolver =
            LegacyUrlResolver::new(lookup.clone(), LinkBuilder::new(config.base_url.clone()))?;
        Ok(Self {
            lookup,
            resolver,
            config,
        })
    }
}

/// Create the router with all routes.
///
/// Unmatched requests fall through to the legacy URL resolver.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::translation::routes())
        .fallback(routes::redirect::legacy_redirect)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
