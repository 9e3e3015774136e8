//! JSON response bodies.

use forumport_core::idmap::Lookup;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Import table the gateway reads.
    pub import_table: String,
    pub redirects_enabled: bool,
}

/// Translation lookup response.
#[derive(Debug, Serialize)]
pub struct TranslationResponse {
    pub entity_type: String,
    pub source_id: String,
    /// `mapped`, `excluded` or `missing`.
    pub state: &'static str,
    pub target_id: Option<u64>,
}

impl TranslationResponse {
    pub fn new(entity_type: String, source_id: String, lookup: Lookup) -> Self {
        let (state, target_id) = match lookup {
            Lookup::Mapped(id) => ("mapped", Some(id)),
            Lookup::Excluded => ("excluded", None),
            Lookup::Missing => ("missing", None),
        };
        Self {
            entity_type,
            source_id,
            state,
            target_id,
        }
    }
}
