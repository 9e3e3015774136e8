//! Core error types.
//!
//! Every variant here is fatal to at least the step that raised it. Conditions
//! that only affect a single source record are reported through
//! [`SkipReason`](crate::job::SkipReason) instead and never travel through `?`.

use thiserror::Error;

use crate::idmap::{SourceKey, Translation};

/// Core import errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A different translation already exists for this source record.
    #[error(
        "duplicate mapping for {entity_type} {source_id}: existing {existing}, attempted {attempted}"
    )]
    DuplicateMapping {
        /// Entity type of the mapping.
        entity_type: String,
        /// Source identifier that was being mapped.
        source_id: SourceKey,
        /// Translation already recorded.
        existing: Translation,
        /// Translation that was rejected.
        attempted: Translation,
    },

    /// The step graph contains a cycle.
    #[error("dependency cycle between steps: {}", steps.join(" -> "))]
    DependencyCycle {
        /// Steps participating in the cycle, first step repeated at the end.
        steps: Vec<String>,
    },

    /// A step name that is not part of the catalog.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A step depends on (or forces) a step that does not exist.
    #[error("step {step} references unknown step {dependency}")]
    UnknownDependency {
        /// Step declaring the edge.
        step: String,
        /// Missing target of the edge.
        dependency: String,
    },

    /// A step reads derived data that none of its dependencies provide.
    #[error("step {step} reads {data} but no step it depends on provides it")]
    UndeclaredRead {
        /// Consuming step.
        step: String,
        /// Derived data name.
        data: String,
    },

    /// Derived data was read before the producing step ran.
    #[error("derived data {0} has not been produced yet")]
    MissingDerived(String),

    /// Invalid job configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Source data store failure.
    #[error("source error: {0}")]
    Source(String),

    /// Target write API failure.
    #[error("target error: {0}")]
    Target(String),

    /// Persisted job state is inconsistent.
    #[error("state corrupted: {0}")]
    StateCorrupted(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Source(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Config(format!("invalid rewrite pattern: {err}"))
    }
}

impl Error {
    /// Whether this error was raised by a broken mapping invariant.
    pub fn is_duplicate_mapping(&self) -> bool {
        matches!(self, Error::DuplicateMapping { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_mapping_message() {
        let err = Error::DuplicateMapping {
            entity_type: "user".into(),
            source_id: SourceKey::from(42u64),
            existing: Translation::Mapped(1007),
            attempted: Translation::Mapped(1008),
        };
        assert!(err.is_duplicate_mapping());
        assert_eq!(
            err.to_string(),
            "duplicate mapping for user 42: existing 1007, attempted 1008"
        );
    }

    #[test]
    fn test_cycle_message() {
        let err = Error::DependencyCycle {
            steps: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle between steps: a -> b -> a");
    }
}
