//! Identifier translation store.
//!
//! Durable `(entity_type, source_id) -> target_id` mappings written by the
//! import steps and read by later steps, by the content rewriter and by the
//! legacy URL resolver.
//!
//! A mapping is write-once: recording the same translation twice is a no-op,
//! recording a different one fails with
//! [`Error::DuplicateMapping`](crate::Error::DuplicateMapping).
//!
//! Reads distinguish three states:
//!
//! | state | meaning |
//! |-------|---------|
//! | [`Lookup::Mapped`] | imported, target id known |
//! | [`Lookup::Excluded`] | deliberately not imported |
//! | [`Lookup::Missing`] | not imported (yet) |

mod store;

pub use store::{IdMapStore, ReadOnlyIdMap, IMPORT_LOG_TREE};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of a record in the source system.
///
/// Most source ids are numeric ordinals; a few mappings use composite keys
/// such as `"<node>_<group>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    /// Build a composite key from two parts.
    pub fn pair(a: impl std::fmt::Display, b: impl std::fmt::Display) -> Self {
        Self(format!("{a}_{b}"))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if the key is a plain ordinal.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for SourceKey {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for SourceKey {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SourceKey {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&SourceKey> for SourceKey {
    fn from(id: &SourceKey) -> Self {
        id.clone()
    }
}

/// A recorded translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "target_id")]
pub enum Translation {
    /// Imported as the given target id.
    Mapped(u64),
    /// Deliberately not imported.
    Excluded,
}

impl Translation {
    const TAG_EXCLUDED: u8 = 0;
    const TAG_MAPPED: u8 = 1;

    /// Target id, if mapped.
    pub fn target(&self) -> Option<u64> {
        match self {
            Translation::Mapped(id) => Some(*id),
            Translation::Excluded => None,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Translation::Excluded => vec![Self::TAG_EXCLUDED],
            Translation::Mapped(id) => {
                let mut buf = Vec::with_capacity(9);
                buf.push(Self::TAG_MAPPED);
                buf.extend_from_slice(&id.to_be_bytes());
                buf
            }
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        match bytes {
            [Self::TAG_EXCLUDED] => Ok(Translation::Excluded),
            [Self::TAG_MAPPED, rest @ ..] if rest.len() == 8 => {
                let mut id = [0u8; 8];
                id.copy_from_slice(rest);
                Ok(Translation::Mapped(u64::from_be_bytes(id)))
            }
            _ => Err(Error::Deserialization(format!(
                "invalid translation value: {}",
                hex::encode(bytes)
            ))),
        }
    }
}

impl std::fmt::Display for Translation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Translation::Mapped(id) => write!(f, "{id}"),
            Translation::Excluded => write!(f, "excluded"),
        }
    }
}

/// Result of a single lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Imported as the given target id.
    Mapped(u64),
    /// Deliberately not imported.
    Excluded,
    /// No translation recorded.
    Missing,
}

impl Lookup {
    /// Target id, if mapped.
    pub fn target(self) -> Option<u64> {
        match self {
            Lookup::Mapped(id) => Some(id),
            Lookup::Excluded | Lookup::Missing => None,
        }
    }

    /// Target id, or `default` when excluded or missing.
    pub fn or_default(self, default: u64) -> u64 {
        self.target().unwrap_or(default)
    }

    pub fn is_excluded(self) -> bool {
        matches!(self, Lookup::Excluded)
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Lookup::Missing)
    }
}

impl From<Option<Translation>> for Lookup {
    fn from(value: Option<Translation>) -> Self {
        match value {
            Some(Translation::Mapped(id)) => Lookup::Mapped(id),
            Some(Translation::Excluded) => Lookup::Excluded,
            None => Lookup::Missing,
        }
    }
}

/// Read-only view over recorded translations.
pub trait TranslationLookup: Send + Sync {
    /// Look up the translation of a source record.
    fn lookup(&self, entity_type: &str, source_id: &SourceKey) -> Result<Lookup, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_encoding() {
        let mapped = Translation::Mapped(0x0102_0304);
        assert_eq!(Translation::decode(&mapped.encode()).unwrap(), mapped);
        assert_eq!(
            Translation::decode(&Translation::Excluded.encode()).unwrap(),
            Translation::Excluded
        );
        assert!(Translation::decode(&[1, 2, 3]).is_err());
        assert!(Translation::decode(&[]).is_err());
    }

    #[test]
    fn test_lookup_states() {
        assert_eq!(Lookup::from(Some(Translation::Mapped(7))).target(), Some(7));
        assert!(Lookup::from(Some(Translation::Excluded)).is_excluded());
        assert!(Lookup::from(None).is_missing());
        assert_eq!(Lookup::Excluded.or_default(2), 2);
        assert_eq!(Lookup::Mapped(9).or_default(2), 9);
    }

    #[test]
    fn test_source_key() {
        assert_eq!(SourceKey::from(42u64).as_u64(), Some(42));
        assert_eq!(SourceKey::pair(3, 9).as_str(), "3_9");
        assert_eq!(SourceKey::pair(3, 9).as_u64(), None);
    }
}
