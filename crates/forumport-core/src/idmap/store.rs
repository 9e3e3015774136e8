//! Sled-backed translation store.

use std::collections::HashMap;

use dashmap::DashMap;
use sled::Tree;
use tracing::{debug, trace};

use super::{Lookup, SourceKey, Translation, TranslationLookup};
use crate::error::Error;

/// Default tree name for translations (the "import table").
pub const IMPORT_LOG_TREE: &str = "import:log";

/// Durable translation store.
///
/// Key format: `entity_type\0source_id` -> encoded [`Translation`].
pub struct IdMapStore {
    tree: Tree,
    name: String,
    /// Pre-warmed lookups, including negative entries.
    cache: DashMap<Vec<u8>, Option<Translation>>,
}

impl IdMapStore {
    /// Open or create the store in the default tree.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        Self::open_named(db, IMPORT_LOG_TREE)
    }

    /// Open or create the store in a named tree.
    pub fn open_named(db: &sled::Db, name: &str) -> Result<Self, Error> {
        if name.is_empty() {
            return Err(Error::Config("import table name must not be empty".into()));
        }
        let tree = db.open_tree(name)?;
        Ok(Self {
            tree,
            name: name.to_string(),
            cache: DashMap::new(),
        })
    }

    /// Name of the backing tree.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn build_key(entity_type: &str, source_id: &SourceKey) -> Vec<u8> {
        let mut key = Vec::with_capacity(entity_type.len() + 1 + source_id.as_str().len());
        key.extend_from_slice(entity_type.as_bytes());
        key.push(0);
        key.extend_from_slice(source_id.as_str().as_bytes());
        key
    }

    fn type_prefix(entity_type: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(entity_type.len() + 1);
        prefix.extend_from_slice(entity_type.as_bytes());
        prefix.push(0);
        prefix
    }

    /// Record that `source_id` was imported as `target_id`.
    ///
    /// Idempotent for an identical translation; fails with
    /// [`Error::DuplicateMapping`] if a different one exists.
    pub fn put(
        &self,
        entity_type: &str,
        source_id: impl Into<SourceKey>,
        target_id: u64,
    ) -> Result<(), Error> {
        self.record(entity_type, source_id.into(), Translation::Mapped(target_id))
    }

    /// Record that `source_id` is deliberately not imported.
    pub fn put_excluded(
        &self,
        entity_type: &str,
        source_id: impl Into<SourceKey>,
    ) -> Result<(), Error> {
        self.record(entity_type, source_id.into(), Translation::Excluded)
    }

    fn record(
        &self,
        entity_type: &str,
        source_id: SourceKey,
        translation: Translation,
    ) -> Result<(), Error> {
        let key = Self::build_key(entity_type, &source_id);
        let value = translation.encode();

        if let Err(conflict) = self
            .tree
            .compare_and_swap(&key, None::<&[u8]>, Some(value))?
        {
            let existing = match conflict.current {
                Some(bytes) => Translation::decode(&bytes)?,
                None => {
                    return Err(Error::StateCorrupted(format!(
                        "translation for {entity_type} {source_id} vanished during write"
                    )))
                }
            };
            if existing != translation {
                return Err(Error::DuplicateMapping {
                    entity_type: entity_type.to_string(),
                    source_id,
                    existing,
                    attempted: translation,
                });
            }
            trace!(entity_type, source_id = %source_id, "translation already recorded");
        }

        self.cache.insert(key, Some(translation));
        Ok(())
    }

    /// Recorded translation, if any.
    pub fn get(
        &self,
        entity_type: &str,
        source_id: impl Into<SourceKey>,
    ) -> Result<Option<Translation>, Error> {
        let key = Self::build_key(entity_type, &source_id.into());
        if let Some(cached) = self.cache.get(&key).map(|entry| *entry) {
            return Ok(cached);
        }
        self.read(&key)
    }

    fn read(&self, key: &[u8]) -> Result<Option<Translation>, Error> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(Translation::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Tri-state lookup.
    pub fn lookup(
        &self,
        entity_type: &str,
        source_id: impl Into<SourceKey>,
    ) -> Result<Lookup, Error> {
        self.get(entity_type, source_id).map(Lookup::from)
    }

    /// Target id of a source record, if mapped.
    pub fn target(
        &self,
        entity_type: &str,
        source_id: impl Into<SourceKey>,
    ) -> Result<Option<u64>, Error> {
        Ok(self.lookup(entity_type, source_id)?.target())
    }

    /// Batch lookup. Warms the cache for subsequent single lookups.
    ///
    /// The result contains only ids with a recorded translation.
    pub fn get_many<I, K>(
        &self,
        entity_type: &str,
        source_ids: I,
    ) -> Result<HashMap<SourceKey, Translation>, Error>
    where
        I: IntoIterator<Item = K>,
        K: Into<SourceKey>,
    {
        let mut found = HashMap::new();
        for source_id in source_ids {
            let source_id = source_id.into();
            if found.contains_key(&source_id) {
                continue;
            }
            let key = Self::build_key(entity_type, &source_id);
            let cached = self.cache.get(&key).map(|entry| *entry);
            let translation = match cached {
                Some(cached) => cached,
                None => {
                    let translation = self.read(&key)?;
                    self.cache.insert(key, translation);
                    translation
                }
            };
            if let Some(translation) = translation {
                found.insert(source_id, translation);
            }
        }
        debug!(entity_type, found = found.len(), "pre-warmed translations");
        Ok(found)
    }

    /// Target id, or `default` when the record is excluded or not mapped.
    pub fn resolve_or_default(
        &self,
        entity_type: &str,
        source_id: impl Into<SourceKey>,
        default: u64,
    ) -> Result<u64, Error> {
        Ok(self.lookup(entity_type, source_id)?.or_default(default))
    }

    /// Number of translations recorded for an entity type.
    pub fn count(&self, entity_type: &str) -> Result<usize, Error> {
        let mut count = 0;
        for item in self.tree.scan_prefix(Self::type_prefix(entity_type)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// All translations recorded for an entity type, ordered by key bytes.
    pub fn entries(&self, entity_type: &str) -> Result<Vec<(SourceKey, Translation)>, Error> {
        let prefix = Self::type_prefix(entity_type);
        let mut entries = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (key, value) = item?;
            let source = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            entries.push((SourceKey::from(source), Translation::decode(&value)?));
        }
        Ok(entries)
    }

    /// Drop the pre-warm cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Remove every translation. Used when an import is torn down.
    pub fn clear(&self) -> Result<(), Error> {
        self.tree.clear()?;
        self.cache.clear();
        Ok(())
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.tree.flush()?;
        Ok(())
    }
}

impl TranslationLookup for IdMapStore {
    fn lookup(&self, entity_type: &str, source_id: &SourceKey) -> Result<Lookup, Error> {
        IdMapStore::lookup(self, entity_type, source_id)
    }
}

/// Lookup-only handle on an existing import table.
///
/// Opening fails if the table was never created, so a misconfigured resolver
/// is rejected up front instead of silently missing every lookup.
#[derive(Clone)]
pub struct ReadOnlyIdMap {
    tree: Tree,
}

impl ReadOnlyIdMap {
    /// Open an existing import table.
    pub fn open(db: &sled::Db, name: &str) -> Result<Self, Error> {
        let exists = db
            .tree_names()
            .iter()
            .any(|tree| &tree[..] == name.as_bytes());
        if !exists {
            return Err(Error::Config(format!("import table {name} does not exist")));
        }
        Ok(Self {
            tree: db.open_tree(name)?,
        })
    }
}

impl TranslationLookup for ReadOnlyIdMap {
    fn lookup(&self, entity_type: &str, source_id: &SourceKey) -> Result<Lookup, Error> {
        let key = IdMapStore::build_key(entity_type, source_id);
        match self.tree.get(key)? {
            Some(bytes) => Ok(Lookup::from(Some(Translation::decode(&bytes)?))),
            None => Ok(Lookup::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.put("user", 42u64, 1007).unwrap();
        assert_eq!(store.get("user", 42u64).unwrap(), Some(Translation::Mapped(1007)));
        assert_eq!(store.get("user", 43u64).unwrap(), None);
        assert_eq!(store.get("thread", 42u64).unwrap(), None);
    }

    #[test]
    fn test_put_identical_is_idempotent() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.put("user", 42u64, 1007).unwrap();
        store.put("user", 42u64, 1007).unwrap();
        assert_eq!(store.count("user").unwrap(), 1);
    }

    #[test]
    fn test_put_conflict_fails() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.put("user", 42u64, 1007).unwrap();
        let err = store.put("user", 42u64, 1008).unwrap_err();
        match err {
            Error::DuplicateMapping {
                entity_type,
                source_id,
                existing,
                attempted,
            } => {
                assert_eq!(entity_type, "user");
                assert_eq!(source_id, SourceKey::from(42u64));
                assert_eq!(existing, Translation::Mapped(1007));
                assert_eq!(attempted, Translation::Mapped(1008));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.get("user", 42u64).unwrap(), Some(Translation::Mapped(1007)));
    }

    #[test]
    fn test_excluded_is_distinct_from_missing() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.put_excluded("user_group", 1u64).unwrap();
        assert!(store.lookup("user_group", 1u64).unwrap().is_excluded());
        assert!(store.lookup("user_group", 6u64).unwrap().is_missing());
        assert_eq!(store.resolve_or_default("user_group", 1u64, 2).unwrap(), 2);
        assert!(store.put("user_group", 1u64, 5).unwrap_err().is_duplicate_mapping());
    }

    #[test]
    fn test_get_many_returns_present_only() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.put("user", 1u64, 11).unwrap();
        store.put("user", 3u64, 13).unwrap();
        let found = store.get_many("user", [1u64, 2, 3, 3]).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&SourceKey::from(3u64)], Translation::Mapped(13));
        assert!(!found.contains_key(&SourceKey::from(2u64)));
    }

    #[test]
    fn test_negative_cache_updated_by_put() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.get_many("post", [5u64]).unwrap();
        assert_eq!(store.get("post", 5u64).unwrap(), None);
        store.put("post", 5u64, 50).unwrap();
        assert_eq!(store.target("post", 5u64).unwrap(), Some(50));
    }

    #[test]
    fn test_resolve_or_default() {
        let db = temp_db();
        let store = IdMapStore::open(&db).unwrap();

        store.put("user", 42u64, 1007).unwrap();
        assert_eq!(store.resolve_or_default("user", 42u64, 0).unwrap(), 1007);
        assert_eq!(store.resolve_or_default("user", 99u64, 0).unwrap(), 0);
    }

    #[test]
    fn test_entries_and_clear() {
        let db = temp_db();
        let store = IdMapStore::open_named(&db, "import:custom").unwrap();

        store.put("node", 2u64, 20).unwrap();
        store.put("node", 1u64, 10).unwrap();
        store.put("node_permission", SourceKey::pair(1, 3), 1).unwrap();

        let entries = store.entries("node").unwrap();
        assert_eq!(
            entries,
            vec![
                (SourceKey::from(1u64), Translation::Mapped(10)),
                (SourceKey::from(2u64), Translation::Mapped(20)),
            ]
        );

        store.clear().unwrap();
        assert_eq!(store.count("node").unwrap(), 0);
        assert_eq!(store.get("node", 1u64).unwrap(), None);
    }

    #[test]
    fn test_mappings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let store = IdMapStore::open(&db).unwrap();
            store.put("thread", 7u64, 70).unwrap();
            store.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let store = IdMapStore::open(&db).unwrap();
        assert_eq!(store.target("thread", 7u64).unwrap(), Some(70));
    }

    #[test]
    fn test_read_only_view() {
        let db = temp_db();
        assert!(ReadOnlyIdMap::open(&db, IMPORT_LOG_TREE).is_err());

        let store = IdMapStore::open(&db).unwrap();
        store.put("forum", 4u64, 40).unwrap();

        let view = ReadOnlyIdMap::open(&db, IMPORT_LOG_TREE).unwrap();
        assert_eq!(
            view.lookup("forum", &SourceKey::from(4u64)).unwrap(),
            Lookup::Mapped(40)
        );
        assert_eq!(
            view.lookup("forum", &SourceKey::from(5u64)).unwrap(),
            Lookup::Missing
        );
    }
}
