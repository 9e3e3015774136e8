//! Sled-backed target sink.
//!
//! One tree per kind (`target:<content_type>`), big-endian id keys, JSON
//! values. Lookups by field scan the tree.

use serde_json::Value;

use super::{field_matches, EntityKind, Fields, TargetStore};
use crate::error::Error;

/// Prefix of the per-kind trees.
pub const TARGET_TREE_PREFIX: &str = "target:";

/// Target records stored in sled.
pub struct SledTarget {
    db: sled::Db,
}

impl SledTarget {
    /// Use an open database.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        Ok(Self { db: db.clone() })
    }

    fn tree(&self, kind: EntityKind) -> Result<sled::Tree, Error> {
        Ok(self
            .db
            .open_tree(format!("{TARGET_TREE_PREFIX}{}", kind.content_type()))?)
    }

    fn decode(bytes: &[u8]) -> Result<Fields, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    fn scan(&self, kind: EntityKind) -> Result<Vec<(u64, Fields)>, Error> {
        let mut out = Vec::new();
        for item in self.tree(kind)?.iter() {
            let (key, value) = item?;
            out.push((decode_id(&key)?, Self::decode(&value)?));
        }
        Ok(out)
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_id(key: &[u8]) -> Result<u64, Error> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Deserialization(format!("invalid target key: {}", hex::encode(key))))?;
    Ok(u64::from_be_bytes(bytes))
}

impl TargetStore for SledTarget {
    fn create(&self, kind: EntityKind, fields: &Fields) -> Result<Option<u64>, Error> {
        if !kind.accepts(fields) {
            return Ok(None);
        }
        let tree = self.tree(kind)?;
        let last = match tree.last()? {
            Some((key, _)) => decode_id(&key)?,
            None => 0,
        };
        let id = last.max(kind.reserved_ids()) + 1;
        tree.insert(id.to_be_bytes(), serde_json::to_vec(fields)?)?;
        Ok(Some(id))
    }

    fn update(&self, kind: EntityKind, id: u64, fields: &Fields) -> Result<(), Error> {
        let tree = self.tree(kind)?;
        let mut record = match tree.get(id.to_be_bytes())? {
            Some(bytes) => Self::decode(&bytes)?,
            None => return Err(Error::Target(format!("{kind} {id} does not exist"))),
        };
        for (name, value) in fields {
            record.insert(name.clone(), value.clone());
        }
        tree.insert(id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    fn get(&self, kind: EntityKind, id: u64) -> Result<Option<Fields>, Error> {
        match self.tree(kind)?.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by(&self, kind: EntityKind, field: &str, value: &Value) -> Result<Option<u64>, Error> {
        Ok(self
            .scan(kind)?
            .into_iter()
            .find(|(_, fields)| field_matches(fields, field, value))
            .map(|(id, _)| id))
    }

    fn max_where(
        &self,
        kind: EntityKind,
        field: &str,
        where_field: &str,
        where_value: &Value,
    ) -> Result<Option<i64>, Error> {
        Ok(self
            .scan(kind)?
            .into_iter()
            .filter(|(_, fields)| field_matches(fields, where_field, where_value))
            .filter_map(|(_, fields)| fields.get(field).and_then(Value::as_i64))
            .max())
    }

    fn count(&self, kind: EntityKind) -> Result<u64, Error> {
        Ok(self.tree(kind)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[test]
    fn test_create_get_update() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let target = SledTarget::open(&db).unwrap();

        let id = target
            .create(EntityKind::Thread, &fields(json!({ "node_id": 3, "title": "Hello" })))
            .unwrap()
            .unwrap();
        assert_eq!(id, 1);
        target
            .update(EntityKind::Thread, id, &fields(json!({ "prefix_id": 2 })))
            .unwrap();
        let record = target.get(EntityKind::Thread, id).unwrap().unwrap();
        assert_eq!(record["title"], "Hello");
        assert_eq!(record["prefix_id"], 2);
        assert_eq!(target.count(EntityKind::Thread).unwrap(), 1);
        assert_eq!(
            target.find_by(EntityKind::Thread, "title", &json!("hello")).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_ids_continue_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let target = SledTarget::open(&db).unwrap();
            let group = fields(json!({ "title": "Members" }));
            assert_eq!(target.create(EntityKind::UserGroup, &group).unwrap(), Some(5));
            target.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let target = SledTarget::open(&db).unwrap();
        let group = fields(json!({ "title": "Staff" }));
        assert_eq!(target.create(EntityKind::UserGroup, &group).unwrap(), Some(6));
    }
}
