//! In-memory target, used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;

use super::{field_matches, EntityKind, Fields, TargetStore};
use crate::error::Error;

#[derive(Default)]
struct Inner {
    records: HashMap<EntityKind, BTreeMap<u64, Fields>>,
    rejecting: HashSet<EntityKind>,
    failing: HashSet<EntityKind>,
}

/// Target records held in memory.
#[derive(Default)]
pub struct MemoryTarget {
    inner: Mutex<Inner>,
}

impl MemoryTarget {
    /// Create an empty target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decline every record of `kind` (save returns no id).
    pub fn reject(&self, kind: EntityKind) {
        self.inner.lock().rejecting.insert(kind);
    }

    /// Fail every write of `kind` with a target error.
    pub fn fail(&self, kind: EntityKind) {
        self.inner.lock().failing.insert(kind);
    }

    /// Undo [`fail`](Self::fail) and [`reject`](Self::reject).
    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        inner.rejecting.clear();
        inner.failing.clear();
    }

    /// All records of a kind, ordered by id.
    pub fn records(&self, kind: EntityKind) -> Vec<(u64, Fields)> {
        self.inner
            .lock()
            .records
            .get(&kind)
            .map(|records| records.iter().map(|(id, f)| (*id, f.clone())).collect())
            .unwrap_or_default()
    }
}

impl TargetStore for MemoryTarget {
    fn create(&self, kind: EntityKind, fields: &Fields) -> Result<Option<u64>, Error> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(&kind) {
            return Err(Error::Target(format!("{kind} writes are failing")));
        }
        if inner.rejecting.contains(&kind) || !kind.accepts(fields) {
            return Ok(None);
        }
        let records = inner.records.entry(kind).or_default();
        let last = records.keys().next_back().copied().unwrap_or(0);
        let id = last.max(kind.reserved_ids()) + 1;
        records.insert(id, fields.clone());
        Ok(Some(id))
    }

    fn update(&self, kind: EntityKind, id: u64, fields: &Fields) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(&kind) {
            return Err(Error::Target(format!("{kind} writes are failing")));
        }
        let record = inner
            .records
            .get_mut(&kind)
            .and_then(|records| records.get_mut(&id))
            .ok_or_else(|| Error::Target(format!("{kind} {id} does not exist")))?;
        for (name, value) in fields {
            record.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn get(&self, kind: EntityKind, id: u64) -> Result<Option<Fields>, Error> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&kind)
            .and_then(|records| records.get(&id))
            .cloned())
    }

    fn find_by(&self, kind: EntityKind, field: &str, value: &Value) -> Result<Option<u64>, Error> {
        Ok(self.inner.lock().records.get(&kind).and_then(|records| {
            records
                .iter()
                .find(|(_, fields)| field_matches(fields, field, value))
                .map(|(id, _)| *id)
        }))
    }

    fn max_where(
        &self,
        kind: EntityKind,
        field: &str,
        where_field: &str,
        where_value: &Value,
    ) -> Result<Option<i64>, Error> {
        Ok(self.inner.lock().records.get(&kind).and_then(|records| {
            records
                .values()
                .filter(|fields| field_matches(fields, where_field, where_value))
                .filter_map(|fields| fields.get(field).and_then(Value::as_i64))
                .max()
        }))
    }

    fn count(&self, kind: EntityKind) -> Result<u64, Error> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&kind)
            .map(|records| records.len() as u64)
            .unwrap_or(0))
    }
}
