//! Importable entities and the typed registry that builds them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use super::{EntityKind, Fields, TargetStore};
use crate::error::Error;
use crate::idmap::{IdMapStore, SourceKey, Translation};

/// Handles every entity needs to persist itself.
#[derive(Clone)]
pub struct ImportServices {
    pub target: Arc<dyn TargetStore>,
    pub ids: Arc<IdMapStore>,
}

impl ImportServices {
    pub fn new(target: Arc<dyn TargetStore>, ids: Arc<IdMapStore>) -> Self {
        Self { target, ids }
    }
}

/// A target record under construction.
pub trait ImportableEntity: Send {
    /// Kind of record.
    fn kind(&self) -> EntityKind;

    /// Merge a set of fields.
    fn bulk_set(&mut self, fields: Fields);

    /// Set one field.
    fn set(&mut self, name: &str, value: Value);

    /// Current value of a field.
    fn get(&self, name: &str) -> Option<&Value>;

    /// All fields set so far.
    fn fields(&self) -> &Fields;

    /// Attach a child saved after this record, linked through the child kind's
    /// parent field.
    fn add_child(&mut self, source_id: SourceKey, child: Box<dyn ImportableEntity>);

    /// Persist the record and record its translation.
    ///
    /// Returns the existing target id if the source record was already
    /// imported, and `None` when the target rejects the record or the source
    /// record is excluded.
    fn save(&mut self, source_id: SourceKey) -> Result<Option<u64>, Error>;

    /// Persist the record without recording a translation.
    fn save_unlogged(&mut self) -> Result<Option<u64>, Error>;
}

/// Plain record: fields plus optional children.
pub struct EntityRecord {
    kind: EntityKind,
    fields: Fields,
    children: Vec<(SourceKey, Box<dyn ImportableEntity>)>,
    services: ImportServices,
}

impl EntityRecord {
    pub fn new(kind: EntityKind, services: ImportServices) -> Self {
        Self {
            kind,
            fields: Fields::new(),
            children: Vec::new(),
            services,
        }
    }

    /// Registry constructor.
    pub fn construct(kind: EntityKind, services: ImportServices) -> Box<dyn ImportableEntity> {
        Box::new(Self::new(kind, services))
    }

    fn save_children(&mut self, parent_id: u64) -> Result<(), Error> {
        for (source_id, mut child) in self.children.drain(..) {
            if let Some(field) = child.kind().parent_field() {
                child.set(field, Value::from(parent_id));
            }
            if child.save(source_id.clone())?.is_none() {
                debug!(
                    entity_type = child.kind().content_type(),
                    source_id = %source_id,
                    parent_id,
                    "child record rejected"
                );
            }
        }
        Ok(())
    }
}

impl ImportableEntity for EntityRecord {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn bulk_set(&mut self, fields: Fields) {
        self.fields.extend(fields);
    }

    fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn add_child(&mut self, source_id: SourceKey, child: Box<dyn ImportableEntity>) {
        self.children.push((source_id, child));
    }

    fn save(&mut self, source_id: SourceKey) -> Result<Option<u64>, Error> {
        let entity_type = self.kind.content_type();
        let target_id = match self.services.ids.get(entity_type, &source_id)? {
            Some(Translation::Excluded) => return Ok(None),
            Some(Translation::Mapped(existing)) => {
                trace!(entity_type, source_id = %source_id, existing, "already imported");
                existing
            }
            None => match self.services.target.create(self.kind, &self.fields)? {
                Some(created) => {
                    self.services.ids.put(entity_type, &source_id, created)?;
                    created
                }
                None => return Ok(None),
            },
        };
        self.save_children(target_id)?;
        Ok(Some(target_id))
    }

    fn save_unlogged(&mut self) -> Result<Option<u64>, Error> {
        let created = self.services.target.create(self.kind, &self.fields)?;
        if let Some(id) = created {
            self.save_children(id)?;
        }
        Ok(created)
    }
}

/// Node record. Forum nodes are also logged under the `forum` alias used by
/// legacy board links.
pub struct NodeRecord {
    inner: EntityRecord,
}

impl NodeRecord {
    /// Translation alias recorded for forum nodes.
    pub const FORUM_ALIAS: &'static str = "forum";

    pub fn construct(kind: EntityKind, services: ImportServices) -> Box<dyn ImportableEntity> {
        Box::new(Self {
            inner: EntityRecord::new(kind, services),
        })
    }

    fn is_forum(&self) -> bool {
        self.inner
            .get("node_type")
            .and_then(Value::as_str)
            .is_some_and(|t| t == "Forum")
    }
}

impl ImportableEntity for NodeRecord {
    fn kind(&self) -> EntityKind {
        self.inner.kind()
    }

    fn bulk_set(&mut self, fields: Fields) {
        self.inner.bulk_set(fields);
    }

    fn set(&mut self, name: &str, value: Value) {
        self.inner.set(name, value);
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.inner.get(name)
    }

    fn fields(&self) -> &Fields {
        self.inner.fields()
    }

    fn add_child(&mut self, source_id: SourceKey, child: Box<dyn ImportableEntity>) {
        self.inner.add_child(source_id, child);
    }

    fn save(&mut self, source_id: SourceKey) -> Result<Option<u64>, Error> {
        let saved = self.inner.save(source_id.clone())?;
        if let Some(id) = saved {
            if self.is_forum() {
                self.inner
                    .services
                    .ids
                    .put(Self::FORUM_ALIAS, source_id, id)?;
            }
        }
        Ok(saved)
    }

    fn save_unlogged(&mut self) -> Result<Option<u64>, Error> {
        self.inner.save_unlogged()
    }
}

/// Builds an entity of a kind.
pub type EntityConstructor = fn(EntityKind, ImportServices) -> Box<dyn ImportableEntity>;

/// Maps entity kinds to constructors.
pub struct EntityRegistry {
    constructors: HashMap<EntityKind, EntityConstructor>,
}

impl EntityRegistry {
    /// Registry with no kinds.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register or replace the constructor of a kind.
    pub fn register(&mut self, kind: EntityKind, constructor: EntityConstructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Whether a kind can be built.
    pub fn contains(&self, kind: EntityKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build an empty entity.
    pub fn create(
        &self,
        kind: EntityKind,
        services: ImportServices,
    ) -> Result<Box<dyn ImportableEntity>, Error> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| Error::Config(format!("no entity registered for {kind}")))?;
        Ok(constructor(kind, services))
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in EntityKind::ALL {
            registry.register(kind, EntityRecord::construct);
        }
        registry.register(EntityKind::Node, NodeRecord::construct);
        registry
    }
}

/// Registry bound to the services of one job.
#[derive(Clone)]
pub struct EntityFactory {
    registry: Arc<EntityRegistry>,
    services: ImportServices,
}

impl EntityFactory {
    pub fn new(registry: Arc<EntityRegistry>, services: ImportServices) -> Self {
        Self { registry, services }
    }

    /// New empty entity of `kind`.
    pub fn new_entity(&self, kind: EntityKind) -> Result<Box<dyn ImportableEntity>, Error> {
        self.registry.create(kind, self.services.clone())
    }

    /// Target store behind the factory.
    pub fn target(&self) -> &Arc<dyn TargetStore> {
        &self.services.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::Lookup;
    use crate::target::MemoryTarget;
    use serde_json::json;

    fn factory() -> (EntityFactory, Arc<MemoryTarget>, Arc<IdMapStore>) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ids = Arc::new(IdMapStore::open(&db).unwrap());
        let target = Arc::new(MemoryTarget::new());
        let services = ImportServices::new(target.clone(), ids.clone());
        (
            EntityFactory::new(Arc::new(EntityRegistry::default()), services),
            target,
            ids,
        )
    }

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[test]
    fn test_save_records_translation() {
        let (factory, target, ids) = factory();
        let mut user = factory.new_entity(EntityKind::User).unwrap();
        user.bulk_set(fields(json!({ "username": "jane", "email": "j@x.org" })));
        let id = user.save(SourceKey::from(42u64)).unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(ids.target("user", 42u64).unwrap(), Some(1));
        assert_eq!(target.count(EntityKind::User).unwrap(), 1);
    }

    #[test]
    fn test_save_is_reentrant() {
        let (factory, target, _) = factory();
        for _ in 0..3 {
            let mut user = factory.new_entity(EntityKind::User).unwrap();
            user.set("username", json!("jane"));
            assert_eq!(user.save(SourceKey::from(42u64)).unwrap(), Some(1));
        }
        assert_eq!(target.count(EntityKind::User).unwrap(), 1);
    }

    #[test]
    fn test_rejected_record_is_not_logged() {
        let (factory, _, ids) = factory();
        let mut user = factory.new_entity(EntityKind::User).unwrap();
        assert_eq!(user.save(SourceKey::from(7u64)).unwrap(), None);
        assert_eq!(ids.lookup("user", 7u64).unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_excluded_record_is_not_created() {
        let (factory, target, ids) = factory();
        ids.put_excluded("user_group", 1u64).unwrap();
        let mut group = factory.new_entity(EntityKind::UserGroup).unwrap();
        group.set("title", json!("Everyone"));
        assert_eq!(group.save(SourceKey::from(1u64)).unwrap(), None);
        assert_eq!(target.count(EntityKind::UserGroup).unwrap(), 0);
    }

    #[test]
    fn test_children_get_parent_link() {
        let (factory, target, ids) = factory();
        let mut conversation = factory.new_entity(EntityKind::Conversation).unwrap();
        conversation.set("title", json!("Hi"));
        for (message_id, text) in [(10u64, "first"), (11, "second")] {
            let mut message = factory.new_entity(EntityKind::ConversationMessage).unwrap();
            message.set("message", json!(text));
            conversation.add_child(SourceKey::from(message_id), message);
        }
        let id = conversation.save(SourceKey::from(3u64)).unwrap().unwrap();

        let messages = target.records(EntityKind::ConversationMessage);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|(_, m)| m["conversation_id"] == json!(id)));
        assert_eq!(ids.target("conversation_message", 11u64).unwrap(), Some(2));
    }

    #[test]
    fn test_forum_nodes_record_alias() {
        let (factory, _, ids) = factory();
        let mut forum = factory.new_entity(EntityKind::Node).unwrap();
        forum.bulk_set(fields(json!({ "title": "General", "node_type": "Forum" })));
        let id = forum.save(SourceKey::from(4u64)).unwrap();
        assert_eq!(ids.target("forum", 4u64).unwrap(), id);

        let mut category = factory.new_entity(EntityKind::Node).unwrap();
        category.bulk_set(fields(json!({ "title": "Main", "node_type": "Category" })));
        category.save(SourceKey::from(5u64)).unwrap();
        assert_eq!(ids.lookup("forum", 5u64).unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_unregistered_kind_fails() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let services = ImportServices::new(
            Arc::new(MemoryTarget::new()),
            Arc::new(IdMapStore::open(&db).unwrap()),
        );
        let registry = EntityRegistry::empty();
        assert!(!registry.contains(EntityKind::Poll));
        assert!(matches!(
            registry.create(EntityKind::Poll, services),
            Err(Error::Config(_))
        ));
    }
}
