//! Job-scoped context handed to every step invocation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::config::JobConfig;
use super::state::{JobStateStore, StepState};
use super::step::Derived;
use crate::error::Error;
use crate::idmap::IdMapStore;
use crate::rewrite::{RewriteContext, RewriteEngine};
use crate::source::{SourceReader, SourceTable};
use crate::target::{
    EntityFactory, EntityKind, EntityRegistry, ImportServices, ImportableEntity, TargetStore,
};

/// Data computed by one step and read by later ones.
///
/// Persisted with the job so a restarted process sees what earlier
/// invocations produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedData {
    /// Which entries have been produced.
    pub produced: BTreeSet<Derived>,
    /// Target profile column -> source option column.
    pub field_map: BTreeMap<String, String>,
    /// Target custom field id -> source option column.
    pub custom_field_map: BTreeMap<String, String>,
    /// Reaction used for negative likes, if any were found.
    pub dislike_reaction: Option<u64>,
}

impl DerivedData {
    fn require(&self, data: Derived) -> Result<(), Error> {
        if self.produced.contains(&data) {
            Ok(())
        } else {
            Err(Error::MissingDerived(data.to_string()))
        }
    }
}

/// Everything a step may touch while it runs.
pub struct JobContext {
    config: JobConfig,
    source: Arc<dyn SourceReader>,
    ids: Arc<IdMapStore>,
    entities: EntityFactory,
    rewriter: Arc<RewriteEngine>,
    derived: DerivedData,
    store: Option<Arc<JobStateStore>>,
    object_types: Mutex<HashMap<String, Option<u64>>>,
    positions: HashMap<u64, i64>,
}

impl JobContext {
    /// Build a context with the default entity registry.
    pub fn new(
        config: JobConfig,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetStore>,
        ids: Arc<IdMapStore>,
    ) -> Result<Self, Error> {
        let rewriter = Arc::new(RewriteEngine::new(config.base.full_unicode)?);
        let services = ImportServices::new(target, ids.clone());
        Ok(Self {
            config,
            source,
            ids,
            entities: EntityFactory::new(Arc::new(EntityRegistry::default()), services),
            rewriter,
            derived: DerivedData::default(),
            store: None,
            object_types: Mutex::new(HashMap::new()),
            positions: HashMap::new(),
        })
    }

    /// Persist checkpoints to `store`.
    pub fn with_state_store(mut self, store: Arc<JobStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the entity registry.
    pub fn with_registry(mut self, registry: EntityRegistry) -> Self {
        let services = ImportServices::new(self.entities.target().clone(), self.ids.clone());
        self.entities = EntityFactory::new(Arc::new(registry), services);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn source(&self) -> &dyn SourceReader {
        self.source.as_ref()
    }

    pub fn ids(&self) -> &IdMapStore {
        &self.ids
    }

    pub fn target(&self) -> &dyn TargetStore {
        self.entities.target().as_ref()
    }

    pub fn rewriter(&self) -> &RewriteEngine {
        &self.rewriter
    }

    /// New empty entity of `kind`.
    pub fn new_entity(&self, kind: EntityKind) -> Result<Box<dyn ImportableEntity>, Error> {
        self.entities.new_entity(kind)
    }

    /// Rewrite source content into the target dialect.
    pub fn rewrite(&self, content: &str, update_content_ids: bool) -> String {
        let ctx = RewriteContext::new(self.ids.as_ref(), update_content_ids);
        self.rewriter.rewrite(content, &ctx)
    }

    /// Persist a step's progress.
    pub fn checkpoint(&self, state: &StepState) -> Result<(), Error> {
        if let Some(store) = &self.store {
            store.save_step(&self.config.job_id, state)?;
        }
        trace!(step = %state.step, start_after = state.start_after, "checkpoint");
        Ok(())
    }

    pub fn derived(&self) -> &DerivedData {
        &self.derived
    }

    /// Replace derived data, e.g. when resuming a persisted job.
    pub fn restore_derived(&mut self, derived: DerivedData) {
        self.derived = derived;
    }

    pub fn field_map(&self) -> Result<&BTreeMap<String, String>, Error> {
        self.derived.require(Derived::FieldMap)?;
        Ok(&self.derived.field_map)
    }

    pub fn custom_field_map(&self) -> Result<&BTreeMap<String, String>, Error> {
        self.derived.require(Derived::CustomFieldMap)?;
        Ok(&self.derived.custom_field_map)
    }

    pub fn dislike_reaction(&self) -> Result<Option<u64>, Error> {
        self.derived.require(Derived::DislikeReaction)?;
        Ok(self.derived.dislike_reaction)
    }

    pub fn set_field_map(&mut self, map: BTreeMap<String, String>) {
        self.derived.field_map = map;
        self.derived.produced.insert(Derived::FieldMap);
    }

    pub fn set_custom_field_map(&mut self, map: BTreeMap<String, String>) {
        self.derived.custom_field_map = map;
        self.derived.produced.insert(Derived::CustomFieldMap);
    }

    pub fn set_dislike_reaction(&mut self, reaction: Option<u64>) {
        self.derived.dislike_reaction = reaction;
        self.derived.produced.insert(Derived::DislikeReaction);
    }

    /// Source id of an object type such as `com.woltlab.wbb.post`.
    pub fn object_type_id(&self, name: &str) -> Result<Option<u64>, Error> {
        if let Some(id) = self.object_types.lock().get(name) {
            return Ok(*id);
        }
        let table = SourceTable::new(self.config.wcf_table("object_type"), "objectTypeID");
        let id = self
            .source
            .fetch_by(&table, "objectType", &[Value::from(name)])?
            .first()
            .map(|row| row.key);
        self.object_types.lock().insert(name.to_string(), id);
        Ok(id)
    }

    /// Position for the next post of a thread. Only visible posts advance it.
    pub fn next_post_position(&mut self, thread_id: u64, visible: bool) -> Result<i64, Error> {
        let current = match self.positions.get(&thread_id) {
            Some(position) => *position,
            None => self
                .target()
                .max_where(EntityKind::Post, "position", "thread_id", &Value::from(thread_id))?
                .unwrap_or(-1),
        };
        if visible {
            self.positions.insert(thread_id, current + 1);
            Ok(current + 1)
        } else {
            self.positions.insert(thread_id, current);
            Ok(current.max(0))
        }
    }
}
