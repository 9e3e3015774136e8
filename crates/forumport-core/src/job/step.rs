//! Step definitions and the step trait.

use serde::{Deserialize, Serialize};

use super::context::JobContext;
use super::runner::{StepOutcome, TimeBudget};
use super::state::StepState;
use crate::error::Error;

/// Job-scoped data computed by one step and read by others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Derived {
    /// Target profile column -> source option column.
    FieldMap,
    /// Target custom field id -> source option column.
    CustomFieldMap,
    /// Reaction id used for negative likes.
    DislikeReaction,
}

impl std::fmt::Display for Derived {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Derived::FieldMap => write!(f, "field_map"),
            Derived::CustomFieldMap => write!(f, "custom_field_map"),
            Derived::DislikeReaction => write!(f, "dislike_reaction"),
        }
    }
}

/// Static description of an import step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDef {
    /// Unique step name.
    pub name: String,
    /// Human readable title.
    pub title: String,
    /// Steps that must be done before this one may start.
    pub depends: Vec<String>,
    /// Steps implicitly queued after this one when it is selected.
    pub forces: Vec<String>,
    /// Preferred over other steps that become ready at the same time.
    pub run_early: bool,
    /// Derived data this step reads.
    pub reads: Vec<Derived>,
    /// Derived data this step produces.
    pub provides: Vec<Derived>,
}

impl StepDef {
    /// Create a step with no edges.
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            depends: Vec::new(),
            forces: Vec::new(),
            run_early: false,
            reads: Vec::new(),
            provides: Vec::new(),
        }
    }

    /// Add dependencies.
    pub fn depends_on(mut self, steps: &[&str]) -> Self {
        self.depends.extend(steps.iter().map(|s| s.to_string()));
        self
    }

    /// Add forced followers.
    pub fn forces(mut self, steps: &[&str]) -> Self {
        self.forces.extend(steps.iter().map(|s| s.to_string()));
        self
    }

    /// Prefer this step among simultaneously ready steps.
    pub fn run_early(mut self) -> Self {
        self.run_early = true;
        self
    }

    /// Declare derived data this step reads.
    pub fn reads(mut self, data: &[Derived]) -> Self {
        self.reads.extend_from_slice(data);
        self
    }

    /// Declare derived data this step produces.
    pub fn provides(mut self, data: &[Derived]) -> Self {
        self.provides.extend_from_slice(data);
        self
    }
}

/// An executable import step.
///
/// `run` is invoked repeatedly, each time with a fresh [`TimeBudget`], until it
/// reports [`StepOutcome::Complete`]. All progress must be reflected in the
/// supplied [`StepState`] so an interrupted step resumes where it stopped.
pub trait Step: Send + Sync {
    /// Runs once, on the step's first invocation, before `end` is computed.
    fn setup(&self, _ctx: &mut JobContext) -> Result<(), Error> {
        Ok(())
    }

    /// Upper bound of the source cursor, fixed when the step starts.
    fn end(&self, _ctx: &JobContext) -> Result<u64, Error> {
        Ok(0)
    }

    /// Do a bounded amount of work.
    fn run(
        &self,
        state: &mut StepState,
        budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error>;
}
