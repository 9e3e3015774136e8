//! Staged, resumable import jobs.
//!
//! A job is a plan of named steps ordered by their `depends`/`forces` edges
//! ([`StepGraph`]). The [`JobExecutor`] runs the plan over many bounded
//! invocations; paged steps are driven record by record by the
//! [`BatchRunner`], which checkpoints a monotonic cursor into the
//! [`JobStateStore`] so an interrupted import resumes where it stopped.

mod config;
mod context;
mod executor;
mod graph;
mod runner;
mod state;
mod step;

pub use config::{
    BaseConfig, JobConfig, RunnerConfig, SourceConfig, StepConfig, UserStepConfig,
    DEFAULT_GUEST_TIMEZONE, DEFAULT_MAX_TIME_SECS, DEFAULT_TABLE_PREFIX,
};
pub use context::{DerivedData, JobContext};
pub use executor::{JobExecutor, JobProgress, ScheduleStatus, StepCatalog, StepProgress};
pub use graph::StepGraph;
pub use runner::{
    BatchRunner, Paged, PagedStep, RecordOutcome, SkipReason, StepOutcome, TimeBudget,
    DEFAULT_PAGE_LIMIT,
};
pub use state::{JobState, JobStateStore, JobStatus, StepState, StepStatus};
pub use step::{Derived, Step, StepDef};

#[cfg(test)]
pub(crate) use context::tests::{
    memory_context, memory_context_with_config, memory_context_with_target,
};
