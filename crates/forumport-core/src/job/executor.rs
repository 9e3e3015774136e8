//! Job executor: runs planned steps in order within a time budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::context::{DerivedData, JobContext};
use super::graph::StepGraph;
use super::runner::{StepOutcome, TimeBudget};
use super::state::{JobState, JobStateStore, JobStatus, StepState, StepStatus};
use super::step::{Step, StepDef};
use crate::error::Error;

/// Step definitions with their implementations.
pub struct StepCatalog {
    graph: StepGraph,
    steps: HashMap<String, Box<dyn Step>>,
}

impl StepCatalog {
    /// Validate the graph and index the implementations.
    pub fn new(entries: Vec<(StepDef, Box<dyn Step>)>) -> Result<Self, Error> {
        let mut defs = Vec::with_capacity(entries.len());
        let mut steps = HashMap::with_capacity(entries.len());
        for (def, step) in entries {
            steps.insert(def.name.clone(), step);
            defs.push(def);
        }
        Ok(Self {
            graph: StepGraph::new(defs)?,
            steps,
        })
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    fn step(&self, name: &str) -> Result<&dyn Step, Error> {
        self.steps
            .get(name)
            .map(|step| step.as_ref())
            .ok_or_else(|| Error::UnknownStep(name.to_string()))
    }
}

/// Scheduler view of a step within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Not part of the plan.
    NotStarted,
    /// Planned, waiting for its turn.
    Queued,
    /// Entered at least once, cursor valid.
    Running,
    /// Complete.
    Done,
    /// Halted by a step-fatal error; retried on the next invocation.
    Failed,
    /// Waiting on a failed or unfinished dependency.
    Blocked,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleStatus::NotStarted => "not_started",
            ScheduleStatus::Queued => "queued",
            ScheduleStatus::Running => "running",
            ScheduleStatus::Done => "done",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Operator-facing progress of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepProgress {
    pub name: String,
    pub title: String,
    pub status: ScheduleStatus,
    pub start_after: u64,
    pub end: u64,
    pub imported: u64,
    pub skipped: u64,
    pub invocations: u32,
    pub percent: f64,
    pub error: Option<String>,
}

/// Operator-facing progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub status: String,
    /// When the job was planned (microseconds since epoch).
    pub created_at: u64,
    pub steps: Vec<StepProgress>,
    /// No step can make progress until an operator intervenes.
    pub stalled: bool,
}

impl JobProgress {
    pub fn is_complete(&self) -> bool {
        self.status == JobStatus::Complete.to_string()
    }

    /// Steps halted by an error.
    pub fn failed(&self) -> impl Iterator<Item = &StepProgress> {
        self.steps
            .iter()
            .filter(|step| step.status == ScheduleStatus::Failed)
    }

    pub fn imported(&self) -> u64 {
        self.steps.iter().map(|step| step.imported).sum()
    }
}

/// Drives one job over repeated bounded invocations.
pub struct JobExecutor {
    catalog: StepCatalog,
    ctx: JobContext,
    store: Arc<JobStateStore>,
}

impl JobExecutor {
    pub fn new(catalog: StepCatalog, ctx: JobContext, store: Arc<JobStateStore>) -> Self {
        let ctx = ctx.with_state_store(store.clone());
        Self {
            catalog,
            ctx,
            store,
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    fn job_id(&self) -> String {
        self.ctx.job_id().to_string()
    }

    /// Plan `selected` (and what it needs) and persist the job.
    ///
    /// Every configuration problem surfaces here, before any step runs.
    pub fn start<S: AsRef<str>>(&self, selected: &[S]) -> Result<JobState, Error> {
        self.ctx.config().validate()?;
        let job_id = self.job_id();
        let done: HashSet<String> = self.store.completed_steps(&job_id)?.into_iter().collect();
        let plan = self.catalog.graph.plan(selected, &done)?;

        let mut job = JobState::new(&job_id, plan);
        if let Some(previous) = self.store.load_job(&job_id)? {
            job.derived = previous.derived;
            if previous.status != JobStatus::Complete {
                job.created_at = previous.created_at;
            }
        }
        self.store.save_job(&job)?;
        self.store.flush()?;
        info!(job_id = %job_id, steps = ?job.plan, "job planned");
        Ok(job)
    }

    fn load_job(&self) -> Result<JobState, Error> {
        let job_id = self.job_id();
        self.store
            .load_job(&job_id)?
            .ok_or_else(|| Error::StateCorrupted(format!("job {job_id} has not been started")))
    }

    fn load_step(&self, job_id: &str, name: &str) -> Result<StepState, Error> {
        if let Some(state) = self.store.load_step(job_id, name)? {
            return Ok(state);
        }
        let archived = self
            .store
            .list_archived_steps(job_id)?
            .into_iter()
            .find(|state| state.step == name && state.is_complete());
        Ok(archived.unwrap_or_else(|| StepState::new(name)))
    }

    fn save_derived(&self, job: &mut JobState) -> Result<(), Error> {
        job.derived = serde_json::to_string(self.ctx.derived())?;
        self.store.save_job(job)
    }

    /// Run planned steps until the budget is used up or nothing is left.
    pub fn run_once(&mut self, budget: &TimeBudget) -> Result<JobProgress, Error> {
        let mut job = self.load_job()?;
        if job.status == JobStatus::Complete {
            return self.status();
        }
        let derived: DerivedData = serde_json::from_str(&job.derived)
            .map_err(|e| Error::StateCorrupted(format!("derived data: {e}")))?;
        self.ctx.restore_derived(derived);
        job.status = JobStatus::Running;

        let job_id = job.job_id.clone();
        let mut completed: HashSet<String> = HashSet::new();
        let mut halted: HashSet<String> = HashSet::new();
        let mut ran_any = false;
        let mut out_of_time = false;

        for name in job.plan.clone() {
            let mut state = self.load_step(&job_id, &name)?;
            if state.is_complete() {
                completed.insert(name);
                continue;
            }

            let def = self
                .catalog
                .graph
                .get(&name)
                .ok_or_else(|| Error::UnknownStep(name.clone()))?;
            let waiting = def
                .depends
                .iter()
                .any(|dep| job.plan.contains(dep) && !completed.contains(dep));
            if waiting {
                warn!(step = %name, "dependencies incomplete, step blocked");
                halted.insert(name);
                continue;
            }

            if ran_any && budget.exceeded() {
                out_of_time = true;
                break;
            }
            ran_any = true;

            match self.run_step(&mut state, budget) {
                Ok(StepOutcome::Complete) => {
                    state.complete();
                    self.store.save_step(&job_id, &state)?;
                    info!(
                        step = %name,
                        imported = state.imported,
                        skipped = state.skipped,
                        "step complete"
                    );
                    completed.insert(name);
                }
                Ok(StepOutcome::Continue) => {
                    self.store.save_step(&job_id, &state)?;
                    out_of_time = true;
                    break;
                }
                Err(err) => {
                    error!(step = %name, start_after = state.start_after, error = %err, "step failed");
                    state.fail(err.to_string());
                    self.store.save_step(&job_id, &state)?;
                    halted.insert(name);
                }
            }
            self.save_derived(&mut job)?;
        }

        if completed.len() == job.plan.len() {
            job.complete();
            self.save_derived(&mut job)?;
            let archived = self.store.archive(&job_id)?;
            info!(job_id = %job_id, archived, "job complete");
        } else {
            self.save_derived(&mut job)?;
        }

        self.ctx.ids().flush()?;
        self.store.flush()?;

        let mut progress = self.status()?;
        progress.stalled = !progress.is_complete() && !out_of_time && !halted.is_empty();
        Ok(progress)
    }

    fn run_step(&mut self, state: &mut StepState, budget: &TimeBudget) -> Result<StepOutcome, Error> {
        let step = self.catalog.step(&state.step)?;
        if state.started_at.is_none() {
            step.setup(&mut self.ctx)?;
            let end = step.end(&self.ctx)?;
            state.start(end);
            self.ctx.checkpoint(state)?;
            info!(step = %state.step, end, "step started");
        } else {
            state.resume();
            info!(
                step = %state.step,
                start_after = state.start_after,
                end = state.end,
                "step resumed"
            );
        }
        state.invocations += 1;
        step.run(state, budget, &mut self.ctx)
    }

    /// Run bounded invocations until the job completes or stalls.
    pub fn run_until_complete(&mut self, budget: std::time::Duration) -> Result<JobProgress, Error> {
        loop {
            let progress = self.run_once(&TimeBudget::new(budget))?;
            if progress.is_complete() || progress.stalled {
                return Ok(progress);
            }
        }
    }

    /// Current progress without running anything.
    pub fn status(&self) -> Result<JobProgress, Error> {
        let job = self.load_job()?;
        let job_id = job.job_id.clone();
        let mut states: HashMap<String, StepState> = HashMap::new();
        for state in self.store.list_archived_steps(&job_id)? {
            states.insert(state.step.clone(), state);
        }
        for state in self.store.list_steps(&job_id)? {
            states.insert(state.step.clone(), state);
        }

        let mut unfinished: HashSet<&str> = HashSet::new();
        let mut steps = Vec::new();
        for def in self.catalog.graph.defs() {
            let planned = job.plan.contains(&def.name);
            let state = states
                .remove(&def.name)
                .unwrap_or_else(|| StepState::new(&def.name));
            let blocked = def.depends.iter().any(|dep| unfinished.contains(dep.as_str()));
            let status = match state.status {
                StepStatus::Complete => ScheduleStatus::Done,
                StepStatus::Failed => ScheduleStatus::Failed,
                _ if !planned => ScheduleStatus::NotStarted,
                _ if blocked && state.started_at.is_none() => ScheduleStatus::Blocked,
                StepStatus::InProgress => ScheduleStatus::Running,
                StepStatus::Pending => ScheduleStatus::Queued,
            };
            if status == ScheduleStatus::Failed || status == ScheduleStatus::Blocked {
                unfinished.insert(def.name.as_str());
            }
            steps.push(StepProgress {
                name: def.name.clone(),
                title: def.title.clone(),
                status,
                start_after: state.start_after,
                end: state.end,
                imported: state.imported,
                skipped: state.skipped,
                invocations: state.invocations,
                percent: state.percent_complete(),
                error: state.error.clone(),
            });
        }

        Ok(JobProgress {
            job_id,
            status: job.status.to_string(),
            created_at: job.created_at,
            steps,
            stalled: false,
        })
    }
}
