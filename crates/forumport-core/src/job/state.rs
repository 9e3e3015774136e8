//! Job and step state persistence.
//!
//! Tracks the cursor of every step so an interrupted import resumes where it
//! stopped, and keeps finished jobs in an archive tree for status reporting.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;

/// Current time in microseconds since the Unix epoch.
pub(crate) fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job planned but no step has run.
    Pending,
    /// At least one step has run and work remains.
    Running,
    /// Every planned step completed.
    Complete,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum StepStatus {
    /// Step not yet started.
    Pending,
    /// Step started, cursor valid.
    InProgress,
    /// Step completed.
    Complete,
    /// Step hit a fatal error; cursor valid, retried on the next invocation.
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Complete => write!(f, "complete"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Resumable progress of one step.
///
/// `start_after` is the last source ordinal fully handled; it only moves
/// forward and never exceeds `end`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct StepState {
    /// Step name.
    pub step: String,
    /// Current status.
    pub status: StepStatus,
    /// Last source ordinal handled.
    pub start_after: u64,
    /// Upper bound fixed when the step started.
    pub end: u64,
    /// Records imported so far.
    pub imported: u64,
    /// Records skipped so far.
    pub skipped: u64,
    /// Number of bounded invocations so far.
    pub invocations: u32,
    /// When the step started (microseconds since epoch).
    pub started_at: Option<u64>,
    /// When the step completed (microseconds since epoch).
    pub completed_at: Option<u64>,
    /// Last fatal error, if any.
    pub error: Option<String>,
}

impl StepState {
    /// Fresh state for a step.
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Pending,
            start_after: 0,
            end: 0,
            imported: 0,
            skipped: 0,
            invocations: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Mark the step as started with a fixed upper bound.
    pub fn start(&mut self, end: u64) {
        self.status = StepStatus::InProgress;
        self.end = end;
        self.started_at = Some(current_timestamp());
    }

    /// Mark the step as complete.
    pub fn complete(&mut self) {
        self.status = StepStatus::Complete;
        self.completed_at = Some(current_timestamp());
        self.error = None;
    }

    /// Mark the step as failed. The cursor is kept.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
    }

    /// Resume a failed step.
    pub fn resume(&mut self) {
        if self.status == StepStatus::Failed {
            self.status = StepStatus::InProgress;
        }
    }

    /// Move the cursor forward.
    pub fn advance(&mut self, ordinal: u64) -> Result<(), Error> {
        if ordinal <= self.start_after || ordinal > self.end {
            return Err(Error::StateCorrupted(format!(
                "step {} cursor cannot move from {} to {} (end {})",
                self.step, self.start_after, ordinal, self.end
            )));
        }
        self.start_after = ordinal;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }

    /// Calculate percentage of the cursor range covered.
    pub fn percent_complete(&self) -> f64 {
        if self.is_complete() || self.end == 0 {
            100.0
        } else {
            (self.start_after as f64 / self.end as f64) * 100.0
        }
    }

    /// Serialize the state to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize state from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Persistent job state.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct JobState {
    /// Job identifier.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Steps in execution order.
    pub plan: Vec<String>,
    /// Derived data shared between steps, JSON encoded.
    pub derived: String,
    /// When the job was created (microseconds since epoch).
    pub created_at: u64,
    /// When the job completed (microseconds since epoch).
    pub completed_at: Option<u64>,
}

impl JobState {
    /// Create a new job state.
    pub fn new(job_id: impl Into<String>, plan: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            plan,
            derived: String::from("{}"),
            created_at: current_timestamp(),
            completed_at: None,
        }
    }

    /// Mark the job as complete.
    pub fn complete(&mut self) {
        self.status = JobStatus::Complete;
        self.completed_at = Some(current_timestamp());
    }

    /// Serialize the state to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize state from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Job state store for persistence.
pub struct JobStateStore {
    tree: sled::Tree,
    archive: sled::Tree,
}

impl JobStateStore {
    /// Tree name for live job state.
    pub const TREE_NAME: &'static str = "import:job";
    /// Tree name for archived step state.
    pub const ARCHIVE_TREE_NAME: &'static str = "import:archive";

    /// Open or create the job state store.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        Ok(Self {
            tree: db.open_tree(Self::TREE_NAME)?,
            archive: db.open_tree(Self::ARCHIVE_TREE_NAME)?,
        })
    }

    /// Save a job state.
    pub fn save_job(&self, state: &JobState) -> Result<(), Error> {
        self.tree
            .insert(Self::job_key(&state.job_id), state.to_bytes()?)?;
        Ok(())
    }

    /// Load a job state.
    pub fn load_job(&self, job_id: &str) -> Result<Option<JobState>, Error> {
        match self.tree.get(Self::job_key(job_id))? {
            Some(bytes) => Ok(Some(JobState::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Save a step state.
    pub fn save_step(&self, job_id: &str, state: &StepState) -> Result<(), Error> {
        self.tree
            .insert(Self::step_key(job_id, &state.step), state.to_bytes()?)?;
        Ok(())
    }

    /// Load a step state.
    pub fn load_step(&self, job_id: &str, step: &str) -> Result<Option<StepState>, Error> {
        match self.tree.get(Self::step_key(job_id, step))? {
            Some(bytes) => Ok(Some(StepState::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All live step states of a job.
    pub fn list_steps(&self, job_id: &str) -> Result<Vec<StepState>, Error> {
        Self::scan_steps(&self.tree, job_id)
    }

    /// All archived step states of a job.
    pub fn list_archived_steps(&self, job_id: &str) -> Result<Vec<StepState>, Error> {
        Self::scan_steps(&self.archive, job_id)
    }

    fn scan_steps(tree: &sled::Tree, job_id: &str) -> Result<Vec<StepState>, Error> {
        let mut states = Vec::new();
        for item in tree.scan_prefix(Self::step_prefix(job_id)) {
            let (_, value) = item?;
            states.push(StepState::from_bytes(&value)?);
        }
        Ok(states)
    }

    /// Names of steps of this job that completed, live or archived.
    pub fn completed_steps(&self, job_id: &str) -> Result<Vec<String>, Error> {
        let mut live = self.list_steps(job_id)?;
        live.extend(self.list_archived_steps(job_id)?);
        Ok(live
            .into_iter()
            .filter(StepState::is_complete)
            .map(|s| s.step)
            .collect())
    }

    /// Move a job's step states into the archive tree.
    pub fn archive(&self, job_id: &str) -> Result<usize, Error> {
        let mut moved = 0;
        for item in self.tree.scan_prefix(Self::step_prefix(job_id)) {
            let (key, value) = item?;
            self.archive.insert(&key, value)?;
            self.tree.remove(&key)?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Delete a job and all of its state, live and archived.
    pub fn delete(&self, job_id: &str) -> Result<(), Error> {
        self.tree.remove(Self::job_key(job_id))?;
        for tree in [&self.tree, &self.archive] {
            for item in tree.scan_prefix(Self::step_prefix(job_id)) {
                let (key, _) = item?;
                tree.remove(key)?;
            }
        }
        Ok(())
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.tree.flush()?;
        self.archive.flush()?;
        Ok(())
    }

    fn job_key(job_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + job_id.len());
        key.extend_from_slice(b"job:");
        key.extend_from_slice(job_id.as_bytes());
        key
    }

    fn step_prefix(job_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(6 + job_id.len());
        key.extend_from_slice(b"step:");
        key.extend_from_slice(job_id.as_bytes());
        key.push(0);
        key
    }

    fn step_key(job_id: &str, step: &str) -> Vec<u8> {
        let mut key = Self::step_prefix(job_id);
        key.extend_from_slice(step.as_bytes());
        key
    }
}
