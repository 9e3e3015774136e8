//! Command execution against a local data directory.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use forumport_core::idmap::{IdMapStore, SourceKey};
use forumport_core::job::{JobConfig, JobContext, JobExecutor, JobStateStore, TimeBudget};
use forumport_core::rewrite::{RewriteContext, RewriteEngine};
use forumport_core::source::{MemorySource, SourceReader, SqliteSource};
use forumport_core::target::SledTarget;
use forumport_core::wbb;
use tracing::{info, warn};

use crate::formatter::{create_formatter, Formatter};
use crate::{Args, Command};

/// Stores of one data directory.
struct Workspace {
    db: sled::Db,
    config: JobConfig,
}

impl Workspace {
    fn open(data_dir: &Path, config: JobConfig) -> Result<Self> {
        let db = sled::open(data_dir)
            .with_context(|| format!("cannot open data directory {}", data_dir.display()))?;
        Ok(Self { db, config })
    }

    fn states(&self) -> Result<Arc<JobStateStore>> {
        Ok(Arc::new(JobStateStore::open(&self.db)?))
    }

    fn ids(&self) -> Result<Arc<IdMapStore>> {
        Ok(Arc::new(IdMapStore::open(&self.db)?))
    }

    /// Executor over `source`, writing into the data directory's target.
    fn executor(&self, source: Arc<dyn SourceReader>) -> Result<JobExecutor> {
        let target = Arc::new(SledTarget::open(&self.db)?);
        let ctx = JobContext::new(self.config.clone(), source, target, self.ids()?)?;
        Ok(JobExecutor::new(wbb::catalog()?, ctx, self.states()?))
    }
}

/// Load the job configuration and apply command line overrides.
fn load_config(args: &Args) -> Result<JobConfig> {
    let mut config = match &args.config {
        Some(path) => JobConfig::from_file(path)?,
        None => JobConfig::default(),
    };
    if let Some(job_id) = &args.job_id {
        config.job_id = job_id.clone();
    }
    Ok(config)
}

/// Selected steps, or every step of the catalog.
fn selected_steps(steps: &[String]) -> Vec<String> {
    if steps.is_empty() {
        wbb::step_defs().into_iter().map(|def| def.name).collect()
    } else {
        steps.to_vec()
    }
}

/// Execute a parsed command and return its output.
pub fn execute(args: Args) -> Result<String> {
    let formatter = create_formatter(args.format);
    let mut config = load_config(&args)?;

    match args.command {
        Command::Plan { steps } => {
            let workspace = Workspace::open(&args.data_dir, config)?;
            plan(&workspace, &selected_steps(&steps), &*formatter)
        }
        Command::Run {
            steps,
            until_done,
            max_time_secs,
            source,
        } => {
            if let Some(path) = source {
                config.base.source.sqlite_path = Some(path);
            }
            if let Some(secs) = max_time_secs {
                config.runner.max_time_secs = secs;
            }
            let workspace = Workspace::open(&args.data_dir, config)?;
            run(&workspace, &selected_steps(&steps), until_done, &*formatter)
        }
        Command::Status => {
            let workspace = Workspace::open(&args.data_dir, config)?;
            let executor = workspace.executor(Arc::new(MemorySource::new()))?;
            Ok(formatter.format_progress(&executor.status()?))
        }
        Command::Lookup {
            entity_type,
            source_id,
        } => {
            let workspace = Workspace::open(&args.data_dir, config)?;
            let lookup = workspace
                .ids()?
                .lookup(&entity_type, SourceKey::from(source_id.as_str()))?;
            Ok(formatter.format_lookup(&entity_type, &source_id, lookup))
        }
        Command::Rewrite { full_unicode } => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("cannot read stdin")?;
            let output = rewrite(&input, full_unicode || config.base.full_unicode)?;
            Ok(formatter.format_content(&output))
        }
    }
}

fn plan(workspace: &Workspace, selected: &[String], formatter: &dyn Formatter) -> Result<String> {
    let catalog = wbb::catalog()?;
    let job_id = &workspace.config.job_id;
    let done: HashSet<String> = workspace
        .states()?
        .completed_steps(job_id)?
        .into_iter()
        .collect();
    let plan = catalog.graph().plan(selected, &done)?;
    let steps: Vec<_> = plan
        .iter()
        .filter_map(|name| catalog.graph().get(name))
        .collect();
    Ok(formatter.format_plan(job_id, &steps))
}

fn run(
    workspace: &Workspace,
    selected: &[String],
    until_done: bool,
    formatter: &dyn Formatter,
) -> Result<String> {
    let Some(path) = workspace.config.base.source.sqlite_path.clone() else {
        bail!("no source database: pass --source or set base.source.sqlite_path");
    };
    let source = Arc::new(SqliteSource::open(&path)?);
    let budget = Duration::from_secs(workspace.config.runner.max_time_secs);

    let mut executor = workspace.executor(source)?;
    let job = executor.start(selected)?;
    info!(job_id = %job.job_id, steps = job.plan.len(), until_done, "running import");

    let progress = if until_done {
        executor.run_until_complete(budget)?
    } else {
        executor.run_once(&TimeBudget::new(budget))?
    };
    for step in progress.failed() {
        warn!(
            step = %step.name,
            start_after = step.start_after,
            error = step.error.as_deref().unwrap_or(""),
            "step failed"
        );
    }
    workspace.db.flush()?;
    Ok(formatter.format_progress(&progress))
}

/// Rewrite content without resolving references.
fn rewrite(input: &str, full_unicode: bool) -> Result<String> {
    let engine = RewriteEngine::new(full_unicode)?;
    Ok(engine.rewrite(input, &RewriteContext::detached()))
}
