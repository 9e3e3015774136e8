//! Cursor and time-bounded batch execution.
//!
//! A paged step reads source rows in ascending ordinal order within
//! `(start_after, end]`, one page at a time. After every record the cursor
//! moves to that record's ordinal and the time budget is checked, so an
//! invocation always makes progress and never overruns by more than one
//! record. A page with no rows is the only completion signal.

use std::time::{Duration, Instant};

use tracing::debug;

use super::context::JobContext;
use super::state::StepState;
use super::step::Step;
use crate::error::Error;
use crate::idmap::SourceKey;
use crate::source::SourceRow;

/// Default number of rows fetched per page.
pub const DEFAULT_PAGE_LIMIT: usize = 500;

/// Wall-clock budget for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    deadline: Option<Instant>,
}

impl TimeBudget {
    /// Budget expiring `limit` from now.
    pub fn new(limit: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(limit),
        }
    }

    /// Budget that never expires.
    pub fn unlimited() -> Self {
        Self { deadline: None }
    }

    /// Whether the budget is used up.
    pub fn exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left, `None` when unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Result of one bounded invocation of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step has no more work.
    Complete,
    /// Work remains; invoke again.
    Continue,
}

/// Why a single record was not imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A hard dependency has no translation.
    MissingDependency {
        entity_type: String,
        source_id: SourceKey,
    },
    /// The record cannot be interpreted.
    Malformed(String),
    /// The target declined the record.
    Rejected,
    /// The record is outside what this step imports.
    Unsupported(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingDependency {
                entity_type,
                source_id,
            } => write!(f, "missing {entity_type} {source_id}"),
            SkipReason::Malformed(msg) => write!(f, "malformed: {msg}"),
            SkipReason::Rejected => write!(f, "rejected by target"),
            SkipReason::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

/// Outcome of importing a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Imported,
    Skipped(SkipReason),
}

impl RecordOutcome {
    /// Skip because a hard dependency is not mapped.
    pub fn missing(entity_type: &str, source_id: impl Into<SourceKey>) -> Self {
        RecordOutcome::Skipped(SkipReason::MissingDependency {
            entity_type: entity_type.to_string(),
            source_id: source_id.into(),
        })
    }

    /// Skip because the record cannot be interpreted.
    pub fn malformed(msg: impl Into<String>) -> Self {
        RecordOutcome::Skipped(SkipReason::Malformed(msg.into()))
    }

    /// Imported when the target produced an id, rejected otherwise.
    pub fn saved(target_id: Option<u64>) -> Self {
        match target_id {
            Some(_) => RecordOutcome::Imported,
            None => RecordOutcome::Skipped(SkipReason::Rejected),
        }
    }
}

/// A step that walks a source table by ordinal.
pub trait PagedStep: Send + Sync {
    /// Rows per page.
    fn page_limit(&self) -> usize {
        DEFAULT_PAGE_LIMIT
    }

    /// One-time preparation before the first page.
    fn setup(&self, _ctx: &mut JobContext) -> Result<(), Error> {
        Ok(())
    }

    /// Highest ordinal to import, `0` when the source is empty.
    fn end(&self, ctx: &JobContext) -> Result<u64, Error>;

    /// Rows with `start_after < ordinal <= end`, ascending, at most `limit`.
    fn fetch_page(
        &self,
        ctx: &JobContext,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error>;

    /// Batch work for a page, typically translation pre-warming.
    fn prepare_page(&self, _rows: &[SourceRow], _ctx: &mut JobContext) -> Result<(), Error> {
        Ok(())
    }

    /// Import one record.
    fn import_row(&self, row: &SourceRow, ctx: &mut JobContext) -> Result<RecordOutcome, Error>;
}

/// Adapts a [`PagedStep`] into a [`Step`] driven by [`BatchRunner`].
pub struct Paged<S>(pub S);

impl<S: PagedStep> Step for Paged<S> {
    fn setup(&self, ctx: &mut JobContext) -> Result<(), Error> {
        self.0.setup(ctx)
    }

    fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
        self.0.end(ctx)
    }

    fn run(
        &self,
        state: &mut StepState,
        budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let runner = BatchRunner::new(ctx.config().runner.page_limit);
        runner.run(&self.0, state, budget, ctx)
    }
}

/// Drives a paged step for one invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchRunner {
    page_limit: Option<usize>,
}

impl BatchRunner {
    /// Create a runner, optionally overriding each step's page size.
    pub fn new(page_limit: Option<usize>) -> Self {
        Self { page_limit }
    }

    /// Run until the budget is exhausted or the source range is drained.
    ///
    /// A fatal error leaves the cursor on the last record fully handled, so
    /// the failing record is retried on the next invocation.
    pub fn run<S: PagedStep + ?Sized>(
        &self,
        step: &S,
        state: &mut StepState,
        budget: &TimeBudget,
        ctx: &mut JobContext,
    ) -> Result<StepOutcome, Error> {
        let limit = self.page_limit.unwrap_or_else(|| step.page_limit()).max(1);

        loop {
            let rows = step.fetch_page(ctx, state.start_after, state.end, limit)?;
            if rows.is_empty() {
                state.start_after = state.start_after.max(state.end);
                ctx.checkpoint(state)?;
                return Ok(StepOutcome::Complete);
            }

            step.prepare_page(&rows, ctx)?;

            for row in &rows {
                if row.key <= state.start_after || row.key > state.end {
                    return Err(Error::Source(format!(
                        "row {} outside cursor window ({}, {}] of step {}",
                        row.key, state.start_after, state.end, state.step
                    )));
                }

                match step.import_row(row, ctx)? {
                    RecordOutcome::Imported => state.imported += 1,
                    RecordOutcome::Skipped(reason) => {
                        debug!(step = %state.step, source_id = row.key, %reason, "skipped record");
                        state.skipped += 1;
                    }
                }
                state.advance(row.key)?;

                if budget.exceeded() {
                    ctx.checkpoint(state)?;
                    return Ok(StepOutcome::Continue);
                }
            }

            ctx.checkpoint(state)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::context::tests::memory_context;
    use crate::source::{MemorySource, SourceReader, SourceTable};
    use serde_json::json;
    use std::sync::Arc;

    struct Numbers {
        table: SourceTable,
        fail_on: Option<u64>,
    }

    impl PagedStep for Numbers {
        fn page_limit(&self) -> usize {
            3
        }

        fn end(&self, ctx: &JobContext) -> Result<u64, Error> {
            ctx.source().max_key(&self.table)
        }

        fn fetch_page(
            &self,
            ctx: &JobContext,
            start_after: u64,
            end: u64,
            limit: usize,
        ) -> Result<Vec<SourceRow>, Error> {
            ctx.source().fetch_page(&self.table, start_after, end, limit)
        }

        fn import_row(
            &self,
            row: &SourceRow,
            _ctx: &mut JobContext,
        ) -> Result<RecordOutcome, Error> {
            if Some(row.key) == self.fail_on {
                return Err(Error::Target("write failed".into()));
            }
            if row.bool("skip") {
                return Ok(RecordOutcome::malformed("flagged"));
            }
            Ok(RecordOutcome::Imported)
        }
    }

    fn source() -> Arc<MemorySource> {
        let source = MemorySource::new();
        for id in [2u64, 3, 5, 7, 11, 13, 17] {
            source.insert("n", json!({ "id": id, "skip": id == 5 }));
        }
        Arc::new(source)
    }

    fn step(fail_on: Option<u64>) -> Numbers {
        Numbers {
            table: SourceTable::new("n", "id"),
            fail_on,
        }
    }

    #[test]
    fn test_unlimited_budget_completes() {
        let mut ctx = memory_context(source());
        let step = step(None);
        let mut state = StepState::new("n");
        state.start(step.end(&ctx).unwrap());

        let outcome = BatchRunner::default()
            .run(&step, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(state.start_after, 17);
        assert_eq!(state.imported, 6);
        assert_eq!(state.skipped, 1);
    }

    #[test]
    fn test_exhausted_budget_processes_one_record_per_invocation() {
        let mut ctx = memory_context(source());
        let step = step(None);
        let mut state = StepState::new("n");
        state.start(step.end(&ctx).unwrap());

        let budget = TimeBudget::new(Duration::ZERO);
        let mut invocations = 0;
        let mut cursors = Vec::new();
        loop {
            invocations += 1;
            let outcome = BatchRunner::default()
                .run(&step, &mut state, &budget, &mut ctx)
                .unwrap();
            cursors.push(state.start_after);
            if outcome == StepOutcome::Complete {
                break;
            }
        }
        assert_eq!(cursors, vec![2, 3, 5, 7, 11, 13, 17, 17]);
        assert_eq!(invocations, 8);
        assert_eq!(state.imported + state.skipped, 7);
    }

    #[test]
    fn test_empty_range_completes_immediately() {
        let mut ctx = memory_context(Arc::new(MemorySource::new()));
        let step = step(None);
        let mut state = StepState::new("n");
        state.start(step.end(&ctx).unwrap());
        assert_eq!(state.end, 0);

        let outcome = BatchRunner::default()
            .run(&step, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(state.imported, 0);
    }

    #[test]
    fn test_rows_beyond_end_are_not_visited() {
        let source = source();
        let mut ctx = memory_context(source.clone());
        let step = step(None);
        let mut state = StepState::new("n");
        state.start(step.end(&ctx).unwrap());

        source.insert("n", json!({ "id": 19 }));
        BatchRunner::default()
            .run(&step, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap();
        assert_eq!(state.start_after, 17);
        assert_eq!(state.imported, 6);
    }

    #[test]
    fn test_fatal_error_keeps_cursor_before_failing_record() {
        let mut ctx = memory_context(source());
        let failing = step(Some(7));
        let mut state = StepState::new("n");
        state.start(failing.end(&ctx).unwrap());

        let err = BatchRunner::default()
            .run(&failing, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Target(_)));
        assert_eq!(state.start_after, 5);

        let fixed = step(None);
        let outcome = BatchRunner::default()
            .run(&fixed, &mut state, &TimeBudget::unlimited(), &mut ctx)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(state.imported, 6);
    }

    #[test]
    fn test_budget_helpers() {
        assert!(!TimeBudget::unlimited().exceeded());
        assert!(TimeBudget::unlimited().remaining().is_none());
        assert!(TimeBudget::new(Duration::ZERO).exceeded());
        assert!(TimeBudget::new(Duration::from_secs(60)).remaining().is_some());
    }
}
