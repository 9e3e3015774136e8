//! Forumport Core - staged, resumable forum import engine.
//!
//! This crate provides the pieces an import job is assembled from:
//!
//! - [`idmap`]: the durable source-to-target identifier translation store,
//! - [`job`]: step scheduling, bounded batch execution and checkpoints,
//! - [`rewrite`]: conversion of stored source markup into target BBCode,
//! - [`redirect`]: resolution of legacy source URLs to canonical target URLs,
//! - [`wbb`]: the WoltLab Suite / Burning Board step catalog.

pub mod auth;
pub mod error;
pub mod idmap;
pub mod job;
pub mod redirect;
pub mod rewrite;
pub mod source;
pub mod target;
pub mod wbb;

pub use auth::{LegacyPassword, LEGACY_AUTH_SCHEME};
pub use error::Error;
pub use idmap::{IdMapStore, Lookup, ReadOnlyIdMap, SourceKey, Translation, TranslationLookup};
pub use job::{
    JobConfig, JobContext, JobExecutor, JobProgress, JobStateStore, ScheduleStatus, Step,
    StepCatalog, StepDef, StepGraph, TimeBudget,
};
pub use redirect::{LegacyContent, LegacyUrlResolver, LinkBuilder, Resolution};
pub use rewrite::RewriteEngine;
pub use source::{MemorySource, SourceReader, SqliteSource};
pub use target::{EntityKind, MemoryTarget, SledTarget, TargetStore};
