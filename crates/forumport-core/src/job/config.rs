//! Job configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default source table prefix.
pub const DEFAULT_TABLE_PREFIX: &str = "wcf1_";

/// Default wall-clock budget of one invocation, in seconds.
pub const DEFAULT_MAX_TIME_SECS: u64 = 8;

/// Default timezone for users whose source timezone cannot be mapped.
pub const DEFAULT_GUEST_TIMEZONE: &str = "Europe/London";

/// Source database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// SQLite export of the source database.
    pub sqlite_path: Option<PathBuf>,
    /// Prefix of the suite tables, e.g. `wcf1_`.
    pub table_prefix: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
        }
    }
}

/// Settings shared by every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub source: SourceConfig,
    /// Root of the source installation's uploaded files.
    pub uploads_path: Option<PathBuf>,
    /// Whether the target stores 4-byte UTF-8, enabling emoji substitution.
    pub full_unicode: bool,
    /// Timezone for users whose timezone has no target equivalent.
    pub guest_timezone: String,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            uploads_path: None,
            full_unicode: false,
            guest_timezone: DEFAULT_GUEST_TIMEZONE.to_string(),
        }
    }
}

/// Behaviour of the users step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStepConfig {
    /// Merge into an existing target user with the same email.
    pub merge_email: bool,
    /// Merge into an existing target user with the same name.
    pub merge_name: bool,
    /// Source user ids promoted to super administrator.
    pub super_admins: Vec<u64>,
}

impl Default for UserStepConfig {
    fn default() -> Self {
        Self {
            merge_email: true,
            merge_name: false,
            super_admins: Vec::new(),
        }
    }
}

/// Per-step toggles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub users: UserStepConfig,
}

/// Batch runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Rows per page for every step, overriding the step's own size.
    pub page_limit: Option<usize>,
    /// Wall-clock budget of one invocation.
    pub max_time_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            page_limit: None,
            max_time_secs: DEFAULT_MAX_TIME_SECS,
        }
    }
}

impl RunnerConfig {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }
}

/// Complete configuration of an import job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub job_id: String,
    pub base: BaseConfig,
    pub steps: StepConfig,
    pub runner: RunnerConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl JobConfig {
    /// Configuration with defaults for everything but the job id.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            base: BaseConfig::default(),
            steps: StepConfig::default(),
            runner: RunnerConfig::default(),
        }
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Set the SQLite source path.
    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base.source.sqlite_path = Some(path.into());
        self
    }

    /// Set the source table prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.base.source.table_prefix = prefix.into();
        self
    }

    /// Set the uploads root.
    pub fn with_uploads_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base.uploads_path = Some(path.into());
        self
    }

    /// Enable or disable full Unicode output.
    pub fn with_full_unicode(mut self, enabled: bool) -> Self {
        self.base.full_unicode = enabled;
        self
    }

    /// Override the page size of every step.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.runner.page_limit = Some(limit.max(1));
        self
    }

    /// Set the per-invocation budget.
    pub fn with_max_time_secs(mut self, secs: u64) -> Self {
        self.runner.max_time_secs = secs;
        self
    }

    /// Check the configuration before any step runs.
    pub fn validate(&self) -> Result<(), Error> {
        if self.job_id.trim().is_empty() {
            return Err(Error::Config("job_id must not be empty".into()));
        }
        if self.base.source.table_prefix.is_empty() {
            return Err(Error::Config("source.table_prefix must not be empty".into()));
        }
        if self.runner.page_limit == Some(0) {
            return Err(Error::Config("runner.page_limit must be positive".into()));
        }
        if let Some(path) = &self.base.source.sqlite_path {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "source database {} does not exist",
                    path.display()
                )));
            }
        }
        if let Some(uploads) = &self.base.uploads_path {
            for dir in ["attachments", "images"] {
                if !uploads.join(dir).is_dir() {
                    return Err(Error::Config(format!(
                        "uploads path {} has no {dir}/ directory",
                        uploads.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Suite table prefix restricted to `[A-Za-z0-9_]`.
    pub fn table_prefix(&self) -> String {
        self.base
            .source
            .table_prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect()
    }

    /// Board table prefix: the suite prefix with `wcf` replaced by `wbb`.
    pub fn board_prefix(&self) -> String {
        self.table_prefix().replacen("wcf", "wbb", 1)
    }

    /// Name of a suite table, e.g. `wcf1_user`.
    pub fn wcf_table(&self, name: &str) -> String {
        format!("{}{name}", self.table_prefix())
    }

    /// Name of a board table, e.g. `wbb1_thread`.
    pub fn wbb_table(&self, name: &str) -> String {
        format!("{}{name}", self.board_prefix())
    }
}
