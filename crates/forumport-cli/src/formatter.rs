//! Output formatters for operator commands.

use clap::ValueEnum;
use comfy_table::{Cell, Color, Table};
use forumport_core::idmap::Lookup;
use forumport_core::job::{JobProgress, ScheduleStatus, StepDef};
use serde_json::json;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format an execution plan.
    fn format_plan(&self, job_id: &str, steps: &[&StepDef]) -> String;

    /// Format job progress.
    fn format_progress(&self, progress: &JobProgress) -> String;

    /// Format a translation lookup.
    fn format_lookup(&self, entity_type: &str, source_id: &str, lookup: Lookup) -> String;

    /// Format rewritten content.
    fn format_content(&self, content: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Planning time of a job, for display.
fn format_timestamp(micros: u64) -> String {
    i64::try_from(micros)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_micros)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn status_color(status: ScheduleStatus) -> Color {
    match status {
        ScheduleStatus::Done => Color::Green,
        ScheduleStatus::Running => Color::Cyan,
        ScheduleStatus::Failed => Color::Red,
        ScheduleStatus::Blocked => Color::Yellow,
        ScheduleStatus::Queued | ScheduleStatus::NotStarted => Color::Reset,
    }
}

fn lookup_parts(lookup: Lookup) -> (&'static str, Option<u64>) {
    match lookup {
        Lookup::Mapped(id) => ("mapped", Some(id)),
        Lookup::Excluded => ("excluded", None),
        Lookup::Missing => ("missing", None),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_plan(&self, job_id: &str, steps: &[&StepDef]) -> String {
        if steps.is_empty() {
            return format!("Job {}: nothing to run", job_id);
        }
        let mut table = Table::new();
        table.set_header(vec!["#", "Step", "Title", "Depends on", "Forces"]);
        for (index, step) in steps.iter().enumerate() {
            table.add_row(vec![
                Cell::new(index + 1),
                Cell::new(&step.name),
                Cell::new(&step.title),
                Cell::new(step.depends.join(", ")),
                Cell::new(step.forces.join(", ")),
            ]);
        }
        format!("Job {}\n{}", job_id, table)
    }

    fn format_progress(&self, progress: &JobProgress) -> String {
        let mut table = Table::new();
        table.set_header(vec![
            "Step", "Status", "Cursor", "End", "Progress", "Imported", "Skipped", "Runs", "Error",
        ]);
        for step in &progress.steps {
            table.add_row(vec![
                Cell::new(&step.name),
                Cell::new(step.status).fg(status_color(step.status)),
                Cell::new(step.start_after),
                Cell::new(step.end),
                Cell::new(format!("{:.1}%", step.percent)),
                Cell::new(step.imported),
                Cell::new(step.skipped),
                Cell::new(step.invocations),
                Cell::new(step.error.as_deref().unwrap_or("")),
            ]);
        }

        let mut output = format!(
            "Job {} ({}), planned {}\n{}",
            progress.job_id,
            progress.status,
            format_timestamp(progress.created_at),
            table
        );
        if progress.stalled {
            output.push_str("\nJob stalled: fix the failed steps and run again");
        }
        output
    }

    fn format_lookup(&self, entity_type: &str, source_id: &str, lookup: Lookup) -> String {
        match lookup_parts(lookup) {
            (_, Some(id)) => format!("{} {} -> {}", entity_type, source_id, id),
            (state, None) => format!("{} {}: {}", entity_type, source_id, state),
        }
    }

    fn format_content(&self, content: &str) -> String {
        content.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_plan(&self, job_id: &str, steps: &[&StepDef]) -> String {
        let steps: Vec<_> = steps
            .iter()
            .map(|step| {
                json!({
                    "name": step.name,
                    "title": step.title,
                    "depends": step.depends,
                    "forces": step.forces,
                })
            })
            .collect();
        json!({ "job_id": job_id, "plan": steps }).to_string()
    }

    fn format_progress(&self, progress: &JobProgress) -> String {
        serde_json::to_string_pretty(progress).unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string())
    }

    fn format_lookup(&self, entity_type: &str, source_id: &str, lookup: Lookup) -> String {
        let (state, target_id) = lookup_parts(lookup);
        json!({
            "entity_type": entity_type,
            "source_id": source_id,
            "state": state,
            "target_id": target_id,
        })
        .to_string()
    }

    fn format_content(&self, content: &str) -> String {
        json!({ "content": content }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forumport_core::job::StepProgress;

    fn progress() -> JobProgress {
        JobProgress {
            job_id: "wbb".to_string(),
            status: "running".to_string(),
            created_at: 1_700_000_000_000_000,
            steps: vec![StepProgress {
                name: "users".to_string(),
                title: "Users and avatars".to_string(),
                status: ScheduleStatus::Failed,
                start_after: 40,
                end: 100,
                imported: 38,
                skipped: 2,
                invocations: 3,
                percent: 40.0,
                error: Some("source error: gone".to_string()),
            }],
            stalled: true,
        }
    }

    #[test]
    fn test_table_progress() {
        let output = TableFormatter.format_progress(&progress());
        assert!(output.starts_with("Job wbb (running), planned 2023-11-14"));
        assert!(output.contains("users"));
        assert!(output.contains("40.0%"));
        assert!(output.contains("source error: gone"));
        assert!(output.contains("Job stalled"));
    }

    #[test]
    fn test_json_progress() {
        let output = JsonFormatter.format_progress(&progress());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["steps"][0]["status"], "failed");
        assert_eq!(value["steps"][0]["start_after"], 40);
    }

    #[test]
    fn test_lookup_formats() {
        assert_eq!(
            TableFormatter.format_lookup("post", "42", Lookup::Mapped(1042)),
            "post 42 -> 1042"
        );
        assert_eq!(
            TableFormatter.format_lookup("user_group", "1", Lookup::Excluded),
            "user_group 1: excluded"
        );
        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_lookup("post", "7", Lookup::Missing)).unwrap();
        assert_eq!(json["state"], "missing");
        assert!(json["target_id"].is_null());
    }

    #[test]
    fn test_empty_plan() {
        assert_eq!(TableFormatter.format_plan("wbb", &[]), "Job wbb: nothing to run");
    }
}
