//! Forumport Command-Line Client
//!
//! Plans, runs and inspects import jobs stored in a local data directory.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod formatter;

use clap::{Parser, Subcommand};
use formatter::OutputFormat;
use std::path::PathBuf;

/// Forumport Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "forumport")]
#[command(version, about = "Staged, resumable WoltLab to XenForo import")]
pub struct Args {
    /// Directory holding the translation store and job state
    #[arg(short = 'd', long, default_value = "./forumport-data")]
    pub data_dir: PathBuf,

    /// Job configuration file (JSON)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Override the job id from the configuration
    #[arg(long)]
    pub job_id: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the steps a run would execute, in order
    Plan {
        /// Steps to import (default: all)
        #[arg(long, value_delimiter = ',')]
        steps: Vec<String>,
    },
    /// Run one bounded invocation, or keep going until the job is done
    Run {
        /// Steps to import (default: all)
        #[arg(long, value_delimiter = ',')]
        steps: Vec<String>,
        /// Repeat invocations until the job completes or stalls
        #[arg(long)]
        until_done: bool,
        /// Wall-clock budget of one invocation
        #[arg(long)]
        max_time_secs: Option<u64>,
        /// SQLite export of the source database
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Show job progress
    Status,
    /// Look up the translation of a source record
    Lookup {
        /// Entity type, e.g. `user` or `post`
        entity_type: String,
        /// Source identifier
        source_id: String,
    },
    /// Rewrite source markup read from stdin
    Rewrite {
        /// Emit emoji for smiley images
        #[arg(long)]
        full_unicode: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("warn,forumport=info,forumport_core=info")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match commands::execute(args) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let args = Args::try_parse_from([
            "forumport",
            "--format",
            "json",
            "run",
            "--steps",
            "users,posts",
            "--until-done",
            "--max-time-secs",
            "30",
        ])
        .unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        match args.command {
            Command::Run {
                steps,
                until_done,
                max_time_secs,
                source,
            } => {
                assert_eq!(steps, vec!["users", "posts"]);
                assert!(until_done);
                assert_eq!(max_time_secs, Some(30));
                assert!(source.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_lookup() {
        let args = Args::try_parse_from(["forumport", "lookup", "post", "42"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Lookup { ref entity_type, ref source_id } if entity_type == "post" && source_id == "42"
        ));
        assert_eq!(args.data_dir, PathBuf::from("./forumport-data"));
    }
}
