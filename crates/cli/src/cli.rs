use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local task hub runner.
///
/// Starts an in-process scheduler with demo handlers and streams every
/// event to stdout as one JSON object per line.
#[derive(Parser, Debug)]
#[command(name = "taskhub", about = "Background task scheduler with live event streams")]
pub struct CliArgs {
    /// Config profile (overrides TASKHUB_PROFILE)
    #[arg(long, global = true, env = "TASKHUB_PROFILE")]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit demo tasks and stream their events until all finish
    Run(RunArgs),
    /// Print recorded failures from the ledger
    Failures(FailuresArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Number of demo tasks to submit
    #[arg(long, default_value = "6")]
    pub tasks: usize,

    /// Worker slots (overrides TASKHUB_MAX_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Admission bound (overrides TASKHUB_MAX_QUEUED)
    #[arg(long)]
    pub max_queued: Option<usize>,

    /// Cancellation grace period in milliseconds
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// Simulation steps per `simulate` task
    #[arg(long, default_value = "10")]
    pub steps: u64,

    /// Milliseconds per simulation step
    #[arg(long, default_value = "50")]
    pub step_ms: u64,

    /// Also submit a handler that ignores cancellation, then cancel it
    #[arg(long)]
    pub stubborn: bool,

    /// Failure ledger directory (overrides TASKHUB_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct FailuresArgs {
    /// Only show this error kind
    #[arg(long)]
    pub kind: Option<String>,

    /// Failure ledger directory (overrides TASKHUB_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let args = CliArgs::parse_from(["taskhub", "run", "--tasks", "3", "--concurrency", "2", "--stubborn"]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.tasks, 3);
                assert_eq!(run.concurrency, Some(2));
                assert!(run.stubborn);
                assert_eq!(run.steps, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_failures_filter() {
        let args = CliArgs::parse_from(["taskhub", "failures", "--kind", "ValueError"]);
        assert!(matches!(args.command, Command::Failures(f) if f.kind.as_deref() == Some("ValueError")));
    }
}
