mod cli;
mod demo;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use taskhub_core::config::load_dotenv;
use taskhub_core::{Parameters, Priority, StreamEvent, TaskHubConfig};
use taskhub_events::SubscriptionTarget;
use taskhub_failures::{FailureRecorder, SuggestionRules};
use taskhub_scheduler::TaskHub;

use crate::cli::{CliArgs, Command, FailuresArgs, RunArgs};

const PRIORITIES: [Priority; 3] = [Priority::Normal, Priority::High, Priority::Low];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    load_dotenv();
    let args = CliArgs::parse();
    let config = match args.profile.as_deref() {
        Some(profile) => TaskHubConfig::for_profile(profile),
        None => TaskHubConfig::from_env(),
    };

    match args.command {
        Command::Run(run_args) => run(config, run_args).await,
        Command::Failures(failures_args) => failures(config, failures_args),
    }
}

async fn run(mut config: TaskHubConfig, args: RunArgs) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = concurrency;
    }
    if let Some(max_queued) = args.max_queued {
        config.max_queued = max_queued;
    }
    if let Some(grace_ms) = args.grace_ms {
        config.cancel_grace_ms = grace_ms;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.log_summary();

    let hub = TaskHub::builder(config)
        .handlers(demo::handlers())
        .build()
        .context("failed to start task hub")?;
    info!(workers = hub.worker_count(), types = ?hub.task_types(), "Task hub ready");

    let mut events = hub.subscribe(SubscriptionTarget::All, None)?;
    let mut submitted = 0usize;
    for i in 0..args.tasks {
        // Every third task exercises the failure path.
        let (task_type, parameters) = if i % 3 == 2 {
            (demo::FAIL, params(json!({ "dt": -0.01 })))
        } else {
            (demo::SIMULATE, params(json!({ "steps": args.steps, "step_ms": args.step_ms })))
        };
        match hub.submit(task_type, parameters, PRIORITIES[i % PRIORITIES.len()]) {
            Ok(id) => {
                submitted += 1;
                info!(task_id = %id, task_type, "Submitted");
            }
            Err(e) => warn!(error = %e, "Submission rejected"),
        }
    }

    if args.stubborn {
        let id = hub
            .submit(demo::STUBBORN, Parameters::new(), Priority::High)
            .context("failed to submit stubborn task")?;
        submitted += 1;
        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.cancel(id).context("failed to cancel stubborn task")?;
        info!(task_id = %id, "Cancellation requested; waiting out the grace period");
    }

    let mut finished = 0usize;
    while finished < submitted {
        let Some(event) = events.recv().await else {
            break;
        };
        if event.is_terminal() {
            finished += 1;
        }
        if let StreamEvent::Gap(gap) = &event {
            warn!(dropped = gap.dropped, "Output fell behind; events skipped");
        }
        println!("{}", serde_json::to_string(&event)?);
    }

    let summary = hub.view().summary();
    println!("{}", serde_json::to_string(&json!({ "type": "summary", "data": summary }))?);
    for record in hub.failures().all() {
        println!("{}", serde_json::to_string(&json!({ "type": "failure_record", "data": record }))?);
    }

    hub.shutdown().await;
    Ok(())
}

fn failures(mut config: TaskHubConfig, args: FailuresArgs) -> Result<()> {
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    let path = config.failures_path();
    if !path.exists() {
        info!(path = %path.display(), "No failure ledger yet");
        return Ok(());
    }

    let recorder = FailureRecorder::open(&path, SuggestionRules::builtin())
        .with_context(|| format!("failed to open {}", path.display()))?;
    let records = match args.kind.as_deref() {
        Some(kind) => recorder.by_kind(kind),
        None => recorder.all(),
    };
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    info!(count = records.len(), path = %path.display(), "Failure records listed");
    Ok(())
}

fn params(value: serde_json::Value) -> Parameters {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Parameters::new(),
    }
}
