//! CLI argument parsing and subcommand dispatch.

use std::sync::Arc;

use anyhow::bail;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use siphon_core::Config;
use siphon_server::{App, Components};
use siphon_storage::{Run, RunFilter};

/// Scheduled ingestion pipeline: fetch, publish, persist.
#[derive(Parser, Debug)]
#[command(name = "siphon", version, about = "Scheduled ingestion pipeline")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler, the consumer and the admin API in one process
    Run,
    /// Run the scheduler and the admin API
    Scheduler,
    /// Run a consumer worker
    Consumer,
    /// Queue a manual run of a task
    Trigger {
        task: String,
        /// Logical timestamp (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Show run history, newest first
    Runs {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Stop scheduling new runs of a task
    Pause { task: String },
    /// Resume scheduling a paused task
    Resume { task: String },
    /// Cancel a queued, retrying or running run
    Cancel { run_id: i64 },
    /// Query a running scheduler's health; exits non-zero when unhealthy
    Health {
        /// Admin API base URL (default: the configured admin host and port)
        #[arg(long, env = "SIPHON_ADMIN_URL")]
        url: Option<String>,
    },
}

pub async fn dispatch(config: Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => serve(config, Components::All).await,
        Command::Scheduler => serve(config, Components::Scheduler).await,
        Command::Consumer => serve(config, Components::Consumer).await,
        Command::Trigger { task, at } => {
            let app = App::build(config).await?;
            let run = app.scheduler.trigger(&task, at).await?;
            println!("queued run {} of '{}' at {}", run.id, run.task_name, run.logical_ts);
            Ok(())
        }
        Command::Runs { task, from, to, limit } => {
            let app = App::build(config).await?;
            let filter = RunFilter {
                task,
                from,
                to,
                limit: Some(limit),
                ..Default::default()
            };
            let runs = app.scheduler.run_history(&filter).await?;
            print_runs(&runs);
            Ok(())
        }
        Command::Pause { task } => {
            App::build(config).await?.scheduler.pause(&task).await?;
            println!("paused '{task}'");
            Ok(())
        }
        Command::Resume { task } => {
            App::build(config).await?.scheduler.resume(&task).await?;
            println!("resumed '{task}'");
            Ok(())
        }
        Command::Cancel { run_id } => {
            let run = App::build(config).await?.scheduler.cancel(run_id).await?;
            println!("run {} is {}", run.id, run.state);
            Ok(())
        }
        Command::Health { url } => health(&config, url).await,
    }
}

async fn serve(config: Config, components: Components) -> anyhow::Result<()> {
    config.log_summary();
    if components != Components::All && !config.broker.durable {
        bail!("BROKER_DURABLE=false needs `siphon run`: separate processes must share a durable topic");
    }

    let app = Arc::new(App::build(config).await?);
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    app.run(components, shutdown).await
}

async fn health(config: &Config, url: Option<String>) -> anyhow::Result<()> {
    let base = url.unwrap_or_else(|| {
        let host = match config.admin.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, config.admin.port)
    });
    let response = reqwest::get(format!("{}/health", base.trim_end_matches('/'))).await?;
    let status = response.status();
    let body = response.text().await?;
    println!("{body}");
    if !status.is_success() {
        bail!("scheduler unhealthy ({status})");
    }
    Ok(())
}

fn print_runs(runs: &[Run]) {
    println!(
        "{:>6}  {:<24} {:<25} {:<9} {:>7}  error",
        "id", "task", "logical_ts", "state", "attempt"
    );
    for run in runs {
        println!(
            "{:>6}  {:<24} {:<25} {:<9} {:>7}  {}",
            run.id,
            run.task_name,
            run.logical_ts.to_rfc3339(),
            run.state.as_str(),
            run.attempt,
            run.error.as_deref().unwrap_or("")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trigger_with_timestamp() {
        let args = CliArgs::try_parse_from([
            "siphon",
            "trigger",
            "harvest-rust",
            "--at",
            "2024-05-01T01:00:00Z",
        ])
        .unwrap();
        match args.command {
            Command::Trigger { task, at } => {
                assert_eq!(task, "harvest-rust");
                assert_eq!(at.unwrap().to_rfc3339(), "2024-05-01T01:00:00+00:00");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn runs_defaults_limit() {
        let args = CliArgs::try_parse_from(["siphon", "runs", "--task", "backfill-rust"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Runs { limit: 50, task: Some(ref t), .. } if t == "backfill-rust"
        ));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(CliArgs::try_parse_from(["siphon"]).is_err());
    }
}
