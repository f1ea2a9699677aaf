use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use spindle_core::wal::{Replay, Wal};
use spindle_core::{
    Arguments, EngineBuilder, EngineConfig, Handler, HandlerError, JobContext, JobState, LogFormat, QueueCounts, Task,
};

#[derive(Parser)]
#[command(name = "spindle", version, about = "Durable in-process background jobs")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines regardless of the configuration.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a small end-to-end scenario with background dispatchers.
    Demo {
        /// WAL to use instead of the configured one.
        #[arg(long)]
        wal: Option<PathBuf>,
    },
    /// Replay a WAL and print what is in it. Read-only.
    Inspect {
        wal: PathBuf,
        /// Only list jobs in this state.
        #[arg(long)]
        state: Option<JobState>,
        /// Print jobs as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Drop jobs that finished longer ago than the retention window.
    Compact {
        wal: PathBuf,
        /// Overrides `retention_secs` from the configuration.
        #[arg(long)]
        retention_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;
    if cli.json_logs {
        config.log_format = LogFormat::Json;
    }
    spindle_core::trace::init(config.log_format);

    match cli.command {
        Command::Demo { wal } => {
            if let Some(wal) = wal {
                config.wal_path = wal;
            }
            demo(config).await
        }
        Command::Inspect { wal, state, json } => inspect(&wal, state, json),
        Command::Compact { wal, retention_secs } => {
            let retention = retention_secs.unwrap_or(config.retention_secs);
            compact(&wal, retention).await
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

impl Task for SendEmail {
    const TYPE: &'static str = "send_email";
}

struct SendEmailHandler;

#[async_trait]
impl Handler<SendEmail> for SendEmailHandler {
    async fn handle(&self, task: SendEmail, ctx: &JobContext) -> Result<(), HandlerError> {
        println!("[{}] mail to {}: {}", ctx.job_id, task.to, task.subject);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChargeCard {
    cents: u64,
}

impl Task for ChargeCard {
    const TYPE: &'static str = "charge_card";
}

/// Declines the first `remaining_failures` charges.
struct ChargeCardHandler {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<ChargeCard> for ChargeCardHandler {
    async fn handle(&self, task: ChargeCard, ctx: &JobContext) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!(
                "card declined (attempt {}/{}, {left} more failures planned)",
                ctx.attempt, ctx.max_attempts
            )));
        }
        println!("[{}] charged {} cents on attempt {}", ctx.job_id, task.cents, ctx.attempt);
        Ok(())
    }
}

struct Reporter {
    name: String,
}

async fn demo(mut config: EngineConfig) -> anyhow::Result<()> {
    // short backoff so the retries are visible
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 200;
    tracing::info!(wal = %config.wal_path.display(), "starting demo");

    let engine = EngineBuilder::new(config)
        .register::<SendEmail, _>(SendEmailHandler)?
        .register::<ChargeCard, _>(ChargeCardHandler {
            remaining_failures: AtomicU32::new(2),
        })?
        .expect_tasks(&[SendEmail::TYPE, ChargeCard::TYPE])
        .open()
        .await?;

    let report = engine.wrap(
        Arc::new(Reporter {
            name: "daily".to_string(),
        }),
        "publish",
        |reporter: Arc<Reporter>, args: Arguments| async move {
            println!("report {} published with {} argument(s)", reporter.name, args.len());
            Ok::<(), HandlerError>(())
        },
    )?;

    let dispatchers = engine.start();

    engine
        .submit_task(
            &SendEmail {
                to: "ada@example.com".to_string(),
                subject: "welcome".to_string(),
            },
            None,
        )
        .await?;
    engine.submit_task(&ChargeCard { cents: 1_999 }, None).await?;
    report
        .perform_at(Utc::now() + TimeDelta::seconds(2), Arguments::new())
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("interrupted"),
        _ = wait_until_idle(&engine) => {}
    }
    dispatchers.shutdown_and_join().await;

    print_counts(&engine.counts().await);
    Ok(())
}

async fn wait_until_idle(engine: &spindle_core::Engine) {
    while engine.counts().await.outstanding() > 0 {
        sleep(Duration::from_millis(50)).await;
    }
}

fn inspect(path: &Path, state: Option<JobState>, json: bool) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let replay = Replay::from_bytes(&data);

    if !json {
        println!(
            "{}: {} job(s), last seq {}, {} skipped record(s)",
            path.display(),
            replay.len(),
            replay.last_seq,
            replay.skipped
        );
        print_counts(&QueueCounts::from_states(replay.jobs().map(|env| env.state)));
    }

    for env in replay.jobs().filter(|env| state.is_none_or(|s| env.state == s)) {
        if json {
            println!("{}", serde_json::to_string(env)?);
        } else {
            let due = env.due_at.map(|d| d.to_rfc3339()).unwrap_or_else(|| "-".to_string());
            println!(
                "{}  {:<10} {:<24} attempts={} due={} {}",
                env.job_id,
                env.state.as_str(),
                env.task_type.as_str(),
                env.attempt_count,
                due,
                env.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn compact(path: &Path, retention_secs: u64) -> anyhow::Result<()> {
    anyhow::ensure!(path.exists(), "no wal at {}", path.display());
    // refused while an engine holds the wal
    let (wal, _) = Wal::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let report = wal.compact(retention_cutoff(Utc::now(), retention_secs)).await?;
    println!(
        "kept {} record(s), dropped {} record(s) of {} job(s), discarded {} unreadable record(s)",
        report.kept_records,
        report.dropped_records,
        report.dropped_jobs.len(),
        report.skipped_records
    );
    Ok(())
}

/// Oldest finish time that is kept; saturates for absurd retention windows.
fn retention_cutoff(now: DateTime<Utc>, retention_secs: u64) -> DateTime<Utc> {
    i64::try_from(retention_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn print_counts(counts: &QueueCounts) {
    println!(
        "pending={} scheduled={} claimed={} completed={} failed={} dead={}",
        counts.pending, counts.scheduled, counts.claimed, counts.completed, counts.failed, counts.dead
    );
}
