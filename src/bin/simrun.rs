//! simrun CLI: run a batch of simulation programs with dedup and bounded
//! concurrency.

use clap::{Parser, Subcommand};
use simrun::config::{Batch, Config};
use simrun::engine::{
    CommandOutput, CommandWorker, LocalSimulationRunner, RunnerConfig, SubmitResult,
};
use simrun::model::identifier;
use simrun::telemetry::{TelemetryConfig, init_telemetry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "simrun", about = "Run simulation batches without repeating work")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every simulation in a batch file
    Run {
        /// Batch file with [[simulation]] tables
        batch: PathBuf,
        /// Maximum concurrent simulations (overrides SIMRUN_MAX_WORKERS)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Output root (overrides SIMRUN_OUTPUT_DIR)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Print the project summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the identifier of every simulation in a batch file
    Fingerprint {
        /// Batch file with [[simulation]] tables
        batch: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            batch,
            max_workers,
            output_dir,
            json,
        } => cmd_run(batch, max_workers, output_dir, json).await,
        Command::Fingerprint { batch } => cmd_fingerprint(batch),
    }
}

async fn cmd_run(
    batch: PathBuf,
    max_workers: Option<usize>,
    output_dir: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(n) = max_workers {
        config.max_workers = n;
    }
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let batch = Batch::load(&batch)?;
    info!(simulations = batch.simulations.len(), "batch loaded");

    let runner = Arc::new(LocalSimulationRunner::new(
        CommandWorker::default(),
        RunnerConfig::from(&config),
    )?);
    let submissions = runner.submit_all(batch.simulations)?;

    let canceller = Arc::clone(&runner);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling simulations");
            canceller.cancel();
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = runner.wait() => break,
            _ = ticker.tick() => {
                info!(
                    progress = format!("{:.0}%", runner.progress() * 100.0),
                    status = %runner.status(),
                    "running"
                );
            }
        }
    }
    runner.shutdown().await?;

    println!(
        "{:<3}  {:<8}  {:<10}  {:<8}  PROGRAM",
        "#", "ID", "OUTCOME", "TIME"
    );
    println!("{}", "-".repeat(60));
    for (index, submission) in submissions.iter().enumerate() {
        let id = submission.identifier().short();
        let (outcome, time) = match submission.result().await {
            Ok(simulation) => {
                let time = simulation
                    .find_results::<CommandOutput>()
                    .first()
                    .map(|out| format!("{}ms", out.duration_ms))
                    .unwrap_or_else(|| "-".to_string());
                let outcome = match submission {
                    SubmitResult::Scheduled(_) => "done",
                    SubmitResult::InFlight(_) => "duplicate",
                    SubmitResult::Completed(_) => "cached",
                };
                (outcome.to_string(), time)
            }
            Err(simrun::error::Error::Cancelled) => ("cancelled".to_string(), "-".to_string()),
            Err(e) => (format!("failed: {e}"), "-".to_string()),
        };
        let program = submission
            .handle()
            .map(|h| h.options().program.clone())
            .unwrap_or_default();
        println!("{:<3}  {:<8}  {:<10}  {:<8}  {}", index + 1, id, outcome, time, program);
    }

    let summary = runner.summary();
    println!(
        "\n{} scheduled, {} done, {} failed, {} cancelled, {} simulation(s) in project",
        summary.submitted, summary.done, summary.failed, summary.cancelled, summary.simulations
    );

    if json {
        let project = runner.project().summary()?;
        println!("{}", serde_json::to_string_pretty(&project)?);
    }

    if summary.failed > 0 {
        anyhow::bail!("{} simulation(s) failed", summary.failed);
    }
    Ok(())
}

fn cmd_fingerprint(batch: PathBuf) -> anyhow::Result<()> {
    let batch = Batch::load(&batch)?;
    let mut seen = HashMap::new();

    for (index, options) in batch.simulations.iter().enumerate() {
        let id = identifier(options);
        match seen.get(&id) {
            Some(first) => println!("{:<3}  {id}  duplicate of #{first}", index + 1),
            None => {
                seen.insert(id, index + 1);
                println!("{:<3}  {id}  {}", index + 1, options.program);
            }
        }
    }

    println!(
        "\n{} simulation(s), {} distinct",
        batch.simulations.len(),
        seen.len()
    );
    Ok(())
}
