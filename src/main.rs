use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use common::utils::format_bytes;
use diffusion_orchestrator::pipeline::GenerationRequest;
use diffusion_orchestrator::DiffusionOrchestrator;
use logging::Verbosity;
use model_manager::MemoryBudget;
use settings::ConfigManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared GPU model residency and generation job tracking")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More log output, repeatable
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Less log output, repeatable
    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report which configured models are loadable and the device budgets
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run simulated generation jobs through the repository and job manager
    Simulate {
        /// Number of jobs to submit
        #[arg(long, default_value_t = 2)]
        jobs: usize,

        /// Batch iterations per job
        #[arg(long, default_value_t = 2)]
        iterations: u32,

        /// Sampling steps per iteration
        #[arg(long, default_value_t = 20)]
        steps: u64,

        /// Simulated duration of one sampling step in milliseconds
        #[arg(long, default_value_t = 5)]
        step_ms: u64,

        /// Cancel the tracked jobs after this many milliseconds
        #[arg(long)]
        cancel_after: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigManager::new().context("Failed to load configuration")?,
    };

    let _log_guard = logging::init(
        &config_manager.settings().logging,
        Verbosity {
            verbose: cli.verbose,
            quiet: cli.quiet,
        },
    )?;

    let orchestrator = DiffusionOrchestrator::new(config_manager)?;

    match cli.command {
        Command::Check { json } => check(&orchestrator, json),
        Command::Simulate {
            jobs,
            iterations,
            steps,
            step_ms,
            cancel_after,
        } => {
            let request = GenerationRequest {
                iterations,
                steps,
                step_delay: Duration::from_millis(step_ms),
                ..GenerationRequest::default()
            };
            simulate(&orchestrator, jobs, request, cancel_after.map(Duration::from_millis)).await
        }
    }
}

fn check(orchestrator: &DiffusionOrchestrator, json: bool) -> Result<()> {
    let report = orchestrator.check();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (name, loadable) in &report.models {
        if *loadable {
            println!("Found {}", name);
        } else {
            println!("Missing {}", name);
        }
    }

    match &report.upscaler {
        Some(name) => println!("Upscaler: {}", name),
        None => println!("Upscaler: none"),
    }
    println!("Face restoration: {}", if report.face_restoration { "available" } else { "unavailable" });
    println!("Super resolution: {}", if report.super_resolution { "available" } else { "unavailable" });

    for (device, budget) in &report.budgets {
        println!("Budget {}: {}", device, budget);
    }

    Ok(())
}

async fn simulate(
    orchestrator: &DiffusionOrchestrator,
    count: usize,
    request: GenerationRequest,
    cancel_after: Option<Duration>,
) -> Result<()> {
    let jobs = orchestrator.jobs();

    if let Some(delay) = cancel_after {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for snapshot in jobs.list() {
                let _ = jobs.request_cancel(&snapshot.id);
            }
        });
    }

    println!(
        "Submitting {} job(s) with {} slot(s)",
        count,
        jobs.max_jobs()
    );

    let mut submitted = Vec::with_capacity(count);
    for _ in 0..count {
        match orchestrator.submit_generation(request.clone()).await {
            Ok(id) => {
                println!("Submitted job {}", id);
                submitted.push(id);
            }
            Err(e) => println!("Job not started: {:#}", e),
        }
    }

    for id in &submitted {
        let state = orchestrator.wait(id).await?;
        let result = jobs.take_result(id)?;
        let elapsed = result
            .elapsed
            .map(common::utils::format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "Job {}: {} ({} image(s), {})",
            id,
            state,
            result.outputs.len(),
            elapsed
        );
    }

    for usage in orchestrator.usage() {
        let budget = orchestrator.repository().budget(&usage.device);
        let units = |value: u64| match budget {
            MemoryBudget::Models(_) => format!("{} model(s)", value),
            _ => format_bytes(value),
        };
        println!(
            "Device {}: peak {}, resident {} model(s), budget {}",
            usage.device,
            units(usage.peak),
            usage.resident_count,
            budget
        );
    }

    orchestrator.shutdown().await?;
    Ok(())
}
