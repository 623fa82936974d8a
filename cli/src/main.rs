//! Simulation kernel CLI
//!
//! Runs the workshop demo model on the kernel and prints its event records
//! and a run summary.

mod workshop;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use sim_kernel_core::{EventRecord, Scheduler, SchedulerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::workshop::WorkshopParams;

#[derive(Parser)]
#[command(name = "sim-kernel")]
#[command(about = "Run the workshop demo on the discrete-event simulation kernel")]
#[command(version)]
struct Cli {
    /// Number of machines on the workshop floor
    #[arg(long, default_value = "3")]
    machines: usize,

    /// Seed for all random delays
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Simulated time units to run for
    #[arg(long, default_value = "100.0")]
    until: f64,

    /// Pace playback at this many time units per wall-clock second
    #[arg(long)]
    real_time: Option<f64>,

    /// Scheduler configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the summary and event records as JSON
    #[arg(long)]
    json: bool,
}

fn load_config(cli: &Cli) -> Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            SchedulerConfig::from_json_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };
    if let Some(factor) = cli.real_time {
        config = config.with_real_time_factor(factor);
    }
    config.validate()?;
    Ok(config)
}

fn print_table(records: &[EventRecord]) {
    println!("{}", EventRecord::HEADERS.join(" | "));
    for record in records {
        let mut line = record.columns().join(" | ");
        if let Some(fault) = &record.fault {
            line.push_str(&format!(" ({})", fault));
        }
        println!("{}", line);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let scheduler = Scheduler::new(config).context("creating scheduler")?;
    let params = WorkshopParams {
        machines: cli.machines,
        seed: cli.seed,
        ..Default::default()
    };

    let stats = workshop::build(&scheduler, &params).context("building workshop model")?;
    let until = scheduler.to_tick(cli.until);
    info!(machines = cli.machines, seed = cli.seed, until, "starting workshop run");

    let summary = scheduler.run_until(until).context("running simulation")?;
    let log = scheduler.take_event_log();
    scheduler.shutdown();
    let stats = stats.lock().clone();

    if cli.json {
        let output = json!({
            "run_id": scheduler.run_id().to_string(),
            "summary": summary,
            "machines": stats,
            "digest": log.digest(),
            "events": log.records(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_table(log.records());
    println!();
    println!(
        "Stopped: {:?} at t={:.3} ({} events fired, {} faulted)",
        summary.reason,
        scheduler.to_sim_time(summary.final_tick),
        summary.events_fired,
        summary.tasks_faulted
    );
    for machine in &stats {
        println!(
            "{:<10} parts={:<5} breakdowns={:<4} inspections={}",
            machine.name, machine.parts, machine.breakdowns, machine.inspections
        );
    }
    println!("Digest: {}", log.digest());
    Ok(())
}
