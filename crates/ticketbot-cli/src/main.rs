#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;
use ticketbot_core::config::{Config, LogFormat, LoggingConfig};
use ticketbot_core::metrics::format_duration;
use ticketbot_core::{Pipeline, TickReport};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ticketbot: notify requesters when their data tickets are done",
    long_about = None
)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,

    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,

    /// Emit each tick's stage timings to stderr.
    #[arg(long)]
    timing: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("TICKETBOT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(logging.filter.as_deref().unwrap_or("ticketbot=info,warn"))
    });

    let format = env::var("TICKETBOT_LOG_FORMAT").map_or(logging.format, |value| match value.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    });

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        LogFormat::Compact => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn print_timing(report: &TickReport) -> anyhow::Result<()> {
    eprintln!("timing report:");
    for (stage, elapsed) in &report.timings.stages {
        eprintln!("  {stage:<14} {}", format_duration(*elapsed));
    }
    eprintln!("  {:<14} {}", "total", format_duration(report.timings.total()));
    eprintln!("timing report (json):");
    eprintln!("{}", serde_json::to_string_pretty(&report.to_json())?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_tracing(&config.logging);

    let secrets = config
        .resolve_secrets(|name| env::var(name).ok())
        .context("resolving secrets from the environment")?;
    let pipeline = Pipeline::from_config(&config, &secrets).context("building the pipeline")?;
    let interval = config.schedule.interval();
    info!(
        interval_minutes = config.schedule.interval_minutes,
        retention_days = config.schedule.retention_days,
        "ticketbot started"
    );

    loop {
        let started = Instant::now();
        match pipeline.tick() {
            Ok(report) => {
                if cli.timing {
                    print_timing(&report)?;
                }
            }
            Err(err) if cli.once => {
                return Err(err).context("tick failed");
            }
            Err(err) => {
                error!(code = %err.code(), hint = err.code().hint().unwrap_or(""), error = %err, "tick failed");
            }
        }

        if cli.once {
            break;
        }

        let elapsed = started.elapsed();
        match interval.checked_sub(elapsed) {
            Some(wait) => thread::sleep(wait),
            None => warn!(elapsed = %format_duration(elapsed), "tick overran the interval, starting the next one now"),
        }
    }

    info!(counters = %pipeline.counters().to_json(), "ticketbot stopped");
    Ok(())
}
