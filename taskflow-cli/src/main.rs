mod cli;
mod config;
mod demos;
mod error;
mod logging;
mod output;

use anyhow::Context;
use clap::Parser;
use std::process;
use std::time::Duration;
use tracing::{error, info};

use crate::{
    cli::{Args, Commands, OutputFormat},
    config::AppConfig,
    output::OutputManager,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let json_errors = matches!(args.output, Some(OutputFormat::Json));

    if let Err(e) = run(args).await {
        error!("Application error: {e:#}");
        if json_errors {
            let error_json = serde_json::json!({
                "status": "error",
                "message": format!("{e:#}"),
            });
            println!("{error_json}");
        } else {
            eprintln!("Error: {e:#}");
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = AppConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?
        .apply_args(&args);

    logging::init_logging(config.output.log_level.as_deref(), config.output.log_format)?;
    config.engine.validate()?;

    info!(
        workers = config.engine.worker_count,
        queue_capacity = config.engine.queue_capacity,
        "Starting taskflow"
    );

    let engine = &config.engine;
    let summary = match args.command {
        Commands::Pool { jobs } => demos::pool(engine, jobs).await?,
        Commands::Pipeline { count, order } => demos::pipeline(engine, count, order).await?,
        Commands::Timeout {
            jobs,
            deadline_ms,
            task_ms,
        } => {
            demos::timeout(
                engine,
                jobs,
                Duration::from_millis(deadline_ms),
                Duration::from_millis(task_ms),
            )
            .await?
        }
        Commands::Faults { jobs, panic_every } => demos::faults(engine, jobs, panic_every).await?,
        Commands::FanIn {
            producers,
            per_producer,
        } => demos::fan_in(engine, producers, per_producer).await?,
    };

    info!(
        command = summary.command,
        results = summary.results.len(),
        succeeded = summary.succeeded(),
        "Run finished"
    );
    OutputManager::new(config.output.format).print(&summary)?;
    Ok(())
}
