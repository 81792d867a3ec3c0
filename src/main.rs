// src/main.rs - Runs one exposure job against the virtual printer
use clap::Parser;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use resin_rs::config::{Config, PathsConfig, load_config};
use resin_rs::exposure::persistence::ExposurePickler;
use resin_rs::project::ManifestProjectStore;
use resin_rs::simulator::VirtualPrinter;
use resin_rs::{Exposure, ExposureState};

#[derive(Parser, Debug)]
#[command(name = "resin-host", about = "Exposure engine host running on a simulated printer.")]
struct Cli {
    /// Path to a TOML config file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project manifest to print
    project: Option<String>,

    /// Keep job data, statistics and previous prints under this directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Restore and report the last saved job instead of printing
    #[arg(long)]
    resume: bool,

    /// Confirm pre-print warnings instead of rejecting them
    #[arg(long)]
    accept_warnings: bool,

    /// Printer model the project must be sliced for
    #[arg(long)]
    model: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    tracing::info!("Starting resin-host {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => load_config(&path.to_string_lossy())?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.paths = PathsConfig::under(dir);
    }
    let config = Arc::new(config);

    let printer = VirtualPrinter::new(&config);
    let ctx = printer
        .context(config.clone(), Arc::new(ManifestProjectStore::new(cli.model.clone())));
    let pickler = ExposurePickler::new(config.paths.last_project.clone());

    if cli.resume {
        match Exposure::restore(ctx, &pickler).await? {
            Some(exposure) => report(&exposure),
            None => tracing::info!("No saved job"),
        }
        return Ok(());
    }

    let Some(project) = cli.project else {
        return Err("no project given".into());
    };
    let exposure = Exposure::new(ctx);
    if let Err(e) = exposure.read_project(&project).await {
        report(&exposure);
        return Err(e.to_string().into());
    }
    tracing::info!(
        "Estimated print time: {} s",
        exposure.snapshot().estimated_total_time_ms / 1000
    );

    let mut states = pin!(exposure.field_changes("state"));
    exposure.confirm_start()?;
    while let Some(value) = states.next().await {
        let Ok(state) = serde_json::from_value::<ExposureState>(value) else {
            continue;
        };
        tracing::debug!("Job state: {}", state);
        let reply = match state {
            ExposureState::PourInResin => exposure.confirm_resin_in(),
            ExposureState::CheckWarning if cli.accept_warnings => exposure.confirm_warning(),
            ExposureState::CheckWarning => exposure.reject_warning(),
            ExposureState::FeedMe => exposure.continue_printing(),
            ExposureState::Stuck => exposure.back(),
            s if s.is_finished() => break,
            _ => Ok(()),
        };
        if let Err(e) = reply {
            tracing::warn!("Command rejected in state {}: {}", state, e);
        }
    }
    exposure.join().await?;
    report(&exposure);
    exposure.save(&pickler)?;
    exposure.acknowledge()?;
    Ok(())
}

fn report(exposure: &Exposure) {
    let data = exposure.snapshot();
    tracing::info!(
        "Job {}: {} of {} layers, {:.1} ml resin",
        data.state,
        data.actual_layer,
        exposure.total_layers(),
        data.resin_count_ml
    );
    if let Some(error) = &data.fatal_error {
        tracing::error!("Job error: {}", error);
    }
}
