//! Skylink loopback simulation.
//!
//! Runs an authoritative arena server and one client session against each
//! other over a simulated lossy link, then logs what the client's sync layer
//! had to recover from.
//!
//! Run with: `cargo run -p skylink-sim -- --loss 0.1 --latency 60`

mod link;
mod pilot;
mod server;
mod sim;

use std::path::PathBuf;

use clap::Parser;
use skylink_config::{CliArgs, Config};
use tracing::{info, warn};

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("skylink"))
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let (mut config, load_error) = match Config::load_or_create(&config_dir) {
        Ok(config) => (config, None),
        Err(err) => (Config::default(), Some(err)),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    skylink_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Some(err) = load_error {
        warn!("Failed to load config: {err}, using defaults");
    }
    config.validate();

    let scenario = &config.simulation;
    info!(
        loss = scenario.loss_rate,
        reorder = scenario.reorder_rate,
        latency_ms = scenario.latency_ms,
        jitter_ms = scenario.jitter_ms,
        seed = scenario.seed,
        duration_secs = scenario.duration_secs,
        "Starting loopback simulation"
    );

    let report = sim::run(&config);
    sim::log_report(&report);
}
