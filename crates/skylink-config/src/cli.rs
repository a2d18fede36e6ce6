//! Command-line overrides for the simulation binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Skylink loopback simulation arguments.
///
/// Every flag is optional; a present flag overrides the value loaded from
/// `skylink.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "skylink-sim", about = "Skylink client sync loopback simulation")]
pub struct CliArgs {
    /// Packet loss probability (0.0 - 1.0).
    #[arg(long)]
    pub loss: Option<f64>,

    /// Packet reorder probability (0.0 - 1.0).
    #[arg(long)]
    pub reorder: Option<f64>,

    /// One-way latency in milliseconds.
    #[arg(long)]
    pub latency: Option<u64>,

    /// Latency jitter in milliseconds.
    #[arg(long)]
    pub jitter: Option<u64>,

    /// Simulated duration in seconds.
    #[arg(long)]
    pub duration: Option<u32>,

    /// RNG seed for the lossy link.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Snapshot history capacity.
    #[arg(long)]
    pub history_capacity: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(loss) = args.loss {
            self.simulation.loss_rate = loss;
        }
        if let Some(reorder) = args.reorder {
            self.simulation.reorder_rate = reorder;
        }
        if let Some(latency) = args.latency {
            self.simulation.latency_ms = latency;
        }
        if let Some(jitter) = args.jitter {
            self.simulation.jitter_ms = jitter;
        }
        if let Some(duration) = args.duration {
            self.simulation.duration_secs = duration;
        }
        if let Some(seed) = args.seed {
            self.simulation.seed = seed;
        }
        if let Some(capacity) = args.history_capacity {
            self.sync.history_capacity = capacity;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            loss: Some(0.25),
            seed: Some(99),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.simulation.loss_rate, 0.25);
        assert_eq!(config.simulation.seed, 99);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.simulation.latency_ms, 50);
        assert_eq!(config.sync.history_capacity, 10);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "skylink-sim",
            "--loss",
            "0.3",
            "--latency",
            "120",
            "--history-capacity",
            "16",
        ]);
        assert_eq!(args.loss, Some(0.3));
        assert_eq!(args.latency, Some(120));
        assert_eq!(args.history_capacity, Some(16));
        assert!(args.config.is_none());
    }
}
