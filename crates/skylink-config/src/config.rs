//! Configuration structs with defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside a config directory.
pub const CONFIG_FILE_NAME: &str = "skylink.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Snapshot history, input log, and rates.
    pub sync: SyncConfig,
    /// Client-side prediction and correction.
    pub prediction: PredictionConfig,
    /// Clock offset estimation.
    pub clock: ClockConfig,
    /// Loopback simulation used by `skylink-sim`.
    pub simulation: SimulationConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Buffer sizes and rates of a client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of snapshot slots kept in the history ring.
    pub history_capacity: usize,
    /// Maximum number of unacknowledged inputs retained for replay.
    pub input_log_capacity: usize,
    /// Input sampling rate (Hz).
    pub input_rate_hz: u32,
    /// Interval between clock probes in milliseconds.
    pub time_sync_interval_ms: u64,
}

/// Prediction limits and correction smoothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictionConfig {
    /// Squared distance above which a correction snaps instead of blending.
    pub teleport_threshold_sq: f32,
    /// Fraction of the remaining error removed per reconciliation.
    pub smoothing_factor: f32,
    /// Per-axis speed limit along local axes, units per second.
    pub max_speed: [f32; 3],
    /// Per-axis turn rate limit (pitch, yaw, roll), degrees per second.
    pub max_turn_rate: [f32; 3],
}

/// Clock offset estimation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClockConfig {
    /// How completed probes are turned into an offset.
    pub filter: OffsetFilterKind,
}

/// Strategy for deriving the clock offset from probe samples.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OffsetFilterKind {
    /// The most recent completed probe wins.
    #[default]
    LatestProbe,
    /// The probe with the smallest round trip among the last `window` wins.
    MinRoundTrip {
        /// Number of recent samples considered.
        window: usize,
    },
}

/// Lossy loopback link and scenario for the simulation binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Probability that a packet is dropped (0.0 - 1.0).
    pub loss_rate: f64,
    /// Probability that a packet swaps places with its successor (0.0 - 1.0).
    pub reorder_rate: f64,
    /// One-way base latency in milliseconds.
    pub latency_ms: u64,
    /// Maximum random latency added on top of `latency_ms`.
    pub jitter_ms: u64,
    /// Server snapshot rate (Hz).
    pub snapshot_rate_hz: u32,
    /// Simulated duration in seconds.
    pub duration_secs: u32,
    /// RNG seed; equal seeds replay identical runs.
    pub seed: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level filter (e.g., "debug", "info", "skylink_sync=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10,
            input_log_capacity: 256,
            input_rate_hz: 60,
            time_sync_interval_ms: 1000,
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            teleport_threshold_sq: 4.0,
            smoothing_factor: 0.1,
            max_speed: [20.0, 15.0, 15.0],
            max_turn_rate: [200.0, 200.0, 100.0],
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.1,
            reorder_rate: 0.05,
            latency_ms: 50,
            jitter_ms: 20,
            snapshot_rate_hz: 20,
            duration_secs: 10,
            seed: 7,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Validation ---

impl Config {
    /// Clamps values the core cannot run with into their valid range.
    ///
    /// Returns the number of adjusted fields; each adjustment is logged.
    pub fn validate(&mut self) -> usize {
        let mut adjusted = 0;

        if self.sync.history_capacity < 2 {
            log::warn!(
                "sync.history_capacity {} is below 2, using 2",
                self.sync.history_capacity
            );
            self.sync.history_capacity = 2;
            adjusted += 1;
        }
        if self.sync.input_log_capacity == 0 {
            log::warn!("sync.input_log_capacity is 0, using 1");
            self.sync.input_log_capacity = 1;
            adjusted += 1;
        }
        if self.sync.input_rate_hz == 0 {
            log::warn!("sync.input_rate_hz is 0, using 1");
            self.sync.input_rate_hz = 1;
            adjusted += 1;
        }
        if self.simulation.snapshot_rate_hz == 0 {
            log::warn!("simulation.snapshot_rate_hz is 0, using 1");
            self.simulation.snapshot_rate_hz = 1;
            adjusted += 1;
        }

        let factor = self.prediction.smoothing_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            let clamped = if factor > 1.0 { 1.0 } else { 0.1 };
            log::warn!("prediction.smoothing_factor {factor} is outside (0, 1], using {clamped}");
            self.prediction.smoothing_factor = clamped;
            adjusted += 1;
        }
        if !(self.prediction.teleport_threshold_sq >= 0.0) {
            log::warn!("prediction.teleport_threshold_sq is negative or NaN, using 4.0");
            self.prediction.teleport_threshold_sq = 4.0;
            adjusted += 1;
        }

        if let OffsetFilterKind::MinRoundTrip { window: 0 } = self.clock.filter {
            log::warn!("clock.filter window is 0, using 1");
            self.clock.filter = OffsetFilterKind::MinRoundTrip { window: 1 };
            adjusted += 1;
        }

        for rate in [
            &mut self.simulation.loss_rate,
            &mut self.simulation.reorder_rate,
        ] {
            let value = *rate;
            if !(0.0..=1.0).contains(&value) {
                log::warn!("simulation probability {value} is outside [0, 1], clamping");
                *rate = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
                adjusted += 1;
            }
        }

        adjusted
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load `skylink.ron` from the given directory, or create it with defaults.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let config = Self::load_file(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Parse a specific RON file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to the given directory as `skylink.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::load_file(&config_dir.join(CONFIG_FILE_NAME))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
