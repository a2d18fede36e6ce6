//! Configuration for the synchronization core and its tools.
//!
//! Settings persist to disk as RON, accept CLI overrides via clap, and stay
//! forward/backward compatible: missing fields take defaults and unknown
//! fields are ignored.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, ClockConfig, Config, DebugConfig, OffsetFilterKind, PredictionConfig,
    SimulationConfig, SyncConfig,
};
pub use error::ConfigError;
