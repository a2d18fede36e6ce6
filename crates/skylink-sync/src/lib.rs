//! Client-side network synchronization.
//!
//! Keeps a client's view of server-authoritative entities consistent over an
//! unreliable, reordering, lossy channel while local input still takes effect
//! immediately:
//!
//! - [`ClockSync`] estimates the server clock from round-trip probes.
//! - [`SnapshotHistory`] keeps a gap-free window of recent server ticks.
//! - [`PredictionEngine`] predicts the controlled entity and reconciles it
//!   against confirmed snapshots.
//! - [`EntityDirectory`] is the table the presentation layer reads.
//! - [`ClientSession`] owns all of the above for one connection.

pub mod clock;
pub mod diagnostics;
pub mod directory;
pub mod history;
pub mod prediction;
pub mod session;


pub use clock::{ClockEstimate, ClockSync};
pub use diagnostics::SyncStats;
pub use directory::{EntityDirectory, EntityEntry, Lifecycle};
pub use history::{IngestOutcome, SequencingAnomaly, SlotOrigin, Snapshot, SnapshotHistory};
pub use prediction::{
    Correction, InputIntent, InputLog, MovementLimits, PredictedInput, PredictionEngine,
    ReconcileOutcome, elapsed_secs, integrate, replay,
};
pub use session::{ClientSession, InputSource, SyncEvent};
