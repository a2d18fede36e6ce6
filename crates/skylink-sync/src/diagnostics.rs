//! Session counters: decode failures, sequencing anomalies, corrections.

use serde::Serialize;

/// Lifetime counters of one [`ClientSession`](crate::ClientSession).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Packets that decoded into a message.
    pub packets_decoded: u64,
    /// Packets discarded by the codec.
    pub decode_errors: u64,
    /// Snapshots that became the newest history slot.
    pub snapshots_accepted: u64,
    /// Duplicate or out-of-order snapshots dropped.
    pub stale_snapshots: u64,
    /// History resets after a gap at least the window size.
    pub history_resets: u64,
    /// Lost ticks reconstructed by interpolation.
    pub interpolated_states: u64,
    /// Ticks jumped over by a history reset; never interpolated from real
    /// endpoints.
    pub skipped_states: u64,
    /// Reconciliations eased towards the server.
    pub smoothed_corrections: u64,
    /// Reconciliations that snapped.
    pub teleports: u64,
    /// Clock probes answered.
    pub probes_completed: u64,
    /// Clock responses that matched no outstanding probe.
    pub probes_ignored: u64,
    /// Inputs sampled and sent.
    pub inputs_sent: u64,
}

impl SyncStats {
    /// Fraction of snapshot sequence ids that never arrived, whether they
    /// were reconstructed or skipped by a reset.
    pub fn loss_ratio(&self) -> f64 {
        let lost = self.interpolated_states + self.skipped_states;
        let total = self.snapshots_accepted + lost;
        if total == 0 {
            return 0.0;
        }
        lost as f64 / total as f64
    }
}
