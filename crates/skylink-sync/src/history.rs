//! Snapshot history: a contiguous window of recent server ticks.
//!
//! Snapshots arrive late, out of order, or not at all. The history keeps the
//! last `capacity` ticks ordered by sequence id with no holes: lost ticks are
//! reconstructed by interpolating between the surrounding received
//! snapshots, stale packets are dropped, and a gap wider than the window
//! resets it from the entity directory's last known states.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use skylink_net::{EntityId, EntityState, SnapshotMessage};

use crate::directory::EntityDirectory;

/// Smallest usable window: a baseline plus the newest tick.
pub const MIN_CAPACITY: usize = 2;

/// How a slot came to hold its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotOrigin {
    /// Decoded from a server snapshot.
    Received,
    /// Reconstructed for a tick whose snapshot was lost.
    Interpolated,
    /// Built from the entity directory when the window was reset.
    Baseline,
}

/// World state at one server tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Wrapping 16-bit tick counter.
    pub sequence_id: u16,
    pub server_timestamp: u64,
    pub last_processed_input_timestamp: u64,
    /// Sparse: an absent id means the entity is not known at this tick.
    pub states: BTreeMap<EntityId, EntityState>,
    pub origin: SlotOrigin,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn new(
        sequence_id: u16,
        server_timestamp: u64,
        last_processed_input_timestamp: u64,
        origin: SlotOrigin,
    ) -> Self {
        Self {
            sequence_id,
            server_timestamp,
            last_processed_input_timestamp,
            states: BTreeMap::new(),
            origin,
        }
    }

    /// Blends `self` (t = 0) towards `newer` (t = 1).
    ///
    /// Entities known to both are interpolated; entities only `self` knows
    /// are carried unchanged; entities only `newer` knows are left out.
    fn interpolate(&self, newer: &Snapshot, sequence_id: u16, t: f32) -> Snapshot {
        let mut out = Snapshot::new(
            sequence_id,
            lerp_timestamp(self.server_timestamp, newer.server_timestamp, t),
            self.last_processed_input_timestamp,
            SlotOrigin::Interpolated,
        );
        for (id, old) in &self.states {
            let state = match newer.states.get(id) {
                Some(new) if new == old => *old,
                Some(new) => old.interpolate(new, t),
                None => *old,
            };
            out.states.insert(*id, state);
        }
        out
    }
}

impl From<SnapshotMessage> for Snapshot {
    fn from(msg: SnapshotMessage) -> Self {
        Self {
            sequence_id: msg.sequence_id,
            server_timestamp: msg.server_timestamp,
            last_processed_input_timestamp: msg.last_processed_input_timestamp,
            states: msg.entities.into_iter().collect(),
            origin: SlotOrigin::Received,
        }
    }
}

fn lerp_timestamp(a: u64, b: u64, t: f32) -> u64 {
    let t = f64::from(t);
    if b >= a {
        a + ((b - a) as f64 * t).round() as u64
    } else {
        a - ((a - b) as f64 * t).round() as u64
    }
}

/// Non-fatal ordering problems seen during ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencingAnomaly {
    /// Same or older sequence id than the newest slot; the packet was dropped.
    DuplicateOrStale {
        /// Sequence id of the dropped packet.
        sequence_id: u16,
        /// Newest sequence id at the time.
        newest: u16,
    },
    /// The jump was at least the window size; the history was reset.
    LargeGap {
        /// Forward distance from the previous newest sequence id.
        gap: u16,
    },
}

/// Result of [`SnapshotHistory::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The snapshot extended the window.
    Appended {
        /// Lost ticks reconstructed by interpolation.
        recovered: usize,
    },
    /// The window was rebuilt around the snapshot.
    Reset {
        /// Ticks between the baseline and the snapshot filled by interpolation.
        recovered: usize,
        /// `None` for the very first snapshot, `LargeGap` otherwise.
        anomaly: Option<SequencingAnomaly>,
    },
    /// The snapshot was discarded; the history is unchanged.
    Dropped(SequencingAnomaly),
}

impl IngestOutcome {
    /// Whether the snapshot became the newest slot.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Dropped(_))
    }

    /// Number of interpolated slots created.
    pub fn recovered(&self) -> usize {
        match *self {
            Self::Appended { recovered } | Self::Reset { recovered, .. } => recovered,
            Self::Dropped(_) => 0,
        }
    }
}

/// Fixed-capacity, contiguous window of snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    slots: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotHistory {
    /// Creates an empty history. Capacities below [`MIN_CAPACITY`] are raised.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, usize::from(u16::MAX / 2));
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts a server snapshot.
    ///
    /// `directory` supplies the baseline when the window has to be reset.
    /// States of ids it reports as retired are discarded, so a snapshot sent
    /// before a delete cannot reintroduce the entity.
    pub fn ingest(&mut self, mut incoming: Snapshot, directory: &EntityDirectory) -> IngestOutcome {
        incoming.states.retain(|id, _| !directory.is_retired(*id));

        let Some(newest) = self.slots.back() else {
            let recovered = self.reset(incoming, directory);
            return IngestOutcome::Reset {
                recovered,
                anomaly: None,
            };
        };

        let gap = incoming.sequence_id.wrapping_sub(newest.sequence_id);
        // Forward distances past half the sequence space are packets from the past.
        if gap == 0 || gap > u16::MAX / 2 {
            return IngestOutcome::Dropped(SequencingAnomaly::DuplicateOrStale {
                sequence_id: incoming.sequence_id,
                newest: newest.sequence_id,
            });
        }

        if usize::from(gap) >= self.capacity {
            tracing::warn!(
                gap,
                sequence_id = incoming.sequence_id,
                "Snapshot gap exceeds history, resetting"
            );
            let recovered = self.reset(incoming, directory);
            return IngestOutcome::Reset {
                recovered,
                anomaly: Some(SequencingAnomaly::LargeGap { gap }),
            };
        }

        let recovered = self.append(incoming);
        if recovered > 0 {
            tracing::warn!(recovered, "Lost {recovered} states, recreating by interpolation");
        }
        IngestOutcome::Appended { recovered }
    }

    /// Pushes `incoming` after the current newest slot, filling the gap.
    fn append(&mut self, mut incoming: Snapshot) -> usize {
        let Some(previous) = self.slots.back().cloned() else {
            return 0;
        };
        carry_forward(&previous, &mut incoming);
        self.fill_after(&previous, incoming)
    }

    /// Pushes the ticks between `previous` and `incoming`, then `incoming`.
    fn fill_after(&mut self, previous: &Snapshot, incoming: Snapshot) -> usize {
        let gap = incoming.sequence_id.wrapping_sub(previous.sequence_id);
        let lost = usize::from(gap).saturating_sub(1);
        for i in 1..=lost {
            let t = i as f32 / f32::from(gap);
            let seq = previous.sequence_id.wrapping_add(i as u16);
            self.push(previous.interpolate(&incoming, seq, t));
        }
        self.push(incoming);
        lost
    }

    /// Rebuilds the window: baseline at the oldest slot, `incoming` at the
    /// newest, interpolated ticks in between.
    ///
    /// The newest slot is `incoming` exactly; nothing is carried forward from
    /// the baseline.
    fn reset(&mut self, incoming: Snapshot, directory: &EntityDirectory) -> usize {
        let (server_timestamp, last_processed) = match self.slots.back() {
            Some(prev) => (prev.server_timestamp, prev.last_processed_input_timestamp),
            None => (
                incoming.server_timestamp,
                incoming.last_processed_input_timestamp,
            ),
        };
        let span = (self.capacity - 1) as u16;
        let mut baseline = Snapshot::new(
            incoming.sequence_id.wrapping_sub(span),
            server_timestamp.min(incoming.server_timestamp),
            last_processed.min(incoming.last_processed_input_timestamp),
            SlotOrigin::Baseline,
        );
        baseline.states = directory.baseline();

        self.slots.clear();
        self.slots.push_back(baseline.clone());
        self.fill_after(&baseline, incoming)
    }

    fn push(&mut self, snapshot: Snapshot) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(snapshot);
    }

    /// The newest slot. `None` before the first ingest.
    pub fn latest_confirmed(&self) -> Option<&Snapshot> {
        self.slots.back()
    }

    /// The slot holding `sequence_id`, if it is inside the window.
    pub fn at(&self, sequence_id: u16) -> Option<&Snapshot> {
        let oldest = self.slots.front()?;
        let offset = usize::from(sequence_id.wrapping_sub(oldest.sequence_id));
        self.slots.get(offset)
    }

    /// Writes `state` for `id` into every slot that lacks it.
    ///
    /// Called when an entity is created so later gap-fills have both
    /// endpoints.
    pub fn seed_entity(&mut self, id: EntityId, state: EntityState) {
        for slot in &mut self.slots {
            slot.states.entry(id).or_insert(state);
        }
    }

    /// Removes `id` from every slot so it is no longer carried forward.
    pub fn forget_entity(&mut self, id: EntityId) {
        for slot in &mut self.slots {
            slot.states.remove(&id);
        }
    }

    /// Slots oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn newest_sequence(&self) -> Option<u16> {
        self.slots.back().map(|s| s.sequence_id)
    }

    /// Empties the window; the next ingest resets it.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Entities absent from `incoming` keep their previous state.
fn carry_forward(previous: &Snapshot, incoming: &mut Snapshot) {
    for (id, state) in &previous.states {
        incoming.states.entry(*id).or_insert(*state);
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;

    fn state_at(x: f32) -> EntityState {
        EntityState {
            position: Vec3::new(x, 0.0, 0.0),
            ..Default::default()
        }
    }

    fn snap(seq: u16, entities: &[(u32, f32)]) -> Snapshot {
        let mut s = Snapshot::new(seq, u64::from(seq) * 50, 0, SlotOrigin::Received);
        for &(id, x) in entities {
            s.states.insert(EntityId(id), state_at(x));
        }
        s
    }

    fn assert_contiguous(history: &SnapshotHistory) {
        let seqs: Vec<u16> = history.iter().map(|s| s.sequence_id).collect();
        for pair in seqs.windows(2) {
            assert_eq!(pair[0].wrapping_add(1), pair[1], "window {seqs:?}");
        }
    }

    #[test]
    fn test_first_ingest_resets_to_full_window() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(10);
        let outcome = history.ingest(snap(100, &[(1, 0.0)]), &dir);

        assert_eq!(
            outcome,
            IngestOutcome::Reset {
                recovered: 8,
                anomaly: None
            }
        );
        assert_eq!(history.len(), 10);
        assert_eq!(history.iter().next().unwrap().sequence_id, 91);
        assert_eq!(history.iter().next().unwrap().origin, SlotOrigin::Baseline);
        assert_eq!(history.latest_confirmed().unwrap(), &snap(100, &[(1, 0.0)]));
        assert_contiguous(&history);
    }

    #[test]
    fn test_lost_snapshot_interpolated_at_half() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(10);
        history.ingest(snap(1, &[(1, 0.0)]), &dir);
        history.ingest(snap(2, &[(1, 2.0)]), &dir);
        let outcome = history.ingest(snap(4, &[(1, 6.0)]), &dir);

        assert_eq!(outcome, IngestOutcome::Appended { recovered: 1 });
        let slot = history.at(3).unwrap();
        assert_eq!(slot.origin, SlotOrigin::Interpolated);
        assert!(
            slot.states[&EntityId(1)]
                .position
                .abs_diff_eq(Vec3::new(4.0, 0.0, 0.0), 1e-6)
        );
        assert_eq!(slot.server_timestamp, 150);
        assert_contiguous(&history);
    }

    #[test]
    fn test_interpolation_factors_across_longer_gap() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(10);
        history.ingest(snap(10, &[(1, 0.0)]), &dir);
        history.ingest(snap(14, &[(1, 8.0)]), &dir);

        for (seq, x) in [(11u16, 2.0), (12, 4.0), (13, 6.0)] {
            let pos = history.at(seq).unwrap().states[&EntityId(1)].position;
            assert!(pos.abs_diff_eq(Vec3::new(x, 0.0, 0.0), 1e-5), "seq {seq}: {pos}");
        }
    }

    #[test]
    fn test_rotation_is_slerped() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(4);
        let mut a = snap(1, &[]);
        a.states.insert(EntityId(1), EntityState::default());
        let mut b = snap(3, &[]);
        let turned = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        b.states.insert(EntityId(1), EntityState::at_rest(Vec3::ZERO, turned));

        history.ingest(a, &dir);
        history.ingest(b, &dir);

        let mid = history.at(2).unwrap().states[&EntityId(1)].rotation;
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(mid.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_duplicate_and_stale_dropped() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(10);
        history.ingest(snap(5, &[(1, 0.0)]), &dir);
        history.ingest(snap(6, &[(1, 1.0)]), &dir);
        let before = history.latest_confirmed().cloned();

        let dup = history.ingest(snap(6, &[(1, 9.0)]), &dir);
        let stale = history.ingest(snap(4, &[(1, 9.0)]), &dir);

        assert_eq!(
            dup,
            IngestOutcome::Dropped(SequencingAnomaly::DuplicateOrStale {
                sequence_id: 6,
                newest: 6
            })
        );
        assert!(!stale.is_accepted());
        assert_eq!(history.latest_confirmed().cloned(), before);
    }

    #[test]
    fn test_large_gap_resets_contiguously() {
        let mut dir = EntityDirectory::new();
        dir.upsert(EntityId(1), state_at(3.0));
        let mut history = SnapshotHistory::new(5);
        history.ingest(snap(1, &[(1, 0.0)]), &dir);
        history.ingest(snap(2, &[(1, 1.0)]), &dir);

        let incoming = snap(40, &[(1, 7.0)]);
        let outcome = history.ingest(incoming.clone(), &dir);

        assert_eq!(
            outcome,
            IngestOutcome::Reset {
                recovered: 3,
                anomaly: Some(SequencingAnomaly::LargeGap { gap: 38 })
            }
        );
        assert_eq!(history.len(), 5);
        assert_contiguous(&history);
        assert_eq!(history.latest_confirmed().unwrap(), &incoming);

        let baseline = history.at(36).unwrap();
        assert_eq!(baseline.origin, SlotOrigin::Baseline);
        assert_eq!(baseline.states[&EntityId(1)], state_at(3.0));
    }

    #[test]
    fn test_reset_keeps_incoming_exact() {
        let mut dir = EntityDirectory::new();
        dir.create(EntityId(7), state_at(2.0), "drone", "Drone 7");
        let mut history = SnapshotHistory::new(4);

        let incoming = snap(20, &[(1, 0.0)]);
        history.ingest(incoming.clone(), &dir);

        let newest = history.latest_confirmed().unwrap();
        assert_eq!(newest, &incoming);
        assert_eq!(newest.states.len(), 1);
        // The directory entity still anchors the reconstructed ticks.
        assert_eq!(history.at(17).unwrap().states[&EntityId(7)], state_at(2.0));
        assert_eq!(history.at(18).unwrap().states[&EntityId(7)], state_at(2.0));
    }

    #[test]
    fn test_retired_entity_dropped_from_incoming() {
        let mut dir = EntityDirectory::new();
        dir.create(EntityId(2), state_at(5.0), "drone", "Drone 2");
        let mut history = SnapshotHistory::new(4);
        history.ingest(snap(1, &[(1, 0.0), (2, 5.0)]), &dir);

        dir.remove(EntityId(2));
        history.forget_entity(EntityId(2));
        // Sent by the server before it deleted the entity.
        history.ingest(snap(2, &[(1, 1.0), (2, 6.0)]), &dir);
        history.ingest(snap(4, &[(1, 3.0)]), &dir);

        assert!(history.iter().all(|s| !s.states.contains_key(&EntityId(2))));
    }

    #[test]
    fn test_gap_equal_to_capacity_resets() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(4);
        history.ingest(snap(10, &[]), &dir);
        let outcome = history.ingest(snap(14, &[]), &dir);
        assert!(matches!(
            outcome,
            IngestOutcome::Reset {
                anomaly: Some(SequencingAnomaly::LargeGap { gap: 4 }),
                ..
            }
        ));
        assert_contiguous(&history);
    }

    #[test]
    fn test_sequence_wraparound() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(6);
        history.ingest(snap(65534, &[(1, 0.0)]), &dir);
        let outcome = history.ingest(snap(1, &[(1, 3.0)]), &dir);

        assert_eq!(outcome, IngestOutcome::Appended { recovered: 2 });
        assert_eq!(history.newest_sequence(), Some(1));
        assert!(history.at(65535).is_some());
        assert!(history.at(0).is_some());
        assert_contiguous(&history);
        assert!(!history.ingest(snap(65535, &[]), &dir).is_accepted());
    }

    #[test]
    fn test_absent_entity_carried_forward() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(10);
        history.ingest(snap(1, &[(1, 0.0), (2, 5.0)]), &dir);
        history.ingest(snap(2, &[(1, 1.0)]), &dir);

        let latest = history.latest_confirmed().unwrap();
        assert_eq!(latest.states[&EntityId(2)], state_at(5.0));
        assert_eq!(latest.states[&EntityId(1)], state_at(1.0));
    }

    #[test]
    fn test_window_stays_bounded() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(4);
        for seq in 1..=20 {
            if seq % 3 != 0 {
                history.ingest(snap(seq, &[(1, f32::from(seq))]), &dir);
            }
            assert!(history.len() <= 4);
            assert_contiguous(&history);
        }
        assert_eq!(history.newest_sequence(), Some(20));
    }

    #[test]
    fn test_seed_and_forget_entity() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(3);
        history.ingest(snap(1, &[(1, 0.0)]), &dir);

        history.seed_entity(EntityId(7), state_at(4.0));
        assert!(history.iter().all(|s| s.states[&EntityId(7)] == state_at(4.0)));
        // Existing states are not overwritten.
        history.seed_entity(EntityId(1), state_at(9.0));
        assert_eq!(history.latest_confirmed().unwrap().states[&EntityId(1)], state_at(0.0));

        history.forget_entity(EntityId(7));
        assert!(history.iter().all(|s| !s.states.contains_key(&EntityId(7))));
    }

    #[test]
    fn test_clear_forces_reset() {
        let dir = EntityDirectory::new();
        let mut history = SnapshotHistory::new(3);
        history.ingest(snap(1, &[]), &dir);
        history.clear();
        assert!(history.is_empty());
        assert!(matches!(
            history.ingest(snap(2, &[]), &dir),
            IngestOutcome::Reset { anomaly: None, .. }
        ));
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(SnapshotHistory::new(0).capacity(), MIN_CAPACITY);
    }
}
