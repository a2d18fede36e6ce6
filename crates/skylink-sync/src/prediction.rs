//! Client-side prediction and server reconciliation.
//!
//! Local input moves the controlled entity immediately. Every input is kept
//! in an [`InputLog`] until a snapshot acknowledges it; on each confirmed
//! snapshot the engine rewinds to the server's state, replays what is still
//! unacknowledged, and eases the displayed transform towards the result (or
//! snaps it, when the error is too large to hide).

use std::collections::VecDeque;

use glam::{EulerRot, Vec3};
use serde::Serialize;
use skylink_config::PredictionConfig;
use skylink_net::{EntityId, EntityState, InputMessage};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Movement and rotation intent for one input tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InputIntent {
    /// Velocity along the entity's local axes, units per second.
    pub movement: Vec3,
    /// Pitch, yaw, roll rates in degrees per second.
    pub rotation: Vec3,
}

impl InputIntent {
    pub fn new(movement: Vec3, rotation: Vec3) -> Self {
        Self { movement, rotation }
    }
}

/// An input applied locally and sent to the server, not yet acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PredictedInput {
    /// Estimated server time in milliseconds.
    pub timestamp: u64,
    pub movement_intent: Vec3,
    pub rotation_intent: Vec3,
}

impl PredictedInput {
    /// Wire form of this input.
    pub fn to_message(&self) -> InputMessage {
        InputMessage {
            timestamp: self.timestamp,
            movement_intent: self.movement_intent,
            rotation_intent: self.rotation_intent,
        }
    }
}

impl From<&InputMessage> for PredictedInput {
    fn from(msg: &InputMessage) -> Self {
        Self {
            timestamp: msg.timestamp,
            movement_intent: msg.movement_intent,
            rotation_intent: msg.rotation_intent,
        }
    }
}

/// Per-axis bounds the server enforces on input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementLimits {
    /// Units per second along local x, y, z.
    pub max_speed: Vec3,
    /// Degrees per second for pitch, yaw, roll.
    pub max_turn_rate: Vec3,
}

impl Default for MovementLimits {
    fn default() -> Self {
        Self::from(&PredictionConfig::default())
    }
}

impl From<&PredictionConfig> for MovementLimits {
    fn from(config: &PredictionConfig) -> Self {
        Self {
            max_speed: Vec3::from_array(config.max_speed).abs(),
            max_turn_rate: Vec3::from_array(config.max_turn_rate).abs(),
        }
    }
}

impl MovementLimits {
    /// Clamps every axis into `[-limit, limit]`.
    pub fn clamp(&self, intent: InputIntent) -> InputIntent {
        InputIntent {
            movement: intent.movement.clamp(-self.max_speed, self.max_speed),
            rotation: intent.rotation.clamp(-self.max_turn_rate, self.max_turn_rate),
        }
    }
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

/// Seconds between two millisecond timestamps; zero if `to` is not later.
pub fn elapsed_secs(from: u64, to: u64) -> f32 {
    to.saturating_sub(from) as f32 / 1000.0
}

/// Advances `state` by one input held for `dt` seconds.
///
/// Movement is along the entity's local axes; rotation composes pitch, yaw,
/// and roll in local space. Shared by prediction, replay, and the server so
/// all three agree.
pub fn integrate(state: &EntityState, movement: Vec3, rotation_degrees: Vec3, dt: f32) -> EntityState {
    let velocity = state.rotation * movement;
    let angles = rotation_degrees * dt;
    let delta = glam::Quat::from_euler(
        EulerRot::XYZ,
        angles.x.to_radians(),
        angles.y.to_radians(),
        angles.z.to_radians(),
    );
    EntityState {
        position: state.position + velocity * dt,
        rotation: (state.rotation * delta).normalize(),
        linear_velocity: velocity,
        angular_velocity: Vec3::new(
            rotation_degrees.x.to_radians(),
            rotation_degrees.y.to_radians(),
            rotation_degrees.z.to_radians(),
        ),
    }
}

/// Replays `inputs` on top of `start`.
///
/// Each input is held from the previous timestamp to its own; the first is
/// measured from `last_processed`.
pub fn replay<'a>(
    start: &EntityState,
    last_processed: u64,
    inputs: impl IntoIterator<Item = &'a PredictedInput>,
) -> EntityState {
    let mut state = *start;
    let mut last = last_processed;
    for input in inputs {
        let dt = elapsed_secs(last, input.timestamp);
        state = integrate(&state, input.movement_intent, input.rotation_intent, dt);
        last = input.timestamp;
    }
    state
}

// ---------------------------------------------------------------------------
// InputLog
// ---------------------------------------------------------------------------

/// Bounded, timestamp-ordered log of unacknowledged inputs.
#[derive(Debug, Clone)]
pub struct InputLog {
    entries: VecDeque<PredictedInput>,
    capacity: usize,
}

impl InputLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an input. Returns `true` if the oldest entry was evicted.
    pub fn push(&mut self, input: PredictedInput) -> bool {
        let evicted = self.entries.len() == self.capacity;
        if evicted {
            self.entries.pop_front();
        }
        self.entries.push_back(input);
        evicted
    }

    /// Drops every entry with `timestamp <= up_to`. Returns how many.
    pub fn acknowledge(&mut self, up_to: u64) -> usize {
        let keep_from = self
            .entries
            .iter()
            .position(|e| e.timestamp > up_to)
            .unwrap_or(self.entries.len());
        self.entries.drain(..keep_from);
        keep_from
    }

    pub fn iter(&self) -> impl Iterator<Item = &PredictedInput> {
        self.entries.iter()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.entries.back().map(|e| e.timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Reconciliation outcome
// ---------------------------------------------------------------------------

/// How the displayed transform was corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Correction {
    /// Eased towards the reconciled transform.
    Smoothed,
    /// Snapped to the reconciled transform.
    Teleport,
}

/// Result of [`PredictionEngine::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileOutcome {
    /// Server state plus the replayed unacknowledged inputs.
    pub reconciled: EntityState,
    /// Squared distance between the displayed and reconciled positions
    /// before the correction.
    pub error_sq: f32,
    pub correction: Correction,
    /// Inputs acknowledged by this snapshot.
    pub acknowledged: usize,
}

// ---------------------------------------------------------------------------
// PredictionEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Idle,
    Predicting {
        entity: EntityId,
        displayed: EntityState,
        last_input: Option<u64>,
    },
}

/// Prediction state for the one entity this client controls.
#[derive(Debug, Clone)]
pub struct PredictionEngine {
    mode: Mode,
    log: InputLog,
    limits: MovementLimits,
    teleport_threshold_sq: f32,
    smoothing_factor: f32,
}

impl PredictionEngine {
    pub fn new(config: &PredictionConfig, input_log_capacity: usize) -> Self {
        Self {
            mode: Mode::Idle,
            log: InputLog::new(input_log_capacity),
            limits: MovementLimits::from(config),
            teleport_threshold_sq: config.teleport_threshold_sq,
            smoothing_factor: config.smoothing_factor.clamp(f32::EPSILON, 1.0),
        }
    }

    /// Starts predicting `entity` from `state`. Clears any previous log.
    pub fn assign(&mut self, entity: EntityId, state: EntityState) {
        self.log.clear();
        self.mode = Mode::Predicting {
            entity,
            displayed: state,
            last_input: None,
        };
    }

    /// Stops predicting. Returns the entity that was controlled.
    pub fn unassign(&mut self) -> Option<EntityId> {
        let previous = self.controlled();
        self.mode = Mode::Idle;
        self.log.clear();
        previous
    }

    pub fn is_predicting(&self) -> bool {
        matches!(self.mode, Mode::Predicting { .. })
    }

    pub fn controlled(&self) -> Option<EntityId> {
        match self.mode {
            Mode::Predicting { entity, .. } => Some(entity),
            Mode::Idle => None,
        }
    }

    /// Transform shown for the controlled entity.
    pub fn displayed(&self) -> Option<&EntityState> {
        match &self.mode {
            Mode::Predicting { displayed, .. } => Some(displayed),
            Mode::Idle => None,
        }
    }

    pub fn log(&self) -> &InputLog {
        &self.log
    }

    pub fn limits(&self) -> &MovementLimits {
        &self.limits
    }

    /// Clamps, logs, and applies one input sampled at `timestamp`.
    ///
    /// Timestamps are forced strictly increasing so replay deltas stay
    /// non-negative when the clock estimate moves backwards. Returns `None`
    /// while idle.
    pub fn record_input(&mut self, timestamp: u64, intent: InputIntent) -> Option<PredictedInput> {
        let Mode::Predicting {
            displayed,
            last_input,
            ..
        } = &mut self.mode
        else {
            return None;
        };

        let timestamp = match *last_input {
            Some(prev) => timestamp.max(prev.saturating_add(1)),
            None => timestamp,
        };
        let intent = self.limits.clamp(intent);
        let dt = last_input.map_or(0.0, |prev| elapsed_secs(prev, timestamp));

        *displayed = integrate(displayed, intent.movement, intent.rotation, dt);
        *last_input = Some(timestamp);

        let input = PredictedInput {
            timestamp,
            movement_intent: intent.movement,
            rotation_intent: intent.rotation,
        };
        if self.log.push(input) {
            tracing::debug!("Input log full, dropped oldest unacknowledged input");
        }
        Some(input)
    }

    /// Drops inputs the server has processed, without reconciling.
    ///
    /// For snapshots that carry no state for the controlled entity. Returns
    /// how many inputs were dropped; 0 while idle.
    pub fn acknowledge(&mut self, last_processed: u64) -> usize {
        if !self.is_predicting() {
            return 0;
        }
        self.log.acknowledge(last_processed)
    }

    /// Reconciles against a confirmed server state of the controlled entity.
    ///
    /// Returns `None` while idle.
    pub fn reconcile(
        &mut self,
        confirmed: &EntityState,
        last_processed: u64,
    ) -> Option<ReconcileOutcome> {
        let Mode::Predicting { displayed, .. } = &mut self.mode else {
            return None;
        };

        let acknowledged = self.log.acknowledge(last_processed);
        let reconciled = replay(confirmed, last_processed, self.log.iter());

        let error_sq = displayed.position.distance_squared(reconciled.position);
        let correction = if error_sq < self.teleport_threshold_sq {
            let t = self.smoothing_factor;
            displayed.position = displayed.position.lerp(reconciled.position, t);
            displayed.rotation = displayed.rotation.slerp(reconciled.rotation, t).normalize();
            displayed.linear_velocity = reconciled.linear_velocity;
            displayed.angular_velocity = reconciled.angular_velocity;
            Correction::Smoothed
        } else {
            tracing::warn!(error_sq, "Prediction diverged, teleporting");
            *displayed = reconciled;
            Correction::Teleport
        };

        Some(ReconcileOutcome {
            reconciled,
            error_sq,
            correction,
            acknowledged,
        })
    }
}

#[cfg(test)]
mod tests {
    use glam::Quat;

    use super::*;

    fn input(timestamp: u64, movement: Vec3) -> PredictedInput {
        PredictedInput {
            timestamp,
            movement_intent: movement,
            rotation_intent: Vec3::ZERO,
        }
    }

    fn engine() -> PredictionEngine {
        PredictionEngine::new(&PredictionConfig::default(), 256)
    }

    #[test]
    fn test_integrate_moves_along_local_axes() {
        let facing_left = EntityState::at_rest(Vec3::ZERO, Quat::from_rotation_z(90f32.to_radians()));
        let next = integrate(&facing_left, Vec3::X, Vec3::ZERO, 2.0);
        assert!(next.position.abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-5));
    }

    #[test]
    fn test_integrate_rotation_in_degrees() {
        let start = EntityState::default();
        let next = integrate(&start, Vec3::ZERO, Vec3::new(0.0, 90.0, 0.0), 0.5);
        let expected = Quat::from_rotation_y(45f32.to_radians());
        assert!(next.rotation.abs_diff_eq(expected, 1e-5));
        assert!(next.rotation.is_normalized());
    }

    #[test]
    fn test_replay_two_inputs() {
        let inputs = [input(1000, Vec3::X), input(2000, Vec3::X)];
        let end = replay(&EntityState::default(), 0, &inputs);
        // First delta measured from last_processed = 0.
        assert!(end.position.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn test_clamp_limits() {
        let limits = MovementLimits::default();
        let clamped = limits.clamp(InputIntent::new(
            Vec3::new(50.0, -40.0, 3.0),
            Vec3::new(-500.0, 10.0, 150.0),
        ));
        assert_eq!(clamped.movement, Vec3::new(20.0, -15.0, 3.0));
        assert_eq!(clamped.rotation, Vec3::new(-200.0, 10.0, 100.0));
    }

    #[test]
    fn test_log_acknowledge_prunes_front() {
        let mut log = InputLog::new(8);
        for ts in [10, 20, 30, 40] {
            log.push(input(ts, Vec3::ZERO));
        }
        assert_eq!(log.acknowledge(25), 2);
        assert!(log.iter().all(|e| e.timestamp > 25));
        assert_eq!(log.acknowledge(25), 0);
        assert_eq!(log.acknowledge(100), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_log_evicts_oldest() {
        let mut log = InputLog::new(2);
        assert!(!log.push(input(1, Vec3::ZERO)));
        assert!(!log.push(input(2, Vec3::ZERO)));
        assert!(log.push(input(3, Vec3::ZERO)));
        let stamps: Vec<u64> = log.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![2, 3]);
    }

    #[test]
    fn test_idle_engine_ignores_input() {
        let mut engine = engine();
        assert!(engine.record_input(100, InputIntent::default()).is_none());
        assert!(engine.reconcile(&EntityState::default(), 0).is_none());
        assert!(engine.log().is_empty());
    }

    #[test]
    fn test_record_input_applies_immediately() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        engine.record_input(1000, InputIntent::new(Vec3::X * 10.0, Vec3::ZERO));
        engine.record_input(1500, InputIntent::new(Vec3::X * 10.0, Vec3::ZERO));

        // First input has no previous sample to measure from.
        let pos = engine.displayed().unwrap().position;
        assert!(pos.abs_diff_eq(Vec3::new(5.0, 0.0, 0.0), 1e-5));
        assert_eq!(engine.log().len(), 2);
    }

    #[test]
    fn test_record_input_clamps_and_orders_timestamps() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        engine.record_input(1000, InputIntent::new(Vec3::X * 99.0, Vec3::ZERO));
        let second = engine
            .record_input(900, InputIntent::default())
            .unwrap();
        assert_eq!(second.timestamp, 1001);

        let first = engine.log().iter().next().unwrap();
        assert_eq!(first.movement_intent, Vec3::new(20.0, 0.0, 0.0));
    }

    #[test]
    fn test_timestamps_saturate_at_clock_limit() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        engine.record_input(u64::MAX, InputIntent::default());
        let second = engine.record_input(u64::MAX, InputIntent::default()).unwrap();
        assert_eq!(second.timestamp, u64::MAX);
        assert_eq!(engine.log().len(), 2);
    }

    #[test]
    fn test_acknowledge_without_reconcile() {
        let mut engine = engine();
        assert_eq!(engine.acknowledge(100), 0);

        engine.assign(EntityId(1), EntityState::default());
        for ts in [10, 20, 30] {
            engine.record_input(ts, InputIntent::new(Vec3::X, Vec3::ZERO));
        }
        let before = *engine.displayed().unwrap();

        assert_eq!(engine.acknowledge(20), 2);
        assert!(engine.log().iter().all(|e| e.timestamp > 20));
        assert_eq!(engine.displayed().unwrap(), &before);
    }

    #[test]
    fn test_reconcile_empty_log_matches_confirmed() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        let confirmed = EntityState::at_rest(
            Vec3::new(0.5, 0.25, 0.0),
            Quat::from_rotation_x(0.3),
        );
        let outcome = engine.reconcile(&confirmed, 5000).unwrap();
        assert_eq!(outcome.reconciled, confirmed);
        assert_eq!(outcome.correction, Correction::Smoothed);
    }

    #[test]
    fn test_reconcile_replays_unacknowledged() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        engine.record_input(1000, InputIntent::new(Vec3::X, Vec3::ZERO));
        engine.record_input(2000, InputIntent::new(Vec3::X, Vec3::ZERO));
        engine.record_input(3000, InputIntent::new(Vec3::X, Vec3::ZERO));

        let outcome = engine.reconcile(&EntityState::default(), 1000).unwrap();
        assert_eq!(outcome.acknowledged, 1);
        assert!(
            outcome
                .reconciled
                .position
                .abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-6)
        );
        assert!(engine.log().iter().all(|e| e.timestamp > 1000));
    }

    #[test]
    fn test_small_error_is_smoothed() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        let confirmed = EntityState::at_rest(Vec3::new(1.0, 0.0, 0.0), Quat::IDENTITY);

        let outcome = engine.reconcile(&confirmed, 0).unwrap();
        assert_eq!(outcome.correction, Correction::Smoothed);
        assert!((outcome.error_sq - 1.0).abs() < 1e-6);
        let pos = engine.displayed().unwrap().position;
        assert!(pos.abs_diff_eq(Vec3::new(0.1, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn test_large_error_teleports() {
        let mut engine = engine();
        engine.assign(EntityId(1), EntityState::default());
        let confirmed = EntityState::at_rest(
            Vec3::new(3.0, 0.0, 0.0),
            Quat::from_rotation_y(1.0),
        );

        let outcome = engine.reconcile(&confirmed, 0).unwrap();
        assert_eq!(outcome.correction, Correction::Teleport);
        assert_eq!(engine.displayed().unwrap(), &confirmed);
    }

    #[test]
    fn test_unassign_clears_log() {
        let mut engine = engine();
        engine.assign(EntityId(3), EntityState::default());
        engine.record_input(10, InputIntent::default());
        assert_eq!(engine.unassign(), Some(EntityId(3)));
        assert!(!engine.is_predicting());
        assert!(engine.log().is_empty());
        assert_eq!(engine.unassign(), None);
    }
}
