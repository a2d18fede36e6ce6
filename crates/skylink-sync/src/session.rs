//! Per-connection client session.
//!
//! [`ClientSession`] owns every piece of synchronization state for one
//! server connection and is driven from the host's tick loop: raw packets go
//! in through [`ClientSession::handle_packet`], encoded input and clock
//! probes come out of [`ClientSession::tick`] and
//! [`ClientSession::poll_time_sync`]. Nothing blocks and nothing is shared.

use bytes::Bytes;
use skylink_config::{Config, SyncConfig};
use skylink_net::{
    CodecError, ControlEntity, CreateEntity, DeleteEntity, EntityId, EntityState, Message,
    SnapshotMessage, TimeSyncRequest, TimeSyncResponse, decode, encode,
};

use crate::clock::{ClockEstimate, ClockSync};
use crate::diagnostics::SyncStats;
use crate::directory::EntityDirectory;
use crate::history::{IngestOutcome, SequencingAnomaly, Snapshot, SnapshotHistory};
use crate::prediction::{Correction, InputIntent, PredictionEngine};

/// Longest frame the input accumulator will catch up on, in seconds.
pub const MAX_FRAME_TIME: f32 = 0.25;

/// Produces the local player's intent once per input tick.
///
/// The session does not care where intents come from: keyboard, gamepad,
/// a script, or a test.
pub trait InputSource {
    /// Samples the intent for a tick lasting `elapsed` seconds.
    fn tick(&mut self, elapsed: f32) -> InputIntent;
}

impl<F> InputSource for F
where
    F: FnMut(f32) -> InputIntent,
{
    fn tick(&mut self, elapsed: f32) -> InputIntent {
        self(elapsed)
    }
}

/// Notable things that happened while handling a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    EntityCreated {
        id: EntityId,
        kind: String,
        display_name: String,
    },
    /// The entry is now pending removal in the directory.
    EntityRemoved { id: EntityId },
    /// Control moved; `current` is `None` when the controlled entity was
    /// deleted.
    ControlChanged {
        previous: Option<EntityId>,
        current: Option<EntityId>,
    },
    /// Reconciliation snapped the controlled entity instead of easing it.
    Teleported { id: EntityId, error_sq: f32 },
    /// Lost snapshots were reconstructed by interpolation.
    StatesRecovered { count: usize },
    /// The history was rebuilt. `gap` is `None` for the first snapshot.
    HistoryReset { gap: Option<u16> },
    ClockUpdated(ClockEstimate),
}

/// Synchronization state of one server connection.
pub struct ClientSession {
    config: SyncConfig,
    clock: ClockSync,
    history: SnapshotHistory,
    directory: EntityDirectory,
    prediction: PredictionEngine,
    stats: SyncStats,
    sync_enabled: bool,
    input_accumulator: f32,
    input_interval: f32,
    last_probe_time: Option<u64>,
}

impl ClientSession {
    pub fn new(config: &Config) -> Self {
        let sync = config.sync.clone();
        tracing::info!(
            history_capacity = sync.history_capacity,
            input_rate_hz = sync.input_rate_hz,
            "Client session started"
        );
        Self {
            clock: ClockSync::new(config.clock.filter),
            history: SnapshotHistory::new(sync.history_capacity),
            directory: EntityDirectory::new(),
            prediction: PredictionEngine::new(&config.prediction, sync.input_log_capacity),
            stats: SyncStats::default(),
            sync_enabled: true,
            input_accumulator: 0.0,
            input_interval: 1.0 / sync.input_rate_hz.max(1) as f32,
            last_probe_time: None,
            config: sync,
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Decodes one packet and applies it.
    ///
    /// A decode failure discards the packet, is counted, and is returned; the
    /// session is unchanged and stays usable.
    pub fn handle_packet(
        &mut self,
        packet: &[u8],
        local_time: u64,
    ) -> Result<Vec<SyncEvent>, CodecError> {
        let message = match decode(packet) {
            Ok(message) => message,
            Err(err) => {
                self.stats.decode_errors += 1;
                tracing::warn!(error = %err, len = packet.len(), "Discarding undecodable packet");
                return Err(err);
            }
        };
        self.stats.packets_decoded += 1;
        Ok(self.handle_message(message, local_time))
    }

    /// Applies an already decoded message.
    pub fn handle_message(&mut self, message: Message, local_time: u64) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        let kind = message.kind();
        match message {
            Message::TimeSyncResponse(response) => {
                self.on_time_sync(response, local_time, &mut events)
            }
            Message::Snapshot(snapshot) => self.on_snapshot(snapshot, &mut events),
            Message::CreateEntity(create) => self.on_create(create, &mut events),
            Message::DeleteEntity(delete) => self.on_delete(delete, &mut events),
            Message::ControlEntity(control) => self.on_control(control, &mut events),
            Message::TimeSyncRequest(_) | Message::Input(_) => {
                tracing::debug!(?kind, "Ignoring server-bound message");
            }
        }
        events
    }

    fn on_time_sync(
        &mut self,
        response: TimeSyncResponse,
        local_time: u64,
        events: &mut Vec<SyncEvent>,
    ) {
        let first = self.clock.estimate().is_none();
        match self
            .clock
            .on_response(response.probe_id, response.server_time, local_time)
        {
            Some(estimate) => {
                self.stats.probes_completed += 1;
                if first {
                    tracing::info!(
                        offset_ms = estimate.offset_millis,
                        rtt_ms = estimate.last_sample_round_trip,
                        "Clock synchronized"
                    );
                } else {
                    tracing::debug!(
                        offset_ms = estimate.offset_millis,
                        rtt_ms = estimate.last_sample_round_trip,
                        "Clock estimate updated"
                    );
                }
                events.push(SyncEvent::ClockUpdated(estimate));
            }
            None => self.stats.probes_ignored += 1,
        }
    }

    fn on_snapshot(&mut self, message: SnapshotMessage, events: &mut Vec<SyncEvent>) {
        if !self.sync_enabled {
            tracing::trace!(sequence_id = message.sequence_id, "Sync disabled, skipping snapshot");
            return;
        }

        // Only a state the server actually sent this tick is reconciled against.
        let confirmed = self.prediction.controlled().and_then(|id| {
            message
                .entities
                .iter()
                .find(|(entity, _)| *entity == id)
                .map(|(_, state)| (id, *state))
        });
        let last_processed = message.last_processed_input_timestamp;
        let sequence_id = message.sequence_id;

        match self.history.ingest(Snapshot::from(message), &self.directory) {
            IngestOutcome::Dropped(anomaly) => {
                self.stats.stale_snapshots += 1;
                tracing::trace!(?anomaly, "Dropped snapshot");
                return;
            }
            IngestOutcome::Appended { recovered } => {
                if recovered > 0 {
                    self.stats.interpolated_states += recovered as u64;
                    events.push(SyncEvent::StatesRecovered { count: recovered });
                }
            }
            IngestOutcome::Reset { anomaly, .. } => {
                let gap = match anomaly {
                    Some(SequencingAnomaly::LargeGap { gap }) => {
                        self.stats.history_resets += 1;
                        self.stats.skipped_states += u64::from(gap) - 1;
                        Some(gap)
                    }
                    _ => None,
                };
                events.push(SyncEvent::HistoryReset { gap });
            }
        }
        self.stats.snapshots_accepted += 1;
        tracing::debug!(sequence_id, "Accepted snapshot");

        if let Some(latest) = self.history.latest_confirmed() {
            self.directory.apply_snapshot(latest);
        }

        let Some((id, state)) = confirmed else {
            let acknowledged = self.prediction.acknowledge(last_processed);
            if acknowledged > 0 {
                tracing::trace!(acknowledged, "Pruned inputs without reconciling");
            }
            return;
        };
        if let Some(outcome) = self.prediction.reconcile(&state, last_processed) {
            match outcome.correction {
                Correction::Smoothed => self.stats.smoothed_corrections += 1,
                Correction::Teleport => {
                    self.stats.teleports += 1;
                    events.push(SyncEvent::Teleported {
                        id,
                        error_sq: outcome.error_sq,
                    });
                }
            }
        }
    }

    fn on_create(&mut self, create: CreateEntity, events: &mut Vec<SyncEvent>) {
        let CreateEntity {
            id,
            initial_state,
            kind_tag,
            display_name,
        } = create;

        self.directory
            .create(id, initial_state, &kind_tag, &display_name);
        self.history.seed_entity(id, initial_state);

        // Control may have arrived first with a placeholder state.
        if self.prediction.controlled() == Some(id) {
            self.prediction.assign(id, initial_state);
        }

        events.push(SyncEvent::EntityCreated {
            id,
            kind: kind_tag,
            display_name,
        });
    }

    fn on_delete(&mut self, delete: DeleteEntity, events: &mut Vec<SyncEvent>) {
        let id = delete.id;
        if !self.directory.remove(id) {
            return;
        }
        self.history.forget_entity(id);

        if self.prediction.controlled() == Some(id) {
            self.prediction.unassign();
            tracing::debug!(%id, "Controlled entity deleted");
            events.push(SyncEvent::ControlChanged {
                previous: Some(id),
                current: None,
            });
        }
        events.push(SyncEvent::EntityRemoved { id });
    }

    fn on_control(&mut self, control: ControlEntity, events: &mut Vec<SyncEvent>) {
        let id = control.id;
        if self.prediction.controlled() == Some(id) {
            return;
        }

        let previous = self.directory.set_controlled(id);
        let state = self
            .directory
            .get(id)
            .map(|entry| entry.latest_state)
            .unwrap_or_default();
        self.prediction.assign(id, state);

        tracing::debug!(%id, ?previous, "Control transferred");
        events.push(SyncEvent::ControlChanged {
            previous,
            current: Some(id),
        });
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Starts a clock probe and returns the encoded request.
    pub fn begin_time_sync(&mut self, local_time: u64) -> Bytes {
        let probe_id = self.clock.begin_probe(local_time);
        self.last_probe_time = Some(local_time);
        encode(&Message::TimeSyncRequest(TimeSyncRequest { probe_id }))
    }

    /// Starts a probe if `time_sync_interval_ms` has passed since the last.
    pub fn poll_time_sync(&mut self, local_time: u64) -> Option<Bytes> {
        let due = match self.last_probe_time {
            Some(last) => local_time.saturating_sub(last) >= self.config.time_sync_interval_ms,
            None => true,
        };
        due.then(|| self.begin_time_sync(local_time))
    }

    /// Advances the input clock by `elapsed_secs` and samples `source` once
    /// per input interval.
    ///
    /// Each sample is timestamped on the estimated server clock, applied to
    /// the predicted transform, and returned encoded for sending. Nothing is
    /// sampled while no entity is controlled or before the first clock probe
    /// completes.
    pub fn tick(
        &mut self,
        elapsed_secs: f32,
        local_time: u64,
        source: &mut impl InputSource,
    ) -> Vec<Bytes> {
        self.input_accumulator += elapsed_secs.clamp(0.0, MAX_FRAME_TIME);

        let ready = self.prediction.is_predicting() && self.clock.estimate().is_some();
        let mut packets = Vec::new();
        while self.input_accumulator >= self.input_interval {
            self.input_accumulator -= self.input_interval;
            if !ready {
                continue;
            }

            // Catch-up samples are spread back over the frame they belong to.
            let behind_ms = (self.input_accumulator * 1000.0) as u64;
            let sample_time = self
                .clock
                .estimate_server_time(local_time.saturating_sub(behind_ms));

            let intent = source.tick(self.input_interval);
            if let Some(input) = self.prediction.record_input(sample_time, intent) {
                self.stats.inputs_sent += 1;
                packets.push(encode(&Message::Input(input.to_message())));
            }
        }
        packets
    }

    // -----------------------------------------------------------------------
    // Control and inspection
    // -----------------------------------------------------------------------

    /// Pauses or resumes snapshot ingestion. Packets are still decoded.
    pub fn set_sync_enabled(&mut self, enabled: bool) {
        if self.sync_enabled != enabled {
            tracing::info!(enabled, "Snapshot sync toggled");
        }
        self.sync_enabled = enabled;
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    /// Transform to show for `id`: the prediction for the controlled entity,
    /// the latest confirmed state otherwise.
    pub fn displayed_state(&self, id: EntityId) -> Option<EntityState> {
        if self.prediction.controlled() == Some(id)
            && let Some(predicted) = self.prediction.displayed()
        {
            return Some(*predicted);
        }
        self.directory.get(id).map(|entry| entry.latest_state)
    }

    pub fn estimate_server_time(&self, local_time: u64) -> u64 {
        self.clock.estimate_server_time(local_time)
    }

    pub fn directory(&self) -> &EntityDirectory {
        &self.directory
    }

    /// Mutable access for the presentation layer, e.g. to purge removed
    /// entries after it has despawned them.
    pub fn directory_mut(&mut self) -> &mut EntityDirectory {
        &mut self.directory
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn prediction(&self) -> &PredictionEngine {
        &self.prediction
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
