//! Authoritative arena server for the loopback simulation.
//!
//! Owns the true entity states, applies client input with the same
//! integration the client predicts with, answers clock probes, and emits
//! snapshots at a fixed rate.

use std::collections::BTreeMap;

use bytes::Bytes;
use glam::{Quat, Vec3};
use skylink_config::Config;
use skylink_net::{
    ControlEntity, CreateEntity, DeleteEntity, EntityId, EntityState, InputMessage, Message,
    SnapshotMessage, TimeSyncResponse, decode, encode,
};
use skylink_sync::{InputIntent, MovementLimits, elapsed_secs, integrate};

use crate::link::Delivery;

/// Radius of the drone patrol circle.
const DRONE_ORBIT_RADIUS: f32 = 30.0;

/// Angular speed of the drone patrol, radians per second.
const DRONE_ORBIT_SPEED: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Driver {
    /// Follows client input.
    Player,
    /// Circles the origin, `phase_millis` ahead on the patrol.
    Drone { phase_millis: u64 },
}

#[derive(Debug, Clone)]
struct ServerEntity {
    state: EntityState,
    kind: &'static str,
    name: String,
    driver: Driver,
}

/// A message the server wants sent, with its delivery class.
pub type Outgoing = (Bytes, Delivery);

/// The authoritative side of the simulation.
pub struct ArenaServer {
    entities: BTreeMap<EntityId, ServerEntity>,
    next_id: u32,
    player: Option<EntityId>,
    last_processed_input: u64,
    limits: MovementLimits,
    snapshot_interval_ms: u64,
    next_snapshot_at: u64,
    next_sequence: u16,
    inputs_applied: u64,
    inputs_rejected: u64,
}

impl ArenaServer {
    pub fn new(config: &Config) -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: 1,
            player: None,
            last_processed_input: 0,
            limits: MovementLimits::from(&config.prediction),
            snapshot_interval_ms: 1000 / u64::from(config.simulation.snapshot_rate_hz.max(1)),
            next_snapshot_at: 0,
            next_sequence: 0,
            inputs_applied: 0,
            inputs_rejected: 0,
        }
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Spawns a patrolling drone and returns its create message.
    pub fn spawn_drone(&mut self, now: u64, phase_millis: u64) -> Outgoing {
        let id = self.allocate_id();
        let driver = Driver::Drone { phase_millis };
        let entity = ServerEntity {
            state: drone_state(now + phase_millis),
            kind: "drone",
            name: format!("Drone {}", id.0),
            driver,
        };
        let msg = create_message(id, &entity);
        self.entities.insert(id, entity);
        tracing::debug!(%id, "Spawned drone");
        (encode(&msg), Delivery::Reliable)
    }

    /// Removes an entity and returns the delete message, if it existed.
    pub fn despawn(&mut self, id: EntityId) -> Option<Outgoing> {
        self.entities.remove(&id)?;
        if self.player == Some(id) {
            self.player = None;
        }
        tracing::debug!(%id, "Despawned entity");
        Some((
            encode(&Message::DeleteEntity(DeleteEntity { id })),
            Delivery::Reliable,
        ))
    }

    /// Ids of the drones currently alive.
    pub fn drones(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, e)| matches!(e.driver, Driver::Drone { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Accepts a client: announces every entity, spawns its ship, and hands
    /// it control.
    pub fn connect(&mut self, now: u64, pilot_name: &str) -> Vec<Outgoing> {
        let mut out: Vec<Outgoing> = self
            .entities
            .iter()
            .map(|(id, e)| (encode(&create_message(*id, e)), Delivery::Reliable))
            .collect();

        let id = self.allocate_id();
        let ship = ServerEntity {
            state: EntityState::at_rest(Vec3::new(0.0, 0.0, -10.0), Quat::IDENTITY),
            kind: "spaceship",
            name: pilot_name.to_string(),
            driver: Driver::Player,
        };
        out.push((encode(&create_message(id, &ship)), Delivery::Reliable));
        out.push((
            encode(&Message::ControlEntity(ControlEntity { id })),
            Delivery::Reliable,
        ));

        self.entities.insert(id, ship);
        self.player = Some(id);
        // Inputs are measured from the moment control was granted.
        self.last_processed_input = now;
        tracing::info!(%id, pilot = pilot_name, "Client connected");
        out
    }

    /// Handles one client packet at server time `now`. Returns a reply when
    /// one is due.
    pub fn handle_packet(&mut self, packet: &[u8], now: u64) -> Option<Outgoing> {
        let message = match decode(packet) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "Server discarding undecodable packet");
                return None;
            }
        };

        let kind = message.kind();
        match message {
            Message::TimeSyncRequest(request) => Some((
                encode(&Message::TimeSyncResponse(TimeSyncResponse {
                    probe_id: request.probe_id,
                    server_time: now,
                })),
                Delivery::Unreliable,
            )),
            Message::Input(input) => {
                self.apply_input(&input);
                None
            }
            Message::TimeSyncResponse(_)
            | Message::Snapshot(_)
            | Message::CreateEntity(_)
            | Message::DeleteEntity(_)
            | Message::ControlEntity(_) => {
                tracing::debug!(?kind, "Server ignoring client-bound message");
                None
            }
        }
    }

    fn apply_input(&mut self, input: &InputMessage) {
        let Some(player) = self.player.and_then(|id| self.entities.get_mut(&id)) else {
            return;
        };
        if input.timestamp <= self.last_processed_input {
            self.inputs_rejected += 1;
            return;
        }

        let dt = elapsed_secs(self.last_processed_input, input.timestamp);
        let intent = self.limits.clamp(InputIntent::new(
            input.movement_intent,
            input.rotation_intent,
        ));

        player.state = integrate(&player.state, intent.movement, intent.rotation, dt);
        self.last_processed_input = input.timestamp;
        self.inputs_applied += 1;
    }

    /// Advances drones to `now` and emits a snapshot when one is due.
    pub fn update(&mut self, now: u64) -> Option<Outgoing> {
        for entity in self.entities.values_mut() {
            if let Driver::Drone { phase_millis } = entity.driver {
                entity.state = drone_state(now + phase_millis);
            }
        }

        if now < self.next_snapshot_at {
            return None;
        }
        self.next_snapshot_at = now + self.snapshot_interval_ms;
        Some((encode(&self.snapshot(now)), Delivery::Unreliable))
    }

    fn snapshot(&mut self, now: u64) -> Message {
        let sequence_id = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Message::Snapshot(SnapshotMessage {
            sequence_id,
            server_timestamp: now,
            last_processed_input_timestamp: self.last_processed_input,
            entities: self.entities.iter().map(|(id, e)| (*id, e.state)).collect(),
        })
    }

    /// Authoritative state of the player's ship.
    pub fn player_state(&self) -> Option<(EntityId, EntityState)> {
        let id = self.player?;
        self.entities.get(&id).map(|e| (id, e.state))
    }

    pub fn inputs_applied(&self) -> u64 {
        self.inputs_applied
    }

    pub fn inputs_rejected(&self) -> u64 {
        self.inputs_rejected
    }
}

fn create_message(id: EntityId, entity: &ServerEntity) -> Message {
    Message::CreateEntity(CreateEntity {
        id,
        initial_state: entity.state,
        kind_tag: entity.kind.to_string(),
        display_name: entity.name.clone(),
    })
}

/// Drone on a horizontal circle at time `t` (milliseconds).
fn drone_state(t: u64) -> EntityState {
    let angle = (t as f64 / 1000.0 * f64::from(DRONE_ORBIT_SPEED)) as f32;
    let (sin, cos) = angle.sin_cos();
    let position = Vec3::new(cos, 0.0, sin) * DRONE_ORBIT_RADIUS;
    let tangent = Vec3::new(-sin, 0.0, cos);
    EntityState {
        position,
        rotation: Quat::from_rotation_arc(Vec3::NEG_Z, tangent),
        linear_velocity: tangent * DRONE_ORBIT_RADIUS * DRONE_ORBIT_SPEED,
        angular_velocity: Vec3::new(0.0, -DRONE_ORBIT_SPEED, 0.0),
    }
}
