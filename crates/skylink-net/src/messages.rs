//! Protocol message types.
//!
//! [`Message`] is a closed set: adding a kind means adding a variant, and
//! every dispatcher that matches on it stops compiling until it handles the
//! new kind.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityState};

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- Time sync ---
    /// Client asks for the server clock.
    TimeSyncRequest(TimeSyncRequest),
    /// Server answers a [`TimeSyncRequest`] with its clock.
    TimeSyncResponse(TimeSyncResponse),

    // --- World ---
    /// Authoritative state of every known entity at one server tick.
    Snapshot(SnapshotMessage),
    /// An entity came into existence.
    CreateEntity(CreateEntity),
    /// An entity was destroyed.
    DeleteEntity(DeleteEntity),
    /// The receiving client now controls an entity.
    ControlEntity(ControlEntity),

    // --- Player ---
    /// Client movement/rotation intent for one input tick.
    Input(InputMessage),
}

/// Discriminant of a [`Message`], as written in the first byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    TimeSyncRequest = 1,
    TimeSyncResponse = 2,
    Snapshot = 3,
    CreateEntity = 4,
    DeleteEntity = 5,
    ControlEntity = 6,
    Input = 7,
}

impl MessageKind {
    /// Wire tag for this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Looks up the kind for a wire tag. Tag 0 is reserved and never valid.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::TimeSyncRequest,
            2 => Self::TimeSyncResponse,
            3 => Self::Snapshot,
            4 => Self::CreateEntity,
            5 => Self::DeleteEntity,
            6 => Self::ControlEntity,
            7 => Self::Input,
            _ => return None,
        })
    }

    /// Whether the server is the sender of this kind.
    pub fn is_server_to_client(self) -> bool {
        !matches!(self, Self::TimeSyncRequest | Self::Input)
    }
}

impl Message {
    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::TimeSyncRequest(_) => MessageKind::TimeSyncRequest,
            Self::TimeSyncResponse(_) => MessageKind::TimeSyncResponse,
            Self::Snapshot(_) => MessageKind::Snapshot,
            Self::CreateEntity(_) => MessageKind::CreateEntity,
            Self::DeleteEntity(_) => MessageKind::DeleteEntity,
            Self::ControlEntity(_) => MessageKind::ControlEntity,
            Self::Input(_) => MessageKind::Input,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Clock probe sent by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSyncRequest {
    /// Probe identifier, echoed by the response. Wraps at 256.
    pub probe_id: u8,
}

/// Server reply to a [`TimeSyncRequest`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSyncResponse {
    /// Echoed probe identifier.
    pub probe_id: u8,
    /// Server clock in milliseconds when the reply was produced.
    pub server_time: u64,
}

/// Authoritative world state at one server tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SnapshotMessage {
    /// Wrapping 16-bit snapshot counter.
    pub sequence_id: u16,
    /// Server clock in milliseconds at the tick.
    pub server_timestamp: u64,
    /// Timestamp of the newest client input the server had applied.
    pub last_processed_input_timestamp: u64,
    /// States of entities present at this tick, in server order.
    pub entities: Vec<(EntityId, EntityState)>,
}

/// Entity creation, with the metadata the presentation layer needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateEntity {
    /// New entity id.
    pub id: EntityId,
    /// State at creation time.
    pub initial_state: EntityState,
    /// Entity archetype tag (e.g. `"spaceship"`).
    pub kind_tag: String,
    /// Human-readable name shown above the entity.
    pub display_name: String,
}

/// Entity destruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteEntity {
    /// Destroyed entity id.
    pub id: EntityId,
}

/// Transfers control of an entity to the receiving client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlEntity {
    /// Controlled entity id.
    pub id: EntityId,
}

/// One tick of player input, timestamped in the server's clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InputMessage {
    /// Estimated server time in milliseconds when the input was sampled.
    pub timestamp: u64,
    /// Desired velocity along the entity's local axes, units per second.
    pub movement_intent: Vec3,
    /// Desired pitch/yaw/roll rates in degrees per second.
    pub rotation_intent: Vec3,
}
