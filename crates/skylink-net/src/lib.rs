//! Wire protocol: entity snapshots, entity lifecycle, player input, and time
//! synchronization, encoded as fixed-width little-endian binary messages.

pub mod codec;
pub mod messages;
pub mod types;

pub use codec::{CodecError, ENTITY_ENTRY_SIZE, ENTITY_STATE_SIZE, decode, encode, encode_into};
pub use messages::{
    ControlEntity, CreateEntity, DeleteEntity, InputMessage, Message, MessageKind,
    SnapshotMessage, TimeSyncRequest, TimeSyncResponse,
};
pub use types::{EntityId, EntityState};
