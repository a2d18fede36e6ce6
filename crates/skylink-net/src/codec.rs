//! Binary encoding of [`Message`]s.
//!
//! One message per buffer. Layout:
//!
//! ```text
//! +-----------+------------------------------+--------------------------------+
//! | tag (u8)  | fixed-width fields, in order | variable fields:               |
//! |           | little-endian                | u32 count + count elements     |
//! +-----------+------------------------------+--------------------------------+
//! ```
//!
//! Vectors are three `f32`, quaternions four `f32` in `x, y, z, w` order, and
//! strings are a `u32` byte length followed by UTF-8. A snapshot entity entry
//! is `u32 id, position, rotation, linear velocity, angular velocity`
//! ([`ENTITY_ENTRY_SIZE`] bytes).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3};

use crate::messages::{
    ControlEntity, CreateEntity, DeleteEntity, InputMessage, Message, MessageKind,
    SnapshotMessage, TimeSyncRequest, TimeSyncResponse,
};
use crate::types::{EntityId, EntityState};

const VEC3_SIZE: usize = 12;
const QUAT_SIZE: usize = 16;

/// Encoded size of an [`EntityState`].
pub const ENTITY_STATE_SIZE: usize = 3 * VEC3_SIZE + QUAT_SIZE;

/// Encoded size of one `(EntityId, EntityState)` snapshot entry.
pub const ENTITY_ENTRY_SIZE: usize = 4 + ENTITY_STATE_SIZE;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Decoding failure for a single buffer. The buffer should be discarded; the
/// connection stays up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Fewer bytes remain than the next field declares.
    #[error("truncated message: field needs {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the field being read.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// The first byte is not a known [`MessageKind`].
    #[error("invalid message tag: {0}")]
    InvalidTag(u8),

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Bytes remain after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes `msg` into a fresh buffer.
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode_into(msg, &mut buf);
    buf.freeze()
}

/// Appends the encoding of `msg` to `buf`.
pub fn encode_into(msg: &Message, buf: &mut BytesMut) {
    buf.reserve(encoded_len(msg));
    buf.put_u8(msg.kind().tag());
    match msg {
        Message::TimeSyncRequest(req) => {
            buf.put_u8(req.probe_id);
        }
        Message::TimeSyncResponse(resp) => {
            buf.put_u8(resp.probe_id);
            buf.put_u64_le(resp.server_time);
        }
        Message::Snapshot(snapshot) => {
            buf.put_u16_le(snapshot.sequence_id);
            buf.put_u64_le(snapshot.server_timestamp);
            buf.put_u64_le(snapshot.last_processed_input_timestamp);
            buf.put_u32_le(snapshot.entities.len() as u32);
            for (id, state) in &snapshot.entities {
                buf.put_u32_le(id.0);
                put_state(buf, state);
            }
        }
        Message::CreateEntity(create) => {
            buf.put_u32_le(create.id.0);
            put_state(buf, &create.initial_state);
            put_string(buf, &create.kind_tag);
            put_string(buf, &create.display_name);
        }
        Message::DeleteEntity(delete) => {
            buf.put_u32_le(delete.id.0);
        }
        Message::ControlEntity(control) => {
            buf.put_u32_le(control.id.0);
        }
        Message::Input(input) => {
            buf.put_u64_le(input.timestamp);
            put_vec3(buf, input.movement_intent);
            put_vec3(buf, input.rotation_intent);
        }
    }
}

/// Exact number of bytes [`encode`] produces for `msg`.
pub fn encoded_len(msg: &Message) -> usize {
    1 + match msg {
        Message::TimeSyncRequest(_) => 1,
        Message::TimeSyncResponse(_) => 1 + 8,
        Message::Snapshot(s) => 2 + 8 + 8 + 4 + s.entities.len() * ENTITY_ENTRY_SIZE,
        Message::CreateEntity(c) => {
            4 + ENTITY_STATE_SIZE + 4 + c.kind_tag.len() + 4 + c.display_name.len()
        }
        Message::DeleteEntity(_) | Message::ControlEntity(_) => 4,
        Message::Input(_) => 8 + 2 * VEC3_SIZE,
    }
}

fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

fn put_quat(buf: &mut BytesMut, q: Quat) {
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
    buf.put_f32_le(q.w);
}

fn put_state(buf: &mut BytesMut, state: &EntityState) {
    put_vec3(buf, state.position);
    put_quat(buf, state.rotation);
    put_vec3(buf, state.linear_velocity);
    put_vec3(buf, state.angular_velocity);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decodes one message occupying all of `data`.
///
/// Reads only from `data`; on error nothing has been produced.
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    let mut reader = Reader { buf: data };
    let tag = reader.u8()?;
    let kind = MessageKind::from_tag(tag).ok_or(CodecError::InvalidTag(tag))?;

    let msg = match kind {
        MessageKind::TimeSyncRequest => Message::TimeSyncRequest(TimeSyncRequest {
            probe_id: reader.u8()?,
        }),
        MessageKind::TimeSyncResponse => Message::TimeSyncResponse(TimeSyncResponse {
            probe_id: reader.u8()?,
            server_time: reader.u64()?,
        }),
        MessageKind::Snapshot => {
            let sequence_id = reader.u16()?;
            let server_timestamp = reader.u64()?;
            let last_processed_input_timestamp = reader.u64()?;
            let count = reader.u32()? as usize;
            reader.ensure(count.saturating_mul(ENTITY_ENTRY_SIZE))?;
            let mut entities = Vec::with_capacity(count);
            for _ in 0..count {
                let id = EntityId(reader.u32()?);
                entities.push((id, reader.state()?));
            }
            Message::Snapshot(SnapshotMessage {
                sequence_id,
                server_timestamp,
                last_processed_input_timestamp,
                entities,
            })
        }
        MessageKind::CreateEntity => Message::CreateEntity(CreateEntity {
            id: EntityId(reader.u32()?),
            initial_state: reader.state()?,
            kind_tag: reader.string()?,
            display_name: reader.string()?,
        }),
        MessageKind::DeleteEntity => Message::DeleteEntity(DeleteEntity {
            id: EntityId(reader.u32()?),
        }),
        MessageKind::ControlEntity => Message::ControlEntity(ControlEntity {
            id: EntityId(reader.u32()?),
        }),
        MessageKind::Input => Message::Input(InputMessage {
            timestamp: reader.u64()?,
            movement_intent: reader.vec3()?,
            rotation_intent: reader.vec3()?,
        }),
    };

    if !reader.buf.is_empty() {
        return Err(CodecError::TrailingBytes(reader.buf.len()));
    }

    tracing::trace!("Decoded {:?} ({} bytes)", kind, data.len());
    Ok(msg)
}

/// Bounds-checked cursor over an input buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn vec3(&mut self) -> Result<Vec3, CodecError> {
        self.ensure(VEC3_SIZE)?;
        Ok(Vec3::new(
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
        ))
    }

    fn quat(&mut self) -> Result<Quat, CodecError> {
        self.ensure(QUAT_SIZE)?;
        Ok(Quat::from_xyzw(
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
        ))
    }

    fn state(&mut self) -> Result<EntityState, CodecError> {
        self.ensure(ENTITY_STATE_SIZE)?;
        Ok(EntityState {
            position: self.vec3()?,
            rotation: self.quat()?,
            linear_velocity: self.vec3()?,
            angular_velocity: self.vec3()?,
        })
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        self.ensure(len)?;
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
