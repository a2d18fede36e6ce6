//! Entity identity and physical state carried by snapshot and lifecycle
//! messages.

use std::fmt;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Server-assigned entity identifier.
///
/// Unique among currently live entities. The server may hand an id out again
/// after the entity it named has been deleted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for EntityId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Physical state of one entity at one server tick.
///
/// The default value is the placeholder state: origin, identity rotation,
/// at rest.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    /// World-space position.
    pub position: Vec3,
    /// Orientation, unit-normalized.
    pub rotation: Quat,
    /// Linear velocity in units per second.
    pub linear_velocity: Vec3,
    /// Angular velocity in radians per second.
    pub angular_velocity: Vec3,
}

impl EntityState {
    /// A state at rest with the given transform.
    pub fn at_rest(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            ..Default::default()
        }
    }

    /// Blends `self` toward `other`: linear for position and velocities,
    /// spherical for rotation. `t` is clamped to `[0, 1]`.
    pub fn interpolate(&self, other: &Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(other.rotation, t).normalize(),
            linear_velocity: self.linear_velocity.lerp(other.linear_velocity, t),
            angular_velocity: self.angular_velocity.lerp(other.angular_velocity, t),
        }
    }
}
