//! Scripted player input.

use glam::Vec3;
use skylink_sync::{InputIntent, InputSource};

/// Time spent idle before the pilot starts flying, in seconds.
const WARMUP_SECS: f32 = 1.0;

/// Flies forward at cruise speed while weaving left and right, rolling into
/// each turn.
#[derive(Debug, Clone)]
pub struct ScriptedPilot {
    elapsed: f32,
    cruise_speed: f32,
    weave_period: f32,
    max_yaw_rate: f32,
}

impl Default for ScriptedPilot {
    fn default() -> Self {
        Self {
            elapsed: 0.0,
            cruise_speed: 12.0,
            weave_period: 6.0,
            max_yaw_rate: 40.0,
        }
    }
}

impl InputSource for ScriptedPilot {
    fn tick(&mut self, elapsed: f32) -> InputIntent {
        self.elapsed += elapsed;
        let t = self.elapsed - WARMUP_SECS;
        if t < 0.0 {
            return InputIntent::default();
        }

        let phase = t / self.weave_period * std::f32::consts::TAU;
        let yaw = self.max_yaw_rate * phase.sin();
        InputIntent::new(
            Vec3::new(self.cruise_speed, 0.0, 0.0),
            Vec3::new(0.0, yaw, -yaw * 0.5),
        )
    }
}
