#![forbid(unsafe_code)]

use paddock_topics::Topic;
use serde::{Deserialize, Serialize};

/// Driver inputs, each in `0.0..=1.0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pedals {
    pub throttle: f32,
    pub brake: f32,
    pub clutch: f32,
}

/// Player car state, published every tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CarTelemetry {
    pub speed_kph: f32,
    pub rpm: f32,
    /// -1 reverse, 0 neutral.
    pub gear: i8,
    pub pedals: Pedals,
    pub lap: u32,
    pub lap_time_s: f64,
    /// Fraction of the current lap covered, `0.0..1.0`.
    #[serde(default)]
    pub lap_distance_pct: f32,
}

impl Topic for CarTelemetry {
    const NAME: &'static str = "telemetry";
}

impl CarTelemetry {
    #[inline]
    pub fn is_braking(&self) -> bool {
        self.pedals.brake > 0.05
    }
}
