//! Topic payloads shared by the receiver and the overlays.
//!
//! Each struct is one topic on the telemetry bus; its `Topic::NAME` is the key
//! under which it travels in a tick's JSON object.

pub mod session;
pub mod telemetry;

pub use session::{SessionInfo, Standings, StandingsEntry, TrackInfo};
pub use telemetry::{CarTelemetry, Pedals};
