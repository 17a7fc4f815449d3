use thiserror::Error;

use crate::runtime::ipc::IpcError;

/// Binds sensor trips to trains.
pub mod attribution;
/// Acts on routes: switch throws, initial speed, reverse manoeuvres.
pub mod conductor;
/// The byte channel to the track hardware.
pub mod connectors;
/// The destination lifecycle: once, forever, rerolls.
pub mod destination;
/// Position, velocity and acceleration estimation.
pub mod location;
/// The events and records the servers exchange.
pub mod messages;
/// Calibration tables and kinematics.
pub mod physics;
/// Shortest-path planning with collision avoidance.
pub mod route;
/// Stops trains that are about to be lost.
pub mod safety;
/// Arrival punctuality tracking.
pub mod scheduler;
/// Sensor polling and edge detection.
pub mod sensor;
/// Emergency and graceful stop handling.
pub mod stop;
/// Turnout control.
pub mod switch;
/// The track graph, its builder and the table layouts.
pub mod track;
/// Locomotive control.
pub mod train;

/// Wiring: spawns the whole pipeline over one controller connection.
pub mod dispatch;

/// What a refused actuation request looks like.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("train {0} is outside 1..=80")]
    TrainOutOfRange(u8),
    #[error("speed {0} is outside 0..=14")]
    SpeedOutOfRange(u8),
    #[error("switch {0} is not on this controller")]
    SwitchOutOfRange(u16),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}
