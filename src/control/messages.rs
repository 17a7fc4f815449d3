use std::ops::Not;

use petgraph::graph::NodeIndex;

use crate::general::{Micrometers, Ticks, TrainId};

use super::track::components::{EdgeDir, Sensor};

/// Which way a locomotive is facing relative to its boot orientation.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Not for Direction {
    type Output = Direction;

    fn not(self) -> Self::Output {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// A commanded speed took effect.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TrainSpeed {
    pub train: TrainId,
    pub speed: u8,
}

/// A reverse manoeuvre flipped a locomotive around.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TrainDirection {
    pub train: TrainId,
    pub direction: Direction,
}

/// One raw contact edge out of the sensor poll loop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SensorEvent {
    pub sensor: Sensor,
    pub is_on: bool,
}

/// A sensor trip bound to the train that caused it. `time_tripped` is
/// biased back by the average sensor latency to approximate the moment
/// the pickup physically crossed the contact.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AttributedSensor {
    pub train: TrainId,
    pub time_tripped: Ticks,
    pub sensor: Sensor,
}

/// A point on the track: a node plus how far past it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Location {
    pub node: NodeIndex,
    pub distance_past_node: Micrometers,
}

/// A full kinematic state estimate for one train.
///
/// `acceleration` is signed, in centi-micrometers per tick squared, and
/// zero outside an acceleration regime; `acceleration_ticks` is how many
/// ticks of the regime remain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TrainLocation {
    pub train: TrainId,
    pub location: Location,
    pub velocity: Micrometers,
    pub acceleration: i64,
    pub acceleration_ticks: Ticks,
}

/// One step of a planned path: the node, the leg taken out of it, and
/// the expected arrival offset in ticks from when the path was planned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PathNode {
    pub node: NodeIndex,
    pub direction: EdgeDir,
    pub expected_arrival: Ticks,
}

/// A planned path. The first node is the train's current node, the last
/// is the destination. An empty path means no route could be found.
#[derive(Debug, Clone, Default)]
pub struct Path {
    pub nodes: Vec<PathNode>,
    pub total_distance: Micrometers,
    pub performs_reverse: bool,
}

/// A freshly planned route, published with the location update that
/// triggered the planning.
#[derive(Debug, Clone)]
pub struct Route {
    pub train_location: TrainLocation,
    pub path: Path,
}

/// A train came to rest at its requested stop location.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DestinationReached {
    pub train: TrainId,
    pub location: Location,
}

/// A train arrived at its expected sensor noticeably off schedule.
/// `delta` is positive when late.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ArrivalReport {
    pub train: TrainId,
    pub node: NodeIndex,
    pub delta: Ticks,
}
