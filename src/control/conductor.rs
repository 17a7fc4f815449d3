use std::sync::Arc;

use tracing::{info, warn};

use crate::general::{Micrometers, Ticks, MAX_TRAINS};
use crate::runtime::bus::Subscription;
use crate::runtime::ipc;
use crate::runtime::registry::Registry;

use super::messages::{Direction, Route, TrainDirection, TrainSpeed};
use super::physics::Physics;
use super::switch::{SwitchesHandle, SWITCH_SERVER_NAME};
use super::track::components::{EdgeDir, NodeKind, SwitchDirection};
use super::track::graph::Track;
use super::train::{TrainsHandle, TRAIN_SERVER_NAME};

/// Speed handed to a train that has a route but is standing still.
const CRUISE_SPEED: u8 = 10;

/// Below this velocity the estimate drifts too much to time a throw.
const MIN_SWITCH_VELOCITY: Micrometers = 500;

/// Length of the path window inside which branches are thrown.
const SWITCH_ACTUATION_WINDOW: Micrometers = 100_000;

/// How long a switch command takes to reach the track.
const SWITCH_COMMAND_LATENCY: Ticks = 20;

const TRAIN_SLOTS: usize = MAX_TRAINS as usize + 1;

pub(crate) enum ConductorRequest {
    RouteUpdate(Route),
    SpeedUpdate(TrainSpeed),
    DirectionUpdate(TrainDirection),
}

#[derive(Debug, Copy, Clone, Default)]
struct ConductorData {
    /// Non-zero while a commanded reverse manoeuvre is in flight; a
    /// reverse produces two speed events, stop and restore.
    reverse_count: u8,
    speed: u8,
    direction: Direction,
}

/// Acts on freshly published routes: starts stopped trains, throws the
/// branches just ahead of a moving one, and triggers the reverse
/// manoeuvre when the route calls for it.
pub struct Conductor {
    track: Arc<Track>,
    physics: Arc<Physics>,
    registry: Registry,
    trains: Box<[ConductorData; TRAIN_SLOTS]>,
}

impl Conductor {
    pub fn start(
        track: Arc<Track>,
        physics: Arc<Physics>,
        registry: Registry,
        mut routes: Subscription<Route>,
        mut speed_changes: Subscription<TrainSpeed>,
        mut direction_changes: Subscription<TrainDirection>,
    ) {
        let (ep, mut inbox) = ipc::channel::<ConductorRequest>(64);

        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(route) = routes.recv().await {
                    if ep.cast(ConductorRequest::RouteUpdate(route)).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(change) = speed_changes.recv().await {
                    if ep.cast(ConductorRequest::SpeedUpdate(change)).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(change) = direction_changes.recv().await {
                    if ep
                        .cast(ConductorRequest::DirectionUpdate(change))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let mut conductor = Conductor::new(track, physics, registry);
        tokio::spawn(async move {
            while let Some(request) = inbox.recv().await {
                match request {
                    ConductorRequest::RouteUpdate(route) => {
                        conductor.handle_route(&route).await;
                    }
                    ConductorRequest::SpeedUpdate(change) => conductor.handle_speed(change),
                    ConductorRequest::DirectionUpdate(change) => {
                        conductor.handle_direction(change)
                    }
                }
            }
        });
    }

    pub(crate) fn new(track: Arc<Track>, physics: Arc<Physics>, registry: Registry) -> Self {
        Conductor {
            track,
            physics,
            registry,
            trains: Box::new([ConductorData::default(); TRAIN_SLOTS]),
        }
    }

    pub(crate) async fn handle_route(&mut self, route: &Route) {
        let train = route.train_location.train;
        let data = self.trains[train.index()];

        // Mid-manoeuvre the estimates are garbage; leave the train be.
        if data.reverse_count > 0 {
            return;
        }

        let Some(trains) = self.registry.who_is::<TrainsHandle>(TRAIN_SERVER_NAME) else {
            warn!("train server is not registered yet");
            return;
        };

        if route.path.performs_reverse {
            self.trains[train.index()].reverse_count = 2;
            if let Err(err) = trains.reverse(train).await {
                warn!(%train, %err, "reverse command failed");
            }
            return;
        }

        if route.path.nodes.is_empty() {
            // No route and the train is moving: stop it for safety.
            if data.speed != 0 {
                info!(%train, "stopping, it has no route");
                if let Err(err) = trains.set_speed(train, 0).await {
                    warn!(%train, %err, "stop command failed");
                }
            }
            return;
        }

        let velocity = route.train_location.velocity;
        if velocity == 0 && route.train_location.acceleration_ticks == 0 {
            if let Err(err) = trains.set_speed(train, CRUISE_SPEED).await {
                warn!(%train, %err, "cruise command failed");
            }
            return;
        }

        if velocity > MIN_SWITCH_VELOCITY {
            self.throw_upcoming_branches(route).await;
        }
    }

    /// Throws every branch whose distance along the path falls in the
    /// window the train reaches once a command could arrive: not so
    /// early another pass needs it, not so late the solenoid loses the
    /// race.
    async fn throw_upcoming_branches(&self, route: &Route) {
        let Some(switches) = self.registry.who_is::<SwitchesHandle>(SWITCH_SERVER_NAME) else {
            warn!("switch server is not registered yet");
            return;
        };

        let train = route.train_location.train;
        let data = &self.trains[train.index()];

        let rolls_before_command = self.physics.distance_travelled(
            route.train_location.velocity,
            route.train_location.acceleration,
            route.train_location.acceleration_ticks,
            SWITCH_COMMAND_LATENCY,
        );
        let lower = route.train_location.location.distance_past_node
            + rolls_before_command
            + self.physics.pickup_to_front(data.direction);
        let upper = lower + SWITCH_ACTUATION_WINDOW;

        let mut travelled: Micrometers = 0;
        for path_node in &route.path.nodes {
            if travelled >= upper {
                break;
            }

            if travelled > lower && self.track.kind(path_node.node) == NodeKind::Branch {
                let direction = if path_node.direction == EdgeDir::Straight {
                    SwitchDirection::Straight
                } else {
                    SwitchDirection::Curved
                };
                let sw = self.track.node(path_node.node).num;
                if let Err(err) = switches.set_direction(sw, direction).await {
                    warn!(sw, %err, "switch throw failed");
                }
            }

            travelled += self
                .track
                .edge_in_direction(path_node.node, path_node.direction)
                .map(|(_, mm)| mm * 1000)
                .unwrap_or(0);
        }
    }

    pub(crate) fn handle_speed(&mut self, change: TrainSpeed) {
        let data = &mut self.trains[change.train.index()];
        data.speed = change.speed;

        // The two halves of a reverse announce themselves as speed
        // changes.
        if data.reverse_count > 0 {
            data.reverse_count -= 1;
        }
    }

    pub(crate) fn handle_direction(&mut self, change: TrainDirection) {
        self.trains[change.train.index()].direction = change.direction;
    }
}
