use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::general::{Lcg, Ticks, TrainId, MAX_TRAINS};
use crate::runtime::bus::Subscription;
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Endpoint, Inbox, IpcError};
use crate::runtime::registry::Registry;

use super::messages::{AttributedSensor, DestinationReached, Location};
use super::route::{RouteHandle, ROUTE_SERVER_NAME};
use super::stop::{StopHandle, STOP_SERVER_NAME};
use super::track::components::Sensor;
use super::track::graph::Track;
use super::train::{TrainsHandle, TRAIN_SERVER_NAME};

pub const DESTINATION_SERVER_NAME: &str = "dest";

/// A train whose whereabouts are unknown is driven at this speed until
/// it trips a sensor and becomes attributable.
const LOOKING_SPEED: u8 = 10;

const TRAIN_SLOTS: usize = MAX_TRAINS as usize + 1;

pub(crate) enum DestinationRequest {
    Once {
        train: TrainId,
        location: Location,
        reply: oneshot::Sender<()>,
    },
    Forever {
        train: TrainId,
        reply: oneshot::Sender<()>,
    },
    AttributedSensorUpdate(AttributedSensor),
    Reached(DestinationReached),
}

#[derive(Debug, Clone, Default)]
struct DestinationData {
    has_been_found: bool,
    forever: bool,
    target: Option<Location>,
    rng: Option<Lcg>,
}

/// The user-facing destination lifecycle: drive a train to one place, or
/// keep inventing new places forever.
pub struct DestinationServer {
    track: Arc<Track>,
    registry: Registry,
    data: Box<[DestinationData; TRAIN_SLOTS]>,
}

impl DestinationServer {
    pub fn start(
        track: Arc<Track>,
        registry: Registry,
        clock: ClockHandle,
        mut attributed: Subscription<AttributedSensor>,
        mut arrivals: Subscription<DestinationReached>,
    ) -> DestinationHandle {
        let (ep, inbox) = ipc::channel(32);

        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(event) = attributed.recv().await {
                    if ep
                        .cast(DestinationRequest::AttributedSensorUpdate(event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(arrival) = arrivals.recv().await {
                    if ep.cast(DestinationRequest::Reached(arrival)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let server = DestinationServer::new(track, registry);
        tokio::spawn(server.run(inbox, clock));

        DestinationHandle { ep }
    }

    pub(crate) fn new(track: Arc<Track>, registry: Registry) -> Self {
        DestinationServer {
            track,
            registry,
            data: Box::new(std::array::from_fn(|_| DestinationData::default())),
        }
    }

    async fn run(mut self, mut inbox: Inbox<DestinationRequest>, clock: ClockHandle) {
        while let Some(request) = inbox.recv().await {
            match request {
                DestinationRequest::Once {
                    train,
                    location,
                    reply,
                } => {
                    self.handle_once(train, location).await;
                    let _ = reply.send(());
                }
                DestinationRequest::Forever { train, reply } => {
                    let Ok(now) = clock.time().await else { return };
                    self.handle_forever(train, now).await;
                    let _ = reply.send(());
                }
                DestinationRequest::AttributedSensorUpdate(event) => {
                    self.handle_attributed(event).await;
                }
                DestinationRequest::Reached(arrival) => {
                    self.handle_reached(arrival).await;
                }
            }
        }
    }

    pub(crate) async fn handle_once(&mut self, train: TrainId, location: Location) {
        let slot = train.index();

        // Asking for the same place twice is not new work.
        if self.data[slot].target == Some(location) && !self.data[slot].forever {
            debug!(%train, "already heading there");
            return;
        }

        self.data[slot].target = Some(location);
        self.data[slot].forever = false;
        info!(%train, destination = self.track.name(location.node), "going once");

        if self.data[slot].has_been_found {
            self.route_to(train, location).await;
        } else {
            self.look_for(train).await;
        }
    }

    pub(crate) async fn handle_forever(&mut self, train: TrainId, now: Ticks) {
        let slot = train.index();
        let mut rng = Lcg::new((train.get() as i64).wrapping_mul(now) as i32);
        let Some(target) = self.random_target(&mut rng) else {
            return;
        };

        self.data[slot].rng = Some(rng);
        self.data[slot].forever = true;
        self.data[slot].target = Some(target);
        info!(%train, destination = self.track.name(target.node), "going forever");

        if self.data[slot].has_been_found {
            self.route_to(train, target).await;
        } else {
            self.look_for(train).await;
        }
    }

    pub(crate) async fn handle_attributed(&mut self, event: AttributedSensor) {
        let slot = event.train.index();
        if self.data[slot].has_been_found {
            return;
        }
        self.data[slot].has_been_found = true;

        if let Some(target) = self.data[slot].target {
            info!(train = %event.train, "found, routing to its destination");
            self.route_to(event.train, target).await;
        }
    }

    pub(crate) async fn handle_reached(&mut self, arrival: DestinationReached) {
        let train = arrival.train;
        let slot = train.index();
        info!(%train, at = self.track.name(arrival.location.node), "arrived");

        if let Some(route) = self.registry.who_is::<RouteHandle>(ROUTE_SERVER_NAME) {
            if let Err(err) = route.clear_destination(train).await {
                warn!(%train, %err, "could not clear the route destination");
            }
        }

        if self.data[slot].forever {
            let mut rng = self.data[slot]
                .rng
                .take()
                .unwrap_or_else(|| Lcg::new(train.get() as i32));
            let next = self.random_target(&mut rng);
            self.data[slot].rng = Some(rng);

            if let Some(next) = next {
                self.data[slot].target = Some(next);
                info!(%train, destination = self.track.name(next.node), "rerolled");
                self.route_to(train, next).await;
            }
        } else {
            self.data[slot].target = None;
        }
    }

    /// A uniformly random sensor that exists on this track.
    fn random_target(&self, rng: &mut Lcg) -> Option<Location> {
        for _ in 0..256 {
            let index = rng.next().unsigned_abs() as usize % 80;
            let Some(sensor) = Sensor::from_index(index) else {
                continue;
            };
            if let Some(node) = self.track.find_sensor(&sensor) {
                return Some(Location {
                    node,
                    distance_past_node: 0,
                });
            }
        }
        warn!("could not find a random destination on this track");
        None
    }

    async fn route_to(&self, train: TrainId, location: Location) {
        let Some(route) = self.registry.who_is::<RouteHandle>(ROUTE_SERVER_NAME) else {
            warn!("route server is not registered yet");
            return;
        };
        let Some(stop) = self.registry.who_is::<StopHandle>(STOP_SERVER_NAME) else {
            warn!("stop server is not registered yet");
            return;
        };

        if let Err(err) = route.set_destination(train, location).await {
            warn!(%train, %err, "could not set the destination");
        }
        if let Err(err) = stop.stop_at(train, location).await {
            warn!(%train, %err, "could not arm the stop");
        }
    }

    async fn look_for(&self, train: TrainId) {
        let Some(trains) = self.registry.who_is::<TrainsHandle>(TRAIN_SERVER_NAME) else {
            warn!("train server is not registered yet");
            return;
        };
        if let Err(err) = trains.set_speed(train, LOOKING_SPEED).await {
            warn!(%train, %err, "could not start the search");
        }
    }
}

/// Client handle to the destination server.
#[derive(Debug, Clone)]
pub struct DestinationHandle {
    ep: Endpoint<DestinationRequest>,
}

impl DestinationHandle {
    /// Drive `train` to `location` and stop there.
    pub async fn once(&self, train: TrainId, location: Location) -> Result<(), IpcError> {
        self.ep
            .call(|reply| DestinationRequest::Once {
                train,
                location,
                reply,
            })
            .await
    }

    /// Drive `train` to random sensors, forever.
    pub async fn forever(&self, train: TrainId) -> Result<(), IpcError> {
        self.ep
            .call(|reply| DestinationRequest::Forever { train, reply })
            .await
    }
}
