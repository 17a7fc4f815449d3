use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::general::{
    Ticks, TrainId, AVERAGE_TRAIN_COMMAND_LATENCY, MAX_TRAINS, MAX_TRACKED,
};
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Endpoint, Inbox, IpcError};
use crate::runtime::registry::Registry;

use super::messages::{DestinationReached, Direction, Location, Route, TrainDirection};
use super::physics::Physics;
use super::train::{TrainsHandle, TRAIN_SERVER_NAME};

pub const STOP_SERVER_NAME: &str = "stop";

const TRAIN_SLOTS: usize = MAX_TRAINS as usize + 1;

pub(crate) enum StopRequest {
    RouteUpdate(Route),
    DirectionUpdate(TrainDirection),
    StopAt {
        train: TrainId,
        location: Location,
        reply: oneshot::Sender<()>,
    },
}

struct WorkerJob {
    delay: Ticks,
    arrival: DestinationReached,
}

/// Issues the stop command at the moment physics says the coast will end
/// exactly on the requested location, then announces the arrival once
/// the train is at rest.
///
/// Decisions are driven off route updates rather than raw locations so
/// the remaining distance already reflects the planned path.
pub struct StopServer {
    physics: Arc<Physics>,
    registry: Registry,
    arrivals: Bus<DestinationReached>,
    stop_locations: Box<[Option<Location>; TRAIN_SLOTS]>,
    directions: Box<[Direction; TRAIN_SLOTS]>,
    workers: Vec<Endpoint<WorkerJob>>,
    next_worker: usize,
}

impl StopServer {
    pub fn start(
        physics: Arc<Physics>,
        registry: Registry,
        clock: ClockHandle,
        mut routes: Subscription<Route>,
        mut direction_changes: Subscription<TrainDirection>,
    ) -> StopHandle {
        let (ep, inbox) = ipc::channel(64);
        let arrivals = Bus::new(64);

        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(route) = routes.recv().await {
                    if ep.cast(StopRequest::RouteUpdate(route)).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(change) = direction_changes.recv().await {
                    if ep.cast(StopRequest::DirectionUpdate(change)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let server = StopServer::new(physics, registry, arrivals.clone(), &clock);
        tokio::spawn(server.run(inbox));

        StopHandle { ep, arrivals }
    }

    pub(crate) fn new(
        physics: Arc<Physics>,
        registry: Registry,
        arrivals: Bus<DestinationReached>,
        clock: &ClockHandle,
    ) -> Self {
        // A fixed pool of sleeper workers announces arrivals, so the
        // server loop itself never blocks in a delay.
        let workers = (0..MAX_TRACKED)
            .map(|_| {
                let (worker_ep, mut worker_inbox): (_, Inbox<WorkerJob>) = ipc::channel(4);
                let clock = clock.clone();
                let arrivals = arrivals.clone();
                tokio::spawn(async move {
                    while let Some(job) = worker_inbox.recv().await {
                        if clock.delay(job.delay).await.is_err() {
                            break;
                        }
                        info!(train = %job.arrival.train, "destination reached");
                        arrivals.publish(job.arrival);
                    }
                });
                worker_ep
            })
            .collect();

        StopServer {
            physics,
            registry,
            arrivals,
            stop_locations: Box::new([None; TRAIN_SLOTS]),
            directions: Box::new([Direction::Forward; TRAIN_SLOTS]),
            workers,
            next_worker: 0,
        }
    }

    async fn run(mut self, mut inbox: Inbox<StopRequest>) {
        while let Some(request) = inbox.recv().await {
            match request {
                StopRequest::RouteUpdate(route) => self.handle_route(&route).await,
                StopRequest::DirectionUpdate(change) => {
                    self.directions[change.train.index()] = change.direction;
                }
                StopRequest::StopAt {
                    train,
                    location,
                    reply,
                } => {
                    self.stop_locations[train.index()] = Some(location);
                    let _ = reply.send(());
                }
            }
        }
    }

    pub(crate) async fn handle_route(&mut self, route: &Route) {
        let train = route.train_location.train;
        let Some(target) = self.stop_locations[train.index()] else {
            return;
        };

        let velocity = route.train_location.velocity;
        let acceleration = route.train_location.acceleration;
        let acceleration_ticks = route.train_location.acceleration_ticks;
        let direction = self.directions[train.index()];

        // Where the physics will be once the stop command actually
        // arrives at the locomotive.
        let ending_velocity = self.physics.ending_velocity(
            velocity,
            acceleration,
            acceleration_ticks.min(AVERAGE_TRAIN_COMMAND_LATENCY),
        );
        let stopping_distance = self
            .physics
            .stopping_distance(train, ending_velocity, direction);
        let rolls_before_command = self.physics.distance_travelled(
            velocity,
            acceleration,
            acceleration_ticks,
            AVERAGE_TRAIN_COMMAND_LATENCY,
        );

        let remaining = route.path.total_distance
            - route.train_location.location.distance_past_node
            - rolls_before_command;
        if remaining < 0 || remaining >= stopping_distance {
            return;
        }

        let Some(trains) = self.registry.who_is::<TrainsHandle>(TRAIN_SERVER_NAME) else {
            warn!("train server is not registered yet");
            return;
        };
        if let Err(err) = trains.set_speed(train, 0).await {
            warn!(%train, %err, "stop command failed");
            return;
        }
        info!(
            %train,
            needs = stopping_distance,
            remaining,
            "stopping"
        );
        self.stop_locations[train.index()] = None;

        let t_stop = self.physics.stopping_time(train, ending_velocity);
        self.schedule(WorkerJob {
            delay: t_stop,
            arrival: DestinationReached {
                train,
                location: target,
            },
        })
        .await;
    }

    async fn schedule(&mut self, job: WorkerJob) {
        let worker = &self.workers[self.next_worker % self.workers.len()];
        self.next_worker += 1;
        let _ = worker.cast(job).await;
    }
}

/// Client handle to the stop server.
#[derive(Debug, Clone)]
pub struct StopHandle {
    ep: Endpoint<StopRequest>,
    arrivals: Bus<DestinationReached>,
}

impl StopHandle {
    /// Asks for `train` to come to rest at `location`.
    pub async fn stop_at(&self, train: TrainId, location: Location) -> Result<(), IpcError> {
        self.ep
            .call(|reply| StopRequest::StopAt {
                train,
                location,
                reply,
            })
            .await
    }

    /// Arrival announcements.
    pub fn arrivals(&self) -> Subscription<DestinationReached> {
        self.arrivals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::super::connectors::testing::{recording_connector, ConnectorProbe};
    use super::super::connectors::{spawn_io_task, ControllerCommand};
    use super::super::messages::{Path, TrainLocation};
    use super::super::track::components::Sensor;
    use super::super::track::data::{track, Layout};
    use super::super::train::TrainServer;
    use super::*;
    use crate::runtime::clock::Clock;

    struct Fixture {
        server: StopServer,
        arrivals: Subscription<DestinationReached>,
        probe: ConnectorProbe,
        target: Location,
    }

    fn train() -> TrainId {
        TrainId::new(77)
    }

    async fn fixture() -> Fixture {
        let clock = Clock::start();
        let (connector, probe) = recording_connector();
        let io = spawn_io_task(Box::new(connector), Bus::new(8), 64);
        let registry = Registry::new();
        let trains = TrainServer::start(io, clock.clone());
        registry.register_as(TRAIN_SERVER_NAME, trains.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Give the train server a non-zero cached speed so the stop
        // command reaches the wire.
        trains.set_speed(train(), 10).await.unwrap();

        let arrivals_bus = Bus::new(16);
        let arrivals = arrivals_bus.subscribe();
        let server = StopServer::new(Arc::new(Physics::new()), registry, arrivals_bus, &clock);

        let t = track(Layout::TrackA);
        let node = t.find_sensor(&Sensor::parse("D5").unwrap()).unwrap();
        let target = Location {
            node,
            distance_past_node: 0,
        };

        Fixture {
            server,
            arrivals,
            probe,
            target,
        }
    }

    fn route_with(total: i64, velocity: i64) -> Route {
        Route {
            train_location: TrainLocation {
                train: train(),
                location: Location {
                    node: Default::default(),
                    distance_past_node: 0,
                },
                velocity,
                acceleration: 0,
                acceleration_ticks: 0,
            },
            path: Path {
                nodes: Vec::new(),
                total_distance: total,
                performs_reverse: false,
            },
        }
    }

    fn stop_commands(probe: &ConnectorProbe) -> usize {
        probe
            .sent()
            .iter()
            .filter(|c| {
                matches!(c, ControllerCommand::SetSpeed { train: t, speed: 0 } if *t == train())
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn no_stop_while_the_target_is_far() {
        let mut fixture = fixture().await;
        fixture.server.stop_locations[train().index()] = Some(fixture.target);

        // At 4000 um/tick the train needs 420 mm plus 48 mm of command
        // latency; two metres is nowhere near.
        fixture.server.handle_route(&route_with(2_000_000, 4000)).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(stop_commands(&fixture.probe), 0);
        assert!(fixture.server.stop_locations[train().index()].is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_inside_the_braking_envelope_and_announces_arrival() {
        let mut fixture = fixture().await;
        fixture.server.stop_locations[train().index()] = Some(fixture.target);

        // remaining = 460 - 48 = 412 mm, under the 420 mm envelope.
        fixture.server.handle_route(&route_with(460_000, 4000)).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(stop_commands(&fixture.probe), 1);
        assert!(fixture.server.stop_locations[train().index()].is_none());

        // A later route update must not stop it twice.
        fixture.server.handle_route(&route_with(400_000, 3000)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(stop_commands(&fixture.probe), 1);

        // The worker announces the arrival after t_stop = 200 ticks.
        let arrival = fixture.arrivals.recv().await.unwrap();
        assert_eq!(arrival.train, train());
        assert_eq!(arrival.location, fixture.target);
    }

    #[tokio::test(start_paused = true)]
    async fn underflowed_remaining_distance_is_ignored() {
        let mut fixture = fixture().await;
        fixture.server.stop_locations[train().index()] = Some(fixture.target);

        // Already past the end of the path.
        let mut route = route_with(100_000, 4000);
        route.train_location.location.distance_past_node = 200_000;
        fixture.server.handle_route(&route).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(stop_commands(&fixture.probe), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_reverse_pickup_stops_earlier() {
        let mut fixture = fixture().await;
        fixture.server.stop_locations[train().index()] = Some(fixture.target);
        fixture.server.directions[train().index()] = Direction::Reverse;

        // remaining = 452 mm: outside the forward envelope (420 mm) but
        // inside the reverse one (540 mm).
        fixture.server.handle_route(&route_with(500_000, 4000)).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(stop_commands(&fixture.probe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_target_means_no_opinion() {
        let mut fixture = fixture().await;
        fixture.server.handle_route(&route_with(100, 4000)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(stop_commands(&fixture.probe), 0);
    }
}
