use std::collections::VecDeque;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::general::{Ticks, TrainId, AVERAGE_SENSOR_LATENCY, MAX_TRACKED};
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Endpoint, Inbox, IpcError};
use crate::runtime::registry::Registry;

use super::location::{LocationHandle, LOCATION_SERVER_NAME};
use super::messages::{AttributedSensor, SensorEvent, TrainDirection, TrainSpeed};
use super::switch::SwitchesHandle;
use super::track::components::Sensor;
use super::track::graph::Track;

pub const ATTRIBUTION_SERVER_NAME: &str = "attribution";

/// What attribution expects a train to reach next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NextNode {
    /// Not a train we are tracking.
    Untracked,
    /// The track ends before another sensor; the train is about to be
    /// lost.
    DeadEnd,
    Node(NodeIndex),
}

pub(crate) enum AttributionRequest {
    SensorChanged(Sensor),
    SpeedChanged(TrainSpeed),
    DirectionChanged(TrainDirection),
    SwitchChanged(u16),
    GetTrackedTrains {
        reply: oneshot::Sender<Vec<TrainId>>,
    },
    NextExpectedNode {
        train: TrainId,
        reply: oneshot::Sender<NextNode>,
    },
}

struct AttributionEntry {
    train: TrainId,
    current: NodeIndex,
    next: Option<NodeIndex>,
}

/// Binds raw sensor trips to trains.
///
/// A trip is matched against each tracked train's expected next sensor,
/// then against the sensor one past it (flaky contacts get skipped), and
/// failing that it is assumed to reveal the oldest train we are still
/// looking for. Anything else is noise and dropped.
pub struct AttributionServer {
    track: Arc<Track>,
    switches: SwitchesHandle,
    registry: Registry,
    attributed: Bus<AttributedSensor>,
    tracked: Vec<AttributionEntry>,
    lost_trains: VecDeque<TrainId>,
}

impl AttributionServer {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        track: Arc<Track>,
        switches: SwitchesHandle,
        registry: Registry,
        clock: ClockHandle,
        mut sensors: Subscription<SensorEvent>,
        mut speed_changes: Subscription<TrainSpeed>,
        mut direction_changes: Subscription<TrainDirection>,
        mut switch_changes: Subscription<u16>,
    ) -> AttributionHandle {
        let (ep, inbox) = ipc::channel(64);
        let attributed = Bus::new(64);

        let server = AttributionServer::new(track, switches, registry, attributed.clone());

        // Notifiers: one task per upstream event source, each a plain
        // forwarding loop.
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(event) = sensors.recv().await {
                    if !event.is_on {
                        continue;
                    }
                    if ep
                        .cast(AttributionRequest::SensorChanged(event.sensor))
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
                while let Some(change) = speed_changes.recv().await {
                    if ep
                        .cast(AttributionRequest::SpeedChanged(change))
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
                while let Some(change) = direction_changes.recv().await {
                    if ep
                        .cast(AttributionRequest::DirectionChanged(change))
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
                while let Some(sw) = switch_changes.recv().await {
                    if ep.cast(AttributionRequest::SwitchChanged(sw)).await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(server.run(inbox, clock));

        AttributionHandle { ep, attributed }
    }

    pub(crate) fn new(
        track: Arc<Track>,
        switches: SwitchesHandle,
        registry: Registry,
        attributed: Bus<AttributedSensor>,
    ) -> Self {
        AttributionServer {
            track,
            switches,
            registry,
            attributed,
            tracked: Vec::with_capacity(MAX_TRACKED),
            lost_trains: VecDeque::new(),
        }
    }

    async fn run(mut self, mut inbox: Inbox<AttributionRequest>, clock: ClockHandle) {
        while let Some(request) = inbox.recv().await {
            match request {
                AttributionRequest::SensorChanged(sensor) => {
                    let Ok(now) = clock.time().await else { return };
                    self.handle_sensor(sensor, now);
                }
                AttributionRequest::SpeedChanged(change) => self.handle_speed(change),
                AttributionRequest::DirectionChanged(change) => self.handle_direction(change),
                AttributionRequest::SwitchChanged(sw) => self.handle_switch_changed(sw).await,
                AttributionRequest::GetTrackedTrains { reply } => {
                    let _ = reply.send(self.tracked.iter().map(|e| e.train).collect());
                }
                AttributionRequest::NextExpectedNode { train, reply } => {
                    let _ = reply.send(self.next_expected(train));
                }
            }
        }
    }

    fn next_expected(&self, train: TrainId) -> NextNode {
        match self.tracked.iter().find(|e| e.train == train) {
            Some(entry) => match entry.next {
                Some(node) => NextNode::Node(node),
                None => NextNode::DeadEnd,
            },
            None => NextNode::Untracked,
        }
    }

    pub(crate) fn handle_sensor(&mut self, sensor: Sensor, now: Ticks) {
        let Some(node) = self.track.find_sensor(&sensor) else {
            debug!(%sensor, "trip on a sensor that is not in the graph");
            return;
        };
        let switches = self.switches.snapshot();

        // Straight match against everyone's expected next sensor.
        let mut matched = self
            .tracked
            .iter()
            .position(|e| e.next == Some(node));

        // There are unreliable contacts on the table; accept the sensor
        // one past the expected one.
        if matched.is_none() {
            matched = self.tracked.iter().position(|e| {
                e.next
                    .and_then(|next| self.track.find_next_sensor(next, &switches).ok())
                    == Some(node)
            });
        }

        // Maybe a train we are looking for tripped it.
        if matched.is_none() && !self.lost_trains.is_empty() && self.tracked.len() < MAX_TRACKED {
            let train = self.lost_trains.pop_front().expect("checked non-empty");
            info!(%train, %sensor, "found train");
            self.tracked.push(AttributionEntry {
                train,
                current: node,
                next: None,
            });
            matched = Some(self.tracked.len() - 1);
        }

        let Some(index) = matched else {
            info!(%sensor, "unexpected sensor");
            return;
        };

        let entry = &mut self.tracked[index];
        entry.current = node;
        entry.next = match self.track.find_next_sensor(node, &switches) {
            Ok(next) => Some(next),
            Err(_) => {
                warn!(%sensor, train = %entry.train, "no sensor ahead of trip");
                None
            }
        };

        self.attributed.publish(AttributedSensor {
            train: entry.train,
            time_tripped: now - AVERAGE_SENSOR_LATENCY,
            sensor,
        });
    }

    pub(crate) fn handle_speed(&mut self, change: TrainSpeed) {
        let known = self.tracked.iter().any(|e| e.train == change.train)
            || self.lost_trains.contains(&change.train);

        // A moving train we have never seen must be out there somewhere.
        if !known && change.speed != 0 {
            info!(train = %change.train, "searching for train");
            self.lost_trains.push_back(change.train);
        }
    }

    pub(crate) fn handle_direction(&mut self, change: TrainDirection) {
        let Some(entry) = self.tracked.iter_mut().find(|e| e.train == change.train) else {
            warn!(train = %change.train, "direction changed before the train was located");
            return;
        };

        match entry.next {
            Some(next) => {
                let old_current = entry.current;
                entry.current = self.track.reverse(next);
                entry.next = Some(self.track.reverse(old_current));
            }
            None => {
                // Past a dead end there is no node to flip from; the
                // first contact the reversed train crosses is its own.
                entry.next = Some(self.track.reverse(entry.current));
            }
        }
    }

    pub(crate) async fn handle_switch_changed(&mut self, sw: u16) {
        let switches = self.switches.snapshot();
        let location: Option<LocationHandle> = self.registry.who_is(LOCATION_SERVER_NAME);

        for entry in &mut self.tracked {
            let Ok(branch) = self.track.find_next_branch(entry.current, &switches) else {
                continue;
            };
            if self.track.node(branch).num != sw {
                continue;
            }

            // The train may be before, on, or already past the branch;
            // only a train still before it changes expectations.
            let before_branch = match (&location, self.track.distance_between(entry.current, branch, &switches)) {
                (Some(location), Ok(distance)) => match location.get(entry.train).await {
                    Ok(Some(train_location)) => {
                        train_location.location.distance_past_node < distance
                    }
                    // No estimate yet; assume it has not reached the
                    // branch.
                    _ => true,
                },
                _ => true,
            };

            if before_branch {
                entry.next = self.track.find_next_sensor(entry.current, &switches).ok();
            }
        }
    }
}

/// Client handle to the attribution server.
#[derive(Debug, Clone)]
pub struct AttributionHandle {
    ep: Endpoint<AttributionRequest>,
    attributed: Bus<AttributedSensor>,
}

impl AttributionHandle {
    pub async fn tracked_trains(&self) -> Result<Vec<TrainId>, IpcError> {
        self.ep
            .call(|reply| AttributionRequest::GetTrackedTrains { reply })
            .await
    }

    pub async fn next_expected_node(&self, train: TrainId) -> Result<NextNode, IpcError> {
        self.ep
            .call(|reply| AttributionRequest::NextExpectedNode { train, reply })
            .await
    }

    /// The attributed sensor stream.
    pub fn attributed(&self) -> Subscription<AttributedSensor> {
        self.attributed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::super::connectors::testing::recording_connector;
    use super::super::connectors::spawn_io_task;
    use super::super::switch::SwitchServer;
    use super::super::track::components::SwitchDirection;
    use super::super::track::data::{track, Layout};
    use super::*;

    struct Fixture {
        server: AttributionServer,
        attributed: Subscription<AttributedSensor>,
        switches: SwitchesHandle,
        track: Arc<Track>,
    }

    async fn fixture() -> Fixture {
        let track = Arc::new(track(Layout::TrackA));
        let (connector, _probe) = recording_connector();
        let io = spawn_io_task(Box::new(connector), Bus::new(8), 64);
        let switches = SwitchServer::start(io);
        for sw in [15, 9, 10] {
            switches
                .set_direction(sw, SwitchDirection::Straight)
                .await
                .unwrap();
        }

        let bus = Bus::new(16);
        let attributed = bus.subscribe();
        let server =
            AttributionServer::new(track.clone(), switches.clone(), Registry::new(), bus);
        Fixture {
            server,
            attributed,
            switches,
            track,
        }
    }

    fn sensor(name: &str) -> Sensor {
        Sensor::parse(name).unwrap()
    }

    fn node(fixture: &Fixture, name: &str) -> NodeIndex {
        fixture.track.find_sensor(&sensor(name)).unwrap()
    }

    /// Speed up an untracked train and reveal it at `at`.
    fn acquire(fixture: &mut Fixture, train: TrainId, at: &str) {
        fixture.server.handle_speed(TrainSpeed { train, speed: 10 });
        fixture.server.handle_sensor(sensor(at), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn pass_through_attribution_advances_the_expectation() {
        let mut fixture = fixture().await;
        let train = TrainId::new(58);
        acquire(&mut fixture, train, "C13");
        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "C14"))
        );
        // Drain the acquisition event.
        fixture.attributed.recv().await.unwrap();

        fixture.server.handle_sensor(sensor("C14"), 500);

        let event = fixture.attributed.recv().await.unwrap();
        assert_eq!(
            event,
            AttributedSensor {
                train,
                time_tripped: 500 - AVERAGE_SENSOR_LATENCY,
                sensor: sensor("C14"),
            }
        );
        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "E7"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_skipped_sensor_still_matches_off_by_one() {
        let mut fixture = fixture().await;
        let train = TrainId::new(58);
        acquire(&mut fixture, train, "C13");
        fixture.attributed.recv().await.unwrap();

        // Expected C14; E7 is the sensor one past it and trips instead.
        fixture.server.handle_sensor(sensor("E7"), 600);

        let event = fixture.attributed.recv().await.unwrap();
        assert_eq!(event.train, train);
        assert_eq!(event.sensor, sensor("E7"));
        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "D5"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_lost_train_is_adopted_at_the_first_unmatched_trip() {
        let mut fixture = fixture().await;
        let train = TrainId::new(63);

        fixture.server.handle_speed(TrainSpeed { train, speed: 10 });
        fixture.server.handle_sensor(sensor("B4"), 250);

        let event = fixture.attributed.recv().await.unwrap();
        assert_eq!(event.train, train);
        assert_eq!(event.sensor, sensor("B4"));
        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "A1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn noise_does_not_change_any_state() {
        let mut fixture = fixture().await;
        let train = TrainId::new(58);
        acquire(&mut fixture, train, "C13");
        fixture.attributed.recv().await.unwrap();

        // D5 is nobody's expectation, nobody's off-by-one, and there is
        // no lost train to adopt.
        fixture.server.handle_sensor(sensor("D5"), 700);

        assert_eq!(fixture.server.tracked.len(), 1);
        assert!(fixture.server.lost_trains.is_empty());
        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "C14"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_speed_changes_enqueue_a_train_once() {
        let mut fixture = fixture().await;
        let train = TrainId::new(63);
        fixture.server.handle_speed(TrainSpeed { train, speed: 10 });
        fixture.server.handle_speed(TrainSpeed { train, speed: 12 });
        assert_eq!(fixture.server.lost_trains.len(), 1);

        // Stopped trains are not worth searching for.
        fixture
            .server
            .handle_speed(TrainSpeed { train: TrainId::new(64), speed: 0 });
        assert_eq!(fixture.server.lost_trains.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn direction_changes_are_an_involution() {
        let mut fixture = fixture().await;
        let train = TrainId::new(58);
        acquire(&mut fixture, train, "C13");

        let before_current = fixture.server.tracked[0].current;
        let before_next = fixture.server.tracked[0].next;

        let change = TrainDirection {
            train,
            direction: super::super::messages::Direction::Reverse,
        };
        fixture.server.handle_direction(change);

        // Reversed: about to re-cross its own contact from the other
        // side.
        assert_eq!(
            fixture.server.tracked[0].current,
            fixture.track.reverse(before_next.unwrap())
        );
        assert_eq!(
            fixture.server.tracked[0].next,
            Some(fixture.track.reverse(before_current))
        );

        let change = TrainDirection {
            train,
            direction: super::super::messages::Direction::Forward,
        };
        fixture.server.handle_direction(change);

        assert_eq!(fixture.server.tracked[0].current, before_current);
        assert_eq!(fixture.server.tracked[0].next, before_next);
    }

    #[tokio::test(start_paused = true)]
    async fn a_thrown_switch_moves_the_expectation() {
        let mut fixture = fixture().await;
        let train = TrainId::new(58);
        acquire(&mut fixture, train, "C14");
        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "E7"))
        );

        fixture
            .switches
            .set_direction(15, SwitchDirection::Curved)
            .await
            .unwrap();
        fixture.server.handle_switch_changed(15).await;

        assert_eq!(
            fixture.server.next_expected(train),
            NextNode::Node(node(&fixture, "E1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_dead_end_reports_itself() {
        let mut fixture = fixture().await;
        let train = TrainId::new(58);
        // E1 leads straight into the buffer.
        acquire(&mut fixture, train, "E1");
        assert_eq!(fixture.server.next_expected(train), NextNode::DeadEnd);
        assert_eq!(
            fixture.server.next_expected(TrainId::new(99)),
            NextNode::Untracked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_is_capped() {
        let mut fixture = fixture().await;
        // Each trip is chosen to match nobody already tracked, so every
        // one of them adopts the next waiting train.
        let names = ["C13", "D5", "E1", "C12", "D6", "C5", "E2"];
        for (i, name) in names.iter().enumerate() {
            let train = TrainId::new(50 + i as u8);
            fixture.server.handle_speed(TrainSpeed { train, speed: 10 });
            fixture.server.handle_sensor(sensor(name), 100 + i as Ticks);
        }
        assert_eq!(fixture.server.tracked.len(), MAX_TRACKED);
        // The seventh train stays queued until a slot opens.
        assert_eq!(fixture.server.lost_trains.len(), 1);
    }
}
