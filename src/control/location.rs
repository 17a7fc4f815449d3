use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::general::{
    Micrometers, Ticks, TrainId, AVERAGE_TRAIN_COMMAND_LATENCY,
};
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Endpoint, Inbox, IpcError};

use super::messages::{AttributedSensor, Location, TrainDirection, TrainLocation, TrainSpeed};
use super::physics::Physics;
use super::switch::SwitchesHandle;
use super::track::graph::Track;

pub const LOCATION_SERVER_NAME: &str = "location";

/// Cadence of the dead-reckoning integration, in ticks.
const UPDATE_INTERVAL: Ticks = 2;

/// Weight of a fresh velocity sample in the exponential moving average,
/// in percent.
const ALPHA: i64 = 5;

pub(crate) enum LocationRequest {
    VelocityUpdate,
    AttributedSensorUpdate(AttributedSensor),
    SpeedUpdate(TrainSpeed),
    DirectionUpdate(TrainDirection),
    GetLocation {
        train: TrainId,
        reply: oneshot::Sender<Option<TrainLocation>>,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RegimeKind {
    Accelerating,
    Decelerating,
    /// Pulling away from rest takes visibly longer than speeding up on
    /// the move; modelled as half the usual acceleration.
    AccelFromStop,
    Stopping,
}

#[derive(Debug, Copy, Clone)]
struct Regime {
    kind: RegimeKind,
    ticks_remaining: Ticks,
    start_time: Ticks,
}

struct TrainState {
    train: TrainId,
    node: Option<NodeIndex>,
    distance_past_node: Micrometers,
    velocity: Micrometers,
    commanded_speed: u8,
    regime: Option<Regime>,
    last_arrival_time: Ticks,
    last_update_time: Ticks,
}

/// Estimates each tracked train's position, velocity and acceleration.
///
/// Dead reckoning runs on a 20 ms cadence; attributed sensor trips are
/// the only corrector, feeding an exponential moving average of the
/// velocity and re-anchoring the position to the tripped contact.
pub struct LocationServer {
    track: Arc<Track>,
    switches: SwitchesHandle,
    physics: Arc<Physics>,
    updates: Bus<TrainLocation>,
    trains: Vec<TrainState>,
}

impl LocationServer {
    pub fn start(
        track: Arc<Track>,
        switches: SwitchesHandle,
        physics: Arc<Physics>,
        clock: ClockHandle,
        mut attributed: Subscription<AttributedSensor>,
        mut speed_changes: Subscription<TrainSpeed>,
        mut direction_changes: Subscription<TrainDirection>,
    ) -> LocationHandle {
        let (ep, inbox) = ipc::channel(64);
        let updates = Bus::new(64);

        let server = LocationServer::new(track, switches, physics, updates.clone());

        // The integration pacer: a notifier that turns the clock into
        // periodic velocity updates.
        {
            let ep = ep.clone();
            let clock = clock.clone();
            tokio::spawn(async move {
                loop {
                    if clock.delay(UPDATE_INTERVAL).await.is_err() {
                        break;
                    }
                    if ep.cast(LocationRequest::VelocityUpdate).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(event) = attributed.recv().await {
                    if ep
                        .cast(LocationRequest::AttributedSensorUpdate(event))
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
                    if ep.cast(LocationRequest::SpeedUpdate(change)).await.is_err() {
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
                        .cast(LocationRequest::DirectionUpdate(change))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        tokio::spawn(server.run(inbox, clock));

        LocationHandle { ep, updates }
    }

    pub(crate) fn new(
        track: Arc<Track>,
        switches: SwitchesHandle,
        physics: Arc<Physics>,
        updates: Bus<TrainLocation>,
    ) -> Self {
        LocationServer {
            track,
            switches,
            physics,
            updates,
            trains: Vec::new(),
        }
    }

    async fn run(mut self, mut inbox: Inbox<LocationRequest>, clock: ClockHandle) {
        while let Some(request) = inbox.recv().await {
            let Ok(now) = clock.time().await else { return };
            match request {
                LocationRequest::VelocityUpdate => self.handle_velocity_update(now),
                LocationRequest::AttributedSensorUpdate(event) => {
                    self.handle_attributed(event, now)
                }
                LocationRequest::SpeedUpdate(change) => self.handle_speed(change, now),
                LocationRequest::DirectionUpdate(change) => self.handle_direction(change),
                LocationRequest::GetLocation { train, reply } => {
                    let _ = reply.send(self.snapshot(train));
                }
            }
        }
    }

    fn state_mut(&mut self, train: TrainId) -> Option<&mut TrainState> {
        self.trains.iter_mut().find(|s| s.train == train)
    }

    fn snapshot(&self, train: TrainId) -> Option<TrainLocation> {
        self.trains
            .iter()
            .find(|s| s.train == train)
            .and_then(|state| Self::train_location(&self.physics, state))
    }

    fn train_location(physics: &Physics, state: &TrainState) -> Option<TrainLocation> {
        let node = state.node?;
        let (acceleration, acceleration_ticks) = match &state.regime {
            Some(regime) => {
                let magnitude = Self::regime_magnitude(physics, state.train, regime.kind);
                let sign = match regime.kind {
                    RegimeKind::Accelerating | RegimeKind::AccelFromStop => 1,
                    RegimeKind::Decelerating | RegimeKind::Stopping => -1,
                };
                (sign * magnitude, regime.ticks_remaining)
            }
            None => (0, 0),
        };
        Some(TrainLocation {
            train: state.train,
            location: Location {
                node,
                distance_past_node: state.distance_past_node,
            },
            velocity: state.velocity,
            acceleration,
            acceleration_ticks,
        })
    }

    /// Static per-train acceleration magnitude, halved for a standing
    /// start.
    fn regime_magnitude(physics: &Physics, train: TrainId, kind: RegimeKind) -> i64 {
        let a = physics.acceleration(train);
        match kind {
            RegimeKind::AccelFromStop => a / 2,
            _ => a,
        }
    }

    pub(crate) fn handle_velocity_update(&mut self, now: Ticks) {
        let physics = self.physics.clone();

        for state in &mut self.trains {
            if state.node.is_none() {
                continue;
            }

            let dt = now - state.last_update_time;
            if dt <= 0 {
                continue;
            }

            let mut regime_done = false;
            if let Some(regime) = &mut state.regime {
                if now >= regime.start_time {
                    let spent = dt.min(regime.ticks_remaining);
                    let magnitude = Self::regime_magnitude(&physics, state.train, regime.kind);
                    let dv = spent * magnitude / 100;

                    match regime.kind {
                        RegimeKind::Accelerating | RegimeKind::AccelFromStop => {
                            state.velocity += dv;
                        }
                        RegimeKind::Decelerating | RegimeKind::Stopping => {
                            state.velocity -= dv;
                        }
                    }
                    regime.ticks_remaining -= spent;
                    regime_done = regime.ticks_remaining == 0;
                }
            }
            if regime_done {
                // The +1 when the regime was scheduled means we land at
                // or past the target; snap to it.
                state.velocity = physics.steady_state_velocity(state.train, state.commanded_speed);
                state.regime = None;
            }
            state.velocity = state.velocity.max(0);

            state.distance_past_node += dt * state.velocity;
            state.last_update_time = now;

            if let Some(update) = Self::train_location(&physics, state) {
                self.updates.publish(update);
            }
        }
    }

    pub(crate) fn handle_attributed(&mut self, event: AttributedSensor, now: Ticks) {
        let Some(sensor_node) = self.track.find_sensor(&event.sensor) else {
            return;
        };
        let switches = self.switches.snapshot();
        let track = self.track.clone();
        let Some(state) = self.state_mut(event.train) else {
            debug!(train = %event.train, "sensor attributed to a train with no state");
            return;
        };

        // The trip is the only velocity corrector, and only trustworthy
        // at steady speed.
        if let Some(previous_node) = state.node {
            if state.regime.is_none() && state.velocity > 0 {
                if let Ok(dx) = track.distance_between(previous_node, sensor_node, &switches) {
                    let dt = event.time_tripped - state.last_arrival_time;
                    if dt > 0 {
                        let sample = dx / dt;
                        state.velocity =
                            (ALPHA * sample + (100 - ALPHA) * state.velocity) / 100;
                    }
                }
            }
        }

        // Re-anchor; the sensor reported late, so the train is already a
        // bit past the contact.
        state.node = Some(sensor_node);
        state.distance_past_node = (now - event.time_tripped) * state.velocity;
        state.last_arrival_time = event.time_tripped;
        state.last_update_time = now;
    }

    pub(crate) fn handle_speed(&mut self, change: TrainSpeed, now: Ticks) {
        let physics = self.physics.clone();
        let index = match self.trains.iter().position(|s| s.train == change.train) {
            Some(index) => index,
            None => {
                self.trains.push(TrainState {
                    train: change.train,
                    node: None,
                    distance_past_node: 0,
                    velocity: 0,
                    commanded_speed: 0,
                    regime: None,
                    last_arrival_time: 0,
                    last_update_time: now,
                });
                self.trains.len() - 1
            }
        };
        let state = &mut self.trains[index];

        let target = physics.steady_state_velocity(change.train, change.speed);
        state.commanded_speed = change.speed;

        if state.velocity == target {
            state.regime = None;
            return;
        }

        let kind = if state.velocity > target {
            if target == 0 {
                RegimeKind::Stopping
            } else {
                RegimeKind::Decelerating
            }
        } else if state.velocity == 0 {
            RegimeKind::AccelFromStop
        } else {
            RegimeKind::Accelerating
        };

        let magnitude = Self::regime_magnitude(&physics, change.train, kind);
        state.regime = Some(Regime {
            kind,
            // +1 absorbs integer truncation: the regime ends at or
            // after the target, never short of it.
            ticks_remaining: (state.velocity - target).abs() * 100 / magnitude + 1,
            start_time: now + AVERAGE_TRAIN_COMMAND_LATENCY,
        });
    }

    pub(crate) fn handle_direction(&mut self, change: TrainDirection) {
        let switches = self.switches.snapshot();
        let track = self.track.clone();
        let Some(state) = self.state_mut(change.train) else {
            return;
        };
        let Some(node) = state.node else {
            return;
        };

        // Flip the frame of reference: anchor on the sensor ahead, seen
        // from the other side, at the mirrored offset.
        let Ok(ahead) = track.find_next_sensor(node, &switches) else {
            debug!(train = %change.train, "cannot re-anchor a reversed train past a dead end");
            return;
        };
        let Ok(distance) = track.distance_between(node, ahead, &switches) else {
            return;
        };

        state.node = Some(track.reverse(ahead));
        state.distance_past_node = (distance - state.distance_past_node).max(0);
    }
}

/// Client handle to the location server.
#[derive(Debug, Clone)]
pub struct LocationHandle {
    ep: Endpoint<LocationRequest>,
    updates: Bus<TrainLocation>,
}

impl LocationHandle {
    pub async fn get(&self, train: TrainId) -> Result<Option<TrainLocation>, IpcError> {
        self.ep
            .call(|reply| LocationRequest::GetLocation { train, reply })
            .await
    }

    /// The continuous estimate stream.
    pub fn updates(&self) -> Subscription<TrainLocation> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::super::connectors::testing::recording_connector;
    use super::super::connectors::spawn_io_task;
    use super::super::switch::SwitchServer;
    use super::super::track::components::{Sensor, SwitchDirection};
    use super::super::track::data::{track, Layout};
    use super::*;
    use crate::general::AVERAGE_SENSOR_LATENCY;

    struct Fixture {
        server: LocationServer,
        updates: Subscription<TrainLocation>,
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

        let bus = Bus::new(64);
        let updates = bus.subscribe();
        let server =
            LocationServer::new(track.clone(), switches, Arc::new(Physics::new()), bus);
        Fixture {
            server,
            updates,
            track,
        }
    }

    fn train() -> TrainId {
        TrainId::new(58)
    }

    fn trip(fixture: &mut Fixture, name: &str, time_tripped: Ticks, now: Ticks) {
        fixture.server.handle_attributed(
            AttributedSensor {
                train: train(),
                time_tripped,
                sensor: Sensor::parse(name).unwrap(),
            },
            now,
        );
    }

    /// Commanded to speed 10 and anchored at C13, regime exhausted, so
    /// the train cruises at exactly steady state.
    async fn cruising() -> Fixture {
        let mut fixture = fixture().await;
        fixture
            .server
            .handle_speed(TrainSpeed { train: train(), speed: 10 }, 0);
        trip(&mut fixture, "C13", 93, 100);
        // Far enough out to exhaust the whole standing-start regime.
        fixture.server.handle_velocity_update(1200);
        fixture
    }

    #[tokio::test(start_paused = true)]
    async fn a_train_is_not_located_until_a_sensor_fixes_it() {
        let mut fixture = fixture().await;
        fixture
            .server
            .handle_speed(TrainSpeed { train: train(), speed: 10 }, 0);

        fixture.server.handle_velocity_update(50);
        assert!(fixture.server.snapshot(train()).is_none());

        trip(&mut fixture, "C13", 93, 100);
        let snapshot = fixture.server.snapshot(train()).unwrap();
        assert_eq!(
            fixture.track.name(snapshot.location.node),
            "C13"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn standing_start_integrates_at_half_acceleration() {
        let mut fixture = fixture().await;
        fixture
            .server
            .handle_speed(TrainSpeed { train: train(), speed: 10 }, 0);
        trip(&mut fixture, "C13", 93, 100);

        // 100 ticks inside the regime: dv = 100 * (2000 / 2) / 100.
        fixture.server.handle_velocity_update(200);
        let update = fixture.updates.recv().await.unwrap();
        assert_eq!(update.velocity, 1000);
        assert_eq!(update.location.distance_past_node, 100 * 1000);
        assert!(update.acceleration > 0);
        assert!(update.acceleration_ticks > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_regime_lands_exactly_on_steady_state() {
        let fixture = cruising().await;
        let snapshot = fixture.server.snapshot(train()).unwrap();
        assert_eq!(snapshot.velocity, 5025);
        assert_eq!(snapshot.acceleration, 0);
        assert_eq!(snapshot.acceleration_ticks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn velocity_never_exceeds_the_table_with_margin() {
        let mut fixture = cruising().await;
        for step in 0..50 {
            fixture.server.handle_velocity_update(1200 + (step + 1) * 2);
            let snapshot = fixture.server.snapshot(train()).unwrap();
            assert!(snapshot.velocity >= 0);
            assert!(snapshot.velocity <= 5924 * 105 / 100);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_sensor_trip_nudges_velocity_by_ema() {
        let mut fixture = cruising().await;

        // C13 -> C14 is 200 mm; a 40 tick transit samples 5000 um/tick.
        let last_arrival = 93;
        let time_tripped = last_arrival + 40;
        trip(&mut fixture, "C14", time_tripped, 1205);

        let snapshot = fixture.server.snapshot(train()).unwrap();
        let expected = (ALPHA * 5000 + (100 - ALPHA) * 5025) / 100;
        assert_eq!(snapshot.velocity, expected);
        assert_eq!(fixture.track.name(snapshot.location.node), "C14");
        // Re-anchored past the contact by the reporting latency.
        assert_eq!(
            snapshot.location.distance_past_node,
            (1205 - time_tripped) * expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_ema_while_accelerating() {
        let mut fixture = fixture().await;
        fixture
            .server
            .handle_speed(TrainSpeed { train: train(), speed: 10 }, 0);
        trip(&mut fixture, "C13", 93, 100);
        fixture.server.handle_velocity_update(200);
        let mid_regime = fixture.server.snapshot(train()).unwrap().velocity;

        trip(&mut fixture, "C14", 233, 240);
        let snapshot = fixture.server.snapshot(train()).unwrap();
        // Position re-anchored, velocity untouched.
        assert_eq!(snapshot.velocity, mid_regime);
        assert_eq!(fixture.track.name(snapshot.location.node), "C14");
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_decays_to_exactly_zero() {
        let mut fixture = cruising().await;
        fixture
            .server
            .handle_speed(TrainSpeed { train: train(), speed: 0 }, 1200);

        let mut now = 1200;
        let mut last_position = 0;
        loop {
            now += 2;
            fixture.server.handle_velocity_update(now);
            let snapshot = fixture.server.snapshot(train()).unwrap();
            assert!(snapshot.velocity >= 0);
            assert!(snapshot.location.distance_past_node >= last_position);
            last_position = snapshot.location.distance_past_node;
            if snapshot.velocity == 0 && snapshot.acceleration_ticks == 0 {
                break;
            }
            assert!(now < 2000, "stopping regime never ended");
        }

        let snapshot = fixture.server.snapshot(train()).unwrap();
        assert_eq!(snapshot.velocity, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn direction_change_mirrors_the_anchor() {
        let mut fixture = cruising().await;
        // Manufacture a known offset: re-trip C13 and integrate briefly.
        trip(&mut fixture, "C13", 1290, 1300);
        fixture.server.handle_velocity_update(1310);
        let snapshot = fixture.server.snapshot(train()).unwrap();
        let past = snapshot.location.distance_past_node;
        assert!(past > 0);

        fixture.server.handle_direction(TrainDirection {
            train: train(),
            direction: super::super::messages::Direction::Reverse,
        });

        let snapshot = fixture.server.snapshot(train()).unwrap();
        // Anchored on C14 seen from the far side, mirrored offset.
        assert_eq!(fixture.track.name(snapshot.location.node), "C15");
        assert_eq!(snapshot.location.distance_past_node, 200_000 - past);
    }

    #[tokio::test(start_paused = true)]
    async fn attributed_time_is_biased_by_sensor_latency() {
        // End to end the bias comes from attribution; location trusts
        // the stamp it is given.
        let mut fixture = fixture().await;
        fixture
            .server
            .handle_speed(TrainSpeed { train: train(), speed: 10 }, 0);
        let now = 500;
        trip(&mut fixture, "C13", now - AVERAGE_SENSOR_LATENCY, now);
        let snapshot = fixture.server.snapshot(train()).unwrap();
        assert_eq!(snapshot.location.distance_past_node, 0);
    }
}
