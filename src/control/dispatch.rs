use std::sync::Arc;

use crate::general::Ticks;
use crate::runtime::bus::Bus;
use crate::runtime::clock::{Clock, ClockHandle};
use crate::runtime::registry::Registry;

use super::attribution::{AttributionHandle, AttributionServer, ATTRIBUTION_SERVER_NAME};
use super::conductor::Conductor;
use super::connectors::{spawn_io_task, Connector};
use super::destination::{DestinationHandle, DestinationServer, DESTINATION_SERVER_NAME};
use super::location::{LocationHandle, LocationServer, LOCATION_SERVER_NAME};
use super::physics::Physics;
use super::route::{RouteHandle, RouteServer, ROUTE_SERVER_NAME};
use super::safety::Safety;
use super::scheduler::{Scheduler, SchedulerHandle, SCHEDULER_NAME};
use super::sensor::{SensorServer, SensorsHandle, SENSOR_SERVER_NAME};
use super::stop::{StopHandle, StopServer, STOP_SERVER_NAME};
use super::switch::{SwitchServer, SwitchesHandle, SWITCH_SERVER_NAME};
use super::track::graph::Track;
use super::train::{TrainServer, TrainsHandle, TRAIN_SERVER_NAME};
use super::CommandError;

pub const CLOCK_NAME: &str = "clock";

/// Startup options. The defaults drive a real table; tests mostly keep
/// them too.
#[derive(Debug, Copy, Clone)]
pub struct DispatchConfig {
    /// Ticks between sensor polls.
    pub poll_interval: Ticks,
    /// Capacity of the controller command queue.
    pub io_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            poll_interval: 5,
            io_capacity: 64,
        }
    }
}

/// The whole control plane, wired and running.
///
/// Owns nothing but the registry; every server runs as its own task and
/// is reached through its registered handle.
///
/// ```
/// use trackpilot::control::connectors::Connector;
/// use trackpilot::control::dispatch::{Dispatch, DispatchConfig};
/// use trackpilot::control::track::data::{track, Layout};
/// use trackpilot::general::TrainId;
///
/// async fn drive(connector: impl Connector + 'static) -> Result<(), Box<dyn std::error::Error>> {
///     let dispatch = Dispatch::start(track(Layout::TrackA), connector, DispatchConfig::default());
///     dispatch.trains().set_speed(TrainId::new(58), 10).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Dispatch {
    registry: Registry,
    track: Arc<Track>,
}

impl Dispatch {
    pub fn start<C: Connector + 'static>(
        track: Track,
        connector: C,
        config: DispatchConfig,
    ) -> Dispatch {
        let registry = Registry::new();
        let track = Arc::new(track);
        let physics = Arc::new(Physics::new());

        let clock = Clock::start();
        registry.register_as(CLOCK_NAME, clock.clone());

        let frames = Bus::new(16);
        let io = spawn_io_task(Box::new(connector), frames.clone(), config.io_capacity);

        let trains = TrainServer::start(io.clone(), clock.clone());
        registry.register_as(TRAIN_SERVER_NAME, trains.clone());

        let switches = SwitchServer::start(io.clone());
        registry.register_as(SWITCH_SERVER_NAME, switches.clone());

        let sensors = SensorServer::start(
            io,
            frames.subscribe(),
            clock.clone(),
            config.poll_interval,
        );
        registry.register_as(SENSOR_SERVER_NAME, sensors.clone());

        let attribution = AttributionServer::start(
            track.clone(),
            switches.clone(),
            registry.clone(),
            clock.clone(),
            sensors.events(),
            trains.speed_changes(),
            trains.direction_changes(),
            switches.changes(),
        );
        registry.register_as(ATTRIBUTION_SERVER_NAME, attribution.clone());

        let location = LocationServer::start(
            track.clone(),
            switches.clone(),
            physics.clone(),
            clock.clone(),
            attribution.attributed(),
            trains.speed_changes(),
            trains.direction_changes(),
        );
        registry.register_as(LOCATION_SERVER_NAME, location.clone());

        Safety::start(
            registry.clone(),
            attribution.attributed(),
            switches.changes(),
        );

        let scheduler = Scheduler::start(
            track.clone(),
            switches.clone(),
            registry.clone(),
            clock.clone(),
            location.updates(),
            attribution.attributed(),
        );
        registry.register_as(SCHEDULER_NAME, scheduler);

        let route = RouteServer::start(
            track.clone(),
            switches.clone(),
            physics.clone(),
            clock.clone(),
            location.updates(),
            trains.direction_changes(),
        );
        registry.register_as(ROUTE_SERVER_NAME, route.clone());

        Conductor::start(
            track.clone(),
            physics.clone(),
            registry.clone(),
            route.routes(),
            trains.speed_changes(),
            trains.direction_changes(),
        );

        let stop = StopServer::start(
            physics,
            registry.clone(),
            clock.clone(),
            route.routes(),
            trains.direction_changes(),
        );
        registry.register_as(STOP_SERVER_NAME, stop.clone());

        let destinations = DestinationServer::start(
            track.clone(),
            registry.clone(),
            clock,
            attribution.attributed(),
            stop.arrivals(),
        );
        registry.register_as(DESTINATION_SERVER_NAME, destinations);

        Dispatch { registry, track }
    }

    /// Looks up any registered handle by its server name.
    pub fn who_is<H: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<H> {
        self.registry.who_is(name)
    }

    fn expect<H: Clone + Send + Sync + 'static>(&self, name: &str) -> H {
        self.registry
            .who_is(name)
            .expect("server registered at startup")
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn clock(&self) -> ClockHandle {
        self.expect(CLOCK_NAME)
    }

    pub fn trains(&self) -> TrainsHandle {
        self.expect(TRAIN_SERVER_NAME)
    }

    pub fn switches(&self) -> SwitchesHandle {
        self.expect(SWITCH_SERVER_NAME)
    }

    pub fn sensors(&self) -> SensorsHandle {
        self.expect(SENSOR_SERVER_NAME)
    }

    pub fn attribution(&self) -> AttributionHandle {
        self.expect(ATTRIBUTION_SERVER_NAME)
    }

    pub fn location(&self) -> LocationHandle {
        self.expect(LOCATION_SERVER_NAME)
    }

    pub fn route(&self) -> RouteHandle {
        self.expect(ROUTE_SERVER_NAME)
    }

    pub fn stop(&self) -> StopHandle {
        self.expect(STOP_SERVER_NAME)
    }

    pub fn destinations(&self) -> DestinationHandle {
        self.expect(DESTINATION_SERVER_NAME)
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.expect(SCHEDULER_NAME)
    }

    /// Stops every moving locomotive and powers the controller down.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        self.trains().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::connectors::testing::{recording_connector, ConnectorProbe};
    use super::super::connectors::{ControllerCommand, SENSOR_FRAME_LEN};
    use super::super::track::components::{Sensor, SwitchDirection};
    use super::super::track::data::{track, Layout};
    use super::*;
    use crate::general::TrainId;

    fn frame_with(sensors: &[&str]) -> [u8; SENSOR_FRAME_LEN] {
        let mut frame = [0u8; SENSOR_FRAME_LEN];
        for name in sensors {
            let sensor = Sensor::parse(name).unwrap();
            let module = sensor.module as usize - 'A' as usize;
            let byte = module * 2 + usize::from(sensor.number > 8);
            let number_in_byte = if sensor.number > 8 {
                sensor.number - 8
            } else {
                sensor.number
            };
            frame[byte] |= 1 << (8 - number_in_byte);
        }
        frame
    }

    async fn started() -> (Dispatch, ConnectorProbe) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (connector, probe) = recording_connector();
        let dispatch = Dispatch::start(
            track(Layout::TrackA),
            connector,
            DispatchConfig::default(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        for sw in [15, 9, 10] {
            dispatch
                .switches()
                .set_direction(sw, SwitchDirection::Straight)
                .await
                .unwrap();
        }
        (dispatch, probe)
    }

    #[test]
    fn sensor_frames_encode_like_the_controller() {
        // C13 lives in byte 5, bit 3.
        assert_eq!(frame_with(&["C13"])[5], 0b0000_1000);
        assert_eq!(frame_with(&["A1"])[0], 0b1000_0000);
    }

    #[tokio::test(start_paused = true)]
    async fn a_speeding_train_is_acquired_and_followed_across_sensors() {
        let (dispatch, probe) = started().await;
        let mut attributed = dispatch.attribution().attributed();

        dispatch
            .trains()
            .set_speed(TrainId::new(58), 10)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Quiet baseline, then C13 trips: the lost train is adopted.
        probe.push_frame([0; SENSOR_FRAME_LEN]);
        probe.push_frame(frame_with(&["C13"]));

        let event = attributed.recv().await.unwrap();
        assert_eq!(event.train, TrainId::new(58));
        assert_eq!(event.sensor, Sensor::parse("C13").unwrap());

        let tracked = dispatch.attribution().tracked_trains().await.unwrap();
        assert_eq!(tracked, vec![TrainId::new(58)]);

        // The next contact follows the same train around the loop.
        probe.push_frame(frame_with(&["C14"]));
        let event = attributed.recv().await.unwrap();
        assert_eq!(event.sensor, Sensor::parse("C14").unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let estimate = dispatch
            .location()
            .get(TrainId::new(58))
            .await
            .unwrap()
            .expect("located after two fixes");
        assert_eq!(dispatch.track().name(estimate.location.node), "C14");
    }

    #[tokio::test(start_paused = true)]
    async fn a_found_train_with_a_destination_gets_a_route() {
        let (dispatch, _probe) = started().await;
        let mut routes = dispatch.route().routes();

        dispatch
            .trains()
            .set_speed(TrainId::new(58), 10)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Reveal the train without going through the poll loop.
        dispatch.sensors().inject(super::super::messages::SensorEvent {
            sensor: Sensor::parse("C13").unwrap(),
            is_on: true,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let b4 = dispatch
            .track()
            .find_sensor(&Sensor::parse("B4").unwrap())
            .unwrap();
        dispatch
            .destinations()
            .once(
                TrainId::new(58),
                super::super::messages::Location {
                    node: b4,
                    distance_past_node: 0,
                },
            )
            .await
            .unwrap();

        // The 20 ms estimator cadence drives planning.
        let route = loop {
            let route = routes.recv().await.expect("route bus open");
            if !route.path.nodes.is_empty() {
                break route;
            }
        };
        assert_eq!(route.train_location.train, TrainId::new(58));
        assert_eq!(route.path.nodes.last().unwrap().node, b4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_quiesces_the_controller() {
        let (dispatch, probe) = started().await;
        dispatch
            .trains()
            .set_speed(TrainId::new(63), 9)
            .await
            .unwrap();

        dispatch.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = probe.sent();
        let power_off = sent
            .iter()
            .rposition(|c| *c == ControllerCommand::Stop)
            .expect("controller powered off");
        let last_speed = sent
            .iter()
            .rposition(|c| matches!(c, ControllerCommand::SetSpeed { .. }))
            .unwrap();
        assert!(power_off > last_speed);
    }
}
