use tracing::{info, warn};

use crate::general::TrainId;
use crate::runtime::bus::Subscription;
use crate::runtime::ipc::{self, Inbox};
use crate::runtime::registry::Registry;

use super::attribution::{AttributionHandle, NextNode, ATTRIBUTION_SERVER_NAME};
use super::messages::AttributedSensor;
use super::train::{TrainsHandle, TRAIN_SERVER_NAME};

pub(crate) enum SafetyRequest {
    CheckTrain(TrainId),
    CheckAllTrains,
}

/// The last line of defence: a train whose next expected sensor is a
/// dead end is about to fall off the known world, so stop it.
///
/// Checks fire on every attribution (the train just moved) and on every
/// switch change (the world just moved under every train).
pub struct Safety {
    registry: Registry,
}

impl Safety {
    pub fn start(
        registry: Registry,
        mut attributed: Subscription<AttributedSensor>,
        mut switch_changes: Subscription<u16>,
    ) {
        let (ep, inbox) = ipc::channel::<SafetyRequest>(32);

        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(event) = attributed.recv().await {
                    if ep
                        .cast(SafetyRequest::CheckTrain(event.train))
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
                while switch_changes.recv().await.is_some() {
                    if ep.cast(SafetyRequest::CheckAllTrains).await.is_err() {
                        break;
                    }
                }
            });
        }

        let server = Safety { registry };
        tokio::spawn(server.run(inbox));
    }

    pub(crate) fn new(registry: Registry) -> Self {
        Safety { registry }
    }

    async fn run(self, mut inbox: Inbox<SafetyRequest>) {
        while let Some(request) = inbox.recv().await {
            match request {
                SafetyRequest::CheckTrain(train) => self.check_train(train).await,
                SafetyRequest::CheckAllTrains => self.check_all().await,
            }
        }
    }

    pub(crate) async fn check_train(&self, train: TrainId) {
        let Some(attribution) = self
            .registry
            .who_is::<AttributionHandle>(ATTRIBUTION_SERVER_NAME)
        else {
            return;
        };
        let Ok(next) = attribution.next_expected_node(train).await else {
            return;
        };

        if next == NextNode::DeadEnd {
            info!(%train, "next sensor is a dead end, stopping");
            let Some(trains) = self.registry.who_is::<TrainsHandle>(TRAIN_SERVER_NAME) else {
                return;
            };
            if let Err(err) = trains.set_speed(train, 0).await {
                warn!(%train, %err, "safety stop failed");
            }
        }
    }

    pub(crate) async fn check_all(&self) {
        let Some(attribution) = self
            .registry
            .who_is::<AttributionHandle>(ATTRIBUTION_SERVER_NAME)
        else {
            return;
        };
        let Ok(tracked) = attribution.tracked_trains().await else {
            return;
        };
        for train in tracked {
            self.check_train(train).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::attribution::AttributionServer;
    use super::super::connectors::testing::{recording_connector, ConnectorProbe};
    use super::super::connectors::{spawn_io_task, ControllerCommand};
    use super::super::messages::{SensorEvent, TrainSpeed};
    use super::super::switch::SwitchServer;
    use super::super::track::components::Sensor;
    use super::super::track::data::{track, Layout};
    use super::super::train::TrainServer;
    use super::*;
    use crate::runtime::bus::Bus;
    use crate::runtime::clock::Clock;

    fn train() -> TrainId {
        TrainId::new(77)
    }

    async fn fixture(at: &str) -> (Safety, ConnectorProbe) {
        let clock = Clock::start();
        let track = Arc::new(track(Layout::TrackA));
        let (connector, probe) = recording_connector();
        let io = spawn_io_task(Box::new(connector), Bus::new(8), 64);
        let registry = Registry::new();

        let trains = TrainServer::start(io.clone(), clock.clone());
        let switches = SwitchServer::start(io);

        let sensors = Bus::new(16);
        let speed_bus = Bus::new(16);
        let directions = Bus::new(16);
        let switch_changes = Bus::new(16);
        let attribution = AttributionServer::start(
            track.clone(),
            switches.clone(),
            registry.clone(),
            clock,
            sensors.subscribe(),
            speed_bus.subscribe(),
            directions.subscribe(),
            switch_changes.subscribe(),
        );
        registry.register_as(ATTRIBUTION_SERVER_NAME, attribution);
        registry.register_as(TRAIN_SERVER_NAME, trains.clone());

        // Drive the train onto `at` so attribution tracks it, and give
        // the train server a cached speed worth cutting.
        trains.set_speed(train(), 10).await.unwrap();
        speed_bus.publish(TrainSpeed {
            train: train(),
            speed: 10,
        });
        sensors.publish(SensorEvent {
            sensor: Sensor::parse(at).unwrap(),
            is_on: true,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        (Safety::new(registry), probe)
    }

    fn stops(probe: &ConnectorProbe) -> usize {
        probe
            .sent()
            .iter()
            .filter(|c| {
                matches!(c, ControllerCommand::SetSpeed { train: t, speed: 0 } if *t == train())
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn a_train_heading_into_a_dead_end_is_stopped() {
        // E1 points straight at the buffer.
        let (safety, probe) = fixture("E1").await;

        safety.check_train(train()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(stops(&probe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_healthy_train_is_left_running() {
        let (safety, probe) = fixture("C13").await;

        safety.check_train(train()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(stops(&probe), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn check_all_covers_every_tracked_train() {
        let (safety, probe) = fixture("E1").await;

        safety.check_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(stops(&probe), 1);
    }
}
