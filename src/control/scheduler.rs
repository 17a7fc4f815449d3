use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tracing::{info, warn};

use crate::general::{Micrometers, Ticks, MAX_TRAINS};
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Inbox};
use crate::runtime::registry::Registry;

use super::attribution::{AttributionHandle, NextNode, ATTRIBUTION_SERVER_NAME};
use super::messages::{ArrivalReport, AttributedSensor, TrainLocation};
use super::switch::SwitchesHandle;
use super::track::graph::Track;

pub const SCHEDULER_NAME: &str = "scheduler";

/// Below this velocity an arrival prediction is not worth making.
const NOT_MOVING_THRESHOLD: Micrometers = 100;

/// Arrivals within this many ticks of the prediction pass unremarked.
const ALLOWABLE_ARRIVAL_THRESHOLD: Ticks = 5;

const TRAIN_SLOTS: usize = MAX_TRAINS as usize + 1;

pub(crate) enum SchedulerRequest {
    LocationUpdate(TrainLocation),
    AttributedSensor(AttributedSensor),
}

#[derive(Debug, Copy, Clone, Default)]
struct TrainSchedule {
    next_node: Option<NodeIndex>,
    expected_arrival: Ticks,
}

/// Predicts when each train should reach its next expected sensor and
/// reports arrivals that miss the prediction, which is the cheapest
/// available measure of how well the physics model fits reality.
pub struct Scheduler {
    track: Arc<Track>,
    switches: SwitchesHandle,
    registry: Registry,
    reports: Bus<ArrivalReport>,
    schedules: Box<[TrainSchedule; TRAIN_SLOTS]>,
}

impl Scheduler {
    pub fn start(
        track: Arc<Track>,
        switches: SwitchesHandle,
        registry: Registry,
        clock: ClockHandle,
        mut locations: Subscription<TrainLocation>,
        mut attributed: Subscription<AttributedSensor>,
    ) -> SchedulerHandle {
        let (ep, inbox) = ipc::channel(64);
        let reports = Bus::new(64);

        {
            let ep = ep.clone();
            tokio::spawn(async move {
                while let Some(update) = locations.recv().await {
                    if ep
                        .cast(SchedulerRequest::LocationUpdate(update))
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
                while let Some(event) = attributed.recv().await {
                    if ep
                        .cast(SchedulerRequest::AttributedSensor(event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let server = Scheduler::new(track, switches, registry, reports.clone());
        tokio::spawn(server.run(inbox, clock));

        SchedulerHandle { reports }
    }

    pub(crate) fn new(
        track: Arc<Track>,
        switches: SwitchesHandle,
        registry: Registry,
        reports: Bus<ArrivalReport>,
    ) -> Self {
        Scheduler {
            track,
            switches,
            registry,
            reports,
            schedules: Box::new([TrainSchedule::default(); TRAIN_SLOTS]),
        }
    }

    async fn run(mut self, mut inbox: Inbox<SchedulerRequest>, clock: ClockHandle) {
        while let Some(request) = inbox.recv().await {
            match request {
                SchedulerRequest::LocationUpdate(update) => {
                    let Ok(now) = clock.time().await else { return };
                    self.handle_location(update, now).await;
                }
                SchedulerRequest::AttributedSensor(event) => self.handle_attributed(event),
            }
        }
    }

    pub(crate) async fn handle_location(&mut self, update: TrainLocation, now: Ticks) {
        let Some(attribution) = self
            .registry
            .who_is::<AttributionHandle>(ATTRIBUTION_SERVER_NAME)
        else {
            return;
        };
        let Ok(next) = attribution.next_expected_node(update.train).await else {
            return;
        };

        let schedule = &mut self.schedules[update.train.index()];
        let NextNode::Node(next_node) = next else {
            schedule.next_node = None;
            schedule.expected_arrival = 0;
            return;
        };
        schedule.next_node = Some(next_node);

        let switches = self.switches.snapshot();
        // Mid-reverse there may be no walkable path to the next node.
        let Ok(distance) = self
            .track
            .distance_between(update.location.node, next_node, &switches)
        else {
            schedule.expected_arrival = 0;
            return;
        };

        if update.velocity > NOT_MOVING_THRESHOLD {
            // Sensor latency may put the estimate past the contact; keep
            // the previous guess in that case.
            if distance > update.location.distance_past_node {
                let time_to_next =
                    (distance - update.location.distance_past_node) / update.velocity;
                schedule.expected_arrival = now + time_to_next;
            }
        } else {
            schedule.expected_arrival = 0;
        }
    }

    pub(crate) fn handle_attributed(&mut self, event: AttributedSensor) {
        let schedule = self.schedules[event.train.index()];
        if schedule.expected_arrival <= 0 {
            // First sight of this train; nothing was predicted.
            return;
        }

        let tripped = self.track.find_sensor(&event.sensor);
        if tripped != schedule.next_node {
            warn!(
                train = %event.train,
                tripped = %event.sensor,
                "arrived somewhere other than predicted"
            );
            return;
        }

        let delta = event.time_tripped - schedule.expected_arrival;
        if delta.abs() > ALLOWABLE_ARRIVAL_THRESHOLD {
            if let Some(node) = schedule.next_node {
                info!(train = %event.train, delta, "arrival off schedule");
                self.reports.publish(ArrivalReport {
                    train: event.train,
                    node,
                    delta,
                });
            }
        }
    }
}

/// Client handle to the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    reports: Bus<ArrivalReport>,
}

impl SchedulerHandle {
    /// Off-schedule arrival reports.
    pub fn reports(&self) -> Subscription<ArrivalReport> {
        self.reports.subscribe()
    }
}
