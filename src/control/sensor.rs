use tracing::trace;

use crate::general::Ticks;
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::Endpoint;

use super::connectors::{ControllerCommand, SensorFrame, SENSOR_FRAME_LEN};
use super::messages::SensorEvent;
use super::track::components::Sensor;

pub const SENSOR_SERVER_NAME: &str = "sensor";

/// Contact edges in a polled frame, relative to the previous frame.
///
/// Byte `2k` carries contacts 1..=8 of module `'A' + k`, byte `2k + 1`
/// contacts 9..=16; within a byte the highest bit is the lowest
/// numbered contact.
pub(crate) fn frame_deltas(previous: &SensorFrame, current: &SensorFrame) -> Vec<SensorEvent> {
    let mut events = Vec::new();

    for (i, (prev, cur)) in previous.iter().zip(current.iter()).enumerate() {
        if prev == cur {
            continue;
        }

        for j in 0..8u8 {
            let was_on = (prev >> j) & 1 != 0;
            let is_on = (cur >> j) & 1 != 0;
            if was_on == is_on {
                continue;
            }

            let module = (b'A' + (i / 2) as u8) as char;
            let number = (8 - j) + ((i % 2) as u8 * 8);
            if let Some(sensor) = Sensor::new(module, number) {
                events.push(SensorEvent { sensor, is_on });
            }
        }
    }

    events
}

/// The sensor pipeline: a poll driver that queries the controller on a
/// fixed cadence, and a delta task that turns raw frames into contact
/// edge events.
pub struct SensorServer;

impl SensorServer {
    pub fn start(
        io: Endpoint<ControllerCommand>,
        mut frames: Subscription<SensorFrame>,
        clock: ClockHandle,
        poll_interval: Ticks,
    ) -> SensorsHandle {
        let events = Bus::new(64);

        tokio::spawn(async move {
            loop {
                if clock.delay(poll_interval).await.is_err() {
                    break;
                }
                if io.cast(ControllerCommand::PollSensors).await.is_err() {
                    break;
                }
            }
        });

        let bus = events.clone();
        tokio::spawn(async move {
            let mut previous: SensorFrame = [0; SENSOR_FRAME_LEN];
            while let Some(frame) = frames.recv().await {
                for event in frame_deltas(&previous, &frame) {
                    trace!(sensor = %event.sensor, on = event.is_on, "contact edge");
                    bus.publish(event);
                }
                previous = frame;
            }
        });

        SensorsHandle { events }
    }
}

/// Client handle to the sensor pipeline.
#[derive(Debug, Clone)]
pub struct SensorsHandle {
    events: Bus<SensorEvent>,
}

impl SensorsHandle {
    pub fn events(&self) -> Subscription<SensorEvent> {
        self.events.subscribe()
    }

    /// Injects an event as if the hardware had reported it.
    pub fn inject(&self, event: SensorEvent) {
        self.events.publish(event);
    }
}
