use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::general::{Ticks, TrainId, MAX_SPEED, MAX_TRAINS, MAX_TRACKED};
use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::clock::ClockHandle;
use crate::runtime::ipc::{self, Endpoint, Inbox};

use super::connectors::ControllerCommand;
use super::messages::{Direction, TrainDirection, TrainSpeed};
use super::CommandError;

pub const TRAIN_SERVER_NAME: &str = "train";

/// The fleet that tends to be left on the table. Stopped at startup in
/// case the previous run forgot.
const KNOWN_TRAINS: [u8; 5] = [58, 63, 64, 68, 69];

/// Ticks between the reverse command and restoring the old speed.
const REVERSE_SETTLE_DELAY: Ticks = 5;

const TRAIN_SLOTS: usize = MAX_TRAINS as usize + 1;

pub(crate) enum TrainRequest {
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    SetSpeed {
        train: TrainId,
        speed: u8,
    },
    GetSpeed {
        train: TrainId,
        reply: oneshot::Sender<u8>,
    },
    Reverse {
        train: TrainId,
    },
    /// A reversing train has come to rest; flip it and speed it back up.
    ReverseStopped {
        train: TrainId,
        restore_speed: u8,
    },
}

struct WorkerJob {
    delay: Ticks,
    request: TrainRequest,
}

/// Owns every locomotive's commanded speed and facing, and the sole
/// right to write train commands to the controller.
pub struct TrainServer {
    io: Endpoint<ControllerCommand>,
    speed_changes: Bus<TrainSpeed>,
    direction_changes: Bus<TrainDirection>,
    speeds: Box<[u8; TRAIN_SLOTS]>,
    directions: Box<[Direction; TRAIN_SLOTS]>,
    workers: Vec<Endpoint<WorkerJob>>,
    next_worker: usize,
}

impl TrainServer {
    pub fn start(io: Endpoint<ControllerCommand>, clock: ClockHandle) -> TrainsHandle {
        let (ep, inbox) = ipc::channel(32);
        let speed_changes = Bus::new(64);
        let direction_changes = Bus::new(64);

        // A fixed worker pool runs the delayed halves of a reverse, so
        // the server loop itself never sleeps.
        let workers = (0..MAX_TRACKED)
            .map(|_| {
                let (worker_ep, mut worker_inbox): (_, Inbox<WorkerJob>) = ipc::channel(4);
                let server = ep.clone();
                let clock = clock.clone();
                tokio::spawn(async move {
                    while let Some(job) = worker_inbox.recv().await {
                        if clock.delay(job.delay).await.is_err() {
                            break;
                        }
                        if server.cast(job.request).await.is_err() {
                            break;
                        }
                    }
                });
                worker_ep
            })
            .collect();

        let server = TrainServer {
            io,
            speed_changes: speed_changes.clone(),
            direction_changes: direction_changes.clone(),
            speeds: Box::new([0; TRAIN_SLOTS]),
            directions: Box::new([Direction::Forward; TRAIN_SLOTS]),
            workers,
            next_worker: 0,
        };
        tokio::spawn(server.run(inbox));

        TrainsHandle {
            ep,
            speed_changes,
            direction_changes,
        }
    }

    async fn run(mut self, mut inbox: Inbox<TrainRequest>) {
        // Power the track and quiesce whatever the last run left moving.
        let _ = self.io.cast(ControllerCommand::Go).await;
        for train in KNOWN_TRAINS {
            let _ = self
                .io
                .cast(ControllerCommand::SetSpeed {
                    train: TrainId::new(train),
                    speed: 0,
                })
                .await;
        }

        while let Some(request) = inbox.recv().await {
            match request {
                TrainRequest::SetSpeed { train, speed } => {
                    self.handle_set_speed(train, speed).await;
                }

                TrainRequest::GetSpeed { train, reply } => {
                    let _ = reply.send(self.speeds[train.index()]);
                }

                TrainRequest::Reverse { train } => {
                    self.handle_reverse(train).await;
                }

                TrainRequest::ReverseStopped {
                    train,
                    restore_speed,
                } => {
                    self.handle_reverse_stopped(train, restore_speed).await;
                }

                TrainRequest::Shutdown { reply } => {
                    self.handle_shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    async fn handle_set_speed(&mut self, train: TrainId, speed: u8) {
        if self.speeds[train.index()] != speed {
            self.speeds[train.index()] = speed;
            let _ = self
                .io
                .cast(ControllerCommand::SetSpeed { train, speed })
                .await;
        }

        self.speed_changes.publish(TrainSpeed { train, speed });
    }

    async fn handle_reverse(&mut self, train: TrainId) {
        let old_speed = self.speeds[train.index()];

        // Stop first; the direction flips only once the train is at rest.
        self.speeds[train.index()] = 0;
        let _ = self
            .io
            .cast(ControllerCommand::SetSpeed { train, speed: 0 })
            .await;
        self.speed_changes.publish(TrainSpeed { train, speed: 0 });

        let delay = if old_speed == 0 {
            10
        } else {
            100 * (Ticks::from(old_speed) / 4 + 1)
        };
        self.schedule(WorkerJob {
            delay,
            request: TrainRequest::ReverseStopped {
                train,
                restore_speed: old_speed,
            },
        })
        .await;
    }

    async fn handle_reverse_stopped(&mut self, train: TrainId, restore_speed: u8) {
        let _ = self.io.cast(ControllerCommand::Reverse { train }).await;

        let direction = !self.directions[train.index()];
        self.directions[train.index()] = direction;
        debug!(%train, ?direction, "train reversed");
        self.direction_changes
            .publish(TrainDirection { train, direction });

        self.schedule(WorkerJob {
            delay: REVERSE_SETTLE_DELAY,
            request: TrainRequest::SetSpeed {
                train,
                speed: restore_speed,
            },
        })
        .await;
    }

    async fn handle_shutdown(&mut self) {
        info!("stopping all locomotives");
        for slot in 0..TRAIN_SLOTS {
            if self.speeds[slot] != 0 {
                let _ = self
                    .io
                    .cast(ControllerCommand::SetSpeed {
                        train: TrainId::new(slot as u8),
                        speed: 0,
                    })
                    .await;
            }
        }
        let _ = self.io.cast(ControllerCommand::Stop).await;
    }

    async fn schedule(&mut self, job: WorkerJob) {
        let worker = &self.workers[self.next_worker % self.workers.len()];
        self.next_worker += 1;
        let _ = worker.cast(job).await;
    }
}

/// Client handle to the train server.
#[derive(Debug, Clone)]
pub struct TrainsHandle {
    ep: Endpoint<TrainRequest>,
    speed_changes: Bus<TrainSpeed>,
    direction_changes: Bus<TrainDirection>,
}

impl TrainsHandle {
    pub async fn set_speed(&self, train: TrainId, speed: u8) -> Result<(), CommandError> {
        if !train.is_valid() {
            return Err(CommandError::TrainOutOfRange(train.get()));
        }
        if speed > MAX_SPEED {
            return Err(CommandError::SpeedOutOfRange(speed));
        }
        self.ep.cast(TrainRequest::SetSpeed { train, speed }).await?;
        Ok(())
    }

    pub async fn get_speed(&self, train: TrainId) -> Result<u8, CommandError> {
        if !train.is_valid() {
            return Err(CommandError::TrainOutOfRange(train.get()));
        }
        Ok(self
            .ep
            .call(|reply| TrainRequest::GetSpeed { train, reply })
            .await?)
    }

    pub async fn reverse(&self, train: TrainId) -> Result<(), CommandError> {
        if !train.is_valid() {
            return Err(CommandError::TrainOutOfRange(train.get()));
        }
        self.ep.cast(TrainRequest::Reverse { train }).await?;
        Ok(())
    }

    /// Stops every moving locomotive, then cuts controller power.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        self.ep.call(|reply| TrainRequest::Shutdown { reply }).await?;
        Ok(())
    }

    pub fn speed_changes(&self) -> Subscription<TrainSpeed> {
        self.speed_changes.subscribe()
    }

    pub fn direction_changes(&self) -> Subscription<TrainDirection> {
        self.direction_changes.subscribe()
    }
}
