use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::oneshot;

use crate::general::{Ticks, TICK};

use super::bus::{Bus, Subscription};
use super::ipc::{self, Endpoint, Inbox, IpcError};

pub(crate) enum ClockRequest {
    /// One period of the hardware timer has elapsed.
    Tick,
    Time {
        reply: oneshot::Sender<Ticks>,
    },
    DelayUntil {
        deadline: Ticks,
        reply: oneshot::Sender<Ticks>,
    },
}

/// A sleeper parked until its deadline. Ties wake in request order.
struct Sleeper {
    deadline: Ticks,
    seq: u64,
    reply: oneshot::Sender<Ticks>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The tick clock server.
///
/// A driver task owns the periodic timer and feeds `Tick` requests into
/// the clock's inbox; the clock task increments the monotonic tick
/// counter, publishes it, and wakes any sleeper whose deadline passed.
pub struct Clock;

impl Clock {
    pub fn start() -> ClockHandle {
        let (ep, inbox) = ipc::channel(64);
        let ticks = Bus::new(64);

        tokio::spawn(Self::run(inbox, ticks.clone()));
        tokio::spawn(Self::drive(ep.clone()));

        ClockHandle { ep, ticks }
    }

    async fn drive(ep: Endpoint<ClockRequest>) {
        let start = tokio::time::Instant::now() + TICK;
        let mut timer = tokio::time::interval_at(start, TICK);
        loop {
            timer.tick().await;
            if ep.cast(ClockRequest::Tick).await.is_err() {
                break;
            }
        }
    }

    async fn run(mut inbox: Inbox<ClockRequest>, ticks: Bus<Ticks>) {
        let mut now: Ticks = 0;
        let mut next_seq: u64 = 0;
        let mut sleepers: BinaryHeap<Sleeper> = BinaryHeap::new();

        while let Some(request) = inbox.recv().await {
            match request {
                ClockRequest::Tick => {
                    now += 1;
                    ticks.publish(now);

                    while let Some(first) = sleepers.peek() {
                        if first.deadline > now {
                            break;
                        }
                        let sleeper = sleepers.pop().expect("peeked sleeper");
                        let _ = sleeper.reply.send(now);
                    }
                }

                ClockRequest::Time { reply } => {
                    let _ = reply.send(now);
                }

                ClockRequest::DelayUntil { deadline, reply } => {
                    if deadline <= now {
                        let _ = reply.send(now);
                    } else {
                        sleepers.push(Sleeper {
                            deadline,
                            seq: next_seq,
                            reply,
                        });
                        next_seq += 1;
                    }
                }
            }
        }
    }
}

/// Client handle to the clock server.
#[derive(Debug, Clone)]
pub struct ClockHandle {
    ep: Endpoint<ClockRequest>,
    ticks: Bus<Ticks>,
}

impl ClockHandle {
    /// Ticks elapsed since boot.
    pub async fn time(&self) -> Result<Ticks, IpcError> {
        self.ep.call(|reply| ClockRequest::Time { reply }).await
    }

    /// Sleeps for `ticks` ticks. Returns the time at wakeup.
    pub async fn delay(&self, ticks: Ticks) -> Result<Ticks, IpcError> {
        let now = self.time().await?;
        self.delay_until(now + ticks).await
    }

    /// Sleeps until `deadline`. A deadline at or before now returns
    /// immediately.
    pub async fn delay_until(&self, deadline: Ticks) -> Result<Ticks, IpcError> {
        self.ep
            .call(|reply| ClockRequest::DelayUntil { deadline, reply })
            .await
    }

    /// The raw tick stream.
    pub fn ticks(&self) -> Subscription<Ticks> {
        self.ticks.subscribe()
    }
}
