use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tracing::debug;

use crate::runtime::bus::{Bus, Subscription};
use crate::runtime::ipc::{self, Endpoint, Inbox};

use super::connectors::ControllerCommand;
use super::track::components::{
    switch_from_index, switch_to_index, SwitchDirection, SwitchTable, NUM_SWITCHES,
};
use super::CommandError;

pub const SWITCH_SERVER_NAME: &str = "switch";

pub(crate) enum SwitchRequest {
    SetDirection {
        sw: u16,
        direction: SwitchDirection,
        reply: oneshot::Sender<()>,
    },
    GetDirection {
        sw: u16,
        reply: oneshot::Sender<SwitchDirection>,
    },
}

/// Owns the turnouts: every solenoid write goes through here, and the
/// shared table always shows the last commanded state.
pub struct SwitchServer {
    io: Endpoint<ControllerCommand>,
    table: Arc<RwLock<SwitchTable>>,
    changes: Bus<u16>,
}

impl SwitchServer {
    pub fn start(io: Endpoint<ControllerCommand>) -> SwitchesHandle {
        let (ep, inbox) = ipc::channel(32);
        let table = Arc::new(RwLock::new(SwitchTable::default()));
        let changes = Bus::new(64);

        let server = SwitchServer {
            io,
            table: table.clone(),
            changes: changes.clone(),
        };
        tokio::spawn(server.run(inbox));

        SwitchesHandle { ep, table, changes }
    }

    async fn run(self, mut inbox: Inbox<SwitchRequest>) {
        // Sweep everything to a known state. The table already says
        // curved; make the hardware agree.
        for index in 0..NUM_SWITCHES {
            let _ = self
                .io
                .cast(ControllerCommand::SwitchThrow {
                    sw: switch_from_index(index),
                    direction: SwitchDirection::Curved,
                })
                .await;
        }
        // The solenoid burns out if it stays energised.
        let _ = self.io.cast(ControllerCommand::SolenoidOff).await;

        while let Some(request) = inbox.recv().await {
            match request {
                SwitchRequest::SetDirection {
                    sw,
                    direction,
                    reply,
                } => {
                    let _ = self
                        .io
                        .cast(ControllerCommand::SwitchThrow { sw, direction })
                        .await;
                    let _ = self.io.cast(ControllerCommand::SolenoidOff).await;

                    self.table
                        .write()
                        .expect("switch table lock poisoned")
                        .set(sw, direction);
                    let _ = reply.send(());

                    debug!(sw, ?direction, "switch thrown");
                    self.changes.publish(sw);
                }

                SwitchRequest::GetDirection { sw, reply } => {
                    let direction = self
                        .table
                        .read()
                        .expect("switch table lock poisoned")
                        .get(sw)
                        .unwrap_or(SwitchDirection::Curved);
                    let _ = reply.send(direction);
                }
            }
        }
    }
}

/// Client handle to the switch server.
#[derive(Debug, Clone)]
pub struct SwitchesHandle {
    ep: Endpoint<SwitchRequest>,
    table: Arc<RwLock<SwitchTable>>,
    changes: Bus<u16>,
}

impl SwitchesHandle {
    /// Throws `sw` and waits for the command to be issued.
    pub async fn set_direction(
        &self,
        sw: u16,
        direction: SwitchDirection,
    ) -> Result<(), CommandError> {
        if switch_to_index(sw).is_none() {
            return Err(CommandError::SwitchOutOfRange(sw));
        }
        self.ep
            .call(|reply| SwitchRequest::SetDirection {
                sw,
                direction,
                reply,
            })
            .await?;
        Ok(())
    }

    pub async fn direction(&self, sw: u16) -> Result<SwitchDirection, CommandError> {
        if switch_to_index(sw).is_none() {
            return Err(CommandError::SwitchOutOfRange(sw));
        }
        Ok(self
            .ep
            .call(|reply| SwitchRequest::GetDirection { sw, reply })
            .await?)
    }

    /// A consistent copy of every switch's commanded direction, for
    /// track walks.
    pub fn snapshot(&self) -> SwitchTable {
        *self.table.read().expect("switch table lock poisoned")
    }

    /// Switch numbers, as they are thrown.
    pub fn changes(&self) -> Subscription<u16> {
        self.changes.subscribe()
    }
}
