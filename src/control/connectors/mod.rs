use std::io;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, error};

use crate::general::TrainId;
use crate::runtime::bus::Bus;
use crate::runtime::ipc::{self, Endpoint, Inbox};

use super::track::components::SwitchDirection;

/// Connection to a physical railroad over a serial byte channel.
#[cfg(feature = "serial_connect")]
pub mod serial;

/// A sensor poll answers with one byte per half-module, five modules of
/// sixteen contacts.
pub const SENSOR_FRAME_LEN: usize = 10;
pub type SensorFrame = [u8; SENSOR_FRAME_LEN];

const COMMAND_GO: u8 = 0x60;
const COMMAND_STOP: u8 = 0x61;
const COMMAND_REVERSE: u8 = 0x0F;
const COMMAND_SOLENOID_OFF: u8 = 0x20;
const COMMAND_SWITCH_STRAIGHT: u8 = 0x21;
const COMMAND_SWITCH_CURVED: u8 = 0x22;
const COMMAND_POLL_SENSORS: u8 = 0x85;

/// Everything the control plane ever says to the track hardware.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControllerCommand {
    Go,
    Stop,
    SetSpeed { train: TrainId, speed: u8 },
    Reverse { train: TrainId },
    SwitchThrow { sw: u16, direction: SwitchDirection },
    SolenoidOff,
    PollSensors,
}

/// Encodes a command into controller bytes. Two-byte commands carry the
/// argument byte second.
pub fn encode(command: &ControllerCommand, buf: &mut BytesMut) {
    match command {
        ControllerCommand::Go => buf.put_u8(COMMAND_GO),
        ControllerCommand::Stop => buf.put_u8(COMMAND_STOP),
        ControllerCommand::SetSpeed { train, speed } => {
            buf.put_u8(*speed);
            buf.put_u8(train.get());
        }
        ControllerCommand::Reverse { train } => {
            buf.put_u8(COMMAND_REVERSE);
            buf.put_u8(train.get());
        }
        ControllerCommand::SwitchThrow { sw, direction } => {
            buf.put_u8(match direction {
                SwitchDirection::Straight => COMMAND_SWITCH_STRAIGHT,
                SwitchDirection::Curved => COMMAND_SWITCH_CURVED,
            });
            buf.put_u8(*sw as u8);
        }
        ControllerCommand::SolenoidOff => buf.put_u8(COMMAND_SOLENOID_OFF),
        ControllerCommand::PollSensors => buf.put_u8(COMMAND_POLL_SENSORS),
    }
}

/// The command half of a controller connection.
#[async_trait]
pub trait CommandSink: Send {
    async fn send(&mut self, command: ControllerCommand) -> io::Result<()>;
}

/// The sensor-reply half of a controller connection. Replies arrive only
/// in answer to a poll, so reading frames back to back stays aligned.
#[async_trait]
pub trait FrameSource: Send {
    async fn read_sensor_frame(&mut self) -> io::Result<SensorFrame>;
}

/// The hardware seam: one connection, split into its two directions so
/// an outstanding sensor reply never delays a train command.
pub trait Connector: Send {
    fn split(self: Box<Self>) -> (Box<dyn CommandSink>, Box<dyn FrameSource>);
}

/// A [`Connector`] over any async byte stream.
#[derive(Debug)]
pub struct StreamConnector<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> StreamConnector<S> {
    pub fn new(stream: S) -> Self {
        StreamConnector { stream }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connector for StreamConnector<S> {
    fn split(self: Box<Self>) -> (Box<dyn CommandSink>, Box<dyn FrameSource>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            Box::new(StreamCommands {
                write,
                buf: BytesMut::with_capacity(64),
            }),
            Box::new(StreamFrames { read }),
        )
    }
}

struct StreamCommands<S> {
    write: WriteHalf<S>,
    buf: BytesMut,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> CommandSink for StreamCommands<S> {
    async fn send(&mut self, command: ControllerCommand) -> io::Result<()> {
        self.buf.clear();
        encode(&command, &mut self.buf);
        self.write.write_all(&self.buf).await?;
        self.write.flush().await
    }
}

struct StreamFrames<S> {
    read: ReadHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> FrameSource for StreamFrames<S> {
    async fn read_sensor_frame(&mut self) -> io::Result<SensorFrame> {
        let mut frame = [0u8; SENSOR_FRAME_LEN];
        self.read.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

/// The byte-channel tasks. The writer owns the command direction: every
/// hardware write funnels through one inbox, in order. The reader pumps
/// sensor frames onto the frame bus as they arrive.
pub(crate) fn spawn_io_task(
    connector: Box<dyn Connector>,
    frames: Bus<SensorFrame>,
    capacity: usize,
) -> Endpoint<ControllerCommand> {
    let (mut sink, mut source) = connector.split();
    let (ep, mut inbox): (_, Inbox<ControllerCommand>) = ipc::channel(capacity);

    tokio::spawn(async move {
        while let Some(command) = inbox.recv().await {
            if let Err(err) = sink.send(command).await {
                error!(?command, %err, "controller write failed");
                continue;
            }
            debug!(?command, "controller write");
        }
    });

    tokio::spawn(async move {
        loop {
            match source.read_sensor_frame().await {
                Ok(frame) => frames.publish(frame),
                Err(err) => {
                    error!(%err, "sensor frame read failed");
                    break;
                }
            }
        }
    });

    ep
}


#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(command: ControllerCommand) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(&command, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn command_encodings() {
        assert_eq!(encoded(ControllerCommand::Go), vec![0x60]);
        assert_eq!(encoded(ControllerCommand::Stop), vec![0x61]);
        assert_eq!(encoded(ControllerCommand::SolenoidOff), vec![0x20]);
        assert_eq!(encoded(ControllerCommand::PollSensors), vec![0x85]);
        assert_eq!(
            encoded(ControllerCommand::SetSpeed {
                train: TrainId::new(58),
                speed: 10
            }),
            vec![10, 58]
        );
        assert_eq!(
            encoded(ControllerCommand::Reverse {
                train: TrainId::new(63)
            }),
            vec![0x0F, 63]
        );
        assert_eq!(
            encoded(ControllerCommand::SwitchThrow {
                sw: 153,
                direction: SwitchDirection::Curved
            }),
            vec![0x22, 153]
        );
        assert_eq!(
            encoded(ControllerCommand::SwitchThrow {
                sw: 7,
                direction: SwitchDirection::Straight
            }),
            vec![0x21, 7]
        );
    }

    #[tokio::test]
    async fn stream_connector_writes_and_reads_split() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let (mut sink, mut source) = Box::new(StreamConnector::new(ours)).split();

        sink.send(ControllerCommand::SetSpeed {
            train: TrainId::new(58),
            speed: 10,
        })
        .await
        .unwrap();

        let mut written = [0u8; 2];
        theirs.read_exact(&mut written).await.unwrap();
        assert_eq!(written, [10, 58]);

        let frame: SensorFrame = [0, 0x80, 0, 0, 0, 0, 0, 0, 0, 0];
        theirs.write_all(&frame).await.unwrap();
        assert_eq!(source.read_sensor_frame().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn io_task_publishes_frames_and_records_commands() {
        let (connector, probe) = testing::recording_connector();
        let frames = Bus::new(8);
        let mut sub = frames.subscribe();
        let io = spawn_io_task(Box::new(connector), frames, 8);

        io.cast(ControllerCommand::Go).await.unwrap();
        io.cast(ControllerCommand::PollSensors).await.unwrap();
        probe.push_frame([1; SENSOR_FRAME_LEN]);

        assert_eq!(sub.recv().await, Some([1; SENSOR_FRAME_LEN]));
        tokio::task::yield_now().await;
        assert_eq!(
            probe.sent(),
            vec![ControllerCommand::Go, ControllerCommand::PollSensors]
        );
    }

    #[tokio::test]
    async fn a_queued_sensor_reply_does_not_delay_commands() {
        let (connector, probe) = testing::recording_connector();
        let io = spawn_io_task(Box::new(connector), Bus::new(8), 8);

        // Poll with no reply scripted, then a train command behind it.
        io.cast(ControllerCommand::PollSensors).await.unwrap();
        io.cast(ControllerCommand::Stop).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            probe.sent(),
            vec![ControllerCommand::PollSensors, ControllerCommand::Stop]
        );
    }
}
