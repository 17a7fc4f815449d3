use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::StreamConnector;

/// Opens the controller's serial line.
///
/// The stock controller talks 2400 baud, 8 data bits, no parity, two
/// stop bits; the defaults here match, the builder is exposed for
/// anything exotic.
pub fn open(path: &str, baud: u32) -> tokio_serial::Result<StreamConnector<SerialStream>> {
    let stream = tokio_serial::new(path, baud)
        .stop_bits(tokio_serial::StopBits::Two)
        .open_native_async()?;
    Ok(StreamConnector::new(stream))
}
