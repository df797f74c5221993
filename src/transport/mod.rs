//! Byte transports underneath the command link.
//!
//! A [`Transport`] is a blocking, bidirectional byte pipe whose reads wait at
//! most a short timeout. A read returning `Ok(0)` is a quiet period, which the
//! link uses to detect the end of unsolicited feedback. A [`Connector`] opens
//! transports by port name so the session can defer the physical open until
//! the first stream handle arrives.

use std::io;

use crate::error::AppResult;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::{MockConnector, MockDevice, StopReport};
#[cfg(feature = "instrument_serial")]
pub use serial::{SerialConnector, SerialTransport};

/// Blocking byte pipe to the instrument
pub trait Transport {
    /// Read whatever is available into `buf`, waiting at most the read
    /// timeout. `Ok(0)` means nothing arrived in time.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Push buffered writes to the device.
    fn flush(&mut self) -> io::Result<()>;

    /// Port name, used in log messages.
    fn name(&self) -> &str;
}

/// Opens transports by port name
pub trait Connector {
    /// Open `port`, failing with [`DaqError::Connection`](crate::DaqError::Connection)
    /// when no device answers there.
    fn connect(&self, port: &str) -> AppResult<Box<dyn Transport>>;
}
