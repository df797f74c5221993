//! Serial port transport built on the `serialport` crate.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

use super::{Connector, Transport};
use crate::config::LinkSettings;
use crate::error::{AppResult, DaqError};

/// An open serial connection to the instrument
pub struct SerialTransport {
    port_name: String,
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate` with a short per-read timeout.
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> AppResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| {
                DaqError::Connection(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    port_name, baud_rate, e
                ))
            })?;
        // drop bytes left over from a previous session
        port.clear(ClearBuffer::All)?;

        debug!(port = %port_name, baud_rate, "Serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            port,
        })
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!(port = %self.port_name, "Serial port closed");
    }
}

/// Opens [`SerialTransport`]s with the configured link timing
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    /// Connector using the link settings.
    pub fn new(settings: &LinkSettings) -> Self {
        Self {
            baud_rate: settings.baud_rate,
            read_timeout: settings.read_timeout(),
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self, port: &str) -> AppResult<Box<dyn Transport>> {
        let transport = SerialTransport::open(port, self.baud_rate, self.read_timeout)?;
        Ok(Box::new(transport))
    }
}
