//! Custom error types for the driver.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it gives one place where every failure of the
//! command link, the streaming engine and the session coordinator is named.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: no device, port already bound by another session, or an
//!   operation issued before any stream handle opened the session.
//! - **`Protocol`**: malformed device replies that cannot be interpreted. Bytes
//!   that merely fail to decode as text are logged and absorbed instead.
//! - **`Verification`**: the device rejected the current parameter set.
//! - **`Checksum`**: an uploaded wave buffer did not survive the trip intact.
//! - **`Stop`**: the device stopped on its own for a reason other than a
//!   completed episode run. Carries the first reason the device reported.
//! - **`Timeout`**: no data arrived within the caller's window. Not fatal by
//!   itself; the session stays usable.
//! - **`Configuration`** / **`Config`**: semantic and loading errors of the
//!   settings and of the requested acquisition setup.
//!
//! There are no automatic retries anywhere: every variant propagates to the
//! caller of the operation that triggered it.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the driver
#[derive(Error, Debug)]
pub enum DaqError {
    /// The port could not be opened or is already in use
    #[error("Connection error: {0}")]
    Connection(String),

    /// The device sent something the host cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device rejected the parameter set
    #[error("Unsupported parameters: {0}")]
    Verification(String),

    /// An uploaded wave did not arrive intact
    #[error("Checksum failed: host computed {expected}, device reported {reported}")]
    Checksum {
        /// Checksum of the samples the host sent
        expected: u32,
        /// Checksum the device echoed
        reported: String,
    },

    /// The device stopped the acquisition with an error
    #[error("Stopped with error: {0}")]
    Stop(String),

    /// Data or a reply did not arrive in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A request or setting is invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port failure
    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether the session can keep going after this error.
    ///
    /// Only timeouts and absorbed protocol hiccups qualify; everything else
    /// leaves the acquisition in a state the caller has to tear down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::Timeout(_) | DaqError::Protocol(_))
    }
}
