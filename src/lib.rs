//! Host-side driver for the picoDAQ data-acquisition instrument.
//!
//! The instrument streams analog and digital samples over a serial link and
//! accepts a text command protocol interleaved with binary data frames. This
//! library contains the command link, the chunk planner, the streaming reader
//! and writer, and the [`Session`](session::Session) that lets several
//! logical streams share one physical connection.
//!
//! ```no_run
//! use picodaq::config::Settings;
//! use picodaq::registry::PortRegistry;
//! use picodaq::session::{Session, StreamSpec};
//!
//! # fn main() -> picodaq::error::AppResult<()> {
//! let settings = Settings::load()?;
//! let mut session = Session::serial("/dev/ttyACM0", PortRegistry::new(), settings);
//! let ai = session.open(StreamSpec::analog_in([0, 1]).with_rate(10_000))?;
//! let data = session.read_scans(ai, 1000)?;
//! println!("{} scans", data.scans());
//! session.close(ai)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod device_info;
pub mod error;
pub mod link;
pub mod params;
pub mod planner;
pub mod reader;
pub mod registry;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::Settings;
pub use device_info::{Calibration, DeviceInfo};
pub use error::{AppResult, DaqError};
pub use registry::{PortLease, PortRegistry};
pub use session::{
    AcquisitionMode, Fanout, HandleId, Polarity, ScanData, Session, SessionState, StreamHooks,
    StreamKind, StreamSpec, Trigger,
};
pub use writer::{OutputPayload, SampleSource};
