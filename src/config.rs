//! Driver configuration using Figment
//!
//! Settings are assembled from, in increasing order of precedence:
//! 1. built-in defaults,
//! 2. a TOML file (`picodaq.toml` by default),
//! 3. environment variables prefixed with `PICODAQ_`.
//!
//! Nested keys use a double underscore in the environment:
//!
//! ```text
//! PICODAQ_PORT=/dev/ttyACM0
//! PICODAQ_LOG_LEVEL=debug
//! PICODAQ_LINK__READ_TIMEOUT_MS=50
//! PICODAQ_STREAMING__MIN_AHEAD_CHUNKS=4
//! ```
//!
//! # Example
//!
//! ```no_run
//! use picodaq::config::Settings;
//!
//! let settings = Settings::load_from("picodaq.toml")?;
//! println!("Read timeout: {:?}", settings.link.read_timeout());
//! # Ok::<(), picodaq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::planner::PlannerLimits;

/// Top-level driver configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Serial port of the device (e.g. "/dev/ttyACM0", "COM3")
    #[serde(default)]
    pub port: Option<String>,
    /// Logging level used by the command line tool (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Command link timing
    #[serde(default)]
    pub link: LinkSettings,
    /// Chunk geometry limits
    #[serde(default)]
    pub planner: PlannerSettings,
    /// Reader/writer behaviour
    #[serde(default)]
    pub streaming: StreamingSettings,
}

/// Timing of the command/feedback link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkSettings {
    /// Baud rate requested when opening the port (ignored by USB CDC devices)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Single read timeout; a read returning nothing within it counts as a
    /// quiet period
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Upper bound for waiting on a command's own feedback marker
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

/// Limits handed to the chunk planner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerSettings {
    /// Longest acquisition time a single chunk may cover
    #[serde(default = "default_max_chunk_duration")]
    pub max_chunk_duration_ms: u64,
    /// Largest chunk payload in bytes
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

/// Streaming reader/writer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingSettings {
    /// Lower bound on chunks kept buffered ahead on the device
    #[serde(default = "default_min_ahead_chunks")]
    pub min_ahead_chunks: usize,
    /// Default output lead time when a commit does not specify one
    #[serde(default)]
    pub max_ahead_ms: Option<u64>,
    /// How long `read_scans` keeps polling before giving up
    #[serde(default = "default_read_scans_timeout")]
    pub read_scans_timeout_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout() -> u64 {
    100
}

fn default_command_timeout() -> u64 {
    1000
}

fn default_max_chunk_duration() -> u64 {
    50
}

fn default_max_chunk_bytes() -> usize {
    4096
}

fn default_min_ahead_chunks() -> usize {
    2
}

fn default_read_scans_timeout() -> u64 {
    2000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            log_level: default_log_level(),
            link: LinkSettings::default(),
            planner: PlannerSettings::default(),
            streaming: StreamingSettings::default(),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_chunk_duration_ms: default_max_chunk_duration(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            min_ahead_chunks: default_min_ahead_chunks(),
            max_ahead_ms: None,
            read_scans_timeout_ms: default_read_scans_timeout(),
        }
    }
}

impl LinkSettings {
    /// Per-read timeout on the serial port.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Longest wait for a command's `+verb` reply.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl PlannerSettings {
    /// Planner limits derived from these settings
    pub fn limits(&self) -> PlannerLimits {
        PlannerLimits {
            max_chunk_duration: Duration::from_millis(self.max_chunk_duration_ms),
            max_chunk_bytes: self.max_chunk_bytes,
        }
    }
}

impl StreamingSettings {
    /// Cap on queued output, if configured.
    pub fn max_ahead(&self) -> Option<Duration> {
        self.max_ahead_ms.map(Duration::from_millis)
    }

    /// Deadline for one `read_scans` call.
    pub fn read_scans_timeout(&self) -> Duration {
        Duration::from_millis(self.read_scans_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load `picodaq.toml` from the working directory plus environment overrides
    pub fn load() -> AppResult<Self> {
        Self::load_from("picodaq.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment variables
    /// still apply. The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PICODAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Timeouts are non-zero
    /// - Chunk limits leave room for at least one scan
    /// - The ahead floor keeps at least one chunk queued
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.link.read_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "link.read_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.link.command_timeout_ms < self.link.read_timeout_ms {
            return Err(DaqError::Configuration(format!(
                "link.command_timeout_ms ({}) must not be shorter than link.read_timeout_ms ({})",
                self.link.command_timeout_ms, self.link.read_timeout_ms
            )));
        }

        if self.planner.max_chunk_duration_ms == 0 {
            return Err(DaqError::Configuration(
                "planner.max_chunk_duration_ms must be > 0".to_string(),
            ));
        }

        // 4 analog lanes plus one digital byte for a 2-scan granule
        if self.planner.max_chunk_bytes < 17 {
            return Err(DaqError::Configuration(format!(
                "planner.max_chunk_bytes {} is too small for a full scan group",
                self.planner.max_chunk_bytes
            )));
        }

        if self.streaming.min_ahead_chunks == 0 {
            return Err(DaqError::Configuration(
                "streaming.min_ahead_chunks must be > 0".to_string(),
            ));
        }

        if let Some(port) = &self.port {
            if port.is_empty() {
                return Err(DaqError::Configuration(
                    "'port' cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.link.read_timeout(), Duration::from_millis(100));
        assert_eq!(settings.streaming.min_ahead_chunks, 2);
    }

    #[test]
    fn test_invalid_log_level() {
        let settings = Settings {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn test_command_timeout_shorter_than_read_timeout() {
        let mut settings = Settings::default();
        settings.link.command_timeout_ms = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_planner_limits_conversion() {
        let limits = PlannerSettings::default().limits();
        assert_eq!(limits.max_chunk_duration, Duration::from_millis(50));
        assert_eq!(limits.max_chunk_bytes, 4096);
    }
}
