//! Session coordinator: one physical connection shared by stream handles.
//!
//! A [`Session`] owns the port, the command link and, while an acquisition
//! runs, the [`StreamReader`] and [`StreamWriter`]. Logical stream handles
//! (analog/digital, input/output) are opened on it and share its sampling
//! rate, trigger and acquisition mode.
//!
//! # Lifecycle
//!
//! ```text
//! Closed --open--> Open --start--> Running --stop--> Open --close(last)--> Closed
//! ```
//!
//! The connection exists from the first `open` until the last handle closes.
//! Start, stop and commit are broadcast to every open handle exactly once, in
//! open order, through optional [`StreamHooks`]. Hooks receive a [`Fanout`]
//! context rather than the session, so a hook asking for the operation that
//! is already being broadcast simply joins it.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{checksum, decode_mask, make_mask, samples_to_le_bytes, validate_channels, validate_digital_lines};
use crate::config::Settings;
use crate::device_info::{self, Calibration, DeviceInfo};
use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;
use crate::params::ParamValue;
use crate::planner::ChunkPlanner;
use crate::reader::{DataKind, FrameLayout, ReadOutcome, ScanBlock, StreamReader};
use crate::registry::{PortLease, PortRegistry};
use crate::transport::Connector;
use crate::writer::{ahead_chunks_with_floor, OutputPayload, StreamWriter};

/// Kind of logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Analog input channels
    AnalogIn,
    /// Analog output channels
    AnalogOut,
    /// Digital input lines
    DigitalIn,
    /// Digital output lines
    DigitalOut,
}

impl StreamKind {
    /// Whether the stream delivers data to the host.
    pub fn is_input(self) -> bool {
        matches!(self, StreamKind::AnalogIn | StreamKind::DigitalIn)
    }

    /// Whether the stream carries digital lines.
    pub fn is_digital(self) -> bool {
        matches!(self, StreamKind::DigitalIn | StreamKind::DigitalOut)
    }

    fn data_kind(self) -> DataKind {
        if self.is_digital() {
            DataKind::Digital
        } else {
            DataKind::Analog
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::AnalogIn => "analog input",
            StreamKind::AnalogOut => "analog output",
            StreamKind::DigitalIn => "digital input",
            StreamKind::DigitalOut => "digital output",
        };
        f.write_str(name)
    }
}

/// What a stream handle asks for when it opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Stream direction and signal type
    pub kind: StreamKind,
    /// Channel (analog) or line (digital) indices, in the order the caller
    /// wants data columns returned
    pub channels: Vec<u8>,
    /// Sampling rate; every handle on a session must agree
    pub rate_hz: Option<u32>,
}

impl StreamSpec {
    /// Request for `kind` on `channels`, with no rate.
    pub fn new(kind: StreamKind, channels: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            channels: channels.into(),
            rate_hz: None,
        }
    }

    /// Analog input on `channels`.
    pub fn analog_in(channels: impl Into<Vec<u8>>) -> Self {
        Self::new(StreamKind::AnalogIn, channels)
    }

    /// Analog output on `channels`.
    pub fn analog_out(channels: impl Into<Vec<u8>>) -> Self {
        Self::new(StreamKind::AnalogOut, channels)
    }

    /// Digital input on `lines`.
    pub fn digital_in(lines: impl Into<Vec<u8>>) -> Self {
        Self::new(StreamKind::DigitalIn, lines)
    }

    /// Digital output on `lines`.
    pub fn digital_out(lines: impl Into<Vec<u8>>) -> Self {
        Self::new(StreamKind::DigitalOut, lines)
    }

    /// Set the sampling rate.
    pub fn with_rate(mut self, rate_hz: u32) -> Self {
        self.rate_hz = Some(rate_hz);
        self
    }
}

/// Identifies an open stream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Edge that arms a triggered start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Low to high
    Rising,
    /// High to low
    Falling,
}

impl Polarity {
    fn sign(self) -> i8 {
        match self {
            Polarity::Rising => 1,
            Polarity::Falling => -1,
        }
    }
}

/// How the acquisition begins after `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    /// Start as soon as `start` is issued
    #[default]
    Immediate,
    /// Wait for an edge on a digital input line
    Edge {
        /// Digital input line watched for the edge
        source: u8,
        /// Edge direction
        polarity: Polarity,
    },
}

/// Continuous streaming or repeated fixed-length episodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionMode {
    /// Stream until stopped
    #[default]
    Continuous,
    /// Fixed-length episodes
    Episodic {
        /// Length of each episode; rounded up to whole chunks
        duration: Duration,
        /// Start-to-start interval; with a trigger, the minimum interval
        period: Option<Duration>,
        /// Episodes before the device stops by itself
        count: Option<u32>,
    },
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Closed,
    /// Connected, not acquiring
    Open,
    /// Acquisition in progress
    Running,
}

/// Decoded input scans for one handle, one column per requested channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanData {
    /// Analog samples
    Analog {
        /// Channel of each column
        channels: Vec<u8>,
        /// One sample column per channel
        columns: Vec<Vec<i16>>,
    },
    /// Digital levels
    Digital {
        /// Line of each column
        lines: Vec<u8>,
        /// One 0/1 column per line
        columns: Vec<Vec<u8>>,
    },
}

impl ScanData {
    /// Number of scans in the block.
    pub fn scans(&self) -> usize {
        match self {
            ScanData::Analog { columns, .. } => columns.first().map_or(0, Vec::len),
            ScanData::Digital { columns, .. } => columns.first().map_or(0, Vec::len),
        }
    }

    /// Samples of analog `channel`, if this block carries it.
    pub fn analog(&self, channel: u8) -> Option<&[i16]> {
        match self {
            ScanData::Analog { channels, columns } => channels
                .iter()
                .position(|&c| c == channel)
                .map(|i| columns[i].as_slice()),
            ScanData::Digital { .. } => None,
        }
    }

    /// Levels of digital `line`, if this block carries it.
    pub fn digital(&self, line: u8) -> Option<&[u8]> {
        match self {
            ScanData::Digital { lines, columns } => lines
                .iter()
                .position(|&l| l == line)
                .map(|i| columns[i].as_slice()),
            ScanData::Analog { .. } => None,
        }
    }

    fn append(&mut self, other: ScanData) {
        match (self, other) {
            (ScanData::Analog { columns, .. }, ScanData::Analog { columns: more, .. }) => {
                for (column, extra) in columns.iter_mut().zip(more) {
                    column.extend(extra);
                }
            }
            (ScanData::Digital { columns, .. }, ScanData::Digital { columns: more, .. }) => {
                for (column, extra) in columns.iter_mut().zip(more) {
                    column.extend(extra);
                }
            }
            _ => {}
        }
    }

    fn from_block(channels: &[u8], mask: u8, block: ScanBlock) -> Self {
        let lanes = decode_mask(mask);
        let column_of = |ch: u8| lanes.iter().position(|&lane| lane == ch);
        match block {
            ScanBlock::Analog { lanes: width, samples } => {
                let (channels, columns) = channels
                    .iter()
                    .filter_map(|&ch| {
                        let lane = column_of(ch)?;
                        let column = samples.iter().skip(lane).step_by(width.max(1)).copied().collect();
                        Some((ch, column))
                    })
                    .unzip();
                ScanData::Analog { channels, columns }
            }
            ScanBlock::Digital { lines: width, levels } => {
                let (lines, columns) = channels
                    .iter()
                    .filter_map(|&line| {
                        let lane = column_of(line)?;
                        let column = levels.iter().skip(lane).step_by(width.max(1)).copied().collect();
                        Some((line, column))
                    })
                    .unzip();
                ScanData::Digital { lines, columns }
            }
        }
    }
}

/// Callbacks a stream handle receives during broadcasts
///
/// Every method has a no-op default.
pub trait StreamHooks {
    /// Called once per start broadcast.
    fn on_start(&mut self, _fanout: &mut Fanout<'_>) -> AppResult<()> {
        Ok(())
    }

    /// Called once per stop broadcast.
    fn on_stop(&mut self, _fanout: &mut Fanout<'_>) -> AppResult<()> {
        Ok(())
    }

    /// Called once per commit broadcast.
    fn on_commit(&mut self, _fanout: &mut Fanout<'_>) -> AppResult<()> {
        Ok(())
    }
}

/// Operation being broadcast to the handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Starting the acquisition
    Start,
    /// Stopping the acquisition
    Stop,
    /// Committing output
    Commit,
}

#[derive(Default)]
struct FanoutRequests {
    start: bool,
    stop: bool,
    commit: bool,
    staged: Vec<(HandleId, OutputPayload)>,
}

/// What a hook may do while a broadcast is in progress
///
/// Requests are recorded and acted on after every handle was visited. A
/// request for the phase being broadcast joins it. A commit requested during
/// start runs before the device starts. Other requests are ignored.
pub struct Fanout<'a> {
    handle: HandleId,
    phase: Phase,
    requests: &'a mut FanoutRequests,
}

impl Fanout<'_> {
    /// The handle whose hook is running.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// The operation being broadcast.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Ask for the acquisition to start.
    pub fn request_start(&mut self) {
        self.requests.start = true;
    }

    /// Ask for the acquisition to stop.
    pub fn request_stop(&mut self) {
        self.requests.stop = true;
    }

    /// Ask for staged output to be committed.
    pub fn request_commit(&mut self) {
        self.requests.commit = true;
    }

    /// Stage output for this handle, merged at the next commit.
    pub fn stage_output(&mut self, payload: OutputPayload) {
        self.requests.staged.push((self.handle, payload));
    }
}

struct HandleEntry {
    id: HandleId,
    spec: StreamSpec,
    hooks: Option<Box<dyn StreamHooks>>,
    staged: Option<OutputPayload>,
    delivered: usize,
}

/// Acquisition parameters pushed to the device on every change
#[derive(Debug, Clone, Default)]
struct AcquisitionParams {
    rate_hz: Option<u32>,
    aimask: u8,
    dimask: u8,
    mode: AcquisitionMode,
    trigger: Trigger,
}

struct Connection {
    link: CommandLink,
    _lease: PortLease,
    reader: Option<StreamReader>,
    writer: Option<StreamWriter>,
    nscans: Option<usize>,
    input_masks: (u8, u8),
    expecting_stop: bool,
}

fn not_open() -> DaqError {
    DaqError::Connection("Not open".to_string())
}

/// Scans in one episode of `duration` at `rate_hz`, rounded up.
fn scans_in(duration: Duration, rate_hz: u32) -> usize {
    (duration.as_micros() * u128::from(rate_hz)).div_ceil(1_000_000) as usize
}

/// Coordinator of all streams on one device port
pub struct Session {
    port: String,
    connector: Box<dyn Connector>,
    registry: PortRegistry,
    settings: Settings,
    conn: Option<Connection>,
    handles: Vec<HandleEntry>,
    next_handle: u64,
    params: AcquisitionParams,
    max_ahead: Option<Duration>,
    identity: Option<(DeviceInfo, Calibration)>,
}

impl Session {
    /// Session for `port`. Nothing is opened until the first handle arrives.
    pub fn new(
        port: impl Into<String>,
        connector: impl Connector + 'static,
        registry: PortRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            port: port.into(),
            connector: Box::new(connector),
            registry,
            settings,
            conn: None,
            handles: Vec::new(),
            next_handle: 1,
            params: AcquisitionParams::default(),
            max_ahead: None,
            identity: None,
        }
    }

    /// Session on a serial port with the given settings.
    #[cfg(feature = "instrument_serial")]
    pub fn serial(port: impl Into<String>, registry: PortRegistry, settings: Settings) -> Self {
        let connector = crate::transport::SerialConnector::new(&settings.link);
        Self::new(port, connector, registry, settings)
    }

    /// Port this session talks to.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Settings in effect.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match &self.conn {
            None => SessionState::Closed,
            Some(conn) if conn.reader.as_ref().is_some_and(StreamReader::is_active) => {
                SessionState::Running
            }
            Some(_) => SessionState::Open,
        }
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Whether an acquisition is running.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Open handles in open order.
    pub fn handles(&self) -> Vec<HandleId> {
        self.handles.iter().map(|h| h.id).collect()
    }

    /// Sampling rate shared by every stream.
    pub fn rate_hz(&self) -> Option<u32> {
        self.params.rate_hz
    }

    /// Mask of the analog inputs in use.
    pub fn aimask(&self) -> u8 {
        self.params.aimask
    }

    /// Mask of the digital inputs in use.
    pub fn dimask(&self) -> u8 {
        self.params.dimask
    }

    /// Scans per input chunk as confirmed by the device.
    pub fn nscans(&self) -> Option<usize> {
        self.conn.as_ref().and_then(|c| c.nscans)
    }

    /// Last cached device value for `key`.
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.conn.as_ref().and_then(|c| c.link.params().get(key))
    }

    /// Output chunks currently believed queued on the device.
    pub fn output_ahead(&self) -> Option<usize> {
        self.conn
            .as_ref()
            .and_then(|c| c.writer.as_ref())
            .map(StreamWriter::ahead)
    }

    /// Ahead limit of the active writer.
    pub fn output_ahead_limit(&self) -> Option<usize> {
        self.conn
            .as_ref()
            .and_then(|c| c.writer.as_ref())
            .map(StreamWriter::ahead_limit)
    }

    /// Status byte of the latest input frame.
    pub fn device_status(&self) -> Option<u8> {
        self.conn
            .as_ref()
            .and_then(|c| c.reader.as_ref())
            .and_then(StreamReader::status)
    }

    /// Scans delivered to `handle` so far.
    pub fn delivered(&self, handle: HandleId) -> Option<usize> {
        self.entry(handle).ok().map(|e| e.delivered)
    }

    fn entry(&self, handle: HandleId) -> AppResult<&HandleEntry> {
        self.handles
            .iter()
            .find(|h| h.id == handle)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown stream handle {}", handle)))
    }

    fn entry_mut(&mut self, handle: HandleId) -> AppResult<&mut HandleEntry> {
        self.handles
            .iter_mut()
            .find(|h| h.id == handle)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown stream handle {}", handle)))
    }

    fn conn_mut(&mut self) -> AppResult<&mut Connection> {
        self.conn.as_mut().ok_or_else(not_open)
    }

    // ------------------------------------------------------------------
    // Opening and closing
    // ------------------------------------------------------------------

    /// Open a stream handle without hooks.
    pub fn open(&mut self, spec: StreamSpec) -> AppResult<HandleId> {
        self.open_inner(spec, None)
    }

    /// Open a stream handle that takes part in start/stop/commit broadcasts.
    pub fn open_with_hooks(
        &mut self,
        spec: StreamSpec,
        hooks: impl StreamHooks + 'static,
    ) -> AppResult<HandleId> {
        self.open_inner(spec, Some(Box::new(hooks)))
    }

    fn open_inner(
        &mut self,
        spec: StreamSpec,
        hooks: Option<Box<dyn StreamHooks>>,
    ) -> AppResult<HandleId> {
        if spec.kind.is_digital() {
            let mut sorted = spec.channels.clone();
            sorted.sort_unstable();
            validate_digital_lines(&sorted)?;
        } else {
            validate_channels(&spec.channels)?;
        }
        if self.handles.iter().any(|h| h.spec.kind == spec.kind) {
            return Err(DaqError::Configuration(format!(
                "A {} stream is already open on {}",
                spec.kind, self.port
            )));
        }
        if let (Some(requested), Some(current)) = (spec.rate_hz, self.params.rate_hz) {
            if requested != current && !self.handles.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Sampling rate {} Hz conflicts with {} Hz used by the open streams",
                    requested, current
                )));
            }
        }
        if self.is_running() {
            return Err(DaqError::Configuration(
                "Cannot open a stream while acquisition is running".to_string(),
            ));
        }

        if self.conn.is_none() {
            self.connect()?;
        }

        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        if let Some(rate) = spec.rate_hz {
            self.params.rate_hz = Some(rate);
        }
        match spec.kind {
            StreamKind::AnalogIn => self.params.aimask = make_mask(spec.channels.iter().copied()),
            StreamKind::DigitalIn => self.params.dimask = make_mask(spec.channels.iter().copied()),
            StreamKind::AnalogOut | StreamKind::DigitalOut => {}
        }
        info!(port = %self.port, handle = %id, kind = %spec.kind, channels = ?spec.channels, "Stream opened");
        self.handles.push(HandleEntry {
            id,
            spec,
            hooks,
            staged: None,
            delivered: 0,
        });

        if self.params.rate_hz.is_some() {
            if let Err(e) = self.push_parameters() {
                if let Err(close_err) = self.close(id) {
                    warn!(handle = %id, error = %close_err, "Failed to close stream after setup error");
                }
                return Err(e);
            }
        }
        Ok(id)
    }

    fn connect(&mut self) -> AppResult<()> {
        let lease = self.registry.claim(&self.port)?;
        let transport = self.connector.connect(&self.port)?;
        let link = CommandLink::new(transport, &self.settings.link);
        info!(port = %self.port, "Connected to picoDAQ");
        self.conn = Some(Connection {
            link,
            _lease: lease,
            reader: None,
            writer: None,
            nscans: None,
            input_masks: (0, 0),
            expecting_stop: false,
        });
        Ok(())
    }

    /// Close a handle.
    ///
    /// The acquisition is always stopped first. When the last handle goes,
    /// the port is released and every acquisition parameter returns to its
    /// default; otherwise the remaining handles' parameters are pushed again.
    pub fn close(&mut self, handle: HandleId) -> AppResult<()> {
        let stopped = self.stop();

        let Some(pos) = self.handles.iter().position(|h| h.id == handle) else {
            return stopped;
        };
        let entry = self.handles.remove(pos);
        match entry.spec.kind {
            StreamKind::AnalogIn => self.params.aimask = 0,
            StreamKind::DigitalIn => self.params.dimask = 0,
            StreamKind::AnalogOut | StreamKind::DigitalOut => {}
        }
        info!(port = %self.port, handle = %handle, "Stream closed");

        if self.handles.is_empty() {
            if let Some(conn) = self.conn.take() {
                drop(conn);
                info!(port = %self.port, "Connection closed");
            }
            self.params = AcquisitionParams::default();
            self.max_ahead = None;
            self.identity = None;
            return stopped;
        }

        let pushed = if self.params.rate_hz.is_some() && self.conn.is_some() {
            self.push_parameters()
        } else {
            Ok(())
        };
        stopped.and(pushed)
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Send a command, then run the stop handler if the device reported a
    /// stop in the feedback stream.
    fn send(&mut self, text: &str) -> AppResult<Vec<String>> {
        let conn = self.conn_mut()?;
        let lines = conn.link.command(text, true)?;
        if conn.link.take_stop_event() {
            self.handle_device_stop()?;
        }
        Ok(lines)
    }

    fn confirmed(&self, key: &str) -> AppResult<usize> {
        self.param(key)
            .and_then(ParamValue::as_int)
            .and_then(|v| usize::try_from(v).ok())
            .filter(|&v| v > 0)
            .ok_or_else(|| DaqError::Protocol(format!("Device did not confirm '{}'", key)))
    }

    fn push_parameters(&mut self) -> AppResult<()> {
        let params = self.params.clone();
        let rate = params.rate_hz.ok_or_else(|| {
            DaqError::Configuration("Sampling rate not set".to_string())
        })?;
        debug!(port = %self.port, ?params, "Pushing acquisition parameters");

        self.send(&format!("rate {}", rate))?;
        self.send(&format!("aimask {}", params.aimask))?;
        self.send(&format!("dimask {}", params.dimask))?;
        match params.trigger {
            Trigger::Immediate => self.send("immediate")?,
            Trigger::Edge { source, polarity } => {
                self.send(&format!("trigger {} {}", source, polarity.sign()))?
            }
        };

        let planner =
            ChunkPlanner::new(params.aimask, params.dimask, rate, self.settings.planner.limits())?;
        let nscans = match params.mode {
            AcquisitionMode::Continuous => {
                self.send("nchunks 0")?;
                self.send(&format!("nscans {}", planner.best_for_continuous()))?;
                self.confirmed("nscans")?
            }
            AcquisitionMode::Episodic {
                duration,
                period,
                count,
            } => {
                let scans_per_episode = scans_in(duration, rate);
                let plan = planner.best_for_episodic(scans_per_episode);
                self.send(&format!("nscans {}", plan.nscans))?;
                let nscans = self.confirmed("nscans")?;
                self.send(&format!("nchunks {}", scans_per_episode.div_ceil(nscans)))?;
                let period_ms = period.map_or(0, |p| (p.as_micros() + 500) / 1000);
                self.send(&format!("period {}", period_ms))?;
                self.send(&format!("nepis {}", count.unwrap_or(0)))?;
                nscans
            }
        };

        let conn = self.conn_mut()?;
        conn.nscans = Some(nscans);
        conn.link.params_mut().remove("verify");
        Ok(())
    }

    fn reconfigure(&mut self) -> AppResult<()> {
        if self.conn.is_some() && self.params.rate_hz.is_some() {
            self.push_parameters()?;
        }
        Ok(())
    }

    fn ensure_idle(&self) -> AppResult<()> {
        if self.is_running() {
            return Err(DaqError::Configuration(
                "Cannot change parameters while acquisition is running".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the sampling rate shared by every stream.
    pub fn set_rate(&mut self, rate_hz: u32) -> AppResult<()> {
        self.ensure_idle()?;
        if rate_hz == 0 {
            return Err(DaqError::Configuration(
                "Sampling rate must be > 0".to_string(),
            ));
        }
        self.params.rate_hz = Some(rate_hz);
        self.reconfigure()
    }

    /// Select the analog input channels directly.
    pub fn set_analog_inputs(&mut self, channels: &[u8]) -> AppResult<()> {
        self.ensure_idle()?;
        validate_channels(channels)?;
        self.params.aimask = make_mask(channels.iter().copied());
        self.reconfigure()
    }

    /// Select the digital input lines directly.
    pub fn set_digital_inputs(&mut self, lines: &[u8]) -> AppResult<()> {
        self.ensure_idle()?;
        validate_digital_lines(lines)?;
        self.params.dimask = make_mask(lines.iter().copied());
        self.reconfigure()
    }

    /// Record in episodes of `duration`, optionally every `period`, and
    /// stop by itself after `count` episodes.
    pub fn set_episodic(
        &mut self,
        duration: Duration,
        period: Option<Duration>,
        count: Option<u32>,
    ) -> AppResult<()> {
        self.ensure_idle()?;
        if duration.is_zero() {
            return Err(DaqError::Configuration(
                "Episode duration must be > 0".to_string(),
            ));
        }
        self.params.mode = AcquisitionMode::Episodic {
            duration,
            period,
            count,
        };
        self.reconfigure()
    }

    /// Stream until stopped instead of in episodes.
    pub fn set_continuous(&mut self) -> AppResult<()> {
        self.ensure_idle()?;
        self.params.mode = AcquisitionMode::Continuous;
        self.reconfigure()
    }

    /// Wait for an edge on digital line `source` before acquiring.
    pub fn set_trigger(&mut self, source: u8, polarity: Polarity) -> AppResult<()> {
        self.ensure_idle()?;
        if source > 3 {
            return Err(DaqError::Configuration(format!(
                "Unsupported trigger source {}",
                source
            )));
        }
        self.params.trigger = Trigger::Edge { source, polarity };
        self.reconfigure()
    }

    /// Start without waiting for a trigger.
    pub fn set_immediate(&mut self) -> AppResult<()> {
        self.ensure_idle()?;
        self.params.trigger = Trigger::Immediate;
        self.reconfigure()
    }

    /// Current acquisition mode.
    pub fn mode(&self) -> AcquisitionMode {
        self.params.mode
    }

    /// Current start trigger.
    pub fn trigger(&self) -> Trigger {
        self.params.trigger
    }

    /// Ask the device whether the current parameter set is acceptable.
    ///
    /// Reuses the cached answer unless `force` is set or a parameter changed
    /// since the last check. Fails with [`DaqError::Configuration`] while
    /// the acquisition runs.
    pub fn verify(&mut self, force: bool) -> AppResult<bool> {
        let cached = self.conn_mut()?.link.params().contains("verify");
        if self.is_running() {
            return Err(DaqError::Configuration(
                "Cannot verify parameters while acquisition is running".to_string(),
            ));
        }
        if force || !cached {
            self.send("verify")?;
        }
        Ok(self
            .conn
            .as_ref()
            .is_some_and(|c| c.link.params().is_text("verify", "ok")))
    }

    // ------------------------------------------------------------------
    // Broadcasts
    // ------------------------------------------------------------------

    fn broadcast(&mut self, phase: Phase) -> AppResult<FanoutRequests> {
        let order: Vec<HandleId> = self.handles.iter().map(|h| h.id).collect();
        let mut requests = FanoutRequests::default();
        for id in order {
            let Some(entry) = self.handles.iter_mut().find(|h| h.id == id) else {
                continue;
            };
            let Some(mut hooks) = entry.hooks.take() else {
                continue;
            };
            let mut fanout = Fanout {
                handle: id,
                phase,
                requests: &mut requests,
            };
            let result = match phase {
                Phase::Start => hooks.on_start(&mut fanout),
                Phase::Stop => hooks.on_stop(&mut fanout),
                Phase::Commit => hooks.on_commit(&mut fanout),
            };
            entry.hooks = Some(hooks);
            result?;
        }
        for (id, payload) in std::mem::take(&mut requests.staged) {
            self.stage_output(id, payload)?;
        }
        debug!(?phase, handles = self.handles.len(), "Broadcast complete");
        Ok(requests)
    }

    /// Start the acquisition on every stream at once.
    ///
    /// Broadcasts start to the handles (running any commit they request),
    /// verifies the parameter set, issues `start` and creates the reader.
    /// A no-op while already running.
    pub fn start(&mut self) -> AppResult<()> {
        let conn = self.conn_mut()?;
        if let Some(reader) = &conn.reader {
            if reader.is_active() {
                return Ok(());
            }
            conn.reader = None;
        }
        let rate = self.params.rate_hz.ok_or_else(|| {
            DaqError::Configuration("Sampling rate not set".to_string())
        })?;

        let requests = self.broadcast(Phase::Start)?;
        if requests.stop {
            debug!("Stop requested during start ignored");
        }
        let staged = self.handles.iter().any(|h| h.staged.is_some());
        if requests.commit || staged {
            self.commit_staged()?;
        }

        if !self.verify(false)? {
            let conn = self.conn_mut()?;
            error!(port = %conn.link.port_name(), "Unsupported parameters:");
            for (key, value) in conn.link.params().iter() {
                error!("  {}: {}", key, value);
            }
            let reason = conn
                .link
                .errors()
                .first()
                .cloned()
                .unwrap_or_else(|| "device rejected the parameter set".to_string());
            return Err(DaqError::Verification(reason));
        }

        self.send("start")?;
        let nscans = match self.nscans() {
            Some(n) => n,
            None => self.confirmed("nscans")?,
        };
        let (aimask, dimask) = (self.params.aimask, self.params.dimask);
        let layout = FrameLayout::new(aimask, dimask, nscans)?;
        let drain_timeout = self.settings.link.command_timeout();
        let conn = self.conn_mut()?;
        conn.reader = Some(StreamReader::new(layout, drain_timeout));
        conn.input_masks = (aimask, dimask);
        conn.expecting_stop = false;
        info!(port = %self.port, rate_hz = rate, nscans, aimask, dimask, "Acquisition started");
        Ok(())
    }

    /// Stop the acquisition on every stream.
    ///
    /// Blocks until the device confirms. Output queued on the device is
    /// discarded.
    pub fn stop(&mut self) -> AppResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        let requests = self.broadcast(Phase::Stop)?;
        if requests.start || requests.commit {
            debug!("Requests during stop ignored");
        }

        let conn = self.conn_mut()?;
        conn.writer = None;
        if let Some(mut reader) = conn.reader.take() {
            conn.expecting_stop = true;
            reader.close(&mut conn.link)?;
            conn.link.command("nop", true)?;
            conn.link.take_stop_event();
            conn.expecting_stop = false;
            info!(port = %self.port, chunks = reader.chunks_read(), "Acquisition stopped");
        }
        Ok(())
    }

    /// Stage output on `handle` for the next commit.
    pub fn stage_output(&mut self, handle: HandleId, payload: OutputPayload) -> AppResult<()> {
        let entry = self.entry_mut(handle)?;
        let allowed: &[u8] = &entry.spec.channels;
        let (claimed, foreign): (Vec<u8>, bool) = match entry.spec.kind {
            StreamKind::AnalogOut => (
                payload.analog.keys().copied().collect(),
                !payload.digital.is_empty(),
            ),
            StreamKind::DigitalOut => (
                payload.digital.keys().copied().collect(),
                !payload.analog.is_empty(),
            ),
            StreamKind::AnalogIn | StreamKind::DigitalIn => {
                return Err(DaqError::Configuration(format!(
                    "Stream {} is an input and cannot carry output",
                    handle
                )));
            }
        };
        if foreign || claimed.iter().any(|ch| !allowed.contains(ch)) {
            return Err(DaqError::Configuration(format!(
                "Output for channels {:?} does not belong to stream {}",
                claimed, handle
            )));
        }
        match &mut entry.staged {
            Some(staged) => staged.merge(payload)?,
            None => entry.staged = Some(payload),
        }
        Ok(())
    }

    /// Set up output generation from every handle's staged data.
    ///
    /// `payload` is staged on `caller` first; the commit is then broadcast
    /// so sibling handles can stage theirs. All staged data is merged into
    /// one writer and up to the ahead limit of chunks is sent before the
    /// acquisition starts. `max_ahead` bounds how much output is queued on
    /// the device, as a lead time.
    pub fn commit(
        &mut self,
        caller: HandleId,
        payload: OutputPayload,
        max_ahead: Option<Duration>,
    ) -> AppResult<()> {
        if self.conn.is_none() {
            return Err(not_open());
        }
        if max_ahead.is_some() {
            self.max_ahead = max_ahead;
        }
        if !payload.is_empty() {
            self.stage_output(caller, payload)?;
        }
        self.commit_staged()
    }

    fn commit_staged(&mut self) -> AppResult<()> {
        if self.is_running() {
            return Err(DaqError::Configuration(
                "Cannot commit output while acquisition is running".to_string(),
            ));
        }
        let requests = self.broadcast(Phase::Commit)?;
        if requests.start || requests.stop {
            debug!("Requests during commit ignored");
        }

        let mut merged = OutputPayload::new();
        for entry in &mut self.handles {
            if let Some(staged) = entry.staged.take() {
                merged.merge(staged)?;
            }
        }
        if merged.is_empty() {
            debug!("Commit without output data");
            return Ok(());
        }

        let rate = self.params.rate_hz.ok_or_else(|| {
            DaqError::Configuration("Sampling rate not set".to_string())
        })?;
        let (aomask, domask) = (merged.aomask(), merged.domask());
        let planner = ChunkPlanner::new(aomask, domask, rate, self.settings.planner.limits())?;
        let nscans = match self.params.mode {
            AcquisitionMode::Continuous => planner.best_for_continuous(),
            AcquisitionMode::Episodic { duration, .. } => {
                planner.best_for_episodic(scans_in(duration, rate)).nscans
            }
        };

        self.send(&format!("sampled {} {} {}", aomask, domask, nscans))?;
        let depth = self.confirmed("sampled")?;
        let lead = self.max_ahead.or(self.settings.streaming.max_ahead());
        let ahead = ahead_chunks_with_floor(
            depth,
            lead,
            rate,
            nscans,
            self.settings.streaming.min_ahead_chunks,
        );

        let mut writer = StreamWriter::new(merged, nscans, ahead)?;
        let conn = self.conn_mut()?;
        writer.prefill(&mut conn.link)?;
        conn.writer = Some(writer);
        info!(
            port = %self.port,
            aomask,
            domask,
            nscans,
            depth,
            ahead,
            "Output committed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Handle the device leaving the running state.
    ///
    /// Collects the stop status when it has not arrived yet and logs every
    /// reason the device gave. Stops that were asked for, and stops the
    /// device reports as `ok`, are not errors.
    fn handle_device_stop(&mut self) -> AppResult<()> {
        let port = self.port.clone();
        let conn = self.conn_mut()?;
        if let Some(reader) = conn.reader.as_mut() {
            reader.mark_stopped();
        }
        conn.writer = None;
        conn.link.begin_stop_event();
        if !conn.link.params().contains("stop") {
            conn.link.collect_feedback(Some("+stop"))?;
        }
        conn.link.take_stop_event();

        let reasons = conn.link.stop_reasons().to_vec();
        for reason in &reasons {
            error!(port = %port, reason = %reason, "Device stop reason");
        }
        let expected = std::mem::take(&mut conn.expecting_stop);
        if expected || conn.link.params().is_text("stop", "ok") {
            info!(port = %port, "Device stopped");
            return Ok(());
        }
        Err(DaqError::Stop(
            reasons
                .into_iter()
                .next()
                .unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    /// Move the acquisition along by one frame.
    ///
    /// Reads at most one input frame, credits the writer with the output
    /// chunks the device consumed and tops the device queue back up. When
    /// the device stops by itself the stop handler runs and its verdict is
    /// returned. Once the stop has been handled, later polls report
    /// [`ReadOutcome::Stopped`] without running the handler again.
    pub fn poll(&mut self) -> AppResult<ReadOutcome> {
        let conn = self.conn_mut()?;
        let Some(reader) = conn.reader.as_mut() else {
            return Ok(ReadOutcome::Stopped);
        };
        if !reader.is_active() {
            return Ok(ReadOutcome::Stopped);
        }
        let outcome = reader.read(&mut conn.link)?;
        match outcome {
            ReadOutcome::Chunk { consumed, .. } => {
                if let Some(writer) = conn.writer.as_mut() {
                    writer.credit(consumed);
                    writer.refill(&mut conn.link)?;
                }
            }
            ReadOutcome::Idle => {
                if let Some(writer) = conn.writer.as_mut() {
                    writer.refill(&mut conn.link)?;
                }
            }
            ReadOutcome::Stopped => {
                self.handle_device_stop()?;
            }
        }
        if self.conn_mut()?.link.take_stop_event() {
            self.handle_device_stop()?;
        }
        Ok(outcome)
    }

    /// Pull the next block of scans for an input handle.
    ///
    /// Starts the acquisition when nothing is running yet. Returns `None`
    /// when no data arrived during one poll.
    pub fn read_chunk(&mut self, handle: HandleId, max_scans: usize) -> AppResult<Option<ScanData>> {
        let entry = self.entry(handle)?;
        let kind = entry.spec.kind;
        if !kind.is_input() {
            return Err(DaqError::Configuration(format!(
                "Stream {} is an output and cannot be read",
                handle
            )));
        }
        let channels = entry.spec.channels.clone();
        let data_kind = kind.data_kind();

        if self.conn_mut()?.reader.is_none() {
            self.start()?;
        }
        let conn = self.conn_mut()?;
        let needs_poll = conn
            .reader
            .as_ref()
            .is_some_and(|r| r.is_active() && !r.has_data(data_kind));
        if needs_poll {
            self.poll()?;
        }

        let conn = self.conn_mut()?;
        let mask = match data_kind {
            DataKind::Analog => conn.input_masks.0,
            DataKind::Digital => conn.input_masks.1,
        };
        let Some(block) = conn
            .reader
            .as_mut()
            .and_then(|r| r.fetch_data(data_kind, max_scans))
        else {
            return Ok(None);
        };
        let data = ScanData::from_block(&channels, mask, block);
        self.entry_mut(handle)?.delivered += data.scans();
        Ok(Some(data))
    }

    /// Read at least `nscans` scans for an input handle.
    ///
    /// Returns fewer only when the acquisition ends first. Fails with
    /// [`DaqError::Timeout`] when the data does not arrive within the
    /// configured read timeout.
    pub fn read_scans(&mut self, handle: HandleId, nscans: usize) -> AppResult<ScanData> {
        let timeout = self.settings.streaming.read_scans_timeout();
        let deadline = Instant::now() + timeout;
        let mut collected: Option<ScanData> = None;
        loop {
            let have = collected.as_ref().map_or(0, ScanData::scans);
            if have >= nscans {
                break;
            }
            match self.read_chunk(handle, nscans - have)? {
                Some(data) => match &mut collected {
                    Some(acc) => acc.append(data),
                    None => collected = Some(data),
                },
                None if !self.is_running() => break,
                None if Instant::now() >= deadline => {
                    return Err(DaqError::Timeout(format!(
                        "{} of {} scans after {:?}",
                        have, nscans, timeout
                    )));
                }
                None => {}
            }
        }
        match collected {
            Some(data) => Ok(data),
            None => {
                let entry = self.entry(handle)?;
                let width = entry.spec.channels.len();
                Ok(if entry.spec.kind.is_digital() {
                    ScanData::Digital {
                        lines: entry.spec.channels.clone(),
                        columns: vec![Vec::new(); width],
                    }
                } else {
                    ScanData::Analog {
                        channels: entry.spec.channels.clone(),
                        columns: vec![Vec::new(); width],
                    }
                })
            }
        }
    }

    /// Start and keep polling until the acquisition is over.
    ///
    /// The run ends when the device stops after its episode count, or, for
    /// finite output, once every chunk was played (the acquisition is then
    /// stopped). Input data of a self-stopping run stays readable.
    pub fn run_to_completion(&mut self) -> AppResult<()> {
        let episodes = matches!(
            self.params.mode,
            AcquisitionMode::Episodic { count: Some(_), .. }
        );
        let staged: Vec<bool> = self
            .handles
            .iter()
            .filter_map(|h| h.staged.as_ref().map(OutputPayload::is_finite))
            .collect();
        let committed = self
            .conn
            .as_ref()
            .and_then(|c| c.writer.as_ref())
            .map(StreamWriter::is_finite);
        let has_output = committed.is_some() || !staged.is_empty();
        let finite_output =
            has_output && committed.unwrap_or(true) && staged.iter().all(|&finite| finite);
        if !episodes && !finite_output {
            return Err(DaqError::Configuration(
                "Acquisition never ends by itself: set an episode count or commit finite output"
                    .to_string(),
            ));
        }

        self.start()?;
        loop {
            if self.poll()? == ReadOutcome::Stopped {
                return Ok(());
            }
            let played_out = self
                .conn
                .as_ref()
                .and_then(|c| c.writer.as_ref())
                .is_some_and(|w| w.production_finished() && w.ahead() == 0);
            if played_out && !episodes {
                info!(port = %self.port, "Output played out");
                return self.stop();
            }
        }
    }

    // ------------------------------------------------------------------
    // Waves and identity
    // ------------------------------------------------------------------

    /// Upload a sample buffer to wave slot `idx`.
    ///
    /// The device echoes a checksum of what it received; a mismatch fails
    /// with [`DaqError::Checksum`]. There is no retry.
    pub fn upload_wave(&mut self, idx: u32, samples: &[i16]) -> AppResult<()> {
        if self.is_running() {
            return Err(DaqError::Configuration(
                "Cannot upload waves while acquisition is running".to_string(),
            ));
        }
        let expected = checksum(samples);
        let conn = self.conn_mut()?;
        conn.link
            .command(&format!("wave {} {}", idx, samples.len()), false)?;
        conn.link.write_raw(&samples_to_le_bytes(samples))?;
        conn.link.collect_feedback(Some("+wave"))?;

        let reported = conn
            .link
            .params()
            .get("wave")
            .map_or_else(|| "??".to_string(), ToString::to_string);
        if reported != expected.to_string() {
            error!(idx, expected, reported = %reported, "Wave checksum mismatch");
            return Err(DaqError::Checksum { expected, reported });
        }
        debug!(idx, samples = samples.len(), checksum = expected, "Wave uploaded");
        Ok(())
    }

    /// Identity and capabilities of the device.
    ///
    /// Queried once and cached until the connection closes. When no handle
    /// is open the port is opened just for the query.
    pub fn device_info(&mut self) -> AppResult<DeviceInfo> {
        Ok(self.identity()?.0)
    }

    /// Raw calibration coefficients of the device.
    pub fn calibration(&mut self) -> AppResult<Calibration> {
        Ok(self.identity()?.1)
    }

    fn identity(&mut self) -> AppResult<(DeviceInfo, Calibration)> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        if self.is_running() {
            return Err(DaqError::Configuration(
                "Cannot query the device while acquisition is running".to_string(),
            ));
        }
        let identity = match self.conn.as_mut() {
            Some(conn) => device_info::query(&mut conn.link)?,
            None => {
                let _lease = self.registry.claim(&self.port)?;
                let transport = self.connector.connect(&self.port)?;
                let mut link = CommandLink::new(transport, &self.settings.link);
                device_info::query(&mut link)?
            }
        };
        info!(
            port = %self.port,
            firmware = %identity.0.firmware,
            serial = %identity.0.serial_number,
            "picoDAQ identified"
        );
        if self.conn.is_some() {
            self.identity = Some(identity.clone());
        }
        Ok(identity)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            warn!(port = %self.port, "Session dropped while open");
            if let Some(reader) = conn.reader.as_mut() {
                if let Err(e) = reader.close(&mut conn.link) {
                    warn!(port = %self.port, error = %e, "Failed to stop acquisition on drop");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockConnector, MockDevice};
    use tracing_test::traced_test;

    fn session(device: &MockDevice) -> Session {
        let mut settings = Settings::default();
        settings.link.command_timeout_ms = 100;
        Session::new(
            "mock0",
            MockConnector::new(device.clone()),
            PortRegistry::new(),
            settings,
        )
    }

    #[test]
    fn test_scans_in_rounds_up() {
        assert_eq!(scans_in(Duration::from_millis(100), 10_000), 1000);
        assert_eq!(scans_in(Duration::from_micros(1), 1500), 1);
    }

    #[test]
    fn test_scan_data_columns_follow_handle_order() {
        let block = ScanBlock::Analog {
            lanes: 2,
            samples: vec![0, 20, 1, 21, 2, 22],
        };
        let data = ScanData::from_block(&[2, 0], 0b0101, block);
        assert_eq!(data.scans(), 3);
        assert_eq!(data.analog(2), Some(&[20, 21, 22][..]));
        assert_eq!(data.analog(0), Some(&[0, 1, 2][..]));
        assert!(data.digital(0).is_none());
    }

    #[test]
    fn test_state_transitions() {
        let device = MockDevice::new();
        let mut session = session(&device);
        assert_eq!(session.state(), SessionState::Closed);

        let ai = session
            .open(StreamSpec::analog_in([0]).with_rate(1000))
            .unwrap();
        assert_eq!(session.state(), SessionState::Open);
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        session.close(ai).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!device.is_connected());
    }

    #[test]
    fn test_one_handle_per_kind() {
        let device = MockDevice::new();
        let mut session = session(&device);
        session.open(StreamSpec::analog_in([0])).unwrap();
        let err = session.open(StreamSpec::analog_in([1])).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let device = MockDevice::new();
        let mut session = session(&device);
        session
            .open(StreamSpec::analog_in([0]).with_rate(1000))
            .unwrap();
        let err = session
            .open(StreamSpec::digital_in([0]).with_rate(2000))
            .unwrap_err();
        assert!(err.to_string().contains("conflicts"));
        assert!(session
            .open(StreamSpec::digital_in([0]).with_rate(1000))
            .is_ok());
    }

    #[test]
    fn test_parameter_change_rejected_while_running() {
        let device = MockDevice::new();
        let mut session = session(&device);
        session
            .open(StreamSpec::analog_in([0]).with_rate(1000))
            .unwrap();
        session.start().unwrap();
        assert!(session.set_rate(2000).is_err());
        session.stop().unwrap();
        assert!(session.set_rate(2000).is_ok());
    }

    #[test]
    fn test_input_handle_cannot_stage_output() {
        let device = MockDevice::new();
        let mut session = session(&device);
        let ai = session.open(StreamSpec::analog_in([0])).unwrap();
        assert!(session.stage_output(ai, OutputPayload::new()).is_err());
    }

    #[test]
    #[traced_test]
    fn test_verify_failure_logs_parameters() {
        let device = MockDevice::new();
        device.reject_verify(Some("rate too high for 4 channels"));
        let mut session = session(&device);
        session
            .open(StreamSpec::analog_in([0, 1, 2, 3]).with_rate(400_000))
            .unwrap();

        let err = session.start().unwrap_err();
        assert!(matches!(err, DaqError::Verification(_)));
        assert!(logs_contain("Unsupported parameters"));
        assert!(logs_contain("rate: 400000"));
        assert!(logs_contain("aimask: 15"));
    }

    #[test]
    #[traced_test]
    fn test_device_fault_logged() {
        let device = MockDevice::new();
        let mut session = session(&device);
        let ai = session
            .open(StreamSpec::analog_in([0]).with_rate(1000))
            .unwrap();
        session.read_chunk(ai, 10).unwrap();
        device.inject_fault("buffer overrun");

        let err = session.read_scans(ai, 1000).unwrap_err();
        assert!(matches!(err, DaqError::Stop(_)));
        assert!(logs_contain("Device stop reason"));
        assert!(logs_contain("buffer overrun"));
    }
}
