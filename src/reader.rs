//! Decoding of framed input chunks.
//!
//! While the device runs, its byte stream carries three kinds of records:
//!
//! - input frames: `**#`, a status byte, a little-endian `u16` count of output
//!   chunks consumed since the previous frame, then one chunk of payload;
//! - the stop sentinel line `**ASCII`;
//! - ordinary feedback lines, which are handed to the [`CommandLink`].
//!
//! The payload holds the analog section (scan-major `i16` samples, lanes in
//! ascending channel order) followed by the packed digital section.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::{decode_mask, le_bytes_to_samples, scans_per_byte, unpack_bits};
use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;

/// Marker opening every input frame.
pub const FRAME_MAGIC: &[u8] = b"**#";
/// Stop sentinel including its line terminator.
pub const STOP_SENTINEL: &[u8] = b"**ASCII\n";
/// Magic, status byte and consumed count.
pub const HEADER_LEN: usize = 6;

const READ_CHUNK: usize = 4096;

/// Byte layout of one input chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Analog channels per scan
    pub analog_lanes: usize,
    /// Digital lines per scan
    pub digital_lines: usize,
    /// Scans per chunk
    pub nscans: usize,
}

impl FrameLayout {
    /// Layout for the given input masks and chunk size.
    pub fn new(aimask: u8, dimask: u8, nscans: usize) -> AppResult<Self> {
        let digital_lines = dimask.count_ones() as usize;
        if scans_per_byte(digital_lines).is_none() {
            return Err(DaqError::Configuration(format!(
                "Unsupported digital line count {}",
                digital_lines
            )));
        }
        if nscans == 0 {
            return Err(DaqError::Protocol(
                "Device reported a zero chunk size".to_string(),
            ));
        }
        Ok(Self {
            analog_lanes: aimask.count_ones() as usize,
            digital_lines,
            nscans,
        })
    }

    /// Bytes of the analog section.
    pub fn analog_bytes(&self) -> usize {
        self.nscans * 2 * self.analog_lanes
    }

    /// Bytes of the packed digital section.
    pub fn digital_bytes(&self) -> usize {
        match scans_per_byte(self.digital_lines) {
            Some(per_byte) if self.digital_lines > 0 => self.nscans.div_ceil(per_byte),
            _ => 0,
        }
    }

    /// Bytes following the frame header.
    pub fn payload_bytes(&self) -> usize {
        self.analog_bytes() + self.digital_bytes()
    }
}

/// Which section of the input stream a caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// 16-bit analog samples
    Analog,
    /// Digital line levels
    Digital,
}

/// Scans popped from the reader queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanBlock {
    /// Scan-major samples, `lanes` per scan
    Analog {
        /// Channels per scan
        lanes: usize,
        /// Samples, scan after scan
        samples: Vec<i16>,
    },
    /// Scan-major 0/1 levels, `lines` per scan
    Digital {
        /// Lines per scan
        lines: usize,
        /// Levels, scan after scan
        levels: Vec<u8>,
    },
}

impl ScanBlock {
    /// Number of scans in the block.
    pub fn scans(&self) -> usize {
        match self {
            ScanBlock::Analog { lanes, samples } => samples.len() / (*lanes).max(1),
            ScanBlock::Digital { lines, levels } => levels.len() / (*lines).max(1),
        }
    }
}

/// Result of one [`StreamReader::read`] attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A chunk was decoded and queued
    Chunk {
        /// Output chunks the device played since the previous frame
        consumed: u16,
        /// Firmware status byte
        status: u8,
    },
    /// Nothing complete arrived before the transport went quiet
    Idle,
    /// The stop sentinel arrived; the device is no longer running
    Stopped,
}

/// Lifecycle of a [`StreamReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Frames are expected
    Active,
    /// The device stopped; queued scans remain readable
    Stopped,
    /// Released
    Closed,
}

struct Queued<T> {
    values: Vec<T>,
    taken_scans: usize,
}

/// Input side of a running acquisition
pub struct StreamReader {
    layout: FrameLayout,
    state: ReaderState,
    pending: Vec<u8>,
    analog: VecDeque<Queued<i16>>,
    digital: VecDeque<Queued<u8>>,
    last_status: Option<u8>,
    chunks_read: usize,
    drain_timeout: Duration,
}

impl StreamReader {
    /// Reader for frames laid out per `layout`. `drain_timeout` bounds how
    /// long [`close`](Self::close) waits for the stop sentinel.
    pub fn new(layout: FrameLayout, drain_timeout: Duration) -> Self {
        debug!(?layout, "Stream reader created");
        Self {
            layout,
            state: ReaderState::Active,
            pending: Vec::new(),
            analog: VecDeque::new(),
            digital: VecDeque::new(),
            last_status: None,
            chunks_read: 0,
            drain_timeout,
        }
    }

    /// Frame layout in use.
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Whether the device is still streaming.
    pub fn is_active(&self) -> bool {
        self.state == ReaderState::Active
    }

    /// Status byte of the most recent frame. Opaque firmware value.
    pub fn status(&self) -> Option<u8> {
        self.last_status
    }

    /// Frames decoded since creation.
    pub fn chunks_read(&self) -> usize {
        self.chunks_read
    }

    /// Record a stop sentinel that arrived through the command link instead
    /// of through [`read`](Self::read).
    pub fn mark_stopped(&mut self) {
        if self.state == ReaderState::Active {
            self.state = ReaderState::Stopped;
        }
    }

    /// Pull at most one frame from the link.
    ///
    /// Feedback lines found before the frame are absorbed by the link. Returns
    /// [`ReadOutcome::Idle`] as soon as a read comes back empty.
    pub fn read(&mut self, link: &mut CommandLink) -> AppResult<ReadOutcome> {
        if self.state != ReaderState::Active {
            return Ok(ReadOutcome::Stopped);
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(outcome) = self.parse(link)? {
                return Ok(outcome);
            }
            let n = link.read_raw(&mut buf)?;
            if n == 0 {
                return Ok(ReadOutcome::Idle);
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    fn parse(&mut self, link: &mut CommandLink) -> AppResult<Option<ReadOutcome>> {
        loop {
            if self.pending.is_empty() {
                return Ok(None);
            }
            if self.pending.starts_with(FRAME_MAGIC) {
                return self.parse_frame();
            }
            if self.pending.starts_with(STOP_SENTINEL) {
                self.pending.drain(..STOP_SENTINEL.len());
                let rest = std::mem::take(&mut self.pending);
                link.unread(&rest);
                self.state = ReaderState::Stopped;
                info!(chunks = self.chunks_read, "Device stopped streaming");
                return Ok(Some(ReadOutcome::Stopped));
            }
            let partial_marker = (self.pending.len() < STOP_SENTINEL.len()
                && STOP_SENTINEL.starts_with(&self.pending))
                || (self.pending.len() < FRAME_MAGIC.len()
                    && FRAME_MAGIC.starts_with(&self.pending));
            if partial_marker {
                return Ok(None);
            }
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            link.absorb_line_bytes(&line);
        }
    }

    fn parse_frame(&mut self) -> AppResult<Option<ReadOutcome>> {
        let total = HEADER_LEN + self.layout.payload_bytes();
        if self.pending.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.pending.drain(..total).collect();
        let status = frame[3];
        let consumed = u16::from_le_bytes([frame[4], frame[5]]);
        let payload = &frame[HEADER_LEN..];
        let (analog, digital) = payload.split_at(self.layout.analog_bytes());

        if self.layout.analog_lanes > 0 {
            self.analog.push_back(Queued {
                values: le_bytes_to_samples(analog),
                taken_scans: 0,
            });
        }
        if self.layout.digital_lines > 0 {
            let mut levels = unpack_bits(digital, self.layout.digital_lines);
            levels.truncate(self.layout.nscans * self.layout.digital_lines);
            self.digital.push_back(Queued {
                values: levels,
                taken_scans: 0,
            });
        }

        if self.last_status != Some(status) {
            if status == 0 {
                debug!(status, "Device status");
            } else {
                warn!(status, "Device status changed");
            }
        }
        self.last_status = Some(status);
        self.chunks_read += 1;
        Ok(Some(ReadOutcome::Chunk { consumed, status }))
    }

    /// Whether scans of `kind` are queued.
    pub fn has_data(&self, kind: DataKind) -> bool {
        match kind {
            DataKind::Analog => !self.analog.is_empty(),
            DataKind::Digital => !self.digital.is_empty(),
        }
    }

    /// Pop up to `max_scans` scans of `kind` from the oldest queued chunk.
    ///
    /// Never returns scans from two chunks at once. Digital scans come in
    /// whole packed bytes, so the count is rounded down to the packing
    /// granularity (but at least one byte's worth). Asking for no scans
    /// returns `None`.
    pub fn fetch_data(&mut self, kind: DataKind, max_scans: usize) -> Option<ScanBlock> {
        if max_scans == 0 {
            return None;
        }
        let nscans = self.layout.nscans;
        match kind {
            DataKind::Analog => {
                let lanes = self.layout.analog_lanes;
                let samples = take_scans(&mut self.analog, nscans, lanes, max_scans)?;
                Some(ScanBlock::Analog { lanes, samples })
            }
            DataKind::Digital => {
                let lines = self.layout.digital_lines;
                let granularity = scans_per_byte(lines).unwrap_or(1);
                let wanted = (max_scans / granularity * granularity).max(granularity);
                let levels = take_scans(&mut self.digital, nscans, lines, wanted)?;
                Some(ScanBlock::Digital { lines, levels })
            }
        }
    }

    /// Finish reading. Idempotent.
    ///
    /// While the device is still running this sends `stop` and discards
    /// frames until the stop sentinel; any bytes after the sentinel stay
    /// with the link for the next command. Queued scans are dropped.
    pub fn close(&mut self, link: &mut CommandLink) -> AppResult<()> {
        if self.state == ReaderState::Active {
            link.command("stop", false)?;
            let deadline = Instant::now() + self.drain_timeout;
            loop {
                match self.read(link)? {
                    ReadOutcome::Stopped => break,
                    ReadOutcome::Chunk { .. } => {}
                    ReadOutcome::Idle if Instant::now() >= deadline => {
                        warn!("Stop sentinel did not arrive within {:?}", self.drain_timeout);
                        break;
                    }
                    ReadOutcome::Idle => {}
                }
            }
        }
        if self.state != ReaderState::Closed {
            debug!(chunks = self.chunks_read, "Stream reader closed");
        }
        self.state = ReaderState::Closed;
        self.pending.clear();
        self.analog.clear();
        self.digital.clear();
        Ok(())
    }
}

fn take_scans<T: Copy>(
    queue: &mut VecDeque<Queued<T>>,
    nscans: usize,
    width: usize,
    max_scans: usize,
) -> Option<Vec<T>> {
    let front = queue.front_mut()?;
    let take = (nscans - front.taken_scans).min(max_scans);
    let start = front.taken_scans * width;
    let values = front.values[start..start + take * width].to_vec();
    front.taken_scans += take;
    if front.taken_scans >= nscans {
        queue.pop_front();
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack_bits;
    use crate::config::LinkSettings;
    use crate::transport::{Connector, MockConnector, MockDevice};

    fn setup() -> (MockDevice, CommandLink) {
        let device = MockDevice::new();
        let transport = MockConnector::new(device.clone()).connect("mock0").unwrap();
        let settings = LinkSettings {
            command_timeout_ms: 20,
            ..LinkSettings::default()
        };
        (device, CommandLink::new(transport, &settings))
    }

    fn frame(status: u8, consumed: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = FRAME_MAGIC.to_vec();
        bytes.push(status);
        bytes.extend(consumed.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_layout_sizes() {
        let layout = FrameLayout::new(0b0101, 0b0011, 8).unwrap();
        assert_eq!(layout.analog_bytes(), 32);
        assert_eq!(layout.digital_bytes(), 2);
        assert!(FrameLayout::new(0, 0b0111, 8).is_err());
    }

    #[test]
    fn test_decodes_running_device_frames() {
        let (device, mut link) = setup();
        for cmd in ["rate 1000", "aimask 5", "dimask 0", "nscans 4", "start"] {
            link.command(cmd, true).unwrap();
        }
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0101, 0, 4).unwrap(),
            Duration::from_millis(50),
        );
        let outcome = reader.read(&mut link).unwrap();
        assert_eq!(outcome, ReadOutcome::Chunk { consumed: 0, status: 0 });
        assert!(reader.has_data(DataKind::Analog));
        assert!(!reader.has_data(DataKind::Digital));

        let block = reader.fetch_data(DataKind::Analog, 100).unwrap();
        assert_eq!(block.scans(), 4);
        let ScanBlock::Analog { lanes, samples } = block else {
            panic!("expected analog block");
        };
        assert_eq!(lanes, 2);
        assert_eq!(samples[0], MockDevice::analog_sample(0, 0));
        assert_eq!(samples[1], MockDevice::analog_sample(0, 2));
        assert_eq!(samples[7], MockDevice::analog_sample(3, 2));

        reader.close(&mut link).unwrap();
        assert_eq!(reader.state(), ReaderState::Closed);
        assert!(!device.is_running());
    }

    #[test]
    fn test_fetch_never_crosses_chunk_boundary() {
        let (device, mut link) = setup();
        let payload: Vec<u8> = (0..4i16).flat_map(|s| s.to_le_bytes()).collect();
        device.inject_output(&frame(0, 0, &payload));
        device.inject_output(&frame(0, 0, &payload));
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0001, 0, 4).unwrap(),
            Duration::from_millis(50),
        );
        assert!(matches!(reader.read(&mut link).unwrap(), ReadOutcome::Chunk { .. }));
        assert!(matches!(reader.read(&mut link).unwrap(), ReadOutcome::Chunk { .. }));

        assert_eq!(reader.fetch_data(DataKind::Analog, 3).unwrap().scans(), 3);
        assert_eq!(reader.fetch_data(DataKind::Analog, 3).unwrap().scans(), 1);
        assert_eq!(reader.fetch_data(DataKind::Analog, 6).unwrap().scans(), 4);
        assert!(reader.fetch_data(DataKind::Analog, 6).is_none());
    }

    #[test]
    fn test_fetch_of_zero_scans_takes_nothing() {
        let (device, mut link) = setup();
        let payload: Vec<u8> = (0..4i16).flat_map(|s| s.to_le_bytes()).collect();
        device.inject_output(&frame(0, 0, &payload));
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0001, 0, 4).unwrap(),
            Duration::from_millis(50),
        );
        reader.read(&mut link).unwrap();

        assert!(reader.fetch_data(DataKind::Analog, 0).is_none());
        assert!(reader.fetch_data(DataKind::Digital, 0).is_none());
        assert_eq!(reader.fetch_data(DataKind::Analog, 4).unwrap().scans(), 4);
    }

    #[test]
    fn test_digital_fetch_rounds_to_whole_bytes() {
        let (device, mut link) = setup();
        // two lines, eight scans: line 0 high on even scans
        let levels: Vec<u8> = (0..8).flat_map(|s| [u8::from(s % 2 == 0), 1]).collect();
        device.inject_output(&frame(0, 0, &pack_bits(&levels, 2)));
        let mut reader = StreamReader::new(
            FrameLayout::new(0, 0b0011, 8).unwrap(),
            Duration::from_millis(50),
        );
        reader.read(&mut link).unwrap();

        let block = reader.fetch_data(DataKind::Digital, 5).unwrap();
        assert_eq!(block.scans(), 4);
        let ScanBlock::Digital { levels: got, .. } = block else {
            panic!("expected digital block");
        };
        assert_eq!(got, levels[..8].to_vec());
        assert_eq!(reader.fetch_data(DataKind::Digital, 1).unwrap().scans(), 4);
    }

    #[test]
    fn test_feedback_lines_between_frames_reach_link() {
        let (device, mut link) = setup();
        device.inject_output(b"!overrun\n");
        device.inject_output(&frame(3, 2, &[0, 0]));
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0001, 0, 1).unwrap(),
            Duration::from_millis(50),
        );
        let outcome = reader.read(&mut link).unwrap();
        assert_eq!(outcome, ReadOutcome::Chunk { consumed: 2, status: 3 });
        assert_eq!(reader.status(), Some(3));
        assert_eq!(link.errors(), &["overrun".to_string()]);
    }

    #[test]
    fn test_sentinel_hands_rest_back_to_link() {
        let (device, mut link) = setup();
        device.inject_output(b"**ASCII\n+stop ok\n");
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0001, 0, 1).unwrap(),
            Duration::from_millis(50),
        );
        assert_eq!(reader.read(&mut link).unwrap(), ReadOutcome::Stopped);
        assert!(!reader.is_active());
        assert_eq!(reader.read(&mut link).unwrap(), ReadOutcome::Stopped);

        link.collect_feedback(Some("+stop")).unwrap();
        assert!(link.params().is_text("stop", "ok"));
    }

    #[test]
    fn test_idle_when_quiet() {
        let (_device, mut link) = setup();
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0001, 0, 1).unwrap(),
            Duration::from_millis(50),
        );
        assert_eq!(reader.read(&mut link).unwrap(), ReadOutcome::Idle);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_device, mut link) = setup();
        let mut reader = StreamReader::new(
            FrameLayout::new(0b0001, 0, 1).unwrap(),
            Duration::from_millis(5),
        );
        reader.close(&mut link).unwrap();
        reader.close(&mut link).unwrap();
        assert_eq!(reader.state(), ReaderState::Closed);
    }
}
