//! In-process firmware simulator for tests and demos.
//!
//! [`MockDevice`] speaks the instrument's wire protocol: it answers commands
//! with `+key value` feedback, accepts wave uploads and output chunks, and
//! while running emits one framed input chunk per host read. Time is not
//! simulated; a read with nothing queued returns at once as a quiet period.
//!
//! Failure injection and a call log let tests observe what the host sent.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use super::{Connector, Transport};
use crate::codec::{checksum_bytes, decode_mask, le_bytes_to_samples, pack_bits};
use crate::error::{AppResult, DaqError};
use crate::reader::{FRAME_MAGIC, STOP_SENTINEL};

/// Where the device reports stop status relative to the stop sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    /// `+stop` and `!reason` lines precede `**ASCII`
    BeforeSentinel,
    /// `+stop` and `!reason` lines follow `**ASCII`
    AfterSentinel,
}

enum Upload {
    Wave { idx: u32, remaining: usize, bytes: Vec<u8> },
    Data { remaining: usize, bytes: Vec<u8> },
}

struct MockState {
    present: bool,
    connected: bool,
    call_log: Vec<String>,
    inbound: Vec<u8>,
    upload: Option<Upload>,
    outbound: VecDeque<u8>,

    rate: u32,
    aimask: u8,
    dimask: u8,
    nscans: usize,
    nchunks: usize,
    nepis: usize,
    nscans_override: Option<usize>,
    reject_verify: Option<String>,

    running: bool,
    frames_sent: usize,
    scan_counter: u64,
    status: u8,
    pending_fault: Option<String>,
    stop_report: StopReport,

    waves: BTreeMap<u32, Vec<i16>>,
    corrupt_next_wave: bool,

    output_capacity: usize,
    output_nscans: usize,
    buffered: usize,
    max_buffered: usize,
    output_chunks: Vec<Vec<u8>>,
    consumed_chunks: usize,
}

impl MockState {
    fn new() -> Self {
        Self {
            present: true,
            connected: false,
            call_log: Vec::new(),
            inbound: Vec::new(),
            upload: None,
            outbound: VecDeque::new(),
            rate: 0,
            aimask: 0,
            dimask: 0,
            nscans: 0,
            nchunks: 0,
            nepis: 0,
            nscans_override: None,
            reject_verify: None,
            running: false,
            frames_sent: 0,
            scan_counter: 0,
            status: 0,
            pending_fault: None,
            stop_report: StopReport::BeforeSentinel,
            waves: BTreeMap::new(),
            corrupt_next_wave: false,
            output_capacity: 64,
            output_nscans: 0,
            buffered: 0,
            max_buffered: 0,
            output_chunks: Vec::new(),
            consumed_chunks: 0,
        }
    }

    fn reply(&mut self, line: &str) {
        self.outbound.extend(line.as_bytes());
        self.outbound.push_back(b'\n');
    }

    fn receive(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
        loop {
            if self.upload.is_some() {
                if !self.feed_upload() {
                    break;
                }
                continue;
            }
            let Some(pos) = self.inbound.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.inbound.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            if !text.is_empty() {
                self.handle_line(&text);
            }
        }
    }

    /// Moves inbound bytes into the active upload. Returns true when the
    /// upload completed and parsing can continue.
    fn feed_upload(&mut self) -> bool {
        let (remaining, bytes) = match self.upload.as_mut() {
            Some(Upload::Wave {
                remaining, bytes, ..
            }) => (remaining, bytes),
            Some(Upload::Data { remaining, bytes }) => (remaining, bytes),
            None => return false,
        };
        let take = (*remaining).min(self.inbound.len());
        bytes.extend(self.inbound.drain(..take));
        *remaining -= take;
        if *remaining > 0 {
            return false;
        }
        match self.upload.take() {
            Some(Upload::Wave { idx, mut bytes, .. }) => {
                if self.corrupt_next_wave && !bytes.is_empty() {
                    self.corrupt_next_wave = false;
                    bytes[0] ^= 0x5a;
                }
                let crc = checksum_bytes(&bytes);
                self.waves.insert(idx, le_bytes_to_samples(&bytes));
                self.reply(&format!("+wave {}", crc));
            }
            Some(Upload::Data { bytes, .. }) => {
                self.output_chunks.push(bytes);
                self.buffered += 1;
                self.max_buffered = self.max_buffered.max(self.buffered);
                if !self.running {
                    let buffered = self.buffered;
                    self.reply(&format!("+data {}", buffered));
                }
            }
            None => {}
        }
        true
    }

    fn handle_line(&mut self, line: &str) {
        trace!(line, "mock device received");
        self.call_log.push(line.to_string());
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();
        let arg = |i: usize| -> usize { args.get(i).and_then(|a| a.parse().ok()).unwrap_or(0) };

        match verb {
            "rate" => {
                self.rate = arg(0) as u32;
                self.reply(&format!("+rate {}", self.rate));
            }
            "aimask" => {
                self.aimask = arg(0) as u8;
                self.reply(&format!("+aimask {}", self.aimask));
            }
            "dimask" => {
                self.dimask = arg(0) as u8;
                self.reply(&format!("+dimask {}", self.dimask));
            }
            "immediate" => self.reply("+immediate ok"),
            "trigger" => {
                let reply = format!("+trigger {}", args.join(" "));
                self.reply(&reply);
            }
            "nscans" => {
                self.nscans = self.nscans_override.unwrap_or(arg(0));
                self.reply(&format!("+nscans {}", self.nscans));
            }
            "nchunks" => {
                self.nchunks = arg(0);
                self.reply(&format!("+nchunks {}", self.nchunks));
            }
            "period" => self.reply(&format!("+period {}", arg(0))),
            "nepis" => {
                self.nepis = arg(0);
                self.reply(&format!("+nepis {}", self.nepis));
            }
            "verify" => match self.verify_failure() {
                Some(reason) => {
                    self.reply(&format!("!{}", reason));
                    self.reply("+verify bad");
                }
                None => self.reply("+verify ok"),
            },
            "start" => {
                self.running = true;
                self.frames_sent = 0;
                self.scan_counter = 0;
                self.reply("+start ok");
            }
            "stop" => {
                if self.running {
                    self.running = false;
                    self.outbound.extend(STOP_SENTINEL);
                }
                self.reply("+stop ok");
            }
            "nop" => self.reply("+nop ok"),
            "picodaq" => self.reply("+picodaq 1.3 E6614103E7435B2F"),
            "info" => self.reply("+info HW=1.0,AI=4,AO=4,DI=4,DO=4,F=500,VI=±10,VO=±10"),
            "islope" => self.reply("+islope 1.5,-2"),
            "oslope" => self.reply("+oslope -0.8,3.1"),
            "wave" => {
                self.upload = Some(Upload::Wave {
                    idx: arg(0) as u32,
                    remaining: arg(1) * 2,
                    bytes: Vec::new(),
                });
            }
            "data" => {
                self.upload = Some(Upload::Data {
                    remaining: arg(0),
                    bytes: Vec::new(),
                });
            }
            "sampled" => {
                self.output_nscans = arg(2);
                self.buffered = 0;
                self.output_chunks.clear();
                self.consumed_chunks = 0;
                let depth = self.output_capacity;
                self.reply(&format!("+sampled {}", depth));
            }
            other => self.reply(&format!("!unknown command {}", other)),
        }
    }

    fn verify_failure(&self) -> Option<String> {
        if let Some(reason) = &self.reject_verify {
            return Some(reason.clone());
        }
        if self.rate == 0 {
            return Some("rate not set".to_string());
        }
        if self.rate > 500_000 {
            return Some("rate too high".to_string());
        }
        None
    }

    fn emit_stop(&mut self, status: &str, reason: Option<&str>) {
        self.running = false;
        match self.stop_report {
            StopReport::BeforeSentinel => {
                self.reply(&format!("+stop {}", status));
                if let Some(reason) = reason {
                    self.reply(&format!("!{}", reason));
                }
                self.outbound.extend(STOP_SENTINEL);
            }
            StopReport::AfterSentinel => {
                self.outbound.extend(STOP_SENTINEL);
                if let Some(reason) = reason {
                    self.reply(&format!("!{}", reason));
                }
                self.reply(&format!("+stop {}", status));
            }
        }
    }

    /// Queue the next input frame, or the stop sequence when the run ends.
    fn produce(&mut self) {
        if let Some(reason) = self.pending_fault.take() {
            self.emit_stop("??", Some(&reason));
            return;
        }
        let episodic_total = self.nepis * self.nchunks;
        if episodic_total > 0 && self.frames_sent >= episodic_total {
            self.emit_stop("ok", None);
            return;
        }

        let consumed = if self.buffered > 0 {
            self.buffered -= 1;
            self.consumed_chunks += 1;
            1u16
        } else {
            0u16
        };

        let channels = decode_mask(self.aimask);
        let lines = decode_mask(self.dimask);
        let mut frame = Vec::new();
        frame.extend(FRAME_MAGIC);
        frame.push(self.status);
        frame.extend(consumed.to_le_bytes());
        for scan in 0..self.nscans as u64 {
            for &ch in &channels {
                let sample = MockDevice::analog_sample(self.scan_counter + scan, ch);
                frame.extend(sample.to_le_bytes());
            }
        }
        if !lines.is_empty() {
            let values: Vec<u8> = (0..self.nscans as u64)
                .flat_map(|scan| {
                    let global = self.scan_counter + scan;
                    lines
                        .iter()
                        .map(move |&line| MockDevice::digital_level(global, line))
                })
                .collect();
            frame.extend(pack_bits(&values, lines.len()));
        }
        self.scan_counter += self.nscans as u64;
        self.frames_sent += 1;
        self.outbound.extend(frame);
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.outbound.is_empty() && self.running {
            self.produce();
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// Simulated instrument shared between the test and the transport
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A connected-ready simulator with default behavior.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Analog value the simulator produces for `channel` at absolute scan `scan`.
    pub fn analog_sample(scan: u64, channel: u8) -> i16 {
        ((scan * 7 + u64::from(channel) * 1000) % 30_000) as i16
    }

    /// Digital level the simulator produces for `line` at absolute scan `scan`.
    pub fn digital_level(scan: u64, line: u8) -> u8 {
        ((scan >> line) & 1) as u8
    }

    /// Make the next connection attempt fail as if nothing were attached.
    pub fn set_present(&self, present: bool) {
        self.state().present = present;
    }

    /// Whether a host has the simulator open.
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Confirm a different chunk size than the host asked for.
    pub fn set_nscans_override(&self, nscans: Option<usize>) {
        self.state().nscans_override = nscans;
    }

    /// Answer `verify` with `bad`, reporting `reason`.
    pub fn reject_verify(&self, reason: Option<&str>) {
        self.state().reject_verify = reason.map(str::to_string);
    }

    /// Flip a byte of the next uploaded wave before checksumming it.
    pub fn corrupt_next_wave(&self) {
        self.state().corrupt_next_wave = true;
    }

    /// Stop the running acquisition at the next frame with `reason`.
    pub fn inject_fault(&self, reason: &str) {
        self.state().pending_fault = Some(reason.to_string());
    }

    /// Queue raw bytes for the host to read.
    pub fn inject_output(&self, bytes: &[u8]) {
        self.state().outbound.extend(bytes);
    }

    /// Where stop status lines go relative to the sentinel.
    pub fn set_stop_report(&self, report: StopReport) {
        self.state().stop_report = report;
    }

    /// Status byte placed in subsequent frame headers.
    pub fn set_status(&self, status: u8) {
        self.state().status = status;
    }

    /// Output buffer depth reported in reply to `sampled`.
    pub fn set_output_capacity(&self, chunks: usize) {
        self.state().output_capacity = chunks;
    }

    /// Whether the simulated acquisition is running.
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Command lines received so far, without binary payloads.
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Forget the command lines received so far.
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }

    /// Verbs received so far, in order.
    pub fn verbs(&self) -> Vec<String> {
        self.state()
            .call_log
            .iter()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }

    /// Samples stored in wave slot `idx`.
    pub fn wave(&self, idx: u32) -> Option<Vec<i16>> {
        self.state().waves.get(&idx).cloned()
    }

    /// Output chunks received since the last `sampled` command.
    pub fn output_chunks(&self) -> Vec<Vec<u8>> {
        self.state().output_chunks.clone()
    }

    /// Chunks currently waiting in the output buffer.
    pub fn buffered_chunks(&self) -> usize {
        self.state().buffered
    }

    /// Highest number of output chunks buffered at any time.
    pub fn max_buffered_chunks(&self) -> usize {
        self.state().max_buffered
    }

    /// Output chunks the simulator has played.
    pub fn consumed_chunks(&self) -> usize {
        self.state().consumed_chunks
    }

    /// Input frames sent since the connection opened.
    pub fn frames_sent(&self) -> usize {
        self.state().frames_sent
    }

    /// Chunk size the output stream was configured with.
    pub fn output_nscans(&self) -> usize {
        self.state().output_nscans
    }
}

/// Transport end of a [`MockDevice`]
pub struct MockTransport {
    name: String,
    device: MockDevice,
}

impl Transport for MockTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.device.state().read(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.device.state().receive(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut state = self.device.state();
        state.connected = false;
        state.running = false;
        state.inbound.clear();
        state.outbound.clear();
        state.upload = None;
    }
}

/// Connects every port name to the same [`MockDevice`]
#[derive(Clone)]
pub struct MockConnector {
    device: MockDevice,
}

impl MockConnector {
    /// Connector for `device`.
    pub fn new(device: MockDevice) -> Self {
        Self { device }
    }
}

impl Connector for MockConnector {
    fn connect(&self, port: &str) -> AppResult<Box<dyn Transport>> {
        let mut state = self.device.state();
        if !state.present {
            return Err(DaqError::Connection(format!(
                "No picoDAQ found on port {}",
                port
            )));
        }
        state.connected = true;
        state.call_log.push(format!("connect {}", port));
        drop(state);
        Ok(Box::new(MockTransport {
            name: port.to_string(),
            device: self.device.clone(),
        }))
    }
}
