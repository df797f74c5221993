//! Line-oriented command and feedback channel.
//!
//! The device answers commands with text lines on the same byte stream that
//! later carries binary input frames. [`CommandLink`] owns the transport, the
//! [`ParamCache`] fed by `+key value` lines, the `!reason` error log and the
//! buffer of bytes received but not consumed yet. The streaming reader takes
//! raw bytes through the same buffer, so text and binary never get out of
//! step.

use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::LinkSettings;
use crate::error::AppResult;
use crate::params::{ParamCache, Verb};
use crate::transport::Transport;

/// Feedback line the device emits when it leaves the running state.
pub const STOP_LINE: &str = "**ASCII";

const READ_CHUNK: usize = 4096;

/// Command/feedback link over one transport
pub struct CommandLink {
    transport: Box<dyn Transport>,
    params: ParamCache,
    pending: Vec<u8>,
    errors: Vec<String>,
    stop_mark: Option<usize>,
    stop_seen: bool,
    command_timeout: Duration,
}

impl CommandLink {
    /// Wrap `transport` with an empty parameter cache.
    pub fn new(transport: Box<dyn Transport>, settings: &LinkSettings) -> Self {
        Self {
            transport,
            params: ParamCache::new(),
            pending: Vec::new(),
            errors: Vec::new(),
            stop_mark: None,
            stop_seen: false,
            command_timeout: settings.command_timeout(),
        }
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.transport.name()
    }

    /// Parameters the device has reported.
    pub fn params(&self) -> &ParamCache {
        &self.params
    }

    /// Mutable access to the parameter cache.
    pub fn params_mut(&mut self) -> &mut ParamCache {
        &mut self.params
    }

    /// `!reason` lines received since the last `start`.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Note that the device is leaving the running state. Error lines from
    /// here on are the reasons for that stop. Keeps an earlier mark.
    pub fn begin_stop_event(&mut self) {
        if self.stop_mark.is_none() {
            self.stop_mark = Some(self.errors.len());
        }
    }

    /// `!reason` lines received since the current stop event began.
    pub fn stop_reasons(&self) -> &[String] {
        match self.stop_mark {
            Some(mark) => &self.errors[mark.min(self.errors.len())..],
            None => &[],
        }
    }

    /// Whether a stop sentinel arrived in the feedback stream since the last
    /// call. Clears the flag.
    pub fn take_stop_event(&mut self) -> bool {
        std::mem::take(&mut self.stop_seen)
    }

    /// Send one command line.
    ///
    /// The verb's own cache entry and every key it makes stale are dropped
    /// before the line goes out. With `want_feedback`, blocks until the
    /// `+<verb>` reply arrives (or the command timeout passes) and returns
    /// every feedback line seen.
    pub fn command(&mut self, text: &str, want_feedback: bool) -> AppResult<Vec<String>> {
        let verb = text.split(' ').next().unwrap_or_default();
        self.params.invalidate_for(verb);
        match Verb::from_token(verb) {
            Some(Verb::Start) => {
                self.errors.clear();
                self.stop_mark = None;
            }
            Some(Verb::Stop) => self.begin_stop_event(),
            _ => {}
        }

        debug!(port = %self.transport.name(), ">> {}", text);
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.transport.write_all(&line)?;
        self.transport.flush()?;

        if want_feedback {
            let marker = format!("+{}", verb);
            self.collect_feedback(Some(&marker))
        } else {
            Ok(Vec::new())
        }
    }

    /// Collect feedback lines.
    ///
    /// With a marker, returns as soon as a line containing it arrives, leaving
    /// any later bytes buffered; gives up once the command timeout has passed
    /// and the device went quiet. Without a marker, returns at the first quiet
    /// read.
    pub fn collect_feedback(&mut self, until: Option<&str>) -> AppResult<Vec<String>> {
        let started = Instant::now();
        let mut lines = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            while let Some(raw) = self.take_pending_line() {
                let line = self.absorb_line_bytes(&raw);
                let found = until.is_some_and(|marker| line.contains(marker));
                lines.push(line);
                if found {
                    return Ok(lines);
                }
            }

            let n = self.transport.read_available(&mut buf)?;
            if n > 0 {
                self.pending.extend_from_slice(&buf[..n]);
                continue;
            }
            match until {
                None => return Ok(lines),
                Some(marker) if started.elapsed() >= self.command_timeout => {
                    debug!(
                        port = %self.transport.name(),
                        marker,
                        "Feedback marker did not arrive within {:?}",
                        self.command_timeout
                    );
                    return Ok(lines);
                }
                Some(_) => {}
            }
        }
    }

    /// Decode one feedback line and update the link state from it.
    ///
    /// Bytes that are not valid UTF-8 are logged and treated as an empty
    /// line.
    pub fn absorb_line_bytes(&mut self, raw: &[u8]) -> String {
        let line = match std::str::from_utf8(raw) {
            Ok(text) => text.trim_end_matches('\r').to_string(),
            Err(e) => {
                error!(port = %self.transport.name(), error = %e, "Undecodable feedback line {:?}", raw);
                String::new()
            }
        };
        debug!(port = %self.transport.name(), "<< {}", line);

        if let Some(body) = line.strip_prefix('+') {
            if body.split(' ').next() == Some("stop") {
                self.begin_stop_event();
            }
            self.params.absorb(body);
        } else if let Some(reason) = line.strip_prefix('!') {
            warn!(port = %self.transport.name(), reason, "Device reported");
            self.errors.push(reason.to_string());
        } else if line == STOP_LINE {
            self.begin_stop_event();
            self.stop_seen = true;
        }
        line
    }

    fn take_pending_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        Some(line)
    }

    /// Read raw bytes, serving buffered bytes before touching the transport.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        Ok(self.transport.read_available(buf)?)
    }

    /// Push bytes back so the next read sees them first.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut restored = Vec::with_capacity(bytes.len() + self.pending.len());
        restored.extend_from_slice(bytes);
        restored.append(&mut self.pending);
        self.pending = restored;
    }

    /// Write raw bytes (wave samples, output chunks) without framing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.transport.write_all(bytes)?;
        self.transport.flush()?;
        Ok(())
    }
}
