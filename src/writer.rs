//! Output chunk production with buffer-ahead backpressure.
//!
//! A [`StreamWriter`] turns one [`SampleSource`] per output channel into
//! framed output chunks (`data <nbytes>` followed by the payload) and keeps a
//! bounded number of them queued on the device. The device reports how many
//! chunks it consumed in every input frame header; [`StreamWriter::credit`]
//! takes those counts and [`StreamWriter::refill`] tops the queue back up.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

use crate::codec::{
    make_mask, pack_bits, samples_to_le_bytes, scans_per_byte, validate_channels,
    validate_digital_lines,
};
use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;

/// Fewest chunks kept ahead on the device once output runs.
pub const MIN_AHEAD_CHUNKS: usize = 2;

/// Where the samples of one output channel come from
pub enum SampleSource<T> {
    /// A finite buffer, played once
    Buffer(Vec<T>),
    /// Called whenever more samples are needed; never runs out
    Generator(Box<dyn FnMut() -> Vec<T>>),
}

impl<T> SampleSource<T> {
    /// Source backed by a fixed buffer.
    pub fn buffer(samples: impl Into<Vec<T>>) -> Self {
        SampleSource::Buffer(samples.into())
    }

    /// Source that calls `f` for more samples.
    pub fn generator<F>(f: F) -> Self
    where
        F: FnMut() -> Vec<T> + 'static,
    {
        SampleSource::Generator(Box::new(f))
    }

    /// Whether the source ends.
    pub fn is_finite(&self) -> bool {
        matches!(self, SampleSource::Buffer(_))
    }
}

impl<T> fmt::Debug for SampleSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleSource::Buffer(samples) => write!(f, "Buffer({} samples)", samples.len()),
            SampleSource::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// Output data for one commit, keyed by channel or line index
#[derive(Debug, Default)]
pub struct OutputPayload {
    /// Analog sources by channel
    pub analog: BTreeMap<u8, SampleSource<i16>>,
    /// Digital sources by line
    pub digital: BTreeMap<u8, SampleSource<u8>>,
}

impl OutputPayload {
    /// An empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `source` for analog `channel`.
    pub fn with_analog(mut self, channel: u8, source: SampleSource<i16>) -> Self {
        self.analog.insert(channel, source);
        self
    }

    /// Add `source` for digital `line`.
    pub fn with_digital(mut self, line: u8, source: SampleSource<u8>) -> Self {
        self.digital.insert(line, source);
        self
    }

    /// Whether no source was added.
    pub fn is_empty(&self) -> bool {
        self.analog.is_empty() && self.digital.is_empty()
    }

    /// Whether every source ends.
    pub fn is_finite(&self) -> bool {
        self.analog.values().all(SampleSource::is_finite)
            && self.digital.values().all(SampleSource::is_finite)
    }

    /// Mask of the analog outputs used.
    pub fn aomask(&self) -> u8 {
        make_mask(self.analog.keys().copied())
    }

    /// Mask of the digital outputs used.
    pub fn domask(&self) -> u8 {
        make_mask(self.digital.keys().copied())
    }

    /// Move every source of `other` into `self`.
    ///
    /// A channel claimed by both payloads is an error; `self` keeps the
    /// sources merged before the conflict.
    pub fn merge(&mut self, other: OutputPayload) -> AppResult<()> {
        for (channel, source) in other.analog {
            if self.analog.contains_key(&channel) {
                return Err(DaqError::Configuration(format!(
                    "Analog output channel {} supplied twice",
                    channel
                )));
            }
            self.analog.insert(channel, source);
        }
        for (line, source) in other.digital {
            if self.digital.contains_key(&line) {
                return Err(DaqError::Configuration(format!(
                    "Digital output line {} supplied twice",
                    line
                )));
            }
            self.digital.insert(line, source);
        }
        Ok(())
    }
}

/// Read position in one [`SampleSource`]
pub struct SourceCursor<T> {
    source: SampleSource<T>,
    position: usize,
    generated: VecDeque<T>,
    last: T,
}

impl<T: Copy + Default> SourceCursor<T> {
    /// Cursor at the start of `source`.
    pub fn new(source: SampleSource<T>) -> Self {
        Self {
            source,
            position: 0,
            generated: VecDeque::new(),
            last: T::default(),
        }
    }

    /// Next `n` samples. Once the source runs dry its last sample is held.
    pub fn next_block(&mut self, n: usize) -> Vec<T> {
        let mut block = Vec::with_capacity(n);
        match &mut self.source {
            SampleSource::Buffer(samples) => {
                let end = (self.position + n).min(samples.len());
                block.extend_from_slice(&samples[self.position..end]);
                self.position = end;
            }
            SampleSource::Generator(generate) => {
                while self.generated.len() < n {
                    let more = generate();
                    if more.is_empty() {
                        break;
                    }
                    self.generated.extend(more);
                }
                let take = n.min(self.generated.len());
                block.extend(self.generated.drain(..take));
            }
        }
        if let Some(&last) = block.last() {
            self.last = last;
        }
        block.resize(n, self.last);
        block
    }

    /// Whether the source ends.
    pub fn is_finite(&self) -> bool {
        self.source.is_finite()
    }

    /// Whether every sample was handed out.
    pub fn is_finished(&self) -> bool {
        match &self.source {
            SampleSource::Buffer(samples) => self.position >= samples.len(),
            SampleSource::Generator(_) => false,
        }
    }
}

/// Output side of an acquisition
pub struct StreamWriter {
    nscans: usize,
    analog: Vec<(u8, SourceCursor<i16>)>,
    digital: Vec<(u8, SourceCursor<u8>)>,
    ahead: usize,
    ahead_limit: usize,
    chunks_sent: usize,
    production_finished: bool,
}

impl StreamWriter {
    /// Writer producing chunks of `nscans` scans from `payload`, keeping at
    /// most `ahead_limit` chunks queued on the device.
    pub fn new(payload: OutputPayload, nscans: usize, ahead_limit: usize) -> AppResult<Self> {
        let channels: Vec<u8> = payload.analog.keys().copied().collect();
        validate_channels(&channels)?;
        let lines: Vec<u8> = payload.digital.keys().copied().collect();
        validate_digital_lines(&lines)?;
        let granularity = scans_per_byte(lines.len()).unwrap_or(1);
        if nscans == 0 || nscans % granularity != 0 {
            return Err(DaqError::Configuration(format!(
                "Output chunk of {} scans does not hold whole digital bytes",
                nscans
            )));
        }

        let analog: Vec<_> = payload
            .analog
            .into_iter()
            .map(|(ch, source)| (ch, SourceCursor::new(source)))
            .collect();
        let digital: Vec<_> = payload
            .digital
            .into_iter()
            .map(|(line, source)| (line, SourceCursor::new(source)))
            .collect();
        let production_finished = analog.iter().all(|(_, c)| c.is_finished())
            && digital.iter().all(|(_, c)| c.is_finished());

        debug!(
            nscans,
            ahead_limit,
            analog = analog.len(),
            digital = digital.len(),
            "Stream writer created"
        );
        Ok(Self {
            nscans,
            analog,
            digital,
            ahead: 0,
            ahead_limit,
            chunks_sent: 0,
            production_finished,
        })
    }

    /// Whether every source runs dry eventually.
    pub fn is_finite(&self) -> bool {
        self.analog.iter().all(|(_, c)| c.is_finite())
            && self.digital.iter().all(|(_, c)| c.is_finite())
    }

    /// Scans per output chunk.
    pub fn nscans(&self) -> usize {
        self.nscans
    }

    /// Chunks believed to be queued on the device.
    pub fn ahead(&self) -> usize {
        self.ahead
    }

    /// Most chunks kept queued on the device.
    pub fn ahead_limit(&self) -> usize {
        self.ahead_limit
    }

    /// Chunks written since creation.
    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }

    /// True once every source is finite and fully played out.
    pub fn production_finished(&self) -> bool {
        self.production_finished
    }

    /// Assemble the next chunk: analog section, then packed digital bytes.
    pub fn build_chunk(&mut self) -> Vec<u8> {
        let n = self.nscans;
        let blocks: Vec<Vec<i16>> = self
            .analog
            .iter_mut()
            .map(|(_, cursor)| cursor.next_block(n))
            .collect();
        let mut interleaved = Vec::with_capacity(n * blocks.len());
        for scan in 0..n {
            interleaved.extend(blocks.iter().map(|block| block[scan]));
        }
        let mut chunk = samples_to_le_bytes(&interleaved);

        if !self.digital.is_empty() {
            let lines = self.digital.len();
            let levels: Vec<Vec<u8>> = self
                .digital
                .iter_mut()
                .map(|(_, cursor)| cursor.next_block(n))
                .collect();
            let mut values = Vec::with_capacity(n * lines);
            for scan in 0..n {
                values.extend(levels.iter().map(|line| u8::from(line[scan] != 0)));
            }
            chunk.extend(pack_bits(&values, lines));
        }

        self.production_finished = self.analog.iter().all(|(_, c)| c.is_finished())
            && self.digital.iter().all(|(_, c)| c.is_finished());
        chunk
    }

    /// Send one chunk.
    ///
    /// Before the acquisition starts (`prefill`) the device acknowledges with
    /// `+data <buffered>`, which becomes the new ahead count. While running
    /// there is no acknowledgement and the chunk is counted locally.
    pub fn send_chunk(&mut self, link: &mut CommandLink, prefill: bool) -> AppResult<()> {
        let chunk = self.build_chunk();
        link.command(&format!("data {}", chunk.len()), false)?;
        link.write_raw(&chunk)?;
        if prefill {
            link.collect_feedback(Some("+data"))?;
            self.ahead = match link.params().get_int("data") {
                Some(buffered) => usize::try_from(buffered).unwrap_or(0),
                None => self.ahead + 1,
            };
        } else {
            self.ahead += 1;
        }
        self.chunks_sent += 1;
        trace!(
            chunk = self.chunks_sent,
            ahead = self.ahead,
            finished = self.production_finished,
            "Output chunk sent"
        );
        Ok(())
    }

    /// Account for chunks the device reports as played.
    pub fn credit(&mut self, consumed: u16) {
        self.ahead = self.ahead.saturating_sub(usize::from(consumed));
    }

    /// Top the device queue up to the ahead limit. Returns the number of
    /// chunks sent.
    pub fn refill(&mut self, link: &mut CommandLink) -> AppResult<usize> {
        let mut sent = 0;
        while self.ahead < self.ahead_limit && !self.production_finished {
            self.send_chunk(link, false)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Send up to the ahead limit before the acquisition starts.
    pub fn prefill(&mut self, link: &mut CommandLink) -> AppResult<usize> {
        let mut sent = 0;
        while sent < self.ahead_limit && !self.production_finished {
            self.send_chunk(link, true)?;
            sent += 1;
        }
        debug!(sent, ahead = self.ahead, "Output prefilled");
        Ok(sent)
    }
}

/// Chunks to keep queued on the device.
///
/// Without a lead time the device's own recommended depth is used. Otherwise
/// the lead time is converted to chunks, capped by the depth and floored at
/// [`MIN_AHEAD_CHUNKS`].
pub fn ahead_chunks(
    depth: usize,
    max_ahead: Option<Duration>,
    rate_hz: u32,
    nscans: usize,
) -> usize {
    ahead_chunks_with_floor(depth, max_ahead, rate_hz, nscans, MIN_AHEAD_CHUNKS)
}

/// [`ahead_chunks`] with a configurable floor.
pub fn ahead_chunks_with_floor(
    depth: usize,
    max_ahead: Option<Duration>,
    rate_hz: u32,
    nscans: usize,
    floor: usize,
) -> usize {
    match max_ahead {
        None => depth,
        Some(lead) => {
            let scans = (lead.as_micros() * u128::from(rate_hz) / 1_000_000) as usize;
            (scans / nscans.max(1)).min(depth).max(floor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{le_bytes_to_samples, unpack_bits};
    use crate::config::LinkSettings;
    use crate::transport::{Connector, MockConnector, MockDevice};

    fn link(device: &MockDevice) -> CommandLink {
        let transport = MockConnector::new(device.clone()).connect("mock0").unwrap();
        CommandLink::new(transport, &LinkSettings::default())
    }

    #[test]
    fn test_ahead_chunks_scenario() {
        // 500 ms at 10 kHz in 100-scan chunks
        let ahead = ahead_chunks(64, Some(Duration::from_millis(500)), 10_000, 100);
        assert_eq!(ahead, 50);
    }

    #[test]
    fn test_ahead_chunks_bounds() {
        assert_eq!(ahead_chunks(16, None, 10_000, 100), 16);
        assert_eq!(ahead_chunks(16, Some(Duration::from_secs(10)), 10_000, 100), 16);
        assert_eq!(ahead_chunks(16, Some(Duration::from_millis(1)), 10_000, 100), 2);
        assert_eq!(
            ahead_chunks_with_floor(16, Some(Duration::from_millis(1)), 10_000, 100, 4),
            4
        );
    }

    #[test]
    fn test_merge_rejects_duplicate_channel() {
        let mut a = OutputPayload::new().with_analog(0, SampleSource::buffer(vec![1i16]));
        let b = OutputPayload::new()
            .with_analog(1, SampleSource::buffer(vec![2i16]))
            .with_digital(0, SampleSource::buffer(vec![1u8]));
        a.merge(b).unwrap();
        assert_eq!(a.aomask(), 0b0011);
        assert_eq!(a.domask(), 0b0001);

        let c = OutputPayload::new().with_analog(1, SampleSource::buffer(vec![3i16]));
        assert!(a.merge(c).is_err());
    }

    #[test]
    fn test_cursor_holds_last_sample() {
        let mut cursor = SourceCursor::new(SampleSource::buffer(vec![1i16, 2, 3]));
        assert_eq!(cursor.next_block(2), vec![1, 2]);
        assert!(!cursor.is_finished());
        assert_eq!(cursor.next_block(4), vec![3, 3, 3, 3]);
        assert!(cursor.is_finished());
        assert_eq!(cursor.next_block(2), vec![3, 3]);
    }

    #[test]
    fn test_generator_never_finishes() {
        let mut counter = 0i16;
        let mut cursor = SourceCursor::new(SampleSource::generator(move || {
            counter += 1;
            vec![counter; 3]
        }));
        assert_eq!(cursor.next_block(4), vec![1, 1, 1, 2]);
        assert_eq!(cursor.next_block(2), vec![2, 2]);
        assert!(!cursor.is_finished());
    }

    #[test]
    fn test_chunk_layout() {
        let payload = OutputPayload::new()
            .with_analog(2, SampleSource::buffer(vec![20i16, 21, 22, 23]))
            .with_analog(0, SampleSource::buffer(vec![0i16, 1]))
            .with_digital(0, SampleSource::buffer(vec![1u8, 0, 1, 1]))
            .with_digital(1, SampleSource::buffer(vec![0u8, 0, 1, 0]));
        let mut writer = StreamWriter::new(payload, 4, 4).unwrap();
        let chunk = writer.build_chunk();

        let samples = le_bytes_to_samples(&chunk[..16]);
        assert_eq!(samples, vec![0, 20, 1, 21, 1, 22, 1, 23]);
        let levels = unpack_bits(&chunk[16..], 2);
        assert_eq!(levels, vec![1, 0, 0, 0, 1, 1, 1, 0]);
        assert!(writer.production_finished());
    }

    #[test]
    fn test_rejects_unaligned_chunk() {
        let payload = OutputPayload::new().with_digital(0, SampleSource::buffer(vec![1u8; 8]));
        assert!(StreamWriter::new(payload, 6, 4).is_err());
    }

    #[test]
    fn test_prefill_adopts_device_count_and_stops_when_finished() {
        let device = MockDevice::new();
        let mut link = link(&device);
        link.command("sampled 1 0 4", true).unwrap();

        let payload = OutputPayload::new().with_analog(0, SampleSource::buffer(vec![5i16; 10]));
        let mut writer = StreamWriter::new(payload, 4, 8).unwrap();
        let sent = writer.prefill(&mut link).unwrap();

        assert_eq!(sent, 3);
        assert_eq!(writer.ahead(), 3);
        assert!(writer.production_finished());
        let chunks = device.output_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(le_bytes_to_samples(&chunks[2]), vec![5, 5, 5, 5]);
    }

    #[test]
    fn test_refill_respects_limit() {
        let device = MockDevice::new();
        let mut link = link(&device);
        link.command("sampled 1 0 4", true).unwrap();
        link.command("start", true).unwrap();

        let payload = OutputPayload::new().with_analog(0, SampleSource::generator(|| vec![7i16; 16]));
        let mut writer = StreamWriter::new(payload, 4, 3).unwrap();
        assert_eq!(writer.refill(&mut link).unwrap(), 3);
        assert_eq!(writer.refill(&mut link).unwrap(), 0);
        writer.credit(2);
        assert_eq!(writer.ahead(), 1);
        assert_eq!(writer.refill(&mut link).unwrap(), 2);
        assert_eq!(device.buffered_chunks(), 5);
    }
}
