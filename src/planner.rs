//! Chunk geometry for the streaming engine.
//!
//! A chunk holds a whole number of scans. Digital lines share bytes on the
//! wire, so every chunk must also hold a whole number of packing groups
//! ("granules" of `8 / lines` scans). The planner picks the largest chunk that
//! fits the transfer limits, or for episodic runs the smallest chunk that tiles
//! an episode with the fewest chunks.

use std::time::Duration;

use crate::codec::{decode_mask, lane_count, scans_per_byte, validate_digital_lines};
use crate::error::{AppResult, DaqError};

/// Upper bounds for one chunk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerLimits {
    /// Longest span of acquisition time one chunk may cover
    pub max_chunk_duration: Duration,
    /// Largest payload size in bytes
    pub max_chunk_bytes: usize,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self {
            max_chunk_duration: Duration::from_millis(50),
            max_chunk_bytes: 4096,
        }
    }
}

/// Chunk layout for one episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodicPlan {
    /// Scans per chunk
    pub nscans: usize,
    /// Chunks per episode
    pub nchunks: usize,
}

/// Scan-count calculator for a fixed channel selection
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    analog_lanes: usize,
    digital_lines: usize,
    granularity: usize,
    rate_hz: u32,
    limits: PlannerLimits,
}

impl ChunkPlanner {
    /// Create a planner for the given analog and digital masks.
    ///
    /// Fails for digital selections that do not pack evenly into bytes and
    /// for a zero sampling rate.
    pub fn new(aimask: u8, dimask: u8, rate_hz: u32, limits: PlannerLimits) -> AppResult<Self> {
        validate_digital_lines(&decode_mask(dimask))?;
        let digital_lines = lane_count(dimask);
        let granularity = scans_per_byte(digital_lines).ok_or_else(|| {
            DaqError::Configuration(format!(
                "Unsupported digital line count {}",
                digital_lines
            ))
        })?;
        if rate_hz == 0 {
            return Err(DaqError::Configuration(
                "Sampling rate must be set before planning chunks".to_string(),
            ));
        }
        Ok(Self {
            analog_lanes: lane_count(aimask),
            digital_lines,
            granularity,
            rate_hz,
            limits,
        })
    }

    /// Scans per packing group: `8 / lines`, or 1 without digital lines.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Bytes occupied by one packing group of scans.
    pub fn bytes_per_granule(&self) -> usize {
        let digital = usize::from(self.digital_lines > 0);
        self.granularity * 2 * self.analog_lanes + digital
    }

    /// Payload size of a chunk of `nscans` scans.
    pub fn chunk_bytes(&self, nscans: usize) -> usize {
        let digital = if self.digital_lines > 0 {
            nscans.div_ceil(self.granularity)
        } else {
            0
        };
        nscans * 2 * self.analog_lanes + digital
    }

    /// Largest granule-aligned chunk within both the duration and size bounds.
    pub fn best_for_continuous(&self) -> usize {
        let g = self.granularity;
        let by_time = (self.limits.max_chunk_duration.as_micros() * u128::from(self.rate_hz)
            / 1_000_000) as usize;
        let by_bytes = match self.bytes_per_granule() {
            0 => usize::MAX,
            per_granule => self.limits.max_chunk_bytes / per_granule * g,
        };
        let nscans = by_time.min(by_bytes) / g * g;
        nscans.max(g)
    }

    /// Chunk size and count that cover `scans_per_episode` scans.
    ///
    /// The chunk count is the fewest the continuous limit allows; the chunk
    /// size is then the smallest granule multiple that covers the episode
    /// with that many chunks.
    pub fn best_for_episodic(&self, scans_per_episode: usize) -> EpisodicPlan {
        let g = self.granularity;
        let length = scans_per_episode.max(1);
        let cmax = self.best_for_continuous();
        let k = length.div_ceil(cmax);
        let nscans = length.div_ceil(k).div_ceil(g) * g;
        EpisodicPlan {
            nscans,
            nchunks: length.div_ceil(nscans),
        }
    }
}
