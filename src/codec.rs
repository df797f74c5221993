//! Channel masks, digital line packing and the wave checksum.
//!
//! Everything here is a pure function over plain slices so the same code
//! serves the session (building masks from handle channel lists), the reader
//! and writer (bit packing) and the wave upload path (checksum).

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{AppResult, DaqError};

/// Number of analog or digital lanes the instrument exposes per kind.
pub const LANE_COUNT: u8 = 4;

const WAVE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// OR of `1 << i` for every index. An empty input yields 0.
pub fn make_mask<I>(indices: I) -> u8
where
    I: IntoIterator,
    I::Item: Into<u8>,
{
    indices
        .into_iter()
        .fold(0u8, |mask, idx| mask | (1u8 << (idx.into() & 0x07)))
}

/// Indices of the set bits of `mask`, in ascending order.
pub fn decode_mask(mask: u8) -> Vec<u8> {
    (0..8u8).filter(|bit| mask & (1 << bit) != 0).collect()
}

/// Number of active lanes in `mask`.
pub fn lane_count(mask: u8) -> usize {
    mask.count_ones() as usize
}

/// Reject lane indices the instrument does not have.
pub fn validate_channels(channels: &[u8]) -> AppResult<()> {
    for &ch in channels {
        if ch >= LANE_COUNT {
            return Err(DaqError::Configuration(format!(
                "Unsupported channel {}. Must be 0-{}",
                ch,
                LANE_COUNT - 1
            )));
        }
    }
    let mut seen = 0u8;
    for &ch in channels {
        if seen & (1 << ch) != 0 {
            return Err(DaqError::Configuration(format!(
                "Channel {} listed twice",
                ch
            )));
        }
        seen |= 1 << ch;
    }
    Ok(())
}

/// Check a digital line selection against the packing rules.
///
/// Lines share bytes on the wire, so the count must divide 8 (1, 2 or 4
/// lines, never 3) and the lines must be consecutive and in ascending order.
/// The empty selection is valid and carries no digital payload.
pub fn validate_digital_lines(lines: &[u8]) -> AppResult<()> {
    validate_channels(lines)?;
    if lines.len() == 3 {
        return Err(DaqError::Configuration(
            "Unsupported line combination: 3 lines do not pack into a byte".to_string(),
        ));
    }
    for pair in lines.windows(2) {
        if pair[1] != pair[0] + 1 {
            return Err(DaqError::Configuration(format!(
                "Unsupported line combination {:?}: lines must be consecutive and ascending",
                lines
            )));
        }
    }
    Ok(())
}

/// Scans sharing one byte on the wire for `lines` active digital lines.
///
/// Returns `None` for line counts that do not divide a byte evenly. Zero
/// lines are treated as one scan per (empty) unit.
pub fn scans_per_byte(lines: usize) -> Option<usize> {
    match lines {
        0 => Some(1),
        1 | 2 | 4 => Some(8 / lines),
        _ => None,
    }
}

/// Pack per-scan line values (scan-major, line-minor, non-zero = high) into
/// bytes, least significant bit first.
///
/// `values.len()` must be a whole number of scans; a trailing partial byte is
/// zero-filled.
pub fn pack_bits(values: &[u8], lines: usize) -> Vec<u8> {
    if lines == 0 {
        return Vec::new();
    }
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (bit, &value) in values.iter().enumerate() {
        if value != 0 {
            packed[bit / 8] |= 1 << (bit % 8);
        }
    }
    packed
}

/// Inverse of [`pack_bits`]: one 0/1 value per scan per line.
pub fn unpack_bits(packed: &[u8], lines: usize) -> Vec<u8> {
    if lines == 0 {
        return Vec::new();
    }
    packed
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 1))
        .collect()
}

/// Serialize samples as the little-endian byte stream the device expects.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode a little-endian sample stream. A trailing odd byte is ignored.
pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Checksum the firmware computes over an uploaded wave buffer.
///
/// CRC-32 (ISO-HDLC) over the raw little-endian sample bytes. Any single
/// sample change alters a burst of at most 16 bits, which CRC-32 always
/// detects.
pub fn checksum(samples: &[i16]) -> u32 {
    checksum_bytes(&samples_to_le_bytes(samples))
}

/// Same checksum over an already serialized byte stream.
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    WAVE_CRC.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_make_mask_scenario() {
        assert_eq!(make_mask([0u8, 2]), 0b0101);
        assert_eq!(make_mask([0u8, 2]), 5);
    }

    #[test]
    fn test_make_mask_empty() {
        assert_eq!(make_mask(Vec::<u8>::new()), 0);
    }

    #[test]
    fn test_mask_round_trip_all_subsets() {
        for mask in 0u8..16 {
            let indices = decode_mask(mask);
            assert_eq!(make_mask(indices.iter().copied()), mask);
            assert!(indices.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_digital_line_validation() {
        assert!(validate_digital_lines(&[]).is_ok());
        assert!(validate_digital_lines(&[2]).is_ok());
        assert!(validate_digital_lines(&[1, 2]).is_ok());
        assert!(validate_digital_lines(&[0, 1, 2, 3]).is_ok());

        assert!(validate_digital_lines(&[0, 1, 2]).is_err());
        assert!(validate_digital_lines(&[1, 3]).is_err());
        assert!(validate_digital_lines(&[0, 3]).is_err());
        assert!(validate_digital_lines(&[2, 1]).is_err());
        assert!(validate_digital_lines(&[4]).is_err());
    }

    #[test]
    fn test_channel_validation_rejects_duplicates() {
        assert!(validate_channels(&[0, 3]).is_ok());
        assert!(validate_channels(&[1, 1]).is_err());
    }

    #[test]
    fn test_scans_per_byte() {
        assert_eq!(scans_per_byte(1), Some(8));
        assert_eq!(scans_per_byte(2), Some(4));
        assert_eq!(scans_per_byte(4), Some(2));
        assert_eq!(scans_per_byte(3), None);
    }

    #[test]
    fn test_pack_bits_lsb_first() {
        // two lines, four scans: (1,0) (0,1) (1,1) (0,0)
        let values = [1, 0, 0, 1, 1, 1, 0, 0];
        let packed = pack_bits(&values, 2);
        assert_eq!(packed, vec![0b0011_1001]);
        assert_eq!(unpack_bits(&packed, 2), values.to_vec());
    }

    #[test]
    fn test_le_sample_bytes() {
        let bytes = samples_to_le_bytes(&[1, -2]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xfe, 0xff]);
        assert_eq!(le_bytes_to_samples(&bytes), vec![1, -2]);
    }

    #[test]
    fn test_checksum_deterministic() {
        let wave: Vec<i16> = (0..1000).map(|k| (k * 37 % 2001 - 1000) as i16).collect();
        assert_eq!(checksum(&wave), checksum(&wave.clone()));
        assert_eq!(checksum(&wave), checksum_bytes(&samples_to_le_bytes(&wave)));
    }

    #[test]
    fn test_checksum_detects_single_sample_change() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(1..512);
            let wave: Vec<i16> = (0..len).map(|_| rng.gen()).collect();
            let reference = checksum(&wave);

            let mut perturbed = wave.clone();
            let idx = rng.gen_range(0..len);
            let mut replacement: i16 = rng.gen();
            while replacement == perturbed[idx] {
                replacement = rng.gen();
            }
            perturbed[idx] = replacement;
            assert_ne!(checksum(&perturbed), reference);
        }
    }
}
