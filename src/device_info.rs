//! Device identity, capabilities and raw calibration.
//!
//! The firmware describes itself through four queries:
//!
//! ```text
//! picodaq -> +picodaq <firmware> <serial>
//! info    -> +info HW=1.0,AI=4,AO=4,DI=4,DO=4,F=500,VI=±10,VO=±10
//! islope  -> +islope <gain permille>,<offset mV>
//! oslope  -> +oslope <gain permille>,<offset mV>
//! ```
//!
//! `F` is the maximum sampling rate in kHz. Voltage ranges are either
//! symmetric (`±10`) or unipolar (`5`).

use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;

/// Full-scale voltage span of a converter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRange {
    /// Lower end in volts
    pub min: f64,
    /// Upper end in volts
    pub max: f64,
}

impl VoltageRange {
    /// Parse `±10` (symmetric) or `5` (unipolar).
    pub fn parse(text: &str) -> AppResult<Self> {
        let (symmetric, magnitude) = match text.strip_prefix('±') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let value: f64 = magnitude
            .parse()
            .map_err(|_| DaqError::Protocol(format!("Invalid voltage range '{}'", text)))?;
        Ok(if symmetric {
            Self {
                min: -value,
                max: value,
            }
        } else {
            Self {
                min: 0.0,
                max: value,
            }
        })
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} V to {} V", self.min, self.max)
    }
}

/// What the connected instrument reports about itself
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Firmware version string
    pub firmware: String,
    /// Serial number as reported
    pub serial_number: String,
    /// Hardware revision
    pub hardware: String,
    /// Analog input channels
    pub analog_in_count: u8,
    /// Analog output channels
    pub analog_out_count: u8,
    /// Digital input lines
    pub digital_in_count: u8,
    /// Digital output lines
    pub digital_out_count: u8,
    /// Highest supported sampling rate
    pub max_rate_hz: u32,
    /// Span of the analog inputs
    pub analog_in_range: VoltageRange,
    /// Span of the analog outputs
    pub analog_out_range: VoltageRange,
}

/// Conversion coefficients between raw codes and volts
///
/// Input: `volts = raw * input_gain + input_offset`.
/// Output: `raw = volts * output_gain + output_offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Volts per input code
    pub input_gain: f64,
    /// Input offset in volts
    pub input_offset: f64,
    /// Output codes per volt
    pub output_gain: f64,
    /// Output offset in codes
    pub output_offset: f64,
}

impl DeviceInfo {
    /// Build from the `+picodaq` and `+info` reply lines.
    pub fn parse(identify: &str, info: &str) -> AppResult<Self> {
        let mut ident = identify.trim().split(' ');
        let (Some(_), Some(firmware), Some(serial)) = (ident.next(), ident.next(), ident.next())
        else {
            return Err(DaqError::Protocol(format!(
                "Malformed identification '{}'",
                identify
            )));
        };

        let fields = info.trim().rsplit(' ').next().unwrap_or_default();
        let mut aux = BTreeMap::new();
        for kv in fields.split(',') {
            let (key, value) = kv.split_once('=').ok_or_else(|| {
                DaqError::Protocol(format!("Malformed info field '{}'", kv))
            })?;
            aux.insert(key, value);
        }
        let field = |key: &str| -> AppResult<&str> {
            aux.get(key)
                .copied()
                .ok_or_else(|| DaqError::Protocol(format!("Info reply lacks '{}'", key)))
        };
        let count = |key: &str| -> AppResult<u8> {
            field(key)?
                .parse()
                .map_err(|_| DaqError::Protocol(format!("Invalid count for '{}'", key)))
        };
        let max_khz: u32 = field("F")?
            .parse()
            .map_err(|_| DaqError::Protocol("Invalid maximum rate".to_string()))?;

        Ok(Self {
            firmware: firmware.to_string(),
            serial_number: serial.to_string(),
            hardware: field("HW")?.to_string(),
            analog_in_count: count("AI")?,
            analog_out_count: count("AO")?,
            digital_in_count: count("DI")?,
            digital_out_count: count("DO")?,
            max_rate_hz: max_khz * 1000,
            analog_in_range: VoltageRange::parse(field("VI")?)?,
            analog_out_range: VoltageRange::parse(field("VO")?)?,
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "firmware:      {}", self.firmware)?;
        writeln!(f, "hardware:      {}", self.hardware)?;
        writeln!(f, "serial number: {}", self.serial_number)?;
        writeln!(
            f,
            "channels:      AI {} / AO {} / DI {} / DO {}",
            self.analog_in_count,
            self.analog_out_count,
            self.digital_in_count,
            self.digital_out_count
        )?;
        writeln!(f, "max rate:      {} Hz", self.max_rate_hz)?;
        writeln!(f, "input range:   {}", self.analog_in_range)?;
        write!(f, "output range:  {}", self.analog_out_range)
    }
}

fn parse_slope(key: &str, text: &str) -> AppResult<(f64, f64)> {
    let mut parts = text.split(',').map(|p| p.trim().parse::<f64>());
    match (parts.next(), parts.next()) {
        (Some(Ok(gain)), Some(Ok(offset))) => Ok((gain, offset)),
        _ => Err(DaqError::Protocol(format!(
            "Malformed {} reply '{}'",
            key, text
        ))),
    }
}

impl Calibration {
    /// Derive coefficients from the `islope`/`oslope` values (gain trim in
    /// permille, offset in millivolts) and the converter ranges.
    pub fn from_slopes(info: &DeviceInfo, islope: &str, oslope: &str) -> AppResult<Self> {
        let (in_trim, in_offset) = parse_slope("islope", islope)?;
        let (out_trim, out_offset) = parse_slope("oslope", oslope)?;

        let input_gain = info.analog_in_range.max * (1.0 - in_trim / 1e3) / 32767.5;
        let input_offset = -in_offset / 1e3;
        let output_gain = 32767.99 / info.analog_out_range.max / (1.0 + out_trim / 1e3);
        let output_offset = -output_gain * out_offset / 1e3;

        Ok(Self {
            input_gain,
            input_offset,
            output_gain,
            output_offset,
        })
    }

    /// Volts for a raw input code.
    pub fn input_volts(&self, raw: i16) -> f64 {
        f64::from(raw) * self.input_gain + self.input_offset
    }

    /// Raw output code for a voltage, saturated to the converter range.
    pub fn output_code(&self, volts: f64) -> i16 {
        let code = (volts * self.output_gain + self.output_offset).round();
        code.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

fn reply_line(lines: &[String], marker: &str) -> AppResult<String> {
    lines
        .iter()
        .rev()
        .find_map(|line| line.find(marker).map(|pos| line[pos..].to_string()))
        .ok_or_else(|| DaqError::Protocol(format!("No '{}' reply from device", marker)))
}

/// Run the identification queries on an open link.
pub fn query(link: &mut CommandLink) -> AppResult<(DeviceInfo, Calibration)> {
    let identify = reply_line(&link.command("picodaq", true)?, "+picodaq")?;
    let info_line = reply_line(&link.command("info", true)?, "+info")?;
    link.command("islope", true)?;
    link.command("oslope", true)?;

    let info = DeviceInfo::parse(&identify, &info_line)?;
    let slope = |key: &str| -> AppResult<String> {
        link.params()
            .get(key)
            .map(ToString::to_string)
            .ok_or_else(|| DaqError::Protocol(format!("No '{}' reply from device", key)))
    };
    let calibration = Calibration::from_slopes(&info, &slope("islope")?, &slope("oslope")?)?;
    debug!(
        firmware = %info.firmware,
        serial = %info.serial_number,
        "Device identified"
    );
    Ok((info, calibration))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: &str = "+picodaq 1.3 E6614103E7435B2F";
    const INFO: &str = "+info HW=1.0,AI=4,AO=2,DI=4,DO=4,F=500,VI=±10,VO=5";

    #[test]
    fn test_parse_info() {
        let info = DeviceInfo::parse(IDENT, INFO).unwrap();
        assert_eq!(info.firmware, "1.3");
        assert_eq!(info.serial_number, "E6614103E7435B2F");
        assert_eq!(info.hardware, "1.0");
        assert_eq!(info.analog_out_count, 2);
        assert_eq!(info.max_rate_hz, 500_000);
        assert_eq!(info.analog_in_range, VoltageRange { min: -10.0, max: 10.0 });
        assert_eq!(info.analog_out_range, VoltageRange { min: 0.0, max: 5.0 });
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        assert!(DeviceInfo::parse(IDENT, "+info HW=1.0,AI=4").is_err());
        assert!(DeviceInfo::parse("+picodaq", INFO).is_err());
    }

    #[test]
    fn test_calibration_coefficients() {
        let info = DeviceInfo::parse(IDENT, INFO).unwrap();
        let cal = Calibration::from_slopes(&info, "1.5,-2", "-0.8,3.1").unwrap();
        assert!((cal.input_gain - 10.0 * (1.0 - 0.0015) / 32767.5).abs() < 1e-12);
        assert!((cal.input_offset - 0.002).abs() < 1e-12);
        let ogain = 32767.99 / 5.0 / (1.0 - 0.0008);
        assert!((cal.output_gain - ogain).abs() < 1e-9);
        assert!((cal.output_offset + ogain * 0.0031).abs() < 1e-9);
    }

    #[test]
    fn test_output_code_saturates() {
        let info = DeviceInfo::parse(IDENT, INFO).unwrap();
        let cal = Calibration::from_slopes(&info, "0,0", "0,0").unwrap();
        assert_eq!(cal.output_code(100.0), i16::MAX);
        assert_eq!(cal.output_code(0.0), 0);
    }

    #[test]
    fn test_malformed_slope() {
        let info = DeviceInfo::parse(IDENT, INFO).unwrap();
        assert!(Calibration::from_slopes(&info, "abc", "0,0").is_err());
    }
}
