//! # IEEE C37.118 Measurement Units
//!
//! Conversion factors carried in configuration frames (PHUNIT, ANUNIT) and the
//! nominal line frequency (FNOM).

use super::common::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

fn expect_len(bytes: &[u8], len: usize, what: &str) -> Result<(), ParseError> {
    if bytes.len() != len {
        return Err(ParseError::InvalidLength {
            message: format!(
                "Invalid length for {}: expected {} bytes, got {}",
                what,
                len,
                bytes.len()
            ),
        });
    }
    Ok(())
}

/// Phasor conversion factor (PHUNIT).
///
/// # Fields
///
/// * `is_current`: `true` for a current phasor, `false` for voltage.
/// * `scale_factor`: Unsigned 24-bit factor in 10⁻⁵ V or A per bit. Ignored for
///   floating-point phasors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasorUnits {
    pub is_current: bool,
    pub scale_factor: u32,
}

impl PhasorUnits {
    /// Voltage phasor with the given raw scale factor.
    pub fn voltage(scale_factor: u32) -> Self {
        PhasorUnits {
            is_current: false,
            scale_factor: scale_factor & 0x00FF_FFFF,
        }
    }

    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, 4, "PhasorUnits")?;
        Ok(PhasorUnits {
            is_current: bytes[0] == 1,
            scale_factor: u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]),
        })
    }

    pub fn to_hex(&self) -> [u8; 4] {
        let mut bytes = self.scale_factor.to_be_bytes();
        bytes[0] = self.is_current as u8;
        bytes
    }

    /// Engineering units per integer count (V or A per bit).
    pub fn units_per_bit(&self) -> f64 {
        self.scale_factor as f64 * 1e-5
    }
}

/// Analog conversion factor (ANUNIT).
///
/// `measurement_type` is 0 for single point-on-wave, 1 for RMS, 2 for peak;
/// `scale` is a signed 24-bit user-defined factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogUnits {
    pub measurement_type: u8,
    pub scale: i32,
}

impl AnalogUnits {
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, 4, "AnalogUnits")?;
        // Sign-extend the 24-bit scale.
        let scale = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], 0]) >> 8;
        Ok(AnalogUnits {
            measurement_type: bytes[0],
            scale,
        })
    }

    pub fn to_hex(&self) -> [u8; 4] {
        let mut bytes = ((self.scale << 8) as u32).to_be_bytes();
        bytes.rotate_right(1);
        bytes[0] = self.measurement_type;
        bytes
    }
}

/// Nominal line frequency (FNOM). Bit 0 set means 50 Hz, clear means 60 Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominalFrequency {
    Hz50,
    Hz60,
}

impl NominalFrequency {
    /// Picks the closest standard frequency for a configured nominal value.
    pub fn from_hz(hz: f64) -> Self {
        if (hz - 50.0).abs() < (hz - 60.0).abs() {
            NominalFrequency::Hz50
        } else {
            NominalFrequency::Hz60
        }
    }

    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        expect_len(bytes, 2, "NominalFrequency")?;
        if bytes[1] & 0x01 != 0 {
            Ok(NominalFrequency::Hz50)
        } else {
            Ok(NominalFrequency::Hz60)
        }
    }

    pub fn to_hex(&self) -> [u8; 2] {
        match self {
            NominalFrequency::Hz50 => [0x00, 0x01],
            NominalFrequency::Hz60 => [0x00, 0x00],
        }
    }

    pub fn hz(&self) -> f64 {
        match self {
            NominalFrequency::Hz50 => 50.0,
            NominalFrequency::Hz60 => 60.0,
        }
    }
}

impl fmt::Display for NominalFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phasor_units() {
        let units = PhasorUnits::from_hex(&[0x01, 0x00, 0x01, 0x00]).unwrap();
        assert!(units.is_current);
        assert_eq!(units.scale_factor, 256);
        assert_eq!(units.to_hex(), [0x01, 0x00, 0x01, 0x00]);
        assert!(PhasorUnits::from_hex(&[0x00]).is_err());
    }

    #[test]
    fn test_analog_units_sign_extension() {
        let units = AnalogUnits::from_hex(&[0x01, 0xFF, 0xFF, 0xFE]).unwrap();
        assert_eq!(units.measurement_type, 1);
        assert_eq!(units.scale, -2);
        assert_eq!(units.to_hex(), [0x01, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_nominal_frequency() {
        assert_eq!(NominalFrequency::from_hex(&[0, 1]).unwrap().hz(), 50.0);
        assert_eq!(NominalFrequency::from_hex(&[0, 0]).unwrap().hz(), 60.0);
        assert_eq!(NominalFrequency::from_hz(59.9), NominalFrequency::Hz60);
        assert_eq!(NominalFrequency::from_hz(50.0), NominalFrequency::Hz50);
    }
}
