//! # IEEE C37.118 Common Types
//!
//! Shared building blocks for every frame the PMU server and PDC client exchange:
//! the parse error type, the standard version carried in the SYNC word, the frame
//! type bits, and the 14-byte prefix common to all frames.
//!
//! ## Key Components
//!
//! - `ParseError`: Enumerates errors encountered while decoding a frame.
//! - `Version`: IEEE C37.118 standard revision derived from the SYNC field.
//! - `FrameType`: Frame kind encoded in SYNC bits 6-4.
//! - `PrefixFrame`: SYNC, FRAMESIZE, IDCODE, SOC and FRACSEC fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Represents errors that can occur during IEEE C37.118 frame parsing.
///
/// # Variants
///
/// * `InvalidLength`: Frame length is too short or does not match FRAMESIZE.
/// * `InvalidFrameType`: Leading byte or frame type bits are invalid.
/// * `InvalidChecksum`: CRC checksum does not match the calculated value.
/// * `InvalidFormat`: Frame content does not conform to the standard.
/// * `VersionNotSupported`: The frame kind is recognized but not decoded here.
/// * `UnknownVersion`: Version bits in the SYNC field are unrecognized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Invalid length: {message}")]
    InvalidLength { message: String },
    #[error("Invalid frame type: {message}")]
    InvalidFrameType { message: String },
    #[error("Invalid checksum: {message}")]
    InvalidChecksum { message: String },
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },
    #[error("Version not supported: {message}")]
    VersionNotSupported { message: String },
    #[error("Unknown version: {message}")]
    UnknownVersion { message: String },
}

/// Tracks the IEEE C37.118 standard version based on the SYNC field.
///
/// # Variants
///
/// * `V2005`: IEEE C37.118-2005 (SYNC version 0x1).
/// * `V2011`: IEEE C37.118.2-2011 (SYNC version 0x2).
/// * `V2024`: IEEE C37.118.2-2024 (SYNC version 0x3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Version {
    V2005,
    #[default]
    V2011,
    V2024,
}

impl Version {
    /// Creates a `Version` from the SYNC field's version bits (3-0).
    ///
    /// # Returns
    ///
    /// * `Ok(Version)`: The corresponding version.
    /// * `Err(ParseError::UnknownVersion)`: If the version bits are unrecognized.
    pub fn from_sync(sync: u16) -> Result<Self, ParseError> {
        match sync & 0x000F {
            0x1 => Ok(Version::V2005),
            0x2 => Ok(Version::V2011),
            0x3 => Ok(Version::V2024),
            _ => Err(ParseError::UnknownVersion {
                message: format!("Unsupported version: 0x{:04X}", sync),
            }),
        }
    }

    fn bits(self) -> u16 {
        match self {
            Version::V2005 => 0x1,
            Version::V2011 => 0x2,
            Version::V2024 => 0x3,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V2005 => write!(f, "IEEE Std C37.118-2005"),
            Version::V2011 => write!(f, "IEEE Std C37.118.2-2011"),
            Version::V2024 => write!(f, "IEEE Std C37.118.2-2024"),
        }
    }
}

/// Represents the type of an IEEE C37.118 frame (SYNC bits 6-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Header,
    Config1,
    Config2,
    Config3,
    Command,
}

impl FrameType {
    /// Extracts the frame type from the SYNC field.
    ///
    /// # Returns
    ///
    /// * `Ok(FrameType)`: The corresponding frame type.
    /// * `Err(ParseError::InvalidFrameType)`: If the leading byte is not 0xAA or the
    ///   frame type bits are reserved.
    pub fn from_sync(sync: u16) -> Result<FrameType, ParseError> {
        if (sync >> 8) != 0xAA {
            return Err(ParseError::InvalidFrameType {
                message: format!("Invalid first byte: 0x{:02X}, expected 0xAA", sync >> 8),
            });
        }
        match (sync >> 4) & 0x7 {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Header),
            2 => Ok(FrameType::Config1),
            3 => Ok(FrameType::Config2),
            4 => Ok(FrameType::Command),
            5 => Ok(FrameType::Config3),
            bits => Err(ParseError::InvalidFrameType {
                message: format!("Invalid frame type bits: {}", bits),
            }),
        }
    }

    fn bits(self) -> u16 {
        match self {
            FrameType::Data => 0,
            FrameType::Header => 1,
            FrameType::Config1 => 2,
            FrameType::Config2 => 3,
            FrameType::Command => 4,
            FrameType::Config3 => 5,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "Data Frame"),
            FrameType::Header => write!(f, "Header Frame"),
            FrameType::Config1 => write!(f, "Configuration Frame 1"),
            FrameType::Config2 => write!(f, "Configuration Frame 2"),
            FrameType::Config3 => write!(f, "Configuration Frame 3"),
            FrameType::Command => write!(f, "Command Frame"),
        }
    }
}

/// Constructs a SYNC field: leading byte 0xAA, frame type bits 6-4, version bits 3-0.
pub fn create_sync(version: Version, frame_type: FrameType) -> u16 {
    (0xAA << 8) | (frame_type.bits() << 4) | version.bits()
}

/// Represents the common prefix structure for IEEE C37.118 frames.
///
/// # Fields
///
/// * `sync`: 16-bit SYNC field (frame type and version).
/// * `framesize`: Total frame length in bytes, checksum included.
/// * `idcode`: Device identification code or stream identifier.
/// * `soc`: Second-of-century timestamp (Unix epoch).
/// * `leapbyte`: Time quality and leap second flags.
/// * `fracsec`: Fractional second count in units of the configured time base.
/// * `version`: Version derived from `sync` (not serialized).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixFrame {
    pub sync: u16,
    pub framesize: u16,
    pub idcode: u16,
    pub soc: u32,
    pub leapbyte: u8,
    pub fracsec: u32,
    #[serde(skip)]
    pub version: Version,
}

impl PrefixFrame {
    /// Byte length of the prefix.
    pub const LEN: usize = 14;

    /// Creates a prefix for the given frame type with zeroed time fields.
    pub fn new(frame_type: FrameType, idcode: u16, version: Version) -> Self {
        PrefixFrame {
            sync: create_sync(version, frame_type),
            framesize: Self::LEN as u16,
            idcode,
            soc: 0,
            leapbyte: 0,
            fracsec: 0,
            version,
        }
    }

    /// Parses a `PrefixFrame` from the first 14 bytes of a frame.
    ///
    /// # Returns
    ///
    /// * `Ok(PrefixFrame)`: The parsed prefix frame.
    /// * `Err(ParseError)`: If the slice is too short or the SYNC word is invalid.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < Self::LEN {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "Too few bytes to parse PrefixFrame: Expected at least 14 bytes, but got {}",
                    bytes.len()
                ),
            });
        }
        let sync = u16::from_be_bytes([bytes[0], bytes[1]]);
        FrameType::from_sync(sync)?;
        let version = Version::from_sync(sync)?;

        Ok(PrefixFrame {
            sync,
            framesize: u16::from_be_bytes([bytes[2], bytes[3]]),
            idcode: u16::from_be_bytes([bytes[4], bytes[5]]),
            soc: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            leapbyte: bytes[10],
            fracsec: u32::from_be_bytes([0, bytes[11], bytes[12], bytes[13]]),
            version,
        })
    }

    /// Converts the `PrefixFrame` to a 14-byte array.
    pub fn to_hex(&self) -> [u8; 14] {
        let mut result = [0u8; 14];
        result[0..2].copy_from_slice(&self.sync.to_be_bytes());
        result[2..4].copy_from_slice(&self.framesize.to_be_bytes());
        result[4..6].copy_from_slice(&self.idcode.to_be_bytes());
        result[6..10].copy_from_slice(&self.soc.to_be_bytes());
        result[10] = self.leapbyte;
        result[11..14].copy_from_slice(&self.fracsec.to_be_bytes()[1..4]);
        result
    }

    /// Returns the frame type encoded in the SYNC field.
    pub fn frame_type(&self) -> Result<FrameType, ParseError> {
        FrameType::from_sync(self.sync)
    }

    /// Sets SOC and FRACSEC from an 8-byte time buffer produced by `utils::now_to_hex`.
    pub fn set_time(&mut self, time_buf: [u8; 8]) {
        self.soc = u32::from_be_bytes([time_buf[0], time_buf[1], time_buf[2], time_buf[3]]);
        self.leapbyte = time_buf[4];
        self.fracsec = u32::from_be_bytes([0, time_buf[5], time_buf[6], time_buf[7]]);
    }
}

/// Reads a big-endian `u16` at `offset`, reporting a length error instead of panicking.
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, ParseError> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ParseError::InvalidLength {
            message: format!("Expected 2 bytes at offset {}, got {}", offset, bytes.len()),
        })
}

/// Reads a big-endian `u32` at `offset`, reporting a length error instead of panicking.
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ParseError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ParseError::InvalidLength {
            message: format!("Expected 4 bytes at offset {}, got {}", offset, bytes.len()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sync() {
        let sync = create_sync(Version::V2005, FrameType::Config1);
        assert_eq!(sync.to_be_bytes(), [0xAA, 0x21]);

        let frame_types = [
            FrameType::Data,
            FrameType::Header,
            FrameType::Config1,
            FrameType::Config2,
            FrameType::Config3,
            FrameType::Command,
        ];
        for version in [Version::V2005, Version::V2011, Version::V2024] {
            for frame_type in frame_types {
                let sync = create_sync(version, frame_type);
                assert_eq!(sync >> 8, 0xAA);
                assert_eq!(FrameType::from_sync(sync).unwrap(), frame_type);
                assert_eq!(Version::from_sync(sync).unwrap(), version);
            }
        }
    }

    #[test]
    fn test_prefix_rejects_bad_leading_byte() {
        let mut bytes = PrefixFrame::new(FrameType::Data, 7, Version::V2011).to_hex();
        bytes[0] = 0xAB;
        assert!(matches!(
            PrefixFrame::from_hex(&bytes),
            Err(ParseError::InvalidFrameType { .. })
        ));
    }

    #[test]
    fn test_prefix_time_fields() {
        let mut prefix = PrefixFrame::new(FrameType::Header, 1410, Version::V2011);
        prefix.set_time([0x5E, 0x0B, 0xE1, 0x00, 0x00, 0x01, 0x86, 0xA0]);
        let parsed = PrefixFrame::from_hex(&prefix.to_hex()).unwrap();
        assert_eq!(parsed.soc, 0x5E0BE100);
        assert_eq!(parsed.fracsec, 100_000);
        assert_eq!(parsed.idcode, 1410);
        assert_eq!(parsed.frame_type().unwrap(), FrameType::Header);
    }
}
