//! # IEEE C37.118 Header Frames
//!
//! A header frame carries free-form ASCII describing the data source.

use super::common::{FrameType, ParseError, PrefixFrame, Version};
use super::utils::{append_crc, validate_checksum};
use serde::{Deserialize, Serialize};

/// Represents an IEEE C37.118 header frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderFrame {
    pub prefix: PrefixFrame,
    pub data: String,
}

impl HeaderFrame {
    /// Creates a 2011 header frame for `idcode` with the given text.
    pub fn new(idcode: u16, data: impl Into<String>) -> Self {
        HeaderFrame {
            prefix: PrefixFrame::new(FrameType::Header, idcode, Version::V2011),
            data: data.into(),
        }
    }

    /// Parses a header frame.
    ///
    /// Non-ASCII bytes are replaced rather than rejected; a PMU's description text
    /// is informational only.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < PrefixFrame::LEN + 2 {
            return Err(ParseError::InvalidLength {
                message: format!("HeaderFrame: expected at least 16 bytes, got {}", bytes.len()),
            });
        }
        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Header {
            return Err(ParseError::InvalidFrameType {
                message: format!("HeaderFrame: got {}", prefix.frame_type()?),
            });
        }
        if prefix.framesize as usize != bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "HeaderFrame: FRAMESIZE is {}, buffer holds {}",
                    prefix.framesize,
                    bytes.len()
                ),
            });
        }
        validate_checksum(bytes)?;

        let data = String::from_utf8_lossy(&bytes[PrefixFrame::LEN..bytes.len() - 2])
            .trim_end_matches('\0')
            .to_string();
        Ok(HeaderFrame { prefix, data })
    }

    /// Serializes the frame, fixing FRAMESIZE and appending the checksum.
    pub fn to_hex(&self) -> Vec<u8> {
        let mut prefix = self.prefix.clone();
        prefix.framesize = (PrefixFrame::LEN + self.data.len() + 2) as u16;

        let mut result = Vec::with_capacity(prefix.framesize as usize);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(self.data.as_bytes());
        append_crc(&mut result);
        result
    }
}
