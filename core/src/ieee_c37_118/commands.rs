//! # IEEE C37.118 Command Frames
//!
//! Command frames are how a PDC asks a PMU for its header and configuration and
//! how it switches real-time data transmission on and off.

use super::common::{read_u16, FrameType, ParseError, PrefixFrame, Version};
use super::utils::{append_crc, validate_checksum};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Enumerates the command codes this crate sends and answers.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CommandType {
    TurnOffTransmission = 1,
    TurnOnTransmission = 2,
    SendHeaderFrame = 3,
    SendConfigFrame1 = 4,
    SendConfigFrame2 = 5,
    SendConfigFrame3 = 6,
}

impl CommandType {
    /// Maps a raw command word to a known command, if any.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(CommandType::TurnOffTransmission),
            2 => Some(CommandType::TurnOnTransmission),
            3 => Some(CommandType::SendHeaderFrame),
            4 => Some(CommandType::SendConfigFrame1),
            5 => Some(CommandType::SendConfigFrame2),
            6 => Some(CommandType::SendConfigFrame3),
            _ => None,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommandType::TurnOffTransmission => "Turn off transmission",
            CommandType::TurnOnTransmission => "Turn on transmission",
            CommandType::SendHeaderFrame => "Send header frame",
            CommandType::SendConfigFrame1 => "Send CFG-1 frame",
            CommandType::SendConfigFrame2 => "Send CFG-2 frame",
            CommandType::SendConfigFrame3 => "Send CFG-3 frame",
        };
        write!(f, "{}", text)
    }
}

/// Represents an IEEE C37.118 command frame.
///
/// # Fields
///
/// * `prefix`: Common frame prefix.
/// * `command`: 16-bit command word.
/// * `extended_data`: Optional extended frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub prefix: PrefixFrame,
    pub command: u16,
    pub extended_data: Option<Vec<u8>>,
}

impl CommandFrame {
    /// Creates a 2011 command frame for `idcode`.
    pub fn new(command: CommandType, idcode: u16) -> Self {
        CommandFrame {
            prefix: PrefixFrame::new(FrameType::Command, idcode, Version::V2011),
            command: command as u16,
            extended_data: None,
        }
    }

    /// Parses a command frame.
    ///
    /// # Returns
    ///
    /// * `Ok(CommandFrame)`: The parsed command frame.
    /// * `Err(ParseError)`: If the frame is short, not a command frame, has a bad
    ///   checksum, or its FRAMESIZE disagrees with the buffer length.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 18 {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "CommandFrame: Expected at least 18 bytes, but got {}",
                    bytes.len()
                ),
            });
        }
        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Command {
            return Err(ParseError::InvalidFrameType {
                message: format!("CommandFrame: got {}", prefix.frame_type()?),
            });
        }
        if prefix.framesize as usize != bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "CommandFrame: FRAMESIZE is {}, buffer holds {}",
                    prefix.framesize,
                    bytes.len()
                ),
            });
        }
        validate_checksum(bytes)?;

        let command = read_u16(bytes, 14)?;
        let extended_data = if bytes.len() > 18 {
            Some(bytes[16..bytes.len() - 2].to_vec())
        } else {
            None
        };

        Ok(CommandFrame {
            prefix,
            command,
            extended_data,
        })
    }

    /// Serializes the frame, fixing FRAMESIZE and appending the checksum.
    pub fn to_hex(&self) -> Vec<u8> {
        let extended_len = self.extended_data.as_ref().map_or(0, Vec::len);
        let mut prefix = self.prefix.clone();
        prefix.framesize = (PrefixFrame::LEN + 2 + extended_len + 2) as u16;

        let mut result = Vec::with_capacity(prefix.framesize as usize);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(&self.command.to_be_bytes());
        if let Some(data) = &self.extended_data {
            result.extend_from_slice(data);
        }
        append_crc(&mut result);
        result
    }

    /// Returns the decoded command, or `None` for codes outside `CommandType`.
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u16(self.command)
    }
}
