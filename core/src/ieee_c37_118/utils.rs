//! # IEEE C37.118 Frame Utilities
//!
//! CRC-CCITT checksums as specified in IEEE C37.118.2-2011 Appendix B, plus the
//! SOC/FRACSEC time helpers used when stamping outgoing frames.

use super::common::{FrameType, ParseError, PrefixFrame};
use bytes::{Buf, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Calculates the CRC-CCITT checksum (polynomial 0x1021, initial value 0xFFFF).
pub fn calculate_crc(buffer: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in buffer {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Validates the checksum of a complete frame.
///
/// # Returns
///
/// * `Ok(())` if the last two bytes match the CRC of the preceding bytes.
/// * `Err(ParseError::InvalidLength)` if the buffer is too short.
/// * `Err(ParseError::InvalidChecksum)` if the checksum does not match.
pub fn validate_checksum(buffer: &[u8]) -> Result<(), ParseError> {
    if buffer.len() < 2 {
        return Err(ParseError::InvalidLength {
            message: format!("Buffer too short: {}", buffer.len()),
        });
    }

    let calculated_crc = calculate_crc(&buffer[..buffer.len() - 2]);
    let frame_crc = u16::from_be_bytes([buffer[buffer.len() - 2], buffer[buffer.len() - 1]]);

    if calculated_crc != frame_crc {
        return Err(ParseError::InvalidChecksum {
            message: format!(
                "CRC Checksum Mismatch: Expected {:04X}, got {:04X}",
                calculated_crc, frame_crc
            ),
        });
    }
    Ok(())
}

/// Appends the CRC of `frame` to it.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = calculate_crc(frame);
    frame.extend_from_slice(&crc.to_be_bytes());
}

/// Takes the next complete, checksum-valid frame off the front of a stream buffer.
///
/// Bytes before the next plausible SYNC word are discarded, as is any candidate
/// whose FRAMESIZE or checksum does not hold up, so a reader recovers from
/// garbage or a torn frame. Returns `None` when more bytes are needed.
pub fn take_frame(buffer: &mut BytesMut) -> Option<BytesMut> {
    loop {
        match buffer.iter().position(|b| *b == 0xAA) {
            Some(0) => {}
            Some(skip) => buffer.advance(skip),
            None => {
                buffer.clear();
                return None;
            }
        }
        if buffer.len() < 4 {
            return None;
        }
        let sync = u16::from_be_bytes([buffer[0], buffer[1]]);
        let framesize = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
        if FrameType::from_sync(sync).is_err() || framesize < PrefixFrame::LEN + 2 {
            buffer.advance(1);
            continue;
        }
        if buffer.len() < framesize {
            return None;
        }
        if validate_checksum(&buffer[..framesize]).is_err() {
            buffer.advance(1);
            continue;
        }
        return Some(buffer.split_to(framesize));
    }
}

/// Encodes the current wall-clock time as SOC (4 bytes) followed by the time
/// quality byte and a 24-bit FRACSEC counted in `time_base` units.
pub fn now_to_hex(time_base: u32) -> [u8; 8] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    time_to_hex(now.as_secs(), now.subsec_nanos(), time_base)
}

/// Encodes an explicit time as SOC + FRACSEC.
pub fn time_to_hex(secs: u64, nanos: u32, time_base: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    let fracsec = ((nanos as u64 * time_base as u64) / 1_000_000_000) as u32 & 0x00FF_FFFF;
    buf[0..4].copy_from_slice(&(secs as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&fracsec.to_be_bytes());
    buf
}

/// Converts SOC and FRACSEC into seconds since the Unix epoch.
pub fn timestamp_secs(soc: u32, fracsec: u32, time_base: u32) -> f64 {
    let frac = if time_base == 0 {
        0.0
    } else {
        (fracsec & 0x00FF_FFFF) as f64 / time_base as f64
    };
    soc as f64 + frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_value() {
        // CRC-CCITT (0xFFFF) of "123456789".
        assert_eq!(calculate_crc(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_validate_checksum() {
        let mut frame = vec![0xAA, 0x01, 0x00, 0x10];
        append_crc(&mut frame);
        assert!(validate_checksum(&frame).is_ok());

        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            validate_checksum(&frame),
            Err(ParseError::InvalidChecksum { .. })
        ));
        assert!(validate_checksum(&[0x01]).is_err());
    }

    #[test]
    fn test_take_frame_resyncs() {
        use super::super::commands::{CommandFrame, CommandType};

        let frame = CommandFrame::new(CommandType::TurnOnTransmission, 3).to_hex();
        let mut corrupt = frame.clone();
        corrupt[15] ^= 0x10;

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0x00, 0xAA, 0xFF]);
        buffer.extend_from_slice(&corrupt);
        buffer.extend_from_slice(&frame);
        buffer.extend_from_slice(&frame[..6]);

        let taken = take_frame(&mut buffer).unwrap();
        assert_eq!(&taken[..], &frame[..]);
        assert!(take_frame(&mut buffer).is_none());
        assert_eq!(&buffer[..], &frame[..6], "partial frame stays buffered");
    }

    #[test]
    fn test_time_round_trip() {
        let buf = time_to_hex(1_600_000_000, 250_000_000, 1_000_000);
        assert_eq!(buf[4], 0, "time quality byte must stay clear");
        let soc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let fracsec = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]);
        assert_eq!(fracsec, 250_000);
        let t = timestamp_secs(soc, fracsec, 1_000_000);
        assert!((t - 1_600_000_000.25).abs() < 1e-6);
    }
}
