//! DiME-style framing used between `TcpBusClient` and the bus hub.
//!
//! Every message is the 4-byte magic `DiME`, a big-endian `u32` payload length, and a
//! JSON `Envelope`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;

pub const MAGIC: &[u8; 4] = b"DiME";
pub const HEADER_LEN: usize = 8;
/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Messages exchanged with the hub.
///
/// Clients send `Register` once, then any mix of `Send`, `Broadcast` and `Sync`.
/// The hub answers each `Sync` with exactly one `Var`, `Empty` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Envelope {
    Register { name: String },
    Send { target: String, name: String, value: Value },
    Broadcast { name: String, value: Value },
    Sync { timeout_ms: u64 },
    Var { name: String, value: Value },
    Empty,
    Error { message: String },
}

/// Serializes an envelope into a complete frame.
pub fn encode(envelope: &Envelope) -> Result<BytesMut, BusError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| BusError::Protocol(format!("cannot encode envelope: {}", e)))?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(MAGIC);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

/// Takes one complete frame off the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed. A bad magic or oversized length
/// is a protocol error: the stream cannot be resynchronized.
pub fn decode(buffer: &mut BytesMut) -> Result<Option<Envelope>, BusError> {
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }
    if &buffer[0..4] != MAGIC {
        return Err(BusError::Protocol(format!(
            "bad magic {:02X?}",
            &buffer[0..4]
        )));
    }
    let len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(BusError::Protocol(format!("payload of {} bytes is too large", len)));
    }
    if buffer.len() < HEADER_LEN + len {
        return Ok(None);
    }
    buffer.advance(HEADER_LEN);
    let payload = buffer.split_to(len);
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| BusError::Protocol(format!("invalid envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_frames() {
        let frame = encode(&Envelope::Var {
            name: "DONE".into(),
            value: json!(1),
        })
        .unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&frame[..5]);
        assert_eq!(decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&frame[5..]);
        buffer.extend_from_slice(&encode(&Envelope::Empty).unwrap());

        assert!(matches!(
            decode(&mut buffer).unwrap(),
            Some(Envelope::Var { name, .. }) if name == "DONE"
        ));
        assert_eq!(decode(&mut buffer).unwrap(), Some(Envelope::Empty));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut buffer = BytesMut::from(&b"DIME\0\0\0\x02{}"[..]);
        assert!(matches!(decode(&mut buffer), Err(BusError::Protocol(_))));
    }

    #[test]
    fn test_envelope_tagging() {
        let frame = encode(&Envelope::Sync { timeout_ms: 5 }).unwrap();
        let json: Value = serde_json::from_slice(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(json, json!({"command": "sync", "timeout_ms": 5}));
    }
}
