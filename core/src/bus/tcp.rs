//! Blocking TCP client for the DiME-like bus hub (`ltbnet bus`).

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tracing::debug;

use super::wire::{self, Envelope};
use super::BusClient;
use crate::error::BusError;

/// Extra time allowed for the hub's answer on top of the requested poll timeout.
const REPLY_SLACK: Duration = Duration::from_secs(2);

/// Parses `tcp://host:port` (the scheme is optional) into `host:port`.
pub fn parse_address(address: &str) -> Result<String, BusError> {
    let rest = match address.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(BusError::InvalidAddress(address.to_string())),
        None => address,
    };
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(rest.to_string())
        }
        _ => Err(BusError::InvalidAddress(address.to_string())),
    }
}

pub struct TcpBusClient {
    name: String,
    stream: TcpStream,
    buffer: BytesMut,
}

impl TcpBusClient {
    /// Opens a session and registers `name` with the hub.
    pub fn connect(name: &str, address: &str) -> Result<Self, BusError> {
        let socket_addr = parse_address(address)?;
        let stream = TcpStream::connect(&socket_addr).map_err(|source| BusError::Connection {
            address: address.to_string(),
            source,
        })?;
        stream.set_nodelay(true)?;

        let mut client = TcpBusClient {
            name: name.to_string(),
            stream,
            buffer: BytesMut::with_capacity(4096),
        };
        client.write(&Envelope::Register {
            name: name.to_string(),
        })?;
        Ok(client)
    }

    fn write(&mut self, envelope: &Envelope) -> Result<(), BusError> {
        let frame = wire::encode(envelope)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    fn read_envelope(&mut self) -> Result<Envelope, BusError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(envelope) = wire::decode(&mut self.buffer)? {
                return Ok(envelope);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(BusError::Closed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl BusClient for TcpBusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<(String, Value)>, BusError> {
        self.write(&Envelope::Sync {
            timeout_ms: timeout.as_millis() as u64,
        })?;
        self.stream.set_read_timeout(Some(timeout + REPLY_SLACK))?;
        match self.read_envelope()? {
            Envelope::Var { name, value } => {
                debug!("variable <{}> synced", name);
                Ok(Some((name, value)))
            }
            Envelope::Empty => Ok(None),
            Envelope::Error { message } => Err(BusError::Protocol(message)),
            other => Err(BusError::Protocol(format!(
                "unexpected reply to sync: {:?}",
                other
            ))),
        }
    }

    fn publish(&mut self, target: &str, name: &str, value: &Value) -> Result<(), BusError> {
        self.write(&Envelope::Send {
            target: target.to_string(),
            name: name.to_string(),
            value: value.clone(),
        })
    }

    fn broadcast(&mut self, name: &str, value: &Value) -> Result<(), BusError> {
        self.write(&Envelope::Broadcast {
            name: name.to_string(),
            value: value.clone(),
        })
    }
}
