//! # PDC Client
//!
//! Blocking TCP session with one PMU server. Sends C37.118 command frames and turns
//! the byte stream back into typed `Frame`s.
//!
//! Frames are cut out of a resynchronizing buffer, so garbage on the wire costs the
//! bytes it occupies and nothing else. Data frames that arrive while a header or
//! configuration request is outstanding are queued and handed out by the next
//! `receive`.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info};

use crate::error::FrameError;
use crate::frame::{DataRecord, Frame, FrameSource};
use crate::ieee_c37_118::commands::{CommandFrame, CommandType};
use crate::ieee_c37_118::common::{FrameType, PrefixFrame};
use crate::ieee_c37_118::config::ConfigurationFrame;
use crate::ieee_c37_118::data_frame::DataFrame;
use crate::ieee_c37_118::header::HeaderFrame;
use crate::ieee_c37_118::utils::take_frame;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame Source backed by a TCP connection to a PMU.
///
/// # Fields
///
/// * `address`: `ip:port` of the PMU.
/// * `idcode`: IDCODE placed in outgoing command frames.
/// * `config`: Most recent configuration frame, needed to decode data frames.
pub struct PdcClient {
    address: String,
    idcode: u16,
    stream: TcpStream,
    buffer: BytesMut,
    config: Option<ConfigurationFrame>,
    pending: VecDeque<Frame>,
    reply_timeout: Duration,
}

impl PdcClient {
    /// Connects to a PMU server.
    pub fn connect(ip: &str, port: u16, idcode: u16) -> Result<Self, FrameError> {
        let address = format!("{}:{}", ip, port);
        let stream = TcpStream::connect(&address).map_err(|source| FrameError::Connection {
            address: address.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(DEFAULT_REPLY_TIMEOUT))?;
        info!("PDC connected to PMU at {}", address);

        Ok(PdcClient {
            address,
            idcode,
            stream,
            buffer: BytesMut::with_capacity(4096),
            config: None,
            pending: VecDeque::new(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> Option<&ConfigurationFrame> {
        self.config.as_ref()
    }

    /// How long `request_header`/`request_config` wait for their reply.
    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    fn send_command(&mut self, command: CommandType) -> Result<(), FrameError> {
        debug!("Sending '{}' to {}", command, self.address);
        let frame = CommandFrame::new(command, self.idcode);
        self.stream.write_all(&frame.to_hex())?;
        Ok(())
    }

    /// Reads until a complete frame is buffered or `deadline` passes.
    fn read_frame(&mut self, deadline: Instant) -> Result<Option<BytesMut>, FrameError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = take_frame(&mut self.buffer) {
                return Ok(Some(frame));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Frame, FrameError> {
        let prefix = PrefixFrame::from_hex(bytes)?;
        match prefix.frame_type()? {
            FrameType::Header => Ok(Frame::Header(HeaderFrame::from_hex(bytes)?)),
            FrameType::Config1 | FrameType::Config2 | FrameType::Config3 => {
                let config = ConfigurationFrame::from_hex(bytes)?;
                self.config = Some(config.clone());
                Ok(Frame::Config(config))
            }
            FrameType::Data => {
                let config = self.config.as_ref().ok_or(FrameError::NotConfigured)?;
                let data = DataFrame::from_hex(bytes, config)?;
                Ok(Frame::Data(DataRecord::from_data_frame(&data, config)))
            }
            FrameType::Command => Err(FrameError::Protocol(
                "PMU sent a command frame".to_string(),
            )),
        }
    }

    /// Waits for the first frame matching `want`, queueing anything else.
    fn await_reply<T>(
        &mut self,
        what: &str,
        mut want: impl FnMut(Frame) -> Result<T, Frame>,
    ) -> Result<T, FrameError> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let bytes = self.read_frame(deadline)?.ok_or_else(|| {
                FrameError::Protocol(format!("no {} from {}", what, self.address))
            })?;
            let frame = match self.decode(&bytes) {
                Ok(frame) => frame,
                Err(FrameError::NotConfigured) => continue,
                Err(e) => return Err(e),
            };
            match want(frame) {
                Ok(reply) => return Ok(reply),
                Err(other) => self.pending.push_back(other),
            }
        }
    }
}

impl FrameSource for PdcClient {
    fn request_header(&mut self) -> Result<HeaderFrame, FrameError> {
        self.send_command(CommandType::SendHeaderFrame)?;
        self.await_reply("header frame", |frame| match frame {
            Frame::Header(header) => Ok(header),
            other => Err(other),
        })
    }

    fn request_config(&mut self) -> Result<ConfigurationFrame, FrameError> {
        self.send_command(CommandType::SendConfigFrame2)?;
        self.await_reply("configuration frame", |frame| match frame {
            Frame::Config(config) => Ok(config),
            other => Err(other),
        })
    }

    fn start_streaming(&mut self) -> Result<(), FrameError> {
        self.send_command(CommandType::TurnOnTransmission)
    }

    fn stop_streaming(&mut self) -> Result<(), FrameError> {
        self.send_command(CommandType::TurnOffTransmission)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, FrameError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        match self.read_frame(Instant::now() + timeout)? {
            Some(bytes) => self.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}
