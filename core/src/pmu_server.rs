//! # PMU Server
//!
//! TCP listener that makes a virtual PMU look like a real one to PDCs. Each
//! consumer gets a reader thread answering its command frames (header, CFG-1,
//! CFG-2, transmission on/off); data frames are written to every consumer that
//! turned transmission on.
//!
//! All writes to a consumer go through the shared state lock, so a configuration
//! reply never interleaves with a data frame. A consumer whose socket fails on
//! write is dropped; the others are unaffected.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::FrameError;
use crate::frame::{DataRecord, FrameSink};
use crate::ieee_c37_118::commands::{CommandFrame, CommandType};
use crate::ieee_c37_118::config::ConfigurationFrame;
use crate::ieee_c37_118::data_frame::DataFrame;
use crate::ieee_c37_118::header::HeaderFrame;
use crate::ieee_c37_118::utils::{now_to_hex, take_frame, time_to_hex};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_POLL: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

struct Consumer {
    id: u64,
    peer: SocketAddr,
    writer: TcpStream,
    streaming: bool,
}

#[derive(Default)]
struct Shared {
    header: Option<HeaderFrame>,
    config: Option<ConfigurationFrame>,
    consumers: Vec<Consumer>,
}

impl Shared {
    /// Writes to one consumer; on failure the consumer is removed.
    fn write_to(&mut self, id: u64, bytes: &[u8]) {
        let Some(pos) = self.consumers.iter().position(|c| c.id == id) else {
            return;
        };
        if let Err(e) = self.consumers[pos].writer.write_all(bytes) {
            let consumer = self.consumers.remove(pos);
            warn!("PMU: Dropping consumer {}: {}", consumer.peer, e);
            let _ = consumer.writer.shutdown(Shutdown::Both);
        }
    }

    fn is_registered(&self, id: u64) -> bool {
        self.consumers.iter().any(|c| c.id == id)
    }
}

/// Frame Sink serving C37.118 over TCP.
pub struct PmuServer {
    local_addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl PmuServer {
    /// Binds the listener and starts accepting consumers.
    pub fn bind(ip: &str, port: u16) -> Result<Self, FrameError> {
        let address = format!("{}:{}", ip, port);
        let listener = TcpListener::bind(&address).map_err(|source| FrameError::Connection {
            address: address.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("PMU: Listening on {}", local_addr);

        let shared = Arc::new(Mutex::new(Shared::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_shared = shared.clone();
        let accept_shutdown = shutdown.clone();
        let accept_handle = thread::spawn(move || {
            let mut next_id = 0u64;
            while !accept_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let id = next_id;
                        next_id += 1;
                        let shared = accept_shared.clone();
                        let shutdown = accept_shutdown.clone();
                        thread::spawn(move || {
                            if let Err(e) = serve_consumer(id, stream, peer, &shared, &shutdown) {
                                debug!("PMU: Consumer {} ended: {}", peer, e);
                            }
                            shared.lock().consumers.retain(|c| c.id != id);
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!("PMU: Accept failed: {}", e);
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });

        Ok(PmuServer {
            local_addr,
            shared,
            shutdown,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected consumers, streaming or not.
    pub fn consumer_count(&self) -> usize {
        self.shared.lock().consumers.len()
    }

    /// Stops accepting, disconnects every consumer and joins the accept thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for consumer in self.shared.lock().consumers.drain(..) {
            let _ = consumer.writer.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PmuServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_consumer(
    id: u64,
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: &Mutex<Shared>,
    shutdown: &AtomicBool,
) -> Result<(), FrameError> {
    info!("PMU: New consumer connected: {}", peer);
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let writer = stream.try_clone()?;
    writer.set_write_timeout(Some(WRITE_TIMEOUT))?;
    shared.lock().consumers.push(Consumer {
        id,
        peer,
        writer,
        streaming: false,
    });

    let mut buffer = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if shutdown.load(Ordering::SeqCst) || !shared.lock().is_registered(id) {
            return Ok(());
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                info!("PMU: Consumer {} disconnected", peer);
                return Ok(());
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        while let Some(bytes) = take_frame(&mut buffer) {
            match CommandFrame::from_hex(&bytes) {
                Ok(command) => handle_command(id, peer, &command, shared),
                Err(e) => debug!("PMU: Ignoring non-command frame from {}: {}", peer, e),
            }
        }
    }
}

fn handle_command(id: u64, peer: SocketAddr, command: &CommandFrame, shared: &Mutex<Shared>) {
    let mut state = shared.lock();
    let Some(command_type) = command.command_type() else {
        info!("PMU: Unknown command {} from {}", command.command, peer);
        return;
    };
    debug!("PMU: Received '{}' from {}", command_type, peer);

    let reply = match command_type {
        CommandType::SendHeaderFrame => state.header.clone().map(|mut header| {
            header.prefix.set_time(now_to_hex(1_000_000));
            header.to_hex()
        }),
        CommandType::SendConfigFrame1 | CommandType::SendConfigFrame2 => {
            let cfg_type = if command_type == CommandType::SendConfigFrame1 { 1 } else { 2 };
            state.config.as_ref().map(|config| {
                let mut frame = config.as_cfg_type(cfg_type);
                frame.prefix.set_time(now_to_hex(config.time_base));
                frame.to_hex()
            })
        }
        CommandType::SendConfigFrame3 => {
            info!("PMU: CFG-3 requested by {} but not supported", peer);
            None
        }
        CommandType::TurnOnTransmission | CommandType::TurnOffTransmission => {
            let on = command_type == CommandType::TurnOnTransmission;
            if let Some(consumer) = state.consumers.iter_mut().find(|c| c.id == id) {
                consumer.streaming = on;
                info!(
                    "PMU: Transmission {} for {}",
                    if on { "started" } else { "stopped" },
                    peer
                );
            }
            None
        }
    };

    if let Some(bytes) = reply {
        state.write_to(id, &bytes);
    } else if matches!(
        command_type,
        CommandType::SendHeaderFrame | CommandType::SendConfigFrame1 | CommandType::SendConfigFrame2
    ) {
        warn!("PMU: '{}' from {} before the PMU was configured", command_type, peer);
    }
}

impl FrameSink for PmuServer {
    fn configure(&mut self, header: HeaderFrame, config: ConfigurationFrame) -> Result<(), FrameError> {
        let mut state = self.shared.lock();
        info!(
            "PMU: Configured with {} PMU block(s) at {} frames/s",
            config.num_pmu, config.data_rate
        );
        state.header = Some(header);
        state.config = Some(config);
        Ok(())
    }

    fn has_consumers(&self) -> bool {
        self.shared.lock().consumers.iter().any(|c| c.streaming)
    }

    fn send(&mut self, record: &DataRecord) -> Result<(), FrameError> {
        let mut state = self.shared.lock();
        let config = state.config.as_ref().ok_or(FrameError::NotConfigured)?;

        let pmu_data = record
            .measurements
            .iter()
            .zip(&config.pmu_configs)
            .map(|(m, pmu)| m.to_pmu_data(pmu.dgnmr as usize))
            .collect();
        let secs = record.timestamp.max(0.0);
        let time = time_to_hex(
            secs.trunc() as u64,
            (secs.fract() * 1e9) as u32,
            config.time_base,
        );
        let bytes = DataFrame::new(config.prefix.idcode, time, pmu_data).to_hex();

        let targets: Vec<u64> = state
            .consumers
            .iter()
            .filter(|c| c.streaming)
            .map(|c| c.id)
            .collect();
        for id in targets {
            state.write_to(id, &bytes);
        }
        Ok(())
    }
}
