//! A small DiME-like hub: named mailboxes shared over TCP.
//!
//! Each connection registers a name, then sends variables to other names, broadcasts
//! them, or asks for the next variable queued for itself (`sync`). A `sync` waits up
//! to its timeout for something to arrive and is answered with `var` or `empty`.
//! Mailboxes outlive connections, so a participant that reconnects under the same
//! name picks up where it left off.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::BytesMut;
use ltbnet_core::bus::wire::{self, Envelope};
use serde_json::Value;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on how long one `sync` may hold a connection.
const MAX_SYNC_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BusServerConfig {
    pub ip: String,
    pub port: u16,
    pub address: String,
}

impl BusServerConfig {
    pub fn new(ip: String, port: u16) -> Self {
        let address = format!("{}:{}", ip, port);
        BusServerConfig { ip, port, address }
    }
}

type Mailbox = VecDeque<(String, Value)>;

/// Mailboxes by participant name.
#[derive(Clone, Default)]
pub struct Hub {
    mailboxes: Arc<Mutex<HashMap<String, Mailbox>>>,
    arrived: Arc<Notify>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.mailboxes
            .lock()
            .await
            .entry(name.to_string())
            .or_default();
    }

    pub async fn deliver(&self, target: &str, name: &str, value: Value) {
        self.mailboxes
            .lock()
            .await
            .entry(target.to_string())
            .or_default()
            .push_back((name.to_string(), value));
        self.arrived.notify_waiters();
    }

    /// Delivers to every registered name except `from`.
    pub async fn broadcast(&self, from: &str, name: &str, value: Value) {
        let mut mailboxes = self.mailboxes.lock().await;
        for (owner, mailbox) in mailboxes.iter_mut() {
            if owner != from {
                mailbox.push_back((name.to_string(), value.clone()));
            }
        }
        drop(mailboxes);
        self.arrived.notify_waiters();
    }

    pub async fn pending(&self, name: &str) -> usize {
        self.mailboxes
            .lock()
            .await
            .get(name)
            .map_or(0, VecDeque::len)
    }

    async fn take(&self, name: &str) -> Option<(String, Value)> {
        self.mailboxes
            .lock()
            .await
            .get_mut(name)
            .and_then(VecDeque::pop_front)
    }

    /// Next variable for `name`, waiting up to `timeout` for one to arrive.
    pub async fn take_within(&self, name: &str, timeout: Duration) -> Option<(String, Value)> {
        let deadline = Instant::now() + timeout.min(MAX_SYNC_WAIT);
        loop {
            // Registered before the check so a delivery in between is not missed.
            let arrived = self.arrived.notified();
            if let Some(item) = self.take(name).await {
                return Some(item);
            }
            if time::timeout_at(deadline, arrived).await.is_err() {
                return self.take(name).await;
            }
        }
    }
}

fn protocol_error(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

async fn reply(socket: &mut TcpStream, envelope: &Envelope) -> io::Result<()> {
    let frame = wire::encode(envelope).map_err(protocol_error)?;
    socket.write_all(&frame).await
}

async fn handle_client(mut socket: TcpStream, hub: Hub) -> io::Result<()> {
    let peer = socket.peer_addr()?;
    let mut name: Option<String> = None;
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        while let Some(envelope) = wire::decode(&mut buffer).map_err(protocol_error)? {
            match envelope {
                Envelope::Register { name: registered } => {
                    info!("BUS: {} registered as <{}>", peer, registered);
                    hub.register(&registered).await;
                    name = Some(registered);
                }
                Envelope::Send {
                    target,
                    name: var,
                    value,
                } => {
                    debug!("BUS: <{}> -> <{}>: {}", name.as_deref().unwrap_or("?"), target, var);
                    hub.deliver(&target, &var, value).await;
                }
                Envelope::Broadcast { name: var, value } => {
                    let from = name.as_deref().unwrap_or_default();
                    debug!("BUS: <{}> broadcast {}", from, var);
                    hub.broadcast(from, &var, value).await;
                }
                Envelope::Sync { timeout_ms } => {
                    let answer = match &name {
                        Some(name) => {
                            match hub.take_within(name, Duration::from_millis(timeout_ms)).await {
                                Some((var, value)) => Envelope::Var { name: var, value },
                                None => Envelope::Empty,
                            }
                        }
                        None => Envelope::Error {
                            message: "sync before register".to_string(),
                        },
                    };
                    reply(&mut socket, &answer).await?;
                }
                other => {
                    warn!("BUS: Unexpected {:?} from {}", other, peer);
                    reply(
                        &mut socket,
                        &Envelope::Error {
                            message: "unexpected command".to_string(),
                        },
                    )
                    .await?;
                }
            }
        }

        if socket.read_buf(&mut buffer).await? == 0 {
            info!(
                "BUS: <{}> ({}) disconnected",
                name.as_deref().unwrap_or("unregistered"),
                peer
            );
            return Ok(());
        }
    }
}

/// Accepts clients on `listener` until it fails.
pub async fn serve(listener: TcpListener, hub: Hub) -> io::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        socket.set_nodelay(true)?;
        debug!("BUS: New connection from {}", addr);
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, hub).await {
                warn!("BUS: Connection {} closed with error: {}", addr, e);
            }
        });
    }
}

pub async fn run_bus_server(config: BusServerConfig) -> io::Result<()> {
    let listener = TcpListener::bind(&config.address).await?;
    info!("Bus hub listening on {}", config.address);
    serve(listener, Hub::new()).await
}
