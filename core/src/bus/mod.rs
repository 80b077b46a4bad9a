//! # Shared Variable Bus
//!
//! Client side of the DiME-like workspace the simulator publishes to. Each
//! participant registers under a name, polls for named variables one at a time, and
//! publishes variables to a named target or to everyone.
//!
//! ## Key Components
//!
//! - `WorkspaceVar`: The closed set of variables this crate understands, decoded
//!   into typed structs.
//! - `BusClient`: Poll/publish interface implemented by `MemoryBusClient` and
//!   `TcpBusClient`.
//! - `SharedBus`: A cloneable handle serializing access to one client.
//! - `RetryPolicy`: Reconnection with a fixed delay, bounded or until told to stop.

pub mod memory;
pub mod tcp;
pub mod wire;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::BusError;

pub use memory::{MemoryBusClient, MemoryHub};
pub use tcp::TcpBusClient;

/// Target name of the simulator on the bus.
pub const SIM_TARGET: &str = "sim";

#[derive(Deserialize)]
#[serde(untagged)]
enum VectorShape {
    Flat(Vec<f64>),
    Rows(Vec<Vec<f64>>),
}

/// Accepts `[a, b, c]` as well as the single-row matrix `[[a, b, c]]`.
fn flat_vector<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match VectorShape::deserialize(deserializer)? {
        VectorShape::Flat(v) => v,
        VectorShape::Rows(rows) => rows.into_iter().flatten().collect(),
    })
}

/// System parameter table. Only the `Bus` rows `[idx, Vn_kV, ...]` are interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysParam {
    #[serde(rename = "Bus", default)]
    pub bus: Vec<Vec<f64>>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl SysParam {
    /// Rated voltage of bus `node` in kV, if the table lists it.
    pub fn bus_voltage_kv(&self, node: u32) -> Option<f64> {
        self.bus
            .iter()
            .find(|row| row.first().map(|idx| *idx as i64) == Some(node as i64))
            .and_then(|row| row.get(1).copied())
            .filter(|kv| kv.is_finite() && *kv > 0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmuIndices {
    #[serde(default, deserialize_with = "flat_vector")]
    pub vm: Vec<f64>,
    #[serde(default, deserialize_with = "flat_vector")]
    pub am: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusIndices {
    #[serde(rename = "w_Busfreq", default, deserialize_with = "flat_vector")]
    pub w_busfreq: Vec<f64>,
}

/// Index table: 1-based positions of each bus's variables in the synchronized
/// vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Idxvgs {
    #[serde(rename = "Pmu", default)]
    pub pmu: PmuIndices,
    #[serde(rename = "Bus", default)]
    pub bus: BusIndices,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Display names; `bus[i - 1]` names bus `i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysName {
    #[serde(rename = "Bus", default)]
    pub bus: Vec<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl SysName {
    pub fn bus_name(&self, node: u32) -> Option<&str> {
        (node as usize)
            .checked_sub(1)
            .and_then(|i| self.bus.get(i))
            .map(String::as_str)
    }
}

/// One simulation step: time and the full variable vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmuData {
    pub t: f64,
    #[serde(deserialize_with = "flat_vector")]
    pub vars: Vec<f64>,
}

/// Record/replay command. `record`/`replay`: 0 none, 1 start, 2 stop.
/// `flush`: 1 clears both buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmuCommand {
    #[serde(default)]
    pub record: i64,
    #[serde(default)]
    pub replay: i64,
    #[serde(default)]
    pub flush: i64,
}

/// A decoded workspace variable.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceVar {
    SysParam(SysParam),
    Idxvgs(Idxvgs),
    Varheader(Vec<String>),
    SysName(SysName),
    PmuData(PmuData),
    PmuCmd(PmuCommand),
    /// `DONE` sentinel. Only a value of 1 ends the run.
    Done(f64),
    Unknown(String),
}

impl WorkspaceVar {
    /// Decodes a raw bus value by name. Unknown names are not an error.
    pub fn decode(name: &str, value: Value) -> Result<Self, BusError> {
        fn typed<T: serde::de::DeserializeOwned>(name: &str, value: Value) -> Result<T, BusError> {
            serde_json::from_value(value).map_err(|e| BusError::decode(name, e))
        }

        Ok(match name {
            "SysParam" => WorkspaceVar::SysParam(typed(name, value)?),
            "Idxvgs" => WorkspaceVar::Idxvgs(typed(name, value)?),
            "Varheader" => WorkspaceVar::Varheader(typed(name, value)?),
            "SysName" => WorkspaceVar::SysName(typed(name, value)?),
            "pmudata" => WorkspaceVar::PmuData(typed(name, value)?),
            "pmucmd" => WorkspaceVar::PmuCmd(typed(name, value)?),
            "DONE" => match value {
                Value::Bool(b) => WorkspaceVar::Done(if b { 1.0 } else { 0.0 }),
                other => WorkspaceVar::Done(
                    other
                        .as_f64()
                        .ok_or_else(|| BusError::decode(name, "expected a number"))?,
                ),
            },
            other => WorkspaceVar::Unknown(other.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            WorkspaceVar::SysParam(_) => "SysParam",
            WorkspaceVar::Idxvgs(_) => "Idxvgs",
            WorkspaceVar::Varheader(_) => "Varheader",
            WorkspaceVar::SysName(_) => "SysName",
            WorkspaceVar::PmuData(_) => "pmudata",
            WorkspaceVar::PmuCmd(_) => "pmucmd",
            WorkspaceVar::Done(_) => "DONE",
            WorkspaceVar::Unknown(name) => name,
        }
    }
}

/// Poll/publish interface to the shared workspace.
pub trait BusClient: Send {
    /// Name this client registered under.
    fn name(&self) -> &str;

    /// Returns at most one variable, or `None` if nothing arrived within `timeout`.
    fn poll(&mut self, timeout: Duration) -> Result<Option<(String, Value)>, BusError>;

    fn publish(&mut self, target: &str, name: &str, value: &Value) -> Result<(), BusError>;

    fn broadcast(&mut self, name: &str, value: &Value) -> Result<(), BusError>;
}

/// Cloneable handle to one bus client. Every call holds the lock for its whole
/// duration, so a variable is never interleaved with another caller's traffic.
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<Box<dyn BusClient>>>,
}

impl SharedBus {
    pub fn new(client: impl BusClient + 'static) -> Self {
        SharedBus {
            inner: Arc::new(Mutex::new(Box::new(client))),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().name().to_string()
    }

    /// Polls one variable and decodes it.
    pub fn poll_var(&self, timeout: Duration) -> Result<Option<WorkspaceVar>, BusError> {
        let polled = self.inner.lock().poll(timeout)?;
        match polled {
            Some((name, value)) => WorkspaceVar::decode(&name, value).map(Some),
            None => Ok(None),
        }
    }

    pub fn publish<T: Serialize>(&self, target: &str, name: &str, value: &T) -> Result<(), BusError> {
        let value = serde_json::to_value(value).map_err(|e| BusError::decode(name, e))?;
        self.inner.lock().publish(target, name, &value)
    }

    pub fn broadcast<T: Serialize>(&self, name: &str, value: &T) -> Result<(), BusError> {
        let value = serde_json::to_value(value).map_err(|e| BusError::decode(name, e))?;
        self.inner.lock().broadcast(name, &value)
    }
}

/// Retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with a non-connection error, or the
    /// attempts are used up. The last error is returned.
    pub fn run<T, F>(&self, what: &str, op: F) -> Result<T, BusError>
    where
        F: FnMut() -> Result<T, BusError>,
    {
        let max_attempts = self.max_attempts.max(1);
        self.retry(what, op, |e, attempt| e.is_connection() && attempt < max_attempts)
    }

    /// Runs `op`, sleeping `delay` between attempts for as long as
    /// `keep_trying(&error, attempt)` holds. Attempts past `max_attempts` are
    /// reported once at error level and then only at debug level.
    pub fn retry<T, E, F, R>(&self, what: &str, mut op: F, mut keep_trying: R) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Result<T, E>,
        R: FnMut(&E, u32) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let e = match op() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !keep_trying(&e, attempt) {
                return Err(e);
            }
            if attempt < max_attempts {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, max_attempts, e);
            } else if attempt == max_attempts {
                error!(
                    "{} failed {} times, retrying every {:?}: {}",
                    what, attempt, self.delay, e
                );
            } else {
                debug!("{} failed (attempt {}): {}", what, attempt, e);
            }
            attempt = attempt.saturating_add(1);
            thread::sleep(self.delay);
        }
    }
}

/// Connects `name` to a `tcp://host:port` bus address, retrying per `policy`.
pub fn connect(name: &str, address: &str, policy: &RetryPolicy) -> Result<SharedBus, BusError> {
    let client = policy.run("Bus connect", || TcpBusClient::connect(name, address))?;
    info!("Bus client <{}> connected to {}", name, address);
    Ok(SharedBus::new(client))
}
