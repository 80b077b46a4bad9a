//! In-process bus: one mailbox per registered name.
//!
//! Used to wire a simulator, virtual PMUs and an aggregator together inside one
//! process, mostly in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;

use super::BusClient;
use crate::error::BusError;

type Mailbox = VecDeque<(String, Value)>;

#[derive(Default)]
struct HubInner {
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    ready: Condvar,
}

/// Cloneable handle to an in-process hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` and returns its client.
    pub fn client(&self, name: &str) -> MemoryBusClient {
        self.inner
            .mailboxes
            .lock()
            .entry(name.to_string())
            .or_default();
        MemoryBusClient {
            name: name.to_string(),
            hub: self.clone(),
        }
    }

    /// Delivers a variable to `target`, creating its mailbox if needed.
    pub fn send(&self, target: &str, name: &str, value: Value) {
        self.inner
            .mailboxes
            .lock()
            .entry(target.to_string())
            .or_default()
            .push_back((name.to_string(), value));
        self.inner.ready.notify_all();
    }

    /// Serializes `value` and delivers it to `target`.
    pub fn send_var<T: Serialize>(&self, target: &str, name: &str, value: &T) -> Result<(), BusError> {
        let value = serde_json::to_value(value).map_err(|e| BusError::decode(name, e))?;
        self.send(target, name, value);
        Ok(())
    }

    /// Delivers a variable to every registered name except `from`.
    pub fn broadcast(&self, from: &str, name: &str, value: Value) {
        let mut mailboxes = self.inner.mailboxes.lock();
        for (owner, mailbox) in mailboxes.iter_mut() {
            if owner != from {
                mailbox.push_back((name.to_string(), value.clone()));
            }
        }
        drop(mailboxes);
        self.inner.ready.notify_all();
    }

    /// Removes and returns everything queued for `name`.
    pub fn drain(&self, name: &str) -> Vec<(String, Value)> {
        self.inner
            .mailboxes
            .lock()
            .get_mut(name)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, name: &str) -> usize {
        self.inner
            .mailboxes
            .lock()
            .get(name)
            .map_or(0, VecDeque::len)
    }

    fn take(&self, name: &str, timeout: Duration) -> Option<(String, Value)> {
        let deadline = Instant::now() + timeout;
        let mut mailboxes = self.inner.mailboxes.lock();
        loop {
            if let Some(item) = mailboxes.get_mut(name).and_then(VecDeque::pop_front) {
                return Some(item);
            }
            if self
                .inner
                .ready
                .wait_until(&mut mailboxes, deadline)
                .timed_out()
            {
                return mailboxes.get_mut(name).and_then(VecDeque::pop_front);
            }
        }
    }
}

/// A participant registered on a `MemoryHub`.
pub struct MemoryBusClient {
    name: String,
    hub: MemoryHub,
}

impl BusClient for MemoryBusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<(String, Value)>, BusError> {
        Ok(self.hub.take(&self.name, timeout))
    }

    fn publish(&mut self, target: &str, name: &str, value: &Value) -> Result<(), BusError> {
        self.hub.send(target, name, value.clone());
        Ok(())
    }

    fn broadcast(&mut self, name: &str, value: &Value) -> Result<(), BusError> {
        self.hub.broadcast(&self.name, name, value.clone());
        Ok(())
    }
}
