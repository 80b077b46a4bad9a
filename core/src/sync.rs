//! # Synchronization State Machine
//!
//! Drives the reset/streaming protocol every bus participant follows:
//!
//! - `Reset`: collect the run's set-up variables (`SysParam`, `Idxvgs`,
//!   `Varheader`). Once every required name has been seen the machine switches to
//!   `Streaming`.
//! - `Streaming`: pass `pmudata` and `pmucmd` through until `DONE == 1` sends it
//!   back to `Reset`.
//!
//! `SysName` is accepted in both states. Anything that arrives in the wrong state
//! comes back as `SyncEvent::OutOfPhase` so the owner can decide whether it
//! matters; the machine itself never acts on it.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{PmuCommand, PmuData, SharedBus, SysName, WorkspaceVar};
use crate::error::BusError;

/// Names a virtual PMU waits for before streaming.
pub const PMU_REQUIRED: &[&str] = &["SysParam", "Idxvgs", "Varheader"];
/// Names the aggregator waits for before evaluating.
pub const AGGREGATOR_REQUIRED: &[&str] = &["SysParam"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Reset,
    Streaming,
}

/// What one observed variable meant.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A set-up variable accepted during `Reset`; more are still missing.
    Accepted(WorkspaceVar),
    /// A set-up variable that completed the required set. The machine is now
    /// `Streaming`; the owner stores the variable and configures itself.
    Ready(WorkspaceVar),
    /// Display names, valid in any state.
    Names(SysName),
    Data(PmuData),
    Command(PmuCommand),
    /// `DONE == 1` while streaming. The machine is back in `Reset`.
    Done,
    /// A known variable observed in the wrong state. Already logged.
    OutOfPhase(WorkspaceVar),
    /// Unknown names, undecodable values, or `DONE` with a value other than 1.
    Ignored(String),
}

#[derive(Debug, Clone)]
pub struct SyncMachine {
    state: SyncState,
    required: HashSet<&'static str>,
    seen: HashSet<String>,
}

impl SyncMachine {
    pub fn new(required: &[&'static str]) -> Self {
        SyncMachine {
            state: SyncState::Reset,
            required: required.iter().copied().collect(),
            seen: HashSet::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Forces the machine back to `Reset` and forgets what was seen.
    pub fn reset(&mut self) {
        self.state = SyncState::Reset;
        self.seen.clear();
    }

    /// Classifies one variable and advances the state.
    pub fn observe(&mut self, var: WorkspaceVar) -> SyncEvent {
        debug!("variable <{}> synced", var.name());
        match (self.state, var) {
            (_, WorkspaceVar::SysName(names)) => SyncEvent::Names(names),

            (
                SyncState::Reset,
                var @ (WorkspaceVar::SysParam(_) | WorkspaceVar::Idxvgs(_) | WorkspaceVar::Varheader(_)),
            ) => {
                self.seen.insert(var.name().to_string());
                if self.required.iter().all(|name| self.seen.contains(*name)) {
                    info!("Set-up variables complete, entering streaming");
                    self.state = SyncState::Streaming;
                    SyncEvent::Ready(var)
                } else {
                    SyncEvent::Accepted(var)
                }
            }

            (SyncState::Streaming, WorkspaceVar::PmuData(data)) => SyncEvent::Data(data),
            (SyncState::Streaming, WorkspaceVar::PmuCmd(cmd)) => SyncEvent::Command(cmd),
            (SyncState::Streaming, WorkspaceVar::Done(value)) if value == 1.0 => {
                info!("DONE received, entering reset");
                self.reset();
                SyncEvent::Done
            }

            (_, WorkspaceVar::Done(value)) => {
                debug!("DONE={} ignored", value);
                SyncEvent::Ignored("DONE".to_string())
            }
            (_, WorkspaceVar::Unknown(name)) => {
                info!("{} not handled", name);
                SyncEvent::Ignored(name)
            }
            (state, var) => {
                info!("{} not handled during {:?}", var.name(), state);
                SyncEvent::OutOfPhase(var)
            }
        }
    }

    /// Polls the bus once. `Ok(None)` means nothing arrived within `timeout`;
    /// the caller backs off and tries again.
    pub fn poll(&mut self, bus: &SharedBus, timeout: Duration) -> Result<Option<SyncEvent>, BusError> {
        match bus.poll_var(timeout) {
            Ok(Some(var)) => Ok(Some(self.observe(var))),
            Ok(None) => Ok(None),
            Err(BusError::Decode { name, message }) => {
                warn!("Dropping malformed {}: {}", name, message);
                Ok(Some(SyncEvent::Ignored(name)))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Idxvgs, MemoryHub, SysParam};
    use serde_json::json;

    #[test]
    fn test_reset_to_streaming_needs_every_required_name() {
        let mut machine = SyncMachine::new(PMU_REQUIRED);
        assert!(matches!(
            machine.observe(WorkspaceVar::SysParam(SysParam::default())),
            SyncEvent::Accepted(_)
        ));
        assert!(matches!(
            machine.observe(WorkspaceVar::SysParam(SysParam::default())),
            SyncEvent::Accepted(_)
        ));
        assert!(matches!(
            machine.observe(WorkspaceVar::Idxvgs(Idxvgs::default())),
            SyncEvent::Accepted(_)
        ));
        assert_eq!(machine.state(), SyncState::Reset);
        assert!(matches!(
            machine.observe(WorkspaceVar::Varheader(vec![])),
            SyncEvent::Ready(WorkspaceVar::Varheader(_))
        ));
        assert_eq!(machine.state(), SyncState::Streaming);
    }

    #[test]
    fn test_phase_filtering() {
        let mut machine = SyncMachine::new(AGGREGATOR_REQUIRED);
        assert!(matches!(
            machine.observe(WorkspaceVar::PmuData(PmuData::default())),
            SyncEvent::OutOfPhase(_)
        ));
        assert!(matches!(
            machine.observe(WorkspaceVar::PmuCmd(PmuCommand::default())),
            SyncEvent::OutOfPhase(_)
        ));
        assert!(matches!(
            machine.observe(WorkspaceVar::SysName(SysName::default())),
            SyncEvent::Names(_)
        ));
        assert_eq!(
            machine.observe(WorkspaceVar::Done(1.0)),
            SyncEvent::Ignored("DONE".to_string())
        );

        assert!(matches!(
            machine.observe(WorkspaceVar::SysParam(SysParam::default())),
            SyncEvent::Ready(_)
        ));
        assert!(matches!(
            machine.observe(WorkspaceVar::SysParam(SysParam::default())),
            SyncEvent::OutOfPhase(WorkspaceVar::SysParam(_))
        ));
        assert!(matches!(
            machine.observe(WorkspaceVar::PmuData(PmuData::default())),
            SyncEvent::Data(_)
        ));
        assert_eq!(
            machine.observe(WorkspaceVar::Done(0.0)),
            SyncEvent::Ignored("DONE".to_string())
        );
        assert_eq!(machine.state(), SyncState::Streaming);
    }

    #[test]
    fn test_done_returns_to_reset_and_forgets() {
        let mut machine = SyncMachine::new(AGGREGATOR_REQUIRED);
        machine.observe(WorkspaceVar::SysParam(SysParam::default()));
        assert_eq!(machine.observe(WorkspaceVar::Done(1.0)), SyncEvent::Done);
        assert_eq!(machine.state(), SyncState::Reset);
        assert!(matches!(
            machine.observe(WorkspaceVar::SysParam(SysParam::default())),
            SyncEvent::Ready(_)
        ));
    }

    #[test]
    fn test_poll_empty_and_malformed() {
        let hub = MemoryHub::new();
        let bus = SharedBus::new(hub.client("pmu"));
        let mut machine = SyncMachine::new(PMU_REQUIRED);

        assert_eq!(machine.poll(&bus, Duration::from_millis(1)).unwrap(), None);

        hub.send("pmu", "Idxvgs", json!("not a table"));
        assert_eq!(
            machine.poll(&bus, Duration::ZERO).unwrap(),
            Some(SyncEvent::Ignored("Idxvgs".to_string()))
        );
        assert_eq!(machine.state(), SyncState::Reset);
    }
}
