//! # Virtual PMU
//!
//! Turns the simulator's synchronized variable vector into a synchrophasor stream.
//!
//! The device follows the bus's reset/streaming protocol through a `SyncMachine`.
//! Once `SysParam`, `Idxvgs` and `Varheader` are in, it maps its monitored buses to
//! offsets in `pmudata.vars`, configures its Frame Sink with one PMU block per bus
//! and starts buffering measurements. Output runs on its own cadence
//! (`PmuConfig::data_rate`): each tick takes the latest live sample, or the next
//! recorded one while replaying, de-normalizes it and hands it to the sink.
//!
//! ## Record/Replay
//!
//! `pmucmd` drives a four-state machine:
//!
//! ```text
//!   Idle ──record:1──▶ Recording ──record:2──▶ Recorded ──replay:1──▶ Replaying
//!    ▲                                            │  ▲                     │
//!    └──────────────── flush:1 (any state) ───────┘  └── replay:2 / end ───┘
//! ```
//!
//! A command is checked as a whole (flush, then record, then replay) before any
//! part of it is applied.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info, warn};

use crate::bus::{Idxvgs, PmuCommand, SharedBus, SysName, SysParam, WorkspaceVar};
use crate::config::PmuConfig;
use crate::error::{BusError, CommandError, ConfigError, FrameError, IndexMapError};
use crate::frame::{DataRecord, FrameSink, Measurement};
use crate::ieee_c37_118::config::{ConfigurationFrame, PMUConfigurationFrame};
use crate::ieee_c37_118::header::HeaderFrame;
use crate::ieee_c37_118::units::NominalFrequency;
use crate::index_map::{self, IndexMap};
use crate::sample_store::{BufferKind, SampleStore};
use crate::sync::{SyncEvent, SyncMachine, SyncState, PMU_REQUIRED};
use crate::utils::{unix_now, wrap_angle};

const TIME_BASE: u32 = 1_000_000;
const PHASOR_NAMES: [&str; 1] = ["VA"];
const ANALOG_NAMES: [&str; 1] = ["SIMTIME"];
const DIGITAL_NAMES: [&str; 16] = [
    "BREAKER 1 STATUS",
    "BREAKER 2 STATUS",
    "BREAKER 3 STATUS",
    "BREAKER 4 STATUS",
    "BREAKER 5 STATUS",
    "BREAKER 6 STATUS",
    "BREAKER 7 STATUS",
    "BREAKER 8 STATUS",
    "BREAKER 9 STATUS",
    "BREAKER A STATUS",
    "BREAKER B STATUS",
    "BREAKER C STATUS",
    "BREAKER D STATUS",
    "BREAKER E STATUS",
    "BREAKER F STATUS",
    "BREAKER G STATUS",
];
/// Breaker 1 closed.
const DIGITAL_STATUS: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Recording,
    Recorded,
    Replaying,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Idle => write!(f, "idle"),
            RecordState::Recording => write!(f, "recording"),
            RecordState::Recorded => write!(f, "recorded"),
            RecordState::Replaying => write!(f, "replaying"),
        }
    }
}

/// One de-normalized output sample. The vectors are parallel to the monitored
/// nodes.
///
/// # Fields
///
/// * `t`: Simulation time the sample was taken at.
/// * `magnitude`: Voltage magnitude in V.
/// * `angle`: Voltage angle in rad, within `(-π, π]`.
/// * `frequency`: Frequency in Hz.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub t: f64,
    pub magnitude: Vec<f64>,
    pub angle: Vec<f64>,
    pub frequency: Vec<f64>,
}

/// Emulated PMU streaming simulated measurements to a `FrameSink`.
pub struct VirtualPmu<S: FrameSink> {
    config: PmuConfig,
    sink: S,
    sync: SyncMachine,

    sys_param: Option<SysParam>,
    idxvgs: Option<Idxvgs>,
    varheader: Vec<String>,
    index_map: Option<IndexMap>,

    store: SampleStore,
    record_state: RecordState,
    replay_cursor: usize,
    last_vector: Vec<f64>,
    last_timestamp: Option<f64>,

    station_names: Vec<String>,
    /// Per-node voltage base in V.
    voltage_base: Vec<f64>,
    cfgcnt: u16,
    configured: bool,

    rng: StdRng,
    noise: Option<Normal<f64>>,
}

impl<S: FrameSink> VirtualPmu<S> {
    pub fn new(config: PmuConfig, sink: S) -> Result<Self, ConfigError> {
        Self::with_rng(config, sink, StdRng::from_entropy())
    }

    /// Same as `new` with a reproducible noise sequence.
    pub fn with_seed(config: PmuConfig, sink: S, seed: u64) -> Result<Self, ConfigError> {
        Self::with_rng(config, sink, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: PmuConfig, sink: S, rng: StdRng) -> Result<Self, ConfigError> {
        config.validate()?;
        let noise = if config.noise_level > 0.0 {
            Some(
                Normal::new(0.0, config.noise_level)
                    .map_err(|e| ConfigError::invalid("noise_level", e.to_string()))?,
            )
        } else {
            None
        };
        let width = 3 * config.nodes.len();
        Ok(VirtualPmu {
            store: SampleStore::new(config.max_store, config.max_store_record, width),
            station_names: default_station_names(&config.nodes),
            voltage_base: vec![config.voltage_base_kv * 1000.0; config.nodes.len()],
            sync: SyncMachine::new(PMU_REQUIRED),
            sys_param: None,
            idxvgs: None,
            varheader: Vec::new(),
            index_map: None,
            record_state: RecordState::Idle,
            replay_cursor: 0,
            last_vector: Vec::new(),
            last_timestamp: None,
            cfgcnt: 0,
            configured: false,
            rng,
            noise,
            config,
            sink,
        })
    }

    pub fn config(&self) -> &PmuConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn record_state(&self) -> RecordState {
        self.record_state
    }

    pub fn index_map(&self) -> Option<&IndexMap> {
        self.index_map.as_ref()
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn station_names(&self) -> &[String] {
        &self.station_names
    }

    pub fn varheader(&self) -> &[String] {
        &self.varheader
    }

    /// Monitored values of the last `pmudata`, in `[vm.., am.., w..]` order.
    pub fn last_vector(&self) -> &[f64] {
        &self.last_vector
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Snapshot of one buffer, oldest row first.
    pub fn record_batch(&self, kind: BufferKind) -> Result<RecordBatch, ArrowError> {
        self.store
            .buffer(kind)
            .to_record_batch(&index_map::column_names(&self.config.nodes))
    }

    /// Feeds one variable through the synchronization machine.
    pub fn observe(&mut self, var: WorkspaceVar) {
        let event = self.sync.observe(var);
        self.on_event(event);
    }

    /// Acts on what the synchronization machine reported.
    pub fn on_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Accepted(var) => self.store_setup(var),
            SyncEvent::Ready(var) => {
                self.store_setup(var);
                self.start_run();
            }
            SyncEvent::Names(names) => self.rename(&names),
            SyncEvent::Data(data) => {
                if let Err(e) = self.handle_measurement(&data.vars, data.t) {
                    warn!("PMU <{}>: Dropping pmudata at t={}: {}", self.config.name, data.t, e);
                }
            }
            SyncEvent::Command(cmd) => {
                if let Err(e) = self.apply_command(cmd) {
                    warn!("PMU <{}>: Rejected {:?}: {}", self.config.name, cmd, e);
                }
            }
            SyncEvent::Done => self.reset_run(),
            SyncEvent::OutOfPhase(_) | SyncEvent::Ignored(_) => {}
        }
    }

    fn store_setup(&mut self, var: WorkspaceVar) {
        match var {
            WorkspaceVar::SysParam(param) => self.sys_param = Some(param),
            WorkspaceVar::Idxvgs(idxvgs) => self.idxvgs = Some(idxvgs),
            WorkspaceVar::Varheader(names) => self.varheader = names,
            other => debug!("{} is not a set-up variable", other.name()),
        }
    }

    /// Builds the run's index mapping and voltage bases, then configures the sink.
    fn start_run(&mut self) {
        let default_v = self.config.voltage_base_kv * 1000.0;
        let sys_param = self.sys_param.as_ref();
        self.voltage_base = self
            .config
            .nodes
            .iter()
            .map(|node| {
                sys_param
                    .and_then(|p| p.bus_voltage_kv(*node))
                    .map(|kv| kv * 1000.0)
                    .unwrap_or(default_v)
            })
            .collect();

        self.index_map = match self.idxvgs.as_ref() {
            Some(idxvgs) => match IndexMap::build(self.config.layout, idxvgs, &self.config.nodes) {
                Ok(map) => {
                    info!(
                        "PMU <{}>: Monitoring nodes {:?} ({} layout: vm {:?}, am {:?}, w {:?})",
                        self.config.name,
                        map.nodes(),
                        self.config.layout,
                        map.vm(),
                        map.am(),
                        map.w()
                    );
                    let width = self.varheader.len();
                    if width > 0 && map.max_offset() >= width {
                        warn!(
                            "PMU <{}>: Offset {} is beyond the {} variables in Varheader; \
                             pmudata will be dropped unless the simulator streams more (layout {})",
                            self.config.name,
                            map.max_offset(),
                            width,
                            self.config.layout
                        );
                    }
                    Some(map)
                }
                Err(e) => {
                    warn!("PMU <{}>: No index mapping for this run: {}", self.config.name, e);
                    None
                }
            },
            None => None,
        };

        if let Err(e) = self.configure_device() {
            warn!("PMU <{}>: Could not configure frame sink: {}", self.config.name, e);
        }
    }

    fn rename(&mut self, names: &SysName) {
        let mut changed = false;
        for (station, node) in self.station_names.iter_mut().zip(&self.config.nodes) {
            if let Some(name) = names.bus_name(*node) {
                if station != name {
                    *station = name.to_string();
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }
        debug!("PMU <{}>: Station names now {:?}", self.config.name, self.station_names);
        if self.configured {
            if let Err(e) = self.configure_device() {
                warn!("PMU <{}>: Could not reconfigure frame sink: {}", self.config.name, e);
            }
        }
    }

    /// Sends the header and a CFG-2 with one block per monitored node to the sink.
    pub fn configure_device(&mut self) -> Result<(), FrameError> {
        let fnom = NominalFrequency::from_hz(self.config.nominal_frequency);
        self.cfgcnt = self.cfgcnt.wrapping_add(1);
        let pmus = self
            .config
            .nodes
            .iter()
            .zip(&self.station_names)
            .map(|(node, station)| {
                PMUConfigurationFrame::float_polar(
                    station,
                    *node as u16,
                    fnom,
                    &PHASOR_NAMES,
                    &ANALOG_NAMES,
                    1,
                    &DIGITAL_NAMES,
                    self.cfgcnt,
                )
            })
            .collect();

        let idcode = self.config.nodes.first().map(|n| *n as u16).unwrap_or(1);
        let data_rate = i16::try_from(self.config.data_rate).unwrap_or(i16::MAX);
        let config = ConfigurationFrame::new(2, idcode, TIME_BASE, pmus, data_rate);
        let header = HeaderFrame::new(
            idcode,
            format!("MiniPMU <{}> {:?}", self.config.name, self.config.nodes),
        );
        self.sink.configure(header, config)?;
        self.configured = true;
        info!("PMU <{}>: Configured (cfgcnt {})", self.config.name, self.cfgcnt);
        Ok(())
    }

    /// Buffers the monitored values of one simulation step.
    pub fn handle_measurement(&mut self, vars: &[f64], t: f64) -> Result<(), IndexMapError> {
        let map = self.index_map.as_ref().ok_or(IndexMapError::Unavailable)?;
        let row = map.select(vars)?;
        self.store.write(BufferKind::Live, t, &row);
        if self.record_state == RecordState::Recording {
            self.store.write(BufferKind::Record, t, &row);
        }
        self.last_vector = row;
        self.last_timestamp = Some(t);
        Ok(())
    }

    /// Validates and applies a record/replay/flush command.
    ///
    /// # Returns
    ///
    /// * `Ok(RecordState)`: The state after the command.
    /// * `Err(CommandError)`: Nothing was changed.
    pub fn apply_command(&mut self, cmd: PmuCommand) -> Result<RecordState, CommandError> {
        check_value("record", cmd.record, 2)?;
        check_value("replay", cmd.replay, 2)?;
        check_value("flush", cmd.flush, 1)?;

        let from = self.record_state;
        let mut state = from;
        let mut has_recording = !self.store.record().is_empty();

        if cmd.flush == 1 {
            state = RecordState::Idle;
            has_recording = false;
        }
        match cmd.record {
            1 if matches!(state, RecordState::Idle | RecordState::Recorded) => {
                state = RecordState::Recording;
            }
            2 if state == RecordState::Recording => {
                state = if has_recording {
                    RecordState::Recorded
                } else {
                    RecordState::Idle
                };
            }
            1 => return Err(transition(state, "start recording")),
            2 => return Err(transition(state, "stop recording")),
            _ => {}
        }
        match cmd.replay {
            1 if state == RecordState::Recorded => state = RecordState::Replaying,
            2 if state == RecordState::Replaying => state = RecordState::Recorded,
            1 => return Err(transition(state, "start replay")),
            2 => return Err(transition(state, "stop replay")),
            _ => {}
        }

        if cmd.flush == 1 {
            self.store.reset(BufferKind::Live);
            self.store.reset(BufferKind::Record);
        }
        if cmd.record == 1 {
            self.store.reset(BufferKind::Record);
        }
        if cmd.replay != 0 || cmd.flush == 1 {
            self.replay_cursor = 0;
        }
        self.record_state = state;

        if from != state {
            info!("PMU <{}>: {} -> {}", self.config.name, from, state);
        }
        Ok(state)
    }

    /// The next sample to transmit: the next recorded row while replaying,
    /// otherwise the latest live row. `None` before any data arrived.
    pub fn next_output(&mut self) -> Option<Sample> {
        let (t, row) = if self.record_state == RecordState::Replaying {
            self.next_replayed()?
        } else {
            let (t, row) = self.store.live().latest()?;
            (t, row.to_vec())
        };
        Some(self.denormalize(t, row))
    }

    fn next_replayed(&mut self) -> Option<(f64, Vec<f64>)> {
        let record = self.store.record();
        let len = record.len();
        let Some((t, row)) = record.get(self.replay_cursor) else {
            self.replay_cursor = 0;
            self.record_state = RecordState::Recorded;
            return None;
        };
        let row = (t, row.to_vec());

        self.replay_cursor += 1;
        if self.replay_cursor >= len {
            self.replay_cursor = 0;
            self.record_state = RecordState::Recorded;
            info!("PMU <{}>: Replay finished after {} samples", self.config.name, len);
        }
        Some(row)
    }

    fn denormalize(&mut self, t: f64, mut row: Vec<f64>) -> Sample {
        if let Some(noise) = &self.noise {
            for value in row.iter_mut() {
                *value += noise.sample(&mut self.rng);
            }
        }
        let n = self.config.nodes.len();
        Sample {
            t,
            magnitude: row[..n]
                .iter()
                .zip(&self.voltage_base)
                .map(|(vm, base)| vm * base)
                .collect(),
            angle: row[n..2 * n].iter().map(|am| wrap_angle(*am)).collect(),
            frequency: row[2 * n..3 * n]
                .iter()
                .map(|w| w * self.config.nominal_frequency)
                .collect(),
        }
    }

    /// One measurement per monitored node; the analog channel carries `sample.t`.
    pub fn build_record(&self, sample: &Sample) -> DataRecord {
        let measurements = self
            .config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| Measurement {
                source_id: *node as u16,
                frequency: sample.frequency[i],
                phasor_magnitude: sample.magnitude[i],
                phasor_angle: sample.angle[i],
                analog: vec![sample.t],
                digital: DIGITAL_STATUS,
            })
            .collect();
        DataRecord {
            timestamp: unix_now(),
            measurements,
        }
    }

    /// Sends `sample` if anyone is listening. Send failures are logged.
    pub fn publish(&mut self, sample: &Sample) {
        if !self.sink.has_consumers() {
            return;
        }
        let record = self.build_record(sample);
        if let Err(e) = self.sink.send(&record) {
            warn!("PMU <{}>: Send failed: {}", self.config.name, e);
        }
    }

    /// One output cycle: `next_output` followed by `publish`.
    pub fn tick(&mut self) -> Option<Sample> {
        let sample = self.next_output()?;
        self.publish(&sample);
        Some(sample)
    }

    /// Run-scoped state is dropped on `DONE`. With `retain_data` the recording
    /// survives.
    fn reset_run(&mut self) {
        self.sys_param = None;
        self.idxvgs = None;
        self.varheader.clear();
        self.index_map = None;
        self.last_vector.clear();
        self.last_timestamp = None;
        self.replay_cursor = 0;
        self.store.reset(BufferKind::Live);

        if !self.config.retain_data {
            self.store.reset(BufferKind::Record);
        }
        self.record_state = if self.store.record().is_empty() {
            RecordState::Idle
        } else {
            RecordState::Recorded
        };
        info!(
            "PMU <{}>: Run finished, record/replay {}",
            self.config.name, self.record_state
        );
    }

    /// Polls the bus and transmits at `data_rate` until `stop` is set.
    ///
    /// Only connection-level bus failures end the loop.
    pub fn run(&mut self, bus: &SharedBus, stop: &AtomicBool) -> Result<(), BusError> {
        info!(
            "PMU <{}>: Running for nodes {:?} at {} frames/s",
            self.config.name, self.config.nodes, self.config.data_rate
        );
        let interval = self.config.frame_interval();
        let mut next_frame = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            if let Some(event) = self.sync.poll(bus, self.config.poll_interval)? {
                self.on_event(event);
            }

            let now = Instant::now();
            if now >= next_frame {
                self.tick();
                next_frame += interval;
                if next_frame < now {
                    next_frame = now + interval;
                }
            }
        }

        info!("PMU <{}>: Stopped", self.config.name);
        Ok(())
    }
}

fn default_station_names(nodes: &[u32]) -> Vec<String> {
    nodes.iter().map(|n| format!("Bus_{}", n)).collect()
}

fn check_value(field: &'static str, value: i64, max: i64) -> Result<(), CommandError> {
    if (0..=max).contains(&value) {
        Ok(())
    } else {
        Err(CommandError::InvalidValue { field, value })
    }
}

fn transition(from: RecordState, command: &'static str) -> CommandError {
    CommandError::InvalidTransition { from, command }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusIndices, PmuData, PmuIndices};
    use crate::index_map::IndexLayout;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[derive(Default)]
    struct MockSink {
        header: Option<HeaderFrame>,
        config: Option<ConfigurationFrame>,
        streaming: bool,
        sent: Vec<DataRecord>,
    }

    impl FrameSink for MockSink {
        fn configure(
            &mut self,
            header: HeaderFrame,
            config: ConfigurationFrame,
        ) -> Result<(), FrameError> {
            self.header = Some(header);
            self.config = Some(config);
            Ok(())
        }

        fn has_consumers(&self) -> bool {
            self.streaming
        }

        fn send(&mut self, record: &DataRecord) -> Result<(), FrameError> {
            self.sent.push(record.clone());
            Ok(())
        }
    }

    const BUSES: usize = 4;

    /// Four buses; read only in the `Idxvgs` layout, as `[vm1..vm4, am1..am4, w1..w4]`.
    fn idxvgs() -> Idxvgs {
        let range = |start: usize| (start..start + BUSES).map(|i| (i + 1) as f64).collect();
        Idxvgs {
            pmu: PmuIndices {
                vm: range(0),
                am: range(BUSES),
            },
            bus: BusIndices {
                w_busfreq: range(2 * BUSES),
            },
            ..Default::default()
        }
    }

    /// Every bus at the same `[vm, am, w]`, interleaved per bus.
    fn vars(vm: f64, am: f64, w: f64) -> Vec<f64> {
        [vm, am, w].repeat(BUSES)
    }

    fn pmu_with(config: PmuConfig) -> VirtualPmu<MockSink> {
        let mut pmu = VirtualPmu::with_seed(config, MockSink::default(), 7).unwrap();
        pmu.observe(WorkspaceVar::SysParam(SysParam {
            bus: vec![vec![2.0, 230.0, 1.0]],
            ..Default::default()
        }));
        pmu.observe(WorkspaceVar::Idxvgs(idxvgs()));
        pmu.observe(WorkspaceVar::Varheader(vec!["V".to_string(); 3 * BUSES]));
        pmu
    }

    fn streaming_pmu() -> VirtualPmu<MockSink> {
        pmu_with(PmuConfig {
            nodes: vec![2, 4],
            ..Default::default()
        })
    }

    fn cmd(record: i64, replay: i64, flush: i64) -> PmuCommand {
        PmuCommand {
            record,
            replay,
            flush,
        }
    }

    #[test]
    fn test_replay_rejected_while_idle() {
        let mut pmu = streaming_pmu();
        assert_eq!(
            pmu.apply_command(cmd(0, 1, 0)),
            Err(CommandError::InvalidTransition {
                from: RecordState::Idle,
                command: "start replay"
            })
        );
        assert_eq!(pmu.record_state(), RecordState::Idle);

        assert_eq!(
            pmu.apply_command(cmd(3, 0, 0)),
            Err(CommandError::InvalidValue {
                field: "record",
                value: 3
            })
        );
        assert_eq!(pmu.apply_command(cmd(0, 0, 0)), Ok(RecordState::Idle));
    }

    #[test]
    fn test_startup_configures_sink() {
        let mut pmu = streaming_pmu();
        assert_eq!(pmu.sync_state(), SyncState::Streaming);
        assert!(pmu.is_configured());
        assert_eq!(pmu.index_map().unwrap().vm(), &[3, 9]);

        let header = pmu.sink().header.clone().unwrap();
        assert_eq!(header.data, "MiniPMU <PMU> [2, 4]");
        let config = pmu.sink().config.clone().unwrap();
        assert_eq!(config.cfg_type, 2);
        assert_eq!(config.num_pmu, 2);
        assert_eq!(config.pmu_configs[1].idcode, 4);
        assert_eq!(config.pmu_configs[0].station_name(), "Bus_2");
        assert_eq!(config.pmu_configs[0].channel_names()[..2], ["VA", "SIMTIME"]);

        pmu.observe(WorkspaceVar::SysName(SysName {
            bus: vec!["A", "B", "C", "D"].into_iter().map(String::from).collect(),
            ..Default::default()
        }));
        assert_eq!(pmu.station_names(), &["B", "D"]);
        let config = pmu.sink().config.clone().unwrap();
        assert_eq!(config.pmu_configs[1].station_name(), "D");
        assert_eq!(config.pmu_configs[1].cfgcnt, 2);
    }

    #[test]
    fn test_measurement_requires_mapping() {
        let mut pmu = VirtualPmu::new(
            PmuConfig {
                nodes: vec![1],
                ..Default::default()
            },
            MockSink::default(),
        )
        .unwrap();
        assert_eq!(
            pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 0.0),
            Err(IndexMapError::Unavailable)
        );
        assert!(pmu.next_output().is_none());
    }

    #[test]
    fn test_denormalization() {
        let mut pmu = streaming_pmu();
        pmu.handle_measurement(&vars(1.02, 4.0, 1.01), 0.5).unwrap();
        assert_eq!(pmu.last_timestamp(), Some(0.5));
        assert_eq!(pmu.last_vector(), &[1.02, 1.02, 4.0, 4.0, 1.01, 1.01]);

        let sample = pmu.next_output().unwrap();
        assert_eq!(sample.t, 0.5);
        // Bus 2 is in SysParam, bus 4 uses the configured default.
        assert_abs_diff_eq!(sample.magnitude[0], 1.02 * 230e3, epsilon = 1e-6);
        assert_abs_diff_eq!(sample.magnitude[1], 1.02 * 110e3, epsilon = 1e-6);
        assert_abs_diff_eq!(sample.angle[0], 4.0 - 2.0 * PI, epsilon = 1e-12);
        assert_abs_diff_eq!(sample.frequency[1], 60.6, epsilon = 1e-9);
    }

    #[test]
    fn test_record_then_replay_in_order() {
        let mut pmu = streaming_pmu();
        pmu.handle_measurement(&vars(0.9, 0.0, 1.0), 0.0).unwrap();
        assert_eq!(pmu.apply_command(cmd(1, 0, 0)), Ok(RecordState::Recording));
        for k in 1..=5 {
            pmu.handle_measurement(&vars(1.0 + k as f64 * 0.01, 0.0, 1.0), k as f64)
                .unwrap();
        }
        assert_eq!(pmu.apply_command(cmd(2, 0, 0)), Ok(RecordState::Recorded));
        pmu.handle_measurement(&vars(0.5, 0.0, 1.0), 6.0).unwrap();
        assert_eq!(pmu.store().record().count(), 5);

        assert_eq!(pmu.apply_command(cmd(0, 1, 0)), Ok(RecordState::Replaying));
        for k in 1..=5 {
            assert_eq!(pmu.record_state(), RecordState::Replaying);
            let sample = pmu.next_output().unwrap();
            assert_eq!(sample.t, k as f64);
            assert_abs_diff_eq!(
                sample.magnitude[0],
                (1.0 + k as f64 * 0.01) * 230e3,
                epsilon = 1e-6
            );
        }
        assert_eq!(pmu.record_state(), RecordState::Recorded);
        // Back on live data.
        assert_eq!(pmu.next_output().unwrap().t, 6.0);

        // A second replay starts from the beginning; replay:2 stops it early.
        pmu.apply_command(cmd(0, 1, 0)).unwrap();
        assert_eq!(pmu.next_output().unwrap().t, 1.0);
        assert_eq!(pmu.apply_command(cmd(0, 2, 0)), Ok(RecordState::Recorded));
        pmu.apply_command(cmd(0, 1, 0)).unwrap();
        assert_eq!(pmu.next_output().unwrap().t, 1.0);
    }

    #[test]
    fn test_replay_after_record_overflow() {
        let mut pmu = pmu_with(PmuConfig {
            nodes: vec![2, 4],
            max_store_record: 3,
            ..Default::default()
        });
        pmu.apply_command(cmd(1, 0, 0)).unwrap();
        for k in 1..=5 {
            pmu.handle_measurement(&vars(1.0, 0.0, 1.0), k as f64).unwrap();
        }
        pmu.apply_command(cmd(2, 0, 0)).unwrap();
        assert_eq!(pmu.store().record().count(), 5);
        assert_eq!(pmu.store().record().len(), 3);

        pmu.apply_command(cmd(0, 1, 0)).unwrap();
        let replayed: Vec<f64> = (0..3).map(|_| pmu.next_output().unwrap().t).collect();
        assert_eq!(replayed, vec![3.0, 4.0, 5.0]);
        assert_eq!(pmu.record_state(), RecordState::Recorded);
    }

    #[test]
    fn test_idxvgs_layout_reads_table_offsets() {
        let mut pmu = VirtualPmu::with_seed(
            PmuConfig {
                nodes: vec![2, 4],
                layout: IndexLayout::Idxvgs,
                ..Default::default()
            },
            MockSink::default(),
            7,
        )
        .unwrap();
        pmu.observe(WorkspaceVar::SysParam(SysParam::default()));
        pmu.observe(WorkspaceVar::Idxvgs(idxvgs()));
        // Narrower than the offsets: mapped anyway, with a warning.
        pmu.observe(WorkspaceVar::Varheader(vec!["V".to_string(); 6]));
        let map = pmu.index_map().unwrap();
        assert_eq!(map.vm(), &[1, 3]);
        assert_eq!(map.w(), &[9, 11]);

        let mut block = vec![1.0; BUSES];
        block.extend(vec![0.5; BUSES]);
        block.extend(vec![1.01; BUSES]);
        pmu.handle_measurement(&block, 0.0).unwrap();
        assert_eq!(pmu.last_vector(), &[1.0, 1.0, 0.5, 0.5, 1.01, 1.01]);
        assert!(matches!(
            pmu.handle_measurement(&block[..6], 0.1),
            Err(IndexMapError::VectorTooShort { .. })
        ));
    }

    #[test]
    fn test_stop_recording_with_nothing_recorded() {
        let mut pmu = streaming_pmu();
        pmu.apply_command(cmd(1, 0, 0)).unwrap();
        assert_eq!(pmu.apply_command(cmd(2, 0, 0)), Ok(RecordState::Idle));
        assert!(pmu.apply_command(cmd(0, 1, 0)).is_err());
    }

    #[test]
    fn test_flush_and_atomic_commands() {
        let mut pmu = streaming_pmu();
        pmu.apply_command(cmd(1, 0, 0)).unwrap();
        pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 1.0).unwrap();
        pmu.apply_command(cmd(2, 0, 0)).unwrap();

        // The flush would leave Idle, where replay:1 is illegal: nothing applies.
        assert!(pmu.apply_command(cmd(0, 1, 1)).is_err());
        assert_eq!(pmu.record_state(), RecordState::Recorded);
        assert_eq!(pmu.store().record().len(), 1);

        // Flush and start a fresh recording in one go.
        assert_eq!(pmu.apply_command(cmd(1, 0, 1)), Ok(RecordState::Recording));
        assert!(pmu.store().record().is_empty());
        assert!(pmu.store().live().is_empty());

        assert_eq!(pmu.apply_command(cmd(0, 0, 1)), Ok(RecordState::Idle));
    }

    #[test]
    fn test_new_recording_discards_previous() {
        let mut pmu = streaming_pmu();
        pmu.apply_command(cmd(1, 0, 0)).unwrap();
        pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 1.0).unwrap();
        pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 2.0).unwrap();
        pmu.apply_command(cmd(2, 0, 0)).unwrap();

        pmu.apply_command(cmd(1, 0, 0)).unwrap();
        assert!(pmu.store().record().is_empty());
        pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 3.0).unwrap();
        pmu.apply_command(cmd(2, 0, 0)).unwrap();
        assert_eq!(pmu.store().record().latest().unwrap().0, 3.0);
        assert_eq!(pmu.store().record().len(), 1);
    }

    #[test]
    fn test_publish_only_with_consumers() {
        let mut pmu = streaming_pmu();
        pmu.handle_measurement(&vars(1.0, 0.1, 1.0), 2.5).unwrap();

        assert!(pmu.tick().is_some());
        assert!(pmu.sink().sent.is_empty());

        pmu.sink_mut().streaming = true;
        pmu.tick();
        let sent = &pmu.sink().sent;
        assert_eq!(sent.len(), 1);
        let ids: Vec<u16> = sent[0].measurements.iter().map(|m| m.source_id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(sent[0].measurements[0].analog, vec![2.5]);
        assert_eq!(sent[0].measurements[0].digital, DIGITAL_STATUS);
    }

    #[test]
    fn test_done_resets_run() {
        for retain_data in [false, true] {
            let mut pmu = pmu_with(PmuConfig {
                nodes: vec![2, 4],
                retain_data,
                ..Default::default()
            });
            pmu.apply_command(cmd(1, 0, 0)).unwrap();
            pmu.observe(WorkspaceVar::PmuData(PmuData {
                t: 1.0,
                vars: vars(1.0, 0.0, 1.0),
            }));
            pmu.apply_command(cmd(2, 0, 0)).unwrap();

            pmu.observe(WorkspaceVar::Done(1.0));
            assert_eq!(pmu.sync_state(), SyncState::Reset);
            assert!(pmu.index_map().is_none());
            assert!(pmu.store().live().is_empty());
            assert_eq!(pmu.last_timestamp(), None);

            if retain_data {
                assert_eq!(pmu.record_state(), RecordState::Recorded);
                assert_eq!(pmu.store().record().len(), 1);
            } else {
                assert_eq!(pmu.record_state(), RecordState::Idle);
                assert!(pmu.store().record().is_empty());
            }
        }
    }

    #[test]
    fn test_noise_is_seeded() {
        let config = PmuConfig {
            nodes: vec![2],
            noise_level: 0.01,
            ..Default::default()
        };
        let mut a = pmu_with(config.clone());
        let mut b = pmu_with(config);
        for pmu in [&mut a, &mut b] {
            pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 0.0).unwrap();
        }
        let sa = a.next_output().unwrap();
        let sb = b.next_output().unwrap();
        assert_eq!(sa, sb);
        assert_ne!(sa.magnitude[0], 230e3);
        assert!((sa.magnitude[0] - 230e3).abs() < 0.1 * 230e3);
    }

    #[test]
    fn test_record_batch_columns() {
        let mut pmu = streaming_pmu();
        pmu.handle_measurement(&vars(1.0, 0.0, 1.0), 0.25).unwrap();
        let batch = pmu.record_batch(BufferKind::Live).unwrap();
        assert_eq!(batch.num_rows(), 1);
        let names: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["t", "vm_2", "vm_4", "am_2", "am_4", "w_2", "w_4"]);
    }
}
