//! # PDC Aggregator
//!
//! Collects frames from several PMUs and decides whether the system is islanding.
//!
//! Each configured source gets a worker thread owning its `FrameSource`. The worker
//! connects (retrying every `reconnect.delay` until stopped, so a PMU that comes up
//! late or restarts is picked up again), fetches the header and configuration, turns
//! transmission on and pushes every frame into a bounded inbox. The control loop
//! drains the inboxes once per cycle, updates the frequency cache, evaluates the
//! divergence and steps the `IslandingDetector`. When the detector trips, the
//! configured `IslandingEvent` is sent to the simulator as `Event`.
//!
//! The aggregator only evaluates while the simulator is online: from the first
//! `SysParam` of a run until `DONE`. Every `SysParam` starts a fresh decision.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use tracing::{debug, error, info, warn};

use crate::bus::{RetryPolicy, SharedBus, WorkspaceVar, SIM_TARGET};
use crate::config::{AggregatorConfig, SourceAddr};
use crate::error::{BusError, ConfigError, FrameError};
use crate::frame::{Frame, FrameSource};
use crate::ieee_c37_118::config::ConfigurationFrame;
use crate::ieee_c37_118::header::HeaderFrame;
use crate::islanding::{
    evaluate_divergence, Decision, Divergence, FrequencyCache, IslandingDetector, IslandingState,
};
use crate::sample_store::RingBuffer;
use crate::sync::{SyncEvent, SyncMachine, AGGREGATOR_REQUIRED};
use crate::utils::unix_now;

/// Name of the variable carrying the trip event.
pub const EVENT_VAR: &str = "Event";

const RECEIVE_POLL: Duration = Duration::from_millis(50);
const HISTORY_COLUMNS: [&str; 2] = ["diff_mhz", "threshold_mhz"];

/// Islanding decision engine fed by N frame sources.
pub struct PdcAggregator {
    config: AggregatorConfig,
    sync: SyncMachine,
    cache: FrequencyCache,
    detector: IslandingDetector,
    history: RingBuffer,
    headers: BTreeMap<usize, HeaderFrame>,
    configs: BTreeMap<usize, ConfigurationFrame>,
    online: bool,
    last_divergence: Option<Divergence>,
}

impl PdcAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut cache = FrequencyCache::new();
        for source in 0..config.sources.len() {
            cache.register(source);
        }
        Ok(PdcAggregator {
            sync: SyncMachine::new(AGGREGATOR_REQUIRED),
            detector: IslandingDetector::new(config.trip_threshold_hz, config.islanding_delay),
            history: RingBuffer::new(config.history_capacity.max(1), HISTORY_COLUMNS.len()),
            headers: BTreeMap::new(),
            configs: BTreeMap::new(),
            online: false,
            last_divergence: None,
            cache,
            config,
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn state(&self) -> IslandingState {
        self.detector.state()
    }

    pub fn detector(&self) -> &IslandingDetector {
        &self.detector
    }

    pub fn cache(&self) -> &FrequencyCache {
        &self.cache
    }

    /// Whether the simulator is online and decisions are being made.
    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn header(&self, source: usize) -> Option<&HeaderFrame> {
        self.headers.get(&source)
    }

    pub fn configuration(&self, source: usize) -> Option<&ConfigurationFrame> {
        self.configs.get(&source)
    }

    pub fn last_divergence(&self) -> Option<Divergence> {
        self.last_divergence
    }

    /// `(t, [diff, threshold])` per evaluated cycle, in mHz.
    pub fn history(&self) -> &RingBuffer {
        &self.history
    }

    pub fn history_batch(&self) -> Result<RecordBatch, ArrowError> {
        let columns: Vec<String> = HISTORY_COLUMNS.iter().map(|c| c.to_string()).collect();
        self.history.to_record_batch(&columns)
    }

    /// Feeds one variable through the synchronization machine.
    pub fn observe(&mut self, var: WorkspaceVar) {
        let event = self.sync.observe(var);
        self.on_bus_event(event);
    }

    pub fn on_bus_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Ready(WorkspaceVar::SysParam(_))
            | SyncEvent::OutOfPhase(WorkspaceVar::SysParam(_)) => self.start_run(),
            SyncEvent::Done => {
                info!("{}: Simulator offline", self.config.name);
                self.online = false;
                self.clear_decision();
            }
            _ => {}
        }
    }

    fn start_run(&mut self) {
        if !self.online {
            info!("{}: Simulator online", self.config.name);
        } else {
            info!("{}: New SysParam, restarting decision", self.config.name);
        }
        self.online = true;
        self.clear_decision();
    }

    fn clear_decision(&mut self) {
        self.detector.reset();
        for source in 0..self.config.sources.len() {
            self.cache.forget(source);
        }
        self.last_divergence = None;
    }

    /// Classifies one frame from `source`.
    pub fn on_frame(&mut self, source: usize, frame: Frame, now: Instant) {
        match frame {
            Frame::Header(header) => {
                debug!("{}: Header from source {}: {}", self.config.name, source, header.data);
                self.headers.insert(source, header);
            }
            Frame::Config(config) => {
                debug!(
                    "{}: CFG-{} from source {} ({} PMUs)",
                    self.config.name, config.cfg_type, source, config.num_pmu
                );
                self.configs.insert(source, config);
            }
            Frame::Data(record) => match record.measurements.first() {
                Some(m) => {
                    self.cache
                        .update(source, m.frequency, self.config.nominal_frequency, now)
                }
                None => warn!("{}: Empty data frame from source {}", self.config.name, source),
            },
        }
    }

    /// Runs one divergence evaluation and detector step.
    ///
    /// Returns `Decision::Trip` exactly once per run; the caller publishes the
    /// event.
    pub fn evaluate(&mut self, now: Instant) -> Decision {
        if !self.online {
            return Decision::Unchanged;
        }
        let deviations = self.cache.deviations(now, self.config.stale_after);
        let Some(divergence) =
            evaluate_divergence(&deviations, self.config.spurious_guard_hz * 1000.0)
        else {
            return Decision::Unchanged;
        };
        if divergence.spurious {
            debug!(
                "{}: Discarding spurious divergence of {:.1} mHz",
                self.config.name, divergence.raw
            );
        }
        self.last_divergence = Some(divergence);
        self.history.write(
            unix_now(),
            &[divergence.diff, self.detector.trip_threshold_mhz()],
        );

        let decision = self.detector.step(divergence.diff, now);
        match decision {
            Decision::Detected => warn!(
                "{}: Frequency divergence of {:.1} mHz detected, islanding in {:?}",
                self.config.name, divergence.diff, self.config.islanding_delay
            ),
            Decision::Trip => warn!("{}: Islanding initiated", self.config.name),
            Decision::Unchanged => {}
        }
        decision
    }

    /// Sends the trip event to the simulator. A failure is logged; the detector
    /// stays tripped.
    pub fn publish_event(&self, bus: &SharedBus) {
        match bus.publish(SIM_TARGET, EVENT_VAR, &self.config.event) {
            Ok(()) => info!(
                "{}: Event sent to {} (lines {:?})",
                self.config.name, SIM_TARGET, self.config.event.id
            ),
            Err(e) => error!("{}: Could not send Event: {}", self.config.name, e),
        }
    }

    /// Control loop. Source workers are started once the simulator is online and
    /// are stopped, after a stop-transmission command, when `stop` is set.
    ///
    /// Only connection-level bus failures end the loop early.
    pub fn run<S, F>(&mut self, bus: &SharedBus, connect: F, stop: &AtomicBool) -> Result<(), BusError>
    where
        S: FrameSource + 'static,
        F: Fn(&SourceAddr) -> Result<S, FrameError> + Send + Sync + 'static,
    {
        info!(
            "{}: Waiting for the simulator, {} sources configured",
            self.config.name,
            self.config.sources.len()
        );
        let connect = Arc::new(connect);
        let mut workers: Option<SourceWorkers> = None;

        let result = loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            match self.sync.poll(bus, self.config.cycle) {
                Ok(Some(event)) => self.on_bus_event(event),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            if self.online && workers.is_none() {
                workers = Some(SourceWorkers::spawn(&self.config, Arc::clone(&connect)));
            }
            if let Some(workers) = &workers {
                for (source, inbox) in workers.inboxes.iter().enumerate() {
                    while let Ok(frame) = inbox.try_recv() {
                        self.on_frame(source, frame, Instant::now());
                    }
                }
            }

            if self.evaluate(Instant::now()) == Decision::Trip {
                self.publish_event(bus);
            }
        };

        if let Some(workers) = workers {
            workers.shutdown();
        }
        info!("{}: Stopped", self.config.name);
        result
    }
}

/// One worker thread and inbox per source.
struct SourceWorkers {
    stop: Arc<AtomicBool>,
    inboxes: Vec<Receiver<Frame>>,
    handles: Vec<JoinHandle<()>>,
}

impl SourceWorkers {
    fn spawn<S, F>(config: &AggregatorConfig, connect: Arc<F>) -> Self
    where
        S: FrameSource + 'static,
        F: Fn(&SourceAddr) -> Result<S, FrameError> + Send + Sync + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let mut inboxes = Vec::with_capacity(config.sources.len());
        let mut handles = Vec::with_capacity(config.sources.len());

        for (source, addr) in config.sources.iter().enumerate() {
            let (tx, rx) = mpsc::sync_channel(config.inbox_capacity);
            let worker = SourceWorker {
                source,
                addr: addr.clone(),
                reconnect: config.reconnect,
                tx,
                stop: Arc::clone(&stop),
            };
            let connect = Arc::clone(&connect);
            handles.push(thread::spawn(move || worker.run(|addr| (*connect)(addr))));
            inboxes.push(rx);
        }
        info!("Started {} source workers", handles.len());

        SourceWorkers {
            stop,
            inboxes,
            handles,
        }
    }

    /// Stops and joins every worker. Frames still queued are discarded.
    fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                error!("A source worker panicked");
            }
        }
        let dropped: usize = self.inboxes.iter().map(|inbox| inbox.try_iter().count()).sum();
        if dropped > 0 {
            debug!("Discarded {} queued frames", dropped);
        }
    }
}

struct SourceWorker {
    source: usize,
    addr: SourceAddr,
    reconnect: RetryPolicy,
    tx: SyncSender<Frame>,
    stop: Arc<AtomicBool>,
}

impl SourceWorker {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn run<S, F>(self, connect: F)
    where
        S: FrameSource,
        F: Fn(&SourceAddr) -> Result<S, FrameError>,
    {
        let what = format!("Source {} ({}) connect", self.source, self.addr);
        while !self.stopped() {
            let connected = self
                .reconnect
                .retry(&what, || connect(&self.addr), |_, _| !self.stopped());
            // Only a stop request ends the retries.
            let Ok(mut session) = connected else {
                return;
            };

            match self.stream(&mut session) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!("Source {} ({}): Session lost: {}", self.source, self.addr, e);
                    thread::sleep(self.reconnect.delay);
                    continue;
                }
            }

            if let Err(e) = session.stop_streaming() {
                debug!("Source {}: Stop command failed: {}", self.source, e);
            }
            return;
        }
    }

    /// Serves one session. `Ok(true)` when stopped, `Ok(false)` when the
    /// aggregator went away.
    fn stream<S: FrameSource>(&self, session: &mut S) -> Result<bool, FrameError> {
        let header = session.request_header()?;
        if !self.forward(Frame::Header(header)) {
            return Ok(false);
        }
        let config = session.request_config()?;
        if !self.forward(Frame::Config(config)) {
            return Ok(false);
        }
        session.start_streaming()?;
        info!("Source {} ({}): Streaming", self.source, self.addr);

        while !self.stopped() {
            match session.receive(RECEIVE_POLL) {
                Ok(Some(frame)) => {
                    if !self.forward(frame) {
                        return Ok(false);
                    }
                }
                Ok(None) => {}
                Err(e @ (FrameError::Parse(_) | FrameError::NotConfigured)) => {
                    warn!("Source {}: Skipping bad frame: {}", self.source, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Queues a frame without blocking; a full inbox drops it.
    fn forward(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                debug!("Source {}: Inbox full, dropping {} frame", self.source, frame.kind());
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
