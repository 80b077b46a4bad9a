//! # Islanding Decision
//!
//! Cross-source frequency divergence and the latching detect/trip state machine.
//!
//! Frequencies are cached as deviations from nominal in mHz. Each control cycle the
//! aggregator asks for the spread (`max - min`) of the cached deviations; a spread
//! at or above the spurious-reading guard is treated as noise and replaced by 0.
//! The detector arms on a spread at or above the trip threshold and, once armed,
//! trips after the islanding delay no matter what the spread does in between.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Line-trip event published to the simulator, as parallel arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandingEvent {
    pub id: Vec<i64>,
    pub name: Vec<String>,
    pub time: Vec<f64>,
    pub duration: Vec<f64>,
    pub action: Vec<i64>,
}

impl IslandingEvent {
    /// Opens the given lines immediately (`time = -1`), permanently.
    pub fn open_lines(ids: &[i64]) -> Self {
        IslandingEvent {
            id: ids.to_vec(),
            name: vec!["Line".to_string(); ids.len()],
            time: vec![-1.0; ids.len()],
            duration: vec![0.0; ids.len()],
            action: vec![0; ids.len()],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.id.len();
        if n == 0 {
            return Err(ConfigError::invalid("event", "no elements to trip"));
        }
        if [self.name.len(), self.time.len(), self.duration.len(), self.action.len()]
            .iter()
            .any(|len| *len != n)
        {
            return Err(ConfigError::invalid("event", "arrays differ in length"));
        }
        Ok(())
    }
}

impl Default for IslandingEvent {
    fn default() -> Self {
        IslandingEvent::open_lines(&[143, 146, 135])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IslandingState {
    Idle,
    Detected,
    Tripped,
}

/// Outcome of one detector step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Unchanged,
    Detected,
    /// The delay has elapsed; publish the event. Returned once per run.
    Trip,
}

/// Result of one divergence evaluation, in mHz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Divergence {
    /// `max - min` over the cached deviations.
    pub raw: f64,
    /// `raw`, or 0 if `raw` was discarded as spurious.
    pub diff: f64,
    pub spurious: bool,
}

/// Spread of `deviations` with the spurious-reading guard applied.
///
/// Returns `None` when there is nothing to compare.
pub fn evaluate_divergence(deviations: &[f64], guard_mhz: f64) -> Option<Divergence> {
    if deviations.is_empty() {
        return None;
    }
    let max = deviations.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = deviations.iter().copied().fold(f64::INFINITY, f64::min);
    let raw = max - min;
    let spurious = raw.abs() >= guard_mhz;
    Some(Divergence {
        raw,
        diff: if spurious { 0.0 } else { raw },
        spurious,
    })
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    mhz: f64,
    at: Instant,
}

/// Latest deviation per source. Registered sources without a fresh reading
/// count as nominal.
#[derive(Debug, Clone, Default)]
pub struct FrequencyCache {
    readings: BTreeMap<usize, Option<Reading>>,
}

impl FrequencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source reading nominal until it reports.
    pub fn register(&mut self, source: usize) {
        self.readings.entry(source).or_insert(None);
    }

    /// Stores `(frequency - nominal) * 1000` for `source`.
    pub fn update(&mut self, source: usize, frequency_hz: f64, nominal_hz: f64, now: Instant) {
        if !frequency_hz.is_finite() {
            return;
        }
        self.readings.insert(
            source,
            Some(Reading {
                mhz: (frequency_hz - nominal_hz) * 1000.0,
                at: now,
            }),
        );
    }

    /// Drops a source's reading; it reads nominal again.
    pub fn forget(&mut self, source: usize) {
        if let Some(reading) = self.readings.get_mut(&source) {
            *reading = None;
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Deviation of `source` in mHz as it would enter the next evaluation.
    pub fn deviation(&self, source: usize, now: Instant, stale_after: Duration) -> Option<f64> {
        self.readings.get(&source).map(|reading| match reading {
            Some(r) if now.saturating_duration_since(r.at) <= stale_after => r.mhz,
            _ => 0.0,
        })
    }

    /// Deviations of every registered source in mHz.
    pub fn deviations(&self, now: Instant, stale_after: Duration) -> Vec<f64> {
        self.readings
            .keys()
            .filter_map(|source| self.deviation(*source, now, stale_after))
            .collect()
    }
}

/// Latching Idle → Detected → Tripped machine.
#[derive(Debug, Clone)]
pub struct IslandingDetector {
    state: IslandingState,
    detect_time: Option<Instant>,
    trip_threshold_mhz: f64,
    delay: Duration,
}

impl IslandingDetector {
    pub fn new(trip_threshold_hz: f64, delay: Duration) -> Self {
        IslandingDetector {
            state: IslandingState::Idle,
            detect_time: None,
            trip_threshold_mhz: trip_threshold_hz * 1000.0,
            delay,
        }
    }

    pub fn state(&self) -> IslandingState {
        self.state
    }

    pub fn detect_time(&self) -> Option<Instant> {
        self.detect_time
    }

    pub fn trip_threshold_mhz(&self) -> f64 {
        self.trip_threshold_mhz
    }

    /// Back to `Idle` for a new run.
    pub fn reset(&mut self) {
        self.state = IslandingState::Idle;
        self.detect_time = None;
    }

    /// Advances with this cycle's spread (mHz, already guarded).
    pub fn step(&mut self, diff_mhz: f64, now: Instant) -> Decision {
        match self.state {
            IslandingState::Idle if diff_mhz >= self.trip_threshold_mhz => {
                self.state = IslandingState::Detected;
                self.detect_time = Some(now);
                Decision::Detected
            }
            IslandingState::Detected => match self.detect_time {
                Some(t) if now.saturating_duration_since(t) >= self.delay => {
                    self.state = IslandingState::Tripped;
                    Decision::Trip
                }
                _ => Decision::Unchanged,
            },
            _ => Decision::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_event_defaults() {
        let event = IslandingEvent::default();
        assert_eq!(event.id, vec![143, 146, 135]);
        assert!(event.validate().is_ok());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "id": [143, 146, 135],
                "name": ["Line", "Line", "Line"],
                "time": [-1.0, -1.0, -1.0],
                "duration": [0.0, 0.0, 0.0],
                "action": [0, 0, 0]
            })
        );

        let mut bad = IslandingEvent::default();
        bad.action.pop();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_three_source_scenario() {
        let t0 = Instant::now();
        let mut cache = FrequencyCache::new();
        for (source, f) in [60.0, 60.5, 60.0].iter().enumerate() {
            cache.update(source, *f, 60.0, t0);
        }
        let stale = Duration::from_millis(500);
        assert_eq!(cache.deviations(t0, stale), vec![0.0, 500.0, 0.0]);

        let divergence = evaluate_divergence(&cache.deviations(t0, stale), 1000.0).unwrap();
        assert_eq!(divergence.diff, 500.0);

        let mut detector = IslandingDetector::new(0.4, Duration::from_secs(7));
        assert_eq!(detector.step(divergence.diff, t0), Decision::Detected);
        assert_eq!(detector.state(), IslandingState::Detected);

        // Back to nominal inside the window does not cancel.
        assert_eq!(
            detector.step(0.0, t0 + Duration::from_millis(6999)),
            Decision::Unchanged
        );
        assert_eq!(detector.step(0.0, t0 + Duration::from_secs(7)), Decision::Trip);
        assert_eq!(detector.state(), IslandingState::Tripped);
        assert_eq!(detector.step(500.0, t0 + Duration::from_secs(8)), Decision::Unchanged);

        detector.reset();
        assert_eq!(detector.state(), IslandingState::Idle);
        assert_eq!(detector.detect_time(), None);
    }

    #[test]
    fn test_spurious_spike_stays_idle() {
        let divergence = evaluate_divergence(&[0.0, 1500.0, 0.0], 1000.0).unwrap();
        assert!(divergence.spurious);
        assert_eq!(divergence.diff, 0.0);

        let mut detector = IslandingDetector::new(0.4, Duration::from_secs(7));
        assert_eq!(detector.step(divergence.diff, Instant::now()), Decision::Unchanged);
        assert_eq!(detector.state(), IslandingState::Idle);
    }

    #[test]
    fn test_stale_and_unreported_sources_read_nominal() {
        let t0 = Instant::now();
        let stale = Duration::from_millis(500);
        let mut cache = FrequencyCache::new();
        cache.register(0);
        cache.register(1);
        cache.update(1, 60.3, 60.0, t0);

        let devs = cache.deviations(t0, stale);
        assert_eq!(devs.len(), 2);
        assert_eq!(devs[0], 0.0);
        assert!((devs[1] - 300.0).abs() < 1e-6);

        assert_eq!(
            cache.deviations(t0 + Duration::from_secs(1), stale),
            vec![0.0, 0.0]
        );
        assert_eq!(evaluate_divergence(&[], 1000.0), None);
    }

    proptest! {
        #[test]
        fn prop_divergence_is_guarded_spread(devs in proptest::collection::vec(-3000.0f64..3000.0, 1..12)) {
            let max = devs.iter().cloned().fold(f64::MIN, f64::max);
            let min = devs.iter().cloned().fold(f64::MAX, f64::min);
            let d = evaluate_divergence(&devs, 1000.0).unwrap();
            prop_assert_eq!(d.raw, max - min);
            if (max - min).abs() >= 1000.0 {
                prop_assert_eq!(d.diff, 0.0);
            } else {
                prop_assert_eq!(d.diff, max - min);
            }
        }

        #[test]
        fn prop_trip_exactly_once_at_delay(offsets_ms in proptest::collection::vec(0u64..6999, 0..20)) {
            let t0 = Instant::now();
            let delay = Duration::from_secs(7);
            let mut detector = IslandingDetector::new(0.4, delay);
            prop_assert_eq!(detector.step(400.0, t0), Decision::Detected);
            for ms in offsets_ms {
                prop_assert_eq!(detector.step(0.0, t0 + Duration::from_millis(ms)), Decision::Unchanged);
            }
            prop_assert_eq!(detector.step(0.0, t0 + delay), Decision::Trip);
            prop_assert_eq!(detector.step(400.0, t0 + delay), Decision::Unchanged);
        }
    }
}
