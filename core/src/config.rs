//! Run-time settings for the virtual PMU and the aggregator.
//!
//! Both are plain structs built once at start-up (by the CLI or a test) and passed
//! by reference. `validate()` reports fatal mistakes before any loop starts.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::RetryPolicy;
use crate::error::ConfigError;
use crate::index_map::IndexLayout;
use crate::islanding::IslandingEvent;
use crate::sample_store::{DEFAULT_MAX_STORE, DEFAULT_MAX_STORE_RECORD};

/// Settings of one virtual PMU.
///
/// # Fields
///
/// * `name`: Bus client name, also used in the header frame.
/// * `nodes`: Monitored bus indices (1-based). Each becomes one PMU block.
/// * `layout`: Where each bus's values sit in `pmudata.vars`.
/// * `listen_ip`, `port`: Where consumers connect.
/// * `nominal_frequency`: Hz; scales the per-unit frequency.
/// * `voltage_base_kv`: Fallback for buses missing from `SysParam`.
/// * `noise_level`: Standard deviation of Gaussian noise in per unit; 0 disables.
/// * `data_rate`: Frames per second sent to consumers.
/// * `max_store`, `max_store_record`: Live and record buffer capacities.
/// * `retain_data`: Keep the recording across a `DONE` reset.
/// * `poll_interval`: Back-off after an empty bus poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PmuConfig {
    pub name: String,
    pub nodes: Vec<u32>,
    pub layout: IndexLayout,
    pub listen_ip: String,
    pub port: u16,
    pub nominal_frequency: f64,
    pub voltage_base_kv: f64,
    pub noise_level: f64,
    pub data_rate: u16,
    pub max_store: usize,
    pub max_store_record: usize,
    pub retain_data: bool,
    pub poll_interval: Duration,
}

impl Default for PmuConfig {
    fn default() -> Self {
        PmuConfig {
            name: "PMU".to_string(),
            nodes: Vec::new(),
            layout: IndexLayout::Interleaved,
            listen_ip: "0.0.0.0".to_string(),
            port: 1410,
            nominal_frequency: 60.0,
            voltage_base_kv: 110.0,
            noise_level: 0.0,
            data_rate: 30,
            max_store: DEFAULT_MAX_STORE,
            max_store_record: DEFAULT_MAX_STORE_RECORD,
            retain_data: false,
            poll_interval: Duration::from_millis(5),
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be positive, got {}", value)))
    }
}

impl PmuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("name", "PMU name is empty"));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyIndexList);
        }
        let mut seen = HashSet::new();
        for &node in &self.nodes {
            if node == 0 || node > u16::MAX as u32 {
                return Err(ConfigError::invalid(
                    "nodes",
                    format!("{} is not a 1-based bus index", node),
                ));
            }
            if !seen.insert(node) {
                return Err(ConfigError::invalid("nodes", format!("{} listed twice", node)));
            }
        }
        positive("nominal_frequency", self.nominal_frequency)?;
        positive("voltage_base_kv", self.voltage_base_kv)?;
        if !self.noise_level.is_finite() || self.noise_level < 0.0 {
            return Err(ConfigError::invalid(
                "noise_level",
                format!("must be >= 0, got {}", self.noise_level),
            ));
        }
        if self.data_rate == 0 {
            return Err(ConfigError::invalid("data_rate", "must be at least 1"));
        }
        if self.max_store == 0 || self.max_store_record == 0 {
            return Err(ConfigError::invalid("max_store", "buffer capacity must be at least 1"));
        }
        Ok(())
    }

    /// Interval between published frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.data_rate.max(1) as f64)
    }
}

/// A PMU the aggregator connects to: `host:port`, optionally `host:port@idcode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAddr {
    pub ip: String,
    pub port: u16,
    pub idcode: u16,
}

impl FromStr for SourceAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::invalid("source", format!("expected host:port[@idcode], got '{}'", s));
        let (addr, idcode) = match s.split_once('@') {
            Some((addr, id)) => (addr, id.parse::<u16>().map_err(|_| bad())?),
            None => (s, 1),
        };
        let (ip, port) = addr.rsplit_once(':').ok_or_else(bad)?;
        if ip.is_empty() {
            return Err(bad());
        }
        Ok(SourceAddr {
            ip: ip.to_string(),
            port: port.parse().map_err(|_| bad())?,
            idcode,
        })
    }
}

impl fmt::Display for SourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.ip, self.port, self.idcode)
    }
}

/// Settings of the PDC aggregator and its islanding detector.
///
/// Thresholds are in Hz; the frequency cache is in mHz and compares against
/// `threshold * 1000`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub name: String,
    pub sources: Vec<SourceAddr>,
    pub nominal_frequency: f64,
    pub trip_threshold_hz: f64,
    pub spurious_guard_hz: f64,
    pub islanding_delay: Duration,
    /// A source silent for longer than this reads as nominal.
    pub stale_after: Duration,
    /// Control loop period.
    pub cycle: Duration,
    /// Bounded inbox per source.
    pub inbox_capacity: usize,
    /// Capacity of the divergence history.
    pub history_capacity: usize,
    pub event: IslandingEvent,
    pub reconnect: RetryPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            name: "ISLANDING".to_string(),
            sources: Vec::new(),
            nominal_frequency: 60.0,
            trip_threshold_hz: 0.4,
            spurious_guard_hz: 1.0,
            islanding_delay: Duration::from_secs(7),
            stale_after: Duration::from_millis(500),
            cycle: Duration::from_millis(5),
            inbox_capacity: 100,
            history_capacity: DEFAULT_MAX_STORE,
            event: IslandingEvent::default(),
            reconnect: RetryPolicy::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        positive("nominal_frequency", self.nominal_frequency)?;
        positive("trip_threshold_hz", self.trip_threshold_hz)?;
        positive("spurious_guard_hz", self.spurious_guard_hz)?;
        if self.spurious_guard_hz <= self.trip_threshold_hz {
            return Err(ConfigError::invalid(
                "spurious_guard_hz",
                "must be larger than the trip threshold",
            ));
        }
        if self.cycle.is_zero() {
            return Err(ConfigError::invalid("cycle", "must be non-zero"));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::invalid("inbox_capacity", "must be at least 1"));
        }
        self.event.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmu_config_validation() {
        let mut config = PmuConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::EmptyIndexList));

        config.nodes = vec![4, 5];
        assert!(config.validate().is_ok());

        config.nodes = vec![4, 4];
        assert!(config.validate().is_err());

        config.nodes = vec![4];
        config.noise_level = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_source_addr_parsing() {
        let addr: SourceAddr = "192.168.1.19:1410@19".parse().unwrap();
        assert_eq!(
            addr,
            SourceAddr {
                ip: "192.168.1.19".to_string(),
                port: 1410,
                idcode: 19
            }
        );
        assert_eq!("localhost:1410".parse::<SourceAddr>().unwrap().idcode, 1);
        assert!("localhost".parse::<SourceAddr>().is_err());
        assert!(":1410".parse::<SourceAddr>().is_err());
        assert!("host:1410@x".parse::<SourceAddr>().is_err());
    }

    #[test]
    fn test_aggregator_config_validation() {
        let mut config = AggregatorConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::NoSources));

        config.sources.push("127.0.0.1:1410".parse().unwrap());
        assert!(config.validate().is_ok());

        config.spurious_guard_hz = 0.3;
        assert!(config.validate().is_err());
    }
}
