//! # Typed Frames
//!
//! The view of the synchrophasor protocol the PMU and the aggregator work with.
//! `FrameSource` is a PDC-side session to one PMU, `FrameSink` is a PMU-side
//! server fanning data out to its consumers. Wire details stay in
//! `ieee_c37_118`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::ieee_c37_118::config::ConfigurationFrame;
use crate::ieee_c37_118::data_frame::{DataFrame, PMUData, PhasorValue};
use crate::ieee_c37_118::header::HeaderFrame;

/// One PMU's reading.
///
/// # Fields
///
/// * `source_id`: IDCODE of the PMU block.
/// * `frequency`: Absolute frequency in Hz.
/// * `phasor_magnitude`: Magnitude of the first phasor (V).
/// * `phasor_angle`: Angle of the first phasor (rad).
/// * `analog`: Analog channel values.
/// * `digital`: First digital status word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source_id: u16,
    pub frequency: f64,
    pub phasor_magnitude: f64,
    pub phasor_angle: f64,
    pub analog: Vec<f64>,
    pub digital: u16,
}

impl Measurement {
    fn from_pmu_data(source_id: u16, data: &PMUData) -> Self {
        let phasor = data.phasors.first().copied().unwrap_or(PhasorValue {
            magnitude: 0.0,
            angle: 0.0,
        });
        Measurement {
            source_id,
            frequency: data.freq as f64,
            phasor_magnitude: phasor.magnitude as f64,
            phasor_angle: phasor.angle as f64,
            analog: data.analog.iter().map(|v| *v as f64).collect(),
            digital: data.digital.first().copied().unwrap_or(0),
        }
    }

    pub(crate) fn to_pmu_data(&self, digital_words: usize) -> PMUData {
        let mut digital = vec![0u16; digital_words];
        if let Some(first) = digital.first_mut() {
            *first = self.digital;
        }
        PMUData {
            stat: 0,
            phasors: vec![PhasorValue {
                magnitude: self.phasor_magnitude as f32,
                angle: self.phasor_angle as f32,
            }],
            freq: self.frequency as f32,
            dfreq: 0.0,
            analog: self.analog.iter().map(|v| *v as f32).collect(),
            digital,
        }
    }
}

/// A data frame's measurements with its timestamp in seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub timestamp: f64,
    pub measurements: Vec<Measurement>,
}

impl DataRecord {
    pub fn from_data_frame(frame: &DataFrame, config: &ConfigurationFrame) -> Self {
        let measurements = frame
            .pmu_data
            .iter()
            .zip(&config.pmu_configs)
            .map(|(data, pmu)| Measurement::from_pmu_data(pmu.idcode, data))
            .collect();
        DataRecord {
            timestamp: frame.timestamp(config),
            measurements,
        }
    }
}

/// A frame received from a PMU.
///
/// `Config` holds CFG-1 or CFG-2 (see `ConfigurationFrame::cfg_type`); CFG-3 frames
/// fail to decode and never surface here.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(HeaderFrame),
    Config(ConfigurationFrame),
    Data(DataRecord),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Header(_) => "header",
            Frame::Config(_) => "config",
            Frame::Data(_) => "data",
        }
    }
}

/// PDC-side session with one PMU.
pub trait FrameSource: Send {
    fn request_header(&mut self) -> Result<HeaderFrame, FrameError>;

    fn request_config(&mut self) -> Result<ConfigurationFrame, FrameError>;

    fn start_streaming(&mut self) -> Result<(), FrameError>;

    fn stop_streaming(&mut self) -> Result<(), FrameError>;

    /// Waits up to `timeout` for the next frame. `Ok(None)` is a timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, FrameError>;
}

/// PMU-side fan-out to consumers.
pub trait FrameSink {
    /// Sets the header and configuration answered to consumers from now on.
    fn configure(&mut self, header: HeaderFrame, config: ConfigurationFrame) -> Result<(), FrameError>;

    /// Whether any consumer has turned transmission on.
    fn has_consumers(&self) -> bool;

    /// Sends one data record to every streaming consumer. Consumers whose socket
    /// fails are dropped; the call itself only fails if the sink is unusable.
    fn send(&mut self, record: &DataRecord) -> Result<(), FrameError>;
}
