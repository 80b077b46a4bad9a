//! # IEEE C37.118 Data Frames
//!
//! Parsing and construction of data frames, which carry the real-time measurements
//! of one or more PMUs. A `ConfigurationFrame` is required to interpret them: it
//! fixes the channel counts and whether each field is integer or float, polar or
//! rectangular.
//!
//! Decoded values are always engineering units: phasors as magnitude and angle in
//! radians, FREQ as the absolute frequency in Hz, DFREQ in Hz/s. Frames built here
//! use the float polar layout.

use super::common::{read_u16, read_u32, FrameType, ParseError, PrefixFrame, Version};
use super::config::{ConfigurationFrame, PMUConfigurationFrame};
use super::utils::{append_crc, validate_checksum};
use serde::{Deserialize, Serialize};

/// A phasor in polar form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhasorValue {
    pub magnitude: f32,
    pub angle: f32,
}

impl PhasorValue {
    fn from_rect(real: f32, imag: f32) -> Self {
        PhasorValue {
            magnitude: real.hypot(imag),
            angle: imag.atan2(real),
        }
    }
}

/// Measurements from a single PMU within a data frame.
///
/// # Fields
///
/// * `stat`: Raw STAT word.
/// * `phasors`: Phasors in configuration order.
/// * `freq`: Absolute frequency in Hz.
/// * `dfreq`: Rate of change of frequency in Hz/s.
/// * `analog`: Analog values.
/// * `digital`: Digital status words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PMUData {
    pub stat: u16,
    pub phasors: Vec<PhasorValue>,
    pub freq: f32,
    pub dfreq: f32,
    pub analog: Vec<f32>,
    pub digital: Vec<u16>,
}

/// Represents an IEEE C37.118 data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub prefix: PrefixFrame,
    pub pmu_data: Vec<PMUData>,
}

fn read_f32(bytes: &[u8], offset: usize) -> Result<f32, ParseError> {
    read_u32(bytes, offset).map(f32::from_bits)
}

fn read_i16(bytes: &[u8], offset: usize) -> Result<i16, ParseError> {
    read_u16(bytes, offset).map(|v| v as i16)
}

impl PMUData {
    /// Decodes one PMU section starting at `offset`, returning the section and the
    /// offset just past it.
    fn from_hex(
        bytes: &[u8],
        mut offset: usize,
        cfg: &PMUConfigurationFrame,
    ) -> Result<(Self, usize), ParseError> {
        let stat = read_u16(bytes, offset)?;
        offset += 2;

        let float_phasors = cfg.phasor_size() == 8;
        let mut phasors = Vec::with_capacity(cfg.phnmr as usize);
        for i in 0..cfg.phnmr as usize {
            let unit = cfg.phunit.get(i).ok_or_else(|| ParseError::InvalidFormat {
                message: format!(
                    "PMU {}: PHNMR is {} but only {} PHUNIT entries",
                    cfg.idcode,
                    cfg.phnmr,
                    cfg.phunit.len()
                ),
            })?;
            let phasor = if float_phasors {
                let a = read_f32(bytes, offset)?;
                let b = read_f32(bytes, offset + 4)?;
                if cfg.is_phasor_polar() {
                    PhasorValue {
                        magnitude: a,
                        angle: b,
                    }
                } else {
                    PhasorValue::from_rect(a, b)
                }
            } else {
                let scale = unit.units_per_bit() as f32;
                if cfg.is_phasor_polar() {
                    // Magnitude is unsigned, angle is in 10^-4 radians.
                    PhasorValue {
                        magnitude: read_u16(bytes, offset)? as f32 * scale,
                        angle: read_i16(bytes, offset + 2)? as f32 * 1e-4,
                    }
                } else {
                    PhasorValue::from_rect(
                        read_i16(bytes, offset)? as f32 * scale,
                        read_i16(bytes, offset + 2)? as f32 * scale,
                    )
                }
            };
            phasors.push(phasor);
            offset += cfg.phasor_size();
        }

        let (freq, dfreq) = if cfg.freq_dfreq_size() == 4 {
            (read_f32(bytes, offset)?, read_f32(bytes, offset + 4)?)
        } else {
            // Fixed point: FREQ is mHz deviation from nominal, DFREQ is ROCOF x 100.
            let fnom = cfg.fnom.hz() as f32;
            (
                fnom + read_i16(bytes, offset)? as f32 / 1000.0,
                read_i16(bytes, offset + 2)? as f32 / 100.0,
            )
        };
        offset += 2 * cfg.freq_dfreq_size();

        let mut analog = Vec::with_capacity(cfg.annmr as usize);
        for i in 0..cfg.annmr as usize {
            let value = if cfg.analog_size() == 4 {
                read_f32(bytes, offset)?
            } else {
                let raw = read_i16(bytes, offset)? as f32;
                match cfg.anunit.get(i) {
                    Some(unit) if unit.scale != 0 => raw * unit.scale as f32,
                    _ => raw,
                }
            };
            analog.push(value);
            offset += cfg.analog_size();
        }

        let mut digital = Vec::with_capacity(cfg.dgnmr as usize);
        for _ in 0..cfg.dgnmr {
            digital.push(read_u16(bytes, offset)?);
            offset += 2;
        }

        Ok((
            PMUData {
                stat,
                phasors,
                freq,
                dfreq,
                analog,
                digital,
            },
            offset,
        ))
    }

    /// Float polar encoding, matching `PMUConfigurationFrame::float_polar`.
    fn to_hex(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stat.to_be_bytes());
        for phasor in &self.phasors {
            out.extend_from_slice(&phasor.magnitude.to_be_bytes());
            out.extend_from_slice(&phasor.angle.to_be_bytes());
        }
        out.extend_from_slice(&self.freq.to_be_bytes());
        out.extend_from_slice(&self.dfreq.to_be_bytes());
        for value in &self.analog {
            out.extend_from_slice(&value.to_be_bytes());
        }
        for word in &self.digital {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }
}

impl DataFrame {
    /// Creates a 2011 data frame stamped with the given SOC/FRACSEC buffer.
    pub fn new(idcode: u16, time: [u8; 8], pmu_data: Vec<PMUData>) -> Self {
        let mut prefix = PrefixFrame::new(FrameType::Data, idcode, Version::V2011);
        prefix.set_time(time);
        DataFrame { prefix, pmu_data }
    }

    /// Parses a data frame using the configuration that describes it.
    ///
    /// # Returns
    ///
    /// * `Ok(DataFrame)`: The parsed data frame.
    /// * `Err(ParseError)`: If the frame is not a data frame, its checksum is wrong,
    ///   or its length disagrees with FRAMESIZE or the configuration.
    pub fn from_hex(bytes: &[u8], config: &ConfigurationFrame) -> Result<Self, ParseError> {
        if bytes.len() < PrefixFrame::LEN + 2 {
            return Err(ParseError::InvalidLength {
                message: format!("DataFrame: expected at least 16 bytes, got {}", bytes.len()),
            });
        }
        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Data {
            return Err(ParseError::InvalidFrameType {
                message: format!("DataFrame: got {}", prefix.frame_type()?),
            });
        }
        if prefix.framesize as usize != bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "DataFrame: expected framesize of {} bytes, got {}",
                    prefix.framesize,
                    bytes.len()
                ),
            });
        }
        let expected = config.calc_data_frame_size();
        if expected != bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "DataFrame: configuration describes {} bytes, frame has {}",
                    expected,
                    bytes.len()
                ),
            });
        }
        validate_checksum(bytes)?;

        let body = &bytes[..bytes.len() - 2];
        let mut offset = PrefixFrame::LEN;
        let mut pmu_data = Vec::with_capacity(config.pmu_configs.len());
        for pmu_config in &config.pmu_configs {
            let (data, next) = PMUData::from_hex(body, offset, pmu_config)?;
            pmu_data.push(data);
            offset = next;
        }

        Ok(DataFrame { prefix, pmu_data })
    }

    /// Serializes the frame in float polar layout, fixing FRAMESIZE and appending the
    /// checksum.
    pub fn to_hex(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for pmu in &self.pmu_data {
            pmu.to_hex(&mut body);
        }
        let mut prefix = self.prefix.clone();
        prefix.framesize = (PrefixFrame::LEN + body.len() + 2) as u16;

        let mut result = Vec::with_capacity(prefix.framesize as usize);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(&body);
        append_crc(&mut result);
        result
    }

    /// Seconds since the Unix epoch, resolved with the configuration's time base.
    pub fn timestamp(&self, config: &ConfigurationFrame) -> f64 {
        super::utils::timestamp_secs(self.prefix.soc, self.prefix.fracsec, config.time_base)
    }
}
