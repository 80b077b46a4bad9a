//! # IEEE C37.118 Configuration Frames
//!
//! Parsing and construction of CFG-1 and CFG-2 frames, which tell a PDC how to read
//! the data frames a PMU sends: station names, channel counts, data formats and
//! conversion factors.
//!
//! ## Key Components
//!
//! - `PMUConfigurationFrame`: A single PMU block (station, IDCODE, FORMAT, channels).
//! - `ConfigurationFrame`: A complete configuration frame with time base and data rate.
//!
//! CFG-3 frames are recognized from their SYNC word but rejected with
//! `ParseError::VersionNotSupported`.

use super::common::{read_u16, read_u32, FrameType, ParseError, PrefixFrame, Version};
use super::units::{AnalogUnits, NominalFrequency, PhasorUnits};
use super::utils::{append_crc, validate_checksum};
use serde::{Deserialize, Serialize};

/// FORMAT bit: phasors in polar (magnitude, angle) form.
pub const FORMAT_PHASOR_POLAR: u16 = 0x0001;
/// FORMAT bit: phasors as 32-bit floats.
pub const FORMAT_PHASOR_FLOAT: u16 = 0x0002;
/// FORMAT bit: analogs as 32-bit floats.
pub const FORMAT_ANALOG_FLOAT: u16 = 0x0004;
/// FORMAT bit: FREQ/DFREQ as 32-bit floats.
pub const FORMAT_FREQ_FLOAT: u16 = 0x0008;

const NAME_LEN: usize = 16;

fn pad_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [b' '; NAME_LEN];
    for (dst, src) in out.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    out
}

fn unpad_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// Represents a single PMU's block inside a configuration frame.
///
/// # Fields
///
/// * `stn`: 16-byte station name.
/// * `idcode`: PMU identification code.
/// * `format`: Data format flags (see the `FORMAT_*` constants).
/// * `phnmr`, `annmr`, `dgnmr`: Phasor, analog and digital word counts.
/// * `chnam`: Channel names, 16 bytes each; 16 names per digital word.
/// * `phunit`, `anunit`, `digunit`: Conversion factors and digital masks.
/// * `fnom`: Nominal frequency.
/// * `cfgcnt`: Configuration change count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PMUConfigurationFrame {
    pub stn: [u8; 16],
    pub idcode: u16,
    pub format: u16,
    pub phnmr: u16,
    pub annmr: u16,
    pub dgnmr: u16,
    pub chnam: Vec<u8>,
    pub phunit: Vec<PhasorUnits>,
    pub anunit: Vec<AnalogUnits>,
    pub digunit: Vec<u32>,
    pub fnom: NominalFrequency,
    pub cfgcnt: u16,
}

impl PMUConfigurationFrame {
    /// Builds a PMU block streaming float polar phasors, float analogs and float
    /// frequency, which is what the virtual PMU emits.
    ///
    /// `digital_names` must hold 16 names per digital word; missing names are
    /// left blank.
    pub fn float_polar(
        station: &str,
        idcode: u16,
        fnom: NominalFrequency,
        phasor_names: &[&str],
        analog_names: &[&str],
        digital_words: u16,
        digital_names: &[&str],
        cfgcnt: u16,
    ) -> Self {
        let mut chnam = Vec::new();
        for name in phasor_names.iter().chain(analog_names) {
            chnam.extend_from_slice(&pad_name(name));
        }
        for i in 0..(16 * digital_words as usize) {
            chnam.extend_from_slice(&pad_name(digital_names.get(i).copied().unwrap_or("")));
        }

        PMUConfigurationFrame {
            stn: pad_name(station),
            idcode,
            format: FORMAT_PHASOR_POLAR
                | FORMAT_PHASOR_FLOAT
                | FORMAT_ANALOG_FLOAT
                | FORMAT_FREQ_FLOAT,
            phnmr: phasor_names.len() as u16,
            annmr: analog_names.len() as u16,
            dgnmr: digital_words,
            chnam,
            phunit: vec![PhasorUnits::voltage(0); phasor_names.len()],
            anunit: vec![
                AnalogUnits {
                    measurement_type: 0,
                    scale: 1,
                };
                analog_names.len()
            ],
            digunit: vec![0x0000_FFFF; digital_words as usize],
            fnom,
            cfgcnt,
        }
    }

    /// Byte length of this block inside a configuration frame.
    fn encoded_len(phnmr: u16, annmr: u16, dgnmr: u16) -> usize {
        let chnam_len = NAME_LEN * (phnmr as usize + annmr as usize + 16 * dgnmr as usize);
        let unit_len = 4 * (phnmr as usize + annmr as usize + dgnmr as usize);
        26 + chnam_len + unit_len + 4
    }

    /// Parses a PMU block starting at `bytes[0]`.
    ///
    /// # Returns
    ///
    /// * `Ok((PMUConfigurationFrame, usize))`: The block and the bytes it consumed.
    /// * `Err(ParseError::InvalidLength)`: If the slice ends inside the block.
    pub fn from_hex(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        if bytes.len() < 26 {
            return Err(ParseError::InvalidLength {
                message: format!("PMU configuration: expected at least 26 bytes, got {}", bytes.len()),
            });
        }
        let mut stn = [0u8; 16];
        stn.copy_from_slice(&bytes[0..16]);
        let idcode = read_u16(bytes, 16)?;
        let format = read_u16(bytes, 18)?;
        let phnmr = read_u16(bytes, 20)?;
        let annmr = read_u16(bytes, 22)?;
        let dgnmr = read_u16(bytes, 24)?;

        let size = Self::encoded_len(phnmr, annmr, dgnmr);
        if bytes.len() < size {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "PMU configuration for IDCODE {}: expected {} bytes, got {}",
                    idcode,
                    size,
                    bytes.len()
                ),
            });
        }

        let mut offset = 26;
        let chnam_len = NAME_LEN * (phnmr as usize + annmr as usize + 16 * dgnmr as usize);
        let chnam = bytes[offset..offset + chnam_len].to_vec();
        offset += chnam_len;

        let mut phunit = Vec::with_capacity(phnmr as usize);
        for _ in 0..phnmr {
            phunit.push(PhasorUnits::from_hex(&bytes[offset..offset + 4])?);
            offset += 4;
        }
        let mut anunit = Vec::with_capacity(annmr as usize);
        for _ in 0..annmr {
            anunit.push(AnalogUnits::from_hex(&bytes[offset..offset + 4])?);
            offset += 4;
        }
        let mut digunit = Vec::with_capacity(dgnmr as usize);
        for _ in 0..dgnmr {
            digunit.push(read_u32(bytes, offset)?);
            offset += 4;
        }
        let fnom = NominalFrequency::from_hex(&bytes[offset..offset + 2])?;
        offset += 2;
        let cfgcnt = read_u16(bytes, offset)?;
        offset += 2;

        Ok((
            PMUConfigurationFrame {
                stn,
                idcode,
                format,
                phnmr,
                annmr,
                dgnmr,
                chnam,
                phunit,
                anunit,
                digunit,
                fnom,
                cfgcnt,
            },
            offset,
        ))
    }

    pub fn to_hex(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(Self::encoded_len(self.phnmr, self.annmr, self.dgnmr));
        result.extend_from_slice(&self.stn);
        result.extend_from_slice(&self.idcode.to_be_bytes());
        result.extend_from_slice(&self.format.to_be_bytes());
        result.extend_from_slice(&self.phnmr.to_be_bytes());
        result.extend_from_slice(&self.annmr.to_be_bytes());
        result.extend_from_slice(&self.dgnmr.to_be_bytes());
        result.extend_from_slice(&self.chnam);
        for ph in &self.phunit {
            result.extend_from_slice(&ph.to_hex());
        }
        for an in &self.anunit {
            result.extend_from_slice(&an.to_hex());
        }
        for dg in &self.digunit {
            result.extend_from_slice(&dg.to_be_bytes());
        }
        result.extend_from_slice(&self.fnom.to_hex());
        result.extend_from_slice(&self.cfgcnt.to_be_bytes());
        result
    }

    /// 4 if FREQ/DFREQ are floats, 2 if fixed-point.
    pub fn freq_dfreq_size(&self) -> usize {
        if self.format & FORMAT_FREQ_FLOAT != 0 {
            4
        } else {
            2
        }
    }

    /// 4 if analogs are floats, 2 if fixed-point.
    pub fn analog_size(&self) -> usize {
        if self.format & FORMAT_ANALOG_FLOAT != 0 {
            4
        } else {
            2
        }
    }

    /// 8 if phasors are floats, 4 if integers.
    pub fn phasor_size(&self) -> usize {
        if self.format & FORMAT_PHASOR_FLOAT != 0 {
            8
        } else {
            4
        }
    }

    pub fn is_phasor_polar(&self) -> bool {
        self.format & FORMAT_PHASOR_POLAR != 0
    }

    /// Size of this PMU's section in a data frame, STAT included.
    pub fn data_section_size(&self) -> usize {
        2 + self.phasor_size() * self.phnmr as usize
            + 2 * self.freq_dfreq_size()
            + self.analog_size() * self.annmr as usize
            + 2 * self.dgnmr as usize
    }

    pub fn station_name(&self) -> String {
        unpad_name(&self.stn)
    }

    /// Channel names in frame order (phasors, analogs, then 16 per digital word).
    pub fn channel_names(&self) -> Vec<String> {
        self.chnam.chunks(NAME_LEN).map(unpad_name).collect()
    }
}

/// Represents a CFG-1 or CFG-2 configuration frame.
///
/// # Fields
///
/// * `prefix`: Common frame prefix.
/// * `time_base`: FRACSEC resolution (counts per second).
/// * `num_pmu`: Number of PMU blocks.
/// * `pmu_configs`: The PMU blocks.
/// * `data_rate`: Frames per second (negative values mean seconds per frame).
/// * `cfg_type`: 1 or 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationFrame {
    pub prefix: PrefixFrame,
    pub time_base: u32,
    pub num_pmu: u16,
    pub pmu_configs: Vec<PMUConfigurationFrame>,
    pub data_rate: i16,
    pub cfg_type: u8,
}

impl ConfigurationFrame {
    /// Builds a configuration frame of the given type (1 or 2) for a data stream.
    pub fn new(
        cfg_type: u8,
        idcode: u16,
        time_base: u32,
        pmu_configs: Vec<PMUConfigurationFrame>,
        data_rate: i16,
    ) -> Self {
        let frame_type = if cfg_type == 1 {
            FrameType::Config1
        } else {
            FrameType::Config2
        };
        ConfigurationFrame {
            prefix: PrefixFrame::new(frame_type, idcode, Version::V2011),
            time_base,
            num_pmu: pmu_configs.len() as u16,
            pmu_configs,
            data_rate,
            cfg_type: if cfg_type == 1 { 1 } else { 2 },
        }
    }

    /// Returns a copy of this frame re-labelled as another configuration type.
    pub fn as_cfg_type(&self, cfg_type: u8) -> Self {
        let mut frame = ConfigurationFrame::new(
            cfg_type,
            self.prefix.idcode,
            self.time_base,
            self.pmu_configs.clone(),
            self.data_rate,
        );
        frame.prefix.soc = self.prefix.soc;
        frame.prefix.fracsec = self.prefix.fracsec;
        frame
    }

    /// Parses a configuration frame.
    ///
    /// # Returns
    ///
    /// * `Ok(ConfigurationFrame)`: The parsed CFG-1 or CFG-2 frame.
    /// * `Err(ParseError::VersionNotSupported)`: For CFG-3 frames.
    /// * `Err(ParseError)`: If the frame is malformed or its checksum is wrong.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        let prefix = PrefixFrame::from_hex(bytes)?;
        let cfg_type = match prefix.frame_type()? {
            FrameType::Config1 => 1,
            FrameType::Config2 => 2,
            FrameType::Config3 => {
                return Err(ParseError::VersionNotSupported {
                    message: "CFG-3 frames are not decoded".to_string(),
                })
            }
            other => {
                return Err(ParseError::InvalidFrameType {
                    message: format!("ConfigurationFrame: Expected a configuration frame, got {}", other),
                })
            }
        };
        if prefix.framesize as usize != bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "ConfigurationFrame: FRAMESIZE is {}, buffer holds {}",
                    prefix.framesize,
                    bytes.len()
                ),
            });
        }
        validate_checksum(bytes)?;

        let body = &bytes[..bytes.len() - 2];
        let time_base = read_u32(body, 14)? & 0x00FF_FFFF;
        let num_pmu = read_u16(body, 18)?;

        let mut offset = 20;
        let mut pmu_configs = Vec::with_capacity(num_pmu as usize);
        for _ in 0..num_pmu {
            let (pmu, consumed) = PMUConfigurationFrame::from_hex(&body[offset.min(body.len())..])?;
            pmu_configs.push(pmu);
            offset += consumed;
        }

        let data_rate = read_u16(body, offset)? as i16;
        if offset + 2 != body.len() {
            return Err(ParseError::InvalidFormat {
                message: format!(
                    "ConfigurationFrame: {} trailing bytes after DATA_RATE",
                    body.len() - offset - 2
                ),
            });
        }

        Ok(ConfigurationFrame {
            prefix,
            time_base,
            num_pmu,
            pmu_configs,
            data_rate,
            cfg_type,
        })
    }

    /// Serializes the frame, fixing FRAMESIZE and NUM_PMU and appending the checksum.
    pub fn to_hex(&self) -> Vec<u8> {
        let blocks: Vec<Vec<u8>> = self.pmu_configs.iter().map(|p| p.to_hex()).collect();
        let frame_size = PrefixFrame::LEN + 4 + 2 + blocks.iter().map(Vec::len).sum::<usize>() + 2 + 2;

        let mut prefix = self.prefix.clone();
        prefix.framesize = frame_size as u16;

        let mut result = Vec::with_capacity(frame_size);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(&self.time_base.to_be_bytes());
        result.extend_from_slice(&(self.pmu_configs.len() as u16).to_be_bytes());
        for block in &blocks {
            result.extend_from_slice(block);
        }
        result.extend_from_slice(&self.data_rate.to_be_bytes());
        append_crc(&mut result);
        result
    }

    /// Calculates the expected size of a data frame described by this configuration.
    pub fn calc_data_frame_size(&self) -> usize {
        PrefixFrame::LEN
            + self
                .pmu_configs
                .iter()
                .map(PMUConfigurationFrame::data_section_size)
                .sum::<usize>()
            + 2
    }

    /// Data rate in frames per second.
    pub fn frames_per_second(&self) -> f64 {
        if self.data_rate >= 0 {
            self.data_rate as f64
        } else {
            1.0 / (-(self.data_rate as f64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ConfigurationFrame {
        let pmus = vec![
            PMUConfigurationFrame::float_polar(
                "Bus_4",
                4,
                NominalFrequency::Hz60,
                &["VA"],
                &["SIMTIME"],
                1,
                &["BREAKER 1 STATUS"],
                1,
            ),
            PMUConfigurationFrame::float_polar(
                "Bus_5",
                5,
                NominalFrequency::Hz60,
                &["VA"],
                &["SIMTIME"],
                1,
                &[],
                1,
            ),
        ];
        ConfigurationFrame::new(2, 4, 1_000_000, pmus, 30)
    }

    #[test]
    fn test_config_round_trip() {
        let config = sample_config();
        let bytes = config.to_hex();
        assert_eq!(&bytes[0..2], &[0xAA, 0x32]);

        let parsed = ConfigurationFrame::from_hex(&bytes).unwrap();
        assert_eq!(parsed.cfg_type, 2);
        assert_eq!(parsed.num_pmu, 2);
        assert_eq!(parsed.time_base, 1_000_000);
        assert_eq!(parsed.data_rate, 30);
        assert_eq!(parsed.pmu_configs, config.pmu_configs);
        assert_eq!(parsed.pmu_configs[0].station_name(), "Bus_4");
        assert_eq!(parsed.pmu_configs[0].channel_names()[0], "VA");
        assert_eq!(parsed.pmu_configs[0].channel_names()[2], "BREAKER 1 STATUS");
    }

    #[test]
    fn test_data_frame_size() {
        let config = sample_config();
        // Per PMU: STAT 2 + phasor 8 + FREQ/DFREQ 8 + analog 4 + digital 2 = 24.
        assert_eq!(config.calc_data_frame_size(), 14 + 2 * 24 + 2);
        assert!(config.pmu_configs[0].is_phasor_polar());
    }

    #[test]
    fn test_cfg1_relabel() {
        let cfg1 = sample_config().as_cfg_type(1);
        let parsed = ConfigurationFrame::from_hex(&cfg1.to_hex()).unwrap();
        assert_eq!(parsed.cfg_type, 1);
    }

    #[test]
    fn test_config_rejects_truncation() {
        let bytes = sample_config().to_hex();
        assert!(ConfigurationFrame::from_hex(&bytes[..bytes.len() - 5]).is_err());
    }

    #[test]
    fn test_cfg3_not_supported() {
        let mut bytes = sample_config().to_hex();
        bytes[1] = 0x52;
        assert!(matches!(
            ConfigurationFrame::from_hex(&bytes),
            Err(ParseError::VersionNotSupported { .. })
        ));
    }
}
