//! # IEEE C37.118 Synchrophasor Frames
//!
//! A compact IEEE C37.118.2-2011 codec covering the frames exchanged between the
//! virtual PMU server and the PDC client: command, header, CFG-1/CFG-2 and data
//! frames.
//!
//! ## Submodules
//!
//! - `commands`: Command frames (send header, send configuration, start/stop data).
//! - `common`: Shared types (`ParseError`, `PrefixFrame`, `Version`, `FrameType`).
//! - `config`: Configuration frames describing PMU channels and formats.
//! - `data_frame`: Data frames carrying real-time measurements.
//! - `header`: Header frames with free-form source descriptions.
//! - `units`: Conversion factors and nominal frequency.
//! - `utils`: CRC checksums and SOC/FRACSEC helpers.
//!
//! Data frames are decoded from integer or float, polar or rectangular layouts and
//! always encoded as float polar. CFG-3 frames are recognized but not decoded.

pub mod commands;
pub mod common;
pub mod config;
pub mod data_frame;
pub mod header;
pub mod units;
pub mod utils;
