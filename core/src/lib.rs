//! # Synchrophasor Synchronization and Islanding Detection
//!
//! This crate links emulated grid nodes to a running power-system simulation. Virtual
//! PMUs pick their buses' voltage and frequency out of the simulation's shared
//! variable bus and stream them as IEEE C37.118.2-2011 frames; a PDC aggregator
//! collects those streams, watches the frequency spread between regions and, when
//! it stays beyond a threshold for long enough, tells the simulator to open the
//! tie lines (system islanding).
//!
//! ## Submodules
//!
//! - `bus`: Client side of the DiME-like shared variable bus.
//!   - `memory`: In-process hub for wiring components together in one process.
//!   - `tcp`: TCP client speaking the length-prefixed JSON protocol.
//!   - `wire`: Envelope types and framing shared with the bus server.
//! - `sync`: Reset/streaming protocol every bus participant follows.
//! - `ieee_c37_118`: The subset of IEEE C37.118.2 exchanged between PMU and PDC.
//!   - `commands`: Command frames (header, CFG-1/2, transmission on/off).
//!   - `common`: Shared types (e.g., `ParseError`, `PrefixFrame`).
//!   - `config`: CFG-1/CFG-2 configuration frames.
//!   - `data_frame`: Data frames, integer or float, polar or rectangular.
//!   - `header`: Header frames.
//!   - `units`: Phasor, analog and nominal frequency units.
//!   - `utils`: CRC, timestamps and frame extraction from a byte stream.
//! - `frame`: Typed frames and the `FrameSource`/`FrameSink` traits.
//! - `pdc_client`, `pmu_server`: TCP implementations of those traits.
//! - `sample_store`: Fixed-capacity live and record ring buffers.
//! - `index_map`: Monitored bus indices to offsets in the variable vector.
//! - `pmu`: The virtual PMU with record/replay.
//! - `islanding`: Frequency cache, divergence and the latching trip machine.
//! - `aggregator`: The PDC aggregator running the islanding decision.
//! - `config`, `error`, `utils`: Settings, error types and numeric helpers.
//!
//! ## Usage
//!
//! The `ltbnet` binary in the `cli` crate builds a `PmuConfig` or
//! `AggregatorConfig`, connects to the bus and calls `VirtualPmu::run` or
//! `PdcAggregator::run`. Tests wire the same pieces together over `MemoryHub`.

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod error;
pub mod frame;
pub mod ieee_c37_118;
pub mod index_map;
pub mod islanding;
pub mod pdc_client;
pub mod pmu;
pub mod pmu_server;
pub mod sample_store;
pub mod sync;
pub mod utils;

pub use aggregator::PdcAggregator;
pub use config::{AggregatorConfig, PmuConfig, SourceAddr};
pub use error::{Error, Result};
pub use pmu::VirtualPmu;
