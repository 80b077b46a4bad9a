//! Error types for the synchronization and islanding engine.
//!
//! Codec failures stay in `ieee_c37_118::common::ParseError`; everything above the
//! codec reports one of the enums below, and `Error` aggregates them for callers
//! that do not care which layer failed.

use std::io;

use thiserror::Error;

use crate::ieee_c37_118::common::ParseError;
use crate::pmu::RecordState;

/// Errors raised by a Frame Source or Frame Sink.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The TCP session could not be opened.
    #[error("Connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Socket error on an open session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be decoded.
    #[error("Frame decode error: {0}")]
    Parse(#[from] ParseError),

    /// The peer answered with something other than what was requested.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A data frame arrived before any configuration frame.
    #[error("No configuration received yet")]
    NotConfigured,

    /// The peer closed the connection.
    #[error("Connection closed")]
    Closed,
}

/// Errors raised by a Shared Variable Bus client.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be reached. Retried by `RetryPolicy`.
    #[error("Connection to bus at {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Socket error on an established bus session.
    #[error("Bus I/O error: {0}")]
    Io(#[from] io::Error),

    /// A workspace variable did not have its expected shape.
    #[error("Could not decode workspace variable {name}: {message}")]
    Decode { name: String, message: String },

    /// The bus sent an envelope this client does not understand.
    #[error("Bus protocol error: {0}")]
    Protocol(String),

    /// The address is not of the form `tcp://host:port` or `mem://name`.
    #[error("Invalid bus address: {0}")]
    InvalidAddress(String),

    /// The bus session has been closed.
    #[error("Bus session closed")]
    Closed,
}

impl BusError {
    pub fn decode(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Connection-level failures are worth reconnecting for; decode errors are not.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_) | Self::Closed)
    }
}

/// Errors raised while building an Index Mapping from `Idxvgs`.
#[derive(Debug, Error, PartialEq)]
pub enum IndexMapError {
    #[error("Monitored index list is empty")]
    EmptyIndices,

    #[error("No index mapping for the current run")]
    Unavailable,

    #[error("Idxvgs has no {field} entry for node {node} ({len} entries)")]
    MissingEntry {
        field: &'static str,
        node: u32,
        len: usize,
    },

    #[error("{field} entry for node {node} is not a 1-based index: {value}")]
    InvalidEntry {
        field: &'static str,
        node: u32,
        value: f64,
    },

    #[error("Offset {offset} appears twice in {field}")]
    DuplicateOffset { field: &'static str, offset: usize },

    #[error("Variable vector has {len} entries, offset {offset} is out of range")]
    VectorTooShort { offset: usize, len: usize },
}

/// Errors raised by a rejected `pmucmd`.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: i64 },

    #[error("Cannot {command} while {from}")]
    InvalidTransition {
        from: RecordState,
        command: &'static str,
    },
}

/// Fatal configuration errors, raised before any loop starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Monitored index list is empty")]
    EmptyIndexList,

    #[error("No PMU sources configured")]
    NoSources,

    #[error("Invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    IndexMap(#[from] IndexMapError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
