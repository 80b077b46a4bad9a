//! Process-level pieces of the `ltbnet` binary: the TCP bus hub, logging setup and
//! Arrow dumps of the in-memory buffers.
pub mod bus_server;
pub mod dump;
pub mod logging;
