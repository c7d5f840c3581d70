//! Log ingestion and normalization daemon.
//!
//! logdevourer sits between line-oriented log producers (growing files,
//! syslog-style datagram sockets, standard input) and consumers that expect
//! structured, line-delimited records. Raw lines go through a rule-based
//! [`Normalizer`]; whatever it recognizes is serialized to one line of JSON
//! and fanned out to every configured [`Destination`] in order.
//!
//! The crate's core is the single-threaded multiplexing [`Engine`] and the
//! crash-safe file tailing underneath it: non-blocking reads with
//! partial-line reassembly, rotation and truncation detection, and
//! persistent read positions that survive restarts without duplicating or
//! dropping lines. The `logdevd` binary wraps it all in a small CLI with
//! foreground, daemonized, reload and stop modes.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::destination::{
    Destination, StdoutDestination, TcpDestination, UdpDestination, UnixDestination,
};
pub use crate::engine::{DEFAULT_TICK, Engine, RunOutcome};
pub use crate::normalize::{Normalizer, Passthrough, Record, serialize};
pub use crate::poll::Poller;
pub use crate::position::{PositionFile, PositionRecord, position_path};
pub use crate::signals::ShutdownHandle;
pub use crate::source::{FileSource, HandleSource, Line, Source, UdpSource, UnixSource};

pub mod config;
pub mod daemon;
mod destination;
mod engine;
pub mod logging;
mod normalize;
mod poll;
mod position;
pub mod signals;
mod source;
