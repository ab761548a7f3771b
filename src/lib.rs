//! iottymux: interactive I/O multiplexer for pod-confined applications.
//!
//! The in-pod mux daemon owns the application-facing side of the I/O
//! endpoints (PTY master or named pipes) and exposes each of them as a
//! loopback TCP listener, advertised through a per-app endpoint registry.
//! The attach client crosses the pod's isolation boundary, reads the
//! registry, and bridges caller streams to the advertised listeners
//! according to a negotiated attach mode.

use anyhow::{Result, anyhow};
use tracing_subscriber::filter::LevelFilter;

pub use crate::mux::Mux;

pub mod attach;
pub mod config;
pub mod entry;
pub mod fanout;
pub mod front;
pub mod invoker;
pub mod iomux;
pub mod listener;
pub mod mode;
mod mux;
pub mod notify;
pub mod pod;
pub mod registry;
pub mod ttymux;

/// Initialize the tracing subscriber on stderr.
pub fn init_logging(debug: bool) -> Result<()> {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("init tracing subscriber: {e}"))
}
