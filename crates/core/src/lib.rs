//! Filtergraph Core - media filter graph engine
//!
//! This crate moves media packets through a graph of filters connected by PIDs (typed
//! packet streams). Filters declare capabilities; the session links every new output PID to
//! the filters that accept it, inserting adapter chains where formats differ, and runs all
//! filters on a cooperative scheduler.
//!
//! # Architecture
//!
//! - [`packet`]: reference-counted payloads with timing and framing metadata
//! - [`pid`]: output and input sides of a stream, with buffering and back-pressure
//! - [`props`]: typed property maps carried by PIDs and packets
//! - [`caps`]: capability bundles and the link resolver
//! - [`filter`]: the filter trait, descriptors, arguments and host callback filters
//! - [`session`]: graph ownership, linking, event routing and the scheduler
//! - [`io`]: virtual I/O backends used by sources and sinks
//! - [`abr`] and [`http`]: adaptive rate and HTTP serving hooks
//!
//! # Example
//!
//! ```ignore
//! use filtergraph_core::{Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig::default());
//! session.load_filter("testsrc:dur=1")?;
//! session.load_filter("inspect")?;
//! session.run()?;
//! ```

#![warn(clippy::all)]

pub mod abr;
pub mod caps;
pub mod config;
pub mod event;
pub mod filter;
pub mod filters;
pub mod http;
pub mod io;
pub mod manifest;
pub mod packet;
pub mod pid;
pub mod props;
pub mod session;

mod error;
pub use error::{Error, FilterError, Result};

pub use config::SessionConfig;
pub use event::{EventDirection, EventKind, FilterEvent};
pub use filter::{
    AbortMode, CustomFilter, Filter, FilterArgs, FilterContext, FilterDescriptor, FilterId,
    FilterRegistry, ProcessStatus,
};
pub use manifest::GraphManifest;
pub use packet::{Packet, SapType};
pub use pid::{InputPid, OutputPid, PidId};
pub use props::{PropertyId, PropertyKey, PropertyMap, PropertyValue};
pub use session::{FilterNotification, RunOutcome, Session, SessionState, TaskNext};

/// Initialize logging
///
/// Reads the filter from `RUST_LOG`, defaulting to `info`. Fails if a global subscriber is
/// already installed.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!("Filtergraph core initialized");
    Ok(())
}

/// Logging for tests; repeated calls are no-ops
#[doc(hidden)]
pub fn test_init() {
    init().ok();
}
