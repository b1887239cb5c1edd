//! Filters
//!
//! A filter is a graph node wrapping either a native processing unit implementing [`Filter`]
//! or a [`CustomFilter`] driven by host callbacks. The engine calls the four callbacks from
//! the scheduler, never concurrently for the same filter:
//!
//! - `configure(pid, is_remove)` once per input PID connect, reconfiguration or removal
//! - `process()` when the filter is runnable
//! - `process_event(event)` before default event propagation
//! - `reconfigure_output(pid)` when a consumer negotiated a capability change
//! - `update_arg(name, value)` when the host changed an argument of the running filter

pub mod args;
pub mod context;
pub mod custom;
pub mod descriptor;
pub mod registry;

pub use args::{split_filter_spec, ArgDescriptor, FilterArgs};
pub use context::{AbortMode, FilterContext};
pub use custom::CustomFilter;
pub use descriptor::{FilterDescriptor, ProbeScore, ThreadAffinity};
pub use registry::FilterRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::event::FilterEvent;
use crate::pid::{InputPid, OutputPid};
use crate::props::PropertyValue;

/// Filter identifier, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(pub u32);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Result of one `process()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// More work may follow
    Continue,
    /// The filter produced everything it will produce
    EndOfStream,
}

/// Engine-managed lifecycle state of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterState {
    /// Created, capability negotiation pending
    Connecting,
    /// PIDs attached
    Configured,
    /// `process()` invoked at least once
    Running,
    /// All outputs at EOS and no pending work
    Done,
    /// Failed; terminal for the filter, not for the session
    Error,
    Removed,
}

impl FilterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterState::Connecting => "connecting",
            FilterState::Configured => "configured",
            FilterState::Running => "running",
            FilterState::Done => "done",
            FilterState::Error => "error",
            FilterState::Removed => "removed",
        }
    }

    /// Done, failed or removed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FilterState::Done | FilterState::Error | FilterState::Removed
        )
    }
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Native filter implementation
///
/// Every callback except `process` has a default: `initialize` and `configure` accept,
/// `process_event` lets the event propagate, `reconfigure_output` reports `NotSupported` so
/// the engine inserts an adapter chain instead, `update_arg` reports `NotSupported` so the
/// argument keeps its load-time value.
pub trait Filter: Send {
    /// Called once before any other callback; sources usually create their output PIDs here
    fn initialize(&mut self, _ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Input PID connected (or reconfigured) with `is_remove == false`, removed otherwise
    fn configure(
        &mut self,
        _ctx: &mut FilterContext<'_>,
        _pid: &InputPid,
        _is_remove: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// Does a bounded amount of work and returns control to the scheduler
    fn process(&mut self, ctx: &mut FilterContext<'_>) -> Result<ProcessStatus>;

    /// Returns true to stop default propagation of the event
    fn process_event(&mut self, _ctx: &mut FilterContext<'_>, _event: &FilterEvent) -> bool {
        false
    }

    /// Applies negotiated capability changes to `pid` in place
    fn reconfigure_output(&mut self, _ctx: &mut FilterContext<'_>, _pid: &OutputPid) -> Result<()> {
        Err(Error::NotSupported("output reconfiguration".into()))
    }

    /// Applies a new value of a declared argument; `value` was validated against the
    /// argument descriptor
    fn update_arg(
        &mut self,
        _ctx: &mut FilterContext<'_>,
        name: &str,
        _value: &PropertyValue,
    ) -> Result<()> {
        Err(Error::NotSupported(format!("runtime update of argument '{}'", name)))
    }

    /// Called once when the filter is destroyed
    fn finalize(&mut self, _ctx: &mut FilterContext<'_>) {}
}

/// Native or host-callback filter
pub enum FilterKind {
    Native(Box<dyn Filter>),
    Custom(CustomFilter),
}

impl FilterKind {
    pub fn native(filter: impl Filter + 'static) -> Self {
        FilterKind::Native(Box::new(filter))
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, FilterKind::Custom(_))
    }

    pub(crate) fn as_filter(&mut self) -> &mut dyn Filter {
        match self {
            FilterKind::Native(filter) => filter.as_mut(),
            FilterKind::Custom(custom) => custom,
        }
    }
}

impl fmt::Debug for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::Native(_) => f.write_str("FilterKind::Native"),
            FilterKind::Custom(c) => write!(f, "FilterKind::Custom({})", c.name()),
        }
    }
}
