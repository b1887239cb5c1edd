//! Filter callback context

use std::sync::Arc;
use std::time::Duration;

use super::{FilterArgs, FilterId};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::event::{EventDirection, EventTarget, FilterEvent};
use crate::io::IoRegistry;
use crate::pid::{InputPid, OutputPid, PidInstance, PidLimits, PidShared};
use crate::props::PropertyMap;
use crate::session::events;
use crate::session::node::FilterNode;
use crate::session::SessionShared;

/// How a session abort treats data in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortMode {
    /// Drop queued packets and stop at the next scheduling point
    Immediate,
    /// Stop sources and let accepted packets drain
    Flush,
}

/// Graph changes requested during a callback, applied once the filter yields
#[derive(Default)]
pub(crate) struct Effects {
    pub new_pids: Vec<Arc<PidShared>>,
    pub reschedule: Option<Duration>,
    pub abort: Option<AbortMode>,
    pub failed_connects: Vec<(Arc<PidInstance>, Error)>,
    pub adapters: Vec<(Arc<PidShared>, Arc<PidInstance>, PropertyMap)>,
}

/// Access to the engine from inside a filter callback
pub struct FilterContext<'a> {
    node: &'a Arc<FilterNode>,
    session: &'a SessionShared,
    effects: &'a mut Effects,
}

impl<'a> FilterContext<'a> {
    pub(crate) fn new(
        node: &'a Arc<FilterNode>,
        session: &'a SessionShared,
        effects: &'a mut Effects,
    ) -> Self {
        Self {
            node,
            session,
            effects,
        }
    }

    pub fn filter_id(&self) -> FilterId {
        self.node.id
    }

    pub fn filter_name(&self) -> &str {
        &self.node.name
    }

    /// Current argument values, including host updates the filter accepted
    pub fn args(&self) -> FilterArgs {
        self.node.args.read().clone()
    }

    /// Publishes a status line shown in the session statistics
    ///
    /// `percent` is clamped to 0..=100; `None` means the progress is unknown.
    pub fn set_status(&self, text: impl Into<String>, percent: Option<f32>) {
        let mut status = self.node.status.lock();
        status.text = Some(text.into());
        status.percent = percent.map(|p| p.clamp(0.0, 100.0));
    }

    pub fn clear_status(&self) {
        *self.node.status.lock() = Default::default();
    }

    /// Capability values the filter must produce, set when the engine inserted it to
    /// satisfy a negotiation
    pub fn forced_caps(&self) -> &PropertyMap {
        &self.node.forced_caps
    }

    /// Configured input PIDs, in connection order
    pub fn inputs(&self) -> Vec<InputPid> {
        self.node
            .input_instances()
            .into_iter()
            .map(InputPid::new)
            .collect()
    }

    pub fn input(&self, index: usize) -> Option<InputPid> {
        self.node.input_instances().into_iter().nth(index).map(InputPid::new)
    }

    pub fn input_count(&self) -> usize {
        self.node.links.read().inputs.len()
    }

    pub fn outputs(&self) -> Vec<OutputPid> {
        self.node
            .output_pids()
            .into_iter()
            .map(|shared| OutputPid { shared })
            .collect()
    }

    pub fn output(&self, index: usize) -> Option<OutputPid> {
        self.node
            .output_pids()
            .into_iter()
            .nth(index)
            .map(|shared| OutputPid { shared })
    }

    /// Creates an output PID; it is linked once the current callback returns
    pub fn new_output_pid(&mut self) -> OutputPid {
        let config = &self.session.config;
        let limits = PidLimits {
            max_units: config.pid_buffer_units,
            max_us: config.pid_buffer_us,
            blocking_disabled: config.disable_blocking,
        };
        let index = self.node.links.read().outputs.len();
        let shared = PidShared::new(self.node, format!("{}#{}", self.node.name, index + 1), limits);
        self.node.links.write().outputs.push(shared.clone());
        self.effects.new_pids.push(shared.clone());
        tracing::debug!(filter = %self.node.name, pid = %shared.id, "output PID created");
        OutputPid { shared }
    }

    /// Removes an output PID of this filter
    pub fn remove_output(&mut self, pid: &OutputPid) {
        self.node
            .links
            .write()
            .outputs
            .retain(|p| !Arc::ptr_eq(p, pid.shared()));
        pid.remove();
    }

    /// Sends an event from this filter
    ///
    /// An event targeting a PID goes out on that PID only: upstream when it is one of the
    /// filter's inputs, downstream when it is one of its outputs. Session-wide upstream events
    /// go out on every input PID, downstream ones on every output PID.
    pub fn send_event(&self, event: FilterEvent) {
        let direction = match event.target {
            EventTarget::Session(direction) => direction,
            EventTarget::Pid(id) => {
                let input = self.node.input_instances().into_iter().find(|i| i.pid.id == id);
                let output = self.node.output_pids().into_iter().find(|p| p.id == id);
                match (input, output) {
                    (Some(inst), _) => events::send_upstream(&inst, event),
                    (None, Some(pid)) => events::send_downstream(&pid, event),
                    (None, None) => tracing::warn!(
                        filter = %self.node.name,
                        pid = %id,
                        event = event.name(),
                        "event for a PID the filter does not own dropped"
                    ),
                }
                return;
            }
        };
        match direction {
            EventDirection::Upstream => {
                for inst in self.node.input_instances() {
                    events::send_upstream(&inst, event.clone());
                }
            }
            EventDirection::Downstream => {
                for pid in self.node.output_pids() {
                    events::send_downstream(&pid, event.clone());
                }
            }
        }
    }

    /// Runs the filter again after `delay`, even without new input
    pub fn reschedule_in(&mut self, delay: Duration) {
        self.effects.reschedule = Some(
            self.effects
                .reschedule
                .map_or(delay, |current| current.min(delay)),
        );
    }

    /// Requests a session-wide abort
    pub fn abort_session(&mut self, mode: AbortMode) {
        self.effects.abort = Some(mode);
    }

    /// Session flush in progress; sources should stop producing
    pub fn is_flushing(&self) -> bool {
        self.session.is_flushing()
    }

    pub fn io(&self) -> &IoRegistry {
        &self.session.io
    }

    pub fn config(&self) -> &SessionConfig {
        &self.session.config
    }

    pub(crate) fn effects(&mut self) -> &mut Effects {
        self.effects
    }
}
