//! Graph nodes
//!
//! A [`FilterNode`] wraps one filter instance with everything the scheduler needs: its
//! run state, its links, the control requests waiting for it, its counters and the status
//! line it last published. The filter
//! implementation itself sits behind the `core` mutex, which is what guarantees a filter
//! never runs concurrently with itself.
//!
//! # Lock order
//!
//! `core -> session graph -> sched -> links -> pid state -> instance state`. The ready queue
//! is only locked after `sched` is released.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::stats::ProcessTimer;
use super::SessionShared;
use crate::event::{EventDirection, FilterEvent};
use crate::filter::{FilterArgs, FilterDescriptor, FilterId, FilterKind, FilterState, ThreadAffinity};
use crate::pid::{PidInstance, PidShared};
use crate::props::{PropertyMap, PropertyValue};

/// Why a filter is woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Packet or EOS arrived on an input
    Data,
    Event,
    Config,
    Timer,
    /// A consumer released packets of one of its outputs
    Unblock,
    Abort,
}

/// Structural request handled before the next `process()`
pub(crate) enum ConfigRequest {
    Connect(Arc<PidInstance>),
    Reconfigure(Arc<PidInstance>),
    Remove(Arc<PidInstance>),
    /// A consumer negotiated new capabilities on `pid`
    ReconfigureOutput {
        pid: Arc<PidShared>,
        requester: Arc<PidInstance>,
    },
}

pub(crate) struct PendingEvent {
    pub event: FilterEvent,
    pub direction: EventDirection,
}

/// Scheduler-side run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Idle,
    Queued,
    Running,
    /// An output PID would block
    Blocked,
}

pub(crate) struct SchedState {
    pub state: FilterState,
    pub run: RunState,
    /// Woken while running
    pub wake_pending: bool,
}

pub(crate) struct FilterCore {
    pub kind: FilterKind,
    pub initialized: bool,
    pub finalized: bool,
}

#[derive(Default)]
pub(crate) struct FilterLinks {
    /// Configured input instances
    pub inputs: Vec<Arc<PidInstance>>,
    /// Attached, waiting for `configure`
    pub pending_inputs: Vec<Arc<PidInstance>>,
    pub outputs: Vec<Arc<PidShared>>,
    /// Only these filters may feed this one (empty: any)
    pub sources: Vec<FilterId>,
    /// Source names not resolved yet
    pub source_names: Vec<String>,
    /// Chain member dedicated to this destination
    pub target: Option<FilterId>,
}

#[derive(Default)]
pub(crate) struct FilterCounters {
    pub process_calls: AtomicU64,
    pub packets_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// Status line published by the filter
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FilterStatus {
    pub text: Option<String>,
    /// 0 to 100
    pub percent: Option<f32>,
}

pub(crate) struct NodeInit {
    pub id: FilterId,
    pub name: String,
    pub descriptor: Arc<FilterDescriptor>,
    pub args: FilterArgs,
    pub kind: FilterKind,
    pub dynamic: bool,
    pub forced_caps: PropertyMap,
    pub target: Option<FilterId>,
}

pub(crate) struct FilterNode {
    pub(crate) id: FilterId,
    pub(crate) name: String,
    pub(crate) descriptor: Arc<FilterDescriptor>,
    pub(crate) args: RwLock<FilterArgs>,
    pub(crate) forced_caps: PropertyMap,
    /// Inserted by the linker
    pub(crate) dynamic: bool,
    session: Weak<SessionShared>,
    pub(crate) core: Mutex<FilterCore>,
    pub(crate) sched: Mutex<SchedState>,
    pub(crate) links: RwLock<FilterLinks>,
    events: Mutex<VecDeque<PendingEvent>>,
    configs: Mutex<VecDeque<ConfigRequest>>,
    /// Validated argument updates from the host
    arg_updates: Mutex<VecDeque<(String, PropertyValue)>>,
    /// Removed inputs waiting for their queue to drain
    deferred: Mutex<Vec<Arc<PidInstance>>>,
    progress: AtomicU64,
    pub(crate) counters: FilterCounters,
    pub(crate) timing: ProcessTimer,
    pub(crate) status: Mutex<FilterStatus>,
}

impl FilterNode {
    pub(crate) fn new(session: &Arc<SessionShared>, init: NodeInit) -> Arc<Self> {
        Arc::new(Self {
            id: init.id,
            name: init.name,
            descriptor: init.descriptor,
            args: RwLock::new(init.args),
            forced_caps: init.forced_caps,
            dynamic: init.dynamic,
            session: Arc::downgrade(session),
            core: Mutex::new(FilterCore {
                kind: init.kind,
                initialized: false,
                finalized: false,
            }),
            sched: Mutex::new(SchedState {
                state: FilterState::Connecting,
                run: RunState::Idle,
                wake_pending: false,
            }),
            links: RwLock::new(FilterLinks {
                target: init.target,
                ..Default::default()
            }),
            events: Mutex::new(VecDeque::new()),
            configs: Mutex::new(VecDeque::new()),
            arg_updates: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(Vec::new()),
            progress: AtomicU64::new(0),
            counters: FilterCounters::default(),
            timing: ProcessTimer::new(),
            status: Mutex::new(FilterStatus::default()),
        })
    }

    pub(crate) fn session(&self) -> Option<Arc<SessionShared>> {
        self.session.upgrade()
    }

    pub(crate) fn state(&self) -> FilterState {
        self.sched.lock().state
    }

    pub(crate) fn affinity(&self) -> ThreadAffinity {
        self.descriptor.affinity
    }

    /// Makes the filter runnable for `reason`
    pub(crate) fn wake(self: &Arc<Self>, reason: Wake) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        {
            let mut s = self.sched.lock();
            if s.state == FilterState::Removed {
                return;
            }
            if s.state.is_terminal() && !matches!(reason, Wake::Config | Wake::Event) {
                return;
            }
            let enqueue = match s.run {
                RunState::Running => {
                    s.wake_pending = true;
                    false
                }
                RunState::Queued => false,
                RunState::Blocked => match reason {
                    Wake::Unblock | Wake::Data | Wake::Timer => !self.any_output_blocks(),
                    Wake::Event | Wake::Config | Wake::Abort => true,
                },
                RunState::Idle => reason != Wake::Unblock,
            };
            if !enqueue {
                return;
            }
            s.run = RunState::Queued;
        }
        session.scheduler.push(self.clone());
    }

    pub(crate) fn mark_progress(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub(crate) fn push_config(self: &Arc<Self>, req: ConfigRequest) {
        self.configs.lock().push_back(req);
        self.wake(Wake::Config);
    }

    pub(crate) fn push_event(self: &Arc<Self>, event: PendingEvent) {
        self.events.lock().push_back(event);
        self.wake(Wake::Event);
    }

    pub(crate) fn push_arg_update(self: &Arc<Self>, name: String, value: PropertyValue) {
        self.arg_updates.lock().push_back((name, value));
        self.wake(Wake::Config);
    }

    pub(crate) fn take_arg_updates(&self) -> VecDeque<(String, PropertyValue)> {
        std::mem::take(&mut *self.arg_updates.lock())
    }

    pub(crate) fn take_configs(&self) -> VecDeque<ConfigRequest> {
        std::mem::take(&mut *self.configs.lock())
    }

    pub(crate) fn take_events(&self) -> VecDeque<PendingEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Configs, argument updates or events waiting
    pub(crate) fn has_pending_work(&self) -> bool {
        !self.configs.lock().is_empty()
            || !self.arg_updates.lock().is_empty()
            || !self.events.lock().is_empty()
    }

    pub(crate) fn defer_removal(&self, inst: Arc<PidInstance>) {
        self.deferred.lock().push(inst);
    }

    pub(crate) fn take_deferred(&self) -> Vec<Arc<PidInstance>> {
        std::mem::take(&mut *self.deferred.lock())
    }

    /// A deferred removal can complete now
    pub(crate) fn deferred_ready(&self) -> bool {
        self.deferred.lock().iter().any(|i| i.queue_len() == 0)
    }

    pub(crate) fn input_instances(&self) -> Vec<Arc<PidInstance>> {
        self.links.read().inputs.clone()
    }

    /// Configured and pending input instances
    pub(crate) fn all_input_instances(&self) -> Vec<Arc<PidInstance>> {
        let links = self.links.read();
        links
            .inputs
            .iter()
            .chain(links.pending_inputs.iter())
            .cloned()
            .collect()
    }

    pub(crate) fn output_pids(&self) -> Vec<Arc<PidShared>> {
        self.links.read().outputs.clone()
    }

    pub(crate) fn any_output_blocks(&self) -> bool {
        self.output_pids().iter().any(|p| p.would_block())
    }

    /// Declares no input capabilities
    pub(crate) fn is_source(&self) -> bool {
        self.descriptor.is_source()
    }

    pub(crate) fn accepts_more_inputs(&self) -> bool {
        let links = self.links.read();
        self.descriptor
            .max_input_pids
            .map_or(true, |max| links.inputs.len() + links.pending_inputs.len() < max)
    }

    /// Source-ID restriction check
    pub(crate) fn accepts_source(&self, producer: &FilterNode) -> bool {
        let links = self.links.read();
        if links.sources.is_empty() && links.source_names.is_empty() {
            return true;
        }
        links.sources.contains(&producer.id) || links.source_names.iter().any(|n| n == &producer.name)
    }

    /// Every input reached EOS and is drained
    pub(crate) fn inputs_drained(&self) -> bool {
        let links = self.links.read();
        links.pending_inputs.is_empty() && links.inputs.iter().all(|i| i.eos_flags().0)
    }

    /// Some input has packets queued
    pub(crate) fn has_queued_input(&self) -> bool {
        self.links.read().inputs.iter().any(|i| i.queue_len() > 0)
    }
}

impl std::fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("registry", &self.descriptor.name)
            .field("dynamic", &self.dynamic)
            .finish()
    }
}
