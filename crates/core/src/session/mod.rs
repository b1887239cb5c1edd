//! Filter session
//!
//! The session owns the filter graph, the filter and I/O registries and the scheduler. Filters
//! are loaded by name, by URL or from host callbacks; `run()` drives the graph until every
//! filter is done, the session is aborted or no filter can make progress.
//!
//! ```no_run
//! use filtergraph_core::{Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig::default());
//! session.load_filter("testsrc:dur=2")?;
//! session.load_filter("inspect")?;
//! session.run()?;
//! println!("{:?}", session.stats());
//! # Ok::<(), filtergraph_core::Error>(())
//! ```

pub(crate) mod events;
pub(crate) mod linking;
pub(crate) mod node;
pub(crate) mod scheduler;
pub mod stats;

pub use stats::{FilterStats, SessionStats};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::caps::Caps;
use crate::config::SessionConfig;
use crate::error::{Error, FilterError, Result};
use crate::event::FilterEvent;
use crate::filter::context::Effects;
use crate::filter::{
    split_filter_spec, AbortMode, CustomFilter, FilterArgs, FilterContext, FilterDescriptor,
    FilterId, FilterKind, FilterRegistry, FilterState,
};
use crate::io::IoRegistry;
use crate::manifest::GraphManifest;
use crate::pid::{PidId, PidStatistics};
use crate::props::PropertyMap;
use node::{FilterNode, NodeInit, RunState, Wake};
use scheduler::{HostTask, Scheduler};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    /// The last run was aborted
    Aborted,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every filter reached a terminal state
    Completed,
    Aborted,
}

/// What a host task wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskNext {
    Done,
    /// Run again after the delay
    Again(Duration),
}

/// Filter lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNotification {
    Created { id: FilterId, name: String },
    Destroyed { id: FilterId, name: String },
    Failed {
        id: FilterId,
        name: String,
        error: FilterError,
    },
}

type NotificationHandler = Box<dyn FnMut(&FilterNotification) + Send>;

#[derive(Default)]
pub(crate) struct Graph {
    pub(crate) filters: Vec<Arc<FilterNode>>,
    next_id: u32,
}

impl Graph {
    pub(crate) fn next_id(&mut self) -> FilterId {
        self.next_id += 1;
        FilterId(self.next_id)
    }

    /// Inserts a node and queues its creation notification
    pub(crate) fn add(&mut self, shared: &Arc<SessionShared>, init: NodeInit) -> Arc<FilterNode> {
        let node = FilterNode::new(shared, init);
        self.filters.push(node.clone());
        shared.notify(FilterNotification::Created {
            id: node.id,
            name: node.name.clone(),
        });
        node.wake(Wake::Config);
        node
    }

    fn find(&self, id: FilterId) -> Option<&Arc<FilterNode>> {
        self.filters.iter().find(|n| n.id == id)
    }
}

#[derive(Default)]
struct FirstErrors {
    connect: Option<FilterError>,
    process: Option<FilterError>,
}

/// State shared by the session handles, the scheduler and the graph nodes
pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) config: SessionConfig,
    pub(crate) registry: Arc<FilterRegistry>,
    pub(crate) io: Arc<IoRegistry>,
    pub(crate) graph: RwLock<Graph>,
    pub(crate) scheduler: Scheduler,
    state: Mutex<SessionState>,
    errors: Mutex<FirstErrors>,
    notify_tx: Sender<FilterNotification>,
    notify_rx: Receiver<FilterNotification>,
    handler: Mutex<Option<NotificationHandler>>,
    flushing: AtomicBool,
    aborting: AtomicBool,
    wall_time: Mutex<Duration>,
}

impl SessionShared {
    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub(crate) fn find_node(&self, id: FilterId) -> Option<Arc<FilterNode>> {
        self.graph.read().find(id).cloned()
    }

    pub(crate) fn record_connect_error(&self, err: FilterError) {
        let mut errors = self.errors.lock();
        if errors.connect.is_none() {
            errors.connect = Some(err);
        }
    }

    pub(crate) fn record_process_error(&self, err: FilterError) {
        let mut errors = self.errors.lock();
        if errors.process.is_none() {
            errors.process = Some(err);
        }
    }

    pub(crate) fn notify(&self, notification: FilterNotification) {
        if self.notify_tx.send(notification).is_ok() {
            self.scheduler.kick();
        }
    }

    pub(crate) fn has_notifications(&self) -> bool {
        !self.notify_rx.is_empty()
    }

    /// Hands queued notifications to the handler, in order
    pub(crate) fn deliver_notifications(&self) {
        let mut handler = self.handler.lock();
        while let Ok(notification) = self.notify_rx.try_recv() {
            if let Some(h) = handler.as_mut() {
                h(&notification);
            }
        }
    }

    /// Delivers notifications on the mutating thread when no run owns the control plane
    fn deliver_if_idle(&self) {
        if *self.state.lock() != SessionState::Running {
            self.deliver_notifications();
        }
    }

    pub(crate) fn abort(&self, mode: AbortMode) {
        if *self.state.lock() != SessionState::Running {
            return;
        }
        self.aborting.store(true, Ordering::Release);
        let filters = self.graph.read().filters.clone();
        match mode {
            AbortMode::Immediate => {
                tracing::info!(session = %self.id, "aborting session, dropping data in flight");
                self.scheduler.stop();
                self.scheduler.clear_timers();
                for node in self.scheduler.drain() {
                    node.sched.lock().run = RunState::Idle;
                }
                for node in &filters {
                    for inst in node.all_input_instances() {
                        inst.flush();
                    }
                }
            }
            AbortMode::Flush => {
                tracing::info!(session = %self.id, "aborting session, draining accepted packets");
                self.flushing.store(true, Ordering::Release);
                for node in filters.iter().filter(|n| n.is_source()) {
                    node.wake(Wake::Abort);
                }
            }
        }
    }
}

/// Runs `finalize` once on an initialized filter
fn finalize_node(shared: &SessionShared, node: &Arc<FilterNode>) {
    let mut core = node.core.lock();
    if !core.initialized || core.finalized {
        return;
    }
    core.finalized = true;
    let mut effects = Effects::default();
    let mut ctx = FilterContext::new(node, shared, &mut effects);
    core.kind.as_filter().finalize(&mut ctx);
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let filters = std::mem::take(&mut self.graph.get_mut().filters);
        for node in &filters {
            finalize_node(self, node);
            node.sched.lock().state = FilterState::Removed;
        }
        for node in &filters {
            for pid in node.output_pids() {
                pid.teardown();
            }
            self.notify(FilterNotification::Destroyed {
                id: node.id,
                name: node.name.clone(),
            });
        }
        self.deliver_notifications();
        tracing::debug!(session = %self.id, filters = filters.len(), "session destroyed");
    }
}

/// Handle to a filter session; clones share the same graph
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Session with the built-in filters and I/O backends
    pub fn new(config: SessionConfig) -> Self {
        Self::with_registry(config, Arc::new(FilterRegistry::with_builtins()))
    }

    pub fn with_registry(config: SessionConfig, registry: Arc<FilterRegistry>) -> Self {
        Self::with_registries(config, registry, Arc::new(IoRegistry::new()))
    }

    pub fn with_registries(
        config: SessionConfig,
        registry: Arc<FilterRegistry>,
        io: Arc<IoRegistry>,
    ) -> Self {
        let (notify_tx, notify_rx) = unbounded();
        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            config,
            registry,
            io,
            graph: RwLock::new(Graph::default()),
            scheduler: Scheduler::new(),
            state: Mutex::new(SessionState::Idle),
            errors: Mutex::new(FirstErrors::default()),
            notify_tx,
            notify_rx,
            handler: Mutex::new(None),
            flushing: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            wall_time: Mutex::new(Duration::ZERO),
        });
        tracing::debug!(session = %shared.id, threads = shared.config.worker_threads(), "session created");
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Builds a session from a manifest, with the built-in filters
    pub fn from_manifest(manifest: &GraphManifest) -> Result<Self> {
        Self::from_manifest_with_registry(manifest, Arc::new(FilterRegistry::with_builtins()))
    }

    pub fn from_manifest_with_registry(
        manifest: &GraphManifest,
        registry: Arc<FilterRegistry>,
    ) -> Result<Self> {
        manifest.validate()?;
        let session = Self::with_registry(manifest.config.clone().unwrap_or_default(), registry);
        for entry in &manifest.filters {
            session.load_filter(&entry.to_spec())?;
        }
        tracing::info!(filters = manifest.filters.len(), "graph loaded from manifest");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.shared.registry
    }

    pub fn io(&self) -> &Arc<IoRegistry> {
        &self.shared.io
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    // =========================================================================
    // Graph construction
    // =========================================================================

    /// Loads a filter from a `name:arg=value:...` spec
    pub fn load_filter(&self, spec: &str) -> Result<FilterId> {
        let (name, pairs) = split_filter_spec(spec)?;
        let desc = self
            .shared
            .registry
            .get(&name)
            .ok_or_else(|| Error::FilterNotFound(format!("no filter named '{}'", name)))?;
        let args = FilterArgs::from_pairs(&desc.name, &desc.args, &pairs)?;
        self.add_filter(desc, args)
    }

    /// Loads the best source filter for `url`
    pub fn load_source(&self, url: &str) -> Result<FilterId> {
        let desc = self
            .shared
            .registry
            .probe_source(url, &self.shared.io)
            .ok_or_else(|| Error::FilterNotFound(format!("no source filter for '{}'", url)))?;
        let args = FilterArgs::from_pairs(&desc.name, &desc.args, &[("src".to_string(), Some(url.to_string()))])?;
        self.add_filter(desc, args)
    }

    /// Loads the best sink filter for `url`
    pub fn load_destination(&self, url: &str) -> Result<FilterId> {
        let desc = self
            .shared
            .registry
            .probe_destination(url, &self.shared.io)
            .ok_or_else(|| Error::FilterNotFound(format!("no destination filter for '{}'", url)))?;
        let args = FilterArgs::from_pairs(&desc.name, &desc.args, &[("dst".to_string(), Some(url.to_string()))])?;
        self.add_filter(desc, args)
    }

    pub fn add_filter(&self, descriptor: Arc<FilterDescriptor>, args: FilterArgs) -> Result<FilterId> {
        let kind = descriptor.instantiate(&args)?;
        self.insert(descriptor, args, kind)
    }

    /// Adds a host-callback filter with the given capabilities
    pub fn add_custom_filter(&self, caps: Caps, filter: CustomFilter) -> Result<FilterId> {
        let mut descriptor = FilterDescriptor::placeholder(filter.name(), caps);
        descriptor.args = filter.arg_descriptors().to_vec();
        let args = descriptor.default_args()?;
        self.insert(Arc::new(descriptor), args, FilterKind::Custom(filter))
    }

    fn insert(&self, descriptor: Arc<FilterDescriptor>, args: FilterArgs, kind: FilterKind) -> Result<FilterId> {
        let name = args.fid().unwrap_or(&descriptor.name).to_string();
        let sources = args.sources().to_vec();
        let node = {
            let mut graph = self.shared.graph.write();
            let id = graph.next_id();
            let node = graph.add(
                &self.shared,
                NodeInit {
                    id,
                    name,
                    descriptor,
                    args,
                    kind,
                    dynamic: false,
                    forced_caps: PropertyMap::new(),
                    target: None,
                },
            );
            node.links.write().source_names = sources;
            node
        };
        tracing::debug!(filter = %node.name, id = %node.id, "filter loaded");
        if self.state() == SessionState::Running {
            linking::relink_unconnected(&self.shared, &node);
        }
        self.shared.deliver_if_idle();
        Ok(node.id)
    }

    /// Restricts `dst` to receive PIDs from `src` only (cumulative)
    pub fn set_source(&self, dst: FilterId, src: FilterId) -> Result<()> {
        let graph = self.shared.graph.read();
        if graph.find(src).is_none() {
            return Err(Error::BadParam(format!("unknown filter {}", src)));
        }
        let node = graph
            .find(dst)
            .ok_or_else(|| Error::BadParam(format!("unknown filter {}", dst)))?;
        let mut links = node.links.write();
        if !links.sources.contains(&src) {
            links.sources.push(src);
        }
        Ok(())
    }

    /// Detaches a filter from the graph and destroys it
    ///
    /// Consumers see its outputs removed once they drained them; its inputs are released.
    pub fn remove_filter(&self, id: FilterId) -> Result<()> {
        let node = {
            let mut graph = self.shared.graph.write();
            let pos = graph
                .filters
                .iter()
                .position(|n| n.id == id)
                .ok_or_else(|| Error::BadParam(format!("unknown filter {}", id)))?;
            graph.filters.remove(pos)
        };
        {
            let mut s = node.sched.lock();
            s.state = FilterState::Removed;
            s.run = RunState::Idle;
        }
        for pid in node.output_pids() {
            pid.remove();
        }
        for inst in node.all_input_instances() {
            inst.pid.detach(&inst, false);
        }
        finalize_node(&self.shared, &node);
        tracing::debug!(filter = %node.name, id = %node.id, "filter removed");
        self.shared.notify(FilterNotification::Destroyed {
            id: node.id,
            name: node.name.clone(),
        });
        self.shared.deliver_if_idle();
        Ok(())
    }

    /// Brings a done or failed filter back to life
    pub fn reset_filter(&self, id: FilterId) -> Result<()> {
        let node = self
            .shared
            .find_node(id)
            .ok_or_else(|| Error::BadParam(format!("unknown filter {}", id)))?;
        {
            let mut s = node.sched.lock();
            if matches!(s.state, FilterState::Done | FilterState::Error) {
                s.state = if node.input_instances().is_empty() && !node.is_source() {
                    FilterState::Connecting
                } else {
                    FilterState::Configured
                };
            }
        }
        for inst in node.all_input_instances() {
            inst.set_discard(false);
        }
        tracing::debug!(filter = %node.name, "filter reset");
        node.wake(Wake::Config);
        Ok(())
    }

    /// Changes an argument of a loaded filter
    ///
    /// The value is checked against the filter's argument descriptors here; the filter sees
    /// it in its next slice through `update_arg`. Values the filter accepts replace the ones
    /// returned by `FilterContext::args`.
    ///
    /// # Errors
    ///
    /// `BadParam` for an unknown filter, an undeclared argument or an illegal value.
    pub fn update_filter_arg(&self, id: FilterId, name: &str, value: &str) -> Result<()> {
        let node = self
            .shared
            .find_node(id)
            .ok_or_else(|| Error::BadParam(format!("unknown filter {}", id)))?;
        let parsed = FilterArgs::parse_update(&node.name, &node.descriptor.args, name, value)?;
        tracing::debug!(filter = %node.name, arg = name, value, "argument update queued");
        node.push_arg_update(name.to_string(), parsed);
        Ok(())
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Runs the graph on the calling thread (plus `threads - 1` workers)
    ///
    /// # Errors
    ///
    /// `Deadlock` when filters remain that can never run again; `Cancelled` when a filter
    /// error aborted the session under `abort_on_error`.
    pub fn run(&self) -> Result<RunOutcome> {
        {
            let mut state = self.shared.state.lock();
            if *state == SessionState::Running {
                return Err(Error::BadParam("session is already running".into()));
            }
            *state = SessionState::Running;
        }
        let shared = &self.shared;
        shared.aborting.store(false, Ordering::Release);
        shared.flushing.store(false, Ordering::Release);
        let started = Instant::now();
        tracing::info!(session = %shared.id, filters = shared.graph.read().filters.len(), "session run started");

        let filters = shared.graph.read().filters.clone();
        for node in &filters {
            node.wake(Wake::Config);
        }
        let result = scheduler::run_loop(shared);

        for node in shared.scheduler.drain() {
            node.sched.lock().run = RunState::Idle;
        }
        let elapsed = started.elapsed();
        *shared.wall_time.lock() += elapsed;
        let aborted = shared.aborting.swap(false, Ordering::AcqRel);
        shared.flushing.store(false, Ordering::Release);
        *shared.state.lock() = if aborted {
            SessionState::Aborted
        } else {
            SessionState::Idle
        };
        shared.deliver_notifications();
        tracing::info!(session = %shared.id, elapsed_ms = elapsed.as_millis() as u64, aborted, "session run finished");

        result?;
        if !aborted {
            return Ok(RunOutcome::Completed);
        }
        match self.process_error() {
            Some(err) if shared.config.abort_on_error => Err(Error::Cancelled(format!(
                "session aborted after filter error: {}",
                err
            ))),
            _ => Ok(RunOutcome::Aborted),
        }
    }

    /// Runs the session on the blocking thread pool
    pub async fn run_async(&self) -> Result<RunOutcome> {
        let session = self.clone();
        tokio::task::spawn_blocking(move || session.run())
            .await
            .map_err(|e| Error::Other(format!("session task failed: {}", e)))?
    }

    pub fn abort(&self, mode: AbortMode) {
        self.shared.abort(mode);
    }

    /// Posts a host task run on the control thread during `run()`
    pub fn post_task(
        &self,
        name: impl Into<String>,
        delay: Duration,
        task: impl FnMut(&Session) -> TaskNext + Send + 'static,
    ) {
        self.shared.scheduler.schedule_task(
            HostTask {
                name: name.into(),
                run: Box::new(task),
            },
            delay,
        );
    }

    /// Host tasks not run yet
    pub fn pending_tasks(&self) -> usize {
        self.shared.scheduler.pending_tasks()
    }

    /// Injects an event from the host
    pub fn send_event(&self, event: FilterEvent) -> Result<()> {
        events::send_from_session(&self.shared, event)
    }

    pub fn set_notification_handler(&self, handler: impl FnMut(&FilterNotification) + Send + 'static) {
        *self.shared.handler.lock() = Some(Box::new(handler));
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// First link or configuration error
    pub fn connect_error(&self) -> Option<FilterError> {
        self.shared.errors.lock().connect.clone()
    }

    /// First processing error
    pub fn process_error(&self) -> Option<FilterError> {
        self.shared.errors.lock().process.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let filters = self.shared.graph.read().filters.clone();
        let mut stats = SessionStats {
            wall_time: *self.shared.wall_time.lock(),
            ..Default::default()
        };
        for node in filters {
            let c = &node.counters;
            let (p50, p99, max) = node.timing.summary();
            let status = node.status.lock().clone();
            let fs = FilterStats {
                id: node.id,
                name: node.name.clone(),
                class: node.descriptor.name.clone(),
                state: node.state(),
                dynamic: node.dynamic,
                process_calls: c.process_calls.load(Ordering::Relaxed),
                packets_in: c.packets_in.load(Ordering::Relaxed),
                bytes_in: c.bytes_in.load(Ordering::Relaxed),
                packets_out: c.packets_out.load(Ordering::Relaxed),
                bytes_out: c.bytes_out.load(Ordering::Relaxed),
                process_p50_us: p50,
                process_p99_us: p99,
                process_max_us: max,
                status: status.text,
                status_percent: status.percent,
            };
            stats.packets_sent += fs.packets_out;
            stats.bytes_sent += fs.bytes_out;
            stats.filters.push(fs);
        }
        stats
    }

    /// Consistent view of the graph; structural changes wait until it is dropped
    ///
    /// Do not call other session methods while holding the view.
    pub fn lock(&self) -> GraphView<'_> {
        GraphView {
            graph: self.shared.graph.read(),
        }
    }
}

/// Read-locked view of the filter graph
pub struct GraphView<'a> {
    graph: RwLockReadGuard<'a, Graph>,
}

/// Snapshot of one PID connection
#[derive(Debug, Clone, Serialize)]
pub struct PidInfo {
    pub id: PidId,
    pub name: String,
    /// Producing filter
    pub source: String,
    /// Consuming filters
    pub consumers: Vec<String>,
    pub eos: bool,
    pub queued: usize,
    pub statistics: PidStatistics,
}

/// Snapshot of one filter and its links
#[derive(Debug, Clone, Serialize)]
pub struct FilterInfo {
    pub id: FilterId,
    pub name: String,
    pub class: String,
    pub state: FilterState,
    pub dynamic: bool,
    pub inputs: Vec<PidInfo>,
    pub outputs: Vec<PidInfo>,
}

fn describe(node: &FilterNode) -> FilterInfo {
    let inputs = node
        .input_instances()
        .iter()
        .map(|inst| PidInfo {
            id: inst.pid.id,
            name: inst.pid.name(),
            source: inst.pid.owner_name().to_string(),
            consumers: vec![node.name.clone()],
            eos: inst.eos_flags().0,
            queued: inst.queue_len(),
            statistics: inst.statistics(),
        })
        .collect();
    let outputs = node
        .output_pids()
        .iter()
        .map(|pid| {
            let dests = pid.destinations();
            PidInfo {
                id: pid.id,
                name: pid.name(),
                source: node.name.clone(),
                consumers: dests
                    .iter()
                    .filter_map(|d| d.consumer.upgrade())
                    .map(|c| c.name.clone())
                    .collect(),
                eos: pid.is_eos(),
                queued: pid.occupancy().units,
                statistics: pid.statistics(),
            }
        })
        .collect();
    FilterInfo {
        id: node.id,
        name: node.name.clone(),
        class: node.descriptor.name.clone(),
        state: node.state(),
        dynamic: node.dynamic,
        inputs,
        outputs,
    }
}

impl GraphView<'_> {
    pub fn len(&self) -> usize {
        self.graph.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.filters.is_empty()
    }

    pub fn filters(&self) -> Vec<FilterInfo> {
        self.graph.filters.iter().map(|n| describe(n)).collect()
    }

    pub fn filter(&self, id: FilterId) -> Option<FilterInfo> {
        self.graph.find(id).map(|n| describe(n))
    }

    /// First filter with the given name
    pub fn find(&self, name: &str) -> Option<FilterInfo> {
        self.graph
            .filters
            .iter()
            .find(|n| n.name == name)
            .map(|n| describe(n))
    }
}
