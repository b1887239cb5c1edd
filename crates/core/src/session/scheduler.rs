//! Cooperative scheduler
//!
//! Runnable filters sit in a ready queue. Workers pop a filter, run one slice (pending
//! configuration requests, then events, then one `process()` call) and decide whether it
//! goes back to the queue, waits for data, or is blocked on a full output. The thread that
//! called `Session::run` is a worker too: it alone runs main-affinity filters and host
//! tasks, delivers notifications and detects the end of the run.
//!
//! Workers and timers live on a tokio runtime owned by the scheduler, built on the first run
//! with one thread per configured worker. The calling thread drives its own loop through
//! `block_on`; the other workers are runtime tasks. Each timer is a task sleeping until its
//! deadline, then waking its filter or releasing its host task.
//!
//! The run ends when no filter is queued or running and no timer is pending. At that point
//! consumers whose inputs are drained are marked done; any other unfinished filter is
//! reported as a deadlock.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use super::events;
use super::linking;
use super::node::{ConfigRequest, FilterNode, RunState, Wake};
use super::{FilterNotification, Session, SessionShared, TaskNext};
use crate::error::{Error, FilterError, Result};
use crate::filter::context::Effects;
use crate::filter::{AbortMode, Filter, FilterContext, FilterState, ProcessStatus, ThreadAffinity};
use crate::pid::{InputPid, OutputPid};

/// Retry delay after a `NotReady` error
const NOT_READY_RETRY: Duration = Duration::from_millis(1);

pub(crate) type TaskFn = Box<dyn FnMut(&Session) -> TaskNext + Send>;

/// Host task posted with `Session::post_task`
pub(crate) struct HostTask {
    pub name: String,
    pub run: TaskFn,
}

enum TimerJob {
    Filter(Weak<FilterNode>),
    Task(HostTask),
}

#[derive(Default)]
struct ReadyQueue {
    any: VecDeque<Arc<FilterNode>>,
    main: VecDeque<Arc<FilterNode>>,
    tasks: VecDeque<HostTask>,
    running: usize,
    stop: bool,
    /// Filter timers not fired yet
    timers: usize,
    /// Host tasks waiting for their delay
    delayed_tasks: usize,
    /// Bumped by `clear_timers`; timers of an older epoch fire into the void
    epoch: u64,
    /// Timers posted before the runtime existed
    unspawned: Vec<(Instant, TimerJob)>,
    handles: Vec<AbortHandle>,
}

struct QueueShared {
    queue: Mutex<ReadyQueue>,
    notify: Notify,
}

/// Ready queue shared by the workers
pub(crate) struct Scheduler {
    shared: Arc<QueueShared>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

enum Job {
    Filter(Arc<FilterNode>),
    Task(HostTask),
    Notify,
    Quiescent,
}

/// Sleeps until `at`, then wakes the filter or releases the host task
async fn fire_timer(shared: Arc<QueueShared>, at: Instant, epoch: u64, job: TimerJob) {
    tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
    match job {
        TimerJob::Filter(node) => {
            if shared.queue.lock().epoch != epoch {
                return;
            }
            if let Some(node) = node.upgrade() {
                node.wake(Wake::Timer);
            }
            // released after the wake so the run never looks quiescent in between
            let mut q = shared.queue.lock();
            if q.epoch == epoch {
                q.timers = q.timers.saturating_sub(1);
            }
        }
        TimerJob::Task(task) => {
            let mut q = shared.queue.lock();
            if q.epoch != epoch {
                return;
            }
            q.delayed_tasks = q.delayed_tasks.saturating_sub(1);
            q.tasks.push_back(task);
        }
    }
    shared.notify.notify_waiters();
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                queue: Mutex::new(ReadyQueue::default()),
                notify: Notify::new(),
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Builds the runtime on first use, arms timers posted before it and clears `stop`
    pub(crate) fn start(&self, threads: usize) -> Result<Arc<Runtime>> {
        let runtime = {
            let mut slot = self.runtime.lock();
            match slot.as_ref() {
                Some(runtime) => runtime.clone(),
                None => {
                    let runtime = tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(threads.max(1))
                        .thread_name("fg-worker")
                        .enable_time()
                        .build()
                        .map_err(|e| Error::Other(format!("failed to start scheduler runtime: {}", e)))?;
                    let runtime = Arc::new(runtime);
                    *slot = Some(runtime.clone());
                    runtime
                }
            }
        };
        let mut q = self.shared.queue.lock();
        q.stop = false;
        let epoch = q.epoch;
        for (at, job) in std::mem::take(&mut q.unspawned) {
            let handle = runtime.spawn(fire_timer(self.shared.clone(), at, epoch, job));
            q.handles.push(handle.abort_handle());
        }
        Ok(runtime)
    }

    fn notify(&self) {
        self.shared.notify.notify_waiters();
    }

    /// Queues a filter already marked `Queued`
    pub(crate) fn push(&self, node: Arc<FilterNode>) {
        let mut q = self.shared.queue.lock();
        match node.affinity() {
            ThreadAffinity::Main => q.main.push_back(node),
            ThreadAffinity::Any => q.any.push_back(node),
        }
        drop(q);
        self.notify();
    }

    fn schedule_timer(&self, at: Instant, job: TimerJob) {
        let runtime = self.runtime.lock().clone();
        {
            let mut q = self.shared.queue.lock();
            match &job {
                TimerJob::Filter(_) => q.timers += 1,
                TimerJob::Task(_) => q.delayed_tasks += 1,
            }
            match runtime {
                Some(runtime) => {
                    let epoch = q.epoch;
                    let handle = runtime.spawn(fire_timer(self.shared.clone(), at, epoch, job));
                    q.handles.retain(|h| !h.is_finished());
                    q.handles.push(handle.abort_handle());
                }
                None => q.unspawned.push((at, job)),
            }
        }
        self.notify();
    }

    pub(crate) fn schedule_filter(&self, node: &Arc<FilterNode>, delay: Duration) {
        self.schedule_timer(Instant::now() + delay, TimerJob::Filter(Arc::downgrade(node)));
    }

    pub(crate) fn schedule_task(&self, task: HostTask, delay: Duration) {
        if delay.is_zero() {
            self.shared.queue.lock().tasks.push_back(task);
            self.notify();
        } else {
            self.schedule_timer(Instant::now() + delay, TimerJob::Task(task));
        }
    }

    /// Wakes idle workers, e.g. to deliver notifications
    pub(crate) fn kick(&self) {
        self.notify();
    }

    pub(crate) fn stop(&self) {
        self.shared.queue.lock().stop = true;
        self.notify();
    }

    /// Empties the ready queues, returning the filters that were queued
    pub(crate) fn drain(&self) -> Vec<Arc<FilterNode>> {
        let mut q = self.shared.queue.lock();
        let mut nodes: Vec<Arc<FilterNode>> = q.any.drain(..).collect();
        nodes.extend(q.main.drain(..));
        nodes
    }

    /// Drops every timer and pending host task
    pub(crate) fn clear_timers(&self) {
        let mut q = self.shared.queue.lock();
        q.epoch += 1;
        for handle in q.handles.drain(..) {
            handle.abort();
        }
        q.unspawned.clear();
        q.timers = 0;
        q.delayed_tasks = 0;
        q.tasks.clear();
    }

    pub(crate) fn pending_tasks(&self) -> usize {
        let q = self.shared.queue.lock();
        q.tasks.len() + q.delayed_tasks
    }

    fn finish_job(&self) {
        let mut q = self.shared.queue.lock();
        q.running = q.running.saturating_sub(1);
        if q.running == 0 {
            drop(q);
            self.notify();
        }
    }

    /// Pops the next job for this worker under the queue lock, `Err` when there is none yet
    fn try_next_job(&self, shared: &SessionShared, is_main: bool) -> std::result::Result<Option<Job>, ()> {
        let mut q = self.shared.queue.lock();
        if q.stop {
            return Ok(None);
        }
        if is_main {
            if shared.has_notifications() {
                q.running += 1;
                return Ok(Some(Job::Notify));
            }
            if let Some(task) = q.tasks.pop_front() {
                q.running += 1;
                return Ok(Some(Job::Task(task)));
            }
            if let Some(node) = q.main.pop_front() {
                q.running += 1;
                return Ok(Some(Job::Filter(node)));
            }
        }
        if let Some(node) = q.any.pop_front() {
            q.running += 1;
            return Ok(Some(Job::Filter(node)));
        }
        let quiescent = q.running == 0
            && q.timers == 0
            && q.delayed_tasks == 0
            && q.tasks.is_empty()
            && q.main.is_empty();
        if is_main && quiescent {
            q.running += 1;
            return Ok(Some(Job::Quiescent));
        }
        Err(())
    }

    async fn next_job(&self, shared: &SessionShared, is_main: bool) -> Option<Job> {
        let idle_wait = Duration::from_millis(shared.config.idle_wait_ms.max(1));
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // registered before looking at the queue so no wake-up is lost
            notified.as_mut().enable();
            if let Ok(job) = self.try_next_job(shared, is_main) {
                return job;
            }
            let _ = tokio::time::timeout(idle_wait, notified).await;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
        }
    }
}

// =============================================================================
// Run loop
// =============================================================================

/// Runs the graph until completion, abort or deadlock
pub(crate) fn run_loop(shared: &Arc<SessionShared>) -> Result<()> {
    let threads = shared.config.worker_threads();
    let runtime = shared.scheduler.start(threads)?;
    tracing::debug!(session = %shared.id, threads, "scheduler started");
    runtime.block_on(async {
        let workers: Vec<_> = (1..threads)
            .map(|_| runtime.spawn(worker_loop(shared.clone(), false)))
            .collect();
        let result = worker_loop(shared.clone(), true).await;
        shared.scheduler.stop();
        for worker in workers {
            match worker.await {
                Ok(Err(e)) => tracing::warn!("scheduler worker ended with error: {}", e),
                Err(e) => tracing::warn!("scheduler worker failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result
    })
}

async fn worker_loop(shared: Arc<SessionShared>, is_main: bool) -> Result<()> {
    while let Some(job) = shared.scheduler.next_job(&shared, is_main).await {
        let finished = match job {
            Job::Filter(node) => {
                run_slice(&shared, &node);
                None
            }
            Job::Task(mut task) => {
                let session = Session::from_shared(shared.clone());
                match (task.run)(&session) {
                    TaskNext::Done => {
                        tracing::debug!(task = %task.name, "host task done");
                    }
                    TaskNext::Again(delay) => shared.scheduler.schedule_task(task, delay),
                }
                None
            }
            Job::Notify => None,
            Job::Quiescent => Some(resolve_quiescence(&shared)),
        };
        if is_main {
            shared.deliver_notifications();
        }
        shared.scheduler.finish_job();
        match finished {
            Some(Ok(true)) => return Ok(()),
            Some(Err(e)) => return Err(e),
            _ => {}
        }
        if !is_main {
            // timer tasks spawned during the slice start on this runtime thread
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

/// Ok(true) when every filter finished, Ok(false) when more work was produced
fn resolve_quiescence(shared: &Arc<SessionShared>) -> Result<bool> {
    let filters = shared.graph.read().filters.clone();
    let mut stalled = Vec::new();
    let mut progressed = false;
    for node in filters {
        if node.state().is_terminal() {
            continue;
        }
        let drained_consumer = !node.is_source()
            && !node.has_pending_work()
            && node.inputs_drained()
            && !node.any_output_blocks();
        if drained_consumer {
            mark_done(&node);
            progressed = true;
        } else {
            stalled.push(node.name.clone());
        }
    }
    if progressed {
        return Ok(false);
    }
    if stalled.is_empty() {
        Ok(true)
    } else {
        tracing::error!(filters = ?stalled, "no runnable filter left");
        Err(Error::Deadlock { filters: stalled })
    }
}

fn mark_done(node: &Arc<FilterNode>) {
    {
        let mut s = node.sched.lock();
        if s.state.is_terminal() {
            return;
        }
        s.state = FilterState::Done;
        s.run = RunState::Idle;
    }
    for pid in node.output_pids() {
        pid.set_eos();
    }
    tracing::debug!(filter = %node.name, "filter done");
}

#[derive(Default)]
struct SliceOutcome {
    processed: bool,
    eos: bool,
    force_done: bool,
    retry: bool,
    failure: Option<Error>,
}

fn set_state_from(node: &FilterNode, from: &[FilterState], to: FilterState) {
    let mut s = node.sched.lock();
    if from.contains(&s.state) {
        s.state = to;
    }
}

/// One scheduling slice of `node`
fn run_slice(shared: &Arc<SessionShared>, node: &Arc<FilterNode>) {
    {
        let mut s = node.sched.lock();
        if s.state == FilterState::Removed {
            s.run = RunState::Idle;
            return;
        }
        s.run = RunState::Running;
        s.wake_pending = false;
    }
    let before = node.progress();
    let flushing_source = shared.is_flushing() && node.is_source();
    let mut effects = Effects::default();
    let mut outcome = SliceOutcome::default();
    {
        let mut core = node.core.lock();
        let core = &mut *core;
        let mut ctx = FilterContext::new(node, shared, &mut effects);
        if !core.initialized {
            core.initialized = true;
            match core.kind.as_filter().initialize(&mut ctx) {
                Ok(()) => {
                    if node.is_source() {
                        set_state_from(node, &[FilterState::Connecting], FilterState::Configured);
                    }
                }
                Err(e) => outcome.failure = Some(e),
            }
        }
        if outcome.failure.is_none() {
            handle_configs(node, core.kind.as_filter(), &mut ctx);
            handle_arg_updates(node, core.kind.as_filter(), &mut ctx);
            handle_events(node, core.kind.as_filter(), &mut ctx);
        }
        let state = node.state();
        let runnable = outcome.failure.is_none()
            && !state.is_terminal()
            && !flushing_source
            && (node.is_source() || !node.input_instances().is_empty())
            && !node.any_output_blocks();
        if runnable {
            set_state_from(
                node,
                &[FilterState::Connecting, FilterState::Configured],
                FilterState::Running,
            );
            let start = Instant::now();
            let res = core.kind.as_filter().process(&mut ctx);
            node.timing.record(start.elapsed());
            node.counters.process_calls.fetch_add(1, Ordering::Relaxed);
            outcome.processed = true;
            match res {
                Ok(ProcessStatus::Continue) => {}
                Ok(ProcessStatus::EndOfStream) => outcome.eos = true,
                Err(e) if e.is_recoverable() => {
                    tracing::trace!(filter = %node.name, "not ready: {}", e);
                    outcome.retry = true;
                }
                Err(e) => outcome.failure = Some(e),
            }
        }
    }
    apply_effects(shared, node, effects);
    if flushing_source && !node.state().is_terminal() {
        outcome.eos = true;
        outcome.force_done = true;
    }
    finish_slice(shared, node, outcome, before);
}

fn handle_configs(node: &Arc<FilterNode>, filter: &mut dyn Filter, ctx: &mut FilterContext<'_>) {
    let mut requests = node.take_configs();
    for inst in node.take_deferred() {
        if inst.queue_len() == 0 {
            requests.push_back(ConfigRequest::Remove(inst));
        } else {
            node.defer_removal(inst);
        }
    }
    for req in requests {
        match req {
            ConfigRequest::Connect(inst) => {
                if inst.is_detached() {
                    node.links.write().pending_inputs.retain(|i| !Arc::ptr_eq(i, &inst));
                    continue;
                }
                inst.accept_reconfig();
                let pid = InputPid::new(inst.clone());
                let res = filter.configure(ctx, &pid, false);
                {
                    let mut links = node.links.write();
                    links.pending_inputs.retain(|i| !Arc::ptr_eq(i, &inst));
                    if res.is_ok() {
                        links.inputs.push(inst.clone());
                    }
                }
                match res {
                    Ok(()) => {
                        set_state_from(node, &[FilterState::Connecting], FilterState::Configured);
                        tracing::debug!(filter = %node.name, pid = %pid.name(), source = %pid.source_filter(), "input PID configured");
                    }
                    Err(e) => {
                        tracing::warn!(filter = %node.name, pid = %pid.name(), "configure failed: {}", e);
                        ctx.effects().failed_connects.push((inst, e));
                    }
                }
            }
            ConfigRequest::Reconfigure(inst) => {
                if inst.is_detached() {
                    continue;
                }
                inst.accept_reconfig();
                let pid = InputPid::new(inst.clone());
                if let Err(e) = filter.configure(ctx, &pid, false) {
                    tracing::warn!(filter = %node.name, pid = %pid.name(), "reconfigure failed: {}", e);
                    node.links.write().inputs.retain(|i| !Arc::ptr_eq(i, &inst));
                    ctx.effects().failed_connects.push((inst, e));
                } else {
                    tracing::debug!(filter = %node.name, pid = %pid.name(), "input PID reconfigured");
                }
            }
            ConfigRequest::Remove(inst) => {
                if inst.queue_len() > 0 {
                    node.defer_removal(inst);
                    continue;
                }
                let pid = InputPid::new(inst.clone());
                if let Err(e) = filter.configure(ctx, &pid, true) {
                    tracing::debug!(filter = %node.name, pid = %pid.name(), "remove callback failed: {}", e);
                }
                {
                    let mut links = node.links.write();
                    links.inputs.retain(|i| !Arc::ptr_eq(i, &inst));
                    links.pending_inputs.retain(|i| !Arc::ptr_eq(i, &inst));
                }
                inst.pid.detach(&inst, false);
                node.mark_progress();
                tracing::debug!(filter = %node.name, pid = %pid.name(), "input PID removed");
            }
            ConfigRequest::ReconfigureOutput { pid, requester } => {
                let out = OutputPid { shared: pid.clone() };
                match filter.reconfigure_output(ctx, &out) {
                    Ok(()) => {
                        pid.take_negotiated();
                        tracing::debug!(filter = %node.name, pid = %out.name(), "output reconfigured in place");
                    }
                    Err(e) => {
                        let required = pid.take_negotiated();
                        tracing::debug!(filter = %node.name, pid = %out.name(), "output reconfiguration refused ({}), inserting adapter", e);
                        ctx.effects().adapters.push((pid, requester, required));
                    }
                }
            }
        }
    }
}

fn handle_arg_updates(node: &Arc<FilterNode>, filter: &mut dyn Filter, ctx: &mut FilterContext<'_>) {
    for (name, value) in node.take_arg_updates() {
        match filter.update_arg(ctx, &name, &value) {
            Ok(()) => {
                tracing::debug!(filter = %node.name, arg = %name, %value, "argument updated");
                node.args.write().set(name, value);
            }
            Err(e) => {
                tracing::warn!(filter = %node.name, arg = %name, "argument update refused: {}", e);
            }
        }
    }
}

fn handle_events(node: &Arc<FilterNode>, filter: &mut dyn Filter, ctx: &mut FilterContext<'_>) {
    for pending in node.take_events() {
        let handled = filter.process_event(ctx, &pending.event);
        tracing::trace!(filter = %node.name, event = %pending.event, handled, "event delivered");
        if !handled {
            events::forward(node, pending);
        }
    }
}

fn apply_effects(shared: &Arc<SessionShared>, node: &Arc<FilterNode>, effects: Effects) {
    for pid in effects.new_pids {
        linking::link_output(shared, node, &pid);
    }
    for (inst, err) in effects.failed_connects {
        linking::on_configure_failure(shared, node, &inst, err);
    }
    for (pid, requester, required) in effects.adapters {
        linking::insert_adapter(shared, &pid, &requester, required);
    }
    if let Some(delay) = effects.reschedule {
        shared.scheduler.schedule_filter(node, delay);
    }
    if let Some(mode) = effects.abort {
        tracing::info!(filter = %node.name, ?mode, "session abort requested by filter");
        shared.abort(mode);
    }
}

fn finish_slice(
    shared: &Arc<SessionShared>,
    node: &Arc<FilterNode>,
    outcome: SliceOutcome,
    before: u64,
) {
    if let Some(err) = outcome.failure {
        fail_filter(shared, node, err);
        return;
    }
    let progressed = node.progress() != before;
    let outputs = node.output_pids();
    if outcome.eos {
        for pid in &outputs {
            pid.set_eos();
        }
    }
    let drained = node.inputs_drained();
    let has_inputs = !node.all_input_instances().is_empty();
    let done = if outcome.force_done {
        true
    } else if node.is_source() {
        outcome.eos
    } else if outcome.eos {
        drained || outputs.is_empty()
    } else {
        outcome.processed && has_inputs && drained && !progressed
    };

    let requeue = {
        let mut s = node.sched.lock();
        if s.state.is_terminal() {
            s.run = RunState::Idle;
            if node.has_pending_work() {
                s.run = RunState::Queued;
            }
            s.run == RunState::Queued
        } else if done && !node.has_pending_work() {
            s.state = FilterState::Done;
            s.run = RunState::Idle;
            false
        } else {
            let pending = node.has_pending_work() || node.deferred_ready();
            let more_input = node.is_source() || node.has_queued_input() || drained;
            let wanted = s.wake_pending || pending || done || (progressed && more_input);
            let blocked = node.any_output_blocks();
            s.run = if blocked && !pending {
                RunState::Blocked
            } else if wanted {
                RunState::Queued
            } else {
                RunState::Idle
            };
            s.run == RunState::Queued
        }
    };

    if done && node.state() == FilterState::Done {
        for pid in &outputs {
            pid.set_eos();
        }
        if outputs.is_empty() && !drained {
            // sink ended early: release what it will never read
            for inst in node.all_input_instances() {
                inst.set_discard(true);
            }
        }
        tracing::debug!(filter = %node.name, "filter done");
    }
    if requeue {
        shared.scheduler.push(node.clone());
    } else if outcome.retry && node.sched.lock().run == RunState::Idle {
        shared.scheduler.schedule_filter(node, NOT_READY_RETRY);
    }
}

/// Terminal failure of one filter
pub(crate) fn fail_filter(shared: &Arc<SessionShared>, node: &Arc<FilterNode>, err: Error) {
    if err.is_fatal_for_filter() {
        tracing::error!(filter = %node.name, "filter failed: {}", err);
    } else {
        tracing::warn!(filter = %node.name, "filter failed: {}", err);
    }
    {
        let mut s = node.sched.lock();
        s.state = FilterState::Error;
        s.run = RunState::Idle;
    }
    for pid in node.output_pids() {
        pid.set_eos();
    }
    for inst in node.all_input_instances() {
        inst.set_discard(true);
    }
    let summary = FilterError::new(&node.name, &err);
    shared.record_process_error(summary.clone());
    shared.notify(FilterNotification::Failed {
        id: node.id,
        name: node.name.clone(),
        error: summary,
    });
    if shared.config.abort_on_error {
        shared.abort(AbortMode::Immediate);
    }
}
