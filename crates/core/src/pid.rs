//! Filter PIDs
//!
//! A PID is a logical elementary-stream connection. The producing side ([`OutputPid`]) owns
//! the property map, the buffer limits and the EOS flag; each consuming filter gets its own
//! [`InputPid`] instance with a private FIFO queue, so fan-out never reorders packets for any
//! consumer.
//!
//! Property changes are versioned: the producer edits a working map and the next packet sent
//! publishes it as a new immutable snapshot. A consumer whose configured snapshot is older
//! than the head packet's is reconfigured before that packet is handed out.
//!
//! # Lock order
//!
//! `filter sched -> pid state -> instance state`. Wakeups are issued only after pid and
//! instance locks are released.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::event::FilterEvent;
use crate::packet::{rescale, ClockType, Packet, PacketMeta};
use crate::props::{PropertyId, PropertyKey, PropertyMap, PropertyValue};
use crate::session::node::{ConfigRequest, FilterNode, Wake};

/// Default timescale when a PID does not declare one
pub const DEFAULT_TIMESCALE: u32 = 1000;

/// Maximum number of producers walked by `get_info`
const MAX_INFO_DEPTH: usize = 32;

static NEXT_PID_ID: AtomicU64 = AtomicU64::new(1);

/// Unique PID identifier within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PidId(pub u64);

impl PidId {
    pub(crate) fn next() -> Self {
        PidId(NEXT_PID_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID{}", self.0)
    }
}

/// Side of the connection a PID handle represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidDirection {
    Input,
    Output,
}

/// Immutable snapshot of a PID's properties
#[derive(Debug, Default)]
pub struct PidProps {
    pub version: u64,
    pub map: PropertyMap,
}

/// Buffer fill level of a PID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOccupancy {
    /// Packets queued (worst consumer)
    pub units: usize,
    /// Unit limit, 0 when disabled
    pub max_units: usize,
    /// Queued duration in microseconds (worst consumer)
    pub duration_us: u64,
    /// Duration limit in microseconds, 0 when disabled
    pub max_duration_us: u64,
}

impl BufferOccupancy {
    /// Would-block rule: units reach the limit, or queued duration exceeds it
    pub fn is_full(&self) -> bool {
        (self.max_units > 0 && self.units >= self.max_units)
            || (self.max_duration_us > 0 && self.duration_us > self.max_duration_us)
    }
}

/// Packet counters for one side of a PID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidStatistics {
    pub packets: u64,
    pub bytes: u64,
    pub first_cts: Option<u64>,
    pub last_cts: Option<u64>,
    /// Sum of packet durations, in the PID timescale
    pub total_duration: u64,
    pub timescale: u32,
}

impl PidStatistics {
    fn record(&mut self, meta: &PacketMeta, size: usize, timescale: u32) {
        self.packets += 1;
        self.bytes += size as u64;
        self.total_duration += meta.duration as u64;
        self.timescale = timescale;
        if let Some(cts) = meta.cts {
            self.first_cts.get_or_insert(cts);
            self.last_cts = Some(cts);
        }
    }

    /// Average bitrate in bits per second over the accumulated packet durations
    pub fn average_bitrate(&self) -> u64 {
        if self.total_duration == 0 || self.timescale == 0 {
            return 0;
        }
        (self.bytes as u128 * 8 * self.timescale as u128 / self.total_duration as u128) as u64
    }
}

// =============================================================================
// Producer side
// =============================================================================

/// Resolution state of an output PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    /// Linking not attempted yet; packets are held
    Pending,
    Connected,
    /// No consumer found; packets are dropped
    Unconnected,
}

struct PropsState {
    working: PropertyMap,
    info: PropertyMap,
    published: Arc<PidProps>,
    dirty: bool,
    /// Capability changes requested by consumers, read by `reconfigure_output`
    negotiated: PropertyMap,
}

struct OutputState {
    link: LinkState,
    pending: VecDeque<Packet>,
    dests: Vec<Arc<PidInstance>>,
    eos: bool,
    max_units: usize,
    max_us: u64,
    clock: Option<(ClockType, u64)>,
    speed: f64,
    stats: PidStatistics,
}

impl OutputState {
    fn occupancy(&self) -> BufferOccupancy {
        let (units, duration_us) = match self.link {
            LinkState::Pending => (
                self.pending.len(),
                self.pending.iter().map(|p| p.duration_us()).sum(),
            ),
            _ => self
                .dests
                .iter()
                .filter_map(|d| d.fill_level())
                .fold((0, 0), |(u, d), (iu, id)| (u.max(iu), d.max(id))),
        };
        BufferOccupancy {
            units,
            max_units: self.max_units,
            duration_us,
            max_duration_us: self.max_us,
        }
    }
}

pub(crate) struct PidShared {
    pub(crate) id: PidId,
    name: RwLock<String>,
    pub(crate) owner: Weak<FilterNode>,
    owner_name: String,
    props: Mutex<PropsState>,
    state: Mutex<OutputState>,
    pub(crate) shared_out: AtomicUsize,
    removed: AtomicBool,
    blocking_disabled: bool,
}

/// Buffer limits given to new PIDs
#[derive(Debug, Clone, Copy)]
pub(crate) struct PidLimits {
    pub max_units: usize,
    pub max_us: u64,
    pub blocking_disabled: bool,
}

impl PidShared {
    pub(crate) fn new(owner: &Arc<FilterNode>, name: String, limits: PidLimits) -> Arc<Self> {
        Arc::new(Self {
            id: PidId::next(),
            name: RwLock::new(name),
            owner: Arc::downgrade(owner),
            owner_name: owner.name.clone(),
            props: Mutex::new(PropsState {
                working: PropertyMap::new(),
                info: PropertyMap::new(),
                published: Arc::new(PidProps::default()),
                dirty: false,
                negotiated: PropertyMap::new(),
            }),
            state: Mutex::new(OutputState {
                link: LinkState::Pending,
                pending: VecDeque::new(),
                dests: Vec::new(),
                eos: false,
                max_units: limits.max_units,
                max_us: limits.max_us,
                clock: None,
                speed: 1.0,
                stats: PidStatistics::default(),
            }),
            shared_out: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            blocking_disabled: limits.blocking_disabled,
        })
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub(crate) fn timescale(&self) -> u32 {
        self.props
            .lock()
            .working
            .get_id(PropertyId::Timescale)
            .and_then(|v| v.as_u32())
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMESCALE)
    }

    pub(crate) fn property(&self, key: &PropertyKey) -> Option<PropertyValue> {
        self.props.lock().working.get_key(key).cloned()
    }

    /// Current snapshot, publishing pending edits first
    pub(crate) fn published_props(&self) -> Arc<PidProps> {
        let mut props = self.props.lock();
        if props.dirty {
            let version = props.published.version + 1;
            props.published = Arc::new(PidProps {
                version,
                map: props.working.clone(),
            });
            props.dirty = false;
        }
        props.published.clone()
    }

    fn edit_props(&self, f: impl FnOnce(&mut PropertyMap)) {
        let mut props = self.props.lock();
        f(&mut props.working);
        props.dirty = true;
    }

    /// Info lookup: info map, then stream properties, then upstream producers
    fn info_upstream(&self, key: &PropertyKey, depth: usize) -> Option<PropertyValue> {
        {
            let props = self.props.lock();
            if let Some(v) = props.info.get_key(key).or_else(|| props.working.get_key(key)) {
                return Some(v.clone());
            }
        }
        if depth >= MAX_INFO_DEPTH {
            return None;
        }
        let owner = self.owner.upgrade()?;
        owner
            .input_instances()
            .iter()
            .find_map(|inst| inst.pid.info_upstream(key, depth + 1))
    }

    pub(crate) fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn destinations(&self) -> Vec<Arc<PidInstance>> {
        self.state.lock().dests.clone()
    }

    /// Attaches consumer instances; held packets are flushed to them in order
    pub(crate) fn connect(&self, insts: &[Arc<PidInstance>]) {
        let mut st = self.state.lock();
        let held: Vec<Packet> = if st.link == LinkState::Pending {
            st.pending.drain(..).collect()
        } else {
            Vec::new()
        };
        for inst in insts {
            for pck in &held {
                inst.enqueue(pck.clone());
            }
            if st.eos {
                inst.mark_eos();
            }
            st.dests.push(inst.clone());
        }
        st.link = LinkState::Connected;
    }

    /// Linking found no consumer: held packets are dropped
    pub(crate) fn mark_unconnected(&self) {
        let dropped = {
            let mut st = self.state.lock();
            if !st.dests.is_empty() {
                return;
            }
            st.link = LinkState::Unconnected;
            std::mem::take(&mut st.pending)
        };
        if !dropped.is_empty() {
            tracing::warn!(pid = %self.name(), filter = %self.owner_name, dropped = dropped.len(), "no consumer for PID, dropping held packets");
        }
        drop(dropped);
        self.wake_owner(Wake::Unblock);
    }

    /// Stops delivery to `inst`; with `keep_queue` the consumer still drains what it has
    pub(crate) fn detach(&self, inst: &Arc<PidInstance>, keep_queue: bool) {
        {
            let mut st = self.state.lock();
            st.dests.retain(|d| !Arc::ptr_eq(d, inst));
        }
        inst.detach(keep_queue);
        self.wake_owner(Wake::Unblock);
    }

    pub(crate) fn dispatch(self: &Arc<Self>, pck: Packet) {
        let meta = pck.meta();
        let size = pck.size();
        let timescale = pck.timescale();
        let mut consumers = Vec::new();
        {
            let mut st = self.state.lock();
            st.stats.record(&meta, size, timescale);
            if meta.clock_type != ClockType::None {
                st.clock = Some((meta.clock_type, meta.cts.or(meta.dts).unwrap_or(0)));
            }
            st.eos = false;
            match st.link {
                LinkState::Pending => st.pending.push_back(pck),
                LinkState::Unconnected => {
                    tracing::trace!(pid = %self.name(), "unconnected PID, packet dropped");
                }
                LinkState::Connected => {
                    for dest in &st.dests {
                        if dest.enqueue(pck.clone()) {
                            if let Some(consumer) = dest.consumer.upgrade() {
                                consumers.push(consumer);
                            }
                        }
                    }
                }
            }
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.counters.packets_out.fetch_add(1, Ordering::Relaxed);
            owner.counters.bytes_out.fetch_add(size as u64, Ordering::Relaxed);
            owner.mark_progress();
        }
        for consumer in consumers {
            consumer.wake(Wake::Data);
        }
    }

    pub(crate) fn set_eos(&self) {
        let mut consumers = Vec::new();
        {
            let mut st = self.state.lock();
            if st.eos {
                return;
            }
            st.eos = true;
            for dest in &st.dests {
                dest.mark_eos();
                if let Some(consumer) = dest.consumer.upgrade() {
                    consumers.push(consumer);
                }
            }
        }
        tracing::debug!(pid = %self.name(), filter = %self.owner_name, "EOS");
        if let Some(owner) = self.owner.upgrade() {
            owner.mark_progress();
        }
        for consumer in consumers {
            consumer.wake(Wake::Data);
        }
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.state.lock().eos
    }

    pub(crate) fn would_block(&self) -> bool {
        if self.blocking_disabled || self.is_removed() {
            return false;
        }
        self.state.lock().occupancy().is_full()
    }

    pub(crate) fn occupancy(&self) -> BufferOccupancy {
        self.state.lock().occupancy()
    }

    pub(crate) fn statistics(&self) -> PidStatistics {
        self.state.lock().stats
    }

    pub(crate) fn set_buffer_limits(&self, max_units: Option<usize>, max_us: Option<u64>) {
        {
            let mut st = self.state.lock();
            if let Some(units) = max_units {
                st.max_units = units;
            }
            if let Some(us) = max_us {
                st.max_us = us;
            }
        }
        self.wake_owner(Wake::Unblock);
    }

    pub(crate) fn set_speed(&self, speed: f64) {
        self.state.lock().speed = speed;
    }

    pub(crate) fn negotiate(&self, key: PropertyKey, value: PropertyValue) {
        self.props.lock().negotiated.insert(key, value);
    }

    /// Drains the pending capability requests
    pub(crate) fn take_negotiated(&self) -> PropertyMap {
        std::mem::take(&mut self.props.lock().negotiated)
    }

    /// Marks the PID removed; consumers get `configure(pid, true)` once drained
    pub(crate) fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_eos();
        for dest in self.destinations() {
            if let Some(consumer) = dest.consumer.upgrade() {
                consumer.push_config(ConfigRequest::Remove(dest.clone()));
            }
        }
    }

    pub(crate) fn wake_owner(&self, reason: Wake) {
        if let Some(owner) = self.owner.upgrade() {
            owner.wake(reason);
        }
    }

    /// Breaks packet/instance reference cycles at session teardown
    pub(crate) fn teardown(&self) {
        let (pending, dests) = {
            let mut st = self.state.lock();
            (std::mem::take(&mut st.pending), std::mem::take(&mut st.dests))
        };
        drop(pending);
        for dest in dests {
            dest.detach(false);
        }
    }
}

/// Producer-side handle of a PID
#[derive(Clone)]
pub struct OutputPid {
    pub(crate) shared: Arc<PidShared>,
}

impl fmt::Debug for OutputPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPid")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name())
            .field("filter", &self.shared.owner_name)
            .finish()
    }
}

impl OutputPid {
    /// Creates a new output PID owned by the filter the context belongs to
    pub fn new(ctx: &mut crate::filter::FilterContext<'_>) -> OutputPid {
        ctx.new_output_pid()
    }

    pub(crate) fn shared(&self) -> &Arc<PidShared> {
        &self.shared
    }

    pub fn id(&self) -> PidId {
        self.shared.id
    }

    pub fn direction(&self) -> PidDirection {
        PidDirection::Output
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.write() = name.into();
    }

    pub fn filter_name(&self) -> &str {
        &self.shared.owner_name
    }

    /// Sets (`Some`) or clears (`None`) a stream property
    pub fn set_property(&self, key: impl Into<PropertyKey>, value: Option<PropertyValue>) {
        let key = key.into();
        self.shared.edit_props(|map| {
            map.set(key, value);
        });
    }

    /// Sets an informational property; it never triggers consumer reconfiguration
    pub fn set_info(&self, key: impl Into<PropertyKey>, value: Option<PropertyValue>) {
        self.shared.props.lock().info.set(key, value);
    }

    pub fn get_property(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        self.shared.property(&key.into())
    }

    /// Info property, falling back to stream properties and then to upstream PIDs
    pub fn get_info(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        self.shared.info_upstream(&key.into(), 0)
    }

    pub fn properties(&self) -> PropertyMap {
        self.shared.props.lock().working.clone()
    }

    /// Replaces all stream properties with the ones of `source`
    pub fn copy_properties(&self, source: &InputPid) {
        let src = source.properties();
        self.shared.edit_props(|map| {
            map.reset();
            map.merge(&src);
        });
    }

    /// Merges the properties of `source` accepted by `filter`
    pub fn merge_properties(
        &self,
        source: &InputPid,
        filter: impl FnMut(&PropertyKey, &PropertyValue) -> bool,
    ) {
        let src = source.properties();
        self.shared.edit_props(|map| map.merge_filtered(&src, filter));
    }

    pub fn reset_properties(&self) {
        self.shared.edit_props(|map| map.reset());
    }

    /// Capability value a consumer asked for through `negotiate_cap`, if any
    pub fn negotiated_property(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        self.shared.props.lock().negotiated.get(key).cloned()
    }

    pub fn timescale(&self) -> u32 {
        self.shared.timescale()
    }

    /// Allocates a new packet on this PID
    pub fn new_packet(&self, size: usize) -> Result<Packet> {
        Packet::new_alloc(self, size)
    }

    pub fn set_max_buffer(&self, duration_us: u64) {
        self.shared.set_buffer_limits(None, Some(duration_us));
    }

    pub fn set_max_buffer_units(&self, units: usize) {
        self.shared.set_buffer_limits(Some(units), None);
    }

    pub fn buffer_occupancy(&self) -> BufferOccupancy {
        self.shared.occupancy()
    }

    /// True when the producer should stop sending until consumers catch up
    pub fn would_block(&self) -> bool {
        self.shared.would_block()
    }

    pub fn set_eos(&self) {
        self.shared.set_eos();
    }

    /// Producer declared end of stream
    pub fn is_eos(&self) -> bool {
        self.shared.is_eos()
    }

    /// Every connected consumer observed the end of stream
    pub fn has_seen_eos(&self) -> bool {
        let dests = self.shared.destinations();
        if dests.is_empty() {
            return self.is_eos();
        }
        dests.iter().all(|d| d.state.lock().eos_seen)
    }

    pub fn num_destinations(&self) -> usize {
        self.shared.state.lock().dests.len()
    }

    /// Shared packets created on this PID and not yet released
    pub fn shared_packets_out(&self) -> usize {
        self.shared.shared_out.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        let dests = self.shared.destinations();
        dests.is_empty() || dests.iter().any(|d| d.state.lock().playing)
    }

    pub fn playback_speed(&self) -> f64 {
        self.shared.state.lock().speed
    }

    pub fn clock_info(&self) -> Option<(ClockType, u64)> {
        self.shared.state.lock().clock
    }

    pub fn statistics(&self) -> PidStatistics {
        self.shared.statistics()
    }

    /// Sends an event downstream to every consumer
    pub fn send_event(&self, event: FilterEvent) {
        crate::session::events::send_downstream(&self.shared, event);
    }

    /// Removes the PID; consumers are notified with `configure(pid, true)`
    pub fn remove(&self) {
        self.shared.remove();
    }
}

// =============================================================================
// Consumer side
// =============================================================================

struct InstanceState {
    queue: VecDeque<Packet>,
    buffered_us: u64,
    eos_received: bool,
    eos_seen: bool,
    discard: bool,
    playing: bool,
    props: Arc<PidProps>,
    reconfig_pending: bool,
    detached: bool,
    clock_in_charge: bool,
    clock: Option<(ClockType, u64)>,
    first_cts: Option<u64>,
    stats: PidStatistics,
}

/// One consumer's view of an output PID
pub(crate) struct PidInstance {
    pub(crate) pid: Arc<PidShared>,
    pub(crate) consumer: Weak<FilterNode>,
    state: Mutex<InstanceState>,
}

impl PidInstance {
    pub(crate) fn new(pid: &Arc<PidShared>, consumer: &Arc<FilterNode>) -> Arc<Self> {
        Arc::new(Self {
            pid: pid.clone(),
            consumer: Arc::downgrade(consumer),
            state: Mutex::new(InstanceState {
                queue: VecDeque::new(),
                buffered_us: 0,
                eos_received: false,
                eos_seen: false,
                discard: false,
                playing: true,
                props: pid.published_props(),
                reconfig_pending: false,
                detached: false,
                clock_in_charge: false,
                clock: None,
                first_cts: None,
                stats: PidStatistics::default(),
            }),
        })
    }

    /// Queues a packet; false when the instance does not accept data
    fn enqueue(&self, pck: Packet) -> bool {
        let mut st = self.state.lock();
        if st.detached || st.discard {
            return false;
        }
        if st.eos_received {
            st.eos_received = false;
            st.eos_seen = false;
        }
        if st.first_cts.is_none() {
            st.first_cts = pck.cts();
        }
        st.buffered_us += pck.duration_us();
        st.queue.push_back(pck);
        true
    }

    fn mark_eos(&self) {
        self.state.lock().eos_received = true;
    }

    fn detach(&self, keep_queue: bool) {
        let dropped = {
            let mut st = self.state.lock();
            st.detached = true;
            if keep_queue {
                VecDeque::new()
            } else {
                st.buffered_us = 0;
                std::mem::take(&mut st.queue)
            }
        };
        drop(dropped);
    }

    /// (units, duration) when the instance counts for backpressure
    fn fill_level(&self) -> Option<(usize, u64)> {
        let st = self.state.lock();
        if st.discard || st.detached {
            None
        } else {
            Some((st.queue.len(), st.buffered_us))
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub(crate) fn eos_flags(&self) -> (bool, bool) {
        let st = self.state.lock();
        (st.eos_received && st.queue.is_empty(), st.eos_seen)
    }

    /// Accepts the snapshot of the head packet (or the current PID properties) as configured
    pub(crate) fn accept_reconfig(&self) -> Arc<PidProps> {
        let mut st = self.state.lock();
        let props = st
            .queue
            .front()
            .and_then(|p| p.pid_props())
            .filter(|p| p.version > st.props.version)
            .unwrap_or_else(|| self.pid.published_props());
        st.props = props.clone();
        st.reconfig_pending = false;
        props
    }

    /// Drops every queued packet (STOP, immediate abort)
    pub(crate) fn flush(&self) -> usize {
        let dropped = {
            let mut st = self.state.lock();
            st.buffered_us = 0;
            std::mem::take(&mut st.queue)
        };
        let count = dropped.len();
        drop(dropped);
        if count > 0 {
            self.pid.wake_owner(Wake::Unblock);
        }
        count
    }

    pub(crate) fn set_playing(&self, playing: bool) {
        let mut st = self.state.lock();
        st.playing = playing;
        if playing {
            st.eos_received = false;
            st.eos_seen = false;
        }
    }

    pub(crate) fn statistics(&self) -> PidStatistics {
        self.state.lock().stats
    }

    /// Moves the queued packets out, keeping their order
    pub(crate) fn take_queue(&self) -> VecDeque<Packet> {
        let mut st = self.state.lock();
        st.buffered_us = 0;
        std::mem::take(&mut st.queue)
    }

    /// Queues packets taken from another instance of the same PID
    pub(crate) fn prefill(&self, packets: VecDeque<Packet>) {
        for pck in packets {
            self.enqueue(pck);
        }
    }

    pub(crate) fn set_discard(&self, discard: bool) {
        let dropped = {
            let mut st = self.state.lock();
            st.discard = discard;
            if discard {
                st.buffered_us = 0;
                std::mem::take(&mut st.queue)
            } else {
                VecDeque::new()
            }
        };
        drop(dropped);
        self.pid.wake_owner(Wake::Unblock);
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.state.lock().playing
    }
}

/// Consumer-side handle of a PID
#[derive(Clone)]
pub struct InputPid {
    pub(crate) inst: Arc<PidInstance>,
}

impl fmt::Debug for InputPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPid")
            .field("id", &self.inst.pid.id)
            .field("name", &self.inst.pid.name())
            .field("source", &self.inst.pid.owner_name)
            .finish()
    }
}

impl PartialEq for InputPid {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inst, &other.inst)
    }
}

impl InputPid {
    pub(crate) fn new(inst: Arc<PidInstance>) -> Self {
        Self { inst }
    }

    pub fn id(&self) -> PidId {
        self.inst.pid.id
    }

    pub fn direction(&self) -> PidDirection {
        PidDirection::Input
    }

    pub fn name(&self) -> String {
        self.inst.pid.name()
    }

    /// Name of the producing filter
    pub fn source_filter(&self) -> &str {
        &self.inst.pid.owner_name
    }

    /// Property of the configured snapshot
    pub fn get_property(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        self.inst.state.lock().props.map.get(key).cloned()
    }

    pub fn properties(&self) -> PropertyMap {
        self.inst.state.lock().props.map.clone()
    }

    pub fn get_info(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        self.inst.pid.info_upstream(&key.into(), 0)
    }

    pub fn timescale(&self) -> u32 {
        self.get_property(PropertyId::Timescale)
            .and_then(|v| v.as_u32())
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMESCALE)
    }

    /// Head packet without removing it; `None` when empty, at EOS or awaiting reconfiguration
    pub fn get_packet(&self) -> Option<Packet> {
        let mut request_reconfig = false;
        let mut clocks = 0u64;
        let head = {
            let mut st = self.inst.state.lock();
            loop {
                let Some(head) = st.queue.front() else {
                    if st.eos_received {
                        st.eos_seen = true;
                    }
                    break None;
                };
                let meta = head.meta();
                if meta.clock_type != ClockType::None && head.size() == 0 && !st.clock_in_charge {
                    st.clock = Some((meta.clock_type, meta.cts.or(meta.dts).unwrap_or(0)));
                    if let Some(clock_pck) = st.queue.pop_front() {
                        st.buffered_us = st.buffered_us.saturating_sub(clock_pck.duration_us());
                        // counted, but kept out of the timing statistics
                        st.stats.packets += 1;
                        clocks += 1;
                    }
                    continue;
                }
                if head.props_version() > st.props.version {
                    if !st.reconfig_pending {
                        st.reconfig_pending = true;
                        request_reconfig = true;
                    }
                    break None;
                }
                break Some(head.clone());
            }
        };
        if clocks > 0 {
            if let Some(consumer) = self.inst.consumer.upgrade() {
                consumer.counters.packets_in.fetch_add(clocks, Ordering::Relaxed);
            }
            self.inst.pid.wake_owner(Wake::Unblock);
        }
        if request_reconfig {
            if let Some(consumer) = self.inst.consumer.upgrade() {
                consumer.push_config(ConfigRequest::Reconfigure(self.inst.clone()));
            }
        }
        head
    }

    /// Removes and releases the head packet; no-op while the head waits for reconfiguration
    pub fn drop_packet(&self) {
        let dropped = {
            let mut st = self.inst.state.lock();
            let awaiting_reconfig = st.reconfig_pending
                || st
                    .queue
                    .front()
                    .is_some_and(|head| head.props_version() > st.props.version);
            if awaiting_reconfig {
                return;
            }
            let Some(pck) = st.queue.pop_front() else {
                return;
            };
            let meta = pck.meta();
            let size = pck.size();
            st.buffered_us = st.buffered_us.saturating_sub(pck.duration_us());
            st.stats.record(&meta, size, pck.timescale());
            (pck, size)
        };
        let (pck, size) = dropped;
        drop(pck);
        if let Some(consumer) = self.inst.consumer.upgrade() {
            consumer.counters.packets_in.fetch_add(1, Ordering::Relaxed);
            consumer.counters.bytes_in.fetch_add(size as u64, Ordering::Relaxed);
            consumer.mark_progress();
        }
        self.inst.pid.wake_owner(Wake::Unblock);
    }

    pub fn packet_count(&self) -> usize {
        self.inst.queue_len()
    }

    pub fn first_packet_cts(&self) -> Option<u64> {
        self.inst.state.lock().first_cts
    }

    /// Producer declared end of stream and the queue is drained
    pub fn is_eos(&self) -> bool {
        self.inst.eos_flags().0
    }

    /// This consumer observed the end of stream through `get_packet`
    pub fn has_seen_eos(&self) -> bool {
        self.inst.eos_flags().1
    }

    /// Stops (or resumes) delivery to this consumer without disconnecting
    pub fn set_discard(&self, discard: bool) {
        self.inst.set_discard(discard);
    }

    pub fn is_discarding(&self) -> bool {
        self.inst.state.lock().discard
    }

    /// Requests a capability change from the producer
    ///
    /// Fails with `NotSupported` when neither the producer nor any filter chain can deliver
    /// the value; otherwise the change is applied asynchronously (in place through
    /// `reconfigure_output`, or by inserting an adapter chain).
    pub fn negotiate_cap(&self, key: impl Into<PropertyKey>, value: PropertyValue) -> Result<()> {
        crate::session::linking::request_negotiation(&self.inst, key.into(), value)
    }

    /// Sends an event upstream to the producer
    pub fn send_event(&self, event: FilterEvent) {
        crate::session::events::send_upstream(&self.inst, event);
    }

    /// Sets the producer's buffer duration limit
    pub fn set_max_buffer(&self, duration_us: u64) {
        self.inst.pid.set_buffer_limits(None, Some(duration_us));
    }

    /// Fill level of this consumer's queue against the producer's limits
    pub fn buffer_occupancy(&self) -> BufferOccupancy {
        let (max_units, max_us) = {
            let st = self.inst.pid.state.lock();
            (st.max_units, st.max_us)
        };
        let st = self.inst.state.lock();
        BufferOccupancy {
            units: st.queue.len(),
            max_units,
            duration_us: st.buffered_us,
            max_duration_us: max_us,
        }
    }

    pub fn buffer_full(&self) -> bool {
        self.buffer_occupancy().is_full()
    }

    /// Input PIDs never block their consumer
    pub fn would_block(&self) -> bool {
        false
    }

    /// With `filter_in_charge`, clock-reference packets are handed to the filter instead of
    /// being consumed by the engine
    pub fn set_clock_mode(&self, filter_in_charge: bool) {
        self.inst.state.lock().clock_in_charge = filter_in_charge;
    }

    pub fn clock_info(&self) -> Option<(ClockType, u64)> {
        self.inst.state.lock().clock
    }

    pub fn is_playing(&self) -> bool {
        self.inst.is_playing()
    }

    pub fn statistics(&self) -> PidStatistics {
        self.inst.statistics()
    }

    /// Buffered duration in microseconds
    pub fn buffer_duration_us(&self) -> u64 {
        self.inst.state.lock().buffered_us
    }
}

/// Converts a timestamp in `timescale` units to microseconds
pub fn to_us(value: u64, timescale: u32) -> u64 {
    rescale(value, timescale, 1_000_000)
}
