//! Filter packets
//!
//! A [`Packet`] is the unit of data flowing through a PID. It is created against an output
//! PID in one of three payload modes:
//!
//! - **Allocated**: engine-owned buffer, writable until [`Packet::send`]
//! - **Shared**: caller-owned buffer; the release callback runs exactly once, when the last
//!   reference (including slices and forwarded packets built on it) is gone
//! - **Slice**: read-only view onto another packet, which stays alive as long as the slice
//!
//! Reference counting is the `Arc` inside the handle: [`Packet::add_ref`] clones it,
//! [`Packet::unref`] drops it. Sending or discarding is irreversible and happens once;
//! packets received on an input PID are read-only.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pid::{OutputPid, PidProps, PidShared};
use crate::props::{PropertyKey, PropertyMap, PropertyValue};

/// Random access point class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SapType {
    #[default]
    None,
    Sap1,
    Sap2,
    Sap3,
    Sap4,
    /// SAP 4 with prolepsis (roll recovery)
    Sap4Prol,
}

impl SapType {
    pub fn is_rap(&self) -> bool {
        !matches!(self, SapType::None)
    }
}

/// Clock reference carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockType {
    #[default]
    None,
    Pcr,
    PcrDiscontinuity,
}

/// Payload ownership of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Allocated,
    Shared,
    Slice,
}

/// Timing and flag metadata of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub dts: Option<u64>,
    pub cts: Option<u64>,
    pub duration: u32,
    pub sap: SapType,
    pub frame_start: bool,
    pub frame_end: bool,
    /// 0 progressive, 1 top field first, 2 bottom field first
    pub interlaced: u8,
    pub corrupted: bool,
    /// Packet is only sent for decoder warm-up after a seek, not for presentation
    pub seek: bool,
    pub roll: i16,
    pub crypt_flags: u8,
    pub clock_type: ClockType,
    pub carousel_version: u8,
    pub seq_num: u32,
    pub dependency_flags: u8,
    pub byte_offset: Option<u64>,
}

impl Default for PacketMeta {
    fn default() -> Self {
        Self {
            dts: None,
            cts: None,
            duration: 0,
            sap: SapType::None,
            frame_start: true,
            frame_end: true,
            interlaced: 0,
            corrupted: false,
            seek: false,
            roll: 0,
            crypt_flags: 0,
            clock_type: ClockType::None,
            carousel_version: 0,
            seq_num: 0,
            dependency_flags: 0,
            byte_offset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Building,
    Sent,
    Discarded,
}

enum PacketData {
    Building(Vec<u8>),
    Frozen(Bytes),
}

impl PacketData {
    fn len(&self) -> usize {
        match self {
            PacketData::Building(v) => v.len(),
            PacketData::Frozen(b) => b.len(),
        }
    }

    fn bytes(&self) -> Bytes {
        match self {
            PacketData::Building(v) => Bytes::copy_from_slice(v),
            PacketData::Frozen(b) => b.clone(),
        }
    }
}

struct PacketBody {
    stage: Stage,
    meta: PacketMeta,
    data: PacketData,
    props: Option<PropertyMap>,
    pid_props: Option<Arc<PidProps>>,
}

/// Runs the release callback of a shared packet when the last reference is gone
struct SharedRelease {
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pid: Option<Arc<PidShared>>,
}

impl Drop for SharedRelease {
    fn drop(&mut self) {
        if let Some(pid) = &self.pid {
            pid.shared_out.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(release) = self.release.get_mut().take() {
            release();
        }
    }
}

enum Payload {
    Allocated,
    /// Runs the release callback when the last reference goes
    Shared { _release: SharedRelease },
    /// Keeps the parent buffer alive
    Slice { _parent: Packet },
}

struct PacketInner {
    pid: Option<Arc<PidShared>>,
    timescale: u32,
    body: RwLock<PacketBody>,
    payload: Payload,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        let body = self.body.get_mut();
        if body.stage == Stage::Building {
            if let Some(pid) = &self.pid {
                tracing::trace!(pid = %pid.name(), size = body.data.len(), "packet released before send, discarded");
            }
        }
    }
}

/// Reference-counted handle to a filter packet
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    fn build(pid: Option<Arc<PidShared>>, timescale: u32, data: PacketData, payload: Payload) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                pid,
                timescale,
                body: RwLock::new(PacketBody {
                    stage: Stage::Building,
                    meta: PacketMeta::default(),
                    data,
                    props: None,
                    pid_props: None,
                }),
                payload,
            }),
        }
    }

    /// Allocates a zeroed, writable buffer of `size` bytes against `pid`
    pub fn new_alloc(pid: &OutputPid, size: usize) -> Result<Packet> {
        let shared = pid.shared();
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|e| Error::OutOfMemory(format!("packet of {} bytes: {}", size, e)))?;
        buf.resize(size, 0);
        Ok(Self::build(
            Some(shared.clone()),
            shared.timescale(),
            PacketData::Building(buf),
            Payload::Allocated,
        ))
    }

    /// Wraps a caller-owned buffer; `release` runs once all references are gone
    pub fn new_shared(
        pid: &OutputPid,
        data: impl Into<Bytes>,
        release: impl FnOnce() + Send + 'static,
    ) -> Result<Packet> {
        let shared = pid.shared();
        shared.shared_out.fetch_add(1, Ordering::AcqRel);
        Ok(Self::build(
            Some(shared.clone()),
            shared.timescale(),
            PacketData::Frozen(data.into()),
            Payload::Shared {
                _release: SharedRelease {
                    release: Mutex::new(Some(Box::new(release))),
                    pid: Some(shared.clone()),
                },
            },
        ))
    }

    /// Read-only `[offset, offset + length)` view onto `source`
    pub fn new_ref(pid: &OutputPid, source: &Packet, offset: usize, length: usize) -> Result<Packet> {
        let (data, meta, props) = source.snapshot();
        let end = offset
            .checked_add(length)
            .ok_or_else(|| Error::range(offset, length, data.len()))?;
        if end > data.len() {
            return Err(Error::range(offset, length, data.len()));
        }
        let shared = pid.shared();
        let pck = Self::build(
            Some(shared.clone()),
            shared.timescale(),
            PacketData::Frozen(data.slice(offset..end)),
            Payload::Slice {
                _parent: source.clone(),
            },
        );
        {
            let mut body = pck.inner.body.write();
            body.meta = meta;
            body.props = props;
        }
        Ok(pck)
    }

    /// Zero-copy packet on `pid` carrying the payload, timing and properties of `source`
    pub fn forward(pid: &OutputPid, source: &Packet) -> Result<Packet> {
        let size = source.size();
        Self::new_ref(pid, source, 0, size)
    }

    /// Independent, writable deep copy of `source` on `pid`
    pub fn copy(pid: &OutputPid, source: &Packet) -> Result<Packet> {
        let shared = pid.shared();
        Self::copy_into(Some(shared.clone()), shared.timescale(), source)
    }

    /// Deep copy not attached to any PID; it can be inspected and reused but never sent
    pub fn dangling_copy(source: &Packet) -> Result<Packet> {
        Self::copy_into(None, source.timescale(), source)
    }

    fn copy_into(pid: Option<Arc<PidShared>>, timescale: u32, source: &Packet) -> Result<Packet> {
        let (data, meta, props) = source.snapshot();
        let mut buf = Vec::new();
        buf.try_reserve_exact(data.len())
            .map_err(|e| Error::OutOfMemory(format!("packet copy of {} bytes: {}", data.len(), e)))?;
        buf.extend_from_slice(&data);
        let pck = Self::build(pid, timescale, PacketData::Building(buf), Payload::Allocated);
        {
            let mut body = pck.inner.body.write();
            body.meta = meta;
            body.props = props;
        }
        Ok(pck)
    }

    /// Copy of `source`, reusing `cache` when nobody else holds it
    ///
    /// Returns the same instance as `cache` when it is still unsent, allocated, attached to
    /// the same PID and not referenced elsewhere; callers check with [`Packet::ptr_eq`].
    pub fn clone_reusing(
        pid: Option<&OutputPid>,
        source: &Packet,
        cache: Option<&Packet>,
    ) -> Result<Packet> {
        if let Some(cached) = cache {
            if cached.is_reusable_for(pid) {
                let (data, meta, props) = source.snapshot();
                let mut body = cached.inner.body.write();
                if let PacketData::Building(buf) = &mut body.data {
                    buf.clear();
                    buf.extend_from_slice(&data);
                }
                body.meta = meta;
                body.props = props;
                drop(body);
                return Ok(cached.clone());
            }
        }
        match pid {
            Some(pid) => Self::copy(pid, source),
            None => Self::dangling_copy(source),
        }
    }

    fn is_reusable_for(&self, pid: Option<&OutputPid>) -> bool {
        if Arc::strong_count(&self.inner) != 1 || !matches!(self.inner.payload, Payload::Allocated) {
            return false;
        }
        let same_pid = match (&self.inner.pid, pid) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b.shared()),
            (None, None) => true,
            _ => false,
        };
        same_pid && self.inner.body.read().stage == Stage::Building
    }

    /// Copies the per-packet property overlay of `src` into `dst`
    pub fn merge_properties(src: &Packet, dst: &Packet) -> Result<()> {
        let overlay = src.inner.body.read().props.clone();
        let Some(overlay) = overlay else {
            return Ok(());
        };
        let mut body = dst.writable_body()?;
        body.props.get_or_insert_with(PropertyMap::new).merge(&overlay);
        Ok(())
    }

    /// Retains an extra reference
    pub fn add_ref(&self) -> Packet {
        self.clone()
    }

    /// Releases a reference; dropping the last one of an unsent packet discards it
    pub fn unref(self) {
        drop(self)
    }

    /// Number of live references to this packet
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles refer to the same packet
    pub fn ptr_eq(a: &Packet, b: &Packet) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Publishes the packet into its PID; the producer loses write access
    pub fn send(&self) -> Result<()> {
        let pid = {
            let mut body = self.inner.body.write();
            if body.stage != Stage::Building {
                return Err(Error::AlreadyFinalized);
            }
            let pid = self
                .inner
                .pid
                .clone()
                .ok_or_else(|| Error::BadParam("dangling packet cannot be sent".into()))?;
            if let PacketData::Building(buf) = &mut body.data {
                let frozen = Bytes::from(std::mem::take(buf));
                body.data = PacketData::Frozen(frozen);
            }
            body.stage = Stage::Sent;
            body.pid_props = Some(pid.published_props());
            pid
        };
        pid.dispatch(self.clone());
        Ok(())
    }

    /// Drops an unsent packet without delivering it
    pub fn discard(&self) -> Result<()> {
        let mut body = self.inner.body.write();
        if body.stage != Stage::Building {
            return Err(Error::AlreadyFinalized);
        }
        body.stage = Stage::Discarded;
        Ok(())
    }

    /// Shrinks the payload of an unsent packet; growing fails
    pub fn truncate(&self, size: usize) -> Result<()> {
        let mut body = self.writable_body()?;
        let current = body.data.len();
        if size > current {
            return Err(Error::range(0, size, current));
        }
        match &mut body.data {
            PacketData::Building(buf) => buf.truncate(size),
            PacketData::Frozen(bytes) => bytes.truncate(size),
        }
        Ok(())
    }

    /// Writes `bytes` at `offset` into an allocated, unsent packet
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.with_data_mut(|buf| {
            let end = offset
                .checked_add(bytes.len())
                .filter(|end| *end <= buf.len())
                .ok_or_else(|| Error::range(offset, bytes.len(), buf.len()))?;
            buf[offset..end].copy_from_slice(bytes);
            Ok(())
        })?
    }

    /// Mutable access to the buffer of an allocated, unsent packet
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut body = self.writable_body()?;
        match &mut body.data {
            PacketData::Building(buf) => Ok(f(buf)),
            PacketData::Frozen(_) => Err(Error::NotSupported(
                "shared and reference packets are read-only".into(),
            )),
        }
    }

    /// Payload bytes; zero-copy once the packet is sent
    pub fn data(&self) -> Bytes {
        self.inner.body.read().data.bytes()
    }

    pub fn size(&self) -> usize {
        self.inner.body.read().data.len()
    }

    pub fn timescale(&self) -> u32 {
        self.inner.timescale
    }

    pub fn payload_mode(&self) -> PayloadMode {
        match self.inner.payload {
            Payload::Allocated => PayloadMode::Allocated,
            Payload::Shared { .. } => PayloadMode::Shared,
            Payload::Slice { .. } => PayloadMode::Slice,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.inner.body.read().stage == Stage::Sent
    }

    pub fn is_discarded(&self) -> bool {
        self.inner.body.read().stage == Stage::Discarded
    }

    /// True when the packet was built without a PID
    pub fn is_dangling(&self) -> bool {
        self.inner.pid.is_none()
    }

    pub fn meta(&self) -> PacketMeta {
        self.inner.body.read().meta
    }

    pub fn dts(&self) -> Option<u64> {
        self.meta().dts
    }

    pub fn cts(&self) -> Option<u64> {
        self.meta().cts
    }

    pub fn duration(&self) -> u32 {
        self.meta().duration
    }

    pub fn sap(&self) -> SapType {
        self.meta().sap
    }

    /// Duration in microseconds, according to the packet timescale
    pub fn duration_us(&self) -> u64 {
        rescale(self.duration() as u64, self.timescale(), 1_000_000)
    }

    fn writable_body(&self) -> Result<parking_lot::RwLockWriteGuard<'_, PacketBody>> {
        let body = self.inner.body.write();
        match body.stage {
            Stage::Building => Ok(body),
            Stage::Sent => Err(Error::DetachedPacket("packet already sent".into())),
            Stage::Discarded => Err(Error::DetachedPacket("packet discarded".into())),
        }
    }

    fn update(&self, f: impl FnOnce(&mut PacketMeta)) -> Result<()> {
        let mut body = self.writable_body()?;
        f(&mut body.meta);
        Ok(())
    }

    /// Replaces the whole metadata block of an unsent packet
    pub fn set_meta(&self, meta: PacketMeta) -> Result<()> {
        self.update(|m| *m = meta)
    }

    pub fn set_dts(&self, dts: Option<u64>) -> Result<()> {
        self.update(|m| m.dts = dts)
    }

    pub fn set_cts(&self, cts: Option<u64>) -> Result<()> {
        self.update(|m| m.cts = cts)
    }

    pub fn set_duration(&self, duration: u32) -> Result<()> {
        self.update(|m| m.duration = duration)
    }

    pub fn set_sap(&self, sap: SapType) -> Result<()> {
        self.update(|m| m.sap = sap)
    }

    pub fn set_framing(&self, start: bool, end: bool) -> Result<()> {
        self.update(|m| {
            m.frame_start = start;
            m.frame_end = end;
        })
    }

    pub fn set_interlaced(&self, mode: u8) -> Result<()> {
        self.update(|m| m.interlaced = mode)
    }

    pub fn set_corrupted(&self, corrupted: bool) -> Result<()> {
        self.update(|m| m.corrupted = corrupted)
    }

    pub fn set_seek_flag(&self, seek: bool) -> Result<()> {
        self.update(|m| m.seek = seek)
    }

    pub fn set_roll(&self, roll: i16) -> Result<()> {
        self.update(|m| m.roll = roll)
    }

    pub fn set_crypt_flags(&self, flags: u8) -> Result<()> {
        self.update(|m| m.crypt_flags = flags)
    }

    pub fn set_clock_type(&self, clock: ClockType) -> Result<()> {
        self.update(|m| m.clock_type = clock)
    }

    pub fn set_carousel_version(&self, version: u8) -> Result<()> {
        self.update(|m| m.carousel_version = version)
    }

    pub fn set_seq_num(&self, seq: u32) -> Result<()> {
        self.update(|m| m.seq_num = seq)
    }

    pub fn set_dependency_flags(&self, flags: u8) -> Result<()> {
        self.update(|m| m.dependency_flags = flags)
    }

    pub fn set_byte_offset(&self, offset: Option<u64>) -> Result<()> {
        self.update(|m| m.byte_offset = offset)
    }

    /// Sets or clears a per-packet property overlay entry
    pub fn set_property(&self, key: impl Into<PropertyKey>, value: Option<PropertyValue>) -> Result<()> {
        let mut body = self.writable_body()?;
        body.props.get_or_insert_with(PropertyMap::new).set(key, value);
        Ok(())
    }

    /// Per-packet property, falling back to the PID properties the packet was sent with
    pub fn get_property(&self, key: impl Into<PropertyKey>) -> Option<PropertyValue> {
        let key = key.into();
        let body = self.inner.body.read();
        if let Some(v) = body.props.as_ref().and_then(|p| p.get_key(&key)) {
            return Some(v.clone());
        }
        if let Some(snapshot) = &body.pid_props {
            return snapshot.map.get_key(&key).cloned();
        }
        drop(body);
        self.inner
            .pid
            .as_ref()
            .and_then(|pid| pid.property(&key))
    }

    /// Copy of the per-packet property overlay, if any
    pub fn properties(&self) -> Option<PropertyMap> {
        self.inner.body.read().props.clone()
    }

    fn snapshot(&self) -> (Bytes, PacketMeta, Option<PropertyMap>) {
        let body = self.inner.body.read();
        (body.data.bytes(), body.meta, body.props.clone())
    }

    /// Version of the PID property snapshot this packet was sent with
    pub(crate) fn props_version(&self) -> u64 {
        self.inner
            .body
            .read()
            .pid_props
            .as_ref()
            .map(|p| p.version)
            .unwrap_or(0)
    }

    pub(crate) fn pid_props(&self) -> Option<Arc<PidProps>> {
        self.inner.body.read().pid_props.clone()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.inner.body.read();
        f.debug_struct("Packet")
            .field("size", &body.data.len())
            .field("stage", &body.stage)
            .field("mode", &self.payload_mode())
            .field("dts", &body.meta.dts)
            .field("cts", &body.meta.cts)
            .field("duration", &body.meta.duration)
            .finish()
    }
}

/// Rescales `value` from timescale `from` to timescale `to`
pub fn rescale(value: u64, from: u32, to: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    (value as u128 * to as u128 / from as u128) as u64
}
