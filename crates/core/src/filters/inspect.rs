//! Inspection sink
//!
//! Accepts any stream, counts packets and bytes per input PID and keeps the last properties
//! it was configured with. Hosts read the result through a shared [`InspectReport`]; with
//! `log` set, a text dump is also written to that URL once every input is done.

use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::caps::Caps;
use crate::error::{Error, Result};
use crate::filter::{ArgDescriptor, Filter, FilterArgs, FilterContext, FilterDescriptor, ProcessStatus};
use crate::io::IoMode;
use crate::pid::{to_us, InputPid, PidId};
use crate::props::{PropertyId, PropertyKind, PropertyMap, PropertyValue};

/// What was seen on one input PID
#[derive(Debug, Clone, Default)]
pub struct PidRecord {
    pub pid: String,
    pub source: String,
    pub packets: u64,
    pub bytes: u64,
    pub timescale: u32,
    pub first_cts: Option<u64>,
    pub last_cts: Option<u64>,
    pub reconfigs: u32,
    pub eos: bool,
    pub removed: bool,
    pub props: PropertyMap,
}

impl PidRecord {
    /// Span between the first and last CTS in microseconds
    pub fn duration_us(&self) -> u64 {
        match (self.first_cts, self.last_cts) {
            (Some(first), Some(last)) if last >= first => to_us(last - first, self.timescale),
            _ => 0,
        }
    }
}

/// Shared, cloneable view on what an inspect filter recorded
#[derive(Debug, Clone, Default)]
pub struct InspectReport {
    records: Arc<Mutex<Vec<PidRecord>>>,
}

impl InspectReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PidRecord> {
        self.records.lock().clone()
    }

    pub fn record(&self, pid: &str) -> Option<PidRecord> {
        self.records.lock().iter().find(|r| r.pid == pid).cloned()
    }

    pub fn total_packets(&self) -> u64 {
        self.records.lock().iter().map(|r| r.packets).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.lock().iter().map(|r| r.bytes).sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for r in self.records.lock().iter() {
            let _ = writeln!(
                out,
                "PID {} from {}: {} packets, {} bytes, {} us{}",
                r.pid,
                r.source,
                r.packets,
                r.bytes,
                r.duration_us(),
                if r.eos { ", eos" } else { "" }
            );
            for (key, value) in r.props.iter() {
                let _ = writeln!(out, "  {}: {}", key, value);
            }
        }
        out
    }

    fn push(&self, record: PidRecord) -> usize {
        let mut records = self.records.lock();
        records.push(record);
        records.len() - 1
    }

    fn update<R>(&self, slot: usize, f: impl FnOnce(&mut PidRecord) -> R) -> Option<R> {
        self.records.lock().get_mut(slot).map(f)
    }
}

struct Tracked {
    pid: InputPid,
    slot: usize,
    done: bool,
}

/// `inspect` filter
pub struct Inspect {
    report: InspectReport,
    log: Option<String>,
    max_packets: u64,
    inputs: Vec<Tracked>,
    logged: bool,
}

impl Inspect {
    pub fn new(args: &FilterArgs, report: InspectReport) -> Result<Self> {
        Ok(Self {
            report,
            log: args.get_str("log").filter(|s| !s.is_empty()).map(str::to_string),
            max_packets: args.get_u64("max").unwrap_or(0),
            inputs: Vec::new(),
            logged: false,
        })
    }

    fn tracked(&self, id: PidId) -> Option<usize> {
        self.inputs.iter().position(|t| t.pid.id() == id)
    }

    fn write_log(&mut self, ctx: &FilterContext<'_>) -> Result<()> {
        let Some(url) = self.log.as_deref() else {
            return Ok(());
        };
        if self.logged {
            return Ok(());
        }
        self.logged = true;
        let text = self.report.render();
        let mut handle = ctx.io().open(url, IoMode::Write)?;
        let mut rest = text.as_bytes();
        while !rest.is_empty() {
            let n = handle.write(rest)?;
            if n == 0 {
                return Err(Error::ServiceError(format!("short write on '{}'", url)));
            }
            rest = &rest[n..];
        }
        handle.close()
    }
}

impl Filter for Inspect {
    fn configure(&mut self, _ctx: &mut FilterContext<'_>, pid: &InputPid, is_remove: bool) -> Result<()> {
        match (self.tracked(pid.id()), is_remove) {
            (Some(idx), true) => {
                let tracked = self.inputs.remove(idx);
                self.report.update(tracked.slot, |r| r.removed = true);
            }
            (None, true) => {}
            (Some(idx), false) => {
                let slot = self.inputs[idx].slot;
                self.report.update(slot, |r| {
                    r.reconfigs += 1;
                    r.timescale = pid.timescale();
                    r.props = pid.properties();
                });
            }
            (None, false) => {
                let slot = self.report.push(PidRecord {
                    pid: pid.name(),
                    source: pid.source_filter().to_string(),
                    timescale: pid.timescale(),
                    props: pid.properties(),
                    ..Default::default()
                });
                tracing::debug!(pid = %pid.name(), source = %pid.source_filter(), "inspecting");
                self.inputs.push(Tracked {
                    pid: pid.clone(),
                    slot,
                    done: false,
                });
            }
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        let max = self.max_packets;
        for tracked in self.inputs.iter_mut().filter(|t| !t.done) {
            while let Some(pck) = tracked.pid.get_packet() {
                let data_len = pck.size() as u64;
                let cts = pck.cts();
                let count = self.report.update(tracked.slot, |r| {
                    r.packets += 1;
                    r.bytes += data_len;
                    if let Some(cts) = cts {
                        r.first_cts.get_or_insert(cts);
                        r.last_cts = Some(cts);
                    }
                    r.packets
                });
                tracked.pid.drop_packet();
                if max > 0 && count.unwrap_or(0) >= max {
                    tracked.pid.set_discard(true);
                    tracked.done = true;
                    break;
                }
            }
            if tracked.pid.is_eos() {
                self.report.update(tracked.slot, |r| r.eos = true);
                tracked.done = true;
            }
        }
        if !self.inputs.is_empty() && self.inputs.iter().all(|t| t.done) {
            self.write_log(ctx)?;
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    }

    fn update_arg(&mut self, _ctx: &mut FilterContext<'_>, name: &str, value: &PropertyValue) -> Result<()> {
        match name {
            // applies to packets counted from now on
            "max" => self.max_packets = value.as_u64().unwrap_or(0),
            "log" if !self.logged => {
                self.log = value.as_str().filter(|s| !s.is_empty()).map(str::to_string);
            }
            _ => return Err(Error::NotSupported(format!("inspect cannot change '{}' now", name))),
        }
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut FilterContext<'_>) {
        if let Err(e) = self.write_log(ctx) {
            tracing::warn!("inspect log not written: {}", e);
        }
    }
}

/// Inspect descriptor reporting into `report`
pub fn descriptor_with_report(report: InspectReport) -> FilterDescriptor {
    FilterDescriptor::native("inspect", move |args| Inspect::new(args, report.clone()))
        .with_description("Counts packets of any stream")
        .with_caps(Caps::builder().input_any(PropertyId::StreamType).build())
        .with_max_inputs(None)
        .with_arg(
            ArgDescriptor::new("log", PropertyKind::String)
                .with_description("URL receiving a text report at end of stream"),
        )
        .with_arg(
            ArgDescriptor::new("max", PropertyKind::LongUInt)
                .with_default("0")
                .with_description("stop a PID after this many packets, 0 for no limit"),
        )
}

pub fn descriptor() -> FilterDescriptor {
    descriptor_with_report(InspectReport::new())
}
