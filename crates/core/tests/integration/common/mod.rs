//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use filtergraph_core::caps::Caps;
use filtergraph_core::filters::inspect::{descriptor_with_report, InspectReport};
use filtergraph_core::props::StreamType;
use filtergraph_core::{
    CustomFilter, FilterContext, FilterId, OutputPid, ProcessStatus, PropertyId, Session,
    SessionConfig,
};

/// Deterministic single-threaded session with the built-in filters
pub fn session() -> Session {
    Session::new(SessionConfig::single_threaded())
}

/// Adds an inspect sink whose report the test can read
pub fn add_inspect(session: &Session, args: &str) -> (FilterId, InspectReport) {
    let report = InspectReport::new();
    let desc = descriptor_with_report(report.clone());
    let args = desc.parse_args(args).unwrap();
    let id = session.add_filter(Arc::new(desc), args).unwrap();
    (id, report)
}

pub fn metadata_source_caps() -> Caps {
    Caps::builder()
        .output(PropertyId::StreamType, StreamType::Metadata)
        .build()
}

pub fn any_sink_caps() -> Caps {
    Caps::builder().input_any(PropertyId::StreamType).build()
}

/// First output PID of the filter, created as a metadata stream on first use
pub fn metadata_output(ctx: &mut FilterContext<'_>) -> OutputPid {
    if let Some(pid) = ctx.output(0) {
        return pid;
    }
    let pid = ctx.new_output_pid();
    pid.set_name("data");
    pid.set_property(PropertyId::StreamType, Some(StreamType::Metadata.into()));
    pid.set_property(PropertyId::Timescale, Some(1000u32.into()));
    pid
}

/// Source sending `count` packets of `size` bytes, one per call, filled with the index
pub fn packet_source(name: &str, count: u64, size: usize) -> CustomFilter {
    let mut sent = 0u64;
    CustomFilter::new(name).on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if sent == count {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        if pid.would_block() {
            return Ok(ProcessStatus::Continue);
        }
        let pck = pid.new_packet(size)?;
        let fill = sent as u8;
        pck.with_data_mut(|d| d.fill(fill))?;
        pck.set_cts(Some(sent))?;
        pck.set_duration(1)?;
        pck.send()?;
        sent += 1;
        Ok(ProcessStatus::Continue)
    })
}

pub type Seen = Arc<Mutex<Vec<(Option<u64>, u8)>>>;

/// Sink recording the CTS and first payload byte of every packet, in arrival order
pub fn recording_sink(name: &str, seen: Seen) -> CustomFilter {
    CustomFilter::new(name).on_process(move |ctx| {
        let inputs = ctx.inputs();
        for pid in &inputs {
            while let Some(pck) = pid.get_packet() {
                let first = pck.data().first().copied().unwrap_or(0);
                seen.lock().unwrap().push((pck.cts(), first));
                pid.drop_packet();
            }
        }
        if !inputs.is_empty() && inputs.iter().all(|p| p.is_eos()) {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    })
}
