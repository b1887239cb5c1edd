//! Integration tests for PIDs: back-pressure, properties, reconfiguration and EOS

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{any_sink_caps, metadata_output, metadata_source_caps};
use filtergraph_core::packet::ClockType;
use filtergraph_core::props::Fraction64;
use filtergraph_core::{
    CustomFilter, InputPid, ProcessStatus, PropertyId, PropertyMap, PropertyValue, RunOutcome,
    Session, SessionConfig,
};

#[test]
fn test_would_block_holds_producer() {
    let session = common::session();
    let first_call = Arc::new(Mutex::new(None));
    let record = first_call.clone();
    let mut sent = 0u32;
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if sent == 0 {
            pid.set_max_buffer_units(2);
            for _ in 0..2 {
                pid.new_packet(1)?.send()?;
                sent += 1;
            }
            // nothing consumed yet
            *record.lock().unwrap() = Some((pid.would_block(), pid.buffer_occupancy().units));
            return Ok(ProcessStatus::Continue);
        }
        if sent == 10 {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        if !pid.would_block() {
            pid.new_packet(1)?.send()?;
            sent += 1;
        }
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();

    let max_queued = Arc::new(Mutex::new(0usize));
    let received = Arc::new(Mutex::new(0usize));
    let (max_q, recv) = (max_queued.clone(), received.clone());
    // one packet per call so the queue can fill up
    let sink = CustomFilter::new("sink").on_process(move |ctx| {
        let Some(pid) = ctx.input(0) else {
            return Ok(ProcessStatus::Continue);
        };
        {
            let mut max = max_q.lock().unwrap();
            *max = (*max).max(pid.packet_count());
        }
        if pid.get_packet().is_some() {
            pid.drop_packet();
            *recv.lock().unwrap() += 1;
        }
        if pid.is_eos() {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(*first_call.lock().unwrap(), Some((true, 2)));
    assert!(*max_queued.lock().unwrap() <= 2);
    assert_eq!(*received.lock().unwrap(), 10);
}

/// Runs a producer that ignores `would_block` and returns how often it was entered blocked
fn run_greedy_producer(threads: usize) -> (usize, usize) {
    let session = Session::new(SessionConfig::default().with_threads(threads));
    let blocked_entries = Arc::new(AtomicUsize::new(0));
    let blocked = blocked_entries.clone();
    let mut sent = 0u32;
    let source = CustomFilter::new("greedy").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if pid.would_block() {
            blocked.fetch_add(1, Ordering::SeqCst);
        }
        if sent == 50 {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        pid.new_packet(1)?.send()?;
        sent += 1;
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let count = received.clone();
    let sink = CustomFilter::new("sink").on_process(move |ctx| {
        let Some(pid) = ctx.input(0) else {
            return Ok(ProcessStatus::Continue);
        };
        if pid.get_packet().is_some() {
            pid.drop_packet();
            count.fetch_add(1, Ordering::SeqCst);
        }
        if pid.is_eos() {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    let blocked = blocked_entries.load(Ordering::SeqCst);
    (blocked, received.load(Ordering::SeqCst))
}

#[test]
fn test_blocked_producer_not_scheduled() {
    for threads in [1, 4] {
        let (blocked, received) = run_greedy_producer(threads);
        assert_eq!(blocked, 0, "{} threads", threads);
        assert_eq!(received, 50, "{} threads", threads);
    }
}

#[test]
fn test_clock_packets_counted_by_consumer() {
    let session = common::session();
    let mut sent = 0u64;
    // clock references on even steps, 4-byte data packets on odd ones
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if sent == 6 {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        if pid.would_block() {
            return Ok(ProcessStatus::Continue);
        }
        let pck = if sent % 2 == 0 {
            let clock = pid.new_packet(0)?;
            clock.set_clock_type(ClockType::Pcr)?;
            clock
        } else {
            pid.new_packet(4)?
        };
        pck.set_cts(Some(sent * 10))?;
        pck.send()?;
        sent += 1;
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();

    let input: Arc<Mutex<Option<InputPid>>> = Arc::default();
    let data_packets = Arc::new(AtomicUsize::new(0));
    let (keep, count) = (input.clone(), data_packets.clone());
    let sink = CustomFilter::new("sink")
        .on_configure(move |_ctx, pid, is_remove| {
            if !is_remove {
                *keep.lock().unwrap() = Some(pid.clone());
            }
            Ok(())
        })
        .on_process(move |ctx| {
            let Some(pid) = ctx.input(0) else {
                return Ok(ProcessStatus::Continue);
            };
            while pid.get_packet().is_some() {
                pid.drop_packet();
                count.fetch_add(1, Ordering::SeqCst);
            }
            if pid.is_eos() {
                return Ok(ProcessStatus::EndOfStream);
            }
            Ok(ProcessStatus::Continue)
        });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    assert_eq!(data_packets.load(Ordering::SeqCst), 3);
    let pid = input.lock().unwrap().clone().unwrap();
    assert_eq!(pid.clock_info(), Some((ClockType::Pcr, 40)));
    assert_eq!(pid.statistics().packets, 6);
    assert_eq!(pid.statistics().bytes, 12);
    let stats = session.stats();
    assert_eq!(stats.filter("src").unwrap().packets_out, 6);
    assert_eq!(stats.filter("sink").unwrap().packets_in, 6);
}

#[test]
fn test_properties_copied_through_reframer() {
    let session = common::session();
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        pid.set_property(PropertyId::Width, Some(320u32.into()));
        pid.set_property(PropertyId::Height, Some(240u32.into()));
        pid.set_property("x-label", Some("cam1".into()));
        pid.set_info(PropertyId::Duration, Some(Fraction64::new(5, 1).into()));
        pid.new_packet(4)?.send()?;
        pid.set_eos();
        Ok(ProcessStatus::EndOfStream)
    });
    let src = session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let reframer = session.load_filter("reframer").unwrap();
    session.set_source(reframer, src).unwrap();

    let configured: Arc<Mutex<Option<(PropertyMap, Option<PropertyValue>)>>> =
        Arc::new(Mutex::new(None));
    let out = configured.clone();
    let sink = CustomFilter::new("sink").on_configure(move |_ctx, pid, is_remove| {
        if !is_remove {
            *out.lock().unwrap() = Some((pid.properties(), pid.get_info(PropertyId::Duration)));
        }
        Ok(())
    });
    let sink = session.add_custom_filter(any_sink_caps(), sink).unwrap();
    session.set_source(sink, reframer).unwrap();

    session.run().unwrap();

    let (props, duration) = configured.lock().unwrap().clone().unwrap();
    assert_eq!(props.get(PropertyId::Width), Some(&PropertyValue::from(320u32)));
    assert_eq!(props.get(PropertyId::Height), Some(&PropertyValue::from(240u32)));
    assert_eq!(props.get("x-label").and_then(|v| v.as_str()), Some("cam1"));
    // info properties stay on the producer and are found by walking upstream
    assert!(props.get(PropertyId::Duration).is_none());
    assert_eq!(duration.and_then(|v| v.as_f64()), Some(5.0));
}

#[test]
fn test_property_change_reconfigures_consumer() {
    let session = common::session();
    let mut sent = 0u32;
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if sent == 6 {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        if pid.would_block() {
            return Ok(ProcessStatus::Continue);
        }
        // every edit publishes a new property version
        match sent {
            0 => pid.set_property(PropertyId::Width, Some(100u32.into())),
            3 => pid.set_property(PropertyId::Width, Some(200u32.into())),
            _ => {}
        }
        pid.new_packet(1)?.send()?;
        sent += 1;
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();

    let configured = Arc::new(Mutex::new(Vec::new()));
    let per_packet = Arc::new(Mutex::new(Vec::new()));
    let (cfg, pkt) = (configured.clone(), per_packet.clone());
    let width_of = |pid: &InputPid| pid.get_property(PropertyId::Width).and_then(|v| v.as_u32());
    let sink = CustomFilter::new("sink")
        .on_configure(move |_ctx, pid, is_remove| {
            if !is_remove {
                cfg.lock().unwrap().push(width_of(pid));
            }
            Ok(())
        })
        .on_process(move |ctx| {
            let Some(pid) = ctx.input(0) else {
                return Ok(ProcessStatus::Continue);
            };
            while pid.get_packet().is_some() {
                pkt.lock().unwrap().push(width_of(&pid));
                pid.drop_packet();
            }
            if pid.is_eos() {
                return Ok(ProcessStatus::EndOfStream);
            }
            Ok(ProcessStatus::Continue)
        });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    session.run().unwrap();

    assert_eq!(*configured.lock().unwrap(), vec![Some(100), Some(200)]);
    let widths: Vec<_> = per_packet.lock().unwrap().iter().map(|w| w.unwrap()).collect();
    assert_eq!(widths, vec![100, 100, 100, 200, 200, 200]);
}

#[test]
fn test_drop_waits_for_pending_reconfiguration() {
    let session = common::session();
    let mut sent = 0u32;
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if sent == 6 {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        if pid.would_block() {
            return Ok(ProcessStatus::Continue);
        }
        match sent {
            0 => pid.set_property(PropertyId::Width, Some(100u32.into())),
            3 => pid.set_property(PropertyId::Width, Some(200u32.into())),
            _ => {}
        }
        pid.new_packet(1)?.send()?;
        sent += 1;
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();

    let widths = Arc::new(Mutex::new(Vec::new()));
    let seen = widths.clone();
    // drops after every fetch attempt, including the ones handing out nothing
    let sink = CustomFilter::new("sink").on_process(move |ctx| {
        let Some(pid) = ctx.input(0) else {
            return Ok(ProcessStatus::Continue);
        };
        loop {
            let head = pid.get_packet();
            if head.is_some() {
                let width = pid.get_property(PropertyId::Width).and_then(|v| v.as_u32());
                seen.lock().unwrap().push(width);
            }
            pid.drop_packet();
            if head.is_none() {
                break;
            }
        }
        if pid.is_eos() {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let widths: Vec<_> = widths.lock().unwrap().iter().map(|w| w.unwrap()).collect();
    assert_eq!(widths, vec![100, 100, 100, 200, 200, 200]);
}

#[test]
fn test_sink_sees_eos_and_statistics() {
    let session = common::session();
    session.load_filter("testsrc:dur=1:streams=v:size=32x32").unwrap();
    let input: Arc<Mutex<Option<InputPid>>> = Arc::new(Mutex::new(None));
    let keep = input.clone();
    let sink = CustomFilter::new("sink").on_configure(move |_ctx, pid, is_remove| {
        if !is_remove {
            *keep.lock().unwrap() = Some(pid.clone());
        }
        Ok(())
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let pid = input.lock().unwrap().clone().unwrap();
    assert!(pid.has_seen_eos());
    assert!(pid.is_eos());
    assert_eq!(pid.first_packet_cts(), Some(0));
    let stats = pid.statistics();
    assert_eq!(stats.packets, 25);
    assert_eq!(stats.bytes, 25 * (32 * 32 * 3 / 2));
    assert_eq!(stats.last_cts, Some(24));

    let view = session.lock();
    let src = view.find("testsrc").unwrap();
    assert_eq!(src.outputs.len(), 1);
    assert_eq!(src.outputs[0].consumers, vec!["sink".to_string()]);
    assert_eq!(src.outputs[0].statistics.packets, 25);
    assert!(src.outputs[0].eos);
}

#[test]
fn test_unconnected_pid_reports_connect_error() {
    let session = common::session();
    session
        .add_custom_filter(metadata_source_caps(), common::packet_source("lonely", 3, 4))
        .unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let err = session.connect_error().unwrap();
    assert_eq!(err.filter, "lonely");
    assert_eq!(err.kind, "FilterNotFound");
}
