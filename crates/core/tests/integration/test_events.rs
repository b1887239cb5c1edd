//! Integration tests for event routing between filters and from the host

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{any_sink_caps, metadata_output, metadata_source_caps, packet_source};
use filtergraph_core::abr::{AbrDriver, GroupStats, QualityInfo, ThroughputAdaptation};
use filtergraph_core::props::StreamType;
use filtergraph_core::{
    CustomFilter, EventDirection, EventKind, FilterEvent, PidId, ProcessStatus, PropertyMap,
    PropertyId, RunOutcome, TaskNext,
};

type Log = Arc<Mutex<Vec<EventKind>>>;

/// Source of `count` packets recording every event reaching it
fn listening_source(count: u64, log: Log) -> CustomFilter {
    packet_source("src", count, 4).on_event(move |_ctx, event| {
        log.lock().unwrap().push(event.kind.clone());
        true
    })
}

/// Sink draining its inputs and recording every event reaching it
fn listening_sink(log: Log) -> CustomFilter {
    CustomFilter::new("sink").on_event(move |_ctx, event| {
        log.lock().unwrap().push(event.kind.clone());
        false
    })
}

#[test]
fn test_quality_switch_travels_upstream() {
    let session = common::session();
    let events: Log = Arc::default();
    session
        .add_custom_filter(metadata_source_caps(), listening_source(5, events.clone()))
        .unwrap();
    let sink = CustomFilter::new("sink").on_configure(|_ctx, pid, is_remove| {
        if !is_remove {
            pid.send_event(FilterEvent::new(EventKind::QualitySwitch {
                up: true,
                q_idx: 2,
                dependent_group_index: 0,
            }));
        }
        Ok(())
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![EventKind::QualitySwitch {
            up: true,
            q_idx: 2,
            dependent_group_index: 0,
        }]
    );
}

#[test]
fn test_user_event_forwarded_downstream_through_reframer() {
    let session = common::session();
    let mut calls = 0;
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        calls += 1;
        if calls == 3 {
            let mut data = PropertyMap::new();
            data.insert("scene", "intro");
            pid.send_event(FilterEvent::new(EventKind::User {
                name: "marker".into(),
                data,
            }));
        }
        if calls == 5 {
            pid.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        pid.new_packet(1)?.send()?;
        Ok(ProcessStatus::Continue)
    });
    let src = session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let reframer = session.load_filter("reframer").unwrap();
    session.set_source(reframer, src).unwrap();
    let events: Log = Arc::default();
    let sink = session
        .add_custom_filter(any_sink_caps(), listening_sink(events.clone()))
        .unwrap();
    session.set_source(sink, reframer).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        EventKind::User { name, data } => {
            assert_eq!(name, "marker");
            assert_eq!(data.get("scene").and_then(|v| v.as_str()), Some("intro"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_pid_event_sent_on_target_output_only() {
    let session = common::session();
    let mut calls = 0u32;
    let source = CustomFilter::new("src").on_process(move |ctx| {
        if ctx.outputs().is_empty() {
            for name in ["a", "b"] {
                let pid = ctx.new_output_pid();
                pid.set_name(name);
                pid.set_property(PropertyId::StreamType, Some(StreamType::Metadata.into()));
            }
        }
        calls += 1;
        let outputs = ctx.outputs();
        if calls == 3 {
            ctx.send_event(FilterEvent::on_pid(
                EventKind::User {
                    name: "only-b".into(),
                    data: PropertyMap::new(),
                },
                outputs[1].id(),
            ));
        }
        if calls == 5 {
            for pid in &outputs {
                pid.set_eos();
            }
            return Ok(ProcessStatus::EndOfStream);
        }
        for pid in &outputs {
            pid.new_packet(1)?.send()?;
        }
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();

    let reached = Arc::new(Mutex::new(Vec::new()));
    let log = reached.clone();
    let sink = CustomFilter::new("sink")
        .on_event(move |ctx, event| {
            let name = ctx
                .inputs()
                .into_iter()
                .find(|pid| Some(pid.id()) == event.pid())
                .map(|pid| pid.name());
            log.lock().unwrap().push(name);
            false
        })
        .on_process(|ctx| {
            let inputs = ctx.inputs();
            for pid in &inputs {
                while pid.get_packet().is_some() {
                    pid.drop_packet();
                }
            }
            if inputs.len() == 2 && inputs.iter().all(|p| p.is_eos()) {
                return Ok(ProcessStatus::EndOfStream);
            }
            Ok(ProcessStatus::Continue)
        });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(*reached.lock().unwrap(), vec![Some("b".to_string())]);
}

#[test]
fn test_buffer_req_pid_only_stops_at_pid() {
    let session = common::session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let source = packet_source("src", 10, 4).on_event(move |ctx, event| {
        let limit = ctx.output(0).map(|p| p.buffer_occupancy().max_duration_us);
        log.lock().unwrap().push((event.name(), limit));
        true
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let sink = CustomFilter::new("sink").on_configure(|_ctx, pid, is_remove| {
        if !is_remove {
            pid.send_event(FilterEvent::new(EventKind::BufferReq {
                max_buffer_us: 2_000_000,
                max_playout_us: 0,
                pid_only: true,
            }));
            pid.send_event(FilterEvent::new(EventKind::BufferReq {
                max_buffer_us: 3_000_000,
                max_playout_us: 0,
                pid_only: false,
            }));
        }
        Ok(())
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    // only the second request reaches the producer, after both were applied to the PID
    assert_eq!(*seen.lock().unwrap(), vec![("BUFFER_REQ", Some(3_000_000))]);
}

#[test]
fn test_play_sets_speed_on_pid() {
    let session = common::session();
    let speeds = Arc::new(Mutex::new(Vec::new()));
    let log = speeds.clone();
    let mut sent = 0u64;
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        log.lock().unwrap().push(pid.playback_speed());
        if sent == 8 {
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
    let sink = CustomFilter::new("sink").on_configure(|_ctx, pid, is_remove| {
        if !is_remove {
            pid.send_event(FilterEvent::new(EventKind::Play {
                start_range: 0.0,
                end_range: None,
                speed: 2.0,
            }));
        }
        Ok(())
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let speeds = speeds.lock().unwrap();
    assert_eq!(speeds.first(), Some(&1.0));
    assert_eq!(speeds.last(), Some(&2.0));
}

#[test]
fn test_host_events_by_session_and_pid() {
    let session = common::session();
    let source_events: Log = Arc::default();
    let switched = Arc::new(AtomicBool::new(false));
    let (log, flag) = (source_events.clone(), switched.clone());
    // streams until the host asks for another quality
    let source = CustomFilter::new("src")
        .on_process(move |ctx| {
            let pid = metadata_output(ctx);
            if switched.load(Ordering::SeqCst) {
                pid.set_eos();
                return Ok(ProcessStatus::EndOfStream);
            }
            if !pid.would_block() {
                pid.new_packet(1)?.send()?;
            }
            Ok(ProcessStatus::Continue)
        })
        .on_event(move |_ctx, event| {
            log.lock().unwrap().push(event.kind.clone());
            flag.store(true, Ordering::SeqCst);
            true
        });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let sink_events: Log = Arc::default();
    let pid_id: Arc<Mutex<Option<PidId>>> = Arc::default();
    let id_slot = pid_id.clone();
    let sink = listening_sink(sink_events.clone()).on_configure(move |_ctx, pid, is_remove| {
        if !is_remove {
            *id_slot.lock().unwrap() = Some(pid.id());
        }
        Ok(())
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    session.post_task("inject", Duration::ZERO, move |session| {
        let Some(id) = *pid_id.lock().unwrap() else {
            return TaskNext::Again(Duration::from_millis(1));
        };
        session
            .send_event(FilterEvent::on_pid(
                EventKind::User {
                    name: "tick".into(),
                    data: PropertyMap::new(),
                },
                id,
            ))
            .unwrap();
        // reaches the sink first, which forwards it to the source
        session
            .send_event(FilterEvent::session(
                EventKind::QualitySwitch {
                    up: false,
                    q_idx: 0,
                    dependent_group_index: -1,
                },
                EventDirection::Upstream,
            ))
            .unwrap();
        TaskNext::Done
    });

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let switch = EventKind::QualitySwitch {
        up: false,
        q_idx: 0,
        dependent_group_index: -1,
    };
    let sink_events = sink_events.lock().unwrap();
    assert!(sink_events.contains(&switch));
    assert!(sink_events
        .iter()
        .any(|e| matches!(e, EventKind::User { name, .. } if name == "tick")));
    assert_eq!(*source_events.lock().unwrap(), vec![switch]);
}

#[test]
fn test_unknown_pid_event_rejected() {
    let session = common::session();
    let res = session.send_event(FilterEvent::on_pid(EventKind::Pause, PidId(u64::MAX)));
    assert!(res.is_err());
}

#[test]
fn test_configure_failure_sends_connect_fail() {
    let session = common::session();
    let events: Log = Arc::default();
    session
        .add_custom_filter(metadata_source_caps(), listening_source(3, events.clone()))
        .unwrap();
    let sink = CustomFilter::new("picky").on_configure(|_ctx, _pid, is_remove| {
        if is_remove {
            return Ok(());
        }
        Err(filtergraph_core::Error::NotSupported("metadata not wanted".into()))
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let err = session.connect_error().unwrap();
    assert_eq!(err.filter, "picky");
    assert_eq!(err.kind, "NotSupported");
    let events = events.lock().unwrap();
    assert!(matches!(
        events.as_slice(),
        [EventKind::ConnectFail { reason }] if reason.contains("metadata not wanted")
    ));
}

#[test]
fn test_abr_driver_requests_lower_quality() {
    let session = common::session();
    let events: Log = Arc::default();
    session
        .add_custom_filter(metadata_source_caps(), listening_source(5, events.clone()))
        .unwrap();
    let mut driver = AbrDriver::new(Box::new(ThroughputAdaptation::new(1)));
    let mut ticked = false;
    let sink = CustomFilter::new("player").on_process(move |ctx| {
        let Some(pid) = ctx.input(0) else {
            return Ok(ProcessStatus::Continue);
        };
        if !ticked {
            ticked = true;
            let stats = GroupStats {
                group: 0,
                active_quality: 2,
                qualities: vec![
                    QualityInfo::new("low", 500_000),
                    QualityInfo::new("mid", 1_000_000),
                    QualityInfo::new("high", 2_000_000),
                ],
                segment_bytes: 250_000,
                // 800 kbit/s
                bytes_per_sec: 100_000,
                segment_duration_ms: 2000,
                buffer_ms: 4000,
                max_buffer_ms: 10_000,
                speed: 1.0,
            };
            assert_eq!(driver.tick(&pid, &stats), Some(0));
            assert_eq!(driver.switches(), 1);
        }
        while pid.get_packet().is_some() {
            pid.drop_packet();
        }
        if pid.is_eos() {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    });
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    assert_eq!(
        *events.lock().unwrap(),
        vec![EventKind::QualitySwitch {
            up: false,
            q_idx: 0,
            dependent_group_index: -1,
        }]
    );
}
