//! Integration tests for session lifecycle: running, manifests, tasks, aborts and errors

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{add_inspect, any_sink_caps, metadata_output, metadata_source_caps};
use filtergraph_core::filter::{ArgDescriptor, FilterState};
use filtergraph_core::props::PropertyKind;
use filtergraph_core::{
    AbortMode, CustomFilter, Error, FilterId, FilterNotification, GraphManifest, ProcessStatus,
    RunOutcome, Session, SessionConfig, SessionState, TaskNext,
};

#[test]
fn test_testsrc_to_inspect_counts() {
    filtergraph_core::test_init();
    let session = common::session();
    session.load_filter("testsrc:dur=10:size=32x24").unwrap();
    let (_, report) = add_inspect(&session, "");

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(session.state(), SessionState::Idle);

    let video = report.record("video").unwrap();
    let audio = report.record("audio").unwrap();
    assert_eq!(video.packets, 250);
    assert_eq!(audio.packets, 431);
    assert!(video.eos && audio.eos);
    assert_eq!(video.first_cts, Some(0));
    assert_eq!(video.last_cts, Some(249));
    assert_eq!(report.total_packets(), 681);

    let stats = session.stats();
    assert_eq!(stats.filter("testsrc").unwrap().packets_out, 681);
    assert_eq!(stats.filter("inspect").unwrap().packets_in, 681);
    assert_eq!(stats.filter("inspect").unwrap().state, FilterState::Done);
}

#[test]
fn test_multithreaded_run_delivers_everything() {
    let session = Session::new(SessionConfig::default().with_threads(4));
    session.load_filter("testsrc:dur=2:size=16x16").unwrap();
    let (_, report) = add_inspect(&session, "");

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(report.record("video").unwrap().packets, 50);
    // ceil(2 * 44100 / 1024)
    assert_eq!(report.record("audio").unwrap().packets, 87);
}

#[test]
fn test_copy_through_memory_io() {
    let session = common::session();
    let payload: Vec<u8> = (0..12_000u32).map(|i| (i % 251) as u8).collect();
    session.io().memory().insert("in.bin", payload.clone());

    let src = session.load_source("mem://in.bin").unwrap();
    let dst = session.load_destination("mem://out.bin").unwrap();
    {
        let view = session.lock();
        assert_eq!(view.filter(src).unwrap().class, "fin");
        assert_eq!(view.filter(dst).unwrap().class, "fout");
    }

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    assert_eq!(session.io().memory().get("out.bin"), Some(payload));
    // 5000-byte blocks
    let stats = session.stats();
    let fin = stats.filter("fin").unwrap();
    assert_eq!(fin.packets_out, 3);
    assert_eq!(fin.status.as_deref(), Some("read 12000 bytes"));
    assert_eq!(fin.status_percent, Some(100.0));
}

/// Source with a `rate` argument, recording what `args()` holds when it runs
fn rate_source(rates: Arc<Mutex<Vec<Option<u32>>>>) -> CustomFilter {
    CustomFilter::new("ticker")
        .with_arg(ArgDescriptor::new("rate", PropertyKind::UInt).with_default("1"))
        .with_arg(
            ArgDescriptor::new("mode", PropertyKind::String)
                .with_values(&["fast", "slow"])
                .with_default("slow"),
        )
        .on_process(move |ctx| {
            rates.lock().unwrap().push(ctx.args().get_u32("rate"));
            let pid = metadata_output(ctx);
            pid.set_eos();
            Ok(ProcessStatus::EndOfStream)
        })
}

#[test]
fn test_filter_arg_update_delivered_before_process() {
    let session = common::session();
    let rates = Arc::new(Mutex::new(Vec::new()));
    let updates = Arc::new(Mutex::new(Vec::new()));
    let seen = updates.clone();
    let src = session
        .add_custom_filter(
            metadata_source_caps(),
            rate_source(rates.clone()).on_update_arg(move |_ctx, name, value| {
                seen.lock().unwrap().push((name.to_string(), value.to_string()));
                Ok(())
            }),
        )
        .unwrap();
    session
        .add_custom_filter(any_sink_caps(), CustomFilter::new("sink"))
        .unwrap();

    session.update_filter_arg(src, "rate", "5").unwrap();
    let unknown = session.update_filter_arg(src, "speed", "2");
    assert!(matches!(unknown, Err(Error::BadParam(_))));
    let illegal = session.update_filter_arg(src, "mode", "turbo");
    assert!(matches!(illegal, Err(Error::BadParam(_))));
    let unparsable = session.update_filter_arg(src, "rate", "fast");
    assert!(matches!(unparsable, Err(Error::BadParam(_))));
    let missing = session.update_filter_arg(FilterId(999), "rate", "2");
    assert!(matches!(missing, Err(Error::BadParam(_))));

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(*updates.lock().unwrap(), vec![("rate".to_string(), "5".to_string())]);
    assert_eq!(*rates.lock().unwrap(), vec![Some(5)]);
}

#[test]
fn test_refused_arg_update_keeps_value() {
    let session = common::session();
    let rates = Arc::new(Mutex::new(Vec::new()));
    let src = session
        .add_custom_filter(metadata_source_caps(), rate_source(rates.clone()))
        .unwrap();
    session
        .add_custom_filter(any_sink_caps(), CustomFilter::new("sink"))
        .unwrap();

    // validated, then refused by a filter without an update callback
    session.update_filter_arg(src, "rate", "5").unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(*rates.lock().unwrap(), vec![Some(1)]);
}

#[test]
fn test_filter_status_in_stats() {
    let session = common::session();
    session
        .add_custom_filter(
            metadata_source_caps(),
            CustomFilter::new("worker").on_process(|ctx| {
                ctx.set_status("overshoot", Some(150.0));
                let pid = metadata_output(ctx);
                pid.set_eos();
                Ok(ProcessStatus::EndOfStream)
            }),
        )
        .unwrap();
    session
        .add_custom_filter(any_sink_caps(), CustomFilter::new("sink"))
        .unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    let stats = session.stats();
    let worker = stats.filter("worker").unwrap();
    assert_eq!(worker.status.as_deref(), Some("overshoot"));
    assert_eq!(worker.status_percent, Some(100.0));
    let sink = stats.filter("sink").unwrap();
    assert_eq!(sink.status, None);
    assert_eq!(sink.status_percent, None);
}

#[test]
fn test_load_source_unknown_resource() {
    let session = common::session();
    let res = session.load_source("mem://missing.bin");
    assert!(matches!(res, Err(Error::FilterNotFound(_))));
}

#[test]
fn test_load_filter_errors() {
    let session = common::session();
    assert!(matches!(session.load_filter("nosuchfilter"), Err(Error::FilterNotFound(_))));
    assert!(matches!(
        session.load_filter("testsrc:size=big"),
        Err(Error::BadParam(_))
    ));
}

#[test]
fn test_session_from_manifest() {
    let manifest = GraphManifest::from_yaml_str(
        r#"
filters:
  - id: src
    filter: "testsrc:dur=1:streams=v:size=16x16"
  - id: other
    filter: "testsrc:dur=0.4:streams=v:size=16x16"
  - id: out
    filter: inspect
    sources: [src]
  - id: rest
    filter: inspect
    sources: [other]
config:
  threads: 1
"#,
    )
    .unwrap();
    let session = Session::from_manifest(&manifest).unwrap();
    assert_eq!(session.config().threads, 1);

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let view = session.lock();
    assert_eq!(view.len(), 4);
    let out = view.find("out").unwrap();
    assert_eq!(out.inputs.len(), 1);
    assert_eq!(out.inputs[0].source, "src");
    assert_eq!(out.inputs[0].statistics.packets, 25);
    let rest = view.find("rest").unwrap();
    assert_eq!(rest.inputs[0].source, "other");
    assert_eq!(rest.inputs[0].statistics.packets, 10);
}

#[test]
fn test_manifest_with_unknown_source_rejected() {
    let manifest = GraphManifest::from_yaml_str(
        r#"
filters:
  - id: out
    filter: inspect
    sources: [nowhere]
"#,
    )
    .unwrap();
    assert!(matches!(Session::from_manifest(&manifest), Err(Error::Config(_))));
}

#[test]
fn test_notifications_delivered() {
    let session = common::session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    session.set_notification_handler(move |n| {
        let entry = match n {
            FilterNotification::Created { name, .. } => format!("created {}", name),
            FilterNotification::Destroyed { name, .. } => format!("destroyed {}", name),
            FilterNotification::Failed { name, error, .. } => format!("failed {} {}", name, error.kind),
        };
        log.lock().unwrap().push(entry);
    });
    session.load_filter("testsrc:dur=0.2:streams=v:size=16x16").unwrap();
    let sink = session.load_filter("inspect").unwrap();
    session.run().unwrap();
    session.remove_filter(sink).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            "created testsrc".to_string(),
            "created inspect".to_string(),
            "destroyed inspect".to_string(),
        ]
    );
}

#[test]
fn test_post_task_runs_again() {
    let session = common::session();
    session.load_filter("testsrc:dur=0.2:streams=v:size=16x16").unwrap();
    add_inspect(&session, "");
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    session.post_task("tick", Duration::ZERO, move |_session| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
            TaskNext::Again(Duration::from_millis(2))
        } else {
            TaskNext::Done
        }
    });
    assert_eq!(session.pending_tasks(), 1);

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(session.pending_tasks(), 0);
}

#[tokio::test]
async fn test_run_async() {
    let session = common::session();
    session.load_filter("testsrc:dur=1:streams=a").unwrap();
    let (_, report) = add_inspect(&session, "");

    let outcome = session.run_async().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    // ceil(44100 / 1024)
    assert_eq!(report.record("audio").unwrap().packets, 44);
}

#[test]
fn test_non_consuming_sink_deadlocks() {
    let session = common::session();
    session.load_filter("testsrc:dur=1:streams=v:size=16x16").unwrap();
    let sink = CustomFilter::new("stuck").on_process(|_ctx| Ok(ProcessStatus::Continue));
    session.add_custom_filter(any_sink_caps(), sink).unwrap();

    match session.run() {
        Err(Error::Deadlock { filters }) => {
            assert!(filters.contains(&"testsrc".to_string()));
            assert!(filters.contains(&"stuck".to_string()));
        }
        other => panic!("expected a deadlock, got {:?}", other),
    }
}

#[test]
fn test_flush_abort_drains_and_reports_aborted() {
    let session = common::session();
    session.load_filter("testsrc:dur=1000:streams=v:size=16x16").unwrap();
    let (_, report) = add_inspect(&session, "");
    session.post_task("stop", Duration::from_millis(5), |session| {
        session.abort(AbortMode::Flush);
        TaskNext::Done
    });

    assert_eq!(session.run().unwrap(), RunOutcome::Aborted);
    assert_eq!(session.state(), SessionState::Aborted);
    let video = report.record("video").unwrap();
    assert!(video.eos);
    assert!(video.packets < 25_000);
}

#[test]
fn test_immediate_abort() {
    let session = common::session();
    session.load_filter("testsrc:dur=1000:streams=v:size=16x16").unwrap();
    let (_, report) = add_inspect(&session, "");
    session.post_task("kill", Duration::from_millis(5), |session| {
        session.abort(AbortMode::Immediate);
        TaskNext::Done
    });

    assert_eq!(session.run().unwrap(), RunOutcome::Aborted);
    assert!(report.total_packets() < 25_000);
}

#[test]
fn test_abort_outside_run_is_ignored() {
    let session = common::session();
    session.abort(AbortMode::Immediate);
    assert_eq!(session.state(), SessionState::Idle);
}

fn failing_source(after: u32) -> CustomFilter {
    let mut calls = 0u32;
    CustomFilter::new("flaky").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        if calls == after {
            return Err(Error::BadParam("broken input".into()));
        }
        calls += 1;
        pid.new_packet(2)?.send()?;
        Ok(ProcessStatus::Continue)
    })
}

#[test]
fn test_process_error_fails_only_the_filter() {
    let session = common::session();
    session
        .add_custom_filter(metadata_source_caps(), failing_source(2))
        .unwrap();
    let (_, report) = add_inspect(&session, "");
    let failures = Arc::new(AtomicUsize::new(0));
    let count = failures.clone();
    session.set_notification_handler(move |n| {
        if matches!(n, FilterNotification::Failed { .. }) {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let err = session.process_error().unwrap();
    assert_eq!(err.filter, "flaky");
    assert_eq!(err.kind, "BadParam");
    assert!(err.message.contains("broken input"));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(report.total_packets(), 2);
    let view = session.lock();
    assert_eq!(view.find("flaky").unwrap().state, FilterState::Error);
    assert_eq!(view.find("inspect").unwrap().state, FilterState::Done);
}

#[test]
fn test_abort_on_error_cancels_run() {
    let session = Session::new(SessionConfig::single_threaded().with_abort_on_error(true));
    session
        .add_custom_filter(metadata_source_caps(), failing_source(1))
        .unwrap();
    add_inspect(&session, "");

    assert!(matches!(session.run(), Err(Error::Cancelled(_))));
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(session.process_error().unwrap().filter, "flaky");
}

#[test]
fn test_removed_sink_leaves_pid_unconnected() {
    let session = common::session();
    session.load_filter("testsrc:dur=0.4:streams=v:size=16x16").unwrap();
    let sink = session.load_filter("inspect").unwrap();
    session.remove_filter(sink).unwrap();
    assert!(matches!(session.remove_filter(sink), Err(Error::BadParam(_))));

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(session.lock().len(), 1);
    assert_eq!(session.connect_error().unwrap().kind, "FilterNotFound");
}

#[test]
fn test_reset_filter_revives_done_filter() {
    let session = common::session();
    let src = session.load_filter("testsrc:dur=0.4:streams=v:size=16x16").unwrap();
    add_inspect(&session, "");
    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(session.lock().filter(src).unwrap().state, FilterState::Done);

    session.reset_filter(src).unwrap();
    assert_eq!(session.lock().filter(src).unwrap().state, FilterState::Configured);

    // nothing left to emit: the source ends again at once
    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(session.lock().filter(src).unwrap().state, FilterState::Done);
    assert_eq!(session.stats().filter("testsrc").unwrap().packets_out, 10);

    let unknown = filtergraph_core::FilterId(404);
    assert!(matches!(session.reset_filter(unknown), Err(Error::BadParam(_))));
}

#[test]
fn test_config_files() {
    let config = SessionConfig::from_toml_str("threads = 2\nabort_on_error = true\n").unwrap();
    assert_eq!(config.threads, 2);
    assert!(config.abort_on_error);
    assert_eq!(config.pid_buffer_units, 4);

    let config = SessionConfig::from_yaml_str("pid_buffer_units: 8\n").unwrap();
    assert_eq!(config.pid_buffer_units, 8);
    assert_eq!(config.max_chain_length, 6);

    assert!(matches!(
        SessionConfig::from_toml_str("threads = \"many\""),
        Err(Error::Config(_))
    ));
}
