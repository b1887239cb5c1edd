//! Integration tests for packet lifecycle: finalization, shared buffers, slices and ordering

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{add_inspect, metadata_output, metadata_source_caps, packet_source, recording_sink};
use filtergraph_core::{CustomFilter, Error, Packet, ProcessStatus, RunOutcome};

#[test]
fn test_fifo_order_preserved() {
    let session = common::session();
    session
        .add_custom_filter(metadata_source_caps(), packet_source("src", 20, 8))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    session
        .add_custom_filter(common::any_sink_caps(), recording_sink("sink", seen.clone()))
        .unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let seen = seen.lock().unwrap();
    let cts: Vec<u64> = seen.iter().map(|(cts, _)| cts.unwrap()).collect();
    assert_eq!(cts, (0..20).collect::<Vec<_>>());
    assert!(seen.iter().all(|(cts, byte)| *cts == Some(*byte as u64)));
}

#[test]
fn test_send_and_discard_finalize_once() {
    let session = common::session();
    let checks = Arc::new(Mutex::new(Vec::new()));
    let out = checks.clone();
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        let mut out = out.lock().unwrap();

        let sent = pid.new_packet(4)?;
        out.push(sent.send().is_ok());
        out.push(matches!(sent.send(), Err(Error::AlreadyFinalized)));
        out.push(matches!(sent.write(0, &[1]), Err(Error::DetachedPacket(_))));

        let dropped = pid.new_packet(4)?;
        out.push(dropped.discard().is_ok());
        out.push(matches!(dropped.discard(), Err(Error::AlreadyFinalized)));
        out.push(matches!(dropped.send(), Err(Error::AlreadyFinalized)));

        pid.set_eos();
        Ok(ProcessStatus::EndOfStream)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let (_, report) = add_inspect(&session, "");

    session.run().unwrap();

    assert_eq!(*checks.lock().unwrap(), vec![true; 6]);
    assert_eq!(report.total_packets(), 1, "only the sent packet is delivered");
}

#[test]
fn test_shared_packet_released_once() {
    let session = common::session();
    let released = Arc::new(AtomicUsize::new(0));
    let before_drop = Arc::new(AtomicUsize::new(usize::MAX));
    let (counter, outstanding) = (released.clone(), before_drop.clone());
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        let counter = counter.clone();
        let pck = Packet::new_shared(&pid, vec![7u8; 32], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
        pck.send()?;
        drop(pck);
        // still queued on the PID
        outstanding.store(pid.shared_packets_out(), Ordering::SeqCst);
        pid.set_eos();
        Ok(ProcessStatus::EndOfStream)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let (_, report) = add_inspect(&session, "");

    session.run().unwrap();

    assert_eq!(before_drop.load(Ordering::SeqCst), 1, "one shared packet outstanding");
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(report.total_bytes(), 32);
}

#[test]
fn test_references_and_slices() {
    let session = common::session();
    let checks = Arc::new(Mutex::new(Vec::new()));
    let out = checks.clone();
    let source = CustomFilter::new("src").on_process(move |ctx| {
        let pid = metadata_output(ctx);
        let mut out = out.lock().unwrap();

        let pck = pid.new_packet(8)?;
        pck.write(0, &[0, 1, 2, 3, 4, 5, 6, 7])?;
        let extra = pck.add_ref();
        out.push(pck.ref_count() == 2);
        extra.unref();
        out.push(pck.ref_count() == 1);

        let slice = Packet::new_ref(&pid, &pck, 2, 4)?;
        out.push(&slice.data()[..] == &[2u8, 3, 4, 5][..]);
        out.push(matches!(
            Packet::new_ref(&pid, &pck, 6, 4),
            Err(Error::InvalidRange { offset: 6, length: 4, size: 8 })
        ));
        pck.discard()?;
        slice.send()?;

        pid.set_eos();
        Ok(ProcessStatus::EndOfStream)
    });
    session.add_custom_filter(metadata_source_caps(), source).unwrap();
    let (_, report) = add_inspect(&session, "");

    session.run().unwrap();

    assert_eq!(*checks.lock().unwrap(), vec![true; 4]);
    assert_eq!(report.total_bytes(), 4);
}

#[test]
fn test_reframer_forwards_payload() {
    let session = common::session();
    session
        .load_filter("testsrc:dur=0.4:size=16x16:streams=v")
        .unwrap();
    let reframer = session.load_filter("reframer").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = session
        .add_custom_filter(common::any_sink_caps(), recording_sink("sink", seen.clone()))
        .unwrap();
    session.set_source(sink, reframer).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    for (i, (cts, byte)) in seen.iter().enumerate() {
        assert_eq!(*cts, Some(i as u64));
        assert_eq!(*byte as usize, i);
    }
    let stats = session.stats();
    assert_eq!(stats.filter("reframer").unwrap().packets_out, 10);
}
