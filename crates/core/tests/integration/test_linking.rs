//! Integration tests for capability matching, chain resolution and negotiation

mod common;

use std::sync::{Arc, Mutex};

use filtergraph_core::caps::{Caps, Linker};
use filtergraph_core::props::{CodecId, PixelFormat, StreamType};
use filtergraph_core::{
    CustomFilter, Error, Filter, FilterContext, FilterDescriptor, FilterRegistry, InputPid,
    OutputPid, Packet, ProcessStatus, PropertyId, PropertyMap, PropertyValue, Result, RunOutcome,
    Session, SessionConfig,
};

/// Pixel converter turning 4:2:0 frames into RGB, one frame per call
#[derive(Default)]
struct Yuv2Rgb {
    output: Option<OutputPid>,
}

impl Filter for Yuv2Rgb {
    fn configure(&mut self, ctx: &mut FilterContext<'_>, pid: &InputPid, is_remove: bool) -> Result<()> {
        if is_remove {
            if let Some(out) = self.output.take() {
                ctx.remove_output(&out);
            }
            return Ok(());
        }
        let out = match &self.output {
            Some(out) => out.clone(),
            None => ctx.new_output_pid(),
        };
        out.copy_properties(pid);
        out.set_property(PropertyId::PixelFormat, Some(PixelFormat::Rgb.into()));
        self.output = Some(out);
        Ok(())
    }

    fn process(&mut self, ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        let (Some(input), Some(out)) = (ctx.input(0), self.output.clone()) else {
            return Ok(ProcessStatus::Continue);
        };
        if let Some(src) = input.get_packet() {
            let width = input.get_property(PropertyId::Width).and_then(|v| v.as_u32()).unwrap_or(0);
            let height = input.get_property(PropertyId::Height).and_then(|v| v.as_u32()).unwrap_or(0);
            let dst = out.new_packet(PixelFormat::Rgb.frame_size(width, height))?;
            let fill = src.data().first().copied().unwrap_or(0);
            dst.with_data_mut(|d| d.fill(fill))?;
            dst.set_cts(src.cts())?;
            dst.set_duration(src.duration())?;
            dst.send()?;
            input.drop_packet();
        }
        if input.is_eos() {
            out.set_eos();
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    }
}

fn yuv2rgb() -> FilterDescriptor {
    FilterDescriptor::native("yuv2rgb", |_| Ok(Yuv2Rgb::default())).with_caps(
        Caps::builder()
            .input(PropertyId::StreamType, StreamType::Visual)
            .input(PropertyId::PixelFormat, PixelFormat::Yuv420)
            .output(PropertyId::PixelFormat, PixelFormat::Rgb)
            .build(),
    )
}

struct Nop;

impl Filter for Nop {
    fn process(&mut self, _ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        Ok(ProcessStatus::EndOfStream)
    }
}

fn codec_converter(name: &str, from: CodecId, to: CodecId) -> FilterDescriptor {
    FilterDescriptor::native(name, |_| Ok(Nop)).with_caps(
        Caps::builder()
            .input(PropertyId::StreamType, StreamType::Visual)
            .input(PropertyId::CodecId, from)
            .output(PropertyId::CodecId, to)
            .build(),
    )
}

fn rgb_sink_caps() -> Caps {
    Caps::builder()
        .input(PropertyId::StreamType, StreamType::Visual)
        .input(PropertyId::PixelFormat, PixelFormat::Rgb)
        .build()
}

/// Sink recording the payload size of every packet
fn size_sink(sizes: Arc<Mutex<Vec<usize>>>) -> CustomFilter {
    CustomFilter::new("sink").on_process(move |ctx| {
        let Some(pid) = ctx.input(0) else {
            return Ok(ProcessStatus::Continue);
        };
        while let Some(pck) = pid.get_packet() {
            sizes.lock().unwrap().push(pck.size());
            pid.drop_packet();
        }
        if pid.is_eos() {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    })
}

#[test]
fn test_no_chain_when_caps_disjoint() {
    let registry = FilterRegistry::with_builtins();
    let mut props = PropertyMap::new();
    props.insert(PropertyId::StreamType, StreamType::Audio);
    let res = Linker::new(&registry, 6).resolve_props(&props, &rgb_sink_caps());
    assert!(matches!(res, Err(Error::FilterNotFound(_))));
}

#[test]
fn test_shortest_chain_wins_over_declaration_order() {
    let registry = FilterRegistry::new();
    registry.register(codec_converter("raw2avc", CodecId::Raw, CodecId::Avc)).unwrap();
    registry.register(codec_converter("avc2hevc", CodecId::Avc, CodecId::Hevc)).unwrap();
    registry.register(codec_converter("raw2hevc", CodecId::Raw, CodecId::Hevc)).unwrap();

    let mut props = PropertyMap::new();
    props.insert(PropertyId::StreamType, StreamType::Visual);
    props.insert(PropertyId::CodecId, CodecId::Raw);
    let dest = Caps::builder()
        .input(PropertyId::StreamType, StreamType::Visual)
        .input(PropertyId::CodecId, CodecId::Hevc)
        .build();

    let chain = Linker::new(&registry, 6).resolve_props(&props, &dest).unwrap();
    assert_eq!(chain.names(), vec!["raw2hevc"]);

    // without the direct converter the two-hop chain is used
    let registry = FilterRegistry::new();
    registry.register(codec_converter("raw2avc", CodecId::Raw, CodecId::Avc)).unwrap();
    registry.register(codec_converter("avc2hevc", CodecId::Avc, CodecId::Hevc)).unwrap();
    let chain = Linker::new(&registry, 6).resolve_props(&props, &dest).unwrap();
    assert_eq!(chain.names(), vec!["raw2avc", "avc2hevc"]);
}

#[test]
fn test_duplicate_registration_rejected() {
    let registry = FilterRegistry::with_builtins();
    registry.register(yuv2rgb()).unwrap();
    assert!(matches!(registry.register(yuv2rgb()), Err(Error::Config(_))));
}

#[test]
fn test_converter_inserted_between_source_and_sink() {
    let registry = FilterRegistry::with_builtins();
    registry.register(yuv2rgb()).unwrap();
    let session = Session::with_registry(SessionConfig::single_threaded(), Arc::new(registry));
    session.load_filter("testsrc:dur=1:size=16x16:streams=v").unwrap();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    session.add_custom_filter(rgb_sink_caps(), size_sink(sizes.clone())).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let sizes = sizes.lock().unwrap();
    assert_eq!(sizes.len(), 25);
    assert!(sizes.iter().all(|s| *s == 16 * 16 * 3));

    let view = session.lock();
    let converter = view.find("yuv2rgb").expect("converter inserted");
    assert!(converter.dynamic);
    assert_eq!(converter.inputs[0].source, "testsrc");
    assert_eq!(converter.outputs[0].consumers, vec!["sink".to_string()]);
    assert!(session.connect_error().is_none());
}

#[test]
fn test_pid_fans_out_to_every_matching_sink() {
    let session = common::session();
    session.load_filter("testsrc:dur=1:size=16x16:streams=v").unwrap();
    let (_, first) = common::add_inspect(&session, "");
    let (_, second) = common::add_inspect(&session, "");

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    assert_eq!(first.total_packets(), 25);
    assert_eq!(second.total_packets(), 25);
}

#[test]
fn test_set_source_restricts_links() {
    let session = common::session();
    let long = session.load_filter("testsrc:dur=1:size=16x16:streams=v").unwrap();
    let short = session.load_filter("testsrc:dur=0.4:size=16x16:streams=v").unwrap();
    let (long_sink, long_report) = common::add_inspect(&session, "");
    let (short_sink, short_report) = common::add_inspect(&session, "");
    session.set_source(long_sink, long).unwrap();
    session.set_source(short_sink, short).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    assert_eq!(long_report.total_packets(), 25);
    assert_eq!(short_report.total_packets(), 10);
}

#[test]
fn test_set_source_unknown_filter() {
    let session = common::session();
    let sink = session.load_filter("inspect").unwrap();
    let res = session.set_source(sink, filtergraph_core::FilterId(99));
    assert!(matches!(res, Err(Error::BadParam(_))));
}

#[test]
fn test_negotiated_pixel_format_applied_in_place() {
    let session = common::session();
    session.load_filter("testsrc:dur=1:size=16x16:streams=v").unwrap();

    let formats = Arc::new(Mutex::new(Vec::new()));
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let (fmt_log, size_log) = (formats.clone(), sizes.clone());
    let sink = CustomFilter::new("sink")
        .on_configure(move |_ctx, pid, is_remove| {
            if is_remove {
                return Ok(());
            }
            let format = pid.get_property(PropertyId::PixelFormat);
            fmt_log.lock().unwrap().push(format.clone());
            if format != Some(PixelFormat::Rgb.into()) {
                pid.negotiate_cap(PropertyId::PixelFormat, PixelFormat::Rgb.into())?;
            }
            Ok(())
        })
        .on_process(move |ctx| {
            let Some(pid) = ctx.input(0) else {
                return Ok(ProcessStatus::Continue);
            };
            while let Some(pck) = pid.get_packet() {
                size_log.lock().unwrap().push(pck.size());
                pid.drop_packet();
            }
            if pid.is_eos() {
                return Ok(ProcessStatus::EndOfStream);
            }
            Ok(ProcessStatus::Continue)
        });
    let caps = Caps::builder()
        .input(PropertyId::StreamType, StreamType::Visual)
        .build();
    session.add_custom_filter(caps, sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);

    let formats = formats.lock().unwrap();
    assert_eq!(
        *formats,
        vec![
            Some(PropertyValue::from(PixelFormat::Yuv420)),
            Some(PropertyValue::from(PixelFormat::Rgb)),
        ]
    );
    let sizes = sizes.lock().unwrap();
    assert_eq!(sizes.len(), 25);
    assert_eq!(*sizes.last().unwrap(), 16 * 16 * 3);
    // no adapter was needed
    assert_eq!(session.lock().len(), 2);
}

#[test]
fn test_negotiation_refused_without_path() {
    let session = common::session();
    let refused = Arc::new(Mutex::new(None));
    let out = refused.clone();
    let source = CustomFilter::new("src").on_process(|ctx| {
        let pid = common::metadata_output(ctx);
        let pck = Packet::new_alloc(&pid, 1)?;
        pck.send()?;
        pid.set_eos();
        Ok(ProcessStatus::EndOfStream)
    });
    session
        .add_custom_filter(common::metadata_source_caps(), source)
        .unwrap();
    let sink = CustomFilter::new("sink").on_configure(move |_ctx, pid, is_remove| {
        if !is_remove {
            let res = pid.negotiate_cap(PropertyId::Width, 640u32.into());
            *out.lock().unwrap() = Some(matches!(res, Err(Error::NotSupported(_))));
        }
        Ok(())
    });
    session.add_custom_filter(common::any_sink_caps(), sink).unwrap();

    assert_eq!(session.run().unwrap(), RunOutcome::Completed);
    assert_eq!(*refused.lock().unwrap(), Some(true));
}
