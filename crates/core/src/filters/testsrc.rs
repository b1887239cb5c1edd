//! Synthetic audio/video source
//!
//! Produces raw video frames and raw PCM blocks with exact timestamps until `dur` seconds of
//! media have been emitted. Payloads are filled with the frame index so consumers can check
//! ordering.

use crate::error::{Error, Result};
use crate::filter::{ArgDescriptor, Filter, FilterArgs, FilterContext, FilterDescriptor, ProcessStatus};
use crate::caps::Caps;
use crate::packet::SapType;
use crate::pid::OutputPid;
use crate::props::{
    AudioFormat, CodecId, Fraction, Fraction64, PixelFormat, PropertyId, PropertyKind, PropertyValue,
    StreamType,
};

const SAMPLE_RATE: u32 = 44_100;
const CHANNELS: u32 = 2;
const SAMPLES_PER_FRAME: u32 = 1024;

struct VideoTrack {
    pid: OutputPid,
    fps: Fraction,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    frame: u64,
}

impl VideoTrack {
    fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    /// Timescale is the frame rate numerator, one frame lasts `den` ticks
    fn cts(&self) -> u64 {
        self.frame * u64::from(self.fps.den)
    }

    fn end_reached(&self, dur: f64) -> bool {
        self.cts() as f64 >= dur * self.fps.num as f64
    }

    fn publish(&self) {
        let pid = &self.pid;
        pid.set_property(PropertyId::StreamType, Some(StreamType::Visual.into()));
        pid.set_property(PropertyId::CodecId, Some(CodecId::Raw.into()));
        pid.set_property(PropertyId::Timescale, Some((self.fps.num as u32).into()));
        pid.set_property(PropertyId::Fps, Some(self.fps.into()));
        pid.set_property(PropertyId::Width, Some(self.width.into()));
        pid.set_property(PropertyId::Height, Some(self.height.into()));
        pid.set_property(PropertyId::PixelFormat, Some(self.pixel_format.into()));
    }
}

struct AudioTrack {
    pid: OutputPid,
    frame: u64,
}

impl AudioTrack {
    fn cts(&self) -> u64 {
        self.frame * u64::from(SAMPLES_PER_FRAME)
    }

    fn end_reached(&self, dur: f64) -> bool {
        self.cts() as f64 >= dur * f64::from(SAMPLE_RATE)
    }
}

/// `testsrc` filter
pub struct TestSource {
    dur: f64,
    fps: Fraction,
    size: (u32, u32),
    video_enabled: bool,
    audio_enabled: bool,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
}

fn parse_size(text: &str) -> Result<(u32, u32)> {
    let bad = || Error::BadParam(format!("invalid size '{}', expected WxH", text));
    let (w, h) = text.split_once(['x', 'X']).ok_or_else(bad)?;
    let w: u32 = w.trim().parse().map_err(|_| bad())?;
    let h: u32 = h.trim().parse().map_err(|_| bad())?;
    if w == 0 || h == 0 {
        return Err(bad());
    }
    Ok((w, h))
}

impl TestSource {
    pub fn from_args(args: &FilterArgs) -> Result<Self> {
        let dur = args.get_f64("dur").unwrap_or(10.0);
        if dur < 0.0 {
            return Err(Error::BadParam(format!("negative duration {}", dur)));
        }
        let fps = args.get_fraction("fps").unwrap_or(Fraction::new(25, 1));
        if fps.num <= 0 || fps.den == 0 {
            return Err(Error::BadParam(format!("invalid frame rate {}/{}", fps.num, fps.den)));
        }
        let size = parse_size(args.get_str("size").unwrap_or("320x240"))?;
        let streams = args.get_str("streams").unwrap_or("av");
        Ok(Self {
            dur,
            fps,
            size,
            video_enabled: streams.contains('v'),
            audio_enabled: streams.contains('a'),
            video: None,
            audio: None,
        })
    }

    fn emit_video(&mut self) -> Result<()> {
        let Some(track) = self.video.as_mut() else {
            return Ok(());
        };
        if track.pid.is_eos() || track.pid.would_block() {
            return Ok(());
        }
        if track.end_reached(self.dur) {
            track.pid.set_eos();
            return Ok(());
        }
        let pck = track.pid.new_packet(track.frame_size())?;
        let fill = track.frame as u8;
        pck.with_data_mut(|data| data.fill(fill))?;
        pck.set_cts(Some(track.cts()))?;
        pck.set_dts(Some(track.cts()))?;
        pck.set_duration(track.fps.den)?;
        pck.set_sap(SapType::Sap1)?;
        pck.send()?;
        track.frame += 1;
        Ok(())
    }

    fn emit_audio(&mut self) -> Result<()> {
        let Some(track) = self.audio.as_mut() else {
            return Ok(());
        };
        if track.pid.is_eos() || track.pid.would_block() {
            return Ok(());
        }
        if track.end_reached(self.dur) {
            track.pid.set_eos();
            return Ok(());
        }
        let size = (SAMPLES_PER_FRAME * CHANNELS) as usize * AudioFormat::S16.bytes_per_sample();
        let pck = track.pid.new_packet(size)?;
        let fill = track.frame as u8;
        pck.with_data_mut(|data| data.fill(fill))?;
        pck.set_cts(Some(track.cts()))?;
        pck.set_dts(Some(track.cts()))?;
        pck.set_duration(SAMPLES_PER_FRAME)?;
        pck.set_sap(SapType::Sap1)?;
        pck.send()?;
        track.frame += 1;
        Ok(())
    }

    fn all_eos(&self) -> bool {
        self.video.as_ref().map_or(true, |t| t.pid.is_eos())
            && self.audio.as_ref().map_or(true, |t| t.pid.is_eos())
    }
}

impl Filter for TestSource {
    fn initialize(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let duration = Fraction64::new((self.dur * 1000.0).round() as i64, 1000);
        if self.video_enabled {
            let track = VideoTrack {
                pid: ctx.new_output_pid(),
                fps: self.fps,
                width: self.size.0,
                height: self.size.1,
                pixel_format: PixelFormat::Yuv420,
                frame: 0,
            };
            track.pid.set_name("video");
            track.publish();
            track.pid.set_info(PropertyId::Duration, Some(duration.into()));
            self.video = Some(track);
        }
        if self.audio_enabled {
            let pid = ctx.new_output_pid();
            pid.set_name("audio");
            pid.set_property(PropertyId::StreamType, Some(StreamType::Audio.into()));
            pid.set_property(PropertyId::CodecId, Some(CodecId::Raw.into()));
            pid.set_property(PropertyId::Timescale, Some(SAMPLE_RATE.into()));
            pid.set_property(PropertyId::SampleRate, Some(SAMPLE_RATE.into()));
            pid.set_property(PropertyId::NumChannels, Some(CHANNELS.into()));
            pid.set_property(PropertyId::AudioFormat, Some(AudioFormat::S16.into()));
            pid.set_info(PropertyId::Duration, Some(duration.into()));
            self.audio = Some(AudioTrack { pid, frame: 0 });
        }
        tracing::debug!(
            filter = %ctx.filter_name(),
            video = self.video_enabled,
            audio = self.audio_enabled,
            dur = self.dur,
            "test source ready"
        );
        Ok(())
    }

    fn process(&mut self, _ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        self.emit_video()?;
        self.emit_audio()?;
        if self.all_eos() {
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    }

    /// Pixel format and frame size changes are applied in place
    fn reconfigure_output(&mut self, _ctx: &mut FilterContext<'_>, pid: &OutputPid) -> Result<()> {
        let Some(track) = self.video.as_mut().filter(|t| t.pid.id() == pid.id()) else {
            return Err(Error::NotSupported("audio output cannot be reconfigured".into()));
        };
        let mut changed = false;
        if let Some(value) = pid.negotiated_property(PropertyId::PixelFormat) {
            let PropertyValue::PixelFormat(format) = value else {
                return Err(Error::BadParam(format!("not a pixel format: {}", value)));
            };
            track.pixel_format = format;
            changed = true;
        }
        for (id, slot) in [
            (PropertyId::Width, &mut track.width),
            (PropertyId::Height, &mut track.height),
        ] {
            if let Some(value) = pid.negotiated_property(id) {
                *slot = value
                    .as_u32()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| Error::BadParam(format!("invalid {}: {}", id, value)))?;
                changed = true;
            }
        }
        if !changed {
            return Err(Error::NotSupported("only pixel format and size can be negotiated".into()));
        }
        track.publish();
        tracing::debug!(pid = %pid.name(), format = %track.pixel_format, "test source output reconfigured");
        Ok(())
    }
}

pub fn descriptor() -> FilterDescriptor {
    FilterDescriptor::native("testsrc", TestSource::from_args)
        .with_description("Synthetic raw audio/video source")
        .with_caps(
            Caps::builder()
                .output(PropertyId::StreamType, StreamType::Visual)
                .output(PropertyId::CodecId, CodecId::Raw)
                .output_any(PropertyId::PixelFormat)
                .named("video")
                .next_bundle()
                .output(PropertyId::StreamType, StreamType::Audio)
                .output(PropertyId::CodecId, CodecId::Raw)
                .output(PropertyId::AudioFormat, AudioFormat::S16)
                .named("audio")
                .build(),
        )
        .with_max_inputs(Some(0))
        .with_arg(
            ArgDescriptor::new("dur", PropertyKind::Double)
                .with_default("10")
                .with_description("duration in seconds"),
        )
        .with_arg(
            ArgDescriptor::new("fps", PropertyKind::Fraction)
                .with_default("25")
                .with_description("video frame rate"),
        )
        .with_arg(
            ArgDescriptor::new("size", PropertyKind::String)
                .with_default("320x240")
                .with_description("video frame size"),
        )
        .with_arg(
            ArgDescriptor::new("streams", PropertyKind::String)
                .with_values(&["a", "v", "av"])
                .with_default("av")
                .with_description("streams to generate"),
        )
}
