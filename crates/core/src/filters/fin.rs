//! File reader
//!
//! Reads a resource through the session's virtual I/O and emits it as a `file` stream in
//! fixed-size blocks. The first block carries the frame start flag, the last one the frame
//! end flag, every block its byte offset. Progress is published as the filter status when
//! the resource size is known.

use std::io::SeekFrom;

use crate::caps::Caps;
use crate::error::{Error, Result};
use crate::filter::{
    ArgDescriptor, Filter, FilterArgs, FilterContext, FilterDescriptor, ProbeScore, ProcessStatus,
};
use crate::io::{IoHandle, IoMode, IoRegistry};
use crate::pid::OutputPid;
use crate::props::{PropertyId, PropertyKind, StreamType};

pub(crate) fn file_extension(url: &str) -> Option<String> {
    let name = url.rsplit(['/', '\\']).next()?;
    let name = name.split(['?', '#']).next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub(crate) fn file_name(url: &str) -> &str {
    url.rsplit(['/', '\\']).next().unwrap_or(url)
}

/// `fin` filter
pub struct FileInput {
    src: String,
    block_size: usize,
    handle: Option<Box<dyn IoHandle>>,
    pid: Option<OutputPid>,
    offset: u64,
    size: Option<u64>,
}

impl FileInput {
    pub fn from_args(args: &FilterArgs) -> Result<Self> {
        let src = args
            .get_str("src")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadParam("fin needs a src URL".into()))?
            .to_string();
        let block_size = args.get_u32("block_size").unwrap_or(5000) as usize;
        if block_size == 0 {
            return Err(Error::BadParam("block_size must be positive".into()));
        }
        Ok(Self {
            src,
            block_size,
            handle: None,
            pid: None,
            offset: 0,
            size: None,
        })
    }

    fn finish(&mut self, ctx: &FilterContext<'_>) -> Result<ProcessStatus> {
        if let Some(handle) = self.handle.take() {
            handle.close()?;
        }
        if let Some(pid) = &self.pid {
            pid.set_eos();
        }
        ctx.set_status(format!("read {} bytes", self.offset), Some(100.0));
        tracing::debug!(src = %self.src, bytes = self.offset, "file read complete");
        Ok(ProcessStatus::EndOfStream)
    }
}

impl Filter for FileInput {
    fn initialize(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let mut handle = ctx.io().open(&self.src, IoMode::Read)?;
        self.size = match handle.seek(SeekFrom::End(0)) {
            Ok(end) => {
                handle.seek(SeekFrom::Start(0))?;
                Some(end).filter(|&end| end > 0)
            }
            Err(_) => None,
        };
        let pid = ctx.new_output_pid();
        pid.set_property(PropertyId::StreamType, Some(StreamType::File.into()));
        pid.set_property(PropertyId::Url, Some(self.src.as_str().into()));
        pid.set_property(PropertyId::FileName, Some(file_name(&self.src).into()));
        if let Some(ext) = file_extension(&self.src) {
            pid.set_property(PropertyId::FileExt, Some(ext.into()));
        }
        self.handle = Some(handle);
        self.pid = Some(pid);
        Ok(())
    }

    fn process(&mut self, ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        let (Some(handle), Some(pid)) = (self.handle.as_mut(), self.pid.as_ref()) else {
            return Ok(ProcessStatus::EndOfStream);
        };
        if pid.would_block() {
            return Ok(ProcessStatus::Continue);
        }
        let mut buf = vec![0u8; self.block_size];
        let n = handle.read(&mut buf)?;
        if n == 0 {
            return self.finish(ctx);
        }
        let at_end = handle.eof();
        let pck = pid.new_packet(n)?;
        pck.write(0, &buf[..n])?;
        pck.set_framing(self.offset == 0, at_end)?;
        pck.set_byte_offset(Some(self.offset))?;
        pck.send()?;
        self.offset += n as u64;
        if at_end {
            return self.finish(ctx);
        }
        let percent = self.size.map(|size| self.offset as f32 * 100.0 / size as f32);
        ctx.set_status(format!("reading {}", self.src), percent);
        Ok(ProcessStatus::Continue)
    }
}

fn probe(url: &str, io: &IoRegistry) -> ProbeScore {
    if io.probe(url) {
        ProbeScore::Supported
    } else {
        ProbeScore::NotSupported
    }
}

pub fn descriptor() -> FilterDescriptor {
    FilterDescriptor::native("fin", FileInput::from_args)
        .with_description("Reads a file or virtual I/O resource")
        .with_caps(
            Caps::builder()
                .output(PropertyId::StreamType, StreamType::File)
                .build(),
        )
        .with_max_inputs(Some(0))
        .with_probe(probe)
        .with_arg(ArgDescriptor::new("src", PropertyKind::String).with_description("source URL"))
        .with_arg(
            ArgDescriptor::new("block_size", PropertyKind::UInt)
                .with_default("5000")
                .with_description("bytes per packet"),
        )
}
