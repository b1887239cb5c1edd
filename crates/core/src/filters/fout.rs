//! File writer
//!
//! Writes the payload of a `file` stream to a resource of the session's virtual I/O. The
//! destination is opened when the input PID is configured, so an unwritable destination fails
//! the connection rather than the session.

use crate::caps::Caps;
use crate::error::{Error, Result};
use crate::filter::{
    ArgDescriptor, Filter, FilterArgs, FilterContext, FilterDescriptor, ProbeScore, ProcessStatus,
};
use crate::io::{IoHandle, IoMode, IoRegistry};
use crate::pid::InputPid;
use crate::props::{PropertyId, PropertyKind, StreamType};

/// `fout` filter
pub struct FileOutput {
    dst: String,
    append: bool,
    handle: Option<Box<dyn IoHandle>>,
    written: u64,
}

impl FileOutput {
    pub fn from_args(args: &FilterArgs) -> Result<Self> {
        let dst = args
            .get_str("dst")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadParam("fout needs a dst URL".into()))?
            .to_string();
        Ok(Self {
            dst,
            append: args.get_bool("append"),
            handle: None,
            written: 0,
        })
    }

    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.close()?;
            tracing::debug!(dst = %self.dst, bytes = self.written, "file written");
        }
        Ok(())
    }
}

impl Filter for FileOutput {
    fn configure(&mut self, ctx: &mut FilterContext<'_>, pid: &InputPid, is_remove: bool) -> Result<()> {
        if is_remove {
            return self.close();
        }
        if self.handle.is_none() {
            let mode = if self.append { IoMode::Append } else { IoMode::Write };
            self.handle = Some(ctx.io().open(&self.dst, mode)?);
            tracing::debug!(dst = %self.dst, source = %pid.source_filter(), "output opened");
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        let Some(pid) = ctx.input(0) else {
            return Ok(ProcessStatus::Continue);
        };
        while let Some(pck) = pid.get_packet() {
            let handle = self
                .handle
                .as_mut()
                .ok_or_else(|| Error::BadParam(format!("'{}' is not open", self.dst)))?;
            let data = pck.data();
            let mut done = 0;
            while done < data.len() {
                let n = handle.write(&data[done..])?;
                if n == 0 {
                    return Err(Error::ServiceError(format!("short write on '{}'", self.dst)));
                }
                done += n;
            }
            self.written += data.len() as u64;
            pid.drop_packet();
        }
        if pid.is_eos() {
            self.close()?;
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    }

    fn finalize(&mut self, _ctx: &mut FilterContext<'_>) {
        if let Err(e) = self.close() {
            tracing::warn!(dst = %self.dst, "closing output failed: {}", e);
        }
    }
}

fn probe(url: &str, io: &IoRegistry) -> ProbeScore {
    if io.handles(url) {
        ProbeScore::MaybeSupported
    } else {
        ProbeScore::NotSupported
    }
}

pub fn descriptor() -> FilterDescriptor {
    FilterDescriptor::native("fout", FileOutput::from_args)
        .with_description("Writes a file stream to a file or virtual I/O resource")
        .with_caps(
            Caps::builder()
                .input(PropertyId::StreamType, StreamType::File)
                .build(),
        )
        .with_probe(probe)
        .with_arg(ArgDescriptor::new("dst", PropertyKind::String).with_description("destination URL"))
        .with_arg(
            ArgDescriptor::new("append", PropertyKind::Bool)
                .with_default("false")
                .with_description("append instead of truncating"),
        )
}
