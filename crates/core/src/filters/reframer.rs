//! Pass-through reframer
//!
//! Mirrors every input PID on an output PID and forwards packets without copying their
//! payload. With `saps`, only random access points are forwarded.

use crate::caps::Caps;
use crate::error::Result;
use crate::filter::{ArgDescriptor, Filter, FilterArgs, FilterContext, FilterDescriptor, ProcessStatus};
use crate::packet::Packet;
use crate::pid::{InputPid, OutputPid, PidId};
use crate::props::{PropertyId, PropertyKind};

struct Route {
    input: InputPid,
    output: OutputPid,
}

/// `reframer` filter
pub struct Reframer {
    saps_only: bool,
    routes: Vec<Route>,
    dropped: u64,
}

impl Reframer {
    pub fn from_args(args: &FilterArgs) -> Result<Self> {
        Ok(Self {
            saps_only: args.get_bool("saps"),
            routes: Vec::new(),
            dropped: 0,
        })
    }

    fn route_index(&self, input: PidId) -> Option<usize> {
        self.routes.iter().position(|r| r.input.id() == input)
    }
}

impl Filter for Reframer {
    fn configure(&mut self, ctx: &mut FilterContext<'_>, pid: &InputPid, is_remove: bool) -> Result<()> {
        let existing = self.route_index(pid.id());
        if is_remove {
            if let Some(idx) = existing {
                let route = self.routes.remove(idx);
                ctx.remove_output(&route.output);
            }
            return Ok(());
        }
        match existing {
            // property change upstream
            Some(idx) => self.routes[idx].output.copy_properties(pid),
            None => {
                let output = ctx.new_output_pid();
                output.copy_properties(pid);
                self.routes.push(Route {
                    input: pid.clone(),
                    output,
                });
            }
        }
        Ok(())
    }

    fn process(&mut self, _ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        let mut all_eos = !self.routes.is_empty();
        for route in &self.routes {
            while !route.output.would_block() {
                let Some(pck) = route.input.get_packet() else {
                    break;
                };
                if self.saps_only && !pck.sap().is_rap() {
                    self.dropped += 1;
                } else {
                    Packet::forward(&route.output, &pck)?.send()?;
                }
                route.input.drop_packet();
            }
            if route.input.is_eos() {
                if !route.output.is_eos() {
                    route.output.set_eos();
                }
            } else {
                all_eos = false;
            }
        }
        if all_eos {
            if self.dropped > 0 {
                tracing::debug!(dropped = self.dropped, "non-SAP packets skipped");
            }
            return Ok(ProcessStatus::EndOfStream);
        }
        Ok(ProcessStatus::Continue)
    }
}

pub fn descriptor() -> FilterDescriptor {
    FilterDescriptor::native("reframer", Reframer::from_args)
        .with_description("Forwards packets unchanged, one output per input")
        .with_caps(
            Caps::builder()
                .input_any(PropertyId::StreamType)
                .output_any(PropertyId::StreamType)
                .build(),
        )
        .with_max_inputs(None)
        .explicit_only()
        .with_arg(
            ArgDescriptor::new("saps", PropertyKind::Bool)
                .with_default("false")
                .with_description("only forward random access points"),
        )
}
