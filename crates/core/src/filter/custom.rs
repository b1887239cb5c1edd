//! Host-callback filters
//!
//! A [`CustomFilter`] is assembled from closures instead of a type implementing [`Filter`].
//! Missing callbacks fall back to the trait defaults, except `process`: without one, the
//! filter drains its inputs and reports end of stream once every input did.

use super::{ArgDescriptor, Filter, FilterContext, ProcessStatus};
use crate::error::{Error, Result};
use crate::event::FilterEvent;
use crate::pid::{InputPid, OutputPid};
use crate::props::PropertyValue;

type InitializeFn = Box<dyn FnMut(&mut FilterContext<'_>) -> Result<()> + Send>;
type ConfigureFn = Box<dyn FnMut(&mut FilterContext<'_>, &InputPid, bool) -> Result<()> + Send>;
type ProcessFn = Box<dyn FnMut(&mut FilterContext<'_>) -> Result<ProcessStatus> + Send>;
type EventFn = Box<dyn FnMut(&mut FilterContext<'_>, &FilterEvent) -> bool + Send>;
type ReconfigureFn = Box<dyn FnMut(&mut FilterContext<'_>, &OutputPid) -> Result<()> + Send>;
type UpdateArgFn = Box<dyn FnMut(&mut FilterContext<'_>, &str, &PropertyValue) -> Result<()> + Send>;
type FinalizeFn = Box<dyn FnMut(&mut FilterContext<'_>) + Send>;

/// Filter driven by host-supplied callbacks
pub struct CustomFilter {
    name: String,
    args: Vec<ArgDescriptor>,
    initialize: Option<InitializeFn>,
    configure: Option<ConfigureFn>,
    process: Option<ProcessFn>,
    event: Option<EventFn>,
    reconfigure: Option<ReconfigureFn>,
    update_arg: Option<UpdateArgFn>,
    finalize: Option<FinalizeFn>,
}

impl CustomFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            initialize: None,
            configure: None,
            process: None,
            event: None,
            reconfigure: None,
            update_arg: None,
            finalize: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares an argument the host may change with `Session::update_filter_arg`
    pub fn with_arg(mut self, arg: ArgDescriptor) -> Self {
        self.args.push(arg);
        self
    }

    pub fn arg_descriptors(&self) -> &[ArgDescriptor] {
        &self.args
    }

    pub fn on_initialize(
        mut self,
        f: impl FnMut(&mut FilterContext<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.initialize = Some(Box::new(f));
        self
    }

    pub fn on_configure(
        mut self,
        f: impl FnMut(&mut FilterContext<'_>, &InputPid, bool) -> Result<()> + Send + 'static,
    ) -> Self {
        self.configure = Some(Box::new(f));
        self
    }

    pub fn on_process(
        mut self,
        f: impl FnMut(&mut FilterContext<'_>) -> Result<ProcessStatus> + Send + 'static,
    ) -> Self {
        self.process = Some(Box::new(f));
        self
    }

    pub fn on_event(
        mut self,
        f: impl FnMut(&mut FilterContext<'_>, &FilterEvent) -> bool + Send + 'static,
    ) -> Self {
        self.event = Some(Box::new(f));
        self
    }

    pub fn on_reconfigure_output(
        mut self,
        f: impl FnMut(&mut FilterContext<'_>, &OutputPid) -> Result<()> + Send + 'static,
    ) -> Self {
        self.reconfigure = Some(Box::new(f));
        self
    }

    pub fn on_update_arg(
        mut self,
        f: impl FnMut(&mut FilterContext<'_>, &str, &PropertyValue) -> Result<()> + Send + 'static,
    ) -> Self {
        self.update_arg = Some(Box::new(f));
        self
    }

    pub fn on_finalize(mut self, f: impl FnMut(&mut FilterContext<'_>) + Send + 'static) -> Self {
        self.finalize = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFilter")
            .field("name", &self.name)
            .field("process", &self.process.is_some())
            .field("configure", &self.configure.is_some())
            .field("event", &self.event.is_some())
            .finish()
    }
}

fn drain_inputs(ctx: &mut FilterContext<'_>) -> ProcessStatus {
    let inputs = ctx.inputs();
    for pid in &inputs {
        while pid.get_packet().is_some() {
            pid.drop_packet();
        }
    }
    if !inputs.is_empty() && inputs.iter().all(|p| p.is_eos()) {
        ProcessStatus::EndOfStream
    } else {
        ProcessStatus::Continue
    }
}

impl Filter for CustomFilter {
    fn initialize(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        match self.initialize.as_mut() {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }

    fn configure(&mut self, ctx: &mut FilterContext<'_>, pid: &InputPid, is_remove: bool) -> Result<()> {
        match self.configure.as_mut() {
            Some(f) => f(ctx, pid, is_remove),
            None => Ok(()),
        }
    }

    fn process(&mut self, ctx: &mut FilterContext<'_>) -> Result<ProcessStatus> {
        match self.process.as_mut() {
            Some(f) => f(ctx),
            None => Ok(drain_inputs(ctx)),
        }
    }

    fn process_event(&mut self, ctx: &mut FilterContext<'_>, event: &FilterEvent) -> bool {
        self.event.as_mut().is_some_and(|f| f(ctx, event))
    }

    fn reconfigure_output(&mut self, ctx: &mut FilterContext<'_>, pid: &OutputPid) -> Result<()> {
        match self.reconfigure.as_mut() {
            Some(f) => f(ctx, pid),
            None => Err(Error::NotSupported(format!(
                "filter '{}' cannot reconfigure its outputs",
                self.name
            ))),
        }
    }

    fn update_arg(&mut self, ctx: &mut FilterContext<'_>, name: &str, value: &PropertyValue) -> Result<()> {
        match self.update_arg.as_mut() {
            Some(f) => f(ctx, name, value),
            None => Err(Error::NotSupported(format!(
                "filter '{}' cannot update argument '{}'",
                self.name, name
            ))),
        }
    }

    fn finalize(&mut self, ctx: &mut FilterContext<'_>) {
        if let Some(f) = self.finalize.as_mut() {
            f(ctx);
        }
    }
}
