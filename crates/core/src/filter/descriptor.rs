//! Filter descriptors
//!
//! A descriptor is what the registry knows about a filter class: its capabilities, its
//! arguments, how many inputs it takes and how to build an instance.

use std::fmt;
use std::sync::Arc;

use super::args::{ArgDescriptor, FilterArgs};
use super::{Filter, FilterKind};
use crate::caps::Caps;
use crate::error::{Error, Result};
use crate::io::IoRegistry;

/// Builds a filter instance from validated arguments
pub type FilterFactory = Arc<dyn Fn(&FilterArgs) -> Result<FilterKind> + Send + Sync>;

/// Scores how well a filter handles a URL
pub type UrlProbe = Arc<dyn Fn(&str, &IoRegistry) -> ProbeScore + Send + Sync>;

/// URL probe result; higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeScore {
    NotSupported,
    MaybeSupported,
    Supported,
}

/// Scheduling placement hint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadAffinity {
    /// Any worker
    #[default]
    Any,
    /// Only the thread that called `Session::run`
    Main,
}

/// Registered filter class
#[derive(Clone)]
pub struct FilterDescriptor {
    pub name: String,
    pub description: String,
    pub caps: Caps,
    pub args: Vec<ArgDescriptor>,
    /// Maximum number of input PIDs, `None` for unlimited
    pub max_input_pids: Option<usize>,
    /// Never inserted by the linker, only loaded by name
    pub explicit_only: bool,
    pub affinity: ThreadAffinity,
    probe: Option<UrlProbe>,
    factory: FilterFactory,
}

impl fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("name", &self.name)
            .field("caps", &self.caps.statements().len())
            .field("args", &self.args.len())
            .field("max_input_pids", &self.max_input_pids)
            .field("explicit_only", &self.explicit_only)
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl FilterDescriptor {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn(&FilterArgs) -> Result<FilterKind> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            caps: Caps::default(),
            args: Vec::new(),
            max_input_pids: Some(1),
            explicit_only: false,
            affinity: ThreadAffinity::Any,
            probe: None,
            factory: Arc::new(factory),
        }
    }

    /// Descriptor for a native filter type
    pub fn native<F, M>(name: impl Into<String>, make: M) -> Self
    where
        F: Filter + 'static,
        M: Fn(&FilterArgs) -> Result<F> + Send + Sync + 'static,
    {
        Self::new(name, move |args| Ok(FilterKind::native(make(args)?)))
    }

    /// Descriptor of a host-built filter; it cannot be instantiated from the registry
    pub(crate) fn placeholder(name: impl Into<String>, caps: Caps) -> Self {
        let name = name.into();
        let msg = format!("filter '{}' is host-provided", name);
        let mut desc = Self::new(name, move |_| Err(Error::NotSupported(msg.clone())));
        desc.caps = caps;
        desc.explicit_only = true;
        desc.max_input_pids = None;
        desc
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_caps(mut self, caps: Caps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_arg(mut self, arg: ArgDescriptor) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_max_inputs(mut self, max: Option<usize>) -> Self {
        self.max_input_pids = max;
        self
    }

    pub fn explicit_only(mut self) -> Self {
        self.explicit_only = true;
        self
    }

    pub fn with_affinity(mut self, affinity: ThreadAffinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_probe(
        mut self,
        probe: impl Fn(&str, &IoRegistry) -> ProbeScore + Send + Sync + 'static,
    ) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Validates `text` (`key=value:...`) against the declared arguments
    pub fn parse_args(&self, text: &str) -> Result<FilterArgs> {
        FilterArgs::parse(&self.name, &self.args, text)
    }

    pub fn default_args(&self) -> Result<FilterArgs> {
        FilterArgs::defaults(&self.name, &self.args)
    }

    pub fn instantiate(&self, args: &FilterArgs) -> Result<FilterKind> {
        (self.factory)(args)
    }

    pub fn probe(&self, url: &str, io: &IoRegistry) -> ProbeScore {
        self.probe
            .as_ref()
            .map_or(ProbeScore::NotSupported, |probe| probe(url, io))
    }

    pub fn can_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// No input capabilities
    pub fn is_source(&self) -> bool {
        !self.caps.has_inputs()
    }

    /// No output capabilities
    pub fn is_sink(&self) -> bool {
        !self.caps.has_outputs()
    }
}
