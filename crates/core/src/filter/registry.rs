//! Filter registry
//!
//! Descriptors are kept in declaration order; the linker uses that order to break ties
//! between equally short chains.

use std::sync::{Arc, RwLock};

use super::descriptor::{FilterDescriptor, ProbeScore};
use crate::error::{Error, Result};
use crate::io::IoRegistry;

/// Registry of filter descriptors
///
/// Uses `RwLock` internally: registration is write-locked, lookups are read-locked.
#[derive(Default)]
pub struct FilterRegistry {
    descriptors: RwLock<Vec<Arc<FilterDescriptor>>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.names())
            .finish()
    }
}

impl FilterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in filters
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for desc in crate::filters::builtin_descriptors() {
            if let Err(e) = registry.register(desc) {
                tracing::warn!("Failed to register built-in filter: {}", e);
            }
        }
        registry
    }

    /// Register a descriptor
    ///
    /// # Errors
    ///
    /// Returns `Config` if a filter with the same name is already registered.
    pub fn register(&self, descriptor: FilterDescriptor) -> Result<Arc<FilterDescriptor>> {
        let mut descriptors = self
            .descriptors
            .write()
            .map_err(|e| Error::Other(format!("Failed to acquire registry lock: {}", e)))?;
        if descriptors.iter().any(|d| d.name == descriptor.name) {
            return Err(Error::Config(format!(
                "Filter '{}' is already registered",
                descriptor.name
            )));
        }
        tracing::debug!(filter = %descriptor.name, "registered filter");
        let descriptor = Arc::new(descriptor);
        descriptors.push(descriptor.clone());
        Ok(descriptor)
    }

    /// Get a descriptor by name
    pub fn get(&self, name: &str) -> Option<Arc<FilterDescriptor>> {
        self.descriptors
            .read()
            .ok()
            .and_then(|d| d.iter().find(|d| d.name == name).cloned())
    }

    /// All descriptors in declaration order
    pub fn descriptors(&self) -> Vec<Arc<FilterDescriptor>> {
        self.descriptors
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors().iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-scoring source filter for `url`
    pub fn probe_source(&self, url: &str, io: &IoRegistry) -> Option<Arc<FilterDescriptor>> {
        self.best_probe(url, io, |d| d.is_source())
    }

    /// Best-scoring sink filter for `url`
    pub fn probe_destination(&self, url: &str, io: &IoRegistry) -> Option<Arc<FilterDescriptor>> {
        self.best_probe(url, io, |d| !d.is_source() && d.is_sink())
    }

    fn best_probe(
        &self,
        url: &str,
        io: &IoRegistry,
        accept: impl Fn(&FilterDescriptor) -> bool,
    ) -> Option<Arc<FilterDescriptor>> {
        let mut best: Option<(ProbeScore, Arc<FilterDescriptor>)> = None;
        for desc in self.descriptors() {
            if !desc.can_probe() || !accept(&desc) {
                continue;
            }
            let score = desc.probe(url, io);
            if score == ProbeScore::NotSupported {
                continue;
            }
            // first declared wins on equal score
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, desc));
            }
        }
        best.map(|(_, d)| d)
    }
}
