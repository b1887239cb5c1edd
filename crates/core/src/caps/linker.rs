//! Auto-linker
//!
//! Finds the chain of registered filters connecting a producer's stream to a destination's
//! input capabilities. A direct match wins; otherwise a breadth-first search inserts
//! intermediate filters up to `max_chain` hops. Among chains of equal length the one with the
//! lowest summed bundle priority wins, then the first one in registry declaration order.

use std::fmt;
use std::sync::Arc;

use super::matching::{first_matching_bundle, match_bundle, CapState};
use super::Caps;
use crate::error::{Error, Result};
use crate::filter::{FilterDescriptor, FilterRegistry};
use crate::props::PropertyMap;

/// One intermediate filter of a chain
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub descriptor: Arc<FilterDescriptor>,
    /// Capability bundle the filter is used with
    pub bundle: usize,
}

/// Resolved link; an empty chain is a direct connection
#[derive(Debug, Clone)]
pub struct LinkChain {
    pub steps: Vec<ChainStep>,
    /// Bundle of the destination accepting the chain output
    pub dest_bundle: usize,
}

impl LinkChain {
    pub fn is_direct(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.descriptor.name.as_str()).collect()
    }
}

impl fmt::Display for LinkChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_direct() {
            f.write_str("(direct)")
        } else {
            f.write_str(&self.names().join(" -> "))
        }
    }
}

/// What to connect
pub struct LinkRequest<'a> {
    /// Stream state leaving the producer
    pub start: CapState,
    pub dest: &'a Caps,
    /// Property values the destination must receive
    pub required: Option<&'a PropertyMap>,
    /// Accept an empty chain
    pub allow_direct: bool,
    /// Descriptor names never inserted
    pub exclude: Vec<String>,
}

impl<'a> LinkRequest<'a> {
    pub fn new(start: CapState, dest: &'a Caps) -> Self {
        Self {
            start,
            dest,
            required: None,
            allow_direct: true,
            exclude: Vec::new(),
        }
    }
}

struct SearchNode {
    state: CapState,
    path: Vec<(usize, usize)>,
    priority: u32,
}

/// Chain resolver over a registry
pub struct Linker<'a> {
    registry: &'a FilterRegistry,
    max_chain: usize,
}

impl<'a> Linker<'a> {
    pub fn new(registry: &'a FilterRegistry, max_chain: usize) -> Self {
        Self {
            registry,
            max_chain,
        }
    }

    pub fn resolve(&self, req: &LinkRequest<'_>) -> Result<LinkChain> {
        let accepts = |state: &CapState| -> Option<usize> {
            if let Some(required) = req.required {
                if !state.satisfies(required) {
                    return None;
                }
            }
            first_matching_bundle(state, req.dest)
        };

        if req.allow_direct {
            if let Some(dest_bundle) = accepts(&req.start) {
                return Ok(LinkChain {
                    steps: Vec::new(),
                    dest_bundle,
                });
            }
        }

        let candidates: Vec<Arc<FilterDescriptor>> = self
            .registry
            .descriptors()
            .into_iter()
            .filter(|d| {
                !d.explicit_only
                    && d.caps.has_inputs()
                    && d.caps.has_outputs()
                    && !req.exclude.iter().any(|n| n == &d.name)
            })
            .collect();

        let mut seen: Vec<(usize, usize, CapState)> = Vec::new();
        let mut frontier = vec![SearchNode {
            state: req.start.clone(),
            path: Vec::new(),
            priority: 0,
        }];
        for depth in 1..=self.max_chain {
            let mut next = Vec::new();
            let mut found: Vec<(u32, Vec<(usize, usize)>, usize)> = Vec::new();
            for node in &frontier {
                for (idx, desc) in candidates.iter().enumerate() {
                    if node.path.iter().any(|(d, _)| *d == idx) {
                        continue;
                    }
                    for bundle in desc.caps.bundles() {
                        if !bundle.has_outputs() || !match_bundle(&node.state, &bundle) {
                            continue;
                        }
                        let state = node.state.apply_outputs(&bundle);
                        if seen
                            .iter()
                            .any(|(d, b, s)| *d == idx && *b == bundle.index && *s == state)
                        {
                            continue;
                        }
                        seen.push((idx, bundle.index, state.clone()));
                        let mut path = node.path.clone();
                        path.push((idx, bundle.index));
                        let priority = node.priority + u32::from(bundle.priority());
                        if let Some(dest_bundle) = accepts(&state) {
                            found.push((priority, path, dest_bundle));
                            continue;
                        }
                        next.push(SearchNode {
                            state,
                            path,
                            priority,
                        });
                    }
                }
            }
            // first of the lowest priority, so declaration order breaks remaining ties
            if let Some((_, path, dest_bundle)) = found.into_iter().min_by_key(|(p, _, _)| *p) {
                tracing::trace!(depth, "link chain found");
                return Ok(LinkChain {
                    steps: path
                        .into_iter()
                        .map(|(d, bundle)| ChainStep {
                            descriptor: candidates[d].clone(),
                            bundle,
                        })
                        .collect(),
                    dest_bundle,
                });
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Err(Error::FilterNotFound(format!(
            "no filter chain of at most {} filters satisfies the destination capabilities",
            self.max_chain
        )))
    }

    /// Chain from a concrete PID to `dest`
    pub fn resolve_props(&self, props: &PropertyMap, dest: &Caps) -> Result<LinkChain> {
        self.resolve(&LinkRequest::new(CapState::from_props(props), dest))
    }

    /// Chain from any output bundle of `src` to `dst`
    pub fn resolve_descriptors(
        &self,
        src: &FilterDescriptor,
        dst: &FilterDescriptor,
    ) -> Result<LinkChain> {
        for bundle in src.caps.bundles().iter().filter(|b| b.has_outputs()) {
            let req = LinkRequest::new(CapState::from_outputs(bundle), &dst.caps);
            if let Ok(chain) = self.resolve(&req) {
                return Ok(chain);
            }
        }
        Err(Error::FilterNotFound(format!(
            "no filter chain from '{}' to '{}'",
            src.name, dst.name
        )))
    }
}
