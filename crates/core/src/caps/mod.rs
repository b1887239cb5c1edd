//! Capability bundles
//!
//! A filter declares its capabilities as an ordered list of statements. Each statement names
//! a property and a value (or any value), and is flagged input or output. Consecutive
//! statements flagged `IN_BUNDLE` belong to the same bundle; a statement without the flag
//! opens a new one. `STATIC` statements belong to every bundle.
//!
//! ```
//! use filtergraph_core::caps::Caps;
//! use filtergraph_core::props::{CodecId, PropertyId, StreamType};
//!
//! // raw video in, AVC out; or raw audio in, AAC out
//! let caps = Caps::builder()
//!     .input(PropertyId::StreamType, StreamType::Visual)
//!     .input(PropertyId::CodecId, CodecId::Raw)
//!     .output(PropertyId::CodecId, CodecId::Avc)
//!     .next_bundle()
//!     .input(PropertyId::StreamType, StreamType::Audio)
//!     .input(PropertyId::CodecId, CodecId::Raw)
//!     .output(PropertyId::CodecId, CodecId::Aac)
//!     .build();
//! assert_eq!(caps.bundles().len(), 2);
//! ```

pub mod linker;
pub mod matching;

pub use linker::{ChainStep, LinkChain, LinkRequest, Linker};
pub use matching::{first_matching_bundle, match_bundle, props_match, CapState};

use bitflags::bitflags;

use crate::props::{PropertyKey, PropertyValue};

bitflags! {
    /// Flags of a capability statement
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapFlags: u8 {
        const INPUT = 1;
        const OUTPUT = 1 << 1;
        /// Continues the current bundle
        const IN_BUNDLE = 1 << 2;
        /// Value must not match
        const EXCLUDED = 1 << 3;
        /// Part of every bundle
        const STATIC = 1 << 4;
        /// Ignored when the property is absent or different
        const OPTIONAL = 1 << 5;
    }
}

/// One capability statement
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub key: PropertyKey,
    /// `None` matches any value
    pub value: Option<PropertyValue>,
    pub flags: CapFlags,
    /// Linker preference among chains of equal length; lower wins
    pub priority: u8,
}

impl Capability {
    pub fn is_input(&self) -> bool {
        self.flags.contains(CapFlags::INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(CapFlags::OUTPUT)
    }

    pub fn is_excluded(&self) -> bool {
        self.flags.contains(CapFlags::EXCLUDED)
    }

    pub fn is_optional(&self) -> bool {
        self.flags.contains(CapFlags::OPTIONAL)
    }

    /// True when `value` is accepted by this statement's value (ignoring the excluded flag)
    pub fn value_matches(&self, value: &PropertyValue) -> bool {
        self.value.as_ref().map_or(true, |v| v == value)
    }
}

/// Ordered capability statements of a filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Caps {
    caps: Vec<Capability>,
    names: Vec<(usize, String)>,
}

/// A view of one bundle, static statements included
#[derive(Debug, Clone)]
pub struct CapsBundle<'a> {
    pub index: usize,
    pub name: Option<&'a str>,
    caps: Vec<&'a Capability>,
}

impl<'a> CapsBundle<'a> {
    pub fn inputs(&self) -> impl Iterator<Item = &'a Capability> + '_ {
        self.caps.iter().copied().filter(|c| c.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &'a Capability> + '_ {
        self.caps.iter().copied().filter(|c| c.is_output())
    }

    pub fn has_inputs(&self) -> bool {
        self.inputs().next().is_some()
    }

    pub fn has_outputs(&self) -> bool {
        self.outputs().next().is_some()
    }

    /// Highest priority value set on a statement of the bundle
    pub fn priority(&self) -> u8 {
        self.caps.iter().map(|c| c.priority).max().unwrap_or(0)
    }
}

impl Caps {
    pub fn builder() -> CapsBuilder {
        CapsBuilder::default()
    }

    /// Builds caps from raw statements, flags taken as given
    pub fn from_statements(caps: Vec<Capability>) -> Self {
        Self {
            caps,
            names: Vec::new(),
        }
    }

    pub fn statements(&self) -> &[Capability] {
        &self.caps
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn has_inputs(&self) -> bool {
        self.caps.iter().any(|c| c.is_input())
    }

    pub fn has_outputs(&self) -> bool {
        self.caps.iter().any(|c| c.is_output())
    }

    /// Splits the statements into bundles
    pub fn bundles(&self) -> Vec<CapsBundle<'_>> {
        let statics: Vec<&Capability> = self
            .caps
            .iter()
            .filter(|c| c.flags.contains(CapFlags::STATIC))
            .collect();
        let mut groups: Vec<Vec<&Capability>> = Vec::new();
        let mut current: Vec<&Capability> = Vec::new();
        for cap in self.caps.iter().filter(|c| !c.flags.contains(CapFlags::STATIC)) {
            if !cap.flags.contains(CapFlags::IN_BUNDLE) && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current.push(cap);
        }
        if !current.is_empty() || (groups.is_empty() && !statics.is_empty()) {
            groups.push(current);
        }
        groups
            .into_iter()
            .enumerate()
            .map(|(index, mut caps)| {
                caps.extend(statics.iter().copied());
                CapsBundle {
                    index,
                    name: self
                        .names
                        .iter()
                        .find(|(i, _)| *i == index)
                        .map(|(_, n)| n.as_str()),
                    caps,
                }
            })
            .collect()
    }

    /// Output value declared for `key` in `bundle`, if the bundle declares a concrete one
    pub fn output_value(&self, bundle: usize, key: &PropertyKey) -> Option<PropertyValue> {
        self.bundles()
            .get(bundle)?
            .outputs()
            .find(|c| &c.key == key && !c.is_excluded())
            .and_then(|c| c.value.clone())
    }
}

/// Builder for [`Caps`]; bundles are opened with [`CapsBuilder::next_bundle`]
#[derive(Debug, Default)]
pub struct CapsBuilder {
    caps: Vec<Capability>,
    names: Vec<(usize, String)>,
    index: usize,
    started: bool,
}

impl CapsBuilder {
    /// Adds a raw statement; `IN_BUNDLE` is managed by the builder
    pub fn push(
        mut self,
        key: impl Into<PropertyKey>,
        value: Option<PropertyValue>,
        flags: CapFlags,
    ) -> Self {
        let mut flags = flags - CapFlags::IN_BUNDLE;
        if !flags.contains(CapFlags::STATIC) {
            if self.started {
                flags |= CapFlags::IN_BUNDLE;
            }
            self.started = true;
        }
        self.caps.push(Capability {
            key: key.into(),
            value,
            flags,
            priority: 0,
        });
        self
    }

    pub fn input(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::INPUT)
    }

    /// Input accepting any value of `key` (the property must be present)
    pub fn input_any(self, key: impl Into<PropertyKey>) -> Self {
        self.push(key, None, CapFlags::INPUT)
    }

    pub fn input_excluded(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::INPUT | CapFlags::EXCLUDED)
    }

    pub fn input_optional(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::INPUT | CapFlags::OPTIONAL)
    }

    pub fn output(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::OUTPUT)
    }

    /// Output that can take any value of `key`
    pub fn output_any(self, key: impl Into<PropertyKey>) -> Self {
        self.push(key, None, CapFlags::OUTPUT)
    }

    pub fn output_excluded(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::OUTPUT | CapFlags::EXCLUDED)
    }

    pub fn static_input(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::INPUT | CapFlags::STATIC)
    }

    pub fn static_output(self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Self {
        self.push(key, Some(value.into()), CapFlags::OUTPUT | CapFlags::STATIC)
    }

    /// Sets the priority of the last statement; the linker prefers lower values among chains
    /// of the same length
    pub fn priority(mut self, priority: u8) -> Self {
        if let Some(last) = self.caps.last_mut() {
            last.priority = priority;
        }
        self
    }

    /// Names the current bundle
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.names.push((self.index, name.into()));
        self
    }

    /// Closes the current bundle; following statements open a new one
    pub fn next_bundle(mut self) -> Self {
        if self.started {
            self.index += 1;
            self.started = false;
        }
        self
    }

    pub fn build(self) -> Caps {
        Caps {
            caps: self.caps,
            names: self.names,
        }
    }
}
