//! Capability matching
//!
//! Matching works on a [`CapState`]: for every property key, the set of values a stream may
//! carry at some point of a (possibly hypothetical) chain. A concrete PID gives exactly one
//! value per key; a filter's output statements replace the values for the keys they name,
//! with `None` standing for "any value". Excluded output statements remove values instead,
//! and turn `None` into "any value but these".

use std::collections::BTreeMap;

use super::{Capability, Caps, CapsBundle};
use crate::props::{PropertyKey, PropertyMap, PropertyValue};

/// Possible property values along a link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapState {
    values: BTreeMap<PropertyKey, Vec<Option<PropertyValue>>>,
    /// Values a `None` entry of the same key cannot take
    excluded: BTreeMap<PropertyKey, Vec<PropertyValue>>,
}

impl CapState {
    /// State of a concrete PID
    pub fn from_props(props: &PropertyMap) -> Self {
        Self {
            values: props
                .iter()
                .map(|(k, v)| (k.clone(), vec![Some(v.clone())]))
                .collect(),
            excluded: BTreeMap::new(),
        }
    }

    /// State produced by a bundle's output statements alone
    pub fn from_outputs(bundle: &CapsBundle<'_>) -> Self {
        Self::default().apply_outputs(bundle)
    }

    /// State after passing through a filter using `bundle`
    pub fn apply_outputs(&self, bundle: &CapsBundle<'_>) -> Self {
        let mut next = self.clone();
        let mut replaced: Vec<&PropertyKey> = Vec::new();
        for cap in bundle.outputs().filter(|c| !c.is_excluded()) {
            if !replaced.contains(&&cap.key) {
                next.values.insert(cap.key.clone(), Vec::new());
                next.excluded.remove(&cap.key);
                replaced.push(&cap.key);
            }
            if let Some(values) = next.values.get_mut(&cap.key) {
                if !values.contains(&cap.value) {
                    values.push(cap.value.clone());
                }
            }
        }
        for cap in bundle.outputs().filter(|c| c.is_excluded()) {
            next.exclude(&cap.key, cap.value.as_ref(), replaced.contains(&&cap.key));
        }
        next
    }

    /// Applies an excluded output statement; `declared` keys keep their declared values
    fn exclude(&mut self, key: &PropertyKey, value: Option<&PropertyValue>, declared: bool) {
        let Some(value) = value else {
            // the filter never outputs this property
            self.values.remove(key);
            self.excluded.remove(key);
            return;
        };
        let values = self.values.entry(key.clone()).or_insert_with(|| vec![None]);
        let before = values.len();
        values.retain(|v| v.as_ref() != Some(value));
        // an excluded input value is changed into some other value
        if !declared && (values.len() < before || values.is_empty()) && !values.contains(&None) {
            values.push(None);
        }
        if values.contains(&None) {
            let excluded = self.excluded.entry(key.clone()).or_default();
            if !excluded.contains(value) {
                excluded.push(value.clone());
            }
        }
    }

    pub fn values(&self, key: &PropertyKey) -> Option<&[Option<PropertyValue>]> {
        self.values.get(key).map(|v| v.as_slice())
    }

    /// Values ruled out for the wildcard entry of `key`
    pub fn excluded(&self, key: &PropertyKey) -> &[PropertyValue] {
        self.excluded.get(key).map_or(&[], |v| v.as_slice())
    }

    /// Every required property can take the required value
    pub fn satisfies(&self, required: &PropertyMap) -> bool {
        required.iter().all(|(key, wanted)| {
            let excluded = self.excluded(key);
            self.values(key).is_some_and(|vals| {
                vals.iter().any(|v| match v {
                    None => !excluded.contains(wanted),
                    Some(v) => v == wanted,
                })
            })
        })
    }
}

fn key_matches(
    caps: &[&Capability],
    values: Option<&[Option<PropertyValue>]>,
    ruled_out: &[PropertyValue],
) -> bool {
    let excluded: Vec<&Capability> = caps.iter().copied().filter(|c| c.is_excluded()).collect();
    let mandatory: Vec<&Capability> = caps
        .iter()
        .copied()
        .filter(|c| !c.is_excluded() && !c.is_optional())
        .collect();
    let Some(values) = values else {
        return mandatory.is_empty();
    };
    if values.is_empty() {
        return mandatory.is_empty();
    }
    // excluded when every possible value is rejected
    let all_excluded = !excluded.is_empty()
        && values.iter().all(|v| match v {
            None => false,
            Some(v) => excluded.iter().any(|c| c.value_matches(v)),
        });
    if all_excluded {
        return false;
    }
    mandatory.is_empty()
        || values.iter().any(|v| match v {
            None => mandatory
                .iter()
                .any(|c| c.value.as_ref().map_or(true, |m| !ruled_out.contains(m))),
            Some(v) => mandatory.iter().any(|c| c.value_matches(v)),
        })
}

/// True when every mandatory input statement of `bundle` accepts `state`
pub fn match_bundle(state: &CapState, bundle: &CapsBundle<'_>) -> bool {
    let inputs: Vec<&Capability> = bundle.inputs().collect();
    if inputs.is_empty() {
        return false;
    }
    let mut seen: Vec<&PropertyKey> = Vec::new();
    for cap in &inputs {
        if seen.contains(&&cap.key) {
            continue;
        }
        seen.push(&cap.key);
        let same_key: Vec<&Capability> = inputs
            .iter()
            .copied()
            .filter(|c| c.key == cap.key)
            .collect();
        if !key_matches(&same_key, state.values(&cap.key), state.excluded(&cap.key)) {
            return false;
        }
    }
    true
}

/// Index of the first bundle of `caps` accepting `state`
pub fn first_matching_bundle(state: &CapState, caps: &Caps) -> Option<usize> {
    caps.bundles()
        .iter()
        .find(|b| match_bundle(state, b))
        .map(|b| b.index)
}

/// Bundle of `caps` accepting a concrete PID's properties
pub fn props_match(props: &PropertyMap, caps: &Caps) -> Option<usize> {
    first_matching_bundle(&CapState::from_props(props), caps)
}
