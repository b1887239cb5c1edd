//! Ordered property maps

use super::key::{PropertyId, PropertyKey};
use super::value::PropertyValue;

/// Insertion-ordered property map
///
/// Maps on PIDs and packets hold a handful of entries, so a vector with linear lookup keeps
/// iteration order stable for dumps and beats hashing for the sizes involved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    entries: Vec<(PropertyKey, PropertyValue)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears (`None`) a property; returns the previous value
    pub fn set(
        &mut self,
        key: impl Into<PropertyKey>,
        value: Option<PropertyValue>,
    ) -> Option<PropertyValue> {
        let key = key.into();
        match value {
            Some(v) => self.insert(key, v),
            None => self.remove(&key),
        }
    }

    pub fn insert(&mut self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &PropertyKey) -> Option<PropertyValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get_key(&self, key: &PropertyKey) -> Option<&PropertyValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Lookup by well-known ID without building a key
    pub fn get_id(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, PropertyKey::WellKnown(known) if *known == id))
            .map(|(_, v)| v)
    }

    pub fn get(&self, key: impl Into<PropertyKey>) -> Option<&PropertyValue> {
        self.get_key(&key.into())
    }

    pub fn contains(&self, key: &PropertyKey) -> bool {
        self.get_key(key).is_some()
    }

    /// Copies every entry of `other` accepted by `filter`, overwriting existing keys
    pub fn merge_filtered(
        &mut self,
        other: &PropertyMap,
        mut filter: impl FnMut(&PropertyKey, &PropertyValue) -> bool,
    ) {
        for (k, v) in other.iter() {
            if filter(k, v) {
                self.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn merge(&mut self, other: &PropertyMap) {
        self.merge_filtered(other, |_, _| true);
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PropertyKey, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &PropertyKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<PropertyKey>, V: Into<PropertyValue>> FromIterator<(K, V)> for PropertyMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = PropertyMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
