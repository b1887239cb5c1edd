//! Filter arguments
//!
//! Filters are loaded from textual specs of the form `name:key=value:key2=value2`. Values are
//! typed by the filter's [`ArgDescriptor`]s; unknown names and values outside an enumerated
//! set are rejected with `BadParam`.
//!
//! Two reserved keys are handled by the session rather than the filter: `FID` names the
//! instance and `SID` restricts which filters may feed it (comma separated names).

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::props::{Fraction, PropertyKind, PropertyValue};

/// Instance name argument
pub const ARG_FID: &str = "FID";
/// Source restriction argument
pub const ARG_SID: &str = "SID";

/// Declaration of one filter argument
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    pub default: Option<String>,
    /// Legal values; empty accepts anything parseable
    pub values: Vec<String>,
    pub description: String,
}

impl ArgDescriptor {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            values: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_values(mut self, values: &[&str]) -> Self {
        self.values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn parse_value(&self, filter: &str, text: Option<&str>) -> Result<PropertyValue> {
        let text = match (text, self.kind) {
            (Some(t), _) => t,
            (None, PropertyKind::Bool) => "true",
            (None, _) => {
                return Err(Error::BadParam(format!(
                    "argument '{}' of filter '{}' needs a value",
                    self.name, filter
                )))
            }
        };
        if !self.values.is_empty() && !self.values.iter().any(|v| v == text) {
            return Err(Error::BadParam(format!(
                "value '{}' for argument '{}' of filter '{}' not in [{}]",
                text,
                self.name,
                filter,
                self.values.join("|")
            )));
        }
        PropertyValue::parse(self.kind, text)
    }
}

/// Splits `name:key=value:flag` into the filter name and its raw arguments
///
/// A `:` followed by `//` (URL scheme) or directly after a one-letter value followed by a
/// path separator (drive letter) does not split.
pub fn split_filter_spec(spec: &str) -> Result<(String, Vec<(String, Option<String>)>)> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = spec.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c == ':' {
            let next = chars.get(i + 1).copied();
            let url_scheme = next == Some('/') && chars.get(i + 2) == Some(&'/');
            let drive = matches!(next, Some('/') | Some('\\'))
                && current
                    .rsplit_once('=')
                    .is_some_and(|(_, v)| v.len() == 1 && v.chars().all(|c| c.is_ascii_alphabetic()));
            if !url_scheme && !drive {
                parts.push(std::mem::take(&mut current));
                continue;
            }
        }
        current.push(c);
    }
    parts.push(current);

    let mut iter = parts.into_iter();
    let name = iter.next().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::BadParam(format!("missing filter name in '{}'", spec)));
    }
    let args = iter
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (p, None),
        })
        .collect();
    Ok((name, args))
}

/// Typed argument values of a filter instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterArgs {
    values: BTreeMap<String, PropertyValue>,
    fid: Option<String>,
    sources: Vec<String>,
}

impl FilterArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults of every declared argument that has one
    pub fn defaults(filter: &str, descriptors: &[ArgDescriptor]) -> Result<Self> {
        Self::from_pairs(filter, descriptors, &[])
    }

    /// Parses `key=value:key2=value2` against the declared arguments
    pub fn parse(filter: &str, descriptors: &[ArgDescriptor], text: &str) -> Result<Self> {
        if text.is_empty() {
            return Self::defaults(filter, descriptors);
        }
        let (_, pairs) = split_filter_spec(&format!("{}:{}", filter, text))?;
        Self::from_pairs(filter, descriptors, &pairs)
    }

    /// Validates raw pairs and fills in defaults
    pub fn from_pairs(
        filter: &str,
        descriptors: &[ArgDescriptor],
        pairs: &[(String, Option<String>)],
    ) -> Result<Self> {
        let mut args = FilterArgs::default();
        for (key, value) in pairs {
            match key.as_str() {
                ARG_FID => {
                    args.fid = value.clone().filter(|v| !v.is_empty());
                }
                ARG_SID => {
                    args.sources = value
                        .as_deref()
                        .unwrap_or_default()
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {
                    let desc = descriptors.iter().find(|d| &d.name == key).ok_or_else(|| {
                        Error::BadParam(format!("unknown argument '{}' for filter '{}'", key, filter))
                    })?;
                    let parsed = desc.parse_value(filter, value.as_deref())?;
                    args.values.insert(key.clone(), parsed);
                }
            }
        }
        for desc in descriptors {
            if args.values.contains_key(&desc.name) {
                continue;
            }
            if let Some(default) = &desc.default {
                let parsed = desc.parse_value(filter, Some(default))?;
                args.values.insert(desc.name.clone(), parsed);
            }
        }
        Ok(args)
    }

    /// Validates a new value for one declared argument of a running filter
    ///
    /// `FID` and `SID` are fixed once the filter is loaded.
    pub fn parse_update(
        filter: &str,
        descriptors: &[ArgDescriptor],
        name: &str,
        value: &str,
    ) -> Result<PropertyValue> {
        if name == ARG_FID || name == ARG_SID {
            return Err(Error::BadParam(format!(
                "argument '{}' of filter '{}' cannot change after load",
                name, filter
            )));
        }
        let desc = descriptors.iter().find(|d| d.name == name).ok_or_else(|| {
            Error::BadParam(format!("unknown argument '{}' for filter '{}'", name, filter))
        })?;
        desc.parse_value(filter, Some(value))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Sets a value directly, bypassing descriptor validation
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.get(name).and_then(|v| v.as_u32())
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.as_u64())
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    pub fn get_fraction(&self, name: &str) -> Option<Fraction> {
        self.get(name).and_then(|v| v.as_fraction())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.values.iter()
    }

    /// Instance name given with `FID`
    pub fn fid(&self) -> Option<&str> {
        self.fid.as_deref()
    }

    pub fn set_fid(&mut self, fid: impl Into<String>) {
        self.fid = Some(fid.into());
    }

    /// Source names given with `SID`
    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}
