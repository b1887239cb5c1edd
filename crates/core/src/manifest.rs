//! Graph manifests
//!
//! A manifest lists the filters of a graph as textual specs, with optional source
//! restrictions and an embedded session config:
//!
//! ```yaml
//! version: "1"
//! filters:
//!   - id: src
//!     filter: "testsrc:dur=1"
//!   - id: out
//!     filter: inspect
//!     sources: [src]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::filter::args::{ARG_FID, ARG_SID};

/// Filter entry of a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterEntry {
    /// Instance name, unique within the manifest
    pub id: String,

    /// Filter spec (`name:arg=value:...`)
    pub filter: String,

    /// Ids of the only filters allowed to feed this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl FilterEntry {
    /// Spec with the id and source restriction appended
    pub fn to_spec(&self) -> String {
        let mut spec = format!("{}:{}={}", self.filter, ARG_FID, self.id);
        if !self.sources.is_empty() {
            spec.push_str(&format!(":{}={}", ARG_SID, self.sources.join(",")));
        }
        spec
    }
}

/// Serialized filter graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: String,

    /// Session settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SessionConfig>,

    pub filters: Vec<FilterEntry>,
}

fn default_version() -> String {
    "1".to_string()
}

impl GraphManifest {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Loads a `.yaml`/`.yml` or `.json` manifest
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    /// Checks ids are unique and every source refers to a declared id
    pub fn validate(&self) -> Result<()> {
        if self.filters.is_empty() {
            return Err(Error::Config("manifest declares no filter".into()));
        }
        for (i, entry) in self.filters.iter().enumerate() {
            if entry.id.is_empty() || entry.id.contains([':', ',', '=']) {
                return Err(Error::Config(format!("invalid filter id '{}'", entry.id)));
            }
            if self.filters[..i].iter().any(|e| e.id == entry.id) {
                return Err(Error::Config(format!("duplicate filter id '{}'", entry.id)));
            }
        }
        for entry in &self.filters {
            for src in &entry.sources {
                if !self.filters.iter().any(|e| &e.id == src) {
                    return Err(Error::Config(format!(
                        "filter '{}' references unknown source '{}'",
                        entry.id, src
                    )));
                }
            }
        }
        Ok(())
    }
}
