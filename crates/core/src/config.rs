//! Session configuration
//!
//! Every field has a default, so a config file only needs the values it changes:
//!
//! ```toml
//! threads = 2
//! pid_buffer_units = 8
//! abort_on_error = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Session-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Scheduler threads, including the one calling `run()`; 0 uses one per CPU
    pub threads: usize,

    /// Packets a PID may queue before its producer blocks (0 disables the limit)
    pub pid_buffer_units: usize,

    /// Queued duration in microseconds before a PID blocks (0 disables the limit)
    pub pid_buffer_us: u64,

    /// Maximum number of filters the linker inserts between two filters
    pub max_chain_length: usize,

    /// Abort the whole session when one filter fails
    pub abort_on_error: bool,

    /// Ignore backpressure; producers are never blocked
    pub disable_blocking: bool,

    /// Longest time an idle worker sleeps before re-checking the ready queue
    pub idle_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            pid_buffer_units: 4,
            pid_buffer_us: 0,
            max_chain_length: 6,
            abort_on_error: false,
            disable_blocking: false,
            idle_wait_ms: 50,
        }
    }
}

impl SessionConfig {
    /// Single-threaded configuration, handy for deterministic tests
    pub fn single_threaded() -> Self {
        Self {
            threads: 1,
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_buffer_units(mut self, units: usize) -> Self {
        self.pid_buffer_units = units;
        self
    }

    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    /// Effective number of scheduler threads
    pub fn worker_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Loads a config file, picking the format from the extension
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(Error::Config(format!(
                "unsupported config format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}
