//! Session statistics
//!
//! Per-filter counters are plain atomics updated on the data path; `process()` durations go
//! to an HDR histogram so percentiles stay accurate without keeping every sample.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

use crate::filter::{FilterId, FilterState};

/// Upper bound of a recorded `process()` duration (one minute)
const MAX_PROCESS_US: u64 = 60_000_000;

/// `process()` duration histogram of one filter
pub(crate) struct ProcessTimer {
    histogram: Mutex<Option<Histogram<u64>>>,
}

impl ProcessTimer {
    pub(crate) fn new() -> Self {
        let histogram = match Histogram::<u64>::new_with_max(MAX_PROCESS_US, 3) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("Failed to create process time histogram: {}", e);
                None
            }
        };
        Self {
            histogram: Mutex::new(histogram),
        }
    }

    pub(crate) fn record(&self, elapsed: Duration) {
        let us = (elapsed.as_micros() as u64).clamp(1, MAX_PROCESS_US);
        if let Some(h) = self.histogram.lock().as_mut() {
            h.saturating_record(us);
        }
    }

    /// (p50, p99, max) in microseconds
    pub(crate) fn summary(&self) -> (u64, u64, u64) {
        match self.histogram.lock().as_ref() {
            Some(h) if !h.is_empty() => (h.value_at_quantile(0.5), h.value_at_quantile(0.99), h.max()),
            _ => (0, 0, 0),
        }
    }
}

/// Counters of one filter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterStats {
    pub id: FilterId,
    pub name: String,
    /// Registry name of the filter class
    pub class: String,
    pub state: FilterState,
    /// Inserted by the linker
    pub dynamic: bool,
    pub process_calls: u64,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub process_p50_us: u64,
    pub process_p99_us: u64,
    pub process_max_us: u64,
    /// Last status line published by the filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Progress of the status line, 0 to 100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_percent: Option<f32>,
}

/// Aggregate statistics of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub filters: Vec<FilterStats>,
    /// Packets sent by all filters
    pub packets_sent: u64,
    /// Bytes sent by all filters
    pub bytes_sent: u64,
    /// Time spent inside `run()`
    pub wall_time: Duration,
}

impl SessionStats {
    pub fn filter(&self, name: &str) -> Option<&FilterStats> {
        self.filters.iter().find(|f| f.name == name)
    }

    /// Packets per second over the run time
    pub fn packet_rate(&self) -> f64 {
        let secs = self.wall_time.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.packets_sent as f64 / secs
        }
    }

    /// Bits per second over the run time
    pub fn bitrate(&self) -> f64 {
        let secs = self.wall_time.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.bytes_sent as f64 * 8.0 / secs
        }
    }
}
