//! Adaptive bitrate hooks
//!
//! Segment-based sources expose their quality groups through [`GroupStats`] and let a
//! [`RateAdaptation`] pick the quality of the next segment. A [`DownloadMonitor`] can abort a
//! segment download that would stall playback. [`AbrDriver`] glues both to the filter graph:
//! it runs the hooks on each tick and turns a selection into a `QUALITY_SWITCH` event on the
//! input PID, so the source switches representation upstream.

use std::collections::HashMap;

use crate::event::{EventKind, FilterEvent};
use crate::pid::InputPid;

/// One selectable quality of a group
#[derive(Debug, Clone, PartialEq)]
pub struct QualityInfo {
    pub id: String,
    /// Advertised bandwidth, bits per second
    pub bandwidth: u32,
    pub disabled: bool,
}

impl QualityInfo {
    pub fn new(id: impl Into<String>, bandwidth: u32) -> Self {
        Self {
            id: id.into(),
            bandwidth,
            disabled: false,
        }
    }
}

/// Download and buffer statistics of a quality group, after a segment completed
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub group: u32,
    /// Index of the active quality in `qualities`
    pub active_quality: usize,
    pub qualities: Vec<QualityInfo>,
    /// Size of the last segment in bytes
    pub segment_bytes: u64,
    /// Measured download rate of the last segment
    pub bytes_per_sec: u64,
    pub segment_duration_ms: u64,
    pub buffer_ms: u64,
    pub max_buffer_ms: u64,
    /// Playback speed; negative for reverse playback
    pub speed: f64,
}

impl GroupStats {
    /// Download rate in bits per second, scaled down by the playback speed
    pub fn effective_rate(&self) -> u64 {
        let speed = if self.speed == 0.0 { 1.0 } else { self.speed.abs() };
        ((self.bytes_per_sec * 8) as f64 / speed) as u64
    }

    fn active_bandwidth(&self) -> u32 {
        self.qualities
            .get(self.active_quality)
            .map_or(0, |q| q.bandwidth)
    }

    fn min_bandwidth(&self) -> u32 {
        self.qualities
            .iter()
            .filter(|q| !q.disabled)
            .map(|q| q.bandwidth)
            .min()
            .unwrap_or(0)
    }
}

/// Chooses the quality of the next segment
pub trait RateAdaptation: Send {
    /// Index into `stats.qualities`, or -1 to keep the current choice
    fn select_quality(&mut self, stats: &GroupStats) -> i32;
}

/// Progress of an ongoing segment download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub group: u32,
    pub quality: usize,
    /// Bitrate of the quality being downloaded, bits per second
    pub media_bitrate: u32,
    /// Lowest enabled bitrate of the group
    pub min_bitrate: u32,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: u64,
    pub elapsed_ms: u64,
    pub segment_duration_ms: u64,
    /// Media already buffered ahead of this segment
    pub buffer_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadAction {
    Continue,
    /// Abort the segment; the next adaptation pass picks a lower quality
    Abort,
}

/// Watches segment downloads
pub trait DownloadMonitor: Send {
    fn on_progress(&mut self, progress: &DownloadProgress) -> DownloadAction;
}

/// Highest quality fitting the measured throughput
///
/// Stepping down is immediate. Stepping up by exactly one level must be confirmed by
/// `probes_before_switch` consecutive measurements; jumping over intermediate levels is
/// immediate.
#[derive(Debug, Clone)]
pub struct ThroughputAdaptation {
    probes_before_switch: u32,
    probes: HashMap<usize, u32>,
}

impl Default for ThroughputAdaptation {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ThroughputAdaptation {
    pub fn new(probes_before_switch: u32) -> Self {
        Self {
            probes_before_switch,
            probes: HashMap::new(),
        }
    }
}

impl RateAdaptation for ThroughputAdaptation {
    fn select_quality(&mut self, stats: &GroupStats) -> i32 {
        if stats.segment_bytes == 0 || stats.bytes_per_sec == 0 || stats.segment_duration_ms == 0 {
            tracing::debug!(group = stats.group, "incomplete download stats, skipping adaptation");
            return -1;
        }
        let current = stats.active_bandwidth();
        let rate = stats.effective_rate();
        let go_up = u64::from(current) < rate;
        let rate = rate.max(u64::from(stats.min_bandwidth()));

        let mut best: Option<usize> = None;
        let mut intermediate = 0;
        for (idx, q) in stats.qualities.iter().enumerate() {
            if q.disabled || rate < u64::from(q.bandwidth) {
                continue;
            }
            let Some(b) = best else {
                best = Some(idx);
                continue;
            };
            let best_bw = stats.qualities[b].bandwidth;
            if q.bandwidth > best_bw {
                if go_up && best_bw > current {
                    intermediate += 1;
                }
                best = Some(idx);
            } else if go_up && q.bandwidth > current {
                intermediate += 1;
            }
        }

        let Some(selected) = best.filter(|&b| b != stats.active_quality) else {
            return -1;
        };
        if go_up && intermediate == 0 {
            let count = self.probes.entry(selected).or_insert(0);
            *count += 1;
            if *count <= self.probes_before_switch {
                return -1;
            }
        }
        self.probes.clear();
        tracing::info!(
            group = stats.group,
            rate,
            from = current,
            to = stats.qualities[selected].bandwidth,
            "switching quality {}",
            if go_up { "up" } else { "down" }
        );
        selected as i32
    }
}

/// Aborts downloads slower than the media bitrate when the buffer cannot cover the rest
#[derive(Debug, Clone)]
pub struct BufferGuard {
    /// Grace period before a download is judged
    pub min_elapsed_ms: u64,
}

impl Default for BufferGuard {
    fn default() -> Self {
        Self { min_elapsed_ms: 200 }
    }
}

impl DownloadMonitor for BufferGuard {
    fn on_progress(&mut self, p: &DownloadProgress) -> DownloadAction {
        let rate = p.bytes_per_sec * 8;
        if rate == 0 || rate > u64::from(p.media_bitrate) {
            return DownloadAction::Continue;
        }
        // nothing lower to switch to
        if p.media_bitrate <= p.min_bitrate || p.elapsed_ms < self.min_elapsed_ms {
            return DownloadAction::Continue;
        }
        let remaining = p.total_bytes.saturating_sub(p.bytes_done);
        let time_until_end_ms = remaining * 1000 / p.bytes_per_sec.max(1);
        if time_until_end_ms < p.buffer_ms {
            return DownloadAction::Continue;
        }
        tracing::warn!(
            group = p.group,
            rate,
            media_bitrate = p.media_bitrate,
            buffer_ms = p.buffer_ms,
            "download too slow, aborting segment"
        );
        DownloadAction::Abort
    }
}

/// Runs the adaptation hooks for a filter and emits quality switches
pub struct AbrDriver {
    algorithm: Box<dyn RateAdaptation>,
    monitor: Option<Box<dyn DownloadMonitor>>,
    switches: u64,
}

impl std::fmt::Debug for AbrDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbrDriver")
            .field("monitor", &self.monitor.is_some())
            .field("switches", &self.switches)
            .finish()
    }
}

impl Default for AbrDriver {
    fn default() -> Self {
        Self::new(Box::new(ThroughputAdaptation::default()))
    }
}

impl AbrDriver {
    pub fn new(algorithm: Box<dyn RateAdaptation>) -> Self {
        Self {
            algorithm,
            monitor: None,
            switches: 0,
        }
    }

    pub fn with_monitor(mut self, monitor: Box<dyn DownloadMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Quality switches emitted so far
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Event requesting the selected quality, if any
    pub fn evaluate(&mut self, stats: &GroupStats) -> Option<EventKind> {
        let selected = self.algorithm.select_quality(stats);
        if selected < 0 || selected as usize >= stats.qualities.len() {
            return None;
        }
        if selected as usize == stats.active_quality {
            return None;
        }
        self.switches += 1;
        Some(EventKind::QualitySwitch {
            up: selected as usize > stats.active_quality,
            q_idx: selected,
            dependent_group_index: -1,
        })
    }

    /// Evaluates `stats` and sends the switch upstream on `pid`
    pub fn tick(&mut self, pid: &InputPid, stats: &GroupStats) -> Option<i32> {
        let kind = self.evaluate(stats)?;
        let q_idx = match &kind {
            EventKind::QualitySwitch { q_idx, .. } => *q_idx,
            _ => -1,
        };
        pid.send_event(FilterEvent::on_pid(kind, pid.id()));
        Some(q_idx)
    }

    pub fn on_download_progress(&mut self, progress: &DownloadProgress) -> DownloadAction {
        self.monitor
            .as_mut()
            .map_or(DownloadAction::Continue, |m| m.on_progress(progress))
    }
}
