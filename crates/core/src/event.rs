//! Filter events (control plane)
//!
//! Events travel against or along the data flow. An event sent on an input PID goes upstream
//! to its producer, one sent on an output PID goes downstream to every consumer. A filter
//! intercepts an event in `process_event`; returning `false` lets the engine forward it
//! further in the same direction.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pid::PidId;
use crate::props::PropertyMap;

/// Direction an event travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    /// Toward sources
    Upstream,
    /// Toward sinks
    Downstream,
}

/// Event payload, keyed by event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Play {
        /// Start of the requested range, in seconds
        start_range: f64,
        /// End of the requested range in seconds, `None` for open-ended
        end_range: Option<f64>,
        speed: f64,
    },
    Pause,
    Resume,
    Stop,
    SetSpeed {
        speed: f64,
    },
    SourceSeek {
        start_offset: u64,
        end_offset: Option<u64>,
    },
    SourceSwitch {
        url: String,
        start_offset: u64,
        end_offset: Option<u64>,
    },
    SegmentSize {
        seg_url: Option<String>,
        is_init: bool,
        media_range: (u64, u64),
        index_range: Option<(u64, u64)>,
    },
    QualitySwitch {
        /// Step up (`true`) or down when no explicit index is given
        up: bool,
        /// Explicit quality index, `-1` to use `up`
        q_idx: i32,
        dependent_group_index: i32,
    },
    VisibilityHint {
        min_x: u32,
        max_x: u32,
        min_y: u32,
        max_y: u32,
        is_gaze: bool,
    },
    BufferReq {
        max_buffer_us: u64,
        max_playout_us: u64,
        /// Only change the PID buffer, do not forward further upstream
        pid_only: bool,
    },
    CapsChange,
    ConnectFail {
        reason: String,
    },
    PlayHint {
        forced_segment_switch: bool,
    },
    FileDelete {
        url: String,
    },
    NtpRef {
        ntp: u64,
        timestamp: u64,
        timescale: u32,
    },
    User {
        name: String,
        data: PropertyMap,
    },
}

impl EventKind {
    /// Play from the start at normal speed
    pub fn play() -> Self {
        EventKind::Play {
            start_range: 0.0,
            end_range: None,
            speed: 1.0,
        }
    }

    /// Canonical event type name
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Play { .. } => "PLAY",
            EventKind::Pause => "PAUSE",
            EventKind::Resume => "RESUME",
            EventKind::Stop => "STOP",
            EventKind::SetSpeed { .. } => "SET_SPEED",
            EventKind::SourceSeek { .. } => "SOURCE_SEEK",
            EventKind::SourceSwitch { .. } => "SOURCE_SWITCH",
            EventKind::SegmentSize { .. } => "SEGMENT_SIZE",
            EventKind::QualitySwitch { .. } => "QUALITY_SWITCH",
            EventKind::VisibilityHint { .. } => "VISIBILITY_HINT",
            EventKind::BufferReq { .. } => "BUFFER_REQ",
            EventKind::CapsChange => "CAPS_CHANGE",
            EventKind::ConnectFail { .. } => "CONNECT_FAIL",
            EventKind::PlayHint { .. } => "PLAY_HINT",
            EventKind::FileDelete { .. } => "FILE_DELETE",
            EventKind::NtpRef { .. } => "NTP_REF",
            EventKind::User { .. } => "USER",
        }
    }

    /// Direction used when the event is sent session-wide without an explicit one
    pub fn natural_direction(&self) -> EventDirection {
        match self {
            EventKind::QualitySwitch { .. }
            | EventKind::BufferReq { .. }
            | EventKind::VisibilityHint { .. }
            | EventKind::ConnectFail { .. } => EventDirection::Upstream,
            _ => EventDirection::Downstream,
        }
    }
}

/// What an event is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// The PID the event is currently traversing
    Pid(PidId),
    /// Every source (downstream) or every sink (upstream)
    Session(EventDirection),
}

/// A control event
#[derive(Debug, Clone, PartialEq)]
pub struct FilterEvent {
    pub kind: EventKind,
    pub target: EventTarget,
}

impl FilterEvent {
    /// Session-wide event travelling in the kind's natural direction
    pub fn new(kind: EventKind) -> Self {
        let direction = kind.natural_direction();
        Self {
            kind,
            target: EventTarget::Session(direction),
        }
    }

    pub fn session(kind: EventKind, direction: EventDirection) -> Self {
        Self {
            kind,
            target: EventTarget::Session(direction),
        }
    }

    pub fn on_pid(kind: EventKind, pid: PidId) -> Self {
        Self {
            kind,
            target: EventTarget::Pid(pid),
        }
    }

    pub fn pid(&self) -> Option<PidId> {
        match self.target {
            EventTarget::Pid(pid) => Some(pid),
            EventTarget::Session(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub(crate) fn retarget(&self, pid: PidId) -> Self {
        Self {
            kind: self.kind.clone(),
            target: EventTarget::Pid(pid),
        }
    }
}

impl fmt::Display for FilterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            EventTarget::Pid(pid) => write!(f, "{} on {}", self.kind.name(), pid),
            EventTarget::Session(dir) => write!(f, "{} ({:?}, session)", self.kind.name(), dir),
        }
    }
}
