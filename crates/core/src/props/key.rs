//! Property identity: well-known IDs or custom names

use serde::{Deserialize, Serialize};
use std::fmt;

use super::value::PropertyKind;

/// Packs four ASCII bytes into a big-endian code
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | code[3] as u32
}

/// Renders a 4CC code back to text, replacing non-printable bytes with '.'
pub fn fourcc_to_string(code: u32) -> String {
    code.to_be_bytes()
        .iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
        .collect()
}

macro_rules! property_ids {
    ( $( $(#[$meta:meta])* $variant:ident => ($cc:literal, $name:literal, $kind:ident) ),+ $(,)? ) => {
        /// Well-known property identifiers
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum PropertyId {
            $( $(#[$meta])* $variant ),+
        }

        impl PropertyId {
            /// Every well-known ID, in declaration order
            pub const ALL: &'static [PropertyId] = &[ $( PropertyId::$variant ),+ ];

            /// 4CC code of the property
            pub const fn code(self) -> u32 {
                match self {
                    $( PropertyId::$variant => fourcc($cc) ),+
                }
            }

            /// Canonical name, as used in filter arguments and graph dumps
            pub const fn name(self) -> &'static str {
                match self {
                    $( PropertyId::$variant => $name ),+
                }
            }

            /// Value kind the property is expected to carry
            pub const fn kind(self) -> PropertyKind {
                match self {
                    $( PropertyId::$variant => PropertyKind::$kind ),+
                }
            }
        }
    };
}

property_ids! {
    StreamType => (b"PMST", "StreamType", StreamType),
    CodecId => (b"POTI", "CodecID", CodecId),
    Timescale => (b"TIMS", "Timescale", UInt),
    Width => (b"WIDT", "Width", UInt),
    Height => (b"HEIG", "Height", UInt),
    Fps => (b"VFPF", "FPS", Fraction),
    SampleRate => (b"AUSR", "SampleRate", UInt),
    NumChannels => (b"CHNB", "NumChannels", UInt),
    PixelFormat => (b"PFMT", "PixelFormat", PixelFormat),
    AudioFormat => (b"AFMT", "AudioFormat", AudioFormat),
    Bitrate => (b"RATE", "Bitrate", UInt),
    FileExt => (b"FEXT", "Extension", String),
    Mime => (b"MIME", "MIMEType", String),
    Url => (b"FURL", "URL", String),
    FileName => (b"FNAM", "FileName", String),
    DecoderConfig => (b"DCFG", "DecoderConfig", Blob),
    Duration => (b"PDUR", "Duration", Fraction64),
    Id => (b"PIDI", "ID", UInt),
    ServiceId => (b"PSID", "ServiceID", UInt),
    Language => (b"LANG", "Language", String),
    PlaybackMode => (b"PBKM", "PlaybackMode", UInt),
    /// Payload is not framed on access-unit boundaries
    Unframed => (b"PFRM", "Unframed", Bool),
    /// Sparse stream, packets may be far apart in time
    Sparse => (b"PSPA", "Sparse", Bool),
    /// Stream is delivered as fast as possible, no clock
    NoClock => (b"NCLK", "NoClock", Bool),
}

impl PropertyId {
    /// Looks up a well-known ID by canonical name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        PropertyId::ALL
            .iter()
            .copied()
            .find(|id| id.name().eq_ignore_ascii_case(name))
    }

    /// Looks up a well-known ID by 4CC code
    pub fn from_code(code: u32) -> Option<Self> {
        PropertyId::ALL.iter().copied().find(|id| id.code() == code)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a property: a well-known ID or a user-defined name, never both
///
/// `PropertyKey::parse` is the single place where textual names are resolved, so a custom
/// key can never shadow a well-known one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyKey {
    WellKnown(PropertyId),
    Custom(String),
}

impl PropertyKey {
    /// Maps a textual name (canonical name or 4CC) to a key
    pub fn parse(name: &str) -> Self {
        if let Some(id) = PropertyId::from_name(name) {
            return PropertyKey::WellKnown(id);
        }
        if let Ok(code) = <[u8; 4]>::try_from(name.as_bytes()) {
            if let Some(id) = PropertyId::from_code(fourcc(&code)) {
                return PropertyKey::WellKnown(id);
            }
        }
        PropertyKey::Custom(name.to_string())
    }

    pub fn well_known(&self) -> Option<PropertyId> {
        match self {
            PropertyKey::WellKnown(id) => Some(*id),
            PropertyKey::Custom(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PropertyKey::WellKnown(id) => id.name(),
            PropertyKey::Custom(name) => name,
        }
    }
}

impl From<PropertyId> for PropertyKey {
    fn from(id: PropertyId) -> Self {
        PropertyKey::WellKnown(id)
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        PropertyKey::parse(name)
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        match PropertyKey::parse(&name) {
            PropertyKey::Custom(_) => PropertyKey::Custom(name),
            known => known,
        }
    }
}

impl From<&PropertyKey> for PropertyKey {
    fn from(key: &PropertyKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
