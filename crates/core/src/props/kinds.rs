//! Enumerated property kinds
//!
//! Stream types, codec identifiers and sample formats are closed enums that render to and
//! parse from their canonical lowercase names, so they can be given as filter arguments and
//! printed in graph dumps without a lookup table on the caller side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Declares a closed, string-convertible enum with `as_str`, `ALL`, `Display` and `FromStr`.
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Canonical name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lower = s.trim().to_ascii_lowercase();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == lower)
                    .ok_or_else(|| {
                        Error::BadParam(format!(
                            "unknown {} '{}'",
                            stringify!($name),
                            s
                        ))
                    })
            }
        }
    };
}

named_enum! {
    /// Kind of elementary stream carried by a PID
    pub enum StreamType {
        Unknown => "unknown",
        /// Raw file bytes, not yet demultiplexed
        File => "file",
        Visual => "visual",
        Audio => "audio",
        Text => "text",
        Scene => "scene",
        Metadata => "metadata",
        /// Protected stream, needs a decryptor before decoding
        Encrypted => "encrypted",
    }
}

named_enum! {
    /// Codec of the payload carried by a PID
    pub enum CodecId {
        /// Uncompressed samples or pixels
        Raw => "raw",
        Avc => "avc",
        Hevc => "hevc",
        Av1 => "av1",
        Vp9 => "vp9",
        Mpeg4Visual => "mpeg4",
        Aac => "aac",
        Mp3 => "mp3",
        Opus => "opus",
        Ac3 => "ac3",
        WebVtt => "webvtt",
        Unknown => "unknown",
    }
}

named_enum! {
    /// Raw video pixel layout
    pub enum PixelFormat {
        Yuv420 => "yuv420",
        Yuv422 => "yuv422",
        Yuv444 => "yuv444",
        Nv12 => "nv12",
        Rgb => "rgb",
        Rgba => "rgba",
        Bgra => "bgra",
        Gray => "gray",
    }
}

named_enum! {
    /// Raw audio sample layout
    pub enum AudioFormat {
        U8 => "u8",
        S16 => "s16",
        S24 => "s24",
        S32 => "s32",
        Flt => "flt",
        Dbl => "dbl",
        S16Planar => "s16p",
        FltPlanar => "fltp",
    }
}

impl PixelFormat {
    /// Bytes needed for one frame of `width` x `height`
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420 | PixelFormat::Nv12 => pixels * 3 / 2,
            PixelFormat::Yuv422 => pixels * 2,
            PixelFormat::Yuv444 | PixelFormat::Rgb => pixels * 3,
            PixelFormat::Rgba | PixelFormat::Bgra => pixels * 4,
            PixelFormat::Gray => pixels,
        }
    }
}

impl AudioFormat {
    /// Bytes per sample for a single channel
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::U8 => 1,
            AudioFormat::S16 | AudioFormat::S16Planar => 2,
            AudioFormat::S24 => 3,
            AudioFormat::S32 | AudioFormat::Flt | AudioFormat::FltPlanar => 4,
            AudioFormat::Dbl => 8,
        }
    }
}
