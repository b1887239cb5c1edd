//! Tagged property values

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::key::{fourcc, fourcc_to_string};
use super::kinds::{AudioFormat, CodecId, PixelFormat, StreamType};
use crate::error::{Error, Result};

/// Type tag of a [`PropertyValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Bool,
    Int,
    LongInt,
    UInt,
    LongUInt,
    Fraction,
    Fraction64,
    Float,
    Double,
    String,
    Blob,
    FourCC,
    Pointer,
    List,
    StreamType,
    CodecId,
    PixelFormat,
    AudioFormat,
}

/// 32-bit rational
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Fraction {
    pub num: i32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: i32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.num as i64 * other.den as i64 == other.num as i64 * self.den as i64
    }
}

/// 64-bit rational, used for durations
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Fraction64 {
    pub num: i64,
    pub den: u64,
}

impl Fraction64 {
    pub const fn new(num: i64, den: u64) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl PartialEq for Fraction64 {
    fn eq(&self, other: &Self) -> bool {
        self.num as i128 * other.den as i128 == other.num as i128 * self.den as i128
    }
}

/// Who is responsible for a blob's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOwnership {
    /// Copied into the property
    Owned,
    /// Static data, never freed
    Borrowed,
    /// Memory kept alive by an external owner through the `Bytes` handle
    External,
}

/// Binary property payload
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Bytes,
    pub ownership: BlobOwnership,
}

impl Blob {
    pub fn owned(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Bytes::from(data.into()),
            ownership: BlobOwnership::Owned,
        }
    }

    pub fn borrowed(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
            ownership: BlobOwnership::Borrowed,
        }
    }

    pub fn external(data: Bytes) -> Self {
        Self {
            data,
            ownership: BlobOwnership::External,
        }
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// Opaque engine-internal pointer; compares by identity
#[derive(Clone)]
pub struct OpaqueRef(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueRef({:p})", Arc::as_ptr(&self.0))
    }
}

impl PartialEq for OpaqueRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A tagged, self-describing value used for PID properties, packet properties, filter
/// arguments and statistics
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    LongInt(i64),
    UInt(u32),
    LongUInt(u64),
    Fraction(Fraction),
    Fraction64(Fraction64),
    Float(f32),
    Double(f64),
    String(String),
    Blob(Blob),
    FourCC(u32),
    Pointer(OpaqueRef),
    /// List of scalar values; nested lists are rejected by [`PropertyValue::list`]
    List(Vec<PropertyValue>),
    StreamType(StreamType),
    CodecId(CodecId),
    PixelFormat(PixelFormat),
    AudioFormat(AudioFormat),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::LongInt(_) => PropertyKind::LongInt,
            PropertyValue::UInt(_) => PropertyKind::UInt,
            PropertyValue::LongUInt(_) => PropertyKind::LongUInt,
            PropertyValue::Fraction(_) => PropertyKind::Fraction,
            PropertyValue::Fraction64(_) => PropertyKind::Fraction64,
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::Double(_) => PropertyKind::Double,
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::Blob(_) => PropertyKind::Blob,
            PropertyValue::FourCC(_) => PropertyKind::FourCC,
            PropertyValue::Pointer(_) => PropertyKind::Pointer,
            PropertyValue::List(_) => PropertyKind::List,
            PropertyValue::StreamType(_) => PropertyKind::StreamType,
            PropertyValue::CodecId(_) => PropertyKind::CodecId,
            PropertyValue::PixelFormat(_) => PropertyKind::PixelFormat,
            PropertyValue::AudioFormat(_) => PropertyKind::AudioFormat,
        }
    }

    /// Builds a list value, rejecting nested lists
    pub fn list(items: Vec<PropertyValue>) -> Result<Self> {
        if items.iter().any(|v| matches!(v, PropertyValue::List(_))) {
            return Err(Error::BadParam("property lists cannot be nested".into()));
        }
        Ok(PropertyValue::List(items))
    }

    /// Parses a textual value into the given kind
    ///
    /// Accepted forms: `true`/`false`/`yes`/`no`/`1`/`0` (an empty string means `true`),
    /// decimal or `0x` hexadecimal integers, `num/den` or decimal fractions, 4-character
    /// codes, hexadecimal blobs and comma separated lists of strings.
    pub fn parse(kind: PropertyKind, text: &str) -> Result<Self> {
        let t = text.trim();
        let bad = |what: &str| Error::BadParam(format!("invalid {} value '{}'", what, text));
        let value = match kind {
            PropertyKind::Bool => match t.to_ascii_lowercase().as_str() {
                "" | "true" | "yes" | "1" => PropertyValue::Bool(true),
                "false" | "no" | "0" => PropertyValue::Bool(false),
                _ => return Err(bad("bool")),
            },
            PropertyKind::Int => {
                PropertyValue::Int(parse_int(t).and_then(|v| i32::try_from(v).ok()).ok_or_else(|| bad("int"))?)
            }
            PropertyKind::LongInt => {
                PropertyValue::LongInt(parse_int(t).and_then(|v| i64::try_from(v).ok()).ok_or_else(|| bad("int64"))?)
            }
            PropertyKind::UInt => {
                PropertyValue::UInt(parse_int(t).and_then(|v| u32::try_from(v).ok()).ok_or_else(|| bad("uint"))?)
            }
            PropertyKind::LongUInt => {
                PropertyValue::LongUInt(parse_int(t).and_then(|v| u64::try_from(v).ok()).ok_or_else(|| bad("uint64"))?)
            }
            PropertyKind::Fraction => {
                let (num, den) = parse_fraction(t).ok_or_else(|| bad("fraction"))?;
                PropertyValue::Fraction(Fraction::new(
                    i32::try_from(num).map_err(|_| bad("fraction"))?,
                    u32::try_from(den).map_err(|_| bad("fraction"))?,
                ))
            }
            PropertyKind::Fraction64 => {
                let (num, den) = parse_fraction(t).ok_or_else(|| bad("fraction"))?;
                PropertyValue::Fraction64(Fraction64::new(num, den))
            }
            PropertyKind::Float => PropertyValue::Float(t.parse().map_err(|_| bad("float"))?),
            PropertyKind::Double => PropertyValue::Double(t.parse().map_err(|_| bad("double"))?),
            PropertyKind::String => PropertyValue::String(text.to_string()),
            PropertyKind::Blob => PropertyValue::Blob(Blob::owned(parse_hex(t).ok_or_else(|| bad("blob"))?)),
            PropertyKind::FourCC => {
                let code: [u8; 4] = t.as_bytes().try_into().map_err(|_| bad("4CC"))?;
                PropertyValue::FourCC(fourcc(&code))
            }
            PropertyKind::Pointer => {
                return Err(Error::NotSupported("pointer properties cannot be parsed".into()))
            }
            PropertyKind::List => PropertyValue::List(
                t.split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| PropertyValue::String(s.trim().to_string()))
                    .collect(),
            ),
            PropertyKind::StreamType => PropertyValue::StreamType(t.parse()?),
            PropertyKind::CodecId => PropertyValue::CodecId(t.parse()?),
            PropertyKind::PixelFormat => PropertyValue::PixelFormat(t.parse()?),
            PropertyKind::AudioFormat => PropertyValue::AudioFormat(t.parse()?),
        };
        Ok(value)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of any integral variant that fits in `u64`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::Int(v) => u64::try_from(*v).ok(),
            PropertyValue::LongInt(v) => u64::try_from(*v).ok(),
            PropertyValue::UInt(v) => Some(*v as u64),
            PropertyValue::LongUInt(v) => Some(*v),
            PropertyValue::FourCC(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v as i64),
            PropertyValue::LongInt(v) => Some(*v),
            PropertyValue::UInt(v) => Some(*v as i64),
            PropertyValue::LongUInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v as f64),
            PropertyValue::Double(v) => Some(*v),
            PropertyValue::Fraction(f) => Some(f.as_f64()),
            PropertyValue::Fraction64(f) => Some(f.as_f64()),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_fraction(&self) -> Option<Fraction> {
        match self {
            PropertyValue::Fraction(f) => Some(*f),
            PropertyValue::UInt(v) => i32::try_from(*v).ok().map(|n| Fraction::new(n, 1)),
            PropertyValue::Int(v) => Some(Fraction::new(*v, 1)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            PropertyValue::Blob(b) => Some(&b.data),
            _ => None,
        }
    }

    pub fn as_stream_type(&self) -> Option<StreamType> {
        match self {
            PropertyValue::StreamType(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_codec_id(&self) -> Option<CodecId> {
        match self {
            PropertyValue::CodecId(v) => Some(*v),
            _ => None,
        }
    }
}

fn parse_int(text: &str) -> Option<i128> {
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if neg { -magnitude } else { magnitude })
}

fn parse_fraction(text: &str) -> Option<(i64, u64)> {
    if let Some((num, den)) = text.split_once('/') {
        let num = num.trim().parse::<i64>().ok()?;
        let den = den.trim().parse::<u64>().ok()?;
        return (den != 0).then_some((num, den));
    }
    if let Ok(num) = text.parse::<i64>() {
        return Some((num, 1));
    }
    // decimal form, e.g. 29.97 -> 29970/1000
    let value = text.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(((value * 1000.0).round() as i64, 1000))
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::LongInt(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::LongUInt(v) => write!(f, "{}", v),
            PropertyValue::Fraction(v) => write!(f, "{}/{}", v.num, v.den),
            PropertyValue::Fraction64(v) => write!(f, "{}/{}", v.num, v.den),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::String(v) => f.write_str(v),
            PropertyValue::Blob(b) => write!(f, "<{} bytes>", b.data.len()),
            PropertyValue::FourCC(v) => f.write_str(&fourcc_to_string(*v)),
            PropertyValue::Pointer(_) => f.write_str("<pointer>"),
            PropertyValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            PropertyValue::StreamType(v) => write!(f, "{}", v),
            PropertyValue::CodecId(v) => write!(f, "{}", v),
            PropertyValue::PixelFormat(v) => write!(f, "{}", v),
            PropertyValue::AudioFormat(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for PropertyValue {
                fn from(v: $ty) -> Self {
                    PropertyValue::$variant(v)
                }
            }
        )+
    };
}

impl_from_value! {
    bool => Bool,
    i32 => Int,
    i64 => LongInt,
    u32 => UInt,
    u64 => LongUInt,
    f32 => Float,
    f64 => Double,
    String => String,
    Fraction => Fraction,
    Fraction64 => Fraction64,
    Blob => Blob,
    StreamType => StreamType,
    CodecId => CodecId,
    PixelFormat => PixelFormat,
    AudioFormat => AudioFormat,
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}
