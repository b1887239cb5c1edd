//! Property model shared by PIDs, packets, filter arguments and statistics

pub mod key;
pub mod kinds;
pub mod map;
pub mod value;

pub use key::{fourcc, fourcc_to_string, PropertyId, PropertyKey};
pub use kinds::{AudioFormat, CodecId, PixelFormat, StreamType};
pub use map::PropertyMap;
pub use value::{Blob, BlobOwnership, Fraction, Fraction64, OpaqueRef, PropertyKind, PropertyValue};
