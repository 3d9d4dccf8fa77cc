//! # Tether Codec
//!
//! Binary value codec for tether.
//!
//! Every wire package and every persisted entity passes through this crate.
//! Values are encoded as self-describing CBOR via `serde`, which keeps the
//! payload type-tagged: a decoder can reject bytes that do not match the
//! requested shape instead of silently producing garbage.
//!
//! ## Usage
//!
//! ```
//! use tether_codec::{from_bytes, to_bytes};
//!
//! let bytes = to_bytes(&("Person", 42u32)).unwrap();
//! let decoded: (String, u32) = from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, ("Person".to_string(), 42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;

pub use error::{CodecError, CodecResult};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to bytes.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| CodecError::encoding(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from bytes.
///
/// The whole input must be consumed by exactly one value.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    if bytes.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    let mut reader = bytes;
    let value = ciborium::de::from_reader(&mut reader)
        .map_err(|e| CodecError::decoding(e.to_string()))?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: reader.len(),
        });
    }
    Ok(value)
}

/// Re-encodes a value as a different shape.
///
/// The source is encoded and the bytes are decoded as `U`. Fields that `U`
/// does not declare are dropped, missing fields with defaults are filled in.
pub fn transcode<T: Serialize + ?Sized, U: DeserializeOwned>(value: &T) -> CodecResult<U> {
    from_bytes(&to_bytes(value)?)
}

/// Trait for types that can be encoded with the tether codec.
pub trait Encode {
    /// Encode this value to bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded with the tether codec.
pub trait Decode: Sized {
    /// Decode this value from bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl<T: Serialize> Encode for T {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_bytes(self)
    }
}

impl<T: DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_bytes(bytes)
    }
}
