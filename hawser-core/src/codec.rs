//! Pluggable message serialization.
//!
//! The [`MessageCodec`] trait lets callers bring their own wire format while
//! the crates ship a default [`JsonCodec`]. Control traffic between registry
//! nodes is small and rare, so the readable default is usually the right one.
//!
//! ```rust
//! use hawser_core::{MessageCodec, JsonCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Hello { seq: u32 }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Hello { seq: 1 }).unwrap();
//! let back: Hello = codec.decode(&bytes).unwrap();
//! assert_eq!(back, Hello { seq: 1 });
//! ```

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable message serialization format.
///
/// `Clone + 'static` so codec instances can be captured by channel tasks.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable on the wire, which pays for itself the first time a
/// handshake needs to be inspected from a packet capture.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        id: u32,
        label: String,
    }

    #[test]
    fn roundtrip() {
        let codec = JsonCodec;
        let msg = Sample {
            id: 42,
            label: "hello".to_string(),
        };
        let bytes = codec.encode(&msg).expect("encode");
        let decoded: Sample = codec.decode(&bytes).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        let codec = JsonCodec;
        let result: Result<Sample, CodecError> = codec.decode(b"not json {");
        let err = result.expect_err("should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let codec = JsonCodec;
        let bytes = codec.encode(&vec![1, 2, 3]).expect("encode");
        let result: Result<Sample, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }
}
