//! Deterministic CBOR encoding and decoding for protocol messages.
//!
//! Signatures are computed over encoded bytes, so encoding must be stable:
//! struct fields serialize in declaration order and integers use canonical
//! CBOR widths. Decoding is the primary target of fault-injection tests and
//! must turn every malformed, truncated, or over-long input into an ordinary
//! [`CodecError`] - never a panic, never an out-of-bounds read.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Maximum accepted size for a single encoded message (64 KiB).
///
/// Checked before deserialization so an adversarial length cannot drive
/// allocation. Protocol messages are at most a few KiB plus one service-info
/// page; 64 KiB leaves ample headroom.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors produced by message encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input exceeds [`MAX_MESSAGE_SIZE`]. Detected before decoding.
    #[error("message too large: {size} bytes exceeds maximum {max} bytes")]
    TooLarge {
        /// Actual input size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Input is not valid CBOR, is truncated, or does not match the
    /// expected message shape.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Description from the underlying decoder.
        reason: String,
    },

    /// Well-formed CBOR followed by extra bytes.
    #[error("{remaining} trailing bytes after end of message")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },

    /// A value could not be encoded. Encoding failures are internal errors:
    /// every protocol message type is encodable by construction.
    #[error("failed to encode message: {reason}")]
    Encode {
        /// Description from the underlying encoder.
        reason: String,
    },
}

/// Encodes a message to canonical CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|err| CodecError::Encode {
        reason: err.to_string(),
    })?;
    Ok(buf)
}

/// Decodes a message from CBOR bytes, rejecting over-long input and
/// trailing garbage.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] before any parsing when the input
/// exceeds [`MAX_MESSAGE_SIZE`], [`CodecError::Malformed`] for invalid or
/// truncated CBOR or a shape mismatch, and [`CodecError::TrailingBytes`]
/// when decoding succeeds without consuming the whole input.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut remaining = data;
    let value = ciborium::de::from_reader(&mut remaining).map_err(|err| CodecError::Malformed {
        reason: err.to_string(),
    })?;

    if !remaining.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: remaining.len(),
        });
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        seq: u32,
        label: String,
    }

    #[test]
    fn roundtrip() {
        let sample = Sample {
            seq: 7,
            label: "redirect".to_string(),
        };
        let bytes = to_vec(&sample).expect("encode");
        let decoded: Sample = from_slice(&bytes).expect("decode");
        assert_eq!(decoded, sample);
    }

    #[test]
    fn encoding_is_deterministic() {
        let sample = Sample {
            seq: 42,
            label: "nonce".to_string(),
        };
        assert_eq!(to_vec(&sample).unwrap(), to_vec(&sample).unwrap());
    }

    #[test]
    fn truncated_input_is_malformed() {
        let sample = Sample {
            seq: 7,
            label: "redirect".to_string(),
        };
        let bytes = to_vec(&sample).expect("encode");
        for cut in 1..bytes.len() {
            let err = from_slice::<Sample>(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, CodecError::Malformed { .. }),
                "cut at {cut} produced {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let sample = Sample {
            seq: 7,
            label: "x".to_string(),
        };
        let mut bytes = to_vec(&sample).expect("encode");
        bytes.push(0x00);
        let err = from_slice::<Sample>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes { remaining: 1 }));
    }

    #[test]
    fn oversized_input_rejected_before_parse() {
        let data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let err = from_slice::<Sample>(&data).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { .. }));
    }

    #[test]
    fn shape_mismatch_is_malformed() {
        // A CBOR unsigned integer where a map is expected.
        let err = from_slice::<Sample>(&[0x07]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn garbage_never_panics() {
        // Adversarial prefixes: indefinite arrays, reserved types, deep cuts.
        let inputs: [&[u8]; 6] = [
            &[0xff],
            &[0x9f],
            &[0xbf, 0x01],
            &[0x5b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            &[0xc0],
            &[],
        ];
        for input in inputs {
            assert!(from_slice::<Sample>(input).is_err());
        }
    }
}
