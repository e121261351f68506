//! Shared protocol value types: device identifiers, nonces, signature-info
//! descriptors, and service-info pages.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Size of a device globally-unique identifier in bytes.
pub const GUID_SIZE: usize = 16;

/// Size of a protocol nonce in bytes.
pub const NONCE_SIZE: usize = 16;

/// Serde adapter encoding fixed-size byte arrays as CBOR byte strings
/// instead of integer arrays.
pub(crate) mod bytes_array {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(value: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "a byte string of length {N}")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                v.try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut out = [0u8; N];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                if seq.next_element::<u8>()?.is_some() {
                    return Err(de::Error::invalid_length(N + 1, &self));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(ArrayVisitor::<N>)
    }
}

/// Device globally-unique identifier.
///
/// Issued at manufacturing time and carried in the ownership-voucher header;
/// every store that tracks per-device state keys off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(#[serde(with = "bytes_array")] pub [u8; GUID_SIZE]);

impl Guid {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; GUID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; GUID_SIZE] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 16-byte protocol nonce.
///
/// Nonces prove liveness: one side issues a fresh nonce, the other must echo
/// it back inside a signed payload. Comparison is constant-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce16(#[serde(with = "bytes_array")] pub [u8; NONCE_SIZE]);

impl Nonce16 {
    /// Generates a fresh random nonce from the OS entropy source.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw nonce bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Constant-time equality check against another nonce.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Display for Nonce16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Signature algorithm families a device can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum SigType {
    /// EdDSA over edwards25519.
    Ed25519,
}

impl From<SigType> for i16 {
    fn from(value: SigType) -> Self {
        match value {
            // COSE algorithm identifier for EdDSA.
            SigType::Ed25519 => -8,
        }
    }
}

impl TryFrom<i16> for SigType {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            -8 => Ok(Self::Ed25519),
            other => Err(format!("unknown signature type {other}")),
        }
    }
}

/// Signature-info descriptor exchanged during hello messages.
///
/// The device declares the algorithm family it will sign with (`eA`); the
/// listener echoes it back (`eB`). The info bytes are opaque and empty for
/// the algorithm families supported here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigInfo {
    /// Declared signature algorithm family.
    pub sig_type: SigType,
    /// Algorithm-specific extra info. Empty for EdDSA.
    pub info: bytes::Bytes,
}

impl SigInfo {
    /// Standard EdDSA descriptor with empty info bytes.
    #[must_use]
    pub fn ed25519() -> Self {
        Self {
            sig_type: SigType::Ed25519,
            info: bytes::Bytes::new(),
        }
    }
}

/// One service-info page: an opaque application payload addressed by
/// `module:key`.
///
/// Pages travel through the paginated service-info exchange late in the
/// owner sub-protocol, one page per round-trip, in strict enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfoKv {
    /// Owning service-info module, e.g. `devmod`.
    pub module: String,
    /// Key within the module.
    pub key: String,
    /// Opaque payload bytes.
    pub value: bytes::Bytes,
}

impl ServiceInfoKv {
    /// Creates a page.
    pub fn new(module: impl Into<String>, key: impl Into<String>, value: impl Into<bytes::Bytes>) -> Self {
        Self {
            module: module.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::codec;

    use super::*;

    #[test]
    fn guid_roundtrips_as_byte_string() {
        let guid = Guid::random();
        let bytes = codec::to_vec(&guid).unwrap();
        // Major type 2 (byte string), length 16.
        assert_eq!(bytes[0], 0x50);
        assert_eq!(bytes.len(), 17);
        let back: Guid = codec::from_slice(&bytes).unwrap();
        assert_eq!(back, guid);
    }

    #[test]
    fn nonce_wrong_length_rejected() {
        let bytes = codec::to_vec(&bytes::Bytes::from_static(&[0u8; 15])).unwrap();
        assert!(codec::from_slice::<Nonce16>(&bytes).is_err());
    }

    #[test]
    fn nonce_ct_eq_detects_single_byte_change() {
        let nonce = Nonce16::random();
        let mut tampered = nonce;
        tampered.0[3] ^= 0x01;
        assert!(nonce.ct_eq(&nonce));
        assert!(!nonce.ct_eq(&tampered));
    }

    #[test]
    fn sig_type_wire_code() {
        let bytes = codec::to_vec(&SigType::Ed25519).unwrap();
        let back: SigType = codec::from_slice(&bytes).unwrap();
        assert_eq!(back, SigType::Ed25519);
        assert!(codec::from_slice::<SigType>(&codec::to_vec(&0i16).unwrap()).is_err());
    }
}
