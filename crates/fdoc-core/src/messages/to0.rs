//! TO0: the owner registers its signed redirect blob with the rendezvous
//! service.
//!
//! `Hello20 → HelloAck21 (nonce) → OwnerSign22 (to0d + to1d) →
//! AcceptOwner23 (wait seconds)`. The rendezvous service verifies the full
//! voucher chain before accepting, then stores the owner's redirect
//! signature for TO1 to hand out.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::cose::CoseSignature;
use crate::types::{Nonce16, bytes_array};
use crate::voucher::{Hash32, OwnershipVoucher};

/// TO0 opening message. Carries nothing; the owner has not yet named a
/// device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello20 {}

/// TO0 acknowledgment carrying the nonce the owner must sign into `to0d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck21 {
    /// Challenge nonce the owner echoes inside [`To0d`].
    pub nonce_to0_sign: Nonce16,
}

/// Owner-signed registration data: the voucher proving custody, the
/// requested registration lifetime, and the challenge nonce echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct To0d {
    /// Full ownership voucher; the rendezvous service verifies the chain.
    pub voucher: OwnershipVoucher,
    /// Requested registration lifetime in seconds.
    pub wait_seconds: u32,
    /// Echo of [`HelloAck21::nonce_to0_sign`].
    pub nonce_to0_sign: Nonce16,
}

/// Transport a device should use when contacting the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TransportProtocol {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl From<TransportProtocol> for u8 {
    fn from(value: TransportProtocol) -> Self {
        match value {
            TransportProtocol::Http => 1,
            TransportProtocol::Https => 2,
        }
    }
}

impl TryFrom<u8> for TransportProtocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Http),
            2 => Ok(Self::Https),
            other => Err(format!("unknown transport protocol {other}")),
        }
    }
}

/// One address at which the device can reach its owner for TO2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RvTo2Addr {
    /// Owner host name or address literal.
    pub host: String,
    /// Owner port.
    pub port: u16,
    /// Transport to use.
    pub protocol: TransportProtocol,
}

/// Payload of the owner's redirect signature (`to1d`): where to find the
/// owner, pinned to the exact `to0d` bytes it was registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct To1dPayload {
    /// Owner addresses, most preferred first.
    pub addrs: Vec<RvTo2Addr>,
    /// SHA-256 over the encoded [`To0d`], binding redirect to registration.
    #[serde(with = "bytes_array")]
    pub to0d_hash: Hash32,
}

impl To1dPayload {
    /// Computes the digest over encoded `to0d` bytes for [`Self::to0d_hash`].
    #[must_use]
    pub fn hash_to0d(to0d_bytes: &[u8]) -> Hash32 {
        Sha256::digest(to0d_bytes).into()
    }

    /// Whether this payload was produced over exactly `to0d_bytes`.
    #[must_use]
    pub fn matches_to0d(&self, to0d_bytes: &[u8]) -> bool {
        self.to0d_hash == Self::hash_to0d(to0d_bytes)
    }
}

/// TO0 registration message: encoded [`To0d`] plus the owner's redirect
/// signature over a [`To1dPayload`].
///
/// `to0d` stays encoded so the redirect hash is computed over the exact
/// transmitted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSign22 {
    /// Encoded [`To0d`].
    pub to0d: Bytes,
    /// Redirect signature, produced by the voucher's terminal owner key.
    pub to1d: CoseSignature,
}

/// TO0 acceptance: how long the registration will be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptOwner23 {
    /// Granted registration lifetime in seconds; may be shorter than
    /// requested.
    pub wait_seconds: u32,
}
