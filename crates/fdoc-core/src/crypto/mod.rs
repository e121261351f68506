//! Cryptographic envelope for the onboarding protocols.
//!
//! Three independent concerns, composed at the message layer:
//!
//! - [`keys`]: Ed25519 keypairs and device certificate chains
//! - [`cose`]: signature envelopes binding a protected algorithm header to a
//!   payload
//! - [`cipher`]: authenticated-encryption wrap/unwrap of message bodies under
//!   the negotiated cipher suite
//! - [`kex`]: the key exchange that derives the symmetric session key
//!
//! Every verification path fails closed: algorithm mismatch, malformed
//! structure, truncated input, and tag mismatch are all hard errors, never a
//! silent pass.

pub mod cipher;
pub mod cose;
pub mod keys;
pub mod kex;

use thiserror::Error;

/// Errors from signature, encryption, and key-exchange operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Declared algorithm is not supported or does not match the key.
    #[error("unsupported or mismatched algorithm: {reason}")]
    Algorithm {
        /// What was declared versus what was expected.
        reason: String,
    },

    /// A crypto structure (envelope, key, chain entry) failed to parse.
    #[error("malformed cryptographic structure: {reason}")]
    Malformed {
        /// Description of the defect.
        reason: String,
    },

    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// A certificate chain link failed to verify.
    #[error("certificate chain invalid: {reason}")]
    CertChain {
        /// Which link failed and why.
        reason: String,
    },

    /// Key material has the wrong length for the selected suite.
    #[error("invalid key length {len} for {context}")]
    KeyLength {
        /// Observed length.
        len: usize,
        /// Suite or operation expecting a different length.
        context: String,
    },

    /// Authenticated decryption failed: bad tag, wrong suite, or truncated
    /// input. Deliberately carries no distinguishing detail.
    #[error("decryption failed")]
    DecryptFailed,
}
