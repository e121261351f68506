//! Request-boundary error taxonomy.
//!
//! Every step handler recovers every error into exactly one
//! [`ExchangeResponse`](crate::exchange::ExchangeResponse): the taxonomy
//! maps each failure class to a transport status and a coarse wire
//! [`ErrorCode`], and the response body is itself a well-formed encoded
//! [`ErrorMessage`](fdoc_core::ErrorMessage). Cryptographic verification
//! failures are never downgraded; they abort the step.

use fdoc_core::{CodecError, CryptoError, ErrorCode, VoucherError};
use thiserror::Error;

use crate::exchange::Status;
use crate::store::StoreError;

/// Failure classes a step handler can produce.
#[derive(Debug, Error)]
pub enum FdoError {
    /// Malformed, truncated, or wrong-shape input.
    #[error("undecodable message: {0}")]
    Decode(#[from] CodecError),

    /// Missing, invalid, or expired bearer token, or a failed
    /// proof-of-possession (signature or nonce mismatch).
    #[error("unauthorized: {reason}")]
    Auth {
        /// What failed; not echoed verbatim to unauthenticated peers.
        reason: String,
    },

    /// Message type inconsistent with the session's last-completed step.
    #[error("out of sequence: {reason}")]
    Sequence {
        /// Expected-versus-received description.
        reason: String,
    },

    /// Voucher chain or signature cryptographically invalid.
    #[error("verification failed: {reason}")]
    Verification {
        /// What failed to verify.
        reason: String,
    },

    /// Referenced device has no voucher or registration on file.
    #[error("unknown resource: {what}")]
    Resource {
        /// The missing resource.
        what: String,
    },

    /// Persistence or unexpected library failure.
    #[error("internal error: {reason}")]
    Internal {
        /// What broke. Logged, not sent to the peer.
        reason: String,
    },
}

impl FdoError {
    /// Transport status this error maps to.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Decode(_) | Self::Verification { .. } => Status::BadRequest,
            Self::Auth { .. } | Self::Sequence { .. } => Status::Unauthorized,
            Self::Resource { .. } => Status::NotFound,
            Self::Internal { .. } => Status::InternalError,
        }
    }

    /// Coarse wire error code carried in the response body.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::MessageBody,
            Self::Auth { .. } | Self::Sequence { .. } | Self::Verification { .. } => {
                ErrorCode::InvalidMessage
            }
            Self::Resource { .. } => ErrorCode::ResourceNotFound,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Human-readable description for the wire error object.
    ///
    /// Internal details stay in the log; the peer sees a generic string.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::Internal { .. } => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<CryptoError> for FdoError {
    fn from(err: CryptoError) -> Self {
        Self::Verification {
            reason: err.to_string(),
        }
    }
}

impl From<VoucherError> for FdoError {
    fn from(err: VoucherError) -> Self {
        Self::Verification {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for FdoError {
    fn from(err: StoreError) -> Self {
        Self::Internal {
            reason: err.to_string(),
        }
    }
}
