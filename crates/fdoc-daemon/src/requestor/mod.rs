//! Device-side requestor: drives a remote owner service through TO2,
//! optionally adulterating its own requests to probe the peer's error
//! handling.

mod testexec;
mod to2;

pub use testexec::{RequestTestInst, execute_to2_60_vouchers, execute_to2_66};
pub use to2::{OnboardingReport, To2Requestor};

use thiserror::Error;

use fdoc_core::testcom::FdoTestState;
use fdoc_core::{CodecError, CryptoError, VoucherError};

use crate::exchange::{ExchangeRequest, ExchangeResponse};

/// Transport failure between requestor and listener.
#[derive(Debug, Error)]
#[error("transport failure: {reason}")]
pub struct TransportError {
    /// Transport-specific detail.
    pub reason: String,
}

impl TransportError {
    /// Wraps a transport-specific failure description.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One round-trip to the peer.
///
/// HTTP transports live with the embedding binary; tests dispatch
/// straight into a listener.
pub trait Transport {
    /// Sends one step and returns the peer's response.
    ///
    /// # Errors
    ///
    /// [`TransportError`] when the peer is unreachable. A protocol-level
    /// rejection is a response, not a transport error.
    fn send(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        (**self).send(req)
    }
}

/// Failures on the requestor side.
#[derive(Debug, Error)]
pub enum RequestorError {
    /// The peer could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A signature or encryption operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The served voucher chain failed verification.
    #[error(transparent)]
    Voucher(#[from] VoucherError),

    /// The peer's response violated the protocol.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What was wrong with the response.
        reason: String,
    },
}

impl RequestorError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

/// Result of one requestor step.
///
/// A step run under a fault test does not produce protocol output; it
/// produces an observation of how the peer handled the adulterated
/// request.
#[derive(Debug)]
pub enum StepOutcome<T> {
    /// The step ran positively and produced its protocol output.
    Completed(T),
    /// The step ran as a fault test; the observation grades the peer.
    Observed(FdoTestState),
}

impl<T> StepOutcome<T> {
    /// Unwraps the positive output, rejecting test observations.
    ///
    /// # Errors
    ///
    /// [`RequestorError::Protocol`] when the step was run as a fault test.
    pub fn completed(self) -> Result<T, RequestorError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Observed(_) => Err(RequestorError::protocol(
                "step ran as a fault test and produced no protocol output",
            )),
        }
    }
}
