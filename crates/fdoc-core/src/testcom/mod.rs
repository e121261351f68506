//! Conformance test machinery riding alongside the live protocol.
//!
//! A test run is a scripted queue of [`TestId`]s executed against one
//! device and one sub-protocol. The listener consults the run before and
//! after every protocol step: before, to validate the observed message
//! type against the expected one and select the active test; after, to
//! record the outcome and advance the expectation. Fault tests mutate only
//! the outbound bytes ([`fuzz`]); session state is never touched, so the
//! server stays a correct protocol participant while probing the peer.
//!
//! Once the queue is exhausted, or a message type's testing is complete,
//! the run is a pass-through and the protocol proceeds untested.

mod fuzz;
mod listener;

pub use fuzz::{fuzz_cbor_bytes, fuzz_cose_signature, fuzz_nonce};
pub use listener::ListenerTestState;

use serde::{Deserialize, Serialize};

use crate::messages::MsgType;

/// One scripted conformance test.
///
/// Fault variants name the message type whose handling they adulterate:
/// listener-side, the step whose *response* is corrupted; requestor-side,
/// the request itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestId {
    /// No active test. The sentinel returned when a run is exhausted or
    /// absent; never queued.
    Null,
    /// Positive baseline: run the step correctly and assert the peer's
    /// message was the expected one.
    Positive,
    /// Corrupt the encoded bytes of the named step so they no longer
    /// decode.
    BadEncoding(MsgType),
    /// Corrupt the signature inside the named step's envelope.
    BadSignature(MsgType),
    /// Replace a nonce in the named step with a wrong one.
    WrongNonce(MsgType),
}

/// Structural fault a [`TestId`] dictates for one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Undecodable bytes.
    BadEncoding,
    /// Corrupted signature, structure still decodable.
    BadSignature,
    /// Wrong nonce, signature and structure intact.
    WrongNonce,
}

impl TestId {
    /// The fault this test dictates when handling `cmd`, if any.
    #[must_use]
    pub fn fault_for(self, cmd: MsgType) -> Option<Fault> {
        match self {
            Self::BadEncoding(target) if target == cmd => Some(Fault::BadEncoding),
            Self::BadSignature(target) if target == cmd => Some(Fault::BadSignature),
            Self::WrongNonce(target) if target == cmd => Some(Fault::WrongNonce),
            _ => None,
        }
    }

    /// Whether this identifier designates a fault injection.
    #[must_use]
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Self::BadEncoding(_) | Self::BadSignature(_) | Self::WrongNonce(_)
        )
    }
}

/// Outcome of one executed test, as recorded in a run's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// The test the outcome belongs to.
    pub test_id: TestId,
    /// Whether it passed.
    pub passed: bool,
    /// Failure detail, absent on success.
    pub detail: Option<String>,
}

/// Pass/fail observation shared with the requestor-side test executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdoTestState {
    /// Whether the observation counts as a pass.
    pub passed: bool,
    /// Failure detail, absent on success.
    pub error: Option<String>,
}

impl FdoTestState {
    /// A passing observation.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            passed: true,
            error: None,
        }
    }

    /// A failing observation with detail.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// Scripted listener queue covering the TO1 sub-protocol.
#[must_use]
pub fn to1_listener_queue() -> Vec<TestId> {
    vec![
        TestId::BadEncoding(MsgType::To1HelloRv),
        TestId::Positive,
        TestId::BadEncoding(MsgType::To1ProveToRv),
        TestId::BadSignature(MsgType::To1ProveToRv),
        TestId::Positive,
    ]
}

/// Scripted listener queue covering the TO0 sub-protocol.
#[must_use]
pub fn to0_listener_queue() -> Vec<TestId> {
    vec![TestId::BadEncoding(MsgType::To0OwnerSign), TestId::Positive]
}

/// Requestor-side tests for the TO2 hello step, one fresh voucher each.
#[must_use]
pub fn to2_60_request_tests() -> Vec<TestId> {
    vec![TestId::BadEncoding(MsgType::To2HelloDevice), TestId::Positive]
}

/// Requestor-side tests for the TO2 service-info readiness step.
#[must_use]
pub fn to2_66_request_tests() -> Vec<TestId> {
    vec![
        TestId::BadEncoding(MsgType::To2DeviceServiceInfoReady),
        TestId::Positive,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_targets_one_cmd() {
        let test = TestId::BadEncoding(MsgType::To1HelloRv);
        assert_eq!(
            test.fault_for(MsgType::To1HelloRv),
            Some(Fault::BadEncoding)
        );
        assert_eq!(test.fault_for(MsgType::To1ProveToRv), None);
        assert_eq!(TestId::Positive.fault_for(MsgType::To1HelloRv), None);
        assert!(!TestId::Positive.is_fault());
        assert!(TestId::WrongNonce(MsgType::To2Done).is_fault());
    }

    #[test]
    fn test_id_survives_wire_roundtrip() {
        let bytes = crate::codec::to_vec(&TestId::BadSignature(MsgType::To1ProveToRv)).unwrap();
        let back: TestId = crate::codec::from_slice(&bytes).unwrap();
        assert_eq!(back, TestId::BadSignature(MsgType::To1ProveToRv));
    }
}
