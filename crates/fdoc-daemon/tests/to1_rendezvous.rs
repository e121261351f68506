//! End-to-end rendezvous flows: TO0 registration feeding TO1 redirection.

mod common;

use fdoc_core::codec;
use fdoc_core::crypto::cose::{CoseSignature, EatPayload};
use fdoc_core::messages::to1::{HelloRv30, HelloRvAck31};
use fdoc_core::messages::{ErrorCode, ErrorMessage, MsgType, Protocol};
use fdoc_core::testcom::{ListenerTestState, TestId};
use fdoc_core::types::{Guid, SigInfo};

use fdoc_daemon::exchange::{ExchangeRequest, Status};
use fdoc_daemon::store::{ListenerTestStore, OwnerSignStore};

use common::{bearer_token, init_tracing, register_via_to0, rv_fixture};

fn decode_error(body: &[u8]) -> ErrorMessage {
    codec::from_slice(body).expect("error responses are well-formed encoded objects")
}

#[test]
fn registered_device_obtains_owner_redirect() {
    init_tracing();
    let rv = rv_fixture();
    let built = register_via_to0(&rv, 2);
    let guid = built.credential.guid;

    // Device asks the rendezvous service where its owner is.
    let hello = HelloRv30 {
        guid,
        ea_sig_info: SigInfo::ed25519(),
    };
    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1HelloRv,
        codec::to_vec(&hello).unwrap(),
    ));
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.msg_type, MsgType::To1HelloRvAck);
    let token = bearer_token(&resp);
    let ack: HelloRvAck31 = codec::from_slice(&resp.body).unwrap();

    // Device signs the issued nonce with its leaf key.
    let proof = EatPayload {
        nonce: ack.nonce_to1_proof,
        guid,
    }
    .sign(&built.credential.key())
    .unwrap();
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To1ProveToRv,
        &token,
        codec::to_vec(&proof).unwrap(),
    ));
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.msg_type, MsgType::To1RvRedirect);

    // The served redirect is byte-for-byte the registered to1d.
    let served: CoseSignature = codec::from_slice(&resp.body).unwrap();
    let stored = rv
        .ownersign
        .get(&guid)
        .unwrap()
        .expect("registration on file");
    assert_eq!(served, stored.to1d);
    served.verify(&built.owner_key.public()).expect("redirect verifies");
}

#[test]
fn unregistered_device_is_not_found() {
    init_tracing();
    let rv = rv_fixture();
    let hello = HelloRv30 {
        guid: Guid::random(),
        ea_sig_info: SigInfo::ed25519(),
    };
    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1HelloRv,
        codec::to_vec(&hello).unwrap(),
    ));
    assert_eq!(resp.status, Status::NotFound);
    assert_eq!(
        decode_error(&resp.body).error_code,
        ErrorCode::ResourceNotFound
    );
}

#[test]
fn tampered_nonce_fails_verification() {
    init_tracing();
    let rv = rv_fixture();
    let built = register_via_to0(&rv, 1);
    let guid = built.credential.guid;

    let hello = HelloRv30 {
        guid,
        ea_sig_info: SigInfo::ed25519(),
    };
    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1HelloRv,
        codec::to_vec(&hello).unwrap(),
    ));
    let token = bearer_token(&resp);
    let ack: HelloRvAck31 = codec::from_slice(&resp.body).unwrap();

    // A single changed nonce byte must be a hard validation failure.
    let mut wrong_nonce = ack.nonce_to1_proof;
    wrong_nonce.0[0] ^= 0x01;
    let proof = EatPayload {
        nonce: wrong_nonce,
        guid,
    }
    .sign(&built.credential.key())
    .unwrap();
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To1ProveToRv,
        &token,
        codec::to_vec(&proof).unwrap(),
    ));
    assert_eq!(resp.status, Status::Unauthorized);
    assert_eq!(
        decode_error(&resp.body).error_code,
        ErrorCode::InvalidMessage
    );
}

#[test]
fn proof_signed_by_wrong_key_is_rejected() {
    init_tracing();
    let rv = rv_fixture();
    let built = register_via_to0(&rv, 1);
    let guid = built.credential.guid;

    let hello = HelloRv30 {
        guid,
        ea_sig_info: SigInfo::ed25519(),
    };
    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1HelloRv,
        codec::to_vec(&hello).unwrap(),
    ));
    let token = bearer_token(&resp);
    let ack: HelloRvAck31 = codec::from_slice(&resp.body).unwrap();

    // Right nonce, wrong signer: the owner key is not the device leaf.
    let proof = EatPayload {
        nonce: ack.nonce_to1_proof,
        guid,
    }
    .sign(&built.owner_key)
    .unwrap();
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To1ProveToRv,
        &token,
        codec::to_vec(&proof).unwrap(),
    ));
    assert_eq!(resp.status, Status::Unauthorized);
}

#[test]
fn missing_bearer_token_is_unauthorized() {
    init_tracing();
    let rv = rv_fixture();
    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1ProveToRv,
        codec::to_vec(&0u8).unwrap(),
    ));
    assert_eq!(resp.status, Status::Unauthorized);
}

#[test]
fn out_of_sequence_proof_is_rejected_and_logged() {
    init_tracing();
    let rv = rv_fixture();
    let built = register_via_to0(&rv, 1);
    let guid = built.credential.guid;

    // Complete a legitimate handshake first; the session's previous step
    // is now the redirect, not the hello ack.
    let hello = HelloRv30 {
        guid,
        ea_sig_info: SigInfo::ed25519(),
    };
    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1HelloRv,
        codec::to_vec(&hello).unwrap(),
    ));
    let token = bearer_token(&resp);
    let ack: HelloRvAck31 = codec::from_slice(&resp.body).unwrap();
    let proof = EatPayload {
        nonce: ack.nonce_to1_proof,
        guid,
    }
    .sign(&built.credential.key())
    .unwrap();
    let proof_bytes = codec::to_vec(&proof).unwrap();
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To1ProveToRv,
        &token,
        proof_bytes.clone(),
    ));
    assert_eq!(resp.status, Status::Ok);

    // Activate a test run expecting the handshake to start over.
    rv.tests
        .upsert(ListenerTestState::new(
            guid,
            Protocol::To1,
            vec![TestId::Positive, TestId::Positive],
            MsgType::To1HelloRv,
        ))
        .unwrap();

    // Replaying the proof breaks the previous-step invariant.
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To1ProveToRv,
        &token,
        proof_bytes,
    ));
    assert_eq!(resp.status, Status::Unauthorized);
    assert_eq!(
        decode_error(&resp.body).error_code,
        ErrorCode::InvalidMessage
    );

    // The run logged exactly one failure citing expected-vs-received.
    let run = rv.tests.get(&guid, Protocol::To1).unwrap().unwrap();
    assert_eq!(run.failed_count(), 1);
    let outcome = &run.log()[0];
    assert!(!outcome.passed);
    let detail = outcome.detail.as_deref().unwrap();
    assert!(detail.contains("30"), "detail names expected type: {detail}");
    assert!(detail.contains("32"), "detail names received type: {detail}");
}
