//! The conformance oracle riding alongside live protocol runs: fault
//! injection, outcome recording, and pass-through behavior.

mod common;

use fdoc_core::codec;
use fdoc_core::crypto::cose::{CoseSignature, EatPayload};
use fdoc_core::messages::to0::{Hello20, HelloAck21, OwnerSign22, RvTo2Addr, To0d, To1dPayload, TransportProtocol};
use fdoc_core::messages::to1::{HelloRv30, HelloRvAck31};
use fdoc_core::messages::{MsgType, Protocol};
use fdoc_core::testcom::{ListenerTestState, TestId};
use fdoc_core::types::SigInfo;
use fdoc_core::voucher::VoucherBuilder;

use fdoc_daemon::exchange::{ExchangeRequest, Status};
use fdoc_daemon::requestor::{RequestTestInst, execute_to2_60_vouchers, execute_to2_66};
use fdoc_daemon::store::memory::MemoryRequestTestStore;
use fdoc_daemon::store::{ListenerTestStore, OwnerSignStore, SessionStore};

use common::{
    DirectTransport, bearer_token, init_tracing, owner_fixture, register_via_to0, rv_fixture,
};

/// One TO1 handshake attempt; returns the raw hello-ack response so the
/// caller can observe injected faults.
fn attempt_hello(rv: &common::RvFixture, guid: fdoc_core::Guid) -> fdoc_daemon::ExchangeResponse {
    let hello = HelloRv30 {
        guid,
        ea_sig_info: SigInfo::ed25519(),
    };
    rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To1HelloRv,
        codec::to_vec(&hello).unwrap(),
    ))
}

#[test]
fn injected_encoding_fault_is_output_only_and_credited_on_retry() {
    init_tracing();
    let rv = rv_fixture();
    let built = register_via_to0(&rv, 1);
    let guid = built.credential.guid;

    rv.tests
        .upsert(ListenerTestState::new(
            guid,
            Protocol::To1,
            vec![
                TestId::BadEncoding(MsgType::To1HelloRv),
                TestId::Positive,
                TestId::Positive,
            ],
            MsgType::To1HelloRv,
        ))
        .unwrap();

    // Attempt 1: the response status is a protocol success, but the bytes
    // were corrupted after computation and must not decode.
    let faulted = attempt_hello(&rv, guid);
    assert_eq!(faulted.status, Status::Ok);
    assert!(codec::from_slice::<HelloRvAck31>(&faulted.body).is_err());

    // Internal state is the non-faulted baseline: the session behind the
    // issued token carries a real nonce and the expected marker.
    let token = fdoc_daemon::SessionToken::from_presented(&bearer_token(&faulted));
    let session = rv.sessions.get(&token).unwrap().expect("session exists");
    assert_eq!(session.prev_cmd, Some(MsgType::To1HelloRvAck));
    assert!(session.nonce_to1_proof.is_some());

    // Attempt 2: the device retried, which credits the fault test; the
    // positive baseline then grades the rest of the handshake.
    let resp = attempt_hello(&rv, guid);
    assert_eq!(resp.status, Status::Ok);
    let token = bearer_token(&resp);
    let ack: HelloRvAck31 = codec::from_slice(&resp.body).unwrap();

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

    let run = rv.tests.get(&guid, Protocol::To1).unwrap().unwrap();
    assert!(run.is_completed());
    assert_eq!(run.passed_count(), 3);
    assert_eq!(run.failed_count(), 0);
    assert_eq!(run.log()[0].test_id, TestId::BadEncoding(MsgType::To1HelloRv));
}

#[test]
fn completed_run_passes_through_untested() {
    init_tracing();
    let rv = rv_fixture();
    let built = register_via_to0(&rv, 1);
    let guid = built.credential.guid;

    rv.tests
        .upsert(ListenerTestState::new(
            guid,
            Protocol::To1,
            vec![TestId::Positive, TestId::Positive],
            MsgType::To1HelloRv,
        ))
        .unwrap();

    let run_handshake = || {
        let resp = attempt_hello(&rv, guid);
        assert_eq!(resp.status, Status::Ok);
        let token = bearer_token(&resp);
        let ack: HelloRvAck31 = codec::from_slice(&resp.body).unwrap();
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
    };

    run_handshake();
    let run = rv.tests.get(&guid, Protocol::To1).unwrap().unwrap();
    assert!(run.is_completed());
    let recorded = run.log().len();

    // Subsequent handshakes proceed as a plain implementation: nothing
    // recorded, nothing injected.
    run_handshake();
    run_handshake();
    let run = rv.tests.get(&guid, Protocol::To1).unwrap().unwrap();
    assert_eq!(run.log().len(), recorded);
}

#[test]
fn to0_fault_corrupts_response_but_not_registration() {
    init_tracing();
    let rv = rv_fixture();
    let built = VoucherBuilder::new("conformance-device")
        .owners(1)
        .build()
        .unwrap();
    let guid = built.credential.guid;

    rv.tests
        .upsert(ListenerTestState::new(
            guid,
            Protocol::To0,
            vec![TestId::BadEncoding(MsgType::To0OwnerSign)],
            MsgType::To0OwnerSign,
        ))
        .unwrap();

    let resp = rv.listener.dispatch(&ExchangeRequest::opening(
        MsgType::To0Hello,
        codec::to_vec(&Hello20 {}).unwrap(),
    ));
    assert_eq!(resp.status, Status::Ok);
    let token = bearer_token(&resp);
    let ack: HelloAck21 = codec::from_slice(&resp.body).unwrap();

    let to0d = To0d {
        voucher: built.voucher.clone(),
        wait_seconds: 600,
        nonce_to0_sign: ack.nonce_to0_sign,
    };
    let to0d_bytes = codec::to_vec(&to0d).unwrap();
    let payload = To1dPayload {
        addrs: vec![RvTo2Addr {
            host: "owner.example".to_string(),
            port: 8043,
            protocol: TransportProtocol::Http,
        }],
        to0d_hash: To1dPayload::hash_to0d(&to0d_bytes),
    };
    let to1d = CoseSignature::sign(codec::to_vec(&payload).unwrap(), &built.owner_key).unwrap();
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To0OwnerSign,
        &token,
        codec::to_vec(&OwnerSign22 {
            to0d: to0d_bytes.into(),
            to1d,
        })
        .unwrap(),
    ));

    // The acceptance bytes were corrupted on the way out only: the
    // registration and the session advanced exactly as in the baseline.
    assert_eq!(resp.status, Status::Ok);
    assert!(codec::from_slice::<fdoc_core::messages::to0::AcceptOwner23>(&resp.body).is_err());
    assert!(rv.ownersign.get(&guid).unwrap().is_some());
    let token = fdoc_daemon::SessionToken::from_presented(&token);
    let session = rv.sessions.get(&token).unwrap().expect("session exists");
    assert_eq!(session.prev_cmd, Some(MsgType::To0AcceptOwner));
}

#[test]
fn to2_signature_fault_is_detected_by_the_device() {
    init_tracing();
    let fixture = owner_fixture();
    let credential = common::provision_owner_device(&fixture, 1, Vec::new());
    let guid = credential.guid;

    fixture
        .tests
        .upsert(ListenerTestState::new(
            guid,
            Protocol::To2,
            vec![
                TestId::BadSignature(MsgType::To2HelloDevice),
                TestId::Positive,
            ],
            MsgType::To2HelloDevice,
        ))
        .unwrap();

    let transport = DirectTransport::new(&fixture.listener);
    let mut requestor = fdoc_daemon::requestor::To2Requestor::new(
        &transport,
        credential,
        fdoc_core::crypto::kex::KexSuite::X25519,
        fdoc_core::crypto::cipher::CipherSuite::A128Gcm,
    );

    // Attempt 1: the owner's header proof carries a corrupted signature;
    // a conformant device must refuse it.
    let err = requestor.hello_device_60(TestId::Null).unwrap_err();
    assert!(matches!(
        err,
        fdoc_daemon::requestor::RequestorError::Crypto(_)
    ));

    // Attempt 2: the retry is graded by the positive baseline and the
    // fault test is credited as survived.
    requestor
        .hello_device_60(TestId::Null)
        .unwrap()
        .completed()
        .unwrap();

    let run = fixture.tests.get(&guid, Protocol::To2).unwrap().unwrap();
    assert_eq!(run.passed_count(), 2);
    assert_eq!(run.failed_count(), 0);
    assert_eq!(
        run.log()[0].test_id,
        TestId::BadSignature(MsgType::To2HelloDevice)
    );
}

#[test]
fn requestor_batches_report_into_ledger() {
    init_tracing();
    let fixture = owner_fixture();
    let transport = DirectTransport::new(&fixture.listener);
    let reports = MemoryRequestTestStore::new();
    let inst = RequestTestInst::new();

    execute_to2_60_vouchers(&inst, &transport, fixture.vouchers.as_ref(), &reports).unwrap();
    execute_to2_66(&inst, &transport, fixture.vouchers.as_ref(), &reports).unwrap();

    let recorded = reports.reports_for(inst.run_id);
    assert_eq!(recorded.len(), 4);
    for (test_id, state) in &recorded {
        assert!(
            state.passed,
            "{test_id:?} failed: {:?}",
            state.error
        );
    }
}
