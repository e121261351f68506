//! Shared fixtures: listeners over in-memory stores and a direct-dispatch
//! transport.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fdoc_core::codec;
use fdoc_core::crypto::cose::CoseSignature;
use fdoc_core::messages::to0::{
    AcceptOwner23, Hello20, HelloAck21, OwnerSign22, RvTo2Addr, To0d, To1dPayload,
    TransportProtocol,
};
use fdoc_core::messages::MsgType;
use fdoc_core::types::ServiceInfoKv;
use fdoc_core::voucher::{BuiltVoucher, DeviceCredential, VoucherBuilder};

use fdoc_daemon::config::ListenerConfig;
use fdoc_daemon::exchange::{ExchangeRequest, ExchangeResponse, Status};
use fdoc_daemon::listener::{OwnerListener, RvListener};
use fdoc_daemon::requestor::{Transport, TransportError};
use fdoc_daemon::store::memory::{
    MemoryListenerTestStore, MemoryOwnerSignStore, MemoryOwnerVoucherStore, MemorySessionStore,
};
use fdoc_daemon::store::{OwnerVoucherEntry, OwnerVoucherStore};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Owner listener plus handles to its stores.
pub struct OwnerFixture {
    pub listener: OwnerListener,
    pub sessions: Arc<MemorySessionStore>,
    pub vouchers: Arc<MemoryOwnerVoucherStore>,
    pub tests: Arc<MemoryListenerTestStore>,
}

pub fn owner_fixture() -> OwnerFixture {
    let config = ListenerConfig::default();
    let sessions = Arc::new(MemorySessionStore::new(config.session_ttl()));
    let vouchers = Arc::new(MemoryOwnerVoucherStore::new());
    let tests = Arc::new(MemoryListenerTestStore::new());
    let listener = OwnerListener::new(
        config,
        sessions.clone(),
        vouchers.clone(),
        tests.clone(),
    );
    OwnerFixture {
        listener,
        sessions,
        vouchers,
        tests,
    }
}

/// Rendezvous listener plus handles to its stores.
pub struct RvFixture {
    pub listener: RvListener,
    pub sessions: Arc<MemorySessionStore>,
    pub ownersign: Arc<MemoryOwnerSignStore>,
    pub tests: Arc<MemoryListenerTestStore>,
}

pub fn rv_fixture() -> RvFixture {
    let config = ListenerConfig::default();
    let sessions = Arc::new(MemorySessionStore::new(config.session_ttl()));
    let ownersign = Arc::new(MemoryOwnerSignStore::new());
    let tests = Arc::new(MemoryListenerTestStore::new());
    let listener = RvListener::new(
        config,
        sessions.clone(),
        ownersign.clone(),
        tests.clone(),
    );
    RvFixture {
        listener,
        sessions,
        ownersign,
        tests,
    }
}

/// Mints a device and provisions its voucher into the owner service.
pub fn provision_owner_device(
    fixture: &OwnerFixture,
    owners: usize,
    owner_sims: Vec<ServiceInfoKv>,
) -> DeviceCredential {
    let built = VoucherBuilder::new("conformance-device")
        .owners(owners)
        .build()
        .expect("mint voucher");
    let credential = built.credential.clone();
    fixture
        .vouchers
        .set(
            credential.guid,
            OwnerVoucherEntry {
                voucher: built.voucher,
                owner_key_seed: built.owner_key.seed(),
                owner_sims,
            },
        )
        .expect("provision voucher");
    credential
}

/// Pulls the bearer token out of a first-step response.
pub fn bearer_token(resp: &ExchangeResponse) -> String {
    resp.authorization
        .as_deref()
        .and_then(|header| header.strip_prefix("Bearer "))
        .expect("response carries a bearer token")
        .to_string()
}

/// Runs the full TO0 registration against the rendezvous listener for a
/// freshly minted device, returning the minted material.
pub fn register_via_to0(rv: &RvFixture, owners: usize) -> BuiltVoucher {
    let built = VoucherBuilder::new("conformance-device")
        .owners(owners)
        .build()
        .expect("mint voucher");

    let hello = codec::to_vec(&Hello20 {}).unwrap();
    let resp = rv
        .listener
        .dispatch(&ExchangeRequest::opening(MsgType::To0Hello, hello));
    assert_eq!(resp.status, Status::Ok, "TO0 hello rejected");
    let token = bearer_token(&resp);
    let ack: HelloAck21 = codec::from_slice(&resp.body).unwrap();

    let to0d = To0d {
        voucher: built.voucher.clone(),
        wait_seconds: 3600,
        nonce_to0_sign: ack.nonce_to0_sign,
    };
    let to0d_bytes = codec::to_vec(&to0d).unwrap();
    let payload = To1dPayload {
        addrs: vec![RvTo2Addr {
            host: "owner.example".to_string(),
            port: 8043,
            protocol: TransportProtocol::Https,
        }],
        to0d_hash: To1dPayload::hash_to0d(&to0d_bytes),
    };
    let to1d =
        CoseSignature::sign(codec::to_vec(&payload).unwrap(), &built.owner_key).unwrap();
    let msg = OwnerSign22 {
        to0d: to0d_bytes.into(),
        to1d,
    };
    let resp = rv.listener.dispatch(&ExchangeRequest::with_bearer(
        MsgType::To0OwnerSign,
        &token,
        codec::to_vec(&msg).unwrap(),
    ));
    assert_eq!(resp.status, Status::Ok, "TO0 registration rejected");
    let accept: AcceptOwner23 = codec::from_slice(&resp.body).unwrap();
    assert!(accept.wait_seconds <= 3600);

    built
}

/// Transport dispatching straight into an owner listener.
pub struct DirectTransport<'a> {
    listener: &'a OwnerListener,
}

impl<'a> DirectTransport<'a> {
    pub fn new(listener: &'a OwnerListener) -> Self {
        Self { listener }
    }
}

impl Transport for DirectTransport<'_> {
    fn send(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        Ok(self.listener.dispatch(&req))
    }
}

/// Transport recording the message types it carried.
pub struct RecordingTransport<T> {
    inner: T,
    log: Mutex<Vec<MsgType>>,
}

impl<T> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<MsgType> {
        self.log.lock().expect("transport log lock").clone()
    }

    pub fn count_of(&self, msg_type: MsgType) -> usize {
        self.sent().iter().filter(|sent| **sent == msg_type).count()
    }
}

impl<T: Transport> Transport for RecordingTransport<T> {
    fn send(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        self.log
            .lock()
            .expect("transport log lock")
            .push(req.msg_type);
        self.inner.send(req)
    }
}
