//! The TO2 requestor state machine.

use subtle::ConstantTimeEq;
use tracing::debug;

use fdoc_core::codec;
use fdoc_core::crypto::cipher::{self, CipherSuite, EncryptedEnvelope};
use fdoc_core::crypto::cose::{CoseSignature, UnprotectedHeader};
use fdoc_core::crypto::keys::PublicKey;
use fdoc_core::crypto::kex::{KexState, KexSuite};
use fdoc_core::messages::to2::{
    DeviceServiceInfo68, DeviceServiceInfoReady66, Done70, Done271, GetOvNextEntry62,
    HelloDevice60, MTU_BYTES, OvNextEntry63, OwnerServiceInfo69, OwnerServiceInfoReady67,
    ProveDevicePayload, ProveOvHdrPayload, SetupDevicePayload,
};
use fdoc_core::messages::{ErrorMessage, MsgType};
use fdoc_core::testcom::{Fault, FdoTestState, TestId, fuzz_cbor_bytes, fuzz_cose_signature, fuzz_nonce};
use fdoc_core::types::{Nonce16, ServiceInfoKv, SigInfo};
use fdoc_core::voucher::{DeviceCredential, OvEntry, header_hmac, verify_entry_chain};

use crate::exchange::{ExchangeRequest, ExchangeResponse, Status};

use super::{RequestorError, StepOutcome, Transport};

/// Upper bound on service-info round-trips, against a peer that never
/// signals completion.
const MAX_SERVICE_INFO_ROUNDS: usize = 1024;

/// Everything a completed onboarding produced.
#[derive(Debug)]
pub struct OnboardingReport {
    /// The owner's setup payload.
    pub setup: SetupDevicePayload,
    /// Owner service-info pages, in arrival order.
    pub owner_pages: Vec<ServiceInfoKv>,
}

/// Device-side TO2 state machine.
///
/// Each step method takes a [`TestId`]; a fault test adulterates the
/// request and returns the peer's reaction as an observation instead of
/// protocol output. [`TestId::Null`] runs the step as a plain device.
pub struct To2Requestor<T: Transport> {
    transport: T,
    credential: DeviceCredential,
    kex_suite: KexSuite,
    cipher_suite: CipherSuite,
    device_sims: Vec<ServiceInfoKv>,

    token: Option<String>,
    nonce_prove_ov: Option<Nonce16>,
    nonce_prove_dv: Option<Nonce16>,
    nonce_setup_dv: Option<Nonce16>,
    owner_pub_key: Option<PublicKey>,
    prove_ov_hdr: Option<ProveOvHdrPayload>,
    session_key: Option<Vec<u8>>,
}

impl<T: Transport> To2Requestor<T> {
    /// Builds a requestor for one device credential and one suite choice.
    #[must_use]
    pub fn new(
        transport: T,
        credential: DeviceCredential,
        kex_suite: KexSuite,
        cipher_suite: CipherSuite,
    ) -> Self {
        Self {
            transport,
            credential,
            kex_suite,
            cipher_suite,
            device_sims: Vec::new(),
            token: None,
            nonce_prove_ov: None,
            nonce_prove_dv: None,
            nonce_setup_dv: None,
            owner_pub_key: None,
            prove_ov_hdr: None,
            session_key: None,
        }
    }

    /// Queues device service-info pages to send during the exchange.
    #[must_use]
    pub fn with_device_sims(mut self, pages: Vec<ServiceInfoKv>) -> Self {
        self.device_sims = pages;
        self
    }

    fn send(&self, msg_type: MsgType, body: Vec<u8>) -> Result<ExchangeResponse, RequestorError> {
        let req = match &self.token {
            Some(token) => ExchangeRequest::with_bearer(msg_type, token, body),
            None => ExchangeRequest::opening(msg_type, body),
        };
        Ok(self.transport.send(req)?)
    }

    /// Grades the peer's reaction to an adulterated request: a pass is a
    /// non-OK status carrying a well-formed error object.
    fn observe_rejection(resp: &ExchangeResponse, test_id: TestId) -> FdoTestState {
        if resp.status == Status::Ok {
            return FdoTestState::failed(format!(
                "peer accepted the adulterated message of {test_id:?}"
            ));
        }
        match codec::from_slice::<ErrorMessage>(&resp.body) {
            Ok(_) => FdoTestState::passed(),
            Err(err) => FdoTestState::failed(format!(
                "peer rejected {test_id:?} but its error object is malformed: {err}"
            )),
        }
    }

    fn ensure_ok(resp: &ExchangeResponse, expected: MsgType) -> Result<(), RequestorError> {
        if resp.status != Status::Ok {
            let detail = codec::from_slice::<ErrorMessage>(&resp.body)
                .map(|err| err.message)
                .unwrap_or_else(|_| "undecodable error body".to_string());
            return Err(RequestorError::protocol(format!(
                "peer rejected the step ({}): {detail}",
                resp.status.http_code()
            )));
        }
        if resp.msg_type != expected {
            return Err(RequestorError::protocol(format!(
                "expected response type {expected}, got {}",
                resp.msg_type
            )));
        }
        Ok(())
    }

    fn session_key(&self) -> Result<&[u8], RequestorError> {
        self.session_key
            .as_deref()
            .ok_or_else(|| RequestorError::protocol("no session key derived yet"))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, RequestorError> {
        let envelope = cipher::encrypt(plaintext, self.session_key()?, self.cipher_suite)?;
        Ok(codec::to_vec(&envelope)?)
    }

    fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, RequestorError> {
        let envelope: EncryptedEnvelope = codec::from_slice(body)?;
        Ok(cipher::decrypt(&envelope, self.session_key()?, self.cipher_suite)?)
    }

    /// HelloDevice60: open the transfer, receive and check the signed
    /// voucher header.
    ///
    /// # Errors
    ///
    /// [`RequestorError::Protocol`] for any deviation: missing owner key,
    /// bad signature, nonce echo mismatch, or a header HMAC that does not
    /// match this device's secret.
    pub fn hello_device_60(
        &mut self,
        test_id: TestId,
    ) -> Result<StepOutcome<ProveOvHdrPayload>, RequestorError> {
        let current = MsgType::To2HelloDevice;
        let nonce_prove_ov = Nonce16::random();
        let hello = HelloDevice60 {
            guid: self.credential.guid,
            nonce_prove_ov,
            kex_suite: self.kex_suite,
            cipher_suite: self.cipher_suite,
            ea_sig_info: SigInfo::ed25519(),
        };
        let mut body = codec::to_vec(&hello)?;
        let fault = test_id.fault_for(current);
        if fault == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        let resp = self.send(current, body)?;
        if fault.is_some() {
            return Ok(StepOutcome::Observed(Self::observe_rejection(
                &resp, test_id,
            )));
        }
        Self::ensure_ok(&resp, MsgType::To2ProveOvHdr)?;

        let token = resp
            .authorization
            .as_deref()
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or_else(|| RequestorError::protocol("response carries no bearer token"))?;
        self.token = Some(token.to_string());

        let envelope: CoseSignature = codec::from_slice(&resp.body)?;
        let owner_pub = envelope
            .unprotected
            .owner_pub_key
            .ok_or_else(|| RequestorError::protocol("header proof names no owner key"))?;
        envelope.verify(&owner_pub)?;
        let payload: ProveOvHdrPayload = envelope.decode_payload()?;

        if !payload.nonce_prove_ov.ct_eq(&nonce_prove_ov) {
            return Err(RequestorError::protocol(format!(
                "header-proof nonce echo mismatch: sent {nonce_prove_ov}, got {}",
                payload.nonce_prove_ov
            )));
        }
        let expected_hmac = header_hmac(&self.credential.hmac_secret, &payload.header);
        if !bool::from(expected_hmac.ct_eq(&payload.hmac)) {
            return Err(RequestorError::protocol(
                "voucher header HMAC does not match this device's secret",
            ));
        }
        let nonce_prove_dv = envelope
            .unprotected
            .nonce
            .ok_or_else(|| RequestorError::protocol("header proof issues no device-proof nonce"))?;

        self.nonce_prove_ov = Some(nonce_prove_ov);
        self.nonce_prove_dv = Some(nonce_prove_dv);
        self.owner_pub_key = Some(owner_pub);
        self.prove_ov_hdr = Some(payload.clone());
        debug!(entries = payload.num_entries, "voucher header proven");
        Ok(StepOutcome::Completed(payload))
    }

    /// GetOvNextEntry62 for one index.
    ///
    /// # Errors
    ///
    /// [`RequestorError::Protocol`] when the served index does not echo
    /// the requested one.
    pub fn get_ov_next_entry_62(
        &mut self,
        entry_num: u8,
        test_id: TestId,
    ) -> Result<StepOutcome<OvNextEntry63>, RequestorError> {
        let current = MsgType::To2GetOvNextEntry;
        let mut body = codec::to_vec(&GetOvNextEntry62 { entry_num })?;
        let fault = test_id.fault_for(current);
        if fault == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        let resp = self.send(current, body)?;
        if fault.is_some() {
            return Ok(StepOutcome::Observed(Self::observe_rejection(
                &resp, test_id,
            )));
        }
        Self::ensure_ok(&resp, MsgType::To2OvNextEntry)?;

        let served: OvNextEntry63 = codec::from_slice(&resp.body)?;
        if served.entry_num != entry_num {
            return Err(RequestorError::protocol(format!(
                "requested entry {entry_num}, got {}",
                served.entry_num
            )));
        }
        Ok(StepOutcome::Completed(served))
    }

    /// Fetches every voucher entry in order and verifies the chain ends
    /// in the owner key announced at the hello step.
    ///
    /// # Errors
    ///
    /// [`RequestorError::Voucher`] for a broken chain,
    /// [`RequestorError::Protocol`] when the terminal key is not the
    /// announced owner key.
    pub fn fetch_and_verify_entries(&mut self) -> Result<(), RequestorError> {
        let hdr = self
            .prove_ov_hdr
            .clone()
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;

        let mut entries: Vec<OvEntry> = Vec::with_capacity(usize::from(hdr.num_entries));
        for entry_num in 0..hdr.num_entries {
            let served = self
                .get_ov_next_entry_62(entry_num, TestId::Null)?
                .completed()?;
            entries.push(served.entry);
        }

        let terminal = verify_entry_chain(&hdr.header, &hdr.hmac, &entries)?;
        let announced = self
            .owner_pub_key
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;
        if !terminal.equals(&announced) {
            return Err(RequestorError::protocol(
                "custody chain does not end in the announced owner key",
            ));
        }
        debug!(entries = entries.len(), "custody chain verified");
        Ok(())
    }

    /// ProveDevice64: prove possession of the device key, contribute the
    /// key exchange, and derive the session key.
    pub fn prove_device_64(
        &mut self,
        test_id: TestId,
    ) -> Result<StepOutcome<SetupDevicePayload>, RequestorError> {
        let current = MsgType::To2ProveDevice;
        let nonce_prove_dv = self
            .nonce_prove_dv
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;
        let nonce_prove_ov = self
            .nonce_prove_ov
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;
        let hdr = self
            .prove_ov_hdr
            .as_ref()
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;

        let kex = KexState::generate();
        let nonce_setup_dv = Nonce16::random();
        let fault = test_id.fault_for(current);

        let mut payload = ProveDevicePayload {
            nonce_prove_dv,
            guid: self.credential.guid,
            xb: kex.public_bytes(),
        };
        if fault == Some(Fault::WrongNonce) {
            payload.nonce_prove_dv = fuzz_nonce(&payload.nonce_prove_dv);
        }
        let mut envelope = CoseSignature::sign(codec::to_vec(&payload)?, &self.credential.key())?
            .with_unprotected(UnprotectedHeader {
                nonce: Some(nonce_setup_dv),
                owner_pub_key: None,
            });
        if fault == Some(Fault::BadSignature) {
            envelope = fuzz_cose_signature(&envelope);
        }
        let mut body = codec::to_vec(&envelope)?;
        if fault == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        let resp = self.send(current, body)?;
        if fault.is_some() {
            return Ok(StepOutcome::Observed(Self::observe_rejection(
                &resp, test_id,
            )));
        }
        Self::ensure_ok(&resp, MsgType::To2SetupDevice)?;

        let session_key = kex.derive_session_key(
            &hdr.xa,
            self.kex_suite,
            self.cipher_suite,
            &nonce_prove_ov,
            &nonce_prove_dv,
        )?;
        self.session_key = Some(session_key.to_vec());
        self.nonce_setup_dv = Some(nonce_setup_dv);

        let plaintext = self.decrypt(&resp.body)?;
        let setup_envelope: CoseSignature = codec::from_slice(&plaintext)?;
        let owner_pub = self
            .owner_pub_key
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;
        setup_envelope.verify(&owner_pub)?;
        let setup: SetupDevicePayload = setup_envelope.decode_payload()?;
        if !setup.nonce_setup_dv.ct_eq(&nonce_setup_dv) {
            return Err(RequestorError::protocol(
                "setup nonce echo mismatch".to_string(),
            ));
        }
        debug!("device proven, session key derived");
        Ok(StepOutcome::Completed(setup))
    }

    /// DeviceServiceInfoReady66.
    pub fn device_service_info_ready_66(
        &mut self,
        test_id: TestId,
    ) -> Result<StepOutcome<OwnerServiceInfoReady67>, RequestorError> {
        let current = MsgType::To2DeviceServiceInfoReady;
        let ready = DeviceServiceInfoReady66 {
            max_owner_message_size: Some(u16::try_from(MTU_BYTES).unwrap_or(u16::MAX)),
        };
        let mut plaintext = codec::to_vec(&ready)?;
        let fault = test_id.fault_for(current);
        if fault == Some(Fault::BadEncoding) {
            plaintext = fuzz_cbor_bytes(&plaintext);
        }
        let body = self.encrypt(&plaintext)?;

        let resp = self.send(current, body)?;
        if fault.is_some() {
            return Ok(StepOutcome::Observed(Self::observe_rejection(
                &resp, test_id,
            )));
        }
        Self::ensure_ok(&resp, MsgType::To2OwnerServiceInfoReady)?;

        let out = self.decrypt(&resp.body)?;
        let ready67: OwnerServiceInfoReady67 = codec::from_slice(&out)?;
        Ok(StepOutcome::Completed(ready67))
    }

    /// Runs the paginated service-info exchange to completion, sending
    /// the queued device pages in order and collecting the owner's.
    ///
    /// # Errors
    ///
    /// [`RequestorError::Protocol`] when the peer never signals
    /// completion.
    pub fn service_info_exchange(&mut self) -> Result<Vec<ServiceInfoKv>, RequestorError> {
        let pages = self.device_sims.clone();
        let total = pages.len();
        let mut owner_pages = Vec::new();
        let mut idx = 0;

        for _ in 0..MAX_SERVICE_INFO_ROUNDS {
            let (is_more, service_info) = if idx < total {
                let page = pages[idx].clone();
                idx += 1;
                (idx < total, Some(page))
            } else {
                (false, None)
            };
            let msg = DeviceServiceInfo68 {
                is_more,
                service_info,
            };
            let body = self.encrypt(&codec::to_vec(&msg)?)?;
            let resp = self.send(MsgType::To2DeviceServiceInfo, body)?;
            Self::ensure_ok(&resp, MsgType::To2OwnerServiceInfo)?;

            let out = self.decrypt(&resp.body)?;
            let owner: OwnerServiceInfo69 = codec::from_slice(&out)?;
            if let Some(page) = owner.service_info {
                owner_pages.push(page);
            }
            if owner.is_done {
                debug!(
                    sent = total,
                    received = owner_pages.len(),
                    "service-info exchange complete"
                );
                return Ok(owner_pages);
            }
        }
        Err(RequestorError::protocol(
            "service-info exchange never completed",
        ))
    }

    /// Done70: close the handshake.
    pub fn done_70(&mut self, test_id: TestId) -> Result<StepOutcome<Done271>, RequestorError> {
        let current = MsgType::To2Done;
        let nonce_prove_dv = self
            .nonce_prove_dv
            .ok_or_else(|| RequestorError::protocol("hello step not completed"))?;
        let nonce_setup_dv = self
            .nonce_setup_dv
            .ok_or_else(|| RequestorError::protocol("device proof not completed"))?;

        let fault = test_id.fault_for(current);
        let sent_nonce = if fault == Some(Fault::WrongNonce) {
            fuzz_nonce(&nonce_prove_dv)
        } else {
            nonce_prove_dv
        };
        let mut plaintext = codec::to_vec(&Done70 {
            nonce_prove_dv: sent_nonce,
        })?;
        if fault == Some(Fault::BadEncoding) {
            plaintext = fuzz_cbor_bytes(&plaintext);
        }
        let body = self.encrypt(&plaintext)?;

        let resp = self.send(current, body)?;
        if fault.is_some() {
            return Ok(StepOutcome::Observed(Self::observe_rejection(
                &resp, test_id,
            )));
        }
        Self::ensure_ok(&resp, MsgType::To2Done2)?;

        let out = self.decrypt(&resp.body)?;
        let done2: Done271 = codec::from_slice(&out)?;
        if !done2.nonce_setup_dv.ct_eq(&nonce_setup_dv) {
            return Err(RequestorError::protocol(
                "completion setup-nonce echo mismatch",
            ));
        }
        Ok(StepOutcome::Completed(done2))
    }

    /// Runs the whole sub-protocol positively.
    ///
    /// # Errors
    ///
    /// The first step failure, unchanged.
    pub fn onboard(&mut self) -> Result<OnboardingReport, RequestorError> {
        self.hello_device_60(TestId::Null)?.completed()?;
        self.fetch_and_verify_entries()?;
        let setup = self.prove_device_64(TestId::Null)?.completed()?;
        self.device_service_info_ready_66(TestId::Null)?
            .completed()?;
        let owner_pages = self.service_info_exchange()?;
        self.done_70(TestId::Null)?.completed()?;
        Ok(OnboardingReport { setup, owner_pages })
    }
}
