//! Owner-role listener: the TO2 ownership-transfer sub-protocol.

use std::sync::Arc;

use tracing::{debug, info};

use fdoc_core::codec;
use fdoc_core::crypto::cipher::{self, EncryptedEnvelope};
use fdoc_core::crypto::cose::{CoseSignature, UnprotectedHeader};
use fdoc_core::crypto::keys::KeyPair;
use fdoc_core::crypto::kex::KexState;
use fdoc_core::messages::to2::{
    DeviceServiceInfo68, DeviceServiceInfoReady66, Done70, Done271, GetOvNextEntry62,
    HelloDevice60, OvNextEntry63, OwnerServiceInfo69, OwnerServiceInfoReady67, ProveDevicePayload,
    ProveOvHdrPayload, SetupDevicePayload,
};
use fdoc_core::messages::{MsgType, Protocol};
use fdoc_core::testcom::{Fault, fuzz_cbor_bytes, fuzz_cose_signature, fuzz_nonce};
use fdoc_core::types::Nonce16;

use crate::config::ListenerConfig;
use crate::error::FdoError;
use crate::exchange::{ExchangeRequest, ExchangeResponse};
use crate::session::{SessionEntry, SessionToken};
use crate::store::{ListenerTestStore, OwnerVoucherEntry, OwnerVoucherStore, SessionStore};

use super::{OracleCtx, oracle_post_step, oracle_pre_step, respond_error, respond_unsupported};

/// Owner onboarding service listener.
pub struct OwnerListener {
    config: ListenerConfig,
    sessions: Arc<dyn SessionStore>,
    vouchers: Arc<dyn OwnerVoucherStore>,
    tests: Arc<dyn ListenerTestStore>,
}

impl OwnerListener {
    /// Assembles a listener over its stores.
    #[must_use]
    pub fn new(
        config: ListenerConfig,
        sessions: Arc<dyn SessionStore>,
        vouchers: Arc<dyn OwnerVoucherStore>,
        tests: Arc<dyn ListenerTestStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            vouchers,
            tests,
        }
    }

    /// Routes one inbound step by its declared message type.
    #[must_use]
    pub fn dispatch(&self, req: &ExchangeRequest) -> ExchangeResponse {
        match req.msg_type {
            MsgType::To2HelloDevice => self.step(req, MsgType::To2HelloDevice, Self::try_hello_device_60),
            MsgType::To2GetOvNextEntry => {
                self.step(req, MsgType::To2GetOvNextEntry, Self::try_get_ov_next_entry_62)
            }
            MsgType::To2ProveDevice => self.step(req, MsgType::To2ProveDevice, Self::try_prove_device_64),
            MsgType::To2DeviceServiceInfoReady => self.step(
                req,
                MsgType::To2DeviceServiceInfoReady,
                Self::try_service_info_ready_66,
            ),
            MsgType::To2DeviceServiceInfo => {
                self.step(req, MsgType::To2DeviceServiceInfo, Self::try_device_service_info_68)
            }
            MsgType::To2Done => self.step(req, MsgType::To2Done, Self::try_done_70),
            other => respond_unsupported(other, "owner"),
        }
    }

    /// Runs one handler, recovering any error into its wire response.
    fn step(
        &self,
        req: &ExchangeRequest,
        current: MsgType,
        handler: fn(&Self, &ExchangeRequest, &mut OracleCtx) -> Result<ExchangeResponse, FdoError>,
    ) -> ExchangeResponse {
        let mut oracle = OracleCtx::inactive();
        match handler(self, req, &mut oracle) {
            Ok(resp) => resp,
            Err(err) => respond_error(self.tests.as_ref(), &mut oracle, current, &err),
        }
    }

    /// Resolves the bearer session for a non-opening step.
    fn resolve_session(
        &self,
        req: &ExchangeRequest,
    ) -> Result<(SessionToken, SessionEntry), FdoError> {
        let token = req.bearer().ok_or_else(|| FdoError::Auth {
            reason: "missing bearer token".to_string(),
        })?;
        let token = SessionToken::from_presented(token);
        let session = self.sessions.get(&token)?.ok_or_else(|| FdoError::Auth {
            reason: "unknown or expired session".to_string(),
        })?;
        if session.protocol != Protocol::To2 {
            return Err(FdoError::Auth {
                reason: format!("session belongs to {}", session.protocol),
            });
        }
        Ok((token, session))
    }

    fn session_guid(session: &SessionEntry) -> Result<fdoc_core::Guid, FdoError> {
        session.guid.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its device identifier".to_string(),
        })
    }

    fn voucher_entry(&self, guid: &fdoc_core::Guid) -> Result<OwnerVoucherEntry, FdoError> {
        self.vouchers.get(guid)?.ok_or_else(|| FdoError::Resource {
            what: format!("no voucher for device {guid}"),
        })
    }

    fn sequence_error(expected: &str, session: &SessionEntry) -> FdoError {
        FdoError::Sequence {
            reason: format!("expected previous step {expected}, got {:?}", session.prev_cmd),
        }
    }

    /// Unwraps an encrypted request body under the session's key and
    /// suite. Fails closed on any mismatch.
    fn decrypt_body(session: &SessionEntry, body: &[u8]) -> Result<Vec<u8>, FdoError> {
        let key = session.session_key.as_deref().ok_or_else(|| FdoError::Auth {
            reason: "session has no derived key yet".to_string(),
        })?;
        let suite = session.cipher_suite.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its cipher suite".to_string(),
        })?;
        let envelope: EncryptedEnvelope = codec::from_slice(body)?;
        cipher::decrypt(&envelope, key, suite).map_err(|err| FdoError::Auth {
            reason: format!("request decryption failed: {err}"),
        })
    }

    /// Wraps a response plaintext under the session's key and suite.
    fn encrypt_body(session: &SessionEntry, plaintext: &[u8]) -> Result<Vec<u8>, FdoError> {
        let key = session.session_key.as_deref().ok_or_else(|| FdoError::Internal {
            reason: "encrypting before key derivation".to_string(),
        })?;
        let suite = session.cipher_suite.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its cipher suite".to_string(),
        })?;
        let envelope = cipher::encrypt(plaintext, key, suite).map_err(|err| FdoError::Internal {
            reason: format!("response encryption failed: {err}"),
        })?;
        Ok(codec::to_vec(&envelope)?)
    }

    /// TO2 HelloDevice: prove the ownership-voucher header and open the
    /// key exchange.
    fn try_hello_device_60(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO2 HelloDevice60");
        let current = MsgType::To2HelloDevice;
        let hello: HelloDevice60 = codec::from_slice(&req.body)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), hello.guid, Protocol::To2, current)?;

        let entry = self.voucher_entry(&hello.guid)?;
        let owner_key = KeyPair::from_seed(&entry.owner_key_seed);
        let kex = KexState::generate();
        let nonce_prove_dv = Nonce16::random();

        let echoed_nonce = match oracle.active().fault_for(current) {
            Some(Fault::WrongNonce) => fuzz_nonce(&hello.nonce_prove_ov),
            _ => hello.nonce_prove_ov,
        };
        let payload = ProveOvHdrPayload {
            header: entry.voucher.header.clone(),
            num_entries: entry.voucher.num_entries(),
            hmac: entry.voucher.header_hmac,
            nonce_prove_ov: echoed_nonce,
            eb_sig_info: hello.ea_sig_info.clone(),
            xa: kex.public_bytes(),
        };
        let mut envelope = CoseSignature::sign(codec::to_vec(&payload)?, &owner_key)?
            .with_unprotected(UnprotectedHeader {
                nonce: Some(nonce_prove_dv),
                owner_pub_key: Some(owner_key.public()),
            });
        if oracle.active().fault_for(current) == Some(Fault::BadSignature) {
            envelope = fuzz_cose_signature(&envelope);
        }
        let mut body = codec::to_vec(&envelope)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        let mut session = SessionEntry::new(Protocol::To2);
        session.guid = Some(hello.guid);
        session.nonce_prove_ov = Some(hello.nonce_prove_ov);
        session.nonce_prove_dv = Some(nonce_prove_dv);
        session.kex_suite = Some(hello.kex_suite);
        session.cipher_suite = Some(hello.cipher_suite);
        session.kex_secret = Some(kex.secret_bytes());
        session.num_entries = entry.voucher.num_entries();
        session.owner_sims = entry.owner_sims.clone();
        session.prev_cmd = Some(MsgType::To2ProveOvHdr);
        let token = self.sessions.insert(session)?;

        let next = if entry.voucher.num_entries() > 0 {
            MsgType::To2GetOvNextEntry
        } else {
            MsgType::To2ProveDevice
        };
        oracle_post_step(self.tests.as_ref(), oracle, current, Some(next))?;
        info!(guid = %hello.guid, entries = entry.voucher.num_entries(), "transfer opened");
        Ok(ExchangeResponse::ok(
            MsgType::To2ProveOvHdr,
            Some(ExchangeResponse::bearer_header(token.as_str())),
            body,
        ))
    }

    /// TO2 GetOvNextEntry: serve voucher entries by strictly increasing
    /// index. An index that is not the session's exact next expected one,
    /// including a replay of an already-served index, is rejected and the
    /// cursor never double-advances.
    fn try_get_ov_next_entry_62(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO2 GetOvNextEntry62");
        let current = MsgType::To2GetOvNextEntry;
        let (token, session) = self.resolve_session(req)?;
        let guid = Self::session_guid(&session)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), guid, Protocol::To2, current)?;

        if !session.prev_cmd_is(&[MsgType::To2ProveOvHdr, MsgType::To2OvNextEntry]) {
            return Err(Self::sequence_error("ProveOvHdr61 or OvNextEntry63", &session));
        }

        let msg: GetOvNextEntry62 = codec::from_slice(&req.body)?;
        if msg.entry_num != session.entry_cursor {
            return Err(FdoError::Sequence {
                reason: format!(
                    "entry index {} out of sequence, expected {}",
                    msg.entry_num, session.entry_cursor
                ),
            });
        }

        let entry = self.voucher_entry(&guid)?;
        let ov_entry = entry.voucher.entry(msg.entry_num)?.clone();

        let mut updated = session;
        updated.entry_cursor += 1;
        updated.prev_cmd = Some(MsgType::To2OvNextEntry);
        self.sessions.update(&token, updated)?;

        let response = OvNextEntry63 {
            entry_num: msg.entry_num,
            entry: ov_entry,
        };
        let mut body = codec::to_vec(&response)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        // The iterative step is graded once; later iterations pass
        // through.
        oracle_post_step(
            self.tests.as_ref(),
            oracle,
            current,
            Some(MsgType::To2ProveDevice),
        )?;
        Ok(ExchangeResponse::ok(
            MsgType::To2OvNextEntry,
            req.authorization.clone(),
            body,
        ))
    }

    /// TO2 ProveDevice: verify the device's proof-of-possession against
    /// the voucher's certificate chain and derive the session key.
    fn try_prove_device_64(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO2 ProveDevice64");
        let current = MsgType::To2ProveDevice;
        let (token, session) = self.resolve_session(req)?;
        let guid = Self::session_guid(&session)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), guid, Protocol::To2, current)?;

        let entries_served = session.entry_cursor == session.num_entries;
        let legal_prev = if session.num_entries == 0 {
            session.prev_cmd_is(&[MsgType::To2ProveOvHdr])
        } else {
            session.prev_cmd_is(&[MsgType::To2OvNextEntry])
        };
        if !legal_prev || !entries_served {
            return Err(FdoError::Sequence {
                reason: format!(
                    "device proof before entry chain served ({}/{} entries, prev {:?})",
                    session.entry_cursor, session.num_entries, session.prev_cmd
                ),
            });
        }

        let proof: CoseSignature = codec::from_slice(&req.body)?;
        let entry = self.voucher_entry(&guid)?;
        proof
            .verify_with_cert_chain(&entry.voucher.dev_cert_chain)
            .map_err(|err| FdoError::Auth {
                reason: format!("device proof rejected: {err}"),
            })?;
        let payload: ProveDevicePayload = proof.decode_payload()?;

        let issued = session.nonce_prove_dv.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its device-proof nonce".to_string(),
        })?;
        if !payload.nonce_prove_dv.ct_eq(&issued) {
            return Err(FdoError::Auth {
                reason: format!(
                    "device-proof nonce mismatch: expected {issued}, got {}",
                    payload.nonce_prove_dv
                ),
            });
        }
        if payload.guid != guid {
            return Err(FdoError::Auth {
                reason: "proof names a different device".to_string(),
            });
        }
        let nonce_setup_dv = proof
            .unprotected
            .nonce
            .ok_or_else(|| FdoError::Verification {
                reason: "device proof carries no setup nonce".to_string(),
            })?;

        let kex_secret = session.kex_secret.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its key-exchange secret".to_string(),
        })?;
        let kex_suite = session.kex_suite.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its key-exchange suite".to_string(),
        })?;
        let cipher_suite = session.cipher_suite.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its cipher suite".to_string(),
        })?;
        let nonce_prove_ov = session.nonce_prove_ov.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its header-proof nonce".to_string(),
        })?;
        let session_key = KexState::from_secret_bytes(kex_secret).derive_session_key(
            &payload.xb,
            kex_suite,
            cipher_suite,
            &nonce_prove_ov,
            &issued,
        )?;

        let owner_key = KeyPair::from_seed(&entry.owner_key_seed);
        let echoed_setup = match oracle.active().fault_for(current) {
            Some(Fault::WrongNonce) => fuzz_nonce(&nonce_setup_dv),
            _ => nonce_setup_dv,
        };
        let setup = SetupDevicePayload {
            guid,
            nonce_setup_dv: echoed_setup,
            owner_pub_key: owner_key.public(),
        };
        let mut envelope = CoseSignature::sign(codec::to_vec(&setup)?, &owner_key)?;
        if oracle.active().fault_for(current) == Some(Fault::BadSignature) {
            envelope = fuzz_cose_signature(&envelope);
        }
        let mut plaintext = codec::to_vec(&envelope)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            plaintext = fuzz_cbor_bytes(&plaintext);
        }

        let mut updated = session;
        updated.session_key = Some(session_key.to_vec());
        updated.nonce_setup_dv = Some(nonce_setup_dv);
        updated.prev_cmd = Some(MsgType::To2SetupDevice);
        let body = Self::encrypt_body(&updated, &plaintext)?;
        self.sessions.update(&token, updated)?;

        oracle_post_step(
            self.tests.as_ref(),
            oracle,
            current,
            Some(MsgType::To2DeviceServiceInfoReady),
        )?;
        info!(%guid, "device proven, session key derived");
        Ok(ExchangeResponse::ok(
            MsgType::To2SetupDevice,
            req.authorization.clone(),
            body,
        ))
    }

    /// TO2 DeviceServiceInfoReady: acknowledge readiness and publish the
    /// page-size ceiling for the exchange.
    fn try_service_info_ready_66(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO2 DeviceServiceInfoReady66");
        let current = MsgType::To2DeviceServiceInfoReady;
        let (token, session) = self.resolve_session(req)?;
        let guid = Self::session_guid(&session)?;
        let plaintext = Self::decrypt_body(&session, &req.body)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), guid, Protocol::To2, current)?;

        if !session.prev_cmd_is(&[MsgType::To2SetupDevice]) {
            return Err(Self::sequence_error("SetupDevice65", &session));
        }

        let _ready: DeviceServiceInfoReady66 = codec::from_slice(&plaintext)?;

        let max_size = u16::try_from(self.config.mtu_bytes).unwrap_or(u16::MAX);
        let response = OwnerServiceInfoReady67 {
            max_device_message_size: Some(max_size),
        };
        let mut out = codec::to_vec(&response)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            out = fuzz_cbor_bytes(&out);
        }

        let mut updated = session;
        updated.prev_cmd = Some(MsgType::To2OwnerServiceInfoReady);
        let body = Self::encrypt_body(&updated, &out)?;
        self.sessions.update(&token, updated)?;

        oracle_post_step(
            self.tests.as_ref(),
            oracle,
            current,
            Some(MsgType::To2DeviceServiceInfo),
        )?;
        Ok(ExchangeResponse::ok(
            MsgType::To2OwnerServiceInfoReady,
            req.authorization.clone(),
            body,
        ))
    }

    /// TO2 DeviceServiceInfo: buffer the device's page and, once the
    /// device is finished, serve the owner's pages one per round-trip in
    /// strict enqueue order.
    fn try_device_service_info_68(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO2 DeviceServiceInfo68");
        let current = MsgType::To2DeviceServiceInfo;
        let (token, session) = self.resolve_session(req)?;
        let guid = Self::session_guid(&session)?;
        let plaintext = Self::decrypt_body(&session, &req.body)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), guid, Protocol::To2, current)?;

        if !session.prev_cmd_is(&[
            MsgType::To2OwnerServiceInfoReady,
            MsgType::To2OwnerServiceInfo,
        ]) {
            return Err(Self::sequence_error(
                "OwnerServiceInfoReady67 or OwnerServiceInfo69",
                &session,
            ));
        }

        let msg: DeviceServiceInfo68 = codec::from_slice(&plaintext)?;

        let mut updated = session;
        if let Some(page) = msg.service_info {
            if page.value.len() > self.config.mtu_bytes {
                return Err(FdoError::Verification {
                    reason: format!(
                        "service-info page of {} bytes exceeds the {}-byte ceiling",
                        page.value.len(),
                        self.config.mtu_bytes
                    ),
                });
            }
            if updated.device_sims.len() >= self.config.max_service_info_pages {
                return Err(FdoError::Verification {
                    reason: "device service-info page budget exhausted".to_string(),
                });
            }
            updated.device_sims.push(page);
        }

        let response = if msg.is_more {
            // Device still sending; the owner holds its pages back.
            OwnerServiceInfo69 {
                is_more: false,
                is_done: false,
                service_info: None,
            }
        } else {
            updated.device_sims_done = true;
            if updated.owner_sims_cursor >= updated.owner_sims.len() {
                updated.owner_sims_done = true;
                OwnerServiceInfo69 {
                    is_more: false,
                    is_done: true,
                    service_info: None,
                }
            } else {
                let page = updated.owner_sims[updated.owner_sims_cursor].clone();
                updated.owner_sims_cursor += 1;
                let done = updated.owner_sims_cursor >= updated.owner_sims.len();
                updated.owner_sims_done = done;
                OwnerServiceInfo69 {
                    is_more: !done,
                    is_done: done,
                    service_info: Some(page),
                }
            }
        };
        let finished = response.is_done;

        let mut out = codec::to_vec(&response)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            out = fuzz_cbor_bytes(&out);
        }

        updated.prev_cmd = Some(MsgType::To2OwnerServiceInfo);
        let body = Self::encrypt_body(&updated, &out)?;
        self.sessions.update(&token, updated)?;

        // The paginated step is graded once; later pages pass through.
        oracle_post_step(self.tests.as_ref(), oracle, current, Some(MsgType::To2Done))?;
        if finished {
            debug!(%guid, "service-info exchange complete");
        }
        Ok(ExchangeResponse::ok(
            MsgType::To2OwnerServiceInfo,
            req.authorization.clone(),
            body,
        ))
    }

    /// TO2 Done: confirm both nonces and close the handshake. The session
    /// is superseded and deleted.
    fn try_done_70(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO2 Done70");
        let current = MsgType::To2Done;
        let (token, session) = self.resolve_session(req)?;
        let guid = Self::session_guid(&session)?;
        let plaintext = Self::decrypt_body(&session, &req.body)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), guid, Protocol::To2, current)?;

        if !session.prev_cmd_is(&[MsgType::To2OwnerServiceInfo]) {
            return Err(Self::sequence_error("OwnerServiceInfo69", &session));
        }
        if !session.device_sims_done || !session.owner_sims_done {
            return Err(FdoError::Sequence {
                reason: "service-info exchange not finished".to_string(),
            });
        }

        let done: Done70 = codec::from_slice(&plaintext)?;
        let issued = session.nonce_prove_dv.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its device-proof nonce".to_string(),
        })?;
        if !done.nonce_prove_dv.ct_eq(&issued) {
            return Err(FdoError::Auth {
                reason: "completion nonce mismatch".to_string(),
            });
        }

        let nonce_setup_dv = session.nonce_setup_dv.ok_or_else(|| FdoError::Internal {
            reason: "TO2 session missing its setup nonce".to_string(),
        })?;
        let echoed = match oracle.active().fault_for(current) {
            Some(Fault::WrongNonce) => fuzz_nonce(&nonce_setup_dv),
            _ => nonce_setup_dv,
        };
        let mut out = codec::to_vec(&Done271 {
            nonce_setup_dv: echoed,
        })?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            out = fuzz_cbor_bytes(&out);
        }
        let body = Self::encrypt_body(&session, &out)?;

        // Handshake complete: the session is superseded.
        self.sessions.delete(&token)?;

        oracle_post_step(self.tests.as_ref(), oracle, current, None)?;
        info!(%guid, "ownership transfer complete");
        Ok(ExchangeResponse::ok(
            MsgType::To2Done2,
            req.authorization.clone(),
            body,
        ))
    }
}
