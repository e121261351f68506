//! Rendezvous-role listener: TO0 owner registration and TO1 device
//! redirection.

use std::sync::Arc;

use tracing::{debug, info};

use fdoc_core::codec;
use fdoc_core::crypto::cose::{CoseSignature, EatPayload};
use fdoc_core::messages::to0::{AcceptOwner23, Hello20, HelloAck21, OwnerSign22, To0d, To1dPayload};
use fdoc_core::messages::to1::{HelloRv30, HelloRvAck31};
use fdoc_core::messages::{MsgType, Protocol};
use fdoc_core::testcom::{Fault, fuzz_cbor_bytes, fuzz_cose_signature, fuzz_nonce};
use fdoc_core::types::Nonce16;

use crate::config::ListenerConfig;
use crate::error::FdoError;
use crate::exchange::{ExchangeRequest, ExchangeResponse};
use crate::session::{SessionEntry, SessionToken};
use crate::store::{ListenerTestStore, OwnerSignEntry, OwnerSignStore, SessionStore};

use super::{OracleCtx, oracle_post_step, oracle_pre_step, respond_error, respond_unsupported};

/// Rendezvous service listener.
///
/// Owns the TO0 and TO1 step handlers plus their oracle glue. Stores are
/// shared handles so many requests can be served concurrently; each
/// request applies its session read-modify-write as a single unit.
pub struct RvListener {
    config: ListenerConfig,
    sessions: Arc<dyn SessionStore>,
    ownersign: Arc<dyn OwnerSignStore>,
    tests: Arc<dyn ListenerTestStore>,
}

impl RvListener {
    /// Assembles a listener over its stores.
    #[must_use]
    pub fn new(
        config: ListenerConfig,
        sessions: Arc<dyn SessionStore>,
        ownersign: Arc<dyn OwnerSignStore>,
        tests: Arc<dyn ListenerTestStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            ownersign,
            tests,
        }
    }

    /// Routes one inbound step by its declared message type.
    #[must_use]
    pub fn dispatch(&self, req: &ExchangeRequest) -> ExchangeResponse {
        match req.msg_type {
            MsgType::To0Hello => self.hello_20(req),
            MsgType::To0OwnerSign => self.owner_sign_22(req),
            MsgType::To1HelloRv => self.hello_rv_30(req),
            MsgType::To1ProveToRv => self.prove_to_rv_32(req),
            other => respond_unsupported(other, "rendezvous"),
        }
    }

    /// Resolves the bearer session for a non-opening step.
    fn resolve_session(
        &self,
        req: &ExchangeRequest,
        protocol: Protocol,
    ) -> Result<(SessionToken, SessionEntry), FdoError> {
        let token = req.bearer().ok_or_else(|| FdoError::Auth {
            reason: "missing bearer token".to_string(),
        })?;
        let token = SessionToken::from_presented(token);
        let session = self.sessions.get(&token)?.ok_or_else(|| FdoError::Auth {
            reason: "unknown or expired session".to_string(),
        })?;
        if session.protocol != protocol {
            return Err(FdoError::Auth {
                reason: format!("session belongs to {}", session.protocol),
            });
        }
        Ok((token, session))
    }

    // ------------------------------------------------------------------
    // TO0
    // ------------------------------------------------------------------

    fn hello_20(&self, req: &ExchangeRequest) -> ExchangeResponse {
        let mut oracle = OracleCtx::inactive();
        match self.try_hello_20(req) {
            Ok(resp) => resp,
            Err(err) => {
                respond_error(self.tests.as_ref(), &mut oracle, MsgType::To0Hello, &err)
            }
        }
    }

    /// TO0 Hello: issue the registration nonce and a fresh session.
    ///
    /// The owner has not named a device yet, so no test run can apply.
    fn try_hello_20(&self, req: &ExchangeRequest) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO0 Hello20");
        let _hello: Hello20 = codec::from_slice(&req.body)?;

        let nonce_to0_sign = Nonce16::random();
        let mut session = SessionEntry::new(Protocol::To0);
        session.nonce_to0_sign = Some(nonce_to0_sign);
        session.prev_cmd = Some(MsgType::To0HelloAck);
        let token = self.sessions.insert(session)?;

        let ack = HelloAck21 { nonce_to0_sign };
        let body = codec::to_vec(&ack)?;
        Ok(ExchangeResponse::ok(
            MsgType::To0HelloAck,
            Some(ExchangeResponse::bearer_header(token.as_str())),
            body,
        ))
    }

    fn owner_sign_22(&self, req: &ExchangeRequest) -> ExchangeResponse {
        let mut oracle = OracleCtx::inactive();
        match self.try_owner_sign_22(req, &mut oracle) {
            Ok(resp) => resp,
            Err(err) => {
                respond_error(self.tests.as_ref(), &mut oracle, MsgType::To0OwnerSign, &err)
            }
        }
    }

    /// TO0 OwnerSign: verify the voucher chain and the owner's redirect
    /// signature, then store the registration for TO1 to serve.
    fn try_owner_sign_22(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO0 OwnerSign22");
        let current = MsgType::To0OwnerSign;
        let (token, session) = self.resolve_session(req, Protocol::To0)?;

        let msg: OwnerSign22 = codec::from_slice(&req.body)?;
        let to0d: To0d = codec::from_slice(&msg.to0d)?;
        let header = to0d.voucher.header()?;

        *oracle = oracle_pre_step(self.tests.as_ref(), header.guid, Protocol::To0, current)?;

        if !session.prev_cmd_is(&[MsgType::To0HelloAck]) {
            return Err(FdoError::Sequence {
                reason: format!(
                    "expected previous step {}, got {:?}",
                    MsgType::To0HelloAck,
                    session.prev_cmd
                ),
            });
        }

        let issued = session.nonce_to0_sign.ok_or_else(|| FdoError::Internal {
            reason: "TO0 session missing its nonce".to_string(),
        })?;
        if !to0d.nonce_to0_sign.ct_eq(&issued) {
            return Err(FdoError::Auth {
                reason: "registration nonce mismatch".to_string(),
            });
        }

        // The chain of custody must end in the key that signed to1d, and
        // to1d must pin these exact to0d bytes.
        let owner_key = to0d.voucher.verify_entries()?;
        msg.to1d
            .verify(&owner_key)
            .map_err(|err| FdoError::Verification {
                reason: format!("redirect signature rejected: {err}"),
            })?;
        let to1d_payload: To1dPayload = msg.to1d.decode_payload()?;
        if !to1d_payload.matches_to0d(&msg.to0d) {
            return Err(FdoError::Verification {
                reason: "redirect does not pin the registered to0d".to_string(),
            });
        }

        let wait_seconds = to0d.wait_seconds.min(self.config.to0_wait_seconds);
        self.ownersign.set(
            header.guid,
            OwnerSignEntry {
                to0d: msg.to0d.clone(),
                to1d: msg.to1d.clone(),
            },
        )?;

        let mut updated = session;
        updated.guid = Some(header.guid);
        updated.prev_cmd = Some(MsgType::To0AcceptOwner);
        self.sessions.update(&token, updated)?;

        let mut body = codec::to_vec(&AcceptOwner23 { wait_seconds })?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        oracle_post_step(self.tests.as_ref(), oracle, current, None)?;
        info!(guid = %header.guid, wait_seconds, "owner redirect registered");
        Ok(ExchangeResponse::ok(
            MsgType::To0AcceptOwner,
            req.authorization.clone(),
            body,
        ))
    }

    // ------------------------------------------------------------------
    // TO1
    // ------------------------------------------------------------------

    fn hello_rv_30(&self, req: &ExchangeRequest) -> ExchangeResponse {
        let mut oracle = OracleCtx::inactive();
        match self.try_hello_rv_30(req, &mut oracle) {
            Ok(resp) => resp,
            Err(err) => {
                respond_error(self.tests.as_ref(), &mut oracle, MsgType::To1HelloRv, &err)
            }
        }
    }

    /// TO1 HelloRv: issue the proof nonce and a fresh session for a
    /// device with a registration on file.
    fn try_hello_rv_30(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO1 HelloRv30");
        let current = MsgType::To1HelloRv;
        let hello: HelloRv30 = codec::from_slice(&req.body)?;

        *oracle = oracle_pre_step(self.tests.as_ref(), hello.guid, Protocol::To1, current)?;

        if self.ownersign.get(&hello.guid)?.is_none() {
            return Err(FdoError::Resource {
                what: format!("no owner registration for device {}", hello.guid),
            });
        }

        let nonce_to1_proof = Nonce16::random();
        let mut session = SessionEntry::new(Protocol::To1);
        session.guid = Some(hello.guid);
        session.nonce_to1_proof = Some(nonce_to1_proof);
        session.prev_cmd = Some(MsgType::To1HelloRvAck);
        let token = self.sessions.insert(session)?;

        let sent_nonce = match oracle.active().fault_for(current) {
            Some(Fault::WrongNonce) => fuzz_nonce(&nonce_to1_proof),
            _ => nonce_to1_proof,
        };
        let ack = HelloRvAck31 {
            nonce_to1_proof: sent_nonce,
            eb_sig_info: hello.ea_sig_info,
        };
        let mut body = codec::to_vec(&ack)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        oracle_post_step(
            self.tests.as_ref(),
            oracle,
            current,
            Some(MsgType::To1ProveToRv),
        )?;
        Ok(ExchangeResponse::ok(
            MsgType::To1HelloRvAck,
            Some(ExchangeResponse::bearer_header(token.as_str())),
            body,
        ))
    }

    fn prove_to_rv_32(&self, req: &ExchangeRequest) -> ExchangeResponse {
        let mut oracle = OracleCtx::inactive();
        match self.try_prove_to_rv_32(req, &mut oracle) {
            Ok(resp) => resp,
            Err(err) => {
                respond_error(self.tests.as_ref(), &mut oracle, MsgType::To1ProveToRv, &err)
            }
        }
    }

    /// TO1 ProveToRv: verify the device's signed nonce against the
    /// registered voucher's certificate chain, then serve the owner
    /// redirect.
    fn try_prove_to_rv_32(
        &self,
        req: &ExchangeRequest,
        oracle: &mut OracleCtx,
    ) -> Result<ExchangeResponse, FdoError> {
        debug!("receiving TO1 ProveToRv32");
        let current = MsgType::To1ProveToRv;
        let (token, session) = self.resolve_session(req, Protocol::To1)?;
        let guid = session.guid.ok_or_else(|| FdoError::Internal {
            reason: "TO1 session missing its device identifier".to_string(),
        })?;

        *oracle = oracle_pre_step(self.tests.as_ref(), guid, Protocol::To1, current)?;

        if !session.prev_cmd_is(&[MsgType::To1HelloRvAck]) {
            return Err(FdoError::Sequence {
                reason: format!(
                    "expected previous step {}, got {:?}",
                    MsgType::To1HelloRvAck,
                    session.prev_cmd
                ),
            });
        }

        let proof: CoseSignature = codec::from_slice(&req.body)?;
        let payload: EatPayload = proof.decode_payload()?;

        let issued = session.nonce_to1_proof.ok_or_else(|| FdoError::Internal {
            reason: "TO1 session missing its nonce".to_string(),
        })?;
        if !payload.nonce.ct_eq(&issued) {
            return Err(FdoError::Auth {
                reason: format!(
                    "proof nonce mismatch: expected {issued}, got {}",
                    payload.nonce
                ),
            });
        }
        if payload.guid != guid {
            return Err(FdoError::Auth {
                reason: "proof names a different device".to_string(),
            });
        }

        let entry = self
            .ownersign
            .get(&guid)?
            .ok_or_else(|| FdoError::Resource {
                what: format!("no owner registration for device {guid}"),
            })?;
        let to0d: To0d = codec::from_slice(&entry.to0d)?;
        proof
            .verify_with_cert_chain(&to0d.voucher.dev_cert_chain)
            .map_err(|err| FdoError::Auth {
                reason: format!("device proof rejected: {err}"),
            })?;

        let mut updated = session;
        updated.prev_cmd = Some(MsgType::To1RvRedirect);
        self.sessions.update(&token, updated)?;

        let to1d = match oracle.active().fault_for(current) {
            Some(Fault::BadSignature) => fuzz_cose_signature(&entry.to1d),
            _ => entry.to1d.clone(),
        };
        let mut body = codec::to_vec(&to1d)?;
        if oracle.active().fault_for(current) == Some(Fault::BadEncoding) {
            body = fuzz_cbor_bytes(&body);
        }

        oracle_post_step(self.tests.as_ref(), oracle, current, None)?;
        info!(%guid, "redirect served");
        Ok(ExchangeResponse::ok(
            MsgType::To1RvRedirect,
            req.authorization.clone(),
            body,
        ))
    }
}
