//! Protocol step listeners and the conformance-oracle glue they share.
//!
//! [`RvListener`] serves the rendezvous role (TO0 registration, TO1
//! redirection); [`OwnerListener`] serves the owner role (TO2 transfer).
//! Every handler follows one shape: resolve the session, run the oracle
//! pre-step, gate on the previous-step marker, decode, compute, persist
//! the new session value, inject the active fault into the outbound bytes
//! only, run the oracle post-step, respond. Every error is recovered into
//! exactly one response and at most one recorded test outcome.

mod owner;
mod rv;

pub use owner::OwnerListener;
pub use rv::RvListener;

use tracing::{debug, warn};

use fdoc_core::codec;
use fdoc_core::messages::{ErrorMessage, MsgType, Protocol};
use fdoc_core::testcom::{ListenerTestState, TestId};
use fdoc_core::types::Guid;

use crate::error::FdoError;
use crate::exchange::{ExchangeResponse, Status};
use crate::store::ListenerTestStore;

/// Oracle state threaded through one request.
///
/// Holds the loaded run (when one exists for the device), the test
/// selected for this step, and whether an outcome for this step was
/// already recorded, so the error path never records twice.
pub(crate) struct OracleCtx {
    run: Option<ListenerTestState>,
    active: TestId,
    recorded: bool,
}

impl OracleCtx {
    /// No run on file: the oracle is a pass-through.
    pub(crate) fn inactive() -> Self {
        Self {
            run: None,
            active: TestId::Null,
            recorded: false,
        }
    }

    /// The test selected for this step.
    pub(crate) fn active(&self) -> TestId {
        self.active
    }
}

/// Oracle pre-step: validate the observed message type against the run's
/// expectation, credit a surviving fault test, and select this step's
/// test.
///
/// Devices without a seeded run pass through untested. A run whose
/// testing for `current` is already complete is also a pass-through: no
/// recording, no selection, no store write.
pub(crate) fn oracle_pre_step(
    store: &dyn ListenerTestStore,
    guid: Guid,
    protocol: Protocol,
    current: MsgType,
) -> Result<OracleCtx, FdoError> {
    let Some(mut run) = store.get(&guid, protocol)? else {
        debug!(%guid, %protocol, "no test run on file, passing through");
        return Ok(OracleCtx::inactive());
    };

    let mut active = TestId::Null;
    let mut recorded = false;
    if !run.check_cmd_testing_completed(current) {
        if !run.check_expected_cmd(current) && run.last_test_id() != TestId::Positive {
            run.push_fail(format!(
                "expected {protocol} message type {}, got {}",
                run.expected_cmd(),
                current
            ));
            recorded = true;
        } else if run.has_pending_outcome() {
            // The previously injected fault was survived: the peer came
            // back with the right message.
            run.push_success();
        }

        active = run.get_next_test_id();
        store.upsert(run.clone())?;
    }

    Ok(OracleCtx {
        run: Some(run),
        active,
        recorded,
    })
}

/// Oracle post-step for a fully successful step under the positive
/// baseline: record the pass and advance the expectation to `next`, or
/// finish the run at a terminal step.
pub(crate) fn oracle_post_step(
    store: &dyn ListenerTestStore,
    ctx: &mut OracleCtx,
    current: MsgType,
    next: Option<MsgType>,
) -> Result<(), FdoError> {
    if ctx.active != TestId::Positive {
        return Ok(());
    }
    let Some(run) = ctx.run.as_mut() else {
        return Ok(());
    };
    if run.check_expected_cmd(current) {
        run.push_success();
        ctx.recorded = true;
        match next {
            Some(next) => run.complete_cmd_and_set_next(next),
            None => run.complete_run(),
        }
        store.upsert(run.clone())?;
    }
    Ok(())
}

/// Recovers an error into its wire response, recording it as a test
/// observation when a test is active for this step and nothing was
/// recorded yet.
pub(crate) fn respond_error(
    store: &dyn ListenerTestStore,
    ctx: &mut OracleCtx,
    current: MsgType,
    err: &FdoError,
) -> ExchangeResponse {
    warn!(%current, error = %err, "step rejected");

    if let Some(run) = ctx.run.as_mut() {
        if ctx.active != TestId::Null && !ctx.recorded {
            run.push_fail(err.to_string());
            ctx.recorded = true;
            if let Err(store_err) = store.upsert(run.clone()) {
                warn!(error = %store_err, "failed to persist test outcome");
            }
        }
    }

    let error_msg = ErrorMessage::new(err.error_code(), current, err.wire_message());
    // The error object is always encodable; an empty body would only ever
    // follow an allocation failure.
    let body = codec::to_vec(&error_msg).unwrap_or_default();
    ExchangeResponse {
        status: err.status(),
        msg_type: MsgType::Error,
        authorization: None,
        body: body.into(),
    }
}

/// Response for a message type a listener does not serve.
pub(crate) fn respond_unsupported(msg_type: MsgType, role: &str) -> ExchangeResponse {
    warn!(%msg_type, role, "unsupported message type");
    let error_msg = ErrorMessage::new(
        fdoc_core::ErrorCode::InvalidMessage,
        msg_type,
        format!("message type {msg_type} is not a {role} request"),
    );
    let body = codec::to_vec(&error_msg).unwrap_or_default();
    ExchangeResponse {
        status: Status::BadRequest,
        msg_type: MsgType::Error,
        authorization: None,
        body: body.into(),
    }
}
