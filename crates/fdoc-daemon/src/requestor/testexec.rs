//! Batch test executor: runs a scripted list of requestor-side tests per
//! protocol step against an owner service, reporting every observation
//! into the request-test ledger.

use tracing::info;
use uuid::Uuid;

use fdoc_core::crypto::cipher::CipherSuite;
use fdoc_core::crypto::kex::KexSuite;
use fdoc_core::testcom::{FdoTestState, TestId, to2_60_request_tests, to2_66_request_tests};
use fdoc_core::voucher::{DeviceCredential, VoucherBuilder};

use crate::store::{OwnerVoucherEntry, OwnerVoucherStore, RequestTestStore, StoreError};

use super::{RequestorError, StepOutcome, To2Requestor, Transport};

/// One requestor-side test run against an owner service under test.
#[derive(Debug, Clone)]
pub struct RequestTestInst {
    /// Ledger identity of this run.
    pub run_id: Uuid,
    /// Key-exchange suite the virtual devices negotiate.
    pub kex_suite: KexSuite,
    /// Cipher suite the virtual devices negotiate.
    pub cipher_suite: CipherSuite,
}

impl RequestTestInst {
    /// Fresh run with the default suites.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kex_suite: KexSuite::X25519,
            cipher_suite: CipherSuite::A128Gcm,
        }
    }
}

impl Default for RequestTestInst {
    fn default() -> Self {
        Self::new()
    }
}

/// Mints a virtual device, provisions its voucher into the owner service,
/// and returns the matching credential.
fn provision_device(
    vouchers: &dyn OwnerVoucherStore,
    owners: usize,
) -> Result<DeviceCredential, String> {
    let built = VoucherBuilder::new("fdoc-virtual-device")
        .owners(owners)
        .build()
        .map_err(|err| format!("failed to mint voucher: {err}"))?;
    let credential = built.credential.clone();
    vouchers
        .set(
            credential.guid,
            OwnerVoucherEntry {
                voucher: built.voucher,
                owner_key_seed: built.owner_key.seed(),
                owner_sims: Vec::new(),
            },
        )
        .map_err(|err| format!("failed to provision voucher: {err}"))?;
    Ok(credential)
}

fn observation<V>(outcome: Result<StepOutcome<V>, RequestorError>) -> FdoTestState {
    match outcome {
        Ok(StepOutcome::Observed(state)) => state,
        Ok(StepOutcome::Completed(_)) => FdoTestState::passed(),
        Err(err) => FdoTestState::failed(err.to_string()),
    }
}

/// Runs the TO2 hello-step test list, one freshly provisioned voucher per
/// test.
///
/// # Errors
///
/// [`StoreError`] when an observation cannot be written to the ledger.
pub fn execute_to2_60_vouchers<T: Transport>(
    inst: &RequestTestInst,
    transport: &T,
    vouchers: &dyn OwnerVoucherStore,
    reports: &dyn RequestTestStore,
) -> Result<(), StoreError> {
    for test_id in to2_60_request_tests() {
        let credential = match provision_device(vouchers, 2) {
            Ok(credential) => credential,
            Err(reason) => {
                reports.report_test(inst.run_id, test_id, FdoTestState::failed(reason))?;
                continue;
            }
        };
        let mut requestor =
            To2Requestor::new(transport, credential, inst.kex_suite, inst.cipher_suite);
        let state = observation(requestor.hello_device_60(test_id));
        reports.report_test(inst.run_id, test_id, state)?;
    }
    info!(run = %inst.run_id, "TO2 hello test batch complete");
    Ok(())
}

/// Runs the TO2 service-info-readiness test list. Each test re-runs the
/// handshake up to the device proof before probing step 66.
///
/// # Errors
///
/// [`StoreError`] when an observation cannot be written to the ledger.
pub fn execute_to2_66<T: Transport>(
    inst: &RequestTestInst,
    transport: &T,
    vouchers: &dyn OwnerVoucherStore,
    reports: &dyn RequestTestStore,
) -> Result<(), StoreError> {
    for test_id in to2_66_request_tests() {
        let state = match pre_execute_to2_66(inst, transport, vouchers) {
            Ok(mut requestor) => observation(requestor.device_service_info_ready_66(test_id)),
            Err(reason) => FdoTestState::failed(format!("pre-setup failed: {reason}")),
        };
        reports.report_test(inst.run_id, test_id, state)?;
    }
    info!(run = %inst.run_id, "TO2 readiness test batch complete");
    Ok(())
}

/// Drives a fresh device through the handshake up to the device proof so
/// a later step can be probed in isolation.
fn pre_execute_to2_66<'t, T: Transport>(
    inst: &RequestTestInst,
    transport: &'t T,
    vouchers: &dyn OwnerVoucherStore,
) -> Result<To2Requestor<&'t T>, String> {
    let credential = provision_device(vouchers, 1)?;
    let mut requestor = To2Requestor::new(transport, credential, inst.kex_suite, inst.cipher_suite);
    requestor
        .hello_device_60(TestId::Null)
        .and_then(StepOutcome::completed)
        .map_err(|err| err.to_string())?;
    requestor
        .fetch_and_verify_entries()
        .map_err(|err| err.to_string())?;
    requestor
        .prove_device_64(TestId::Null)
        .and_then(StepOutcome::completed)
        .map_err(|err| err.to_string())?;
    Ok(requestor)
}
