//! Storage interfaces for the listeners and the test executor.
//!
//! Storage engines are external; the listeners speak only these traits.
//! Contracts the implementations must keep:
//!
//! - session entries are TTL-bounded and keyed `"session-" + token`; an
//!   expired entry behaves exactly like an absent one
//! - owner-sign and voucher entries are written once and read-only during
//!   protocol execution
//! - test-run entries are durable and never deleted automatically, only
//!   bulk-purged by an explicit administrative action
//!
//! The [`memory`] implementations back tests and small embeddings.

pub mod memory;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use fdoc_core::crypto::cose::CoseSignature;
use fdoc_core::testcom::{FdoTestState, ListenerTestState, TestId};
use fdoc_core::types::{Guid, ServiceInfoKv};
use fdoc_core::{OwnershipVoucher, Protocol};

use crate::session::{SessionEntry, SessionToken};

/// Backend failure surfaced by any store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not serve the operation.
    #[error("storage backend failure: {reason}")]
    Backend {
        /// Backend-specific detail.
        reason: String,
    },
}

impl StoreError {
    /// Wraps a backend-specific failure description.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Per-device protocol session storage.
///
/// Mutated only by the single request currently holding the token; each
/// write replaces the whole entry.
pub trait SessionStore: Send + Sync {
    /// Persists a fresh entry and returns its unguessable token.
    fn insert(&self, entry: SessionEntry) -> Result<SessionToken, StoreError>;

    /// Reads an entry. `None` for unknown or expired tokens.
    fn get(&self, token: &SessionToken) -> Result<Option<SessionEntry>, StoreError>;

    /// Replaces an entry wholesale.
    fn update(&self, token: &SessionToken, entry: SessionEntry) -> Result<(), StoreError>;

    /// Drops an entry, for sessions superseded by handshake completion.
    fn delete(&self, token: &SessionToken) -> Result<(), StoreError>;
}

/// Owner redirect registration stored by TO0 and served by TO1.
#[derive(Debug, Clone)]
pub struct OwnerSignEntry {
    /// Encoded `To0d`, byte-exact as registered.
    pub to0d: Bytes,
    /// Owner's redirect signature.
    pub to1d: CoseSignature,
}

/// Rendezvous-side registration storage, keyed by device identifier.
pub trait OwnerSignStore: Send + Sync {
    /// Registers (or re-registers) the owner redirect for a device.
    fn set(&self, guid: Guid, entry: OwnerSignEntry) -> Result<(), StoreError>;

    /// Reads a registration. `None` when the device has none on file.
    fn get(&self, guid: &Guid) -> Result<Option<OwnerSignEntry>, StoreError>;
}

/// Voucher and serving material the owner service holds per device.
#[derive(Clone)]
pub struct OwnerVoucherEntry {
    /// The ownership voucher, read-only during protocol execution.
    pub voucher: OwnershipVoucher,
    /// Seed of the owner's signing key (the voucher's terminal key).
    pub owner_key_seed: [u8; 32],
    /// Service-info pages to serve during the TO2 exchange, in order.
    pub owner_sims: Vec<ServiceInfoKv>,
}

impl std::fmt::Debug for OwnerVoucherEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerVoucherEntry")
            .field("voucher", &self.voucher)
            .field("owner_sims", &self.owner_sims.len())
            .finish_non_exhaustive()
    }
}

/// Owner-side voucher storage, keyed by device identifier.
pub trait OwnerVoucherStore: Send + Sync {
    /// Provisions a device for onboarding.
    fn set(&self, guid: Guid, entry: OwnerVoucherEntry) -> Result<(), StoreError>;

    /// Reads a device's voucher entry.
    fn get(&self, guid: &Guid) -> Result<Option<OwnerVoucherEntry>, StoreError>;
}

/// Durable listener test-run storage, keyed by device and sub-protocol.
pub trait ListenerTestStore: Send + Sync {
    /// Reads the run for a device under one sub-protocol.
    fn get(&self, guid: &Guid, protocol: Protocol)
    -> Result<Option<ListenerTestState>, StoreError>;

    /// Creates or replaces a run.
    fn upsert(&self, state: ListenerTestState) -> Result<(), StoreError>;

    /// Administrative bulk purge of every run.
    fn purge_all(&self) -> Result<(), StoreError>;
}

/// Requestor-side test report ledger.
pub trait RequestTestStore: Send + Sync {
    /// Appends one observation to a test run's report.
    fn report_test(
        &self,
        run_id: Uuid,
        test_id: TestId,
        state: FdoTestState,
    ) -> Result<(), StoreError>;
}
