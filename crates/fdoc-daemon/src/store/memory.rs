//! In-memory store implementations.
//!
//! `RwLock<HashMap>` state with the same observable contracts the
//! persistent backends keep: TTL expiry on sessions, durable test runs,
//! write-once voucher entries. Used by the integration tests and by
//! embeddings that do not need persistence.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use uuid::Uuid;

use fdoc_core::testcom::{FdoTestState, ListenerTestState, TestId};
use fdoc_core::types::Guid;
use fdoc_core::Protocol;

use super::{
    ListenerTestStore, OwnerSignEntry, OwnerSignStore, OwnerVoucherEntry, OwnerVoucherStore,
    RequestTestStore, SessionStore, StoreError,
};
use crate::session::{SessionEntry, SessionToken};

const SESSION_KEY_PREFIX: &str = "session-";

struct StoredSession {
    entry: SessionEntry,
    expires_at: Instant,
}

/// TTL-bounded in-memory session store.
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl MemorySessionStore {
    /// Creates a store whose entries expire `ttl` after insertion.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn key(token: &SessionToken) -> String {
        format!("{SESSION_KEY_PREFIX}{token}")
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, entry: SessionEntry) -> Result<SessionToken, StoreError> {
        let token = SessionToken::random();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::backend("session lock poisoned"))?;
        sessions.insert(
            Self::key(&token),
            StoredSession {
                entry,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(token)
    }

    fn get(&self, token: &SessionToken) -> Result<Option<SessionEntry>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::backend("session lock poisoned"))?;
        Ok(sessions
            .get(&Self::key(token))
            .filter(|stored| stored.expires_at > Instant::now())
            .map(|stored| stored.entry.clone()))
    }

    fn update(&self, token: &SessionToken, entry: SessionEntry) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::backend("session lock poisoned"))?;
        match sessions.get_mut(&Self::key(token)) {
            Some(stored) if stored.expires_at > Instant::now() => {
                stored.entry = entry;
                Ok(())
            }
            _ => Err(StoreError::backend("update of unknown or expired session")),
        }
    }

    fn delete(&self, token: &SessionToken) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::backend("session lock poisoned"))?;
        sessions.remove(&Self::key(token));
        Ok(())
    }
}

/// In-memory owner redirect registrations.
#[derive(Default)]
pub struct MemoryOwnerSignStore {
    entries: RwLock<HashMap<Guid, OwnerSignEntry>>,
}

impl MemoryOwnerSignStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnerSignStore for MemoryOwnerSignStore {
    fn set(&self, guid: Guid, entry: OwnerSignEntry) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::backend("ownersign lock poisoned"))?;
        entries.insert(guid, entry);
        Ok(())
    }

    fn get(&self, guid: &Guid) -> Result<Option<OwnerSignEntry>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::backend("ownersign lock poisoned"))?;
        Ok(entries.get(guid).cloned())
    }
}

/// In-memory owner voucher provisioning.
#[derive(Default)]
pub struct MemoryOwnerVoucherStore {
    entries: RwLock<HashMap<Guid, OwnerVoucherEntry>>,
}

impl MemoryOwnerVoucherStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnerVoucherStore for MemoryOwnerVoucherStore {
    fn set(&self, guid: Guid, entry: OwnerVoucherEntry) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::backend("voucher lock poisoned"))?;
        entries.insert(guid, entry);
        Ok(())
    }

    fn get(&self, guid: &Guid) -> Result<Option<OwnerVoucherEntry>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::backend("voucher lock poisoned"))?;
        Ok(entries.get(guid).cloned())
    }
}

/// In-memory listener test runs.
#[derive(Default)]
pub struct MemoryListenerTestStore {
    runs: RwLock<HashMap<(Guid, Protocol), ListenerTestState>>,
}

impl MemoryListenerTestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ListenerTestStore for MemoryListenerTestStore {
    fn get(
        &self,
        guid: &Guid,
        protocol: Protocol,
    ) -> Result<Option<ListenerTestState>, StoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| StoreError::backend("test run lock poisoned"))?;
        Ok(runs.get(&(*guid, protocol)).cloned())
    }

    fn upsert(&self, state: ListenerTestState) -> Result<(), StoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| StoreError::backend("test run lock poisoned"))?;
        runs.insert((state.guid(), state.protocol()), state);
        Ok(())
    }

    fn purge_all(&self) -> Result<(), StoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| StoreError::backend("test run lock poisoned"))?;
        runs.clear();
        Ok(())
    }
}

/// In-memory requestor report ledger.
#[derive(Default)]
pub struct MemoryRequestTestStore {
    reports: RwLock<Vec<(Uuid, TestId, FdoTestState)>>,
}

impl MemoryRequestTestStore {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All observations recorded for `run_id`, in report order.
    #[must_use]
    pub fn reports_for(&self, run_id: Uuid) -> Vec<(TestId, FdoTestState)> {
        self.reports
            .read()
            .map(|reports| {
                reports
                    .iter()
                    .filter(|(id, _, _)| *id == run_id)
                    .map(|(_, test_id, state)| (*test_id, state.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl RequestTestStore for MemoryRequestTestStore {
    fn report_test(
        &self,
        run_id: Uuid,
        test_id: TestId,
        state: FdoTestState,
    ) -> Result<(), StoreError> {
        let mut reports = self
            .reports
            .write()
            .map_err(|_| StoreError::backend("report lock poisoned"))?;
        reports.push((run_id, test_id, state));
        Ok(())
    }
}
