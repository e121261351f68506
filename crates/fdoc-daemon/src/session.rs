//! Per-device protocol session state.
//!
//! A session tracks one device's progress through exactly one sub-protocol
//! instance, addressed by an opaque bearer token. Handlers treat the entry
//! as an immutable value per request: load a snapshot, compute the
//! transitioned value, write the whole entry back. No field is ever
//! mutated in place across handler branches, so an interleaved pair of
//! requests cannot produce a torn session.

use std::fmt;

use fdoc_core::crypto::cipher::CipherSuite;
use fdoc_core::crypto::kex::KexSuite;
use fdoc_core::messages::{MsgType, Protocol};
use fdoc_core::types::{Guid, Nonce16, ServiceInfoKv};

/// Opaque, unguessable session credential.
///
/// Issued on a sub-protocol's first message and required as a bearer on
/// every subsequent step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Mints a fresh random token.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps a token presented by a peer.
    #[must_use]
    pub fn from_presented(token: &str) -> Self {
        Self(token.to_string())
    }

    /// The token string, as carried in the bearer header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One sub-protocol session.
///
/// `prev_cmd` holds the message type of the last response this side sent;
/// each handler admits only the message types whose legal predecessor it
/// is, and never advances the session on a rejected step.
#[derive(Clone)]
pub struct SessionEntry {
    /// Sub-protocol this session runs.
    pub protocol: Protocol,
    /// Device the session belongs to. Unknown until TO0's registration
    /// step names one.
    pub guid: Option<Guid>,
    /// Last response message type sent, the previous-step marker.
    pub prev_cmd: Option<MsgType>,

    /// TO0 registration challenge nonce.
    pub nonce_to0_sign: Option<Nonce16>,
    /// TO1 proof challenge nonce.
    pub nonce_to1_proof: Option<Nonce16>,
    /// TO2 header-proof nonce, issued by the device.
    pub nonce_prove_ov: Option<Nonce16>,
    /// TO2 device-proof nonce, issued by the owner.
    pub nonce_prove_dv: Option<Nonce16>,
    /// TO2 setup nonce, issued by the device.
    pub nonce_setup_dv: Option<Nonce16>,

    /// Negotiated key-exchange suite.
    pub kex_suite: Option<KexSuite>,
    /// Negotiated cipher suite. Immutable for the session's lifetime.
    pub cipher_suite: Option<CipherSuite>,
    /// Owner's parked ephemeral key-exchange secret, held between the
    /// header step and the device's proof.
    pub kex_secret: Option<[u8; 32]>,
    /// Derived symmetric session key.
    pub session_key: Option<Vec<u8>>,

    /// Next voucher entry index the device may request.
    pub entry_cursor: u8,
    /// Entry count of the voucher being transferred.
    pub num_entries: u8,

    /// Owner service-info pages still to be served, in enqueue order.
    pub owner_sims: Vec<ServiceInfoKv>,
    /// Next owner page to serve.
    pub owner_sims_cursor: usize,
    /// Whether the owner has served its last page.
    pub owner_sims_done: bool,
    /// Device service-info pages received, in arrival order.
    pub device_sims: Vec<ServiceInfoKv>,
    /// Whether the device signaled it has nothing more to send.
    pub device_sims_done: bool,
}

impl SessionEntry {
    /// Fresh session for `protocol`; all protocol state unset.
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            guid: None,
            prev_cmd: None,
            nonce_to0_sign: None,
            nonce_to1_proof: None,
            nonce_prove_ov: None,
            nonce_prove_dv: None,
            nonce_setup_dv: None,
            kex_suite: None,
            cipher_suite: None,
            kex_secret: None,
            session_key: None,
            entry_cursor: 0,
            num_entries: 0,
            owner_sims: Vec::new(),
            owner_sims_cursor: 0,
            owner_sims_done: false,
            device_sims: Vec::new(),
            device_sims_done: false,
        }
    }

    /// Whether the session's previous-step marker is one of `allowed`.
    #[must_use]
    pub fn prev_cmd_is(&self, allowed: &[MsgType]) -> bool {
        self.prev_cmd.is_some_and(|prev| allowed.contains(&prev))
    }
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SessionEntry")
            .field("protocol", &self.protocol)
            .field("guid", &self.guid)
            .field("prev_cmd", &self.prev_cmd)
            .field("entry_cursor", &self.entry_cursor)
            .field("num_entries", &self.num_entries)
            .field("owner_sims_cursor", &self.owner_sims_cursor)
            .field("owner_sims_done", &self.owner_sims_done)
            .field("device_sims_done", &self.device_sims_done)
            .finish_non_exhaustive()
    }
}
