//! fdoc-core - Device-onboarding protocol core.
//!
//! This crate implements the transport-independent core of the
//! device-onboarding handshake family and its conformance-testing
//! machinery:
//!
//! - [`codec`]: deterministic CBOR encoding/decoding with adversarial-input
//!   hardening
//! - [`crypto`]: signature envelopes, authenticated encryption, key exchange
//! - [`voucher`]: ownership-voucher chain construction and verification
//! - [`messages`]: the typed message set for the TO0/TO1/TO2 sub-protocols
//! - [`testcom`]: the conformance test-run state machine and outbound fault
//!   injectors
//!
//! The crate contains no I/O. Transports and storage backends live with the
//! embedding service (see `fdoc-daemon`); everything here is synchronous pure
//! computation, which is what makes the protocol logic testable in isolation
//! and safe to drive from any runtime.

pub mod codec;
pub mod crypto;
pub mod messages;
pub mod testcom;
pub mod types;
pub mod voucher;

pub use codec::CodecError;
pub use crypto::CryptoError;
pub use messages::{ErrorCode, ErrorMessage, MsgType, Protocol};
pub use testcom::{FdoTestState, ListenerTestState, TestId};
pub use types::{Guid, Nonce16, ServiceInfoKv, SigInfo};
pub use voucher::{OwnershipVoucher, VoucherError};
