//! TO2: the device and owner complete the ownership transfer.
//!
//! `HelloDevice60 → ProveOvHdr61 → GetOvNextEntry62/OvNextEntry63
//! (iterative) → ProveDevice64 → SetupDevice65 → DeviceServiceInfoReady66 /
//! OwnerServiceInfoReady67 → DeviceServiceInfo68 ↔ OwnerServiceInfo69
//! (paginated) → Done70 → Done271`.
//!
//! The session key is derived at step 64; message bodies from step 65
//! onward (66, 68, 70 inbound; 65, 67, 69, 71 outbound) travel inside an
//! [`EncryptedEnvelope`](crate::crypto::cipher::EncryptedEnvelope).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::cipher::CipherSuite;
use crate::crypto::cose::CoseSignature;
use crate::crypto::keys::PublicKey;
use crate::crypto::kex::{KEX_PUBLIC_SIZE, KexSuite};
use crate::types::{Guid, Nonce16, ServiceInfoKv, SigInfo, bytes_array};
use crate::voucher::{Hash32, OvEntry};

/// Service-info page-size ceiling in bytes.
///
/// Matches a typical link MTU so a page never spans a network packet;
/// payloads larger than this must be split into multiple pages by the
/// sender.
pub const MTU_BYTES: usize = 1500;

/// TO2 opening message: the device names itself, issues the header-proof
/// nonce, and pins the key-exchange and cipher suites for the whole
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloDevice60 {
    /// Device identifier; the owner must hold its voucher.
    pub guid: Guid,
    /// Nonce the owner must echo inside the signed header proof.
    pub nonce_prove_ov: Nonce16,
    /// Key-exchange suite for this session.
    pub kex_suite: KexSuite,
    /// Cipher suite for this session. Immutable once chosen.
    pub cipher_suite: CipherSuite,
    /// Device's declared signature algorithm family.
    pub ea_sig_info: SigInfo,
}

/// Signed payload of `ProveOvHdr61`: the voucher header, its HMAC, the
/// nonce echo, and the owner's key-exchange contribution.
///
/// The header travels as its stored encoding so the device can recompute
/// the HMAC over the exact registered bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveOvHdrPayload {
    /// Encoded voucher header, byte-exact as stored.
    pub header: Bytes,
    /// Number of voucher entries the device must fetch.
    pub num_entries: u8,
    /// Device-keyed HMAC over the header bytes.
    #[serde(with = "bytes_array")]
    pub hmac: Hash32,
    /// Echo of [`HelloDevice60::nonce_prove_ov`].
    pub nonce_prove_ov: Nonce16,
    /// Echo of the device's declared algorithm family.
    pub eb_sig_info: SigInfo,
    /// Owner's ephemeral key-exchange public value (`xA`).
    #[serde(with = "bytes_array")]
    pub xa: [u8; KEX_PUBLIC_SIZE],
}

/// TO2 owner proof over [`ProveOvHdrPayload`].
///
/// The unprotected header carries the device-proof nonce and the owner's
/// public key; the device holds that key untrusted until the entry chain
/// terminates in it.
pub type ProveOvHdr61 = CoseSignature;

/// TO2 voucher entry request. Entries are fetched by strictly increasing
/// index starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOvNextEntry62 {
    /// Requested entry index.
    pub entry_num: u8,
}

/// TO2 voucher entry response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvNextEntry63 {
    /// Index of the entry served.
    pub entry_num: u8,
    /// The transfer entry.
    pub entry: OvEntry,
}

/// Signed payload of `ProveDevice64`: the device-proof nonce echo and the
/// device's key-exchange contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveDevicePayload {
    /// Echo of the nonce issued in `ProveOvHdr61`'s unprotected header.
    pub nonce_prove_dv: Nonce16,
    /// Device identifier of the signer.
    pub guid: Guid,
    /// Device's ephemeral key-exchange public value (`xB`).
    #[serde(with = "bytes_array")]
    pub xb: [u8; KEX_PUBLIC_SIZE],
}

/// TO2 device proof over [`ProveDevicePayload`]; the session key is derived
/// from this message. Its unprotected header carries the device-generated
/// setup nonce the owner must echo in `SetupDevice65`.
pub type ProveDevice64 = CoseSignature;

/// Signed payload of `SetupDevice65`: the owner acknowledges the device and
/// echoes the setup nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupDevicePayload {
    /// Device identifier being set up.
    pub guid: Guid,
    /// Echo of the setup nonce from `ProveDevice64`'s unprotected header.
    pub nonce_setup_dv: Nonce16,
    /// Owner's public key, for the device's records.
    pub owner_pub_key: PublicKey,
}

/// TO2 owner setup response over [`SetupDevicePayload`]. First encrypted
/// message of the session.
pub type SetupDevice65 = CoseSignature;

/// TO2 device readiness signal for the service-info exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceServiceInfoReady66 {
    /// Largest owner page the device will accept, when it wants a ceiling
    /// below [`MTU_BYTES`].
    pub max_owner_message_size: Option<u16>,
}

/// TO2 owner readiness signal for the service-info exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerServiceInfoReady67 {
    /// Largest device page the owner will accept.
    pub max_device_message_size: Option<u16>,
}

/// TO2 device service-info page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceServiceInfo68 {
    /// Whether the device has more pages after this one.
    pub is_more: bool,
    /// The page, absent when the device has nothing left to send.
    pub service_info: Option<ServiceInfoKv>,
}

/// TO2 owner service-info page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerServiceInfo69 {
    /// Whether the owner has more pages after this one.
    pub is_more: bool,
    /// Whether the owner is finished and requires nothing further from the
    /// device. The exchange ends when this arrives.
    pub is_done: bool,
    /// The page, absent while the device is still sending its own.
    pub service_info: Option<ServiceInfoKv>,
}

/// TO2 device completion: the device confirms the session by echoing the
/// device-proof nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done70 {
    /// Echo of the nonce from `ProveOvHdr61`'s unprotected header.
    pub nonce_prove_dv: Nonce16,
}

/// TO2 owner completion acknowledgment, closing the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done271 {
    /// Echo of the setup nonce from `ProveDevice64`'s unprotected header.
    pub nonce_setup_dv: Nonce16,
}
