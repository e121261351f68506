//! Ownership vouchers: the hash-chained record of a device's custody from
//! manufacturer to current owner.
//!
//! The header commits to the device identity, its certificate chain, and the
//! manufacturer public key; a device-keyed HMAC over the header bytes proves
//! the header was never rewritten. Each transfer entry signs the hash of its
//! predecessor (the header for entry 0) together with the next owner's
//! public key, so custody can be extended only by whoever currently holds
//! it. Verification is all-or-nothing: a single bad link fails the chain.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::codec;
use crate::crypto::CryptoError;
use crate::crypto::cose::CoseSignature;
use crate::crypto::keys::{DeviceCertChain, KeyPair, PublicKey};
use crate::types::{Guid, bytes_array};

type HmacSha256 = Hmac<Sha256>;

/// Size of chain hashes and header HMACs in bytes.
pub const HASH_SIZE: usize = 32;

/// A SHA-256 digest in the voucher chain.
pub type Hash32 = [u8; HASH_SIZE];

/// Errors from voucher inspection and verification.
#[derive(Debug, Error)]
pub enum VoucherError {
    /// The encoded header does not decode.
    #[error("voucher header malformed: {reason}")]
    Header {
        /// Decoder detail.
        reason: String,
    },

    /// Recomputed header HMAC does not match the stored value.
    #[error("voucher header HMAC mismatch")]
    HmacMismatch,

    /// An entry index outside the chain was requested.
    #[error("voucher entry {index} out of range ({len} entries)")]
    EntryOutOfRange {
        /// Requested index.
        index: u8,
        /// Number of entries in the chain.
        len: usize,
    },

    /// The hash chain or an entry structure is broken at `index`.
    #[error("voucher chain broken at entry {index}: {reason}")]
    ChainBroken {
        /// Index of the offending entry.
        index: usize,
        /// What failed.
        reason: String,
    },

    /// An entry signature failed to verify at `index`.
    #[error("voucher entry {index} signature invalid")]
    EntrySignature {
        /// Index of the offending entry.
        index: usize,
        /// Underlying verification failure.
        #[source]
        source: CryptoError,
    },
}

/// Decoded voucher header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvHeader {
    /// Device globally-unique identifier.
    pub guid: Guid,
    /// Human-oriented device model string.
    pub device_info: String,
    /// Manufacturer public key; anchors entry 0 of the chain.
    pub manufacturer_key: PublicKey,
    /// Digest of the encoded device certificate chain.
    #[serde(with = "bytes_array")]
    pub cert_chain_hash: Hash32,
}

/// Signed content of one transfer entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvEntryPayload {
    /// Digest of the previous entry (header + HMAC for entry 0).
    #[serde(with = "bytes_array")]
    pub hash_prev_entry: Hash32,
    /// Digest of the header identity info, pinning every entry to one
    /// device.
    #[serde(with = "bytes_array")]
    pub hash_hdr_info: Hash32,
    /// Public key of the owner this entry transfers custody to.
    pub pub_key: PublicKey,
}

/// One transfer entry: an [`OvEntryPayload`] signed by the then-current
/// owner.
pub type OvEntry = CoseSignature;

/// A complete ownership voucher.
///
/// The header is kept as its transmitted encoding; digests and the HMAC are
/// computed over those exact bytes, so re-encoding can never silently change
/// what was signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipVoucher {
    /// Encoded [`OvHeader`].
    pub header: Bytes,
    /// Device-keyed HMAC-SHA256 over the header bytes.
    #[serde(with = "bytes_array")]
    pub header_hmac: Hash32,
    /// Manufacturer-issued device certificate chain.
    pub dev_cert_chain: DeviceCertChain,
    /// Transfer entries, oldest first.
    pub entries: Vec<OvEntry>,
}

impl OwnershipVoucher {
    /// Decodes the header.
    ///
    /// # Errors
    ///
    /// [`VoucherError::Header`] when the bytes do not decode.
    pub fn header(&self) -> Result<OvHeader, VoucherError> {
        codec::from_slice(&self.header).map_err(|err| VoucherError::Header {
            reason: err.to_string(),
        })
    }

    /// Number of transfer entries.
    #[must_use]
    pub fn num_entries(&self) -> u8 {
        u8::try_from(self.entries.len()).unwrap_or(u8::MAX)
    }

    /// Returns entry `index`.
    ///
    /// # Errors
    ///
    /// [`VoucherError::EntryOutOfRange`] when past the chain end.
    pub fn entry(&self, index: u8) -> Result<&OvEntry, VoucherError> {
        self.entries
            .get(usize::from(index))
            .ok_or(VoucherError::EntryOutOfRange {
                index,
                len: self.entries.len(),
            })
    }

    /// Recomputes the header HMAC under the device secret and compares it,
    /// constant-time, to the stored value.
    ///
    /// # Errors
    ///
    /// [`VoucherError::HmacMismatch`] on any difference.
    pub fn verify_header_hmac(&self, hmac_secret: &[u8]) -> Result<(), VoucherError> {
        let computed = header_hmac(hmac_secret, &self.header);
        if bool::from(computed.ct_eq(&self.header_hmac)) {
            Ok(())
        } else {
            Err(VoucherError::HmacMismatch)
        }
    }

    /// Walks the entry chain, verifying every link, and returns the
    /// terminal committed public key — the current owner.
    ///
    /// See [`verify_entry_chain`] for the checks performed.
    ///
    /// # Errors
    ///
    /// [`VoucherError::ChainBroken`] or [`VoucherError::EntrySignature`]
    /// naming the first bad entry.
    pub fn verify_entries(&self) -> Result<PublicKey, VoucherError> {
        verify_entry_chain(&self.header, &self.header_hmac, &self.entries)
    }
}

/// Walks an entry chain against its header bytes and HMAC, verifying every
/// link, and returns the terminal committed public key — the current owner.
///
/// Checks, per entry: the previous-entry hash link, the header-info digest,
/// and the signature under the key committed by the predecessor (the
/// manufacturer key for entry 0). Any single failure aborts the chain;
/// partial trust is not an outcome. A chain with no entries commits custody
/// to the manufacturer.
///
/// Standalone so a device that received the header and entries over the
/// wire can verify them without assembling a full voucher.
///
/// # Errors
///
/// [`VoucherError::Header`] for undecodable header bytes,
/// [`VoucherError::ChainBroken`] or [`VoucherError::EntrySignature`] naming
/// the first bad entry.
pub fn verify_entry_chain(
    header_bytes: &[u8],
    header_hmac: &Hash32,
    entries: &[OvEntry],
) -> Result<PublicKey, VoucherError> {
    let header: OvHeader = codec::from_slice(header_bytes).map_err(|err| VoucherError::Header {
        reason: err.to_string(),
    })?;
    let hdr_info = hash_hdr_info(&header);

    let mut prev_hash = entry0_hash(header_bytes, header_hmac);
    let mut current_key = header.manufacturer_key;

    for (index, entry) in entries.iter().enumerate() {
        let payload: OvEntryPayload =
            entry
                .decode_payload()
                .map_err(|err| VoucherError::ChainBroken {
                    index,
                    reason: format!("payload undecodable: {err}"),
                })?;

        if payload.hash_prev_entry != prev_hash {
            return Err(VoucherError::ChainBroken {
                index,
                reason: "previous-entry hash mismatch".to_string(),
            });
        }
        if payload.hash_hdr_info != hdr_info {
            return Err(VoucherError::ChainBroken {
                index,
                reason: "header-info hash mismatch".to_string(),
            });
        }
        entry
            .verify(&current_key)
            .map_err(|source| VoucherError::EntrySignature { index, source })?;

        prev_hash = entry_hash(entry).map_err(|err| VoucherError::ChainBroken {
            index,
            reason: format!("entry not hashable: {err}"),
        })?;
        current_key = payload.pub_key;
    }

    Ok(current_key)
}

/// HMAC-SHA256 over the encoded header under the device secret.
#[must_use]
pub fn header_hmac(hmac_secret: &[u8], header: &[u8]) -> Hash32 {
    let mut mac = HmacSha256::new_from_slice(hmac_secret)
        .expect("HMAC accepts any key length");
    mac.update(header);
    mac.finalize().into_bytes().into()
}

fn entry0_hash(header: &[u8], hmac: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(header);
    hasher.update(hmac);
    hasher.finalize().into()
}

fn hash_hdr_info(header: &OvHeader) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(header.guid.as_bytes());
    hasher.update(header.device_info.as_bytes());
    hasher.finalize().into()
}

fn entry_hash(entry: &OvEntry) -> Result<Hash32, codec::CodecError> {
    let bytes = codec::to_vec(entry)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Device-held credential matching a voucher: the identity, the header HMAC
/// secret, and the leaf signing key of the certificate chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCredential {
    /// Device identifier, equal to the voucher header's.
    pub guid: Guid,
    /// Secret for recomputing the header HMAC.
    #[serde(with = "bytes_array")]
    pub hmac_secret: [u8; 32],
    /// Seed of the device's leaf signing key.
    #[serde(with = "bytes_array")]
    pub key_seed: [u8; 32],
}

impl DeviceCredential {
    /// The device's signing keypair.
    #[must_use]
    pub fn key(&self) -> KeyPair {
        KeyPair::from_seed(&self.key_seed)
    }
}

/// Assembles vouchers for virtual test devices.
///
/// The conformance harness mints a fresh device identity, certificate chain,
/// and custody chain per provisioned device; real vouchers are created
/// out-of-band by manufacturing tooling and only verified here.
#[derive(Debug)]
pub struct VoucherBuilder {
    device_info: String,
    owners: usize,
}

/// Everything [`VoucherBuilder::build`] mints for one device.
pub struct BuiltVoucher {
    /// The assembled voucher.
    pub voucher: OwnershipVoucher,
    /// Matching device-held credential.
    pub credential: DeviceCredential,
    /// Keypair of the terminal (current) owner.
    pub owner_key: KeyPair,
    /// Manufacturer keypair anchoring the chain.
    pub manufacturer_key: KeyPair,
}

impl VoucherBuilder {
    /// Starts a builder for a device described by `device_info`.
    #[must_use]
    pub fn new(device_info: impl Into<String>) -> Self {
        Self {
            device_info: device_info.into(),
            owners: 1,
        }
    }

    /// Sets the number of ownership transfers (chain length). Zero leaves
    /// custody with the manufacturer.
    #[must_use]
    pub fn owners(mut self, owners: usize) -> Self {
        self.owners = owners;
        self
    }

    /// Mints the voucher, device credential, and owner keypair.
    ///
    /// # Errors
    ///
    /// [`CryptoError`] when an intermediate structure cannot be encoded;
    /// does not happen for well-formed inputs.
    pub fn build(self) -> Result<BuiltVoucher, CryptoError> {
        let manufacturer = KeyPair::generate();
        let device = KeyPair::generate();
        let chain = DeviceCertChain::issue(&[&manufacturer, &device])?;
        let chain_bytes = codec::to_vec(&chain).map_err(|err| CryptoError::Malformed {
            reason: format!("cert chain: {err}"),
        })?;

        let guid = Guid::random();
        let header = OvHeader {
            guid,
            device_info: self.device_info,
            manufacturer_key: manufacturer.public(),
            cert_chain_hash: Sha256::digest(&chain_bytes).into(),
        };
        let header_bytes = codec::to_vec(&header).map_err(|err| CryptoError::Malformed {
            reason: format!("voucher header: {err}"),
        })?;

        let mut hmac_secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut hmac_secret);
        let hmac = header_hmac(&hmac_secret, &header_bytes);

        let hdr_info = hash_hdr_info(&header);
        let owner_keys: Vec<KeyPair> = (0..self.owners).map(|_| KeyPair::generate()).collect();

        let mut entries = Vec::with_capacity(owner_keys.len());
        let mut prev_hash = entry0_hash(&header_bytes, &hmac);
        let mut signer = &manufacturer;
        for owner in &owner_keys {
            let payload = OvEntryPayload {
                hash_prev_entry: prev_hash,
                hash_hdr_info: hdr_info,
                pub_key: owner.public(),
            };
            let payload_bytes = codec::to_vec(&payload).map_err(|err| CryptoError::Malformed {
                reason: format!("entry payload: {err}"),
            })?;
            let entry = CoseSignature::sign(payload_bytes, signer)?;
            prev_hash = entry_hash(&entry).map_err(|err| CryptoError::Malformed {
                reason: format!("entry hash: {err}"),
            })?;
            entries.push(entry);
            signer = owner;
        }

        let owner_key = owner_keys.into_iter().last().unwrap_or_else(|| {
            // No transfers: custody stays with the manufacturer.
            KeyPair::from_seed(&manufacturer.seed())
        });

        Ok(BuiltVoucher {
            voucher: OwnershipVoucher {
                header: Bytes::from(header_bytes),
                header_hmac: hmac,
                dev_cert_chain: chain,
                entries,
            },
            credential: DeviceCredential {
                guid,
                hmac_secret,
                key_seed: device.seed(),
            },
            owner_key,
            manufacturer_key: manufacturer,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn built_voucher_verifies() {
        for owners in [0usize, 1, 3, 5] {
            let built = VoucherBuilder::new("model-x").owners(owners).build().unwrap();
            let terminal = built.voucher.verify_entries().expect("chain verifies");
            assert!(terminal.equals(&built.owner_key.public()));
            built
                .voucher
                .verify_header_hmac(&built.credential.hmac_secret)
                .expect("hmac verifies");
            assert_eq!(built.voucher.num_entries(), owners as u8);
        }
    }

    #[test]
    fn wrong_hmac_secret_rejected() {
        let built = VoucherBuilder::new("model-x").build().unwrap();
        assert!(matches!(
            built.voucher.verify_header_hmac(&[0u8; 32]),
            Err(VoucherError::HmacMismatch)
        ));
    }

    #[test]
    fn header_tamper_breaks_chain() {
        let built = VoucherBuilder::new("model-x").owners(2).build().unwrap();
        let mut voucher = built.voucher;
        let mut header = voucher.header.to_vec();
        let last = header.len() - 1;
        header[last] ^= 0x01;
        voucher.header = Bytes::from(header);
        assert!(voucher.verify_entries().is_err());
    }

    #[test]
    fn entry_out_of_range() {
        let built = VoucherBuilder::new("model-x").owners(2).build().unwrap();
        assert!(built.voucher.entry(1).is_ok());
        assert!(matches!(
            built.voucher.entry(2),
            Err(VoucherError::EntryOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn swapped_entries_detected() {
        let built = VoucherBuilder::new("model-x").owners(3).build().unwrap();
        let mut voucher = built.voucher;
        voucher.entries.swap(1, 2);
        assert!(matches!(
            voucher.verify_entries(),
            Err(VoucherError::ChainBroken { index: 1, .. })
        ));
    }

    proptest! {
        // Flipping any single signature byte in any entry fails the chain,
        // regardless of position.
        #[test]
        fn any_signature_bitflip_fails_chain(
            owners in 1usize..5,
            entry_pick in 0usize..5,
            byte_pick in 0usize..64,
            bit in 0u8..8,
        ) {
            let built = VoucherBuilder::new("model-x").owners(owners).build().unwrap();
            let mut voucher = built.voucher;
            let index = entry_pick % owners;
            let mut sig = voucher.entries[index].signature.to_vec();
            let idx = byte_pick % sig.len();
            sig[idx] ^= 1 << bit;
            voucher.entries[index].signature = Bytes::from(sig);
            prop_assert!(voucher.verify_entries().is_err());
        }
    }
}
