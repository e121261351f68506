//! Ed25519 keypairs and device certificate chains.

use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::types::bytes_array;

use super::CryptoError;

/// Size of a public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Domain-separation prefix for certificate-chain signatures, so a
/// certificate can never be replayed as a protocol message signature.
const CERT_CONTEXT: &[u8] = b"fdoc/cert-chain/v1";

/// A public verification key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_array")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wraps raw key bytes. Validity is checked at first use.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Verifies `signature` over `message`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`] if the key bytes are not a valid curve
    /// point, [`CryptoError::SignatureInvalid`] if verification fails.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key =
            ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::Malformed {
                reason: "public key is not a valid curve point".to_string(),
            })?;
        let sig_bytes: &[u8; SIGNATURE_SIZE] =
            signature
                .try_into()
                .map_err(|_| CryptoError::Malformed {
                    reason: format!("signature length {} != {SIGNATURE_SIZE}", signature.len()),
                })?;
        let signature = ed25519_dalek::Signature::from_bytes(sig_bytes);
        key.verify(message, &signature)
            .map_err(|_| CryptoError::SignatureInvalid)
    }

    /// Constant-time equality, for comparing a voucher's committed key
    /// against a live proof-of-possession key.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An Ed25519 signing keypair.
///
/// Debug output never prints key material. The inner dalek key zeroizes on
/// drop.
#[derive(Clone)]
pub struct KeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generates a fresh keypair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs a keypair from a stored 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed for persistence. Callers own the secrecy of the
    /// returned bytes.
    #[must_use]
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The corresponding public key.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Signs `message`, returning the raw 64-byte signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// One link in a device certificate chain: a subject key endorsed by the
/// previous link's subject (the first link is self-signed by the trust
/// root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertEntry {
    /// Key being certified.
    pub subject: PublicKey,
    /// Issuer signature over [`CERT_CONTEXT`] and the subject key bytes.
    #[serde(with = "bytes_array")]
    pub signature: [u8; SIGNATURE_SIZE],
}

/// Manufacturer-issued device certificate chain, root first.
///
/// The leaf (last) key is the device's protocol signing key; protocol-level
/// signature verification resolves the leaf through [`Self::verify_chain`],
/// which ties message authentication to the chain of custody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCertChain {
    entries: Vec<CertEntry>,
}

impl DeviceCertChain {
    /// Issues a chain: the root endorses itself, then each subsequent key is
    /// endorsed by its predecessor. `keys[0]` is the trust root; the last
    /// key is the device leaf.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`] when `keys` is empty.
    pub fn issue(keys: &[&KeyPair]) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::Malformed {
                reason: "certificate chain needs at least one key".to_string(),
            });
        }
        let mut entries = Vec::with_capacity(keys.len());
        let mut issuer = keys[0];
        for key in keys.iter().copied() {
            let subject = key.public();
            let signature = issuer.sign(&cert_message(&subject));
            entries.push(CertEntry { subject, signature });
            issuer = key;
        }
        Ok(Self { entries })
    }

    /// Walks the chain root-to-leaf, verifying each endorsement, and
    /// returns the leaf key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::CertChain`] naming the first broken link.
    pub fn verify_chain(&self) -> Result<&PublicKey, CryptoError> {
        let root = self.entries.first().ok_or_else(|| CryptoError::CertChain {
            reason: "empty chain".to_string(),
        })?;
        let mut issuer = &root.subject;
        for (idx, entry) in self.entries.iter().enumerate() {
            issuer
                .verify(&cert_message(&entry.subject), &entry.signature)
                .map_err(|_| CryptoError::CertChain {
                    reason: format!("entry {idx} not endorsed by its issuer"),
                })?;
            issuer = &entry.subject;
        }
        Ok(issuer)
    }

    /// Number of links in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has no links. A well-formed chain never does.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The leaf key without verification. Use [`Self::verify_chain`] on any
    /// untrusted chain.
    #[must_use]
    pub fn leaf_unverified(&self) -> Option<&PublicKey> {
        self.entries.last().map(|entry| &entry.subject)
    }
}

fn cert_message(subject: &PublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CERT_CONTEXT.len() + PUBLIC_KEY_SIZE);
    msg.extend_from_slice(CERT_CONTEXT);
    msg.extend_from_slice(subject.as_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = KeyPair::generate();
        let sig = key.sign(b"payload");
        key.public().verify(b"payload", &sig).expect("verify");
    }

    #[test]
    fn tampered_message_fails() {
        let key = KeyPair::generate();
        let sig = key.sign(b"payload");
        assert!(matches!(
            key.public().verify(b"payloae", &sig),
            Err(CryptoError::SignatureInvalid)
        ));
    }

    #[test]
    fn seed_reconstruction() {
        let key = KeyPair::generate();
        let again = KeyPair::from_seed(&key.seed());
        assert!(key.public().equals(&again.public()));
    }

    #[test]
    fn chain_verifies_and_yields_leaf() {
        let root = KeyPair::generate();
        let inter = KeyPair::generate();
        let device = KeyPair::generate();
        let chain = DeviceCertChain::issue(&[&root, &inter, &device]).unwrap();
        let leaf = chain.verify_chain().expect("chain");
        assert!(leaf.equals(&device.public()));
    }

    #[test]
    fn broken_link_detected() {
        let root = KeyPair::generate();
        let device = KeyPair::generate();
        let mut chain = DeviceCertChain::issue(&[&root, &device]).unwrap();
        chain.entries[1].signature[0] ^= 0x01;
        assert!(matches!(
            chain.verify_chain(),
            Err(CryptoError::CertChain { .. })
        ));
    }

    #[test]
    fn debug_never_prints_seed() {
        let key = KeyPair::generate();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains(&hex::encode(key.seed())));
    }
}
