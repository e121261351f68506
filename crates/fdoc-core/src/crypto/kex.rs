//! Session-key exchange.
//!
//! The owner contributes an ephemeral public value (`xA`) at the
//! ownership-header step; the device answers with its own (`xB`) at the
//! proof step. Both sides derive the symmetric session key from the shared
//! secret with HKDF-SHA256, salted by the two challenge nonces so a
//! replayed key-exchange value can never resurrect an old session key.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::types::Nonce16;

use super::CryptoError;
use super::cipher::CipherSuite;

/// Size of a key-exchange public value in bytes.
pub const KEX_PUBLIC_SIZE: usize = 32;

/// Domain-separation info string for session-key derivation.
const KEX_INFO: &[u8] = b"fdoc/session-key/x25519-hkdf-sha256";

/// Negotiated key-exchange suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum KexSuite {
    /// X25519 Diffie-Hellman.
    X25519,
}

impl From<KexSuite> for u8 {
    fn from(value: KexSuite) -> Self {
        match value {
            KexSuite::X25519 => 1,
        }
    }
}

impl TryFrom<u8> for KexSuite {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::X25519),
            other => Err(format!("unknown key exchange suite {other}")),
        }
    }
}

/// One side's ephemeral key-exchange state.
///
/// The secret is held as a `StaticSecret` because the owner side must park
/// it in the session record between the header step and the device's proof.
pub struct KexState {
    secret: StaticSecret,
}

impl KexState {
    /// Generates a fresh ephemeral secret.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    /// Reconstructs state from secret bytes parked in a session record.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Secret bytes for persistence in the session record.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Public value to send to the peer.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; KEX_PUBLIC_SIZE] {
        XPublicKey::from(&self.secret).to_bytes()
    }

    /// Derives the session key from the peer's public value.
    ///
    /// Both sides call this with their own secret and the peer's public
    /// value; HKDF salt is the concatenation of the two challenge nonces in
    /// protocol order, and output length follows the negotiated cipher
    /// suite.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`] when the shared secret is degenerate
    /// (all-zero contribution).
    pub fn derive_session_key(
        &self,
        peer_public: &[u8; KEX_PUBLIC_SIZE],
        suite: KexSuite,
        cipher: CipherSuite,
        nonce_prove_ov: &Nonce16,
        nonce_prove_dv: &Nonce16,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let KexSuite::X25519 = suite;
        let shared = self.secret.diffie_hellman(&XPublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::Malformed {
                reason: "non-contributory key exchange".to_string(),
            });
        }

        let mut salt = [0u8; 32];
        salt[..16].copy_from_slice(nonce_prove_ov.as_bytes());
        salt[16..].copy_from_slice(nonce_prove_dv.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = Zeroizing::new(vec![0u8; cipher.key_len()]);
        hk.expand(KEX_INFO, okm.as_mut_slice())
            .map_err(|_| CryptoError::KeyLength {
                len: cipher.key_len(),
                context: "hkdf expand".to_string(),
            })?;
        Ok(okm)
    }
}

impl std::fmt::Debug for KexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexState")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_same_key() {
        let owner = KexState::generate();
        let device = KexState::generate();
        let prove_ov = Nonce16::random();
        let prove_dv = Nonce16::random();

        for cipher in [CipherSuite::A128Gcm, CipherSuite::A256Gcm] {
            let owner_key = owner
                .derive_session_key(
                    &device.public_bytes(),
                    KexSuite::X25519,
                    cipher,
                    &prove_ov,
                    &prove_dv,
                )
                .unwrap();
            let device_key = device
                .derive_session_key(
                    &owner.public_bytes(),
                    KexSuite::X25519,
                    cipher,
                    &prove_ov,
                    &prove_dv,
                )
                .unwrap();
            assert_eq!(*owner_key, *device_key);
            assert_eq!(owner_key.len(), cipher.key_len());
        }
    }

    #[test]
    fn different_nonces_give_different_keys() {
        let owner = KexState::generate();
        let device = KexState::generate();
        let prove_ov = Nonce16::random();

        let key_a = owner
            .derive_session_key(
                &device.public_bytes(),
                KexSuite::X25519,
                CipherSuite::A128Gcm,
                &prove_ov,
                &Nonce16::random(),
            )
            .unwrap();
        let key_b = owner
            .derive_session_key(
                &device.public_bytes(),
                KexSuite::X25519,
                CipherSuite::A128Gcm,
                &prove_ov,
                &Nonce16::random(),
            )
            .unwrap();
        assert_ne!(*key_a, *key_b);
    }

    #[test]
    fn secret_bytes_roundtrip() {
        let state = KexState::generate();
        let again = KexState::from_secret_bytes(state.secret_bytes());
        assert_eq!(state.public_bytes(), again.public_bytes());
    }

    #[test]
    fn zero_peer_public_rejected() {
        let state = KexState::generate();
        let err = state.derive_session_key(
            &[0u8; KEX_PUBLIC_SIZE],
            KexSuite::X25519,
            CipherSuite::A128Gcm,
            &Nonce16::random(),
            &Nonce16::random(),
        );
        assert!(err.is_err());
    }
}
