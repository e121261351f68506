//! Authenticated encryption of message bodies.
//!
//! After the owner sub-protocol derives a session key, every subsequent
//! message body travels inside an [`EncryptedEnvelope`]. The cipher suite is
//! negotiated once at the hello step and is immutable for the session's
//! lifetime; the unwrap path rejects any envelope that does not authenticate
//! under the session's suite and key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use bytes::Bytes;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::types::bytes_array;

use super::CryptoError;

/// AEAD IV size in bytes (96-bit GCM nonce).
pub const IV_SIZE: usize = 12;

/// Negotiated authenticated-encryption suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CipherSuite {
    /// AES-128-GCM.
    A128Gcm,
    /// AES-256-GCM.
    A256Gcm,
}

impl CipherSuite {
    /// Symmetric key length this suite requires.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::A128Gcm => 16,
            Self::A256Gcm => 32,
        }
    }
}

impl From<CipherSuite> for u8 {
    fn from(value: CipherSuite) -> Self {
        match value {
            CipherSuite::A128Gcm => 1,
            CipherSuite::A256Gcm => 3,
        }
    }
}

impl TryFrom<u8> for CipherSuite {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::A128Gcm),
            3 => Ok(Self::A256Gcm),
            other => Err(format!("unknown cipher suite {other}")),
        }
    }
}

/// Ciphertext envelope: fresh IV plus ciphertext-with-tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Per-message random IV.
    #[serde(with = "bytes_array")]
    pub iv: [u8; IV_SIZE],
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Bytes,
}

/// Encrypts `plaintext` under `key` with the session's negotiated suite.
///
/// # Errors
///
/// [`CryptoError::KeyLength`] when the key does not match the suite.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8],
    suite: CipherSuite,
) -> Result<EncryptedEnvelope, CryptoError> {
    check_key(key, suite)?;
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = match suite {
        CipherSuite::A128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| key_length(key, suite))?;
            cipher.encrypt(Nonce::from_slice(&iv), plaintext)
        }
        CipherSuite::A256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| key_length(key, suite))?;
            cipher.encrypt(Nonce::from_slice(&iv), plaintext)
        }
    }
    .map_err(|_| CryptoError::Malformed {
        reason: "encryption failed".to_string(),
    })?;
    Ok(EncryptedEnvelope {
        iv,
        ciphertext: Bytes::from(ciphertext),
    })
}

/// Decrypts an envelope, failing closed.
///
/// # Errors
///
/// [`CryptoError::KeyLength`] for a key/suite mismatch;
/// [`CryptoError::DecryptFailed`] for tag mismatch, truncated ciphertext,
/// or an envelope produced under a different suite or key. The failure
/// carries no distinguishing detail.
pub fn decrypt(
    envelope: &EncryptedEnvelope,
    key: &[u8],
    suite: CipherSuite,
) -> Result<Vec<u8>, CryptoError> {
    check_key(key, suite)?;
    let nonce = Nonce::from_slice(&envelope.iv);
    let result = match suite {
        CipherSuite::A128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| key_length(key, suite))?;
            cipher.decrypt(nonce, envelope.ciphertext.as_ref())
        }
        CipherSuite::A256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| key_length(key, suite))?;
            cipher.decrypt(nonce, envelope.ciphertext.as_ref())
        }
    };
    result.map_err(|_| CryptoError::DecryptFailed)
}

fn check_key(key: &[u8], suite: CipherSuite) -> Result<(), CryptoError> {
    if key.len() == suite.key_len() {
        Ok(())
    } else {
        Err(key_length(key, suite))
    }
}

fn key_length(key: &[u8], suite: CipherSuite) -> CryptoError {
    CryptoError::KeyLength {
        len: key.len(),
        context: format!("{suite:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_both_suites() {
        for suite in [CipherSuite::A128Gcm, CipherSuite::A256Gcm] {
            let key = vec![0x42u8; suite.key_len()];
            let envelope = encrypt(b"service info page", &key, suite).unwrap();
            let plain = decrypt(&envelope, &key, suite).unwrap();
            assert_eq!(plain, b"service info page");
        }
    }

    #[test]
    fn fresh_iv_per_message() {
        let key = vec![0u8; 16];
        let a = encrypt(b"x", &key, CipherSuite::A128Gcm).unwrap();
        let b = encrypt(b"x", &key, CipherSuite::A128Gcm).unwrap();
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn tag_tamper_fails_closed() {
        let key = vec![0u8; 16];
        let mut envelope = encrypt(b"payload", &key, CipherSuite::A128Gcm).unwrap();
        let mut ct = envelope.ciphertext.to_vec();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        envelope.ciphertext = Bytes::from(ct);
        assert!(matches!(
            decrypt(&envelope, &key, CipherSuite::A128Gcm),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn truncated_ciphertext_fails_closed() {
        let key = vec![0u8; 16];
        let mut envelope = encrypt(b"payload", &key, CipherSuite::A128Gcm).unwrap();
        envelope.ciphertext = envelope.ciphertext.slice(0..4);
        assert!(decrypt(&envelope, &key, CipherSuite::A128Gcm).is_err());
    }

    #[test]
    fn wrong_suite_rejected() {
        let key16 = vec![0u8; 16];
        let envelope = encrypt(b"payload", &key16, CipherSuite::A128Gcm).unwrap();
        // Same envelope under the other suite: key length no longer matches.
        assert!(matches!(
            decrypt(&envelope, &key16, CipherSuite::A256Gcm),
            Err(CryptoError::KeyLength { .. })
        ));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let key = vec![0u8; 16];
        let other = vec![1u8; 16];
        let envelope = encrypt(b"payload", &key, CipherSuite::A128Gcm).unwrap();
        assert!(matches!(
            decrypt(&envelope, &other, CipherSuite::A128Gcm),
            Err(CryptoError::DecryptFailed)
        ));
    }
}
