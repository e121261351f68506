//! COSE-Sign1-style signature envelopes.
//!
//! An envelope binds a protected header (the algorithm identifier, carried
//! as its own encoded byte string so the signed bytes are unambiguous) to a
//! payload and a signature. The signature covers a canonical `Signature1`
//! structure over the encoded protected header and the payload, so neither
//! can be swapped after signing.
//!
//! Proof-of-possession messages sign an entity-attestation payload
//! ([`EatPayload`]) carrying the challenge nonce and the device identifier.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::types::{Guid, Nonce16};

use super::CryptoError;
use super::keys::{DeviceCertChain, KeyPair, PublicKey};

/// Signature algorithm identifiers carried in protected headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum SigAlg {
    /// EdDSA (COSE algorithm -8).
    EdDsa,
}

impl From<SigAlg> for i16 {
    fn from(value: SigAlg) -> Self {
        match value {
            SigAlg::EdDsa => -8,
        }
    }
}

impl TryFrom<i16> for SigAlg {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            -8 => Ok(Self::EdDsa),
            other => Err(format!("unknown signature algorithm {other}")),
        }
    }
}

/// Protected header content. Encoded separately and signed as bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    /// Algorithm the signature was produced with.
    pub alg: SigAlg,
}

/// Unprotected header values. Not covered by the signature; carries
/// side-channel material such as the next challenge nonce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprotectedHeader {
    /// Challenge nonce for the peer's next proof, when the step issues one.
    pub nonce: Option<Nonce16>,
    /// Signer's public key, when the peer needs it ahead of chain delivery.
    pub owner_pub_key: Option<PublicKey>,
}

impl UnprotectedHeader {
    /// True when no unprotected values are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonce.is_none() && self.owner_pub_key.is_none()
    }
}

/// A signed envelope: protected header bytes, payload bytes, signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoseSignature {
    /// Encoded [`ProtectedHeader`], kept as bytes so verification signs the
    /// exact transmitted encoding.
    pub protected: Bytes,
    /// Unprotected header values.
    #[serde(default, skip_serializing_if = "UnprotectedHeader::is_empty")]
    pub unprotected: UnprotectedHeader,
    /// Payload bytes (usually an encoded inner message).
    pub payload: Bytes,
    /// Raw signature bytes.
    pub signature: Bytes,
}

/// Canonical to-be-signed structure.
#[derive(Serialize)]
struct SigStructure<'a>(&'a str, &'a [u8], &'a [u8]);

const SIG_CONTEXT: &str = "Signature1";

fn to_be_signed(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    codec::to_vec(&SigStructure(SIG_CONTEXT, protected, payload)).map_err(|err| {
        CryptoError::Malformed {
            reason: format!("signature structure: {err}"),
        }
    })
}

impl CoseSignature {
    /// Signs `payload` with `key`, producing a complete envelope.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`] if the header or signature structure
    /// cannot be encoded.
    pub fn sign(payload: impl Into<Bytes>, key: &KeyPair) -> Result<Self, CryptoError> {
        let payload = payload.into();
        let protected = codec::to_vec(&ProtectedHeader { alg: SigAlg::EdDsa }).map_err(|err| {
            CryptoError::Malformed {
                reason: format!("protected header: {err}"),
            }
        })?;
        let signature = key.sign(&to_be_signed(&protected, &payload)?);
        Ok(Self {
            protected: Bytes::from(protected),
            unprotected: UnprotectedHeader::default(),
            payload,
            signature: Bytes::copy_from_slice(&signature),
        })
    }

    /// Adds unprotected header values to a signed envelope.
    #[must_use]
    pub fn with_unprotected(mut self, unprotected: UnprotectedHeader) -> Self {
        self.unprotected = unprotected;
        self
    }

    /// Parses the protected header, failing on unknown algorithms.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`] for undecodable header bytes.
    pub fn protected_header(&self) -> Result<ProtectedHeader, CryptoError> {
        codec::from_slice(&self.protected).map_err(|err| CryptoError::Malformed {
            reason: format!("protected header: {err}"),
        })
    }

    /// Verifies the envelope under `key`.
    ///
    /// Fails closed: a malformed header, an algorithm other than the one
    /// `key` speaks, or a bad signature are all hard errors.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`], [`CryptoError::Algorithm`], or
    /// [`CryptoError::SignatureInvalid`].
    pub fn verify(&self, key: &PublicKey) -> Result<(), CryptoError> {
        let header = self.protected_header()?;
        match header.alg {
            SigAlg::EdDsa => {}
        }
        key.verify(
            &to_be_signed(&self.protected, &self.payload)?,
            &self.signature,
        )
    }

    /// Verifies the envelope against a device certificate chain: the chain
    /// itself must verify, then the leaf key must verify the signature.
    ///
    /// # Errors
    ///
    /// [`CryptoError::CertChain`] for a broken chain, otherwise as
    /// [`Self::verify`].
    pub fn verify_with_cert_chain(&self, chain: &DeviceCertChain) -> Result<(), CryptoError> {
        let leaf = chain.verify_chain()?;
        self.verify(leaf)
    }

    /// Decodes the payload as a typed message.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Malformed`] when the payload does not decode as `T`.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, CryptoError> {
        codec::from_slice(&self.payload).map_err(|err| CryptoError::Malformed {
            reason: format!("payload: {err}"),
        })
    }
}

/// Entity-attestation payload for proof-of-possession messages: the signer
/// echoes the challenge nonce and names itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EatPayload {
    /// Echoed challenge nonce.
    pub nonce: Nonce16,
    /// Device identifier of the signer.
    pub guid: Guid,
}

impl EatPayload {
    /// Signs this payload into an envelope.
    ///
    /// # Errors
    ///
    /// Propagates envelope encoding failures.
    pub fn sign(&self, key: &KeyPair) -> Result<CoseSignature, CryptoError> {
        let payload = codec::to_vec(self).map_err(|err| CryptoError::Malformed {
            reason: format!("eat payload: {err}"),
        })?;
        CoseSignature::sign(payload, key)
    }
}
