//! TO1: the device obtains the owner's redirect from the rendezvous
//! service.
//!
//! `HelloRv30 → HelloRvAck31 (session + nonce) → ProveToRv32 (signed nonce)
//! → RvRedirect33 (stored owner redirect signature)`. The proof at step 32
//! is verified against the device certificate chain committed in the
//! registered voucher, tying live authentication to the chain of custody.

use serde::{Deserialize, Serialize};

use crate::crypto::cose::CoseSignature;
use crate::types::{Guid, Nonce16, SigInfo};

/// TO1 opening message: the device names itself and declares its signature
/// algorithm family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRv30 {
    /// Device identifier; must have a registered owner redirect on file.
    pub guid: Guid,
    /// Device's declared signature algorithm family.
    pub ea_sig_info: SigInfo,
}

/// TO1 acknowledgment: the proof nonce and the echoed algorithm family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRvAck31 {
    /// Nonce the device must sign into its proof at step 32.
    pub nonce_to1_proof: Nonce16,
    /// Echo of the device's declared algorithm family.
    pub eb_sig_info: SigInfo,
}

/// TO1 device proof: a signature envelope over an
/// [`EatPayload`](crate::crypto::cose::EatPayload) echoing
/// [`HelloRvAck31::nonce_to1_proof`].
pub type ProveToRv32 = CoseSignature;

/// TO1 response: the owner's stored redirect signature (`to1d`), exactly as
/// registered during TO0.
pub type RvRedirect33 = CoseSignature;

#[cfg(test)]
mod tests {
    use crate::codec;
    use crate::crypto::cose::EatPayload;
    use crate::crypto::keys::{DeviceCertChain, KeyPair};

    use super::*;

    #[test]
    fn hello_roundtrip() {
        let hello = HelloRv30 {
            guid: Guid::random(),
            ea_sig_info: SigInfo::ed25519(),
        };
        let bytes = codec::to_vec(&hello).unwrap();
        let back: HelloRv30 = codec::from_slice(&bytes).unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn prove_to_rv_signs_issued_nonce() {
        let root = KeyPair::generate();
        let device = KeyPair::generate();
        let chain = DeviceCertChain::issue(&[&root, &device]).unwrap();
        let ack = HelloRvAck31 {
            nonce_to1_proof: Nonce16::random(),
            eb_sig_info: SigInfo::ed25519(),
        };

        let proof: ProveToRv32 = EatPayload {
            nonce: ack.nonce_to1_proof,
            guid: Guid::random(),
        }
        .sign(&device)
        .unwrap();

        proof.verify_with_cert_chain(&chain).expect("verify");
        let payload: EatPayload = proof.decode_payload().unwrap();
        assert!(payload.nonce.ct_eq(&ack.nonce_to1_proof));
    }
}
