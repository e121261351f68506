//! Outbound fault injectors.
//!
//! Each helper takes the bytes or structure the protocol state machine
//! legitimately produced and returns a corrupted copy that is guaranteed
//! to differ from the input. Injection happens strictly after protocol
//! computation; callers transmit the corrupted copy and persist the
//! untouched session, so a fault is observable only on the wire.

use bytes::Bytes;
use rand::Rng;
use rand::rngs::OsRng;

use crate::crypto::cose::CoseSignature;
use crate::types::Nonce16;

/// Corrupts an encoded buffer so it no longer decodes as its message.
///
/// Picks one of: truncate, prepend a break byte, append trailing garbage.
/// Each guarantees a conformant decoder rejects the result (truncation and
/// the break byte are malformed, trailing bytes are over-long), and each
/// guarantees the result differs from the input.
#[must_use]
pub fn fuzz_cbor_bytes(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return vec![0xff];
    }
    let mut out = input.to_vec();
    match OsRng.gen_range(0..3u8) {
        0 => {
            out.truncate(OsRng.gen_range(0..out.len()));
        }
        1 => {
            // 0xff is the break code, invalid at the start of an item.
            out.insert(0, 0xff);
        }
        _ => {
            out.push(OsRng.gen::<u8>());
        }
    }
    out
}

/// Flips one signature bit in a signed envelope. Structure and payload
/// stay intact, so decoding succeeds and verification fails.
#[must_use]
pub fn fuzz_cose_signature(envelope: &CoseSignature) -> CoseSignature {
    let mut out = envelope.clone();
    let mut sig = out.signature.to_vec();
    if sig.is_empty() {
        sig.push(0xff);
    } else {
        let idx = OsRng.gen_range(0..sig.len());
        sig[idx] ^= 1 << OsRng.gen_range(0..8u8);
    }
    out.signature = Bytes::from(sig);
    out
}

/// Flips one bit of a nonce.
#[must_use]
pub fn fuzz_nonce(nonce: &Nonce16) -> Nonce16 {
    let mut bytes = *nonce.as_bytes();
    let idx = OsRng.gen_range(0..bytes.len());
    bytes[idx] ^= 1 << OsRng.gen_range(0..8u8);
    Nonce16(bytes)
}
