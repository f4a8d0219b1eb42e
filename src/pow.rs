//! Proof of work over the envelope header and payload.
//!
//! The digest is HMAC-SHA256 keyed with the 4-byte nonce replicated to 32
//! bytes, over header bytes 4..104 followed by the ciphertext. A digest
//! meets the target when its last two bytes and the three low bits of byte
//! 29 are all zero. The header checksum is the first 4 digest bytes.

use std::sync::atomic::{AtomicBool, Ordering};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::constants::{SMSG_HDR_LEN, SMSG_MAX_MSG_WORST};
use crate::envelope::Envelope;
use crate::error::SmsgError;

type HmacSha256 = Hmac<Sha256>;

fn digest(header: &[u8; SMSG_HDR_LEN], payload: &[u8], nonce: [u8; 4]) -> [u8; 32] {
    let mut key = [0u8; 32];
    for chunk in key.chunks_exact_mut(4) {
        chunk.copy_from_slice(&nonce);
    }
    let mut mac = HmacSha256::new_from_slice(&key).unwrap();
    mac.update(&header[4..]);
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

fn meets_target(digest: &[u8; 32]) -> bool {
    digest[31] == 0 && digest[30] == 0 && digest[29] & 0b0000_0111 == 0
}

/// Digest for the envelope's declared nonce.
pub fn envelope_digest(envelope: &Envelope) -> [u8; 32] {
    let header = envelope.header.encode();
    digest(&header, &envelope.payload, envelope.header.nonce)
}

/// Search nonces from zero until the digest meets the target, then write the
/// nonce and checksum into the envelope.
///
/// Polls `enabled` inside the loop; a clear flag aborts with `Cancelled` so
/// the caller can leave the message queued for the next start.
pub fn solve(envelope: &mut Envelope, enabled: &AtomicBool) -> Result<(), SmsgError> {
    let mut header = envelope.header.encode();
    let mut nonce: u32 = 0;
    loop {
        if !enabled.load(Ordering::Relaxed) {
            return Err(SmsgError::Cancelled);
        }

        let nonce_bytes = nonce.to_le_bytes();
        header[96..100].copy_from_slice(&nonce_bytes);
        let d = digest(&header, &envelope.payload, nonce_bytes);
        if meets_target(&d) {
            envelope.header.nonce = nonce_bytes;
            envelope.header.hash.copy_from_slice(&d[..4]);
            return Ok(());
        }

        if nonce == u32::MAX {
            return Err(SmsgError::PowFailed);
        }
        nonce += 1;
    }
}

/// Recompute the digest for the envelope's declared nonce and check version,
/// size, checksum and target. Checks run on bytes alone; no keys involved.
pub fn validate(envelope: &Envelope) -> Result<(), SmsgError> {
    if envelope.header.version[0] != 2 {
        return Err(SmsgError::Malformed("unknown version"));
    }
    if envelope.payload.len() > SMSG_MAX_MSG_WORST {
        return Err(SmsgError::Malformed("payload too large"));
    }

    let header = envelope.header.encode();
    let d = digest(&header, &envelope.payload, envelope.header.nonce);

    if !bool::from(envelope.header.hash.ct_eq(&d[..4])) {
        return Err(SmsgError::ChecksumMismatch);
    }
    if !meets_target(&d) {
        return Err(SmsgError::PowFailed);
    }
    Ok(())
}
