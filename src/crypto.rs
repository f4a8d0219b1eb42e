//! Hybrid envelope encryption binding messages to recipient public keys.
//!
//! Outbound: a fresh secp256k1 key pair (r, R) is generated per message,
//! P = ECDH(r, recipient), SHA-512(P) splits into an AES-256-CBC key and an
//! HMAC-SHA256 key. The plaintext payload carries either the sender's
//! address and a recoverable compact signature, or the anonymous tag.
//!
//! The MAC covers timestamp ‖ iv ‖ ciphertext and deliberately not `cpk_r`;
//! a MAC mismatch is the normal "not addressed to this key" outcome.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::constants::{
    SMSG_ANON_TAG, SMSG_COMPRESS_THRESHOLD, SMSG_MAX_AMSG_BYTES, SMSG_MAX_MSG_BYTES,
    SMSG_PL_HDR_LEN, SMSG_PL_HDR_LEN_ANON,
};
use crate::envelope::{Envelope, EnvelopeHeader};
use crate::error::SmsgError;
use crate::keys::{pubkey_bytes, pubkey_id, recover_compact, sha256, sign_compact, KeyId};

type HmacSha256 = Hmac<Sha256>;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Decrypted message contents and sender identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    pub timestamp: i64,
    /// Sender address in base58check, or `"anon"`.
    pub from: String,
    pub message: Vec<u8>,
    /// Compressed public key recovered from the sender signature.
    pub from_pubkey: Option<[u8; 33]>,
}

/// ECDH shared secret: SHA-256 of the compressed shared point.
fn shared_secret(secret: &SecretKey, public: &PublicKey) -> Result<Zeroizing<[u8; 32]>, SmsgError> {
    let scalar = *secret.to_nonzero_scalar();
    let point = public.to_projective() * scalar;
    if point == ProjectivePoint::IDENTITY {
        return Err(SmsgError::Malformed("degenerate shared point"));
    }
    let encoded = point.to_affine().to_encoded_point(true);
    Ok(Zeroizing::new(sha256(encoded.as_bytes())))
}

/// SHA-512(P) split into the encryption key and the MAC key.
fn derive_keys(secret: &[u8; 32]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hashed: Zeroizing<[u8; 64]> = Zeroizing::new(Sha512::digest(secret).into());
    let mut key_e = Zeroizing::new([0u8; 32]);
    let mut key_m = Zeroizing::new([0u8; 32]);
    key_e.copy_from_slice(&hashed[..32]);
    key_m.copy_from_slice(&hashed[32..]);
    (key_e, key_m)
}

fn aes_encrypt(key: &[u8; 32], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::{BlockEncryptMut, KeyIvInit};
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

fn aes_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, SmsgError> {
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::{BlockDecryptMut, KeyIvInit};
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map(Zeroizing::new)
        .map_err(|_| SmsgError::Malformed("decrypt failed"))
}

fn compute_mac(key_m: &[u8; 32], timestamp: i64, iv: &[u8; 16], ciphertext: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key_m).unwrap();
    mac.update(&timestamp.to_le_bytes());
    mac.update(iv);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

fn verify_mac(
    key_m: &[u8; 32],
    timestamp: i64,
    iv: &[u8; 16],
    ciphertext: &[u8],
    expected: &[u8; 32],
) -> bool {
    let mut mac = HmacSha256::new_from_slice(key_m).unwrap();
    mac.update(&timestamp.to_le_bytes());
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(expected).is_ok()
}

/// Encrypt `message` to `recipient`. With `sender` set, the payload carries
/// the sender's address and a compact signature over SHA-256 of the
/// plaintext; without it the anonymous form is produced.
///
/// Proof of work is left to the caller; `hash` and `nonce` come back zeroed.
pub fn encrypt(
    recipient: &PublicKey,
    sender: Option<(&SecretKey, KeyId)>,
    address_version: u8,
    message: &[u8],
    timestamp: i64,
) -> Result<Envelope, SmsgError> {
    let limit = if sender.is_none() {
        SMSG_MAX_AMSG_BYTES
    } else {
        SMSG_MAX_MSG_BYTES
    };
    if message.len() > limit {
        return Err(SmsgError::TooLong(message.len()));
    }

    let mut header = EnvelopeHeader::new(timestamp);
    OsRng.fill_bytes(&mut header.iv);

    let ephemeral = SecretKey::random(&mut OsRng);
    header.cpk_r = pubkey_bytes(&ephemeral.public_key());

    let shared = shared_secret(&ephemeral, recipient)?;
    let (key_e, key_m) = derive_keys(&shared);

    let data = if message.len() > SMSG_COMPRESS_THRESHOLD {
        lz4_flex::block::compress(message)
    } else {
        message.to_vec()
    };
    let data = Zeroizing::new(data);

    let plain_len = message.len() as u32;
    let mut payload;
    match sender {
        None => {
            payload = Zeroizing::new(Vec::with_capacity(SMSG_PL_HDR_LEN_ANON + data.len()));
            payload.push(SMSG_ANON_TAG);
            // 4 reserved bytes keep the encrypted payload above 8 bytes
            payload.extend_from_slice(&[0u8; 4]);
            payload.extend_from_slice(&plain_len.to_le_bytes());
            payload.extend_from_slice(&data);
        }
        Some((secret, from)) => {
            let signature = sign_compact(secret, &sha256(message))?;
            payload = Zeroizing::new(Vec::with_capacity(SMSG_PL_HDR_LEN + data.len()));
            payload.push(address_version);
            payload.extend_from_slice(&from.0);
            payload.extend_from_slice(&signature);
            payload.extend_from_slice(&plain_len.to_le_bytes());
            payload.extend_from_slice(&data);
        }
    }

    let ciphertext = aes_encrypt(&key_e, &header.iv, &payload);
    header.mac = compute_mac(&key_m, timestamp, &header.iv, &ciphertext);

    Ok(Envelope::new(header, ciphertext))
}

/// Decrypt an envelope with the owner's private key.
///
/// `NotForUs` means the MAC did not verify, the expected result when the
/// message was addressed elsewhere. With `test_only` the payload is left
/// encrypted and `None` is returned on a MAC match.
pub fn decrypt(
    secret: &SecretKey,
    envelope: &Envelope,
    test_only: bool,
    address_version: u8,
) -> Result<Option<MessageData>, SmsgError> {
    let header = &envelope.header;
    if header.version[0] != 2 {
        return Err(SmsgError::Malformed("unknown version"));
    }

    let ephemeral = PublicKey::from_sec1_bytes(&header.cpk_r)
        .map_err(|_| SmsgError::Malformed("invalid ephemeral key"))?;
    let shared = shared_secret(secret, &ephemeral)?;
    let (key_e, key_m) = derive_keys(&shared);

    if !verify_mac(
        &key_m,
        header.timestamp,
        &header.iv,
        &envelope.payload,
        &header.mac,
    ) {
        return Err(SmsgError::NotForUs);
    }

    if test_only {
        return Ok(None);
    }

    let payload = aes_decrypt(&key_e, &header.iv, &envelope.payload)?;
    let anonymous = payload.first() == Some(&SMSG_ANON_TAG);
    let (plain_len, data) = if anonymous {
        if payload.len() < SMSG_PL_HDR_LEN_ANON {
            return Err(SmsgError::Malformed("payload header truncated"));
        }
        let len = u32::from_le_bytes(payload[5..9].try_into().unwrap());
        (len as usize, &payload[SMSG_PL_HDR_LEN_ANON..])
    } else {
        if payload.len() < SMSG_PL_HDR_LEN {
            return Err(SmsgError::Malformed("payload header truncated"));
        }
        let len = u32::from_le_bytes(payload[86..90].try_into().unwrap());
        (len as usize, &payload[SMSG_PL_HDR_LEN..])
    };
    if plain_len > SMSG_MAX_AMSG_BYTES {
        return Err(SmsgError::Malformed("declared length too large"));
    }

    let message = if plain_len > SMSG_COMPRESS_THRESHOLD {
        let out = lz4_flex::block::decompress(data, plain_len)
            .map_err(|_| SmsgError::Malformed("decompress failed"))?;
        if out.len() != plain_len {
            return Err(SmsgError::Malformed("decompressed length mismatch"));
        }
        out
    } else {
        if data.len() < plain_len {
            return Err(SmsgError::Malformed("plaintext truncated"));
        }
        data[..plain_len].to_vec()
    };

    if anonymous {
        return Ok(Some(MessageData {
            timestamp: header.timestamp,
            from: "anon".to_string(),
            message,
            from_pubkey: None,
        }));
    }

    let from = KeyId::from_slice(&payload[1..21])?;
    let signature: [u8; 65] = payload[21..86].try_into().unwrap();
    let recovered = recover_compact(&sha256(&message), &signature)?;
    if pubkey_id(&recovered) != from {
        return Err(SmsgError::SignatureInvalid);
    }

    Ok(Some(MessageData {
        timestamp: header.timestamp,
        from: from.to_address(address_version),
        message,
        from_pubkey: Some(pubkey_bytes(&recovered)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SMSG_ADDRESS_VERSION;

    fn key_pair() -> (SecretKey, KeyId) {
        let secret = SecretKey::random(&mut OsRng);
        let id = pubkey_id(&secret.public_key());
        (secret, id)
    }

    #[test]
    fn signed_round_trip() {
        let (sender, sender_id) = key_pair();
        let (recipient, _) = key_pair();
        let env = encrypt(
            &recipient.public_key(),
            Some((&sender, sender_id)),
            SMSG_ADDRESS_VERSION,
            b"hello",
            1_700_000_000,
        )
        .expect("encrypt");

        let data = decrypt(&recipient, &env, false, SMSG_ADDRESS_VERSION)
            .expect("decrypt")
            .expect("full decrypt");
        assert_eq!(data.message, b"hello");
        assert_eq!(data.from, sender_id.to_address(SMSG_ADDRESS_VERSION));
        assert_eq!(data.timestamp, 1_700_000_000);
        assert!(data.from_pubkey.is_some());
    }

    #[test]
    fn anonymous_round_trip() {
        let (recipient, _) = key_pair();
        let body = vec![b'A'; 200];
        let env = encrypt(
            &recipient.public_key(),
            None,
            SMSG_ADDRESS_VERSION,
            &body,
            1_700_000_000,
        )
        .expect("encrypt");

        let data = decrypt(&recipient, &env, false, SMSG_ADDRESS_VERSION)
            .expect("decrypt")
            .expect("full decrypt");
        assert_eq!(data.from, "anon");
        assert_eq!(data.message, body);
        assert!(data.from_pubkey.is_none());
    }

    #[test]
    fn wrong_recipient_is_not_for_us() {
        let (sender, sender_id) = key_pair();
        let (recipient, _) = key_pair();
        let (other, _) = key_pair();
        let env = encrypt(
            &recipient.public_key(),
            Some((&sender, sender_id)),
            SMSG_ADDRESS_VERSION,
            b"hello",
            1_700_000_000,
        )
        .expect("encrypt");

        assert!(matches!(
            decrypt(&other, &env, false, SMSG_ADDRESS_VERSION),
            Err(SmsgError::NotForUs)
        ));
        assert!(matches!(
            decrypt(&sender, &env, true, SMSG_ADDRESS_VERSION),
            Err(SmsgError::NotForUs)
        ));
    }

    #[test]
    fn test_only_stops_after_mac() {
        let (recipient, _) = key_pair();
        let env = encrypt(
            &recipient.public_key(),
            None,
            SMSG_ADDRESS_VERSION,
            b"short",
            1_700_000_000,
        )
        .expect("encrypt");
        assert_eq!(
            decrypt(&recipient, &env, true, SMSG_ADDRESS_VERSION).expect("test decrypt"),
            None
        );
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let (recipient, _) = key_pair();
        let mut env = encrypt(
            &recipient.public_key(),
            None,
            SMSG_ADDRESS_VERSION,
            b"short",
            1_700_000_000,
        )
        .expect("encrypt");
        env.payload[0] ^= 0x01;
        assert!(matches!(
            decrypt(&recipient, &env, false, SMSG_ADDRESS_VERSION),
            Err(SmsgError::NotForUs)
        ));
    }

    #[test]
    fn large_message_is_compressed() {
        let (sender, sender_id) = key_pair();
        let (recipient, _) = key_pair();
        let body = vec![b'x'; 2000];
        let env = encrypt(
            &recipient.public_key(),
            Some((&sender, sender_id)),
            SMSG_ADDRESS_VERSION,
            &body,
            1_700_000_000,
        )
        .expect("encrypt");
        // repetitive input compresses well under the raw length
        assert!(env.payload.len() < 2000);

        let data = decrypt(&recipient, &env, false, SMSG_ADDRESS_VERSION)
            .expect("decrypt")
            .expect("full decrypt");
        assert_eq!(data.message.len(), 2000);
        assert_eq!(data.message, body);
    }

    #[test]
    fn length_limits_enforced() {
        let (sender, sender_id) = key_pair();
        let (recipient, _) = key_pair();
        let too_long = vec![0u8; SMSG_MAX_MSG_BYTES + 1];
        assert!(matches!(
            encrypt(
                &recipient.public_key(),
                Some((&sender, sender_id)),
                SMSG_ADDRESS_VERSION,
                &too_long,
                0
            ),
            Err(SmsgError::TooLong(_))
        ));
        // the anonymous limit is higher
        assert!(encrypt(&recipient.public_key(), None, SMSG_ADDRESS_VERSION, &too_long, 0).is_ok());
    }

    #[test]
    fn anonymous_tag_marks_payload() {
        let (recipient, _) = key_pair();
        let env = encrypt(
            &recipient.public_key(),
            None,
            SMSG_ADDRESS_VERSION,
            b"tagged",
            7,
        )
        .expect("encrypt");
        let shared = shared_secret(&recipient, &PublicKey::from_sec1_bytes(&env.header.cpk_r).unwrap())
            .expect("ecdh");
        let (key_e, _) = derive_keys(&shared);
        let payload = aes_decrypt(&key_e, &env.header.iv, &env.payload).expect("aes");
        assert_eq!(payload[0], SMSG_ANON_TAG);
    }
}
