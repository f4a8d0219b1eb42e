//! Key identifiers, coin addresses and recoverable compact signatures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::SmsgError;

/// RIPEMD160(SHA256(pubkey)) hash identifying a key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyId(pub [u8; 20]);

impl KeyId {
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SmsgError> {
        let inner: [u8; 20] = bytes
            .try_into()
            .map_err(|_| SmsgError::Malformed("key id length"))?;
        Ok(KeyId(inner))
    }

    /// Base58check address for this key id.
    pub fn to_address(&self, version: u8) -> String {
        let mut data = Vec::with_capacity(21);
        data.push(version);
        data.extend_from_slice(&self.0);
        bs58::encode(data).with_check().into_string()
    }

    /// Parse a base58check address, returning its version byte and key id.
    pub fn from_address(address: &str) -> Result<(u8, Self), SmsgError> {
        let data = bs58::decode(address)
            .with_check(None)
            .into_vec()
            .map_err(|_| SmsgError::InvalidAddress("base58check decode failed"))?;
        if data.len() != 21 {
            return Err(SmsgError::InvalidAddress("payload length"));
        }
        Ok((data[0], KeyId::from_slice(&data[1..])?))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn hash160(data: &[u8]) -> KeyId {
    let sha = Sha256::digest(data);
    KeyId(Ripemd160::digest(sha).into())
}

/// Key id of a public key's compressed encoding.
pub fn pubkey_id(pubkey: &PublicKey) -> KeyId {
    hash160(pubkey.to_encoded_point(true).as_bytes())
}

pub fn pubkey_bytes(pubkey: &PublicKey) -> [u8; 33] {
    pubkey.to_encoded_point(true).as_bytes().try_into().unwrap()
}

/// Sign a 32-byte digest, producing a 65-byte recoverable compact signature.
/// Header byte is 31 + recovery id, marking a compressed public key.
pub fn sign_compact(secret: &SecretKey, digest: &[u8; 32]) -> Result<[u8; 65], SmsgError> {
    let signing = SigningKey::from(secret);
    let (signature, recid) = signing
        .sign_prehash_recoverable(digest)
        .map_err(|_| SmsgError::SignatureInvalid)?;
    let mut out = [0u8; 65];
    out[0] = 27 + 4 + recid.to_byte();
    out[1..].copy_from_slice(&signature.to_bytes());
    Ok(out)
}

/// Recover the signing public key from a compact signature over `digest`.
pub fn recover_compact(digest: &[u8; 32], signature: &[u8; 65]) -> Result<PublicKey, SmsgError> {
    let header = signature[0];
    if !(27..=34).contains(&header) {
        return Err(SmsgError::SignatureInvalid);
    }
    let recid =
        RecoveryId::from_byte((header - 27) & 3).ok_or(SmsgError::SignatureInvalid)?;
    let sig =
        Signature::from_slice(&signature[1..]).map_err(|_| SmsgError::SignatureInvalid)?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recid)
        .map_err(|_| SmsgError::SignatureInvalid)?;
    Ok(key.into())
}

/// Host wallet seam: private keys never leave the host except through this
/// trait, and the engine checks the lock state before every scan.
pub trait KeyStore: Send + Sync {
    fn is_locked(&self) -> bool;
    fn secret_key(&self, id: &KeyId) -> Option<SecretKey>;
    fn public_key(&self, id: &KeyId) -> Option<PublicKey>;
    fn owned_addresses(&self) -> Vec<KeyId>;

    /// First owned address, used for the outbox copy.
    fn default_address(&self) -> Option<KeyId> {
        self.owned_addresses().first().copied()
    }
}

/// In-memory key store, usable as a stand-in wallet.
#[derive(Default)]
pub struct MemoryKeyStore {
    locked: AtomicBool,
    keys: Mutex<BTreeMap<KeyId, SecretKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: SecretKey) -> KeyId {
        let id = pubkey_id(&secret.public_key());
        self.keys.lock().unwrap().insert(id, secret);
        id
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }
}

impl KeyStore for MemoryKeyStore {
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn secret_key(&self, id: &KeyId) -> Option<SecretKey> {
        self.keys.lock().unwrap().get(id).cloned()
    }

    fn public_key(&self, id: &KeyId) -> Option<PublicKey> {
        self.keys
            .lock()
            .unwrap()
            .get(id)
            .map(|secret| secret.public_key())
    }

    fn owned_addresses(&self) -> Vec<KeyId> {
        self.keys.lock().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn address_round_trip() {
        let secret = SecretKey::random(&mut OsRng);
        let id = pubkey_id(&secret.public_key());
        let address = id.to_address(0x38);
        let (version, decoded) = KeyId::from_address(&address).expect("decode");
        assert_eq!(version, 0x38);
        assert_eq!(decoded, id);
    }

    #[test]
    fn bad_address_rejected() {
        assert!(KeyId::from_address("not-an-address").is_err());
        let secret = SecretKey::random(&mut OsRng);
        let mut address = pubkey_id(&secret.public_key()).to_address(0x38);
        address.pop();
        address.push('1');
        assert!(KeyId::from_address(&address).is_err());
    }

    #[test]
    fn compact_signature_recovers_signer() {
        let secret = SecretKey::random(&mut OsRng);
        let digest = sha256(b"message body");
        let signature = sign_compact(&secret, &digest).expect("sign");
        let recovered = recover_compact(&digest, &signature).expect("recover");
        assert_eq!(pubkey_id(&recovered), pubkey_id(&secret.public_key()));
    }

    #[test]
    fn tampered_signature_fails_or_mismatches() {
        let secret = SecretKey::random(&mut OsRng);
        let digest = sha256(b"message body");
        let mut signature = sign_compact(&secret, &digest).expect("sign");
        signature[10] ^= 0xff;
        match recover_compact(&digest, &signature) {
            Err(_) => {}
            Ok(recovered) => {
                assert_ne!(pubkey_id(&recovered), pubkey_id(&secret.public_key()))
            }
        }
    }
}
