//! Key-value persistence seam for the inbox, outbox, send queue and the
//! learned-pubkey map. The host brings its own database; `InMemoryDb` is
//! the reference implementation.
//!
//! Key layout: a two-byte prefix (`im` inbox, `sm` outbox, `qm` send
//! queue, `pk` pubkeys) followed by timestamp ‖ sample for messages or the
//! 20-byte key id for pubkeys. Prefix scans iterate in key order, which for
//! messages means oldest first.

use std::collections::BTreeMap;

use crate::error::SmsgError;
use crate::keys::KeyId;

pub const DB_INBOX: [u8; 2] = *b"im";
pub const DB_OUTBOX: [u8; 2] = *b"sm";
pub const DB_QUEUE: [u8; 2] = *b"qm";
pub const DB_PUBKEY: [u8; 2] = *b"pk";

/// Message key: prefix ‖ timestamp ‖ first 8 payload bytes.
pub fn message_key(prefix: [u8; 2], timestamp: i64, sample: &[u8; 8]) -> [u8; 18] {
    let mut key = [0u8; 18];
    key[0..2].copy_from_slice(&prefix);
    key[2..10].copy_from_slice(&timestamp.to_le_bytes());
    key[10..18].copy_from_slice(sample);
    key
}

pub fn pubkey_key(id: &KeyId) -> [u8; 22] {
    let mut key = [0u8; 22];
    key[0..2].copy_from_slice(&DB_PUBKEY);
    key[2..22].copy_from_slice(&id.0);
    key
}

pub trait MsgDb: Send {
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<(), SmsgError>;
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmsgError>;
    fn erase(&mut self, key: &[u8]) -> Result<(), SmsgError>;
    fn exists(&self, key: &[u8]) -> Result<bool, SmsgError> {
        Ok(self.read(key)?.is_some())
    }
    /// All pairs under `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmsgError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDb {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MsgDb for InMemoryDb {
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<(), SmsgError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmsgError> {
        Ok(self.entries.get(key).cloned())
    }

    fn erase(&mut self, key: &[u8]) -> Result<(), SmsgError> {
        self.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SmsgError> {
        Ok(self
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// A queued, sent or received message as persisted in the database:
/// bookkeeping fields plus the full serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub time_received: i64,
    pub status: u8,
    pub addr_to: KeyId,
    /// Address the outbox copy was encrypted to; null outside the outbox.
    pub addr_outbox: KeyId,
    pub message: Vec<u8>,
}

impl StoredMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(49 + self.message.len());
        out.extend_from_slice(&self.time_received.to_le_bytes());
        out.push(self.status);
        out.extend_from_slice(&self.addr_to.0);
        out.extend_from_slice(&self.addr_outbox.0);
        out.extend_from_slice(&self.message);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SmsgError> {
        if bytes.len() < 49 {
            return Err(SmsgError::Malformed("stored message truncated"));
        }
        Ok(Self {
            time_received: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            status: bytes[8],
            addr_to: KeyId::from_slice(&bytes[9..29])?,
            addr_outbox: KeyId::from_slice(&bytes[29..49])?,
            message: bytes[49..].to_vec(),
        })
    }
}
