//! Peer-to-peer encrypted store-and-forward messaging for cryptocurrency
//! nodes.
//!
//! Messages are opaque ciphertext envelopes grouped into hourly buckets,
//! flood-gossiped between peers with an anti-flood pull protocol, guarded
//! by a small proof of work, and decrypted by whichever node holds the
//! recipient key. The host node supplies its wallet, database and P2P
//! transport through traits; everything else lives behind one
//! [`SmsgEngine`] handle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use smsg_rs::{
//!     unix_now, EngineOptions, InMemoryDb, MemoryKeyStore, NetworkAdapter, PeerId, SmsgEngine,
//!     SyncMessage,
//! };
//!
//! struct Transport;
//! impl NetworkAdapter for Transport {
//!     fn push_message(&self, _peer: PeerId, _message: &SyncMessage) {}
//!     fn misbehaving(&self, _peer: PeerId, _score: u32) {}
//! }
//!
//! let wallet = Arc::new(MemoryKeyStore::new());
//! let engine = SmsgEngine::new(
//!     EngineOptions::new("/tmp/smsg-demo"),
//!     wallet,
//!     Box::new(InMemoryDb::new()),
//!     Arc::new(Transport),
//! );
//! engine.start(unix_now()).unwrap();
//! engine.stop();
//! ```

mod constants;
mod crypto;
mod db;
mod engine;
mod envelope;
mod error;
mod keys;
mod pow;
mod registry;
mod store;
mod sync;

pub use constants::*;
pub use crypto::{decrypt, encrypt, MessageData};
pub use db::{message_key, pubkey_key, InMemoryDb, MsgDb, StoredMessage, DB_INBOX, DB_OUTBOX, DB_PUBKEY, DB_QUEUE};
pub use engine::{unix_now, EngineOptions, NetworkAdapter, ScanOutcome, SmsgEngine};
pub use envelope::{Envelope, EnvelopeHeader};
pub use error::SmsgError;
pub use keys::{
    hash160, pubkey_bytes, pubkey_id, recover_compact, sha256, sign_compact, KeyId, KeyStore,
    MemoryKeyStore,
};
pub use pow::{envelope_digest, solve, validate};
pub use registry::{
    harvest_block, AddressBook, HarvestStats, ScannedBlock, ScannedTx, SmsgAddress, SmsgOptions,
    TxInput,
};
pub use store::{Bucket, BucketStore, Token};
pub use sync::{
    InvEntry, PeerId, PeerSyncState, SyncMessage, CMD_DISABLED, CMD_HAVE, CMD_IGNORE, CMD_INV,
    CMD_MATCH, CMD_MSG, CMD_PING, CMD_PONG, CMD_SHOW, CMD_WANT,
};
