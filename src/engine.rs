//! The owning engine handle.
//!
//! One `SmsgEngine` is created by the host at startup and carries every
//! process-wide piece: the enablement flag, the bucket store, the address
//! whitelist, the peer table and the background threads (bucket sweeper and
//! proof-of-work worker). The host's wallet, database and P2P transport
//! arrive as trait objects.
//!
//! Lock order, outermost first: bucket store, database, peer table. A later
//! lock is never held while acquiring an earlier one, and the bucket lock
//! is released before proof-of-work solving and before message scans.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::constants::{
    SMSG_ADDRESS_VERSION, SMSG_BUCKET_LEN, SMSG_BUNCH_MAX_BYTES, SMSG_BUNCH_MAX_MESSAGES,
    SMSG_HDR_LEN, SMSG_MASK_UNREAD, SMSG_MAX_MSG_WORST, SMSG_RETENTION, SMSG_SEND_DELAY,
    SMSG_THREAD_DELAY, SMSG_THREAD_LOG_GAP, SMSG_TIME_IGNORE, SMSG_TIME_LEEWAY,
};
use crate::crypto::{self, MessageData};
use crate::db::{message_key, pubkey_key, MsgDb, StoredMessage, DB_INBOX, DB_OUTBOX, DB_QUEUE};
use crate::envelope::{Envelope, EnvelopeHeader};
use crate::error::SmsgError;
use crate::keys::{hash160, pubkey_bytes, KeyId, KeyStore};
use crate::pow;
use crate::registry::{harvest_block, AddressBook, HarvestStats, ScannedBlock, SmsgAddress};
use crate::store::{BucketStore, Token};
use crate::sync::{InvEntry, PeerId, PeerSyncState, SyncMessage};

/// Host transport seam. `push_message` hands an outbound protocol message
/// to the peer's connection; `misbehaving` feeds the host's peer scoring;
/// `update_local_services` toggles the messaging service bit advertised to
/// the network.
pub trait NetworkAdapter: Send + Sync {
    fn push_message(&self, peer: PeerId, message: &SyncMessage);
    fn misbehaving(&self, peer: PeerId, score: u32);
    fn update_local_services(&self, _smsg_enabled: bool) {}
}

#[derive(Clone)]
pub struct EngineOptions {
    pub data_dir: PathBuf,
    pub address_version: u8,
    /// Shell command run in a detached thread when an inbox entry lands;
    /// `%s` is replaced with the receiving address.
    pub notify_command: Option<String>,
    pub bucket_len: i64,
    pub retention: i64,
    pub send_delay: i64,
    pub time_leeway: i64,
    pub time_ignore: i64,
    pub thread_delay: Duration,
    /// Spawn the sweeper and proof-of-work threads on start. Hosts that
    /// drive `sweep_tick`/`pow_tick` themselves turn this off.
    pub run_background_threads: bool,
}

impl EngineOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            address_version: SMSG_ADDRESS_VERSION,
            notify_command: None,
            bucket_len: SMSG_BUCKET_LEN,
            retention: SMSG_RETENTION,
            send_delay: SMSG_SEND_DELAY,
            time_leeway: SMSG_TIME_LEEWAY,
            time_ignore: SMSG_TIME_IGNORE,
            thread_delay: Duration::from_secs(SMSG_THREAD_DELAY),
            run_background_threads: true,
        }
    }

    fn store_dir(&self) -> PathBuf {
        self.data_dir.join("smsgstore")
    }

    fn ini_path(&self) -> PathBuf {
        self.data_dir.join("smsg.ini")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Saved to the inbox for this owned address.
    Delivered(KeyId),
    /// Wallet locked; a copy went to the bucket's `_wl` file.
    Deferred,
    NotOurs,
}

type InboxHook = Box<dyn Fn(&StoredMessage) + Send + Sync>;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct SmsgEngine {
    options: Arc<EngineOptions>,
    enabled: Arc<AtomicBool>,
    store: Arc<Mutex<BucketStore>>,
    db: Arc<Mutex<Box<dyn MsgDb>>>,
    registry: Arc<Mutex<AddressBook>>,
    peers: Arc<Mutex<HashMap<PeerId, PeerSyncState>>>,
    wallet: Arc<dyn KeyStore>,
    adapter: Arc<dyn NetworkAdapter>,
    inbox_hook: Arc<Mutex<Option<InboxHook>>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SmsgEngine {
    pub fn new(
        options: EngineOptions,
        wallet: Arc<dyn KeyStore>,
        db: Box<dyn MsgDb>,
        adapter: Arc<dyn NetworkAdapter>,
    ) -> Self {
        let store = BucketStore::with_timing(
            options.store_dir(),
            options.bucket_len,
            options.retention,
            options.time_leeway,
        );
        let registry = AddressBook::new(options.address_version);
        Self {
            options: Arc::new(options),
            enabled: Arc::new(AtomicBool::new(false)),
            store: Arc::new(Mutex::new(store)),
            db: Arc::new(Mutex::new(db)),
            registry: Arc::new(Mutex::new(registry)),
            peers: Arc::new(Mutex::new(HashMap::new())),
            wallet,
            adapter,
            inbox_hook: Arc::new(Mutex::new(None)),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_inbox_hook(&self, hook: impl Fn(&StoredMessage) + Send + Sync + 'static) {
        *self.inbox_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Bring the engine up: load addresses and the bucket set, advertise
    /// the service bit and spawn the background threads.
    pub fn start(&self, now: i64) -> Result<(), SmsgError> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            warn!("Secure messaging is already enabled.");
            return Ok(());
        }
        info!("Secure messaging starting.");
        self.adapter.update_local_services(true);

        {
            let mut registry = self.registry.lock().unwrap();
            match registry.read_ini(&self.options.ini_path()) {
                Ok(()) => info!("Loaded addresses from smsg.ini."),
                Err(err) => warn!("Failed to read smsg.ini: {err}."),
            }
            if registry.addresses.is_empty() {
                registry.add_wallet_addresses(self.wallet.as_ref());
                info!("Loaded addresses from wallet.");
            }
        }

        self.store.lock().unwrap().load(now)?;
        if self.options.run_background_threads {
            self.spawn_threads();
        }
        Ok(())
    }

    /// Shut down: persist the address config, tell peers, clear the
    /// service bit and join the threads. The proof-of-work worker leaves
    /// any in-flight queue entry for the next start.
    pub fn stop(&self) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        info!("Stopping secure messaging.");
        if let Err(err) = self
            .registry
            .lock()
            .unwrap()
            .write_ini(&self.options.ini_path())
        {
            warn!("Failed to save smsg.ini: {err}.");
        }

        {
            let mut peers = self.peers.lock().unwrap();
            for (peer_id, peer) in peers.iter_mut() {
                if peer.enabled {
                    self.adapter.push_message(*peer_id, &SyncMessage::Disabled);
                    peer.enabled = false;
                }
            }
        }

        self.enabled.store(false, Ordering::SeqCst);
        self.adapter.update_local_services(false);

        let handles: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn spawn_threads(&self) {
        let sweeper = {
            let engine = self.clone();
            thread::spawn(move || {
                let mut loops: u32 = 0;
                while engine.enabled.load(Ordering::SeqCst) {
                    loops += 1;
                    let now = unix_now();
                    if loops % SMSG_THREAD_LOG_GAP == 0 {
                        info!("Bucket sweep at {now}.");
                    }
                    engine.sweep_tick(now);
                    sleep_while_enabled(&engine.enabled, engine.options.thread_delay);
                }
            })
        };
        let pow_worker = {
            let engine = self.clone();
            thread::spawn(move || {
                while engine.enabled.load(Ordering::SeqCst) {
                    match engine.pow_tick(unix_now()) {
                        Err(SmsgError::Cancelled) => break,
                        Err(err) => warn!("Proof of work worker: {err}."),
                        Ok(_) => {}
                    }
                    sleep_while_enabled(&engine.enabled, Duration::from_secs(2));
                }
            })
        };
        self.threads.lock().unwrap().extend([sweeper, pow_worker]);
    }

    // ── sweeper ─────────────────────────────────────────────────────────

    /// One sweeper iteration with an explicit clock: expire buckets, tick
    /// pull locks, report lazy peers. Also driven directly by tests.
    pub fn sweep_tick(&self, now: i64) {
        let timed_out = self.store.lock().unwrap().expire(now);
        // bucket lock released before peers are notified
        for (slot, peer_id) in timed_out {
            let until = now + self.options.time_ignore;
            debug!("Lock on bucket {slot} for peer {peer_id} timed out.");
            self.peers
                .lock()
                .unwrap()
                .entry(peer_id)
                .or_default()
                .ignore_until = until;
            self.adapter
                .push_message(peer_id, &SyncMessage::Ignore { until });
            debug!("This node will ignore peer {peer_id} until {until}.");
        }
    }

    // ── proof-of-work worker ────────────────────────────────────────────

    /// Drain the send queue once: solve, delete the entry, store, attempt
    /// self-delivery. `Cancelled` leaves the current entry queued.
    pub fn pow_tick(&self, now: i64) -> Result<u32, SmsgError> {
        let mut processed = 0;
        loop {
            let entry = {
                let db = self.db.lock().unwrap();
                db.scan_prefix(&DB_QUEUE)?.into_iter().next()
            };
            let Some((key, value)) = entry else {
                break;
            };

            // solve without holding any lock, it can take a while
            let mut envelope = match StoredMessage::decode(&value)
                .and_then(|stored| Envelope::decode(&stored.message))
            {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("Dropping malformed send queue entry: {err}.");
                    self.db.lock().unwrap().erase(&key)?;
                    continue;
                }
            };
            match pow::solve(&mut envelope, &self.enabled) {
                Ok(()) => {}
                Err(SmsgError::Cancelled) => return Err(SmsgError::Cancelled),
                Err(err) => {
                    warn!("Could not get proof of work hash, message removed: {err}.");
                    self.db.lock().unwrap().erase(&key)?;
                    continue;
                }
            }

            self.db.lock().unwrap().erase(&key)?;

            if let Err(err) = self.store.lock().unwrap().insert(&envelope, true, now) {
                warn!("Could not place message in buckets, message removed: {err}.");
                continue;
            }

            // the message may have been sent to this node
            let _ = self.scan_message(&envelope, now, true);
            processed += 1;
        }
        Ok(processed)
    }

    // ── send path ───────────────────────────────────────────────────────

    /// Encrypt `message` to `to` and queue it for the proof-of-work
    /// worker, plus an outbox copy encrypted to an owned address. `from`
    /// absent sends the anonymous form.
    pub fn send(
        &self,
        from: Option<KeyId>,
        to: KeyId,
        message: &[u8],
        now: i64,
    ) -> Result<(), SmsgError> {
        if self.wallet.is_locked() {
            return Err(SmsgError::WalletLocked);
        }

        let envelope = self.encrypt_message(from, to, message, now)?;
        let sample = envelope.sample()?;
        let stored = StoredMessage {
            time_received: now,
            status: 0,
            addr_to: to,
            addr_outbox: KeyId::default(),
            message: envelope.encode(),
        };
        self.db.lock().unwrap().write(
            &message_key(DB_QUEUE, envelope.header.timestamp, &sample),
            &stored.encode(),
        )?;
        debug!("Secure message queued for sending.");

        // the outbox copy is readable by the sender later; without it only
        // the recipient could ever decrypt the message again
        match self.wallet.default_address() {
            None => warn!("Could not find an address to encrypt outbox message with."),
            Some(outbox_addr) => match self.encrypt_message(from, outbox_addr, message, now) {
                Err(err) => warn!("Encrypt for outbox failed: {err}."),
                Ok(outbox_env) => {
                    let sample = outbox_env.sample()?;
                    let stored = StoredMessage {
                        time_received: now,
                        status: 0,
                        addr_to: to,
                        addr_outbox: outbox_addr,
                        message: outbox_env.encode(),
                    };
                    self.db.lock().unwrap().write(
                        &message_key(DB_OUTBOX, outbox_env.header.timestamp, &sample),
                        &stored.encode(),
                    )?;
                }
            },
        }
        Ok(())
    }

    fn encrypt_message(
        &self,
        from: Option<KeyId>,
        to: KeyId,
        message: &[u8],
        now: i64,
    ) -> Result<Envelope, SmsgError> {
        let recipient = self.recipient_pubkey(&to)?;
        match from {
            None => crypto::encrypt(
                &recipient,
                None,
                self.options.address_version,
                message,
                now,
            ),
            Some(id) => {
                let secret = self
                    .wallet
                    .secret_key(&id)
                    .ok_or(SmsgError::SenderKeyUnavailable)?;
                crypto::encrypt(
                    &recipient,
                    Some((&secret, id)),
                    self.options.address_version,
                    message,
                    now,
                )
            }
        }
    }

    /// Recipient public key from the learned map first, the wallet second
    /// (an outbox copy goes to an owned address).
    fn recipient_pubkey(&self, id: &KeyId) -> Result<k256::PublicKey, SmsgError> {
        let learned = self.db.lock().unwrap().read(&pubkey_key(id))?;
        if let Some(bytes) = learned {
            return k256::PublicKey::from_sec1_bytes(&bytes)
                .map_err(|_| SmsgError::RecipientKeyUnavailable);
        }
        self.wallet
            .public_key(id)
            .ok_or(SmsgError::RecipientKeyUnavailable)
    }

    /// Decrypt an envelope with an owned address, learning the sender's
    /// public key on a full decrypt.
    pub fn decrypt_message(
        &self,
        address: &KeyId,
        envelope: &Envelope,
        test_only: bool,
    ) -> Result<Option<MessageData>, SmsgError> {
        let secret = self
            .wallet
            .secret_key(address)
            .ok_or(SmsgError::UnknownRecipient)?;
        let data = crypto::decrypt(&secret, envelope, test_only, self.options.address_version)?;
        if let Some(data) = &data {
            if let Some(pubkey) = data.from_pubkey {
                match self.insert_pubkey(hash160(&pubkey), pubkey) {
                    Ok(true) => debug!("Sender public key added to db."),
                    Ok(false) => debug!("Sender public key already in db."),
                    Err(err) => warn!("Error adding sender public key to db: {err}."),
                }
            }
        }
        Ok(data)
    }

    // ── scan/dispatch pipeline ──────────────────────────────────────────

    /// Check whether a validated envelope belongs to this node and save it
    /// to the inbox. With the wallet locked a copy is written for a later
    /// rescan instead. `report` gates the inbox notifications.
    pub fn scan_message(
        &self,
        envelope: &Envelope,
        now: i64,
        report: bool,
    ) -> Result<ScanOutcome, SmsgError> {
        if self.wallet.is_locked() {
            debug!("Wallet is locked, storing message to scan later.");
            self.store.lock().unwrap().store_unscanned(envelope, now)?;
            return Ok(ScanOutcome::Deferred);
        }

        let addresses: Vec<SmsgAddress> = self.registry.lock().unwrap().addresses.clone();
        let mut matched = None;
        for entry in addresses.iter().filter(|entry| entry.receive) {
            if entry.receive_anon {
                // a MAC match is enough, any sender is accepted
                if matches!(
                    self.decrypt_message(&entry.address, envelope, true),
                    Ok(None)
                ) {
                    matched = Some(entry.address);
                    break;
                }
            } else {
                // full decrypt to see the sender; anonymous mail not taken
                if let Ok(Some(data)) = self.decrypt_message(&entry.address, envelope, false) {
                    if data.from != "anon" {
                        matched = Some(entry.address);
                        break;
                    }
                }
            }
        }
        let Some(addr_to) = matched else {
            return Ok(ScanOutcome::NotOurs);
        };

        let sample = envelope.sample()?;
        let key = message_key(DB_INBOX, envelope.header.timestamp, &sample);
        let stored = StoredMessage {
            time_received: now,
            status: SMSG_MASK_UNREAD,
            addr_to,
            addr_outbox: KeyId::default(),
            message: envelope.encode(),
        };

        let is_new = {
            let mut db = self.db.lock().unwrap();
            if db.exists(&key)? {
                debug!("Message already exists in inbox db.");
                false
            } else {
                db.write(&key, &stored.encode())?;
                true
            }
        };

        if is_new {
            info!("Message saved to inbox, received with {addr_to}.");
            if report {
                if let Some(hook) = self.inbox_hook.lock().unwrap().as_ref() {
                    hook(&stored);
                }
                self.run_notify_command(&addr_to);
            }
        }
        Ok(ScanOutcome::Delivered(addr_to))
    }

    fn run_notify_command(&self, address: &KeyId) {
        let Some(template) = self.options.notify_command.clone() else {
            return;
        };
        let command = template.replace("%s", &address.to_address(self.options.address_version));
        // thread runs free
        thread::spawn(move || {
            if let Err(err) = Command::new("sh").arg("-c").arg(&command).status() {
                warn!("Notify command failed: {err}.");
            }
        });
    }

    /// Scan messages received while the wallet was locked and delete the
    /// `_wl` files. No inbox notifications fire for these.
    pub fn wallet_unlocked(&self, now: i64) -> Result<u32, SmsgError> {
        if self.wallet.is_locked() {
            return Err(SmsgError::WalletLocked);
        }
        info!("Scanning messages received while the wallet was locked.");

        let files = self.store.lock().unwrap().unscanned_files(now)?;
        let mut found = 0;
        for (_, path) in files {
            for envelope in BucketStore::read_file(&path)? {
                if pow::validate(&envelope).is_err() {
                    continue;
                }
                if let Ok(ScanOutcome::Delivered(_)) = self.scan_message(&envelope, now, false) {
                    found += 1;
                }
            }
            if let Err(err) = fs::remove_file(&path) {
                warn!("Error removing wl file {}: {err}.", path.display());
            }
        }
        Ok(found)
    }

    // ── pubkey registry ─────────────────────────────────────────────────

    /// Store a learned public key. Returns whether it was new; an existing
    /// conflicting entry is kept and logged.
    pub fn insert_pubkey(&self, id: KeyId, pubkey: [u8; 33]) -> Result<bool, SmsgError> {
        let mut db = self.db.lock().unwrap();
        if let Some(existing) = db.read(&pubkey_key(&id))? {
            if existing != pubkey {
                warn!("DB already contains a different public key for {id}.");
            }
            return Ok(false);
        }
        db.write(&pubkey_key(&id), &pubkey)?;
        Ok(true)
    }

    pub fn stored_pubkey(&self, id: &KeyId) -> Result<Option<[u8; 33]>, SmsgError> {
        let db = self.db.lock().unwrap();
        Ok(db
            .read(&pubkey_key(id))?
            .and_then(|bytes| bytes.as_slice().try_into().ok()))
    }

    /// Register a counterparty address with its base58 public key, after
    /// verifying that the key hashes to the address.
    pub fn add_address(&self, address: &str, pubkey_b58: &str) -> Result<(), SmsgError> {
        let (_, id) = KeyId::from_address(address)?;
        let bytes = bs58::decode(pubkey_b58)
            .into_vec()
            .map_err(|_| SmsgError::InvalidAddress("base58 pubkey"))?;
        let pubkey: [u8; 33] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SmsgError::InvalidAddress("pubkey length"))?;
        k256::PublicKey::from_sec1_bytes(&pubkey)
            .map_err(|_| SmsgError::InvalidAddress("not a valid public key"))?;
        if hash160(&pubkey) != id {
            return Err(SmsgError::InvalidAddress(
                "public key does not hash to address",
            ));
        }
        self.insert_pubkey(id, pubkey)?;
        Ok(())
    }

    /// Base58 public key of an owned address.
    pub fn local_public_key(&self, address: &str) -> Result<String, SmsgError> {
        let (_, id) = KeyId::from_address(address)?;
        let pubkey = self
            .wallet
            .public_key(&id)
            .ok_or(SmsgError::UnknownRecipient)?;
        Ok(bs58::encode(pubkey_bytes(&pubkey)).into_string())
    }

    /// Harvest learned pubkeys from one incoming block, when enabled.
    pub fn scan_block(&self, block: &ScannedBlock) -> HarvestStats {
        if !self.registry.lock().unwrap().options.scan_incoming {
            return HarvestStats::default();
        }
        let stats = self.harvest(block);
        debug!(
            "Found {} transactions, {} new public keys, {} duplicates.",
            stats.transactions, stats.pubkeys, stats.duplicates
        );
        stats
    }

    /// Whole-chain pass over host-provided blocks, oldest first.
    pub fn scan_chain<'a>(&self, blocks: impl IntoIterator<Item = &'a ScannedBlock>) -> HarvestStats {
        info!("Scanning block chain for public keys.");
        let mut total = HarvestStats::default();
        for block in blocks {
            let stats = self.harvest(block);
            total.transactions += stats.transactions;
            total.pubkeys += stats.pubkeys;
            total.duplicates += stats.duplicates;
        }
        info!(
            "Found {} public keys, {} duplicates.",
            total.pubkeys, total.duplicates
        );
        total
    }

    fn harvest(&self, block: &ScannedBlock) -> HarvestStats {
        harvest_block(block, |id, pubkey| {
            self.insert_pubkey(id, pubkey).unwrap_or(false)
        })
    }

    // ── address whitelist ───────────────────────────────────────────────

    pub fn local_addresses(&self) -> Vec<SmsgAddress> {
        self.registry.lock().unwrap().addresses.clone()
    }

    /// Add or update an owned address's receive gates.
    pub fn enable_address(&self, address: KeyId, receive: bool, receive_anon: bool) {
        let mut registry = self.registry.lock().unwrap();
        match registry
            .addresses
            .iter_mut()
            .find(|entry| entry.address == address)
        {
            Some(entry) => {
                entry.receive = receive;
                entry.receive_anon = receive_anon;
            }
            None => registry.addresses.push(SmsgAddress {
                address,
                receive,
                receive_anon,
            }),
        }
    }

    /// Wallet key add/remove notification.
    pub fn wallet_key_changed(&self, address: KeyId, added: bool) {
        self.registry.lock().unwrap().key_changed(address, added);
    }

    // ── peer table ──────────────────────────────────────────────────────

    pub fn peer_connected(&self, peer: PeerId) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer, PeerSyncState::default());
    }

    pub fn peer_disconnected(&self, peer: PeerId) {
        self.peers.lock().unwrap().remove(&peer);
    }

    pub fn peer_state(&self, peer: PeerId) -> Option<PeerSyncState> {
        self.peers.lock().unwrap().get(&peer).copied()
    }

    // ── outbound protocol ───────────────────────────────────────────────

    /// One outbound round for a peer: the initial ping on first contact,
    /// afterwards an inventory of changed buckets, throttled by the send
    /// delay and gated by any ignore window.
    pub fn send_data(&self, peer_id: PeerId, now: i64) -> Result<(), SmsgError> {
        enum Action {
            Ping,
            Inv { last_matched: i64 },
            Skip,
        }

        let action = {
            let mut peers = self.peers.lock().unwrap();
            let peer = peers.entry(peer_id).or_default();
            if peer.last_seen == 0 {
                debug!("New peer {peer_id}, sending ping.");
                peer.last_seen = now;
                Action::Ping
            } else if !peer.enabled
                || now - peer.last_seen < self.options.send_delay
                || now < peer.ignore_until
            {
                Action::Skip
            } else {
                peer.last_seen = now;
                Action::Inv {
                    last_matched: peer.last_matched,
                }
            }
        };

        match action {
            Action::Skip => {}
            Action::Ping => self.adapter.push_message(peer_id, &SyncMessage::Ping),
            Action::Inv { last_matched } => {
                let buckets: Vec<InvEntry> = {
                    let store = self.store.lock().unwrap();
                    store
                        .buckets()
                        .iter()
                        .filter(|(_, bucket)| {
                            bucket.token_count() > 0 && bucket.time_changed > last_matched
                        })
                        .map(|(slot, bucket)| InvEntry {
                            slot: *slot,
                            count: bucket.token_count() as u32,
                            hash: bucket.hash,
                        })
                        .collect()
                };
                if !buckets.is_empty() {
                    debug!("Sending {} bucket headers to peer {peer_id}.", buckets.len());
                    self.adapter
                        .push_message(peer_id, &SyncMessage::Inv { buckets });
                }
            }
        }
        Ok(())
    }

    // ── inbound protocol ────────────────────────────────────────────────

    /// Handle one received protocol message; replies go out through the
    /// network adapter. Wire-shape and time-window violations are reported
    /// to the host's misbehavior scoring.
    pub fn receive_data(
        &self,
        peer_id: PeerId,
        command: &str,
        payload: &[u8],
        now: i64,
    ) -> Result<(), SmsgError> {
        debug!("receive_data peer {peer_id} {command}.");

        if !self.enabled.load(Ordering::SeqCst) {
            // while disabled, known traffic is dropped cleanly
            return SyncMessage::decode(command, payload).map(|_| ());
        }

        let message = match SyncMessage::decode(command, payload) {
            Ok(message) => message,
            Err(SmsgError::UnknownMessage) => return Err(SmsgError::UnknownMessage),
            Err(err) => {
                self.adapter.misbehaving(peer_id, 1);
                return Err(err);
            }
        };

        match message {
            SyncMessage::Ping => {
                self.adapter.push_message(peer_id, &SyncMessage::Pong);
                Ok(())
            }
            SyncMessage::Pong => {
                debug!("Peer {peer_id} replied, secure messaging enabled.");
                self.peers.lock().unwrap().entry(peer_id).or_default().enabled = true;
                Ok(())
            }
            SyncMessage::Disabled => {
                debug!("Peer {peer_id} has disabled secure messaging.");
                self.peers.lock().unwrap().entry(peer_id).or_default().enabled = false;
                Ok(())
            }
            SyncMessage::Ignore { until } => {
                debug!("Peer {peer_id} is ignoring this node until {until}, ignore peer too.");
                self.peers
                    .lock()
                    .unwrap()
                    .entry(peer_id)
                    .or_default()
                    .ignore_until = until;
                Ok(())
            }
            SyncMessage::Inv { buckets } => self.handle_inv(peer_id, buckets, now),
            SyncMessage::Show { slots } => self.handle_show(peer_id, slots),
            SyncMessage::Have { slot, tokens } => self.handle_have(peer_id, slot, tokens, now),
            SyncMessage::Want { slot, tokens } => self.handle_want(peer_id, slot, tokens),
            SyncMessage::Msg { count, slot, data } => {
                self.handle_msg(peer_id, count, slot, &data, now)
            }
            SyncMessage::Match { time } => {
                let limit = now + self.options.time_leeway;
                if time > limit {
                    warn!("Peer buckets matched in the future: {time}.");
                }
                self.peers
                    .lock()
                    .unwrap()
                    .entry(peer_id)
                    .or_default()
                    .last_matched = time.min(limit);
                Ok(())
            }
        }
    }

    fn handle_inv(
        &self,
        peer_id: PeerId,
        entries: Vec<InvEntry>,
        now: i64,
    ) -> Result<(), SmsgError> {
        {
            let peers = self.peers.lock().unwrap();
            if let Some(peer) = peers.get(&peer_id) {
                if now < peer.ignore_until {
                    debug!("Ignoring peer {peer_id} until {}.", peer.ignore_until);
                    return Ok(());
                }
            }
        }

        let max_buckets = (self.options.retention / self.options.bucket_len) as usize + 1;
        if entries.len() > max_buckets {
            warn!(
                "Peer sent more bucket headers than possible {}, {max_buckets}.",
                entries.len()
            );
            self.adapter.misbehaving(peer_id, 1);
            return Err(SmsgError::Malformed("too many bucket headers"));
        }

        let mut in_window = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.slot < now - self.options.retention {
                debug!("Not interested in peer bucket {}, has expired.", entry.slot);
                if entry.slot < now - self.options.retention - self.options.time_leeway {
                    self.adapter.misbehaving(peer_id, 1);
                }
                continue;
            }
            if entry.slot > now + self.options.time_leeway {
                debug!("Not interested in peer bucket {}, in the future.", entry.slot);
                self.adapter.misbehaving(peer_id, 1);
                continue;
            }
            if entry.count < 1 {
                debug!("Peer sent empty bucket, ignore {}.", entry.slot);
                continue;
            }
            in_window.push(entry);
        }

        let mut want_slots = Vec::new();
        let mut locked = 0u32;
        {
            let mut store = self.store.lock().unwrap();
            for entry in &in_window {
                let bucket = store.bucket_entry(entry.slot);
                if bucket.is_locked() {
                    debug!(
                        "Bucket {} is locked, waiting for peer {:?} to send data.",
                        entry.slot, bucket.lock_peer
                    );
                    locked += 1;
                    continue;
                }

                // whichever side holds less pulls from the other
                let have = bucket.token_count() as u32;
                if have < entry.count || (have == entry.count && bucket.hash != entry.hash) {
                    debug!("Requesting contents of bucket {}.", entry.slot);
                    want_slots.push(entry.slot);
                }
            }
        }

        if !want_slots.is_empty() {
            self.adapter
                .push_message(peer_id, &SyncMessage::Show { slots: want_slots });
        } else if locked == 0 {
            // in sync and nothing pending, let the peer advance its watermark
            self.adapter
                .push_message(peer_id, &SyncMessage::Match { time: now });
        } else {
            debug!("{locked} buckets were locked, match withheld.");
        }
        Ok(())
    }

    fn handle_show(&self, peer_id: PeerId, slots: Vec<i64>) -> Result<(), SmsgError> {
        debug!(
            "Peer {peer_id} wants to see content of {} buckets.",
            slots.len()
        );
        for slot in slots {
            let reply = {
                let store = self.store.lock().unwrap();
                store.bucket(slot).map(|bucket| SyncMessage::Have {
                    slot,
                    tokens: bucket.tokens().copied().collect(),
                })
            };
            match reply {
                Some(reply) => self.adapter.push_message(peer_id, &reply),
                None => debug!("Don't have bucket {slot}."),
            }
        }
        Ok(())
    }

    fn handle_have(
        &self,
        peer_id: PeerId,
        slot: i64,
        tokens: Vec<Token>,
        now: i64,
    ) -> Result<(), SmsgError> {
        if slot < now - self.options.retention {
            debug!("Not interested in peer bucket {slot}, has expired.");
            return Err(SmsgError::Expired);
        }
        if slot > now + self.options.time_leeway {
            debug!("Not interested in peer bucket {slot}, in the future.");
            self.adapter.misbehaving(peer_id, 1);
            return Err(SmsgError::InFuture);
        }

        let missing: Vec<Token> = {
            let mut store = self.store.lock().unwrap();
            let bucket = store.bucket_entry(slot);
            if bucket.is_locked() {
                debug!(
                    "Bucket {slot} lock count {}, waiting for message data from peer {:?}.",
                    bucket.lock_count, bucket.lock_peer
                );
                return Err(SmsgError::Locked(bucket.lock_peer.unwrap_or_default()));
            }

            let missing: Vec<Token> = tokens
                .into_iter()
                .filter(|token| !bucket.contains(token))
                .collect();
            if !missing.is_empty() {
                debug!("Locking bucket {slot} for peer {peer_id}.");
                bucket.lock(peer_id);
            }
            missing
        };

        if !missing.is_empty() {
            debug!("Asking peer for {} messages.", missing.len());
            self.adapter
                .push_message(peer_id, &SyncMessage::Want { slot, tokens: missing });
        }
        Ok(())
    }

    fn handle_want(
        &self,
        peer_id: PeerId,
        slot: i64,
        tokens: Vec<Token>,
    ) -> Result<(), SmsgError> {
        let mut bunch = Vec::new();
        let mut count: u32 = 0;
        {
            let store = self.store.lock().unwrap();
            if store.bucket(slot).is_none() {
                debug!("Don't have bucket {slot}.");
                return Ok(());
            }
            for token in &tokens {
                match store.retrieve(token) {
                    Ok(None) => debug!("Don't have wanted message {}.", token.timestamp),
                    Err(err) => warn!("Retrieve failed for {}: {err}.", token.timestamp),
                    Ok(Some(bytes)) => {
                        count += 1;
                        bunch.extend_from_slice(&bytes);
                        if count >= SMSG_BUNCH_MAX_MESSAGES || bunch.len() >= SMSG_BUNCH_MAX_BYTES {
                            // the peer sends another want if it needs more
                            debug!("Break bunch {count}, {}.", bunch.len());
                            break;
                        }
                    }
                }
            }
        }

        if count > 0 {
            debug!("Sending block of {count} messages for bucket {slot}.");
            self.adapter.push_message(
                peer_id,
                &SyncMessage::Msg {
                    count,
                    slot,
                    data: bunch,
                },
            );
        }
        Ok(())
    }

    fn handle_msg(
        &self,
        peer_id: PeerId,
        count: u32,
        slot: i64,
        data: &[u8],
        now: i64,
    ) -> Result<(), SmsgError> {
        if slot > now + self.options.time_leeway {
            debug!("Bunch for bucket {slot} in the future.");
            return Err(SmsgError::InFuture);
        }
        if slot < now - self.options.retention {
            debug!("Bunch for bucket {slot} has expired.");
            return Err(SmsgError::Expired);
        }

        if count == 0 || count > SMSG_BUNCH_MAX_MESSAGES {
            warn!("Invalid no. messages received in bunch {count}, for bucket {slot}.");
            self.adapter.misbehaving(peer_id, 1);
            if let Some(bucket) = self.store.lock().unwrap().bucket_mut(slot) {
                bucket.unlock();
            }
            return Err(SmsgError::Malformed("invalid bunch count"));
        }

        let mut offset = 0usize;
        for _ in 0..count {
            let remaining = &data[offset..];
            if remaining.len() < SMSG_HDR_LEN {
                warn!("Not enough data sent, offset {offset}.");
                break;
            }
            let header = EnvelopeHeader::decode(remaining)?;
            let payload_len = header.payload_len as usize;
            if payload_len > SMSG_MAX_MSG_WORST || remaining.len() - SMSG_HDR_LEN < payload_len {
                warn!("Not enough data sent, offset {offset}.");
                self.adapter.misbehaving(peer_id, 1);
                break;
            }
            let envelope = Envelope {
                header,
                payload: remaining[SMSG_HDR_LEN..SMSG_HDR_LEN + payload_len].to_vec(),
            };
            offset += SMSG_HDR_LEN + payload_len;

            match pow::validate(&envelope) {
                Err(SmsgError::PowFailed) => {
                    self.adapter.misbehaving(peer_id, 10);
                    continue;
                }
                Err(_) => {
                    self.adapter.misbehaving(peer_id, 1);
                    continue;
                }
                Ok(()) => {}
            }

            // store without rehashing, the bucket is rehashed once below
            match self.store.lock().unwrap().insert(&envelope, false, now) {
                Ok(_) => {}
                Err(SmsgError::Duplicate) => continue,
                Err(err) => {
                    debug!("Could not store message: {err}.");
                    continue;
                }
            }
            let _ = self.scan_message(&envelope, now, true);
        }

        let mut store = self.store.lock().unwrap();
        match store.bucket_mut(slot) {
            None => {
                debug!("Don't have bucket {slot}.");
                Err(SmsgError::Malformed("bunch for unknown bucket"))
            }
            Some(bucket) => {
                // data arrived, release the pull lock
                bucket.unlock();
                bucket.hash_bucket(now);
                Ok(())
            }
        }
    }

    /// (token count, bucket hash, locked) for one slot.
    pub fn bucket_stats(&self, slot: i64) -> Option<(usize, u32, bool)> {
        let store = self.store.lock().unwrap();
        store
            .bucket(slot)
            .map(|bucket| (bucket.token_count(), bucket.hash, bucket.is_locked()))
    }

    pub fn smsg_options(&self) -> crate::registry::SmsgOptions {
        self.registry.lock().unwrap().options
    }

    pub fn set_smsg_options(&self, options: crate::registry::SmsgOptions) {
        self.registry.lock().unwrap().options = options;
    }

    // ── database views ──────────────────────────────────────────────────

    pub fn inbox(&self) -> Result<Vec<StoredMessage>, SmsgError> {
        self.stored_messages(DB_INBOX)
    }

    pub fn outbox(&self) -> Result<Vec<StoredMessage>, SmsgError> {
        self.stored_messages(DB_OUTBOX)
    }

    pub fn send_queue_len(&self) -> Result<usize, SmsgError> {
        Ok(self.db.lock().unwrap().scan_prefix(&DB_QUEUE)?.len())
    }

    fn stored_messages(&self, prefix: [u8; 2]) -> Result<Vec<StoredMessage>, SmsgError> {
        let entries = self.db.lock().unwrap().scan_prefix(&prefix)?;
        entries
            .iter()
            .map(|(_, value)| StoredMessage::decode(value))
            .collect()
    }
}

fn sleep_while_enabled(enabled: &AtomicBool, duration: Duration) {
    let step = Duration::from_millis(100);
    let mut remaining = duration;
    while enabled.load(Ordering::SeqCst) && !remaining.is_zero() {
        let chunk = remaining.min(step);
        thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}
