//! Bucket store: an in-memory index of time-slot buckets over append-only
//! files, one file per bucket under `<datadir>/smsgstore/`.
//!
//! All mutation happens under one outer lock owned by the engine; nothing in
//! here synchronises on its own.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use xxhash_rust::xxh32::Xxh32;

use crate::constants::{
    SMSG_BUCKET_LEN, SMSG_BUCKET_LOCK_TICKS, SMSG_HDR_LEN, SMSG_MAX_MSG_WORST, SMSG_RETENTION,
    SMSG_TIME_LEEWAY,
};
use crate::envelope::{Envelope, EnvelopeHeader};
use crate::error::SmsgError;
use crate::sync::PeerId;

/// Compact summary of one stored envelope. The pair (timestamp, sample) is
/// the message identity; the file offset is kept alongside in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
    pub timestamp: i64,
    pub sample: [u8; 8],
}

impl Token {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SmsgError> {
        Ok(Self {
            timestamp: envelope.header.timestamp,
            sample: envelope.sample()?,
        })
    }
}

#[derive(Debug, Default)]
pub struct Bucket {
    tokens: BTreeMap<Token, u64>,
    pub hash: u32,
    pub time_changed: i64,
    pub lock_count: u32,
    pub lock_peer: Option<PeerId>,
}

impl Bucket {
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.keys()
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.tokens.contains_key(token)
    }

    pub fn offset(&self, token: &Token) -> Option<u64> {
        self.tokens.get(token).copied()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn lock(&mut self, peer: PeerId) {
        self.lock_count = SMSG_BUCKET_LOCK_TICKS;
        self.lock_peer = Some(peer);
    }

    pub fn unlock(&mut self) {
        self.lock_count = 0;
        self.lock_peer = None;
    }

    /// XXH32 (seed 1) over the token samples in set order. `time_changed`
    /// advances only when the value actually changes.
    pub fn hash_bucket(&mut self, now: i64) {
        let mut state = Xxh32::new(1);
        for token in self.tokens.keys() {
            state.update(&token.sample);
        }
        let new_hash = state.digest();
        if self.hash != new_hash {
            debug!("Bucket hash updated from {} to {}.", self.hash, new_hash);
            self.hash = new_hash;
            self.time_changed = now;
        }
    }
}

pub struct BucketStore {
    dir: PathBuf,
    buckets: BTreeMap<i64, Bucket>,
    bucket_len: i64,
    retention: i64,
    leeway: i64,
}

impl BucketStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_timing(dir, SMSG_BUCKET_LEN, SMSG_RETENTION, SMSG_TIME_LEEWAY)
    }

    pub fn with_timing(
        dir: impl Into<PathBuf>,
        bucket_len: i64,
        retention: i64,
        leeway: i64,
    ) -> Self {
        Self {
            dir: dir.into(),
            buckets: BTreeMap::new(),
            bucket_len,
            retention,
            leeway,
        }
    }

    pub fn slot(&self, timestamp: i64) -> i64 {
        timestamp - timestamp % self.bucket_len
    }

    pub fn retention(&self) -> i64 {
        self.retention
    }

    pub fn bucket_len(&self) -> i64 {
        self.bucket_len
    }

    pub fn leeway(&self) -> i64 {
        self.leeway
    }

    pub fn buckets(&self) -> &BTreeMap<i64, Bucket> {
        &self.buckets
    }

    pub fn bucket(&self, slot: i64) -> Option<&Bucket> {
        self.buckets.get(&slot)
    }

    pub fn bucket_mut(&mut self, slot: i64) -> Option<&mut Bucket> {
        self.buckets.get_mut(&slot)
    }

    /// Bucket for `slot`, created empty when first referenced.
    pub fn bucket_entry(&mut self, slot: i64) -> &mut Bucket {
        self.buckets.entry(slot).or_default()
    }

    fn bucket_path(&self, slot: i64) -> PathBuf {
        self.dir.join(format!("{slot}_01.dat"))
    }

    fn unscanned_path(&self, slot: i64) -> PathBuf {
        self.dir.join(format!("{slot}_01_wl.dat"))
    }

    fn check_window(&self, timestamp: i64, now: i64) -> Result<(), SmsgError> {
        if timestamp > now + self.leeway {
            return Err(SmsgError::InFuture);
        }
        if timestamp < now - self.retention {
            return Err(SmsgError::Expired);
        }
        Ok(())
    }

    /// Append the envelope to its bucket file and index the token.
    pub fn insert(
        &mut self,
        envelope: &Envelope,
        update_hash: bool,
        now: i64,
    ) -> Result<Token, SmsgError> {
        self.check_window(envelope.header.timestamp, now)?;
        let token = Token::from_envelope(envelope)?;
        let slot = self.slot(token.timestamp);

        if self
            .buckets
            .get(&slot)
            .is_some_and(|bucket| bucket.contains(&token))
        {
            debug!("Already have message {} in bucket {slot}.", token.timestamp);
            return Err(SmsgError::Duplicate);
        }

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.bucket_path(slot))?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&envelope.header.encode())?;
        file.write_all(&envelope.payload)?;

        let bucket = self.buckets.entry(slot).or_default();
        bucket.tokens.insert(token, offset);
        bucket.time_changed = now;
        if update_hash {
            bucket.hash_bucket(now);
        }

        debug!("Message added to bucket {slot}.");
        Ok(token)
    }

    /// Append to the bucket's `_wl` sibling without touching the index.
    /// Used while the wallet is locked so the copy can be rescanned later.
    pub fn store_unscanned(&self, envelope: &Envelope, now: i64) -> Result<(), SmsgError> {
        self.check_window(envelope.header.timestamp, now)?;
        let slot = self.slot(envelope.header.timestamp);
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.unscanned_path(slot))?;
        file.write_all(&envelope.header.encode())?;
        file.write_all(&envelope.payload)?;
        Ok(())
    }

    /// Read back the serialized envelope for a token, or `None` when the
    /// token is not in the index.
    pub fn retrieve(&self, token: &Token) -> Result<Option<Vec<u8>>, SmsgError> {
        let slot = self.slot(token.timestamp);
        let Some(offset) = self.buckets.get(&slot).and_then(|b| b.offset(token)) else {
            return Ok(None);
        };

        let mut file = File::open(self.bucket_path(slot))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut header_bytes = [0u8; SMSG_HDR_LEN];
        file.read_exact(&mut header_bytes)?;
        let header = EnvelopeHeader::decode(&header_bytes)?;
        let payload_len = header.payload_len as usize;
        if payload_len > SMSG_MAX_MSG_WORST {
            return Err(SmsgError::Malformed("stored payload too large"));
        }

        let mut out = vec![0u8; SMSG_HDR_LEN + payload_len];
        out[..SMSG_HDR_LEN].copy_from_slice(&header_bytes);
        file.read_exact(&mut out[SMSG_HDR_LEN..])?;
        Ok(Some(out))
    }

    /// Build the bucket set by scanning the store directory. Expired files
    /// are removed on sight, `_wl` files are left for the unlock scan.
    pub fn load(&mut self, now: i64) -> Result<(), SmsgError> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            info!("Message store directory does not exist.");
            return Ok(());
        };

        let mut files = 0u32;
        let mut messages = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("dat") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(slot) = parse_slot(name) else {
                continue;
            };
            files += 1;

            if slot < now - self.retention {
                info!("Dropping file {name}, expired.");
                if let Err(err) = fs::remove_file(&path) {
                    warn!("Error removing bucket file {name}: {err}.");
                }
                continue;
            }

            if name.ends_with("_wl.dat") {
                debug!("Skipping wallet locked file: {name}.");
                continue;
            }

            messages += self.load_file(&path, slot, now)?;
        }

        info!(
            "Processed {files} files, loaded {} buckets containing {messages} messages.",
            self.buckets.len()
        );
        Ok(())
    }

    fn load_file(&mut self, path: &Path, slot: i64, now: i64) -> Result<usize, SmsgError> {
        let mut reader = BufReader::new(File::open(path)?);
        let bucket = self.buckets.entry(slot).or_default();

        let mut header_bytes = [0u8; SMSG_HDR_LEN];
        loop {
            let offset = reader.stream_position()?;
            match reader.read_exact(&mut header_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let header = EnvelopeHeader::decode(&header_bytes)?;
            let payload_len = header.payload_len as i64;

            if payload_len >= 8 {
                let mut sample = [0u8; 8];
                reader.read_exact(&mut sample)?;
                reader.seek(SeekFrom::Current(payload_len - 8))?;
                bucket.tokens.insert(
                    Token {
                        timestamp: header.timestamp,
                        sample,
                    },
                    offset,
                );
            } else {
                reader.seek(SeekFrom::Current(payload_len))?;
            }
        }

        bucket.hash_bucket(now);
        let count = bucket.token_count();
        debug!("Bucket {slot} contains {count} messages.");
        Ok(count)
    }

    /// One sweep: drop expired buckets and their files, tick down pull
    /// locks, and return the (slot, peer) pairs whose lock just timed out.
    pub fn expire(&mut self, now: i64) -> Vec<(i64, PeerId)> {
        let cutoff = now - self.retention;
        let expired: Vec<i64> = self.buckets.range(..cutoff).map(|(slot, _)| *slot).collect();
        for slot in expired {
            debug!("Removing bucket {slot}.");
            self.buckets.remove(&slot);
            for path in [self.bucket_path(slot), self.unscanned_path(slot)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("Error removing bucket file {}: {err}.", path.display()),
                }
            }
        }

        let mut timed_out = Vec::new();
        for (slot, bucket) in self.buckets.iter_mut() {
            if bucket.lock_count > 0 {
                bucket.lock_count -= 1;
                if bucket.lock_count == 0 {
                    if let Some(peer) = bucket.lock_peer.take() {
                        timed_out.push((*slot, peer));
                    }
                }
            }
        }
        timed_out
    }

    /// `_wl` files within retention, oldest first. Expired ones are removed
    /// on sight.
    pub fn unscanned_files(&self, now: i64) -> Result<Vec<(i64, PathBuf)>, SmsgError> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with("_wl.dat") {
                continue;
            }
            let Some(slot) = parse_slot(name) else {
                continue;
            };
            if slot < now - self.retention {
                info!("Dropping wallet locked file {name}, expired.");
                if let Err(err) = fs::remove_file(&path) {
                    warn!("Error removing wl file {name}: {err}.");
                }
                continue;
            }
            out.push((slot, path));
        }
        out.sort();
        Ok(out)
    }

    /// All envelopes in one store file, in append order.
    pub fn read_file(path: &Path) -> Result<Vec<Envelope>, SmsgError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        let mut header_bytes = [0u8; SMSG_HDR_LEN];
        loop {
            match reader.read_exact(&mut header_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let header = EnvelopeHeader::decode(&header_bytes)?;
            let payload_len = header.payload_len as usize;
            if payload_len > SMSG_MAX_MSG_WORST {
                return Err(SmsgError::Malformed("stored payload too large"));
            }
            let mut payload = vec![0u8; payload_len];
            reader.read_exact(&mut payload)?;
            out.push(Envelope { header, payload });
        }
        Ok(out)
    }
}

fn parse_slot(file_name: &str) -> Option<i64> {
    file_name.split('_').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeHeader;

    fn envelope_at(timestamp: i64, fill: u8) -> Envelope {
        let mut header = EnvelopeHeader::new(timestamp);
        header.iv = [fill; 16];
        Envelope::new(header, vec![fill; 32])
    }

    #[test]
    fn slot_floors_to_bucket_len() {
        let store = BucketStore::new("unused");
        assert_eq!(store.slot(7200), 7200);
        assert_eq!(store.slot(7201), 7200);
        assert_eq!(store.slot(10799), 7200);
    }

    #[test]
    fn insert_retrieve_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = BucketStore::new(dir.path());
        let now = 1_700_000_000;
        let env = envelope_at(now - 5, 0x41);

        let token = store.insert(&env, true, now).expect("insert");
        let bytes = store.retrieve(&token).expect("retrieve").expect("found");
        assert_eq!(bytes, env.encode());
    }

    #[test]
    fn duplicate_insert_keeps_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = BucketStore::new(dir.path());
        let now = 1_700_000_000;
        let env = envelope_at(now - 5, 0x41);

        let token = store.insert(&env, true, now).expect("insert");
        let slot = store.slot(env.header.timestamp);
        let hash = store.bucket(slot).expect("bucket").hash;

        assert!(matches!(
            store.insert(&env, true, now),
            Err(SmsgError::Duplicate)
        ));
        assert_eq!(store.bucket(slot).expect("bucket").hash, hash);
        assert_eq!(store.bucket(slot).expect("bucket").token_count(), 1);
        let _ = token;
    }

    #[test]
    fn window_checks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = BucketStore::new(dir.path());
        let now = 1_700_000_000;

        let future = envelope_at(now + SMSG_TIME_LEEWAY + 1, 1);
        assert!(matches!(
            store.insert(&future, true, now),
            Err(SmsgError::InFuture)
        ));

        let expired = envelope_at(now - SMSG_RETENTION - 1, 2);
        assert!(matches!(
            store.insert(&expired, true, now),
            Err(SmsgError::Expired)
        ));
    }

    #[test]
    fn load_rebuilds_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = 1_700_000_000;
        let envs: Vec<Envelope> = (0u8..3).map(|i| envelope_at(now - i as i64, i)).collect();

        let mut store = BucketStore::new(dir.path());
        let mut tokens = Vec::new();
        for env in &envs {
            tokens.push(store.insert(env, true, now).expect("insert"));
        }
        let slot = store.slot(now);
        let hash = store.bucket(slot).expect("bucket").hash;

        let mut reloaded = BucketStore::new(dir.path());
        reloaded.load(now).expect("load");
        let bucket = reloaded.bucket(slot).expect("bucket");
        assert_eq!(bucket.token_count(), 3);
        assert_eq!(bucket.hash, hash);
        for (env, token) in envs.iter().zip(&tokens) {
            let bytes = reloaded.retrieve(token).expect("retrieve").expect("found");
            assert_eq!(bytes, env.encode());
        }
    }

    #[test]
    fn expiry_removes_bucket_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = BucketStore::new(dir.path());
        let now = 1_700_000_000;
        let env = envelope_at(now - 5, 0x41);

        store.insert(&env, true, now).expect("insert");
        store.store_unscanned(&env, now).expect("unscanned");
        let slot = store.slot(env.header.timestamp);
        assert!(dir.path().join(format!("{slot}_01.dat")).exists());
        assert!(dir.path().join(format!("{slot}_01_wl.dat")).exists());

        let later = now + SMSG_RETENTION + SMSG_BUCKET_LEN;
        let timed_out = store.expire(later);
        assert!(timed_out.is_empty());
        assert!(store.bucket(slot).is_none());
        assert!(!dir.path().join(format!("{slot}_01.dat")).exists());
        assert!(!dir.path().join(format!("{slot}_01_wl.dat")).exists());
    }

    #[test]
    fn lock_ticks_down_to_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = BucketStore::new(dir.path());
        let now = 1_700_000_000;
        let env = envelope_at(now - 5, 0x41);
        store.insert(&env, true, now).expect("insert");
        let slot = store.slot(env.header.timestamp);

        store.bucket_entry(slot).lock(7);
        assert!(store.expire(now).is_empty());
        assert!(store.expire(now).is_empty());
        assert_eq!(store.expire(now), vec![(slot, 7)]);
        assert!(!store.bucket(slot).expect("bucket").is_locked());
    }

    #[test]
    fn token_order_is_timestamp_then_sample() {
        let a = Token {
            timestamp: 10,
            sample: [9; 8],
        };
        let b = Token {
            timestamp: 11,
            sample: [0; 8],
        };
        let c = Token {
            timestamp: 11,
            sample: [1; 8],
        };
        assert!(a < b && b < c);
    }
}
