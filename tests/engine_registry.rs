//! Engine-level registry behaviour: smsg.ini persistence across restarts,
//! counterparty key registration, and block harvesting.

use std::path::Path;
use std::sync::{Arc, Mutex};

use k256::SecretKey;
use rand_core::OsRng;
use smsg_rs::{
    pubkey_bytes, pubkey_id, EngineOptions, InMemoryDb, MemoryKeyStore, NetworkAdapter, PeerId,
    ScannedBlock, ScannedTx, SmsgEngine, SmsgOptions, SyncMessage, TxInput, SMSG_ADDRESS_VERSION,
};

const NOW: i64 = 1_700_000_000;

#[derive(Default)]
struct TestNet {
    services: Mutex<Vec<bool>>,
}

impl NetworkAdapter for TestNet {
    fn push_message(&self, _peer: PeerId, _message: &SyncMessage) {}
    fn misbehaving(&self, _peer: PeerId, _score: u32) {}
    fn update_local_services(&self, smsg_enabled: bool) {
        self.services.lock().unwrap().push(smsg_enabled);
    }
}

fn engine_with(dir: &Path, wallet: Arc<MemoryKeyStore>) -> (SmsgEngine, Arc<TestNet>) {
    let net = Arc::new(TestNet::default());
    let mut options = EngineOptions::new(dir);
    options.run_background_threads = false;
    let engine = SmsgEngine::new(options, wallet, Box::new(InMemoryDb::new()), net.clone());
    (engine, net)
}

#[test]
fn addresses_persist_across_restarts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MemoryKeyStore::new());
    let address = wallet.insert(SecretKey::random(&mut OsRng));

    let (engine, net) = engine_with(dir.path(), wallet);
    engine.start(NOW).expect("start");
    // first start pulls the wallet addresses with the default flags
    let loaded = engine.local_addresses();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].address, address);
    assert!(loaded[0].receive && loaded[0].receive_anon);

    engine.enable_address(address, true, false);
    engine.set_smsg_options(SmsgOptions {
        new_address_recv: false,
        new_address_anon: false,
        scan_incoming: true,
    });
    engine.stop();
    assert_eq!(*net.services.lock().unwrap(), vec![true, false]);
    assert!(dir.path().join("smsg.ini").exists());

    // a fresh engine over the same datadir reads the ini, even without any
    // wallet keys
    let (restarted, _) = engine_with(dir.path(), Arc::new(MemoryKeyStore::new()));
    restarted.start(NOW).expect("start");
    let reloaded = restarted.local_addresses();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].address, address);
    assert!(reloaded[0].receive && !reloaded[0].receive_anon);
    assert!(restarted.smsg_options().scan_incoming);
}

#[test]
fn add_address_checks_key_against_hash() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MemoryKeyStore::new());
    let owner = wallet.insert(SecretKey::random(&mut OsRng));
    let (engine, _) = engine_with(dir.path(), wallet);

    let address = owner.to_address(SMSG_ADDRESS_VERSION);
    let pubkey_b58 = engine.local_public_key(&address).expect("pubkey");
    engine.add_address(&address, &pubkey_b58).expect("add");
    assert!(engine.stored_pubkey(&owner).expect("read").is_some());

    // a key that does not hash to the address is rejected
    let other = SecretKey::random(&mut OsRng);
    let wrong = bs58::encode(pubkey_bytes(&other.public_key())).into_string();
    assert!(engine.add_address(&address, &wrong).is_err());
}

#[test]
fn scan_block_is_gated_by_option() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = Arc::new(MemoryKeyStore::new());
    wallet.insert(SecretKey::random(&mut OsRng));
    let (engine, _) = engine_with(dir.path(), wallet);

    let secret = SecretKey::random(&mut OsRng);
    let pubkey = pubkey_bytes(&secret.public_key());
    let id = pubkey_id(&secret.public_key());
    let block = ScannedBlock {
        txs: vec![ScannedTx {
            is_coinstake: false,
            inputs: vec![TxInput {
                witness: vec![vec![0; 71], pubkey.to_vec()],
            }],
        }],
    };

    // scanIncoming defaults to off
    let stats = engine.scan_block(&block);
    assert_eq!(stats.pubkeys, 0);
    assert!(engine.stored_pubkey(&id).expect("read").is_none());

    let mut options = engine.smsg_options();
    options.scan_incoming = true;
    engine.set_smsg_options(options);

    let stats = engine.scan_block(&block);
    assert_eq!(stats.pubkeys, 1);
    assert_eq!(engine.stored_pubkey(&id).expect("read"), Some(pubkey));

    // the whole-chain pass reports the duplicate
    let totals = engine.scan_chain([&block]);
    assert_eq!(totals.duplicates, 1);
}
