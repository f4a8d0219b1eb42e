//! Address whitelist and learned-pubkey harvesting.
//!
//! Owned addresses enabled for receive live in a plain `smsg.ini` next to
//! the store directory and are written back on shutdown via temp-and-rename.
//! Public keys of counterparties are learned from decrypted messages and
//! from transaction witness data in blocks the host hands over.

use std::fs;
use std::io::Write;
use std::path::Path;

use log::{debug, info, warn};

use crate::error::SmsgError;
use crate::keys::{hash160, KeyId, KeyStore};

/// One owned address and its receive gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmsgAddress {
    pub address: KeyId,
    pub receive: bool,
    /// Also accept messages from anonymous senders.
    pub receive_anon: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmsgOptions {
    /// Receive flags applied to addresses newly added from the wallet.
    pub new_address_recv: bool,
    pub new_address_anon: bool,
    /// Harvest pubkeys from incoming blocks.
    pub scan_incoming: bool,
}

impl Default for SmsgOptions {
    fn default() -> Self {
        Self {
            new_address_recv: true,
            new_address_anon: true,
            scan_incoming: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct AddressBook {
    pub options: SmsgOptions,
    pub addresses: Vec<SmsgAddress>,
    pub address_version: u8,
}

impl AddressBook {
    pub fn new(address_version: u8) -> Self {
        Self {
            options: SmsgOptions::default(),
            addresses: Vec::new(),
            address_version,
        }
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        self.addresses.iter().any(|entry| entry.address == *id)
    }

    /// Parse `smsg.ini`. Comments, section headers and unknown names are
    /// skipped; unknown names are logged.
    pub fn read_ini(&mut self, path: &Path) -> Result<(), SmsgError> {
        let contents = fs::read_to_string(path)?;
        for line in contents.lines() {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            match name {
                "newAddressRecv" => self.options.new_address_recv = value == "true",
                "newAddressAnon" => self.options.new_address_anon = value == "true",
                "scanIncoming" => self.options.scan_incoming = value == "true",
                "key" => {
                    let fields: Vec<&str> = value.split('|').collect();
                    let parsed = match fields.as_slice() {
                        [address, recv, anon] => KeyId::from_address(address)
                            .ok()
                            .map(|(_, id)| (id, *recv != "0", *anon != "0")),
                        _ => None,
                    };
                    match parsed {
                        Some((id, receive, receive_anon)) => self.addresses.push(SmsgAddress {
                            address: id,
                            receive,
                            receive_anon,
                        }),
                        None => warn!("Could not parse key line {value}."),
                    }
                }
                _ => warn!("Unknown setting name: '{name}'."),
            }
        }
        info!("Loaded {} addresses.", self.addresses.len());
        Ok(())
    }

    /// Write `smsg.ini` atomically: the content goes to `smsg.ini~` first,
    /// then a rename replaces the live file.
    pub fn write_ini(&self, path: &Path) -> Result<(), SmsgError> {
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push("~");

        let mut out = String::new();
        out.push_str("[Options]\n");
        out.push_str(&format!(
            "newAddressRecv={}\n",
            if self.options.new_address_recv { "true" } else { "false" }
        ));
        out.push_str(&format!(
            "newAddressAnon={}\n",
            if self.options.new_address_anon { "true" } else { "false" }
        ));
        out.push_str(&format!(
            "scanIncoming={}\n",
            if self.options.scan_incoming { "true" } else { "false" }
        ));
        out.push_str("\n[Keys]\n");
        for entry in &self.addresses {
            out.push_str(&format!(
                "key={}|{}|{}\n",
                entry.address.to_address(self.address_version),
                entry.receive as u8,
                entry.receive_anon as u8,
            ));
        }

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(out.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Enumerate wallet addresses into the whitelist with the configured
    /// default flags. Returns how many were added.
    pub fn add_wallet_addresses(&mut self, wallet: &dyn KeyStore) -> usize {
        let mut added = 0;
        for id in wallet.owned_addresses() {
            if self.contains(&id) {
                continue;
            }
            self.addresses.push(SmsgAddress {
                address: id,
                receive: self.options.new_address_recv,
                receive_anon: self.options.new_address_anon,
            });
            added += 1;
        }
        debug!("Added {added} addresses to whitelist.");
        added
    }

    /// Apply a wallet key change notification.
    pub fn key_changed(&mut self, id: KeyId, added: bool) {
        if added {
            if !self.contains(&id) {
                self.addresses.push(SmsgAddress {
                    address: id,
                    receive: self.options.new_address_recv,
                    receive_anon: self.options.new_address_anon,
                });
            }
        } else {
            self.addresses.retain(|entry| entry.address != id);
        }
    }
}

/// Witness data the host extracts from a block for pubkey harvesting.
#[derive(Debug, Clone, Default)]
pub struct ScannedBlock {
    pub txs: Vec<ScannedTx>,
}

#[derive(Debug, Clone, Default)]
pub struct ScannedTx {
    /// Coinstake inputs all spend from one key; only the first is scanned.
    pub is_coinstake: bool,
    pub inputs: Vec<TxInput>,
}

#[derive(Debug, Clone, Default)]
pub struct TxInput {
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub transactions: u32,
    pub pubkeys: u32,
    pub duplicates: u32,
}

/// Walk a block's witness stacks and hand every compressed pubkey found in
/// a (signature, pubkey) witness to `insert`, which reports whether the key
/// was new.
pub fn harvest_block(
    block: &ScannedBlock,
    mut insert: impl FnMut(KeyId, [u8; 33]) -> bool,
) -> HarvestStats {
    let mut stats = HarvestStats::default();
    for tx in &block.txs {
        for input in &tx.inputs {
            if input.witness.len() != 2 {
                continue;
            }
            let Ok(pubkey) = <[u8; 33]>::try_from(input.witness[1].as_slice()) else {
                continue;
            };
            if k256::PublicKey::from_sec1_bytes(&pubkey).is_err() {
                debug!("Public key is invalid {}.", hex::encode(pubkey));
                continue;
            }
            let id = hash160(&pubkey);
            if insert(id, pubkey) {
                stats.pubkeys += 1;
            } else {
                stats.duplicates += 1;
            }
            if tx.is_coinstake {
                break;
            }
        }
        stats.transactions += 1;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SMSG_ADDRESS_VERSION;
    use crate::keys::{pubkey_bytes, pubkey_id, MemoryKeyStore};
    use k256::SecretKey;
    use rand_core::OsRng;
    use std::collections::BTreeMap;

    #[test]
    fn ini_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("smsg.ini");

        let mut book = AddressBook::new(SMSG_ADDRESS_VERSION);
        book.options.scan_incoming = true;
        book.options.new_address_anon = false;
        book.addresses.push(SmsgAddress {
            address: KeyId([0x21; 20]),
            receive: true,
            receive_anon: false,
        });
        book.addresses.push(SmsgAddress {
            address: KeyId([0x22; 20]),
            receive: false,
            receive_anon: true,
        });
        book.write_ini(&path).expect("write");
        assert!(!dir.path().join("smsg.ini~").exists());

        let mut reloaded = AddressBook::new(SMSG_ADDRESS_VERSION);
        reloaded.read_ini(&path).expect("read");
        assert_eq!(reloaded.options, book.options);
        assert_eq!(reloaded.addresses, book.addresses);
    }

    #[test]
    fn unknown_options_and_bad_keys_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("smsg.ini");
        fs::write(
            &path,
            "[Options]\nnoSuchOption=true\n# comment\nkey=garbage|x\nscanIncoming=true\n",
        )
        .expect("write");

        let mut book = AddressBook::new(SMSG_ADDRESS_VERSION);
        book.read_ini(&path).expect("read");
        assert!(book.addresses.is_empty());
        assert!(book.options.scan_incoming);
    }

    #[test]
    fn wallet_addresses_respect_defaults() {
        let wallet = MemoryKeyStore::new();
        wallet.insert(SecretKey::random(&mut OsRng));
        wallet.insert(SecretKey::random(&mut OsRng));

        let mut book = AddressBook::new(SMSG_ADDRESS_VERSION);
        book.options.new_address_anon = false;
        assert_eq!(book.add_wallet_addresses(&wallet), 2);
        assert!(book.addresses.iter().all(|a| a.receive && !a.receive_anon));
        // second pass adds nothing
        assert_eq!(book.add_wallet_addresses(&wallet), 0);
    }

    #[test]
    fn harvest_filters_witness_shapes() {
        let secret = SecretKey::random(&mut OsRng);
        let pubkey = pubkey_bytes(&secret.public_key());
        let id = pubkey_id(&secret.public_key());

        let block = ScannedBlock {
            txs: vec![
                ScannedTx {
                    is_coinstake: false,
                    inputs: vec![
                        // wrong arity
                        TxInput {
                            witness: vec![vec![1, 2, 3]],
                        },
                        // wrong pubkey size
                        TxInput {
                            witness: vec![vec![0; 71], vec![2; 32]],
                        },
                        // not a curve point
                        TxInput {
                            witness: vec![vec![0; 71], vec![0xff; 33]],
                        },
                        TxInput {
                            witness: vec![vec![0; 71], pubkey.to_vec()],
                        },
                    ],
                },
                // coinstake: second input never inspected
                ScannedTx {
                    is_coinstake: true,
                    inputs: vec![
                        TxInput {
                            witness: vec![vec![0; 71], pubkey.to_vec()],
                        },
                        TxInput {
                            witness: vec![vec![0; 71], pubkey.to_vec()],
                        },
                    ],
                },
            ],
        };

        let mut learned: BTreeMap<KeyId, [u8; 33]> = BTreeMap::new();
        let stats = harvest_block(&block, |key, pk| learned.insert(key, pk).is_none());
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.pubkeys, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(learned.get(&id), Some(&pubkey));
    }
}
