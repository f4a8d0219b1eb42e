//! Wire messages of the anti-flood synchronization protocol and per-peer
//! sync state.
//!
//! Ten commands ride on the host's P2P framing; each payload is a plain
//! little-endian byte buffer. The handshake is Ping/Pong, inventories flow
//! Inv → Show → Have → Want → Msg, Match acknowledges a synced point in
//! time, and Disabled/Ignore gate the peer.

use crate::error::SmsgError;
use crate::store::Token;

pub type PeerId = u64;

pub const CMD_PING: &str = "smsgPing";
pub const CMD_PONG: &str = "smsgPong";
pub const CMD_DISABLED: &str = "smsgDisabled";
pub const CMD_IGNORE: &str = "smsgIgnore";
pub const CMD_INV: &str = "smsgInv";
pub const CMD_SHOW: &str = "smsgShow";
pub const CMD_HAVE: &str = "smsgHave";
pub const CMD_WANT: &str = "smsgWant";
pub const CMD_MSG: &str = "smsgMsg";
pub const CMD_MATCH: &str = "smsgMatch";

/// One bucket header inside an inventory: slot start, message count, hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvEntry {
    pub slot: i64,
    pub count: u32,
    pub hash: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Ping,
    Pong,
    Disabled,
    Ignore { until: i64 },
    Inv { buckets: Vec<InvEntry> },
    Show { slots: Vec<i64> },
    Have { slot: i64, tokens: Vec<Token> },
    Want { slot: i64, tokens: Vec<Token> },
    Msg { count: u32, slot: i64, data: Vec<u8> },
    Match { time: i64 },
}

impl SyncMessage {
    pub fn command(&self) -> &'static str {
        match self {
            SyncMessage::Ping => CMD_PING,
            SyncMessage::Pong => CMD_PONG,
            SyncMessage::Disabled => CMD_DISABLED,
            SyncMessage::Ignore { .. } => CMD_IGNORE,
            SyncMessage::Inv { .. } => CMD_INV,
            SyncMessage::Show { .. } => CMD_SHOW,
            SyncMessage::Have { .. } => CMD_HAVE,
            SyncMessage::Want { .. } => CMD_WANT,
            SyncMessage::Msg { .. } => CMD_MSG,
            SyncMessage::Match { .. } => CMD_MATCH,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            SyncMessage::Ping | SyncMessage::Pong | SyncMessage::Disabled => Vec::new(),
            SyncMessage::Ignore { until } => until.to_le_bytes().to_vec(),
            SyncMessage::Inv { buckets } => {
                let mut out = Vec::with_capacity(4 + buckets.len() * 16);
                out.extend_from_slice(&(buckets.len() as u32).to_le_bytes());
                for entry in buckets {
                    out.extend_from_slice(&entry.slot.to_le_bytes());
                    out.extend_from_slice(&entry.count.to_le_bytes());
                    out.extend_from_slice(&entry.hash.to_le_bytes());
                }
                out
            }
            SyncMessage::Show { slots } => {
                let mut out = Vec::with_capacity(4 + slots.len() * 8);
                out.extend_from_slice(&(slots.len() as u32).to_le_bytes());
                for slot in slots {
                    out.extend_from_slice(&slot.to_le_bytes());
                }
                out
            }
            SyncMessage::Have { slot, tokens } | SyncMessage::Want { slot, tokens } => {
                let mut out = Vec::with_capacity(8 + tokens.len() * 16);
                out.extend_from_slice(&slot.to_le_bytes());
                for token in tokens {
                    out.extend_from_slice(&token.timestamp.to_le_bytes());
                    out.extend_from_slice(&token.sample);
                }
                out
            }
            SyncMessage::Msg { count, slot, data } => {
                let mut out = Vec::with_capacity(12 + data.len());
                out.extend_from_slice(&count.to_le_bytes());
                out.extend_from_slice(&slot.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            SyncMessage::Match { time } => time.to_le_bytes().to_vec(),
        }
    }

    /// Decode a received payload. Commands outside the protocol map to
    /// `UnknownMessage`; shape violations map to `Malformed`.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, SmsgError> {
        match command {
            CMD_PING => Ok(SyncMessage::Ping),
            CMD_PONG => Ok(SyncMessage::Pong),
            CMD_DISABLED => Ok(SyncMessage::Disabled),
            CMD_IGNORE => Ok(SyncMessage::Ignore {
                until: read_i64(payload, 0)?,
            }),
            CMD_INV => {
                let count = read_u32(payload, 0)? as usize;
                let mut buckets = Vec::with_capacity(count.min(1024));
                for i in 0..count {
                    let base = 4 + i * 16;
                    buckets.push(InvEntry {
                        slot: read_i64(payload, base)?,
                        count: read_u32(payload, base + 8)?,
                        hash: read_u32(payload, base + 12)?,
                    });
                }
                Ok(SyncMessage::Inv { buckets })
            }
            CMD_SHOW => {
                let count = read_u32(payload, 0)? as usize;
                let mut slots = Vec::with_capacity(count.min(1024));
                for i in 0..count {
                    slots.push(read_i64(payload, 4 + i * 8)?);
                }
                Ok(SyncMessage::Show { slots })
            }
            CMD_HAVE | CMD_WANT => {
                let slot = read_i64(payload, 0)?;
                let count = (payload.len() - 8) / 16;
                let mut tokens = Vec::with_capacity(count);
                for i in 0..count {
                    let base = 8 + i * 16;
                    tokens.push(Token {
                        timestamp: read_i64(payload, base)?,
                        sample: read_sample(payload, base + 8)?,
                    });
                }
                if command == CMD_HAVE {
                    Ok(SyncMessage::Have { slot, tokens })
                } else {
                    Ok(SyncMessage::Want { slot, tokens })
                }
            }
            CMD_MSG => {
                let count = read_u32(payload, 0)?;
                let slot = read_i64(payload, 4)?;
                Ok(SyncMessage::Msg {
                    count,
                    slot,
                    data: payload[12..].to_vec(),
                })
            }
            CMD_MATCH => Ok(SyncMessage::Match {
                time: read_i64(payload, 0)?,
            }),
            _ => Err(SmsgError::UnknownMessage),
        }
    }
}

fn read_i64(payload: &[u8], offset: usize) -> Result<i64, SmsgError> {
    payload
        .get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(i64::from_le_bytes)
        .ok_or(SmsgError::Malformed("payload truncated"))
}

fn read_u32(payload: &[u8], offset: usize) -> Result<u32, SmsgError> {
    payload
        .get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(SmsgError::Malformed("payload truncated"))
}

fn read_sample(payload: &[u8], offset: usize) -> Result<[u8; 8], SmsgError> {
    payload
        .get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(SmsgError::Malformed("payload truncated"))
}

/// Sync state tracked per peer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSyncState {
    /// Set once the peer answers the initial ping.
    pub enabled: bool,
    /// Zero until first contact; afterwards the time of the last outbound
    /// round, used to throttle inventories.
    pub last_seen: i64,
    /// Buckets unchanged since this time are not advertised to the peer.
    pub last_matched: i64,
    /// Both sides of an ignore mirror this gate.
    pub ignore_until: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: SyncMessage) {
        let payload = message.encode_payload();
        let decoded = SyncMessage::decode(message.command(), &payload).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn all_commands_round_trip() {
        round_trip(SyncMessage::Ping);
        round_trip(SyncMessage::Pong);
        round_trip(SyncMessage::Disabled);
        round_trip(SyncMessage::Ignore { until: 1_700_000_900 });
        round_trip(SyncMessage::Inv {
            buckets: vec![
                InvEntry {
                    slot: 1_699_999_200,
                    count: 3,
                    hash: 0xdeadbeef,
                },
                InvEntry {
                    slot: 1_700_002_800,
                    count: 1,
                    hash: 7,
                },
            ],
        });
        round_trip(SyncMessage::Show {
            slots: vec![1_699_999_200, 1_700_002_800],
        });
        round_trip(SyncMessage::Have {
            slot: 1_699_999_200,
            tokens: vec![Token {
                timestamp: 1_699_999_201,
                sample: [1, 2, 3, 4, 5, 6, 7, 8],
            }],
        });
        round_trip(SyncMessage::Want {
            slot: 1_699_999_200,
            tokens: vec![Token {
                timestamp: 1_699_999_201,
                sample: [8, 7, 6, 5, 4, 3, 2, 1],
            }],
        });
        round_trip(SyncMessage::Msg {
            count: 2,
            slot: 1_699_999_200,
            data: vec![0xaa; 40],
        });
        round_trip(SyncMessage::Match { time: 1_700_000_000 });
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            SyncMessage::decode("smsgBogus", &[]),
            Err(SmsgError::UnknownMessage)
        ));
    }

    #[test]
    fn truncated_payloads_rejected() {
        assert!(matches!(
            SyncMessage::decode(CMD_IGNORE, &[0u8; 7]),
            Err(SmsgError::Malformed(_))
        ));
        // count says two entries, payload holds one
        let inv = SyncMessage::Inv {
            buckets: vec![InvEntry {
                slot: 3600,
                count: 1,
                hash: 1,
            }],
        };
        let mut payload = inv.encode_payload();
        payload[0] = 2;
        assert!(matches!(
            SyncMessage::decode(CMD_INV, &payload),
            Err(SmsgError::Malformed(_))
        ));
        assert!(matches!(
            SyncMessage::decode(CMD_MSG, &[0u8; 11]),
            Err(SmsgError::Malformed(_))
        ));
    }
}
