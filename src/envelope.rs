//! Wire form of a secure message: fixed 104-byte header plus ciphertext.
//!
//! Header layout, all integers little-endian:
//!
//! | offset | field       | size |
//! |--------|-------------|------|
//! | 0      | hash        | 4    |
//! | 4      | version     | 2    |
//! | 6      | flags       | 1    |
//! | 7      | timestamp   | 8    |
//! | 15     | iv          | 16   |
//! | 31     | cpk_r       | 33   |
//! | 64     | mac         | 32   |
//! | 96     | nonce       | 4    |
//! | 100    | payload_len | 4    |
//!
//! The proof-of-work digest covers bytes 4..104 followed by the payload, so
//! the leading checksum never feeds its own computation.

use crate::constants::{SMSG_HDR_LEN, SMSG_MAX_MSG_WORST, SMSG_VERSION};
use crate::error::SmsgError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub hash: [u8; 4],
    pub version: [u8; 2],
    pub flags: u8,
    pub timestamp: i64,
    pub iv: [u8; 16],
    pub cpk_r: [u8; 33],
    pub mac: [u8; 32],
    pub nonce: [u8; 4],
    pub payload_len: u32,
}

impl EnvelopeHeader {
    pub fn new(timestamp: i64) -> Self {
        Self {
            hash: [0; 4],
            version: SMSG_VERSION,
            flags: 0,
            timestamp,
            iv: [0; 16],
            cpk_r: [0; 33],
            mac: [0; 32],
            nonce: [0; 4],
            payload_len: 0,
        }
    }

    pub fn encode(&self) -> [u8; SMSG_HDR_LEN] {
        let mut out = [0u8; SMSG_HDR_LEN];
        out[0..4].copy_from_slice(&self.hash);
        out[4..6].copy_from_slice(&self.version);
        out[6] = self.flags;
        out[7..15].copy_from_slice(&self.timestamp.to_le_bytes());
        out[15..31].copy_from_slice(&self.iv);
        out[31..64].copy_from_slice(&self.cpk_r);
        out[64..96].copy_from_slice(&self.mac);
        out[96..100].copy_from_slice(&self.nonce);
        out[100..104].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SmsgError> {
        if bytes.len() < SMSG_HDR_LEN {
            return Err(SmsgError::Malformed("header truncated"));
        }
        Ok(Self {
            hash: bytes[0..4].try_into().unwrap(),
            version: bytes[4..6].try_into().unwrap(),
            flags: bytes[6],
            timestamp: i64::from_le_bytes(bytes[7..15].try_into().unwrap()),
            iv: bytes[15..31].try_into().unwrap(),
            cpk_r: bytes[31..64].try_into().unwrap(),
            mac: bytes[64..96].try_into().unwrap(),
            nonce: bytes[96..100].try_into().unwrap(),
            payload_len: u32::from_le_bytes(bytes[100..104].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(mut header: EnvelopeHeader, payload: Vec<u8>) -> Self {
        header.payload_len = payload.len() as u32;
        Self { header, payload }
    }

    /// First 8 payload bytes, half of the message identity.
    pub fn sample(&self) -> Result<[u8; 8], SmsgError> {
        self.payload
            .get(..8)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(SmsgError::Malformed("payload shorter than sample"))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SMSG_HDR_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Strict decode: the payload length must match the remaining bytes
    /// exactly and stay under the worst-case ciphertext size.
    pub fn decode(bytes: &[u8]) -> Result<Self, SmsgError> {
        let header = EnvelopeHeader::decode(bytes)?;
        let payload_len = header.payload_len as usize;
        if payload_len > SMSG_MAX_MSG_WORST {
            return Err(SmsgError::Malformed("payload too large"));
        }
        if bytes.len() - SMSG_HDR_LEN != payload_len {
            return Err(SmsgError::Malformed("payload length mismatch"));
        }
        Ok(Self {
            header,
            payload: bytes[SMSG_HDR_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        let mut header = EnvelopeHeader::new(1_700_000_123);
        header.hash = [1, 2, 3, 4];
        header.iv = [7u8; 16];
        header.cpk_r = [9u8; 33];
        header.mac = [0xabu8; 32];
        header.nonce = [5, 6, 7, 8];
        Envelope::new(header, vec![0x11u8; 40])
    }

    #[test]
    fn header_round_trip() {
        let env = sample_envelope();
        let bytes = env.encode();
        assert_eq!(bytes.len(), SMSG_HDR_LEN + 40);
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded, env);
    }

    #[test]
    fn truncated_header_rejected() {
        let env = sample_envelope();
        let bytes = env.encode();
        assert!(matches!(
            Envelope::decode(&bytes[..SMSG_HDR_LEN - 1]),
            Err(SmsgError::Malformed(_))
        ));
    }

    #[test]
    fn payload_length_must_match_framing() {
        let env = sample_envelope();
        let mut bytes = env.encode();
        bytes.pop();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(SmsgError::Malformed(_))
        ));

        let mut bytes = env.encode();
        bytes.push(0);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(SmsgError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut header = EnvelopeHeader::new(0);
        header.payload_len = (SMSG_MAX_MSG_WORST + 1) as u32;
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&vec![0u8; SMSG_MAX_MSG_WORST + 1]);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(SmsgError::Malformed(_))
        ));
    }

    #[test]
    fn sample_needs_eight_bytes() {
        let header = EnvelopeHeader::new(0);
        let env = Envelope::new(header, vec![1, 2, 3]);
        assert!(env.sample().is_err());
    }
}
