// Block header wire codec.
//
// Fixed field layout:
//   [version: 1 byte, only when the address is a 33-byte point]
//   previous_hash: 32 bytes
//   address: 64 bytes (legacy v1) or 33 bytes (v2 compressed point)
//   merkle_root: 32 bytes
//   timestamp: 4 bytes LE seconds
//   difficulty: 2 bytes LE, stored as round(difficulty * 10)
//   nonce: 4 bytes LE
//
// Exactly 138 raw bytes means a legacy v1 header with no version prefix;
// any other length must carry the version byte and a 33-byte address.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::crypto::hash::sha256_hex;

pub const LEGACY_CONTENT_BYTES: usize = 138;
pub const V2_CONTENT_BYTES: usize = 1 + 32 + 33 + 32 + 4 + 2 + 4;

#[derive(Debug, Error, PartialEq)]
pub enum BlockCodecError {
    #[error("block content is not valid hex")]
    InvalidHex,
    #[error("block content length {0} does not match any layout")]
    BadLength(usize),
    #[error("invalid {0}")]
    BadField(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub version: u8,
    pub previous_hash: String,
    pub address: String,
    pub merkle_root: String,
    pub timestamp: u32,
    pub difficulty: Decimal,
    pub nonce: u32,
}

impl BlockHeader {
    /// Deterministic serialization: identical input yields identical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockCodecError> {
        let previous = decode_digest(&self.previous_hash, "previous hash")?;
        let merkle = decode_digest(&self.merkle_root, "merkle root")?;
        let address = hex::decode(&self.address).map_err(|_| BlockCodecError::BadField("address"))?;
        if address.len() != 64 && address.len() != 33 {
            return Err(BlockCodecError::BadField("address"));
        }

        let scaled = (self.difficulty * dec!(10))
            .round()
            .to_u16()
            .ok_or(BlockCodecError::BadField("difficulty"))?;

        let mut out = Vec::with_capacity(LEGACY_CONTENT_BYTES);
        if address.len() == 33 {
            out.push(self.version);
        }
        out.extend_from_slice(&previous);
        out.extend_from_slice(&address);
        out.extend_from_slice(&merkle);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&scaled.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        Ok(out)
    }

    pub fn to_hex(&self) -> Result<String, BlockCodecError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Parse a hex block content. Rejects any input whose raw length does
    /// not match the layout its leading byte declares.
    pub fn from_hex(content: &str) -> Result<Self, BlockCodecError> {
        let bytes = hex::decode(content).map_err(|_| BlockCodecError::InvalidHex)?;

        let (version, address_len, offset) = if bytes.len() == LEGACY_CONTENT_BYTES {
            (1u8, 64usize, 0usize)
        } else {
            if bytes.len() != V2_CONTENT_BYTES {
                return Err(BlockCodecError::BadLength(bytes.len()));
            }
            (bytes[0], 33usize, 1usize)
        };

        let mut cursor = offset;
        let previous_hash = hex::encode(&bytes[cursor..cursor + 32]);
        cursor += 32;
        let address = hex::encode(&bytes[cursor..cursor + address_len]);
        cursor += address_len;
        let merkle_root = hex::encode(&bytes[cursor..cursor + 32]);
        cursor += 32;
        let timestamp = u32::from_le_bytes(
            bytes[cursor..cursor + 4]
                .try_into()
                .map_err(|_| BlockCodecError::BadField("timestamp"))?,
        );
        cursor += 4;
        let scaled = u16::from_le_bytes(
            bytes[cursor..cursor + 2]
                .try_into()
                .map_err(|_| BlockCodecError::BadField("difficulty"))?,
        );
        cursor += 2;
        let nonce = u32::from_le_bytes(
            bytes[cursor..cursor + 4]
                .try_into()
                .map_err(|_| BlockCodecError::BadField("nonce"))?,
        );

        Ok(BlockHeader {
            version,
            previous_hash,
            address,
            merkle_root,
            timestamp,
            difficulty: Decimal::new(scaled as i64, 1),
            nonce,
        })
    }
}

/// The block hash: SHA-256 over the raw content bytes, hex digest.
pub fn block_hash_from_content(content: &str) -> Result<String, BlockCodecError> {
    let bytes = hex::decode(content).map_err(|_| BlockCodecError::InvalidHex)?;
    Ok(sha256_hex(&bytes))
}

fn decode_digest(hex_str: &str, field: &'static str) -> Result<[u8; 32], BlockCodecError> {
    let bytes = hex::decode(hex_str).map_err(|_| BlockCodecError::BadField(field))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| BlockCodecError::BadField(field))
}
