// UTXO transaction model.
//
// A regular transaction spends `(tx_hash, index)` prevouts into
// `(address, amount)` outputs; fees are the input/output difference and are
// resolved against the store, never carried on the wire. The coinbase is a
// distinct variant synthesized by the block creator, never admitted to the
// mempool and never part of the Merkle root.
//
// Wire form (hex):
//   regular:  version(1)=0x01  n_in(1)  [tx_hash(32) index(1)]*
//             n_out(1) [addr_len(1) addr amount(8 LE atomic)]*
//   coinbase: version(1)=0x00  block_hash(32) addr_len(1) addr amount(8 LE)

use std::collections::HashSet;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::consensus::chain::{MAX_SUPPLY, SMALLEST};
use crate::crypto::hash::sha256_hex;
use crate::node::db::{ChainStore, StoreError};

pub const TX_VERSION: u8 = 1;
pub const COINBASE_VERSION: u8 = 0;

#[derive(Debug, Error, PartialEq)]
pub enum TxError {
    #[error("transaction is not valid hex")]
    InvalidHex,
    #[error("malformed transaction: {0}")]
    Malformed(&'static str),
    #[error("coinbase transactions cannot be submitted")]
    CoinbaseNotAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxInput {
    pub tx_hash: String,
    pub index: u8,
}

impl TxInput {
    pub fn key(&self) -> (String, u8) {
        (self.tx_hash.clone(), self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub address: String,
    pub amount: Decimal,
}

impl TxOutput {
    /// Amounts are positive, within supply, and representable in atomic
    /// units (at most 6 fractional digits).
    pub fn verify_amount(&self) -> bool {
        if self.amount <= Decimal::ZERO || self.amount > MAX_SUPPLY {
            return false;
        }
        (self.amount * Decimal::from(SMALLEST)).fract() == Decimal::ZERO
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn hex(&self) -> String {
        let mut out = Vec::with_capacity(2 + self.inputs.len() * 33 + self.outputs.len() * 42);
        out.push(TX_VERSION);
        out.push(self.inputs.len() as u8);
        for input in &self.inputs {
            out.extend_from_slice(&decode_digest_lossy(&input.tx_hash));
            out.push(input.index);
        }
        out.push(self.outputs.len() as u8);
        for output in &self.outputs {
            let addr = hex::decode(&output.address).unwrap_or_default();
            out.push(addr.len() as u8);
            out.extend_from_slice(&addr);
            out.extend_from_slice(&amount_to_atomic(output.amount).to_le_bytes());
        }
        hex::encode(out)
    }

    pub fn from_hex(content: &str) -> Result<Self, TxError> {
        let bytes = hex::decode(content).map_err(|_| TxError::InvalidHex)?;
        let mut cursor = Cursor::new(&bytes);
        let version = cursor.take_u8()?;
        if version == COINBASE_VERSION {
            return Err(TxError::CoinbaseNotAllowed);
        }
        if version != TX_VERSION {
            return Err(TxError::Malformed("unknown version"));
        }

        let n_in = cursor.take_u8()? as usize;
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            let tx_hash = hex::encode(cursor.take(32)?);
            let index = cursor.take_u8()?;
            inputs.push(TxInput { tx_hash, index });
        }

        let n_out = cursor.take_u8()? as usize;
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            let addr_len = cursor.take_u8()? as usize;
            if addr_len != 33 && addr_len != 64 {
                return Err(TxError::Malformed("address length"));
            }
            let address = hex::encode(cursor.take(addr_len)?);
            let amount = atomic_to_amount(u64::from_le_bytes(
                cursor
                    .take(8)?
                    .try_into()
                    .map_err(|_| TxError::Malformed("amount"))?,
            ));
            outputs.push(TxOutput { address, amount });
        }

        if !cursor.exhausted() {
            return Err(TxError::Malformed("trailing bytes"));
        }
        Ok(Transaction { inputs, outputs })
    }

    pub fn hash(&self) -> String {
        let bytes = hex::decode(self.hex()).unwrap_or_default();
        sha256_hex(&bytes)
    }

    pub fn input_keys(&self) -> Vec<(String, u8)> {
        self.inputs.iter().map(|i| i.key()).collect()
    }

    pub fn output_amount_sum(&self) -> Decimal {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    fn structurally_valid(&self) -> bool {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return false;
        }
        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.key()) {
                return false;
            }
        }
        self.outputs.iter().all(|o| o.verify_amount())
    }

    /// Resolve the source amount of each input: the unspent set first, then
    /// confirmed transactions, then pending transactions (intra-pool
    /// parents). `None` when any source is missing or the claimed output
    /// index does not exist.
    pub async fn resolve_input_amounts(
        &self,
        store: &dyn ChainStore,
    ) -> Result<Option<Vec<Decimal>>, StoreError> {
        let keys = self.input_keys();
        let unspent = store.get_unspent_output_records(&keys).await?;
        let mut amounts = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if let Some(record) = unspent
                .iter()
                .find(|r| r.tx_hash == input.tx_hash && r.index == input.index)
            {
                amounts.push(record.amount);
                continue;
            }
            let source = match store.get_transaction(&input.tx_hash).await? {
                Some(stored) => Some(stored.content),
                None => store
                    .get_pending_transactions_by_hash(&[input.tx_hash.clone()])
                    .await?
                    .into_iter()
                    .next()
                    .map(|tx| tx.hex()),
            };
            let Some(content) = source else {
                return Ok(None);
            };
            let outputs = match outputs_of_content(&content) {
                Some(outs) => outs,
                None => return Ok(None),
            };
            match outputs.get(input.index as usize) {
                Some(out) => amounts.push(out.amount),
                None => return Ok(None),
            }
        }
        Ok(Some(amounts))
    }

    /// Fees: input amounts minus output amounts.
    pub async fn fees(&self, store: &dyn ChainStore) -> Result<Option<Decimal>, StoreError> {
        match self.resolve_input_amounts(store).await? {
            Some(amounts) => {
                let total: Decimal = amounts.iter().copied().sum();
                Ok(Some(total - self.output_amount_sum()))
            }
            None => Ok(None),
        }
    }

    /// Full verification. With `check_double_spend` every input must be
    /// either unspent on chain or the output of a pending transaction
    /// (an intra-pool parent); without it the caller has already
    /// established coverage (block validation).
    pub async fn verify(
        &self,
        store: &dyn ChainStore,
        check_double_spend: bool,
    ) -> Result<bool, StoreError> {
        if !self.structurally_valid() {
            return Ok(false);
        }

        if check_double_spend {
            let keys = self.input_keys();
            let unspent: HashSet<(String, u8)> = store
                .get_unspent_output_records(&keys)
                .await?
                .into_iter()
                .map(|r| (r.tx_hash, r.index))
                .collect();
            for input in &self.inputs {
                if unspent.contains(&input.key()) {
                    continue;
                }
                let pending = store
                    .get_pending_transactions_by_hash(&[input.tx_hash.clone()])
                    .await?;
                let covered = pending
                    .first()
                    .map(|tx| (input.index as usize) < tx.outputs.len())
                    .unwrap_or(false);
                if !covered {
                    return Ok(false);
                }
            }
        }

        let Some(amounts) = self.resolve_input_amounts(store).await? else {
            return Ok(false);
        };
        let input_total: Decimal = amounts.iter().copied().sum();
        Ok(input_total >= self.output_amount_sum())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoinbaseTransaction {
    pub block_hash: String,
    pub address: String,
    pub amount: Decimal,
}

impl CoinbaseTransaction {
    pub fn new(block_hash: String, address: String, amount: Decimal) -> Self {
        CoinbaseTransaction {
            block_hash,
            address,
            amount,
        }
    }

    pub fn hex(&self) -> String {
        let mut out = Vec::with_capacity(34 + self.address.len() / 2 + 8);
        out.push(COINBASE_VERSION);
        out.extend_from_slice(&decode_digest_lossy(&self.block_hash));
        let addr = hex::decode(&self.address).unwrap_or_default();
        out.push(addr.len() as u8);
        out.extend_from_slice(&addr);
        out.extend_from_slice(&amount_to_atomic(self.amount).to_le_bytes());
        hex::encode(out)
    }

    pub fn hash(&self) -> String {
        let bytes = hex::decode(self.hex()).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// The single coinbase output must carry a representable, in-supply
    /// amount. A zero amount is allowed once the subsidy has run out.
    pub fn verify(&self) -> bool {
        if self.amount < Decimal::ZERO || self.amount > MAX_SUPPLY {
            return false;
        }
        (self.amount * Decimal::from(SMALLEST)).fract() == Decimal::ZERO
    }

    pub fn output(&self) -> TxOutput {
        TxOutput {
            address: self.address.clone(),
            amount: self.amount,
        }
    }
}

/// Either side of the coinbase split, as stored per block.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainTx {
    Regular(Transaction),
    Coinbase(CoinbaseTransaction),
}

impl ChainTx {
    pub fn hash(&self) -> String {
        match self {
            ChainTx::Regular(tx) => tx.hash(),
            ChainTx::Coinbase(tx) => tx.hash(),
        }
    }

    pub fn hex(&self) -> String {
        match self {
            ChainTx::Regular(tx) => tx.hex(),
            ChainTx::Coinbase(tx) => tx.hex(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, ChainTx::Coinbase(_))
    }

    pub fn outputs(&self) -> Vec<TxOutput> {
        match self {
            ChainTx::Regular(tx) => tx.outputs.clone(),
            ChainTx::Coinbase(tx) => vec![tx.output()],
        }
    }

    pub fn from_hex(content: &str) -> Result<Self, TxError> {
        match Transaction::from_hex(content) {
            Ok(tx) => Ok(ChainTx::Regular(tx)),
            Err(TxError::CoinbaseNotAllowed) => {
                let bytes = hex::decode(content).map_err(|_| TxError::InvalidHex)?;
                let mut cursor = Cursor::new(&bytes);
                let _version = cursor.take_u8()?;
                let block_hash = hex::encode(cursor.take(32)?);
                let addr_len = cursor.take_u8()? as usize;
                if addr_len != 33 && addr_len != 64 {
                    return Err(TxError::Malformed("address length"));
                }
                let address = hex::encode(cursor.take(addr_len)?);
                let amount = atomic_to_amount(u64::from_le_bytes(
                    cursor
                        .take(8)?
                        .try_into()
                        .map_err(|_| TxError::Malformed("amount"))?,
                ));
                if !cursor.exhausted() {
                    return Err(TxError::Malformed("trailing bytes"));
                }
                Ok(ChainTx::Coinbase(CoinbaseTransaction {
                    block_hash,
                    address,
                    amount,
                }))
            }
            Err(e) => Err(e),
        }
    }
}

/// Outputs of a serialized transaction of either kind.
pub fn outputs_of_content(content: &str) -> Option<Vec<TxOutput>> {
    ChainTx::from_hex(content).ok().map(|tx| tx.outputs())
}

pub fn amount_to_atomic(amount: Decimal) -> u64 {
    (amount * Decimal::from(SMALLEST)).to_u64().unwrap_or(0)
}

pub fn atomic_to_amount(atomic: u64) -> Decimal {
    Decimal::from(atomic) / Decimal::from(SMALLEST)
}

fn decode_digest_lossy(hex_str: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    if let Ok(bytes) = hex::decode(hex_str) {
        if bytes.len() == 32 {
            out.copy_from_slice(&bytes);
        }
    }
    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TxError> {
        if self.data.len() < self.pos + n {
            return Err(TxError::Malformed("truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, TxError> {
        Ok(self.take(1)?[0])
    }

    fn exhausted(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub fn sample_tx() -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                tx_hash: "aa".repeat(32),
                index: 0,
            }],
            outputs: vec![TxOutput {
                address: "02".to_string() + &"11".repeat(32),
                amount: dec!(10.5),
            }],
        }
    }

    #[test]
    fn test_regular_roundtrip() {
        let tx = sample_tx();
        let parsed = Transaction::from_hex(&tx.hex()).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn test_hash_is_64_hex_chars() {
        let h = sample_tx().hash();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_coinbase_roundtrip() {
        let cb = CoinbaseTransaction::new("ff".repeat(32), "02".to_string() + &"22".repeat(32), dec!(64));
        let parsed = ChainTx::from_hex(&cb.hex()).unwrap();
        assert_eq!(parsed, ChainTx::Coinbase(cb));
    }

    #[test]
    fn test_coinbase_rejected_as_regular() {
        let cb = CoinbaseTransaction::new("ff".repeat(32), "02".to_string() + &"22".repeat(32), dec!(64));
        assert_eq!(
            Transaction::from_hex(&cb.hex()).unwrap_err(),
            TxError::CoinbaseNotAllowed
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut content = sample_tx().hex();
        content.push_str("00");
        assert_eq!(
            Transaction::from_hex(&content).unwrap_err(),
            TxError::Malformed("trailing bytes")
        );
    }

    #[test]
    fn test_duplicate_inputs_structurally_invalid() {
        let mut tx = sample_tx();
        tx.inputs.push(tx.inputs[0].clone());
        assert!(!tx.structurally_valid());
    }

    #[test]
    fn test_output_amount_limits() {
        let good = TxOutput {
            address: "02".to_string() + &"11".repeat(32),
            amount: dec!(0.000001),
        };
        assert!(good.verify_amount());

        let sub_atomic = TxOutput {
            amount: dec!(0.0000001),
            ..good.clone()
        };
        assert!(!sub_atomic.verify_amount());

        let zero = TxOutput {
            amount: dec!(0),
            ..good.clone()
        };
        assert!(!zero.verify_amount());
    }

    #[test]
    fn test_atomic_conversion() {
        assert_eq!(amount_to_atomic(dec!(1)), 1_000_000);
        assert_eq!(atomic_to_amount(1_500_000), dec!(1.5));
        assert_eq!(atomic_to_amount(amount_to_atomic(dec!(10.5))), dec!(10.5));
    }
}
