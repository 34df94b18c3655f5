// Storage contract.
//
// Everything the consensus core needs from persistence, as one async trait.
// `create_block` performs its writes through this interface in a fixed
// order and relies on `delete_block` as the rollback primitive: deleting a
// block removes its transactions, drops the outputs they created from the
// unspent set, and restores the outputs they consumed.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::transaction::{ChainTx, Transaction};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("write refused: {0}")]
    Refused(&'static str),
}

/// A block as held in storage, with its derived attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: u64,
    pub hash: String,
    pub content: String,
    pub address: String,
    pub nonce: u32,
    pub difficulty: Decimal,
    pub reward: Decimal,
    pub timestamp: u32,
}

/// A confirmed transaction of either kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub block_hash: String,
    pub content: String,
    pub is_coinbase: bool,
}

/// One unspent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub tx_hash: String,
    pub index: u8,
    pub address: String,
    pub amount: Decimal,
}

/// One mempool-mirrored pending transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub content: String,
    pub fees: Decimal,
    pub inserted_at: u64,
}

#[async_trait]
pub trait ChainStore: Send + Sync {
    // -- blocks ----------------------------------------------------------
    async fn get_last_block(&self) -> Result<Option<Block>, StoreError>;
    async fn get_block(&self, hash: &str) -> Result<Option<Block>, StoreError>;
    async fn get_block_by_id(&self, id: u64) -> Result<Option<Block>, StoreError>;
    async fn get_blocks(&self, offset: u64, limit: usize) -> Result<Vec<Block>, StoreError>;
    async fn get_next_block_id(&self) -> Result<u64, StoreError>;
    async fn add_block(&self, block: &Block) -> Result<(), StoreError>;
    /// Remove one block and undo its effects on the unspent set.
    async fn delete_block(&self, id: u64) -> Result<(), StoreError>;
    /// Remove every block with `id >= from_id`, newest first.
    async fn remove_blocks(&self, from_id: u64) -> Result<(), StoreError>;

    // -- confirmed transactions -----------------------------------------
    async fn add_transaction(&self, tx: &ChainTx, block_hash: &str) -> Result<(), StoreError>;
    async fn add_transactions(
        &self,
        txs: &[Transaction],
        block_hash: &str,
    ) -> Result<(), StoreError>;
    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<TxRecord>, StoreError>;
    /// Human-facing JSON view of a transaction.
    async fn get_nice_transaction(
        &self,
        tx_hash: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;
    async fn get_block_transactions(&self, block_hash: &str) -> Result<Vec<ChainTx>, StoreError>;

    // -- unspent outputs -------------------------------------------------
    async fn add_unspent_transactions_outputs(&self, txs: &[ChainTx]) -> Result<(), StoreError>;
    async fn remove_unspent_outputs(&self, txs: &[Transaction]) -> Result<(), StoreError>;
    /// Which of `keys` are currently unspent.
    async fn get_unspent_outputs(
        &self,
        keys: &[(String, u8)],
    ) -> Result<Vec<(String, u8)>, StoreError>;
    async fn get_unspent_output_records(
        &self,
        keys: &[(String, u8)],
    ) -> Result<Vec<UtxoRecord>, StoreError>;
    /// Digest over the whole unspent set, for cheap state comparison.
    async fn get_unspent_outputs_hash(&self) -> Result<String, StoreError>;
    async fn get_spendable_outputs(&self, address: &str) -> Result<Vec<UtxoRecord>, StoreError>;
    async fn get_address_transactions(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    // -- pending transactions -------------------------------------------
    /// Refuses duplicates and transactions whose inputs are already claimed
    /// by another pending transaction.
    async fn add_pending_transaction(
        &self,
        tx: &Transaction,
        fees: Decimal,
    ) -> Result<(), StoreError>;
    async fn get_pending_transaction_count(&self) -> Result<u64, StoreError>;
    async fn get_all_pending_transaction_hashes(&self) -> Result<Vec<String>, StoreError>;
    /// Pending transactions in insertion order: (hash, tx, inserted_at).
    async fn get_pending_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, Transaction, u64)>, StoreError>;
    async fn get_pending_transactions_by_hash(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Transaction>, StoreError>;
    async fn remove_pending_transaction(&self, tx_hash: &str) -> Result<(), StoreError>;
    async fn remove_pending_transactions_by_hash(
        &self,
        hashes: &[String],
    ) -> Result<(), StoreError>;
    async fn remove_pending_spent_outputs(&self, txs: &[Transaction]) -> Result<(), StoreError>;
    async fn remove_all_pending_transactions(&self) -> Result<(), StoreError>;
}

/// Storage key of one prevout: tx hash followed by the index byte in hex.
pub fn utxo_key(tx_hash: &str, index: u8) -> String {
    format!("{tx_hash}{index:02x}")
}
