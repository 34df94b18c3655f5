// RocksDB-backed chain store.
//
// Column families:
//   blocks         : id[8] BE           → Block json
//   block_index    : block hash         → id[8] BE
//   block_txs      : block hash         → json list of tx hashes
//   transactions   : tx hash            → TxRecord json
//   unspent        : tx hash + index    → UtxoRecord json
//   pending        : tx hash            → PendingRecord json
//   pending_spent  : tx hash + index    → claiming pending tx hash
//   address_index  : address:tx hash    → []
//
// Every multi-key mutation goes through a single WriteBatch so a crash can
// never leave a block half-applied; `delete_block` rebuilds the unspent set
// a block consumed, skipping outputs whose source is deleted with it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::node::db::{
    utxo_key, Block, ChainStore, PendingRecord, StoreError, TxRecord, UtxoRecord,
};
use crate::primitives::transaction::{outputs_of_content, ChainTx, Transaction};

const CF_BLOCKS: &str = "blocks";
const CF_BLOCK_INDEX: &str = "block_index";
const CF_BLOCK_TXS: &str = "block_txs";
const CF_TRANSACTIONS: &str = "transactions";
const CF_UNSPENT: &str = "unspent";
const CF_PENDING: &str = "pending";
const CF_PENDING_SPENT: &str = "pending_spent";
const CF_ADDRESS_INDEX: &str = "address_index";

const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_BLOCK_INDEX,
    CF_BLOCK_TXS,
    CF_TRANSACTIONS,
    CF_UNSPENT,
    CF_PENDING,
    CF_PENDING_SPENT,
    CF_ADDRESS_INDEX,
];

#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_level_compaction_dynamic_level_bytes(true);

        let cfs: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, opts.clone()))
            .collect();
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(RocksStore { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Corrupt(format!("missing column family {name}")))
    }

    fn read_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{cf}: {e}"))),
            None => Ok(None),
        }
    }

    fn encode<T: Serialize>(value: &T) -> Vec<u8> {
        serde_json::to_vec(value).unwrap_or_default()
    }

    fn block_tx_hashes(&self, block_hash: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read_json::<Vec<String>>(CF_BLOCK_TXS, block_hash.as_bytes())?
            .unwrap_or_default())
    }

    /// Write the transaction record and its address-index rows; the
    /// caller extends the block's tx list once per batch.
    fn put_transaction_record(
        &self,
        batch: &mut WriteBatch,
        tx: &ChainTx,
        block_hash: &str,
    ) -> Result<String, StoreError> {
        let hash = tx.hash();
        let record = TxRecord {
            block_hash: block_hash.to_string(),
            content: tx.hex(),
            is_coinbase: tx.is_coinbase(),
        };
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, hash.as_bytes(), Self::encode(&record));
        for output in tx.outputs() {
            let key = format!("{}:{}", output.address, hash);
            batch.put_cf(self.cf(CF_ADDRESS_INDEX)?, key.as_bytes(), b"");
        }
        Ok(hash)
    }

    fn pending_record_to_tx(hash: &str, record: &PendingRecord) -> Result<Transaction, StoreError> {
        Transaction::from_hex(&record.content)
            .map_err(|e| StoreError::Corrupt(format!("pending {hash}: {e}")))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl ChainStore for RocksStore {
    async fn get_last_block(&self) -> Result<Option<Block>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (_, value) = item?;
                serde_json::from_slice(&value)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt(format!("blocks: {e}")))
            }
            None => Ok(None),
        }
    }

    async fn get_block(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        let id = match self.db.get_cf(self.cf(CF_BLOCK_INDEX)?, hash.as_bytes())? {
            Some(raw) => u64::from_be_bytes(
                raw.as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("block_index entry".to_string()))?,
            ),
            None => return Ok(None),
        };
        self.get_block_by_id(id).await
    }

    async fn get_block_by_id(&self, id: u64) -> Result<Option<Block>, StoreError> {
        self.read_json(CF_BLOCKS, &id.to_be_bytes())
    }

    async fn get_blocks(&self, offset: u64, limit: usize) -> Result<Vec<Block>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let start = offset.to_be_bytes();
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let block: Block = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Corrupt(format!("blocks: {e}")))?;
            out.push(block);
        }
        Ok(out)
    }

    async fn get_next_block_id(&self) -> Result<u64, StoreError> {
        Ok(self.get_last_block().await?.map(|b| b.id + 1).unwrap_or(0))
    }

    async fn add_block(&self, block: &Block) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_BLOCKS)?, block.id.to_be_bytes(), Self::encode(block));
        batch.put_cf(
            self.cf(CF_BLOCK_INDEX)?,
            block.hash.as_bytes(),
            block.id.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn delete_block(&self, id: u64) -> Result<(), StoreError> {
        let Some(block) = self.get_block_by_id(id).await? else {
            return Ok(());
        };
        let tx_hashes = self.block_tx_hashes(&block.hash)?;
        let deleted: HashSet<&String> = tx_hashes.iter().collect();

        let mut batch = WriteBatch::default();
        for hash in &tx_hashes {
            let Some(record) = self.read_json::<TxRecord>(CF_TRANSACTIONS, hash.as_bytes())? else {
                continue;
            };
            let tx = ChainTx::from_hex(&record.content)
                .map_err(|e| StoreError::Corrupt(format!("tx {hash}: {e}")))?;

            for (index, output) in tx.outputs().iter().enumerate() {
                batch.delete_cf(
                    self.cf(CF_UNSPENT)?,
                    utxo_key(hash, index as u8).as_bytes(),
                );
                let addr_key = format!("{}:{}", output.address, hash);
                batch.delete_cf(self.cf(CF_ADDRESS_INDEX)?, addr_key.as_bytes());
            }

            if let ChainTx::Regular(regular) = &tx {
                // Restore what this transaction consumed, unless the source
                // is being deleted in the same pass.
                for input in &regular.inputs {
                    if deleted.contains(&input.tx_hash) {
                        continue;
                    }
                    let Some(source) =
                        self.read_json::<TxRecord>(CF_TRANSACTIONS, input.tx_hash.as_bytes())?
                    else {
                        continue;
                    };
                    let Some(outputs) = outputs_of_content(&source.content) else {
                        continue;
                    };
                    if let Some(output) = outputs.get(input.index as usize) {
                        let record = UtxoRecord {
                            tx_hash: input.tx_hash.clone(),
                            index: input.index,
                            address: output.address.clone(),
                            amount: output.amount,
                        };
                        batch.put_cf(
                            self.cf(CF_UNSPENT)?,
                            utxo_key(&input.tx_hash, input.index).as_bytes(),
                            Self::encode(&record),
                        );
                    }
                }
            }

            batch.delete_cf(self.cf(CF_TRANSACTIONS)?, hash.as_bytes());
        }

        batch.delete_cf(self.cf(CF_BLOCK_TXS)?, block.hash.as_bytes());
        batch.delete_cf(self.cf(CF_BLOCK_INDEX)?, block.hash.as_bytes());
        batch.delete_cf(self.cf(CF_BLOCKS)?, id.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    async fn remove_blocks(&self, from_id: u64) -> Result<(), StoreError> {
        let Some(last) = self.get_last_block().await? else {
            return Ok(());
        };
        let mut id = last.id;
        while id >= from_id {
            self.delete_block(id).await?;
            if id == 0 {
                break;
            }
            id -= 1;
        }
        Ok(())
    }

    async fn add_transaction(&self, tx: &ChainTx, block_hash: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        let hash = self.put_transaction_record(&mut batch, tx, block_hash)?;
        let mut hashes = self.block_tx_hashes(block_hash)?;
        hashes.push(hash);
        batch.put_cf(self.cf(CF_BLOCK_TXS)?, block_hash.as_bytes(), Self::encode(&hashes));
        self.db.write(batch)?;
        Ok(())
    }

    async fn add_transactions(
        &self,
        txs: &[Transaction],
        block_hash: &str,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        let mut hashes = self.block_tx_hashes(block_hash)?;
        for tx in txs {
            let hash = self.put_transaction_record(&mut batch, &ChainTx::Regular(tx.clone()), block_hash)?;
            hashes.push(hash);
        }
        batch.put_cf(self.cf(CF_BLOCK_TXS)?, block_hash.as_bytes(), Self::encode(&hashes));
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<TxRecord>, StoreError> {
        self.read_json(CF_TRANSACTIONS, tx_hash.as_bytes())
    }

    async fn get_nice_transaction(
        &self,
        tx_hash: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let Some(record) = self.get_transaction(tx_hash).await? else {
            return Ok(None);
        };
        let tx = ChainTx::from_hex(&record.content)
            .map_err(|e| StoreError::Corrupt(format!("tx {tx_hash}: {e}")))?;
        let inputs = match &tx {
            ChainTx::Regular(regular) => regular
                .inputs
                .iter()
                .map(|i| serde_json::json!({"tx_hash": i.tx_hash, "index": i.index}))
                .collect::<Vec<_>>(),
            ChainTx::Coinbase(_) => Vec::new(),
        };
        let outputs = tx
            .outputs()
            .iter()
            .map(|o| serde_json::json!({"address": o.address, "amount": o.amount}))
            .collect::<Vec<_>>();
        Ok(Some(serde_json::json!({
            "hash": tx_hash,
            "block_hash": record.block_hash,
            "is_coinbase": record.is_coinbase,
            "inputs": inputs,
            "outputs": outputs,
        })))
    }

    async fn get_block_transactions(&self, block_hash: &str) -> Result<Vec<ChainTx>, StoreError> {
        let mut out = Vec::new();
        for hash in self.block_tx_hashes(block_hash)? {
            if let Some(record) = self.read_json::<TxRecord>(CF_TRANSACTIONS, hash.as_bytes())? {
                let tx = ChainTx::from_hex(&record.content)
                    .map_err(|e| StoreError::Corrupt(format!("tx {hash}: {e}")))?;
                out.push(tx);
            }
        }
        Ok(out)
    }

    async fn add_unspent_transactions_outputs(&self, txs: &[ChainTx]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for tx in txs {
            let hash = tx.hash();
            for (index, output) in tx.outputs().iter().enumerate() {
                let record = UtxoRecord {
                    tx_hash: hash.clone(),
                    index: index as u8,
                    address: output.address.clone(),
                    amount: output.amount,
                };
                batch.put_cf(
                    self.cf(CF_UNSPENT)?,
                    utxo_key(&hash, index as u8).as_bytes(),
                    Self::encode(&record),
                );
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn remove_unspent_outputs(&self, txs: &[Transaction]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for tx in txs {
            for input in &tx.inputs {
                batch.delete_cf(
                    self.cf(CF_UNSPENT)?,
                    utxo_key(&input.tx_hash, input.index).as_bytes(),
                );
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_unspent_outputs(
        &self,
        keys: &[(String, u8)],
    ) -> Result<Vec<(String, u8)>, StoreError> {
        let cf = self.cf(CF_UNSPENT)?;
        let mut out = Vec::new();
        for (hash, index) in keys {
            if self.db.get_cf(cf, utxo_key(hash, *index).as_bytes())?.is_some() {
                out.push((hash.clone(), *index));
            }
        }
        Ok(out)
    }

    async fn get_unspent_output_records(
        &self,
        keys: &[(String, u8)],
    ) -> Result<Vec<UtxoRecord>, StoreError> {
        let mut out = Vec::new();
        for (hash, index) in keys {
            if let Some(record) =
                self.read_json::<UtxoRecord>(CF_UNSPENT, utxo_key(hash, *index).as_bytes())?
            {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn get_unspent_outputs_hash(&self) -> Result<String, StoreError> {
        let cf = self.cf(CF_UNSPENT)?;
        let mut hasher = Sha256::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            hasher.update(&key);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    async fn get_spendable_outputs(&self, address: &str) -> Result<Vec<UtxoRecord>, StoreError> {
        let cf = self.cf(CF_UNSPENT)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: UtxoRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Corrupt(format!("unspent: {e}")))?;
            if record.address == address {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn get_address_transactions(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ADDRESS_INDEX)?;
        let prefix = format!("{address}:");
        let mut out = Vec::new();
        for (i, item) in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward))
            .enumerate()
        {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if i < offset {
                continue;
            }
            if out.len() >= limit {
                break;
            }
            let hash = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            out.push(hash);
        }
        Ok(out)
    }

    async fn add_pending_transaction(
        &self,
        tx: &Transaction,
        fees: Decimal,
    ) -> Result<(), StoreError> {
        let hash = tx.hash();
        if self.db.get_cf(self.cf(CF_PENDING)?, hash.as_bytes())?.is_some() {
            return Err(StoreError::Refused("duplicate pending transaction"));
        }
        for input in &tx.inputs {
            let key = utxo_key(&input.tx_hash, input.index);
            if self
                .db
                .get_cf(self.cf(CF_PENDING_SPENT)?, key.as_bytes())?
                .is_some()
            {
                return Err(StoreError::Refused("output already claimed by pending transaction"));
            }
        }

        let record = PendingRecord {
            content: tx.hex(),
            fees,
            inserted_at: unix_now(),
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PENDING)?, hash.as_bytes(), Self::encode(&record));
        for input in &tx.inputs {
            batch.put_cf(
                self.cf(CF_PENDING_SPENT)?,
                utxo_key(&input.tx_hash, input.index).as_bytes(),
                hash.as_bytes(),
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_pending_transaction_count(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    async fn get_all_pending_transaction_hashes(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            out.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(out)
    }

    async fn get_pending_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, Transaction, u64)>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let hash = String::from_utf8_lossy(&key).to_string();
            let record: PendingRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Corrupt(format!("pending: {e}")))?;
            let tx = Self::pending_record_to_tx(&hash, &record)?;
            entries.push((hash, tx, record.inserted_at));
        }
        entries.sort_by_key(|(_, _, inserted_at)| *inserted_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_pending_transactions_by_hash(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut out = Vec::new();
        for hash in hashes {
            if let Some(record) = self.read_json::<PendingRecord>(CF_PENDING, hash.as_bytes())? {
                out.push(Self::pending_record_to_tx(hash, &record)?);
            }
        }
        Ok(out)
    }

    async fn remove_pending_transaction(&self, tx_hash: &str) -> Result<(), StoreError> {
        let Some(record) = self.read_json::<PendingRecord>(CF_PENDING, tx_hash.as_bytes())? else {
            return Ok(());
        };
        let tx = Self::pending_record_to_tx(tx_hash, &record)?;
        let mut batch = WriteBatch::default();
        for input in &tx.inputs {
            batch.delete_cf(
                self.cf(CF_PENDING_SPENT)?,
                utxo_key(&input.tx_hash, input.index).as_bytes(),
            );
        }
        batch.delete_cf(self.cf(CF_PENDING)?, tx_hash.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    async fn remove_pending_transactions_by_hash(
        &self,
        hashes: &[String],
    ) -> Result<(), StoreError> {
        for hash in hashes {
            self.remove_pending_transaction(hash).await?;
        }
        Ok(())
    }

    async fn remove_pending_spent_outputs(&self, txs: &[Transaction]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for tx in txs {
            for input in &tx.inputs {
                batch.delete_cf(
                    self.cf(CF_PENDING_SPENT)?,
                    utxo_key(&input.tx_hash, input.index).as_bytes(),
                );
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn remove_all_pending_transactions(&self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for cf_name in [CF_PENDING, CF_PENDING_SPENT] {
            let cf = self.cf(cf_name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::transaction::{TxInput, TxOutput};
    use rust_decimal_macros::dec;

    fn tmp_store() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn test_block(id: u64, hash: &str) -> Block {
        Block {
            id,
            hash: hash.to_string(),
            content: "00".repeat(138),
            address: "02".to_string() + &"11".repeat(32),
            nonce: 0,
            difficulty: dec!(6.0),
            reward: dec!(64),
            timestamp: 1_700_000_000 + id as u32,
        }
    }

    fn addr(byte: u8) -> String {
        "02".to_string() + &hex::encode([byte; 32])
    }

    #[tokio::test]
    async fn test_block_roundtrip_and_ordering() {
        let (_dir, store) = tmp_store();
        assert_eq!(store.get_next_block_id().await.unwrap(), 0);

        for id in 0..3 {
            store
                .add_block(&test_block(id, &format!("{:064x}", id)))
                .await
                .unwrap();
        }
        assert_eq!(store.get_next_block_id().await.unwrap(), 3);
        assert_eq!(store.get_last_block().await.unwrap().unwrap().id, 2);

        let by_hash = store.get_block(&format!("{:064x}", 1)).await.unwrap().unwrap();
        assert_eq!(by_hash.id, 1);

        let page = store.get_blocks(1, 10).await.unwrap();
        assert_eq!(page.iter().map(|b| b.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unspent_lifecycle() {
        let (_dir, store) = tmp_store();
        let coinbase = ChainTx::Coinbase(crate::primitives::transaction::CoinbaseTransaction::new(
            "ff".repeat(32),
            addr(1),
            dec!(64),
        ));
        store
            .add_unspent_transactions_outputs(&[coinbase.clone()])
            .await
            .unwrap();

        let key = (coinbase.hash(), 0u8);
        let unspent = store.get_unspent_outputs(&[key.clone()]).await.unwrap();
        assert_eq!(unspent, vec![key.clone()]);

        let records = store.get_unspent_output_records(&[key.clone()]).await.unwrap();
        assert_eq!(records[0].amount, dec!(64));
        assert_eq!(records[0].address, addr(1));

        let spender = Transaction {
            inputs: vec![TxInput {
                tx_hash: coinbase.hash(),
                index: 0,
            }],
            outputs: vec![TxOutput {
                address: addr(2),
                amount: dec!(64),
            }],
        };
        store.remove_unspent_outputs(&[spender]).await.unwrap();
        assert!(store.get_unspent_outputs(&[key]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_claims_refused() {
        let (_dir, store) = tmp_store();
        let tx = Transaction {
            inputs: vec![TxInput {
                tx_hash: "aa".repeat(32),
                index: 0,
            }],
            outputs: vec![TxOutput {
                address: addr(3),
                amount: dec!(1),
            }],
        };
        store.add_pending_transaction(&tx, dec!(0)).await.unwrap();
        assert!(matches!(
            store.add_pending_transaction(&tx, dec!(0)).await,
            Err(StoreError::Refused(_))
        ));

        // A different transaction claiming the same prevout is refused too.
        let rival = Transaction {
            inputs: tx.inputs.clone(),
            outputs: vec![TxOutput {
                address: addr(4),
                amount: dec!(1),
            }],
        };
        assert!(matches!(
            store.add_pending_transaction(&rival, dec!(0)).await,
            Err(StoreError::Refused(_))
        ));

        store.remove_pending_transaction(&tx.hash()).await.unwrap();
        assert_eq!(store.get_pending_transaction_count().await.unwrap(), 0);
        // Claim released; the rival is admissible now.
        store.add_pending_transaction(&rival, dec!(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_block_restores_consumed_outputs() {
        let (_dir, store) = tmp_store();

        // Block 0 creates a coinbase output.
        let b0 = test_block(0, &"aa".repeat(32));
        let coinbase = ChainTx::Coinbase(crate::primitives::transaction::CoinbaseTransaction::new(
            b0.hash.clone(),
            addr(1),
            dec!(64),
        ));
        store.add_block(&b0).await.unwrap();
        store.add_transaction(&coinbase, &b0.hash).await.unwrap();
        store
            .add_unspent_transactions_outputs(&[coinbase.clone()])
            .await
            .unwrap();

        // Block 1 spends it.
        let b1 = test_block(1, &"bb".repeat(32));
        let spender = Transaction {
            inputs: vec![TxInput {
                tx_hash: coinbase.hash(),
                index: 0,
            }],
            outputs: vec![TxOutput {
                address: addr(2),
                amount: dec!(64),
            }],
        };
        store.add_block(&b1).await.unwrap();
        store
            .add_transactions(std::slice::from_ref(&spender), &b1.hash)
            .await
            .unwrap();
        store
            .add_unspent_transactions_outputs(&[ChainTx::Regular(spender.clone())])
            .await
            .unwrap();
        store
            .remove_unspent_outputs(std::slice::from_ref(&spender))
            .await
            .unwrap();

        let consumed = (coinbase.hash(), 0u8);
        let created = (spender.hash(), 0u8);
        assert!(store.get_unspent_outputs(&[consumed.clone()]).await.unwrap().is_empty());
        assert_eq!(
            store.get_unspent_outputs(&[created.clone()]).await.unwrap().len(),
            1
        );

        // Rolling block 1 back restores the coinbase output and drops the
        // spender's.
        store.delete_block(1).await.unwrap();
        assert_eq!(
            store.get_unspent_outputs(&[consumed]).await.unwrap().len(),
            1
        );
        assert!(store.get_unspent_outputs(&[created]).await.unwrap().is_empty());
        assert!(store.get_transaction(&spender.hash()).await.unwrap().is_none());
        assert_eq!(store.get_next_block_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_address_index_and_spendable() {
        let (_dir, store) = tmp_store();
        let b0 = test_block(0, &"cc".repeat(32));
        let coinbase = ChainTx::Coinbase(crate::primitives::transaction::CoinbaseTransaction::new(
            b0.hash.clone(),
            addr(9),
            dec!(64),
        ));
        store.add_block(&b0).await.unwrap();
        store.add_transaction(&coinbase, &b0.hash).await.unwrap();
        store
            .add_unspent_transactions_outputs(&[coinbase.clone()])
            .await
            .unwrap();

        let spendable = store.get_spendable_outputs(&addr(9)).await.unwrap();
        assert_eq!(spendable.len(), 1);
        assert_eq!(spendable[0].amount, dec!(64));

        let txs = store.get_address_transactions(&addr(9), 0, 10).await.unwrap();
        assert_eq!(txs, vec![coinbase.hash()]);
        assert!(store
            .get_address_transactions(&addr(8), 0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unspent_hash_tracks_set() {
        let (_dir, store) = tmp_store();
        let empty = store.get_unspent_outputs_hash().await.unwrap();
        let coinbase = ChainTx::Coinbase(crate::primitives::transaction::CoinbaseTransaction::new(
            "dd".repeat(32),
            addr(5),
            dec!(32),
        ));
        store
            .add_unspent_transactions_outputs(&[coinbase])
            .await
            .unwrap();
        assert_ne!(store.get_unspent_outputs_hash().await.unwrap(), empty);
    }
}
