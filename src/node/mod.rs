pub mod db;
pub mod db_rocksdb;

pub use db::{Block, ChainStore, PendingRecord, StoreError, TxRecord, UtxoRecord};
pub use db_rocksdb::RocksStore;
