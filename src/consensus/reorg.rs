// Chain reorganization.
//
// Triggered when a peer advertises a longer chain whose block at our tip
// height carries a different hash. The walk-back is non-destructive: the
// common ancestor is located and every orphaned transaction collected
// before a single block is deleted, so a network failure mid-walk aborts
// cleanly. Rollback depth is hard-capped at 200 blocks.

use async_trait::async_trait;
use thiserror::Error;

use crate::consensus::validator::ChainState;
use crate::net::mempool::Mempool;
use crate::node::db::StoreError;
use crate::primitives::transaction::{ChainTx, Transaction};

pub const MAX_REORG_DEPTH: u64 = 200;

#[derive(Debug, Error)]
pub enum ReorgError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("remote peer failed: {0}")]
    Remote(String),
    #[error("local chain is empty")]
    EmptyChain,
    #[error("divergence deeper than {MAX_REORG_DEPTH} blocks")]
    TooDeep,
    #[error("no common ancestor with the remote chain")]
    NoCommonAncestor,
}

/// What the walk-back needs from the remote side.
#[async_trait]
pub trait RemoteChain: Send + Sync {
    async fn block_hash_at(&self, id: u64) -> Result<Option<String>, ReorgError>;
}

#[derive(Debug)]
pub struct ReorgOutcome {
    pub ancestor_id: u64,
    pub rolled_back: u64,
    pub readmitted: usize,
}

/// Locate the common ancestor, roll the local suffix back, and re-admit the
/// orphaned regular transactions best-effort. The caller resumes pull-sync
/// from `ancestor_id + 1` afterwards.
pub async fn rollback_to_common_ancestor(
    chain: &ChainState,
    mempool: &mut Mempool,
    remote: &dyn RemoteChain,
) -> Result<ReorgOutcome, ReorgError> {
    let store = chain.store().clone();
    let tip = store.get_last_block().await?.ok_or(ReorgError::EmptyChain)?;

    // Phase 1: find the ancestor without touching local state.
    let mut ancestor: Option<u64> = None;
    let mut height = tip.id;
    loop {
        if tip.id - height > MAX_REORG_DEPTH {
            return Err(ReorgError::TooDeep);
        }
        let local = store
            .get_block_by_id(height)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("missing block {height}")))?;
        let remote_hash = remote
            .block_hash_at(height)
            .await?
            .ok_or_else(|| ReorgError::Remote(format!("peer has no block {height}")))?;
        if remote_hash == local.hash {
            ancestor = Some(height);
            break;
        }
        if height == 0 {
            break;
        }
        height -= 1;
        tokio::task::yield_now().await;
    }
    let ancestor_id = ancestor.ok_or(ReorgError::NoCommonAncestor)?;

    // Phase 2: collect the orphaned transactions, oldest block first, so
    // re-admission sees parents before children.
    let mut orphaned: Vec<Transaction> = Vec::new();
    for id in (ancestor_id + 1)..=tip.id {
        let Some(block) = store.get_block_by_id(id).await? else {
            continue;
        };
        for tx in store.get_block_transactions(&block.hash).await? {
            if let ChainTx::Regular(regular) = tx {
                orphaned.push(regular);
            }
        }
    }

    // Phase 3: destructive rollback. The store restores the unspent set per
    // deleted block.
    store.remove_blocks(ancestor_id + 1).await?;
    chain.invalidate_difficulty().await;

    // Phase 4: best-effort re-admission.
    let mut readmitted = 0usize;
    for tx in orphaned {
        if mempool.add_transaction(store.as_ref(), tx).await.is_ok() {
            readmitted += 1;
        }
    }

    eprintln!(
        "[reorg] rolled back to block {ancestor_id}, re-admitted {readmitted} transaction(s)"
    );
    Ok(ReorgOutcome {
        ancestor_id,
        rolled_back: tip.id - ancestor_id,
        readmitted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::db::Block;
    use crate::node::db_rocksdb::RocksStore;
    use crate::primitives::transaction::{CoinbaseTransaction, TxInput, TxOutput};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FakeRemote {
        hashes: HashMap<u64, String>,
    }

    #[async_trait]
    impl RemoteChain for FakeRemote {
        async fn block_hash_at(&self, id: u64) -> Result<Option<String>, ReorgError> {
            Ok(self.hashes.get(&id).cloned())
        }
    }

    struct FailingRemote;

    #[async_trait]
    impl RemoteChain for FailingRemote {
        async fn block_hash_at(&self, _id: u64) -> Result<Option<String>, ReorgError> {
            Err(ReorgError::Remote("connection reset".to_string()))
        }
    }

    fn addr(byte: u8) -> String {
        "02".to_string() + &hex::encode([byte; 32])
    }

    fn local_hash(id: u64) -> String {
        crate::crypto::hash::sha256_hex(&id.to_be_bytes())
    }

    fn chain_on_tmp() -> (tempfile::TempDir, ChainState) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (dir, ChainState::new(Arc::new(store)))
    }

    async fn seed_block(chain: &ChainState, id: u64) -> Block {
        let block = Block {
            id,
            hash: local_hash(id),
            content: String::new(),
            address: addr(1),
            nonce: 0,
            difficulty: dec!(6.0),
            reward: dec!(64),
            timestamp: 1_700_000_000 + id as u32,
        };
        chain.store().add_block(&block).await.unwrap();
        block
    }

    /// Remote agreeing with local up to `fork`, diverging after.
    fn remote_forking_at(fork: u64, tip: u64) -> FakeRemote {
        let mut hashes = HashMap::new();
        for id in 0..=tip {
            let hash = if id <= fork {
                local_hash(id)
            } else {
                crate::crypto::hash::sha256_hex(format!("remote-{id}").as_bytes())
            };
            hashes.insert(id, hash);
        }
        FakeRemote { hashes }
    }

    #[tokio::test]
    async fn test_rollback_to_fork_point() {
        let (_dir, chain) = chain_on_tmp();
        for id in 0..=10 {
            seed_block(&chain, id).await;
        }

        // Block 7 funds an output which block 9's transaction spends.
        let funding = ChainTx::Coinbase(CoinbaseTransaction::new(
            local_hash(7),
            addr(2),
            dec!(64),
        ));
        chain
            .store()
            .add_transaction(&funding, &local_hash(7))
            .await
            .unwrap();
        chain
            .store()
            .add_unspent_transactions_outputs(std::slice::from_ref(&funding))
            .await
            .unwrap();

        let orphan_tx = Transaction {
            inputs: vec![TxInput {
                tx_hash: funding.hash(),
                index: 0,
            }],
            outputs: vec![TxOutput {
                address: addr(3),
                amount: dec!(60),
            }],
        };
        chain
            .store()
            .add_transactions(std::slice::from_ref(&orphan_tx), &local_hash(9))
            .await
            .unwrap();
        chain
            .store()
            .add_unspent_transactions_outputs(&[ChainTx::Regular(orphan_tx.clone())])
            .await
            .unwrap();
        chain
            .store()
            .remove_unspent_outputs(std::slice::from_ref(&orphan_tx))
            .await
            .unwrap();

        let remote = remote_forking_at(7, 12);
        let mut pool = Mempool::new();
        let outcome = rollback_to_common_ancestor(&chain, &mut pool, &remote)
            .await
            .unwrap();

        assert_eq!(outcome.ancestor_id, 7);
        assert_eq!(outcome.rolled_back, 3);
        assert_eq!(outcome.readmitted, 1);

        // Tip is back at the ancestor and the orphaned tx is pending again.
        assert_eq!(chain.store().get_next_block_id().await.unwrap(), 8);
        assert!(pool.contains(&orphan_tx.hash()));
    }

    #[tokio::test]
    async fn test_deep_divergence_rejected() {
        let (_dir, chain) = chain_on_tmp();
        for id in 0..=250 {
            seed_block(&chain, id).await;
        }
        let remote = remote_forking_at(10, 260);

        let mut pool = Mempool::new();
        let err = rollback_to_common_ancestor(&chain, &mut pool, &remote)
            .await
            .unwrap_err();
        assert!(matches!(err, ReorgError::TooDeep));
        // Nothing was deleted.
        assert_eq!(chain.store().get_next_block_id().await.unwrap(), 251);
    }

    #[tokio::test]
    async fn test_network_failure_aborts_without_damage() {
        let (_dir, chain) = chain_on_tmp();
        for id in 0..=5 {
            seed_block(&chain, id).await;
        }

        let mut pool = Mempool::new();
        let err = rollback_to_common_ancestor(&chain, &mut pool, &FailingRemote)
            .await
            .unwrap_err();
        assert!(matches!(err, ReorgError::Remote(_)));
        assert_eq!(chain.store().get_next_block_id().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_genesis_mismatch_has_no_ancestor() {
        let (_dir, chain) = chain_on_tmp();
        for id in 0..=5 {
            seed_block(&chain, id).await;
        }
        // A remote on a completely different chain.
        let mut hashes = HashMap::new();
        for id in 0..=8u64 {
            hashes.insert(
                id,
                crate::crypto::hash::sha256_hex(format!("alien-{id}").as_bytes()),
            );
        }
        let remote = FakeRemote { hashes };

        let mut pool = Mempool::new();
        let err = rollback_to_common_ancestor(&chain, &mut pool, &remote)
            .await
            .unwrap_err();
        assert!(matches!(err, ReorgError::NoCommonAncestor));
        assert_eq!(chain.store().get_next_block_id().await.unwrap(), 6);
    }
}
