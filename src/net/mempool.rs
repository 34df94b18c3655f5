// Transaction mempool.
//
// In-memory pool of unconfirmed transactions mirrored into the pending
// store. Admission is atomic: the store insert happens first, and only a
// successful insert mutates the map, so pool and storage always agree.
// The conflict sweep runs to a fixed point: intra-pool input collisions
// drop the later arrival, inputs that are neither unspent on chain nor
// covered by another pending transaction drop every claimant, and a pool
// whose inputs have all vanished is cleared outright (the chain moved).

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::node::db::{ChainStore, StoreError};
use crate::primitives::transaction::Transaction;

pub const MAX_PENDING: usize = 10_000;
const SWEEP_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already pending")]
    Duplicate,
    #[error("transaction failed verification")]
    Invalid,
    #[error("storage refused the transaction: {0}")]
    Refused(StoreError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub inserted_at: u64,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<String, MempoolEntry>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool {
            entries: HashMap::new(),
        }
    }

    /// Rebuild the in-memory pool from the pending store at startup.
    pub async fn hydrate(&mut self, store: &dyn ChainStore) -> Result<(), StoreError> {
        self.entries.clear();
        for (hash, tx, inserted_at) in store.get_pending_transactions(MAX_PENDING).await? {
            self.entries.insert(hash, MempoolEntry { tx, inserted_at });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.entries.contains_key(tx_hash)
    }

    pub fn hashes(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Entries oldest first; ties broken by hash for determinism.
    pub fn entries_in_order(&self) -> Vec<(String, Transaction)> {
        let mut ordered: Vec<(&String, &MempoolEntry)> = self.entries.iter().collect();
        ordered.sort_by(|a, b| {
            a.1.inserted_at
                .cmp(&b.1.inserted_at)
                .then_with(|| a.0.cmp(b.0))
        });
        ordered
            .into_iter()
            .map(|(hash, entry)| (hash.clone(), entry.tx.clone()))
            .collect()
    }

    /// Admit one transaction. Rejects duplicates, verification failures,
    /// and storage refusals; evicts the oldest tenth of the pool first
    /// when strictly full.
    pub async fn add_transaction(
        &mut self,
        store: &dyn ChainStore,
        tx: Transaction,
    ) -> Result<String, MempoolError> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) {
            return Err(MempoolError::Duplicate);
        }

        if self.entries.len() >= MAX_PENDING {
            self.evict_oldest(store, MAX_PENDING / 10).await?;
        }

        if !tx.verify(store, true).await? {
            return Err(MempoolError::Invalid);
        }
        let fees = match tx.fees(store).await? {
            Some(fees) if fees >= rust_decimal::Decimal::ZERO => fees,
            _ => return Err(MempoolError::Invalid),
        };

        if let Err(e) = store.add_pending_transaction(&tx, fees).await {
            return match e {
                StoreError::Refused(_) => Err(MempoolError::Refused(e)),
                other => Err(MempoolError::Store(other)),
            };
        }
        self.entries.insert(
            hash.clone(),
            MempoolEntry {
                tx,
                inserted_at: unix_now(),
            },
        );
        Ok(hash)
    }

    pub async fn remove(
        &mut self,
        store: &dyn ChainStore,
        tx_hash: &str,
    ) -> Result<(), StoreError> {
        store.remove_pending_transaction(tx_hash).await?;
        self.entries.remove(tx_hash);
        Ok(())
    }

    /// Drop transactions included in a block (store rows were already
    /// removed inside `create_block`).
    pub fn forget_included(&mut self, hashes: &[String]) {
        for hash in hashes {
            self.entries.remove(hash);
        }
    }

    async fn evict_oldest(
        &mut self,
        store: &dyn ChainStore,
        count: usize,
    ) -> Result<(), StoreError> {
        let victims: Vec<String> = self
            .entries_in_order()
            .into_iter()
            .take(count.max(1))
            .map(|(hash, _)| hash)
            .collect();
        for hash in victims {
            self.remove(store, &hash).await?;
        }
        Ok(())
    }

    /// Iterative conflict sweep, bounded to 100 passes.
    pub async fn clear_pending_transactions(
        &mut self,
        store: &dyn ChainStore,
    ) -> Result<(), StoreError> {
        for _ in 0..SWEEP_MAX_ITERATIONS {
            let mut changed = false;

            // Intra-pool conflicts: the later claimant of a shared input
            // loses.
            let ordered = self.entries_in_order();
            let mut used: HashSet<(String, u8)> = HashSet::new();
            let mut losers = Vec::new();
            for (hash, tx) in &ordered {
                let keys = tx.input_keys();
                if keys.iter().any(|k| used.contains(k)) {
                    losers.push(hash.clone());
                } else {
                    used.extend(keys);
                }
            }
            for hash in losers {
                self.remove(store, &hash).await?;
                changed = true;
            }

            if used.is_empty() {
                break;
            }

            // Double-spends against the chain. Inputs covered by another
            // pending transaction's outputs are dependencies, not
            // double-spends.
            let keys: Vec<(String, u8)> = used.iter().cloned().collect();
            let unspent: HashSet<(String, u8)> =
                store.get_unspent_outputs(&keys).await?.into_iter().collect();
            let missing: HashSet<(String, u8)> = used
                .iter()
                .filter(|(hash, index)| {
                    !unspent.contains(&(hash.clone(), *index)) && !self.covers_output(hash, *index)
                })
                .cloned()
                .collect();

            if !missing.is_empty() {
                if missing.len() == used.len() {
                    // Nothing the pool references exists any more.
                    self.entries.clear();
                    store.remove_all_pending_transactions().await?;
                    break;
                }
                let doomed: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| {
                        entry.tx.input_keys().iter().any(|k| missing.contains(k))
                    })
                    .map(|(hash, _)| hash.clone())
                    .collect();
                for hash in doomed {
                    self.remove(store, &hash).await?;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn covers_output(&self, tx_hash: &str, index: u8) -> bool {
        self.entries
            .get(tx_hash)
            .map(|entry| (index as usize) < entry.tx.outputs.len())
            .unwrap_or(false)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
