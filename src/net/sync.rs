// Sync orchestration.
//
// Handshakes negotiate direction from the height comparison alone: the
// side that is behind either pulls from us (409 sync_required) or is asked
// to push to us (200 sync_requested). Push-sync streams bounded batches to
// one peer at a time; pull-sync validates batches of 100 in strict height
// order and stops at the first bad block. A slot manager caps the node at
// one active pull and three active pushes; everything beyond fails fast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::consensus::validator::{BlockError, ChainState};
use crate::crypto::hash::sha256_hex;
use crate::net::client::{ClientError, NodeInterface};
use crate::net::mempool::Mempool;
use crate::node::db::{ChainStore, StoreError};
use crate::primitives::transaction::{ChainTx, Transaction};

pub const CHALLENGE_TTL_SECS: u64 = 300;
pub const CHALLENGE_CAP: usize = 10_000;
pub const NONCE_TTL_SECS: u64 = 300;
pub const NONCE_CAP: usize = 10_000;

pub const PUSH_BATCH_MAX_BLOCKS: usize = 128;
pub const PUSH_BATCH_MAX_BYTES: usize = 20 * 1024 * 1024;
pub const PULL_BATCH_BLOCKS: usize = 100;
pub const SUBMIT_BLOCKS_MAX: usize = 512;

pub const MAX_ACTIVE_PUSHES: usize = 3;
pub const PUSH_TRACKER_CAP: usize = 100;

pub const PROPAGATION_TTL_SECS: u64 = 600;
pub const PROPAGATION_FANOUT: usize = 20;
pub const GOSSIP_PERMITS: usize = 50;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer: {0}")]
    Client(#[from] ClientError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("block rejected: {0}")]
    Block(#[from] BlockError),
    #[error("sync slots busy")]
    Busy,
    #[error("peer rejected the sync: {0}")]
    Rejected(String),
    #[error("malformed sync payload: {0}")]
    BadPayload(&'static str),
}

/// One block as carried by push/pull sync and miner submission. The
/// transaction list holds regular transactions only; the receiver
/// synthesizes the coinbase itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub block_content: String,
    #[serde(default)]
    pub txs: Vec<String>,
}

impl BlockPayload {
    /// Parse the regular transactions. A coinbase in the list is dropped;
    /// the receiver synthesizes its own, and the Merkle check catches any
    /// sender that counted one in.
    pub fn parse_txs(&self) -> Result<Vec<Transaction>, SyncError> {
        let mut out = Vec::with_capacity(self.txs.len());
        for hex in &self.txs {
            match ChainTx::from_hex(hex) {
                Ok(ChainTx::Regular(tx)) => out.push(tx),
                Ok(ChainTx::Coinbase(_)) => {}
                Err(_) => return Err(SyncError::BadPayload("bad tx hex")),
            }
        }
        Ok(out)
    }

    fn wire_size(&self) -> usize {
        self.block_content.len() + self.txs.iter().map(String::len).sum::<usize>()
    }
}

// --- handshake ----------------------------------------------------------

/// Server-side decision after a verified phase-2 handshake.
#[derive(Debug, PartialEq)]
pub enum HandshakeDecision {
    /// Peer is ahead: ask it to push blocks to us.
    SyncRequested { start_block: i64, target_block: i64 },
    /// Peer is behind: tell it to pull from us.
    SyncRequired { next_block_expected: i64 },
    InSync,
}

pub fn handshake_decision(local_height: i64, peer_height: i64) -> HandshakeDecision {
    if peer_height > local_height {
        HandshakeDecision::SyncRequested {
            start_block: local_height + 1,
            target_block: peer_height + 1,
        }
    } else if peer_height < local_height {
        HandshakeDecision::SyncRequired {
            next_block_expected: peer_height + 1,
        }
    } else {
        HandshakeDecision::InSync
    }
}

/// Single-use handshake challenges with a 300 s TTL. When the store
/// overflows, the oldest half is evicted.
#[derive(Default)]
pub struct ChallengeStore {
    challenges: HashMap<String, u64>,
}

impl ChallengeStore {
    pub fn issue(&mut self) -> String {
        if self.challenges.len() >= CHALLENGE_CAP {
            let mut by_age: Vec<(String, u64)> = self
                .challenges
                .iter()
                .map(|(c, at)| (c.clone(), *at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (challenge, _) in by_age.into_iter().take(CHALLENGE_CAP / 2) {
                self.challenges.remove(&challenge);
            }
        }
        let mut bytes = [0u8; 32];
        let _ = getrandom::getrandom(&mut bytes);
        let challenge = hex::encode(bytes);
        self.challenges.insert(challenge.clone(), unix_now());
        challenge
    }

    /// Consume a challenge; false when unknown, expired, or already used.
    pub fn consume(&mut self, challenge: &str) -> bool {
        match self.challenges.remove(challenge) {
            Some(at) => unix_now().saturating_sub(at) <= CHALLENGE_TTL_SECS,
            None => false,
        }
    }

    pub fn gc(&mut self) {
        let cutoff = unix_now().saturating_sub(CHALLENGE_TTL_SECS);
        self.challenges.retain(|_, at| *at > cutoff);
    }
}

/// Replay defense: (node_id, nonce) pairs remembered for the timestamp
/// window.
#[derive(Default)]
pub struct NonceCache {
    seen: HashMap<(String, String), u64>,
}

impl NonceCache {
    /// True when the nonce is fresh; false on replay.
    pub fn check_and_insert(&mut self, node_id: &str, nonce: &str) -> bool {
        if self.seen.len() >= NONCE_CAP {
            self.gc();
        }
        let key = (node_id.to_string(), nonce.to_string());
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, unix_now());
        true
    }

    pub fn gc(&mut self) {
        let cutoff = unix_now().saturating_sub(NONCE_TTL_SECS);
        self.seen.retain(|_, at| *at > cutoff);
    }
}

// --- exclusion ----------------------------------------------------------

/// At most one active pull and three active pushes node-wide.
#[derive(Default)]
pub struct SyncSlots {
    pull_active: bool,
    pushes_active: usize,
}

impl SyncSlots {
    pub fn try_begin_pull(&mut self) -> bool {
        if self.pull_active {
            return false;
        }
        self.pull_active = true;
        true
    }

    pub fn end_pull(&mut self) {
        self.pull_active = false;
    }

    pub fn try_begin_push(&mut self) -> bool {
        if self.pushes_active >= MAX_ACTIVE_PUSHES {
            return false;
        }
        self.pushes_active += 1;
        true
    }

    pub fn end_push(&mut self) {
        self.pushes_active = self.pushes_active.saturating_sub(1);
    }
}

/// One push-sync per target peer, tracker bounded to 100 peers.
#[derive(Default)]
pub struct PushTracker {
    active: HashMap<String, u64>,
}

impl PushTracker {
    pub fn try_begin(&mut self, node_id: &str) -> bool {
        if self.active.contains_key(node_id) {
            return false;
        }
        if self.active.len() >= PUSH_TRACKER_CAP {
            if let Some(oldest) = self
                .active
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                self.active.remove(&oldest);
            }
        }
        self.active.insert(node_id.to_string(), unix_now());
        true
    }

    pub fn end(&mut self, node_id: &str) {
        self.active.remove(node_id);
    }
}

/// Duplicate suppression for gossip, keyed by content hash.
#[derive(Default)]
pub struct PropagationCache {
    seen: HashMap<String, u64>,
}

impl PropagationCache {
    /// True when this payload has not been propagated recently.
    pub fn check_and_insert(&mut self, path: &str, payload: &Value) -> bool {
        let key = sha256_hex(format!("{path}:{payload}").as_bytes());
        let now = unix_now();
        if let Some(at) = self.seen.get(&key) {
            if now.saturating_sub(*at) < PROPAGATION_TTL_SECS {
                return false;
            }
        }
        self.seen.insert(key, now);
        true
    }

    pub fn gc(&mut self) {
        let cutoff = unix_now().saturating_sub(PROPAGATION_TTL_SECS);
        self.seen.retain(|_, at| *at > cutoff);
    }
}

// --- push ---------------------------------------------------------------

/// Build the payload batches for a push from `start_block` up to (not
/// including) `target_block`.
pub async fn collect_push_batches(
    store: &dyn ChainStore,
    start_block: u64,
    target_block: u64,
) -> Result<Vec<Vec<BlockPayload>>, SyncError> {
    let mut batches = Vec::new();
    let mut current: Vec<BlockPayload> = Vec::new();
    let mut current_bytes = 0usize;

    for id in start_block..target_block {
        let Some(block) = store.get_block_by_id(id).await? else {
            break;
        };
        let txs: Vec<String> = store
            .get_block_transactions(&block.hash)
            .await?
            .into_iter()
            .filter_map(|tx| match tx {
                ChainTx::Regular(regular) => Some(regular.hex()),
                ChainTx::Coinbase(_) => None,
            })
            .collect();
        let payload = BlockPayload {
            id: Some(id),
            block_content: block.content,
            txs,
        };

        let size = payload.wire_size();
        if !current.is_empty()
            && (current.len() >= PUSH_BATCH_MAX_BLOCKS || current_bytes + size > PUSH_BATCH_MAX_BYTES)
        {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(payload);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Stream blocks to a peer that asked for them. A "sequence" rejection
/// means another peer is already syncing them; yield silently.
pub async fn push_sync(
    store: &dyn ChainStore,
    peer: &NodeInterface,
    start_block: u64,
    target_block: u64,
) -> Result<(), SyncError> {
    let batches = collect_push_batches(store, start_block, target_block).await?;
    for batch in batches {
        let response = peer.submit_blocks(json!(batch)).await?;
        if !response.ok() {
            let error = response
                .body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            if error.to_lowercase().contains("sequence") {
                return Ok(());
            }
            return Err(SyncError::Rejected(error));
        }
    }
    Ok(())
}

// --- pull ---------------------------------------------------------------

/// Fetch and validate blocks from a peer, batch by batch, starting right
/// above the local tip. Returns how many blocks were applied; the first
/// invalid block aborts.
pub async fn pull_sync(
    chain: &ChainState,
    mempool: &Mutex<Mempool>,
    peer: &NodeInterface,
) -> Result<u64, SyncError> {
    let mut applied = 0u64;
    loop {
        let offset = chain.store().get_next_block_id().await?;
        let response = peer.get_blocks(offset, PULL_BATCH_BLOCKS).await?;
        let blocks = response
            .result()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if blocks.is_empty() {
            break;
        }
        let count = blocks.len();

        for entry in blocks {
            let payload = parse_remote_block(&entry)?;
            let txs = payload.parse_txs()?;
            let hashes: Vec<String> = txs.iter().map(|tx| tx.hash()).collect();

            let _guard = chain.block_processing_guard().await;
            chain.create_block(&payload.block_content, txs).await?;
            mempool.lock().await.forget_included(&hashes);
            applied += 1;
        }

        if count < PULL_BATCH_BLOCKS {
            break;
        }
    }
    Ok(applied)
}

/// Remote `get_blocks` entries arrive as `{block: {...}, transactions:
/// [hex]}`.
fn parse_remote_block(entry: &Value) -> Result<BlockPayload, SyncError> {
    let block = entry.get("block").ok_or(SyncError::BadPayload("missing block"))?;
    let content = block
        .get("content")
        .and_then(Value::as_str)
        .ok_or(SyncError::BadPayload("missing content"))?;
    let txs = entry
        .get("transactions")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    Ok(BlockPayload {
        id: block.get("id").and_then(Value::as_u64),
        block_content: content.to_string(),
        txs,
    })
}

// --- gossip -------------------------------------------------------------

/// Best-effort fan-out of a signed call to a random sample of active
/// peers, bounded by the gossip semaphore. Unreachable peers are dropped
/// from the registry without penalty.
pub async fn propagate(
    registry: &Mutex<crate::net::peers::PeerRegistry>,
    reputation: &Mutex<crate::net::peers::ReputationManager>,
    cache: &Mutex<PropagationCache>,
    semaphore: &Arc<Semaphore>,
    client: reqwest::Client,
    identity: Arc<crate::crypto::identity::NodeIdentity>,
    self_url: Option<String>,
    path: &str,
    payload: Value,
    exclude: &HashSet<String>,
) {
    if !cache.lock().await.check_and_insert(path, &payload) {
        return;
    }

    let targets: Vec<(String, String)> = registry
        .lock()
        .await
        .propagate_peers(PROPAGATION_FANOUT)
        .into_iter()
        .filter(|(id, _)| !exclude.contains(id))
        .filter_map(|(id, peer)| peer.url.map(|url| (id, url)))
        .collect();

    let mut handles = Vec::new();
    for (node_id, url) in targets {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let interface = NodeInterface::new(&url, client.clone(), identity.clone(), self_url.clone());
        let payload = payload.clone();
        let path = path.to_string();
        handles.push((
            node_id,
            tokio::spawn(async move {
                let _permit = permit;
                interface.signed_request(&path, payload, None).await
            }),
        ));
    }

    for (node_id, handle) in handles {
        match handle.await {
            Ok(Ok(response)) if response.ok() || response.status == 409 => {
                registry.lock().await.update_last_seen(&node_id);
            }
            Ok(Ok(_)) => {
                reputation
                    .lock()
                    .await
                    .record_violation(&node_id, crate::net::peers::Violation::PropagationFailure);
            }
            Ok(Err(_)) | Err(_) => {
                // Unreachable, not malicious.
                registry.lock().await.remove_peer(&node_id);
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_directions() {
        assert_eq!(
            handshake_decision(10, 15),
            HandshakeDecision::SyncRequested {
                start_block: 11,
                target_block: 16
            }
        );
        assert_eq!(
            handshake_decision(10, 4),
            HandshakeDecision::SyncRequired {
                next_block_expected: 5
            }
        );
        assert_eq!(handshake_decision(10, 10), HandshakeDecision::InSync);
        // Empty chains are height -1.
        assert_eq!(
            handshake_decision(-1, 0),
            HandshakeDecision::SyncRequested {
                start_block: 0,
                target_block: 1
            }
        );
    }

    #[test]
    fn test_challenge_single_use() {
        let mut store = ChallengeStore::default();
        let challenge = store.issue();
        assert!(store.consume(&challenge));
        assert!(!store.consume(&challenge));
        assert!(!store.consume("not a challenge"));
    }

    #[test]
    fn test_challenge_eviction_at_cap() {
        let mut store = ChallengeStore::default();
        for _ in 0..CHALLENGE_CAP {
            store.issue();
        }
        assert_eq!(store.challenges.len(), CHALLENGE_CAP);
        store.issue();
        // Oldest half evicted, the new one inserted.
        assert_eq!(store.challenges.len(), CHALLENGE_CAP / 2 + 1);
    }

    #[test]
    fn test_nonce_replay_detected() {
        let mut cache = NonceCache::default();
        assert!(cache.check_and_insert("node-a", "abcd"));
        assert!(!cache.check_and_insert("node-a", "abcd"));
        // A different node may use the same nonce.
        assert!(cache.check_and_insert("node-b", "abcd"));
    }

    #[test]
    fn test_sync_slots() {
        let mut slots = SyncSlots::default();
        assert!(slots.try_begin_pull());
        assert!(!slots.try_begin_pull());
        slots.end_pull();
        assert!(slots.try_begin_pull());

        for _ in 0..MAX_ACTIVE_PUSHES {
            assert!(slots.try_begin_push());
        }
        assert!(!slots.try_begin_push());
        slots.end_push();
        assert!(slots.try_begin_push());
    }

    #[test]
    fn test_push_tracker_single_flight() {
        let mut tracker = PushTracker::default();
        assert!(tracker.try_begin("peer-a"));
        assert!(!tracker.try_begin("peer-a"));
        tracker.end("peer-a");
        assert!(tracker.try_begin("peer-a"));
    }

    #[test]
    fn test_propagation_duplicate_suppression() {
        let mut cache = PropagationCache::default();
        let payload = json!({"tx_hex": "aabb"});
        assert!(cache.check_and_insert("push_tx", &payload));
        assert!(!cache.check_and_insert("push_tx", &payload));
        assert!(cache.check_and_insert("push_tx", &json!({"tx_hex": "ccdd"})));
    }

    #[tokio::test]
    async fn test_push_batches_respect_block_cap() {
        use crate::node::db::Block;
        use crate::node::db_rocksdb::RocksStore;
        use rust_decimal_macros::dec;

        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for id in 0..((PUSH_BATCH_MAX_BLOCKS + 10) as u64) {
            store
                .add_block(&Block {
                    id,
                    hash: sha256_hex(&id.to_be_bytes()),
                    content: "ab".repeat(69),
                    address: "02".to_string() + &"11".repeat(32),
                    nonce: 0,
                    difficulty: dec!(6.0),
                    reward: dec!(64),
                    timestamp: id as u32,
                })
                .await
                .unwrap();
        }

        let batches = collect_push_batches(&store, 0, (PUSH_BATCH_MAX_BLOCKS + 10) as u64)
            .await
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), PUSH_BATCH_MAX_BLOCKS);
        assert_eq!(batches[1].len(), 10);
        assert_eq!(batches[0][0].id, Some(0));
        assert_eq!(batches[1][9].id, Some((PUSH_BATCH_MAX_BLOCKS + 9) as u64));
    }
}
