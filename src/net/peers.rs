// Peer registry and reputation.
//
// Peers are plain records keyed by node id; cross-references between peers
// are id lookups, never ownership links. The registry is rewritten to
// peers.json atomically (temp file + rename) after every mutation.
// Reputation is separate bookkeeping: violations subtract 10 × severity,
// scores are clamped to [-100, 100], and a floor score bans the peer.
// Unreachable is not malicious: network failures only drop the peer from
// the registry, and rediscovery is allowed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Peers silent for longer than this are skipped for propagation.
pub const ACTIVE_NODES_DELTA: u64 = 60 * 60 * 24 * 7;
pub const MAX_PEERS_COUNT: usize = 200;

pub const REPUTATION_FLOOR: i64 = -100;
pub const REPUTATION_CEILING: i64 = 100;
const VIOLATION_TTL_SECS: u64 = 86_400;
const MAX_VIOLATIONS_PER_PEER: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub pubkey: String,
    pub url: Option<String>,
    pub last_seen: u64,
    pub is_public: bool,
}

#[derive(Serialize, Deserialize, Default)]
struct PeerFile {
    peers: HashMap<String, PeerRecord>,
}

pub struct PeerRegistry {
    path: PathBuf,
    self_id: String,
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    /// Load peers.json, starting empty when absent or unreadable.
    pub fn load(path: PathBuf, self_id: String) -> Self {
        let peers = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PeerFile>(&raw).ok())
            .map(|file| file.peers)
            .unwrap_or_default();
        PeerRegistry {
            path,
            self_id,
            peers,
        }
    }

    fn sync(&self) {
        let file = PeerFile {
            peers: self.peers.clone(),
        };
        let Ok(serialized) = serde_json::to_string_pretty(&file) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("json.tmp");
        if std::fs::write(&tmp, serialized).is_ok() {
            let _ = std::fs::rename(&tmp, &self.path);
        }
    }

    /// Insert or refresh a peer. Self-records and overflow beyond the table
    /// cap are ignored. Returns whether the peer was new.
    pub fn add_or_update_peer(
        &mut self,
        node_id: &str,
        pubkey: &str,
        url: Option<String>,
        is_public: bool,
    ) -> bool {
        if node_id == self.self_id {
            return false;
        }
        let is_new = !self.peers.contains_key(node_id);
        if is_new && self.peers.len() >= MAX_PEERS_COUNT {
            eprintln!("[peers] table full, not adding {node_id}");
            return false;
        }
        self.peers.insert(
            node_id.to_string(),
            PeerRecord {
                pubkey: pubkey.to_string(),
                url: url.map(|u| u.trim_end_matches('/').to_string()),
                last_seen: unix_now(),
                is_public,
            },
        );
        self.sync();
        is_new
    }

    pub fn update_last_seen(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.last_seen = unix_now();
            self.sync();
        }
    }

    /// Non-punitive removal: the peer was unreachable, not malicious.
    pub fn remove_peer(&mut self, node_id: &str) -> bool {
        let removed = self.peers.remove(node_id).is_some();
        if removed {
            self.sync();
        }
        removed
    }

    pub fn get_peer(&self, node_id: &str) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    pub fn find_peer_by_url(&self, url: &str) -> Option<String> {
        let url = url.trim_end_matches('/');
        self.peers
            .iter()
            .find(|(_, peer)| peer.url.as_deref() == Some(url))
            .map(|(id, _)| id.clone())
    }

    pub fn all_peers(&self) -> Vec<(String, PeerRecord)> {
        self.peers
            .iter()
            .map(|(id, peer)| (id.clone(), peer.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Recently seen peers, most recent first.
    pub fn recent_peers(&self) -> Vec<(String, PeerRecord)> {
        let cutoff = unix_now().saturating_sub(ACTIVE_NODES_DELTA);
        let mut active: Vec<(String, PeerRecord)> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_seen > cutoff)
            .map(|(id, peer)| (id.clone(), peer.clone()))
            .collect();
        active.sort_by(|a, b| b.1.last_seen.cmp(&a.1.last_seen));
        active
    }

    /// A random sample of active, dialable peers for gossip fan-out.
    pub fn propagate_peers(&self, limit: usize) -> Vec<(String, PeerRecord)> {
        let mut candidates: Vec<(String, PeerRecord)> = self
            .recent_peers()
            .into_iter()
            .filter(|(_, peer)| peer.url.is_some())
            .collect();
        if candidates.len() <= limit {
            return candidates;
        }
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(limit);
        candidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    InvalidTransaction,
    InvalidUrl,
    InvalidHandshake,
    InvalidBlock,
    InvalidSyncBlock,
    OversizedBlock,
    NonContinuousBlocks,
    RejectedSync,
    PropagationFailure,
}

impl Violation {
    pub fn severity(&self) -> i64 {
        match self {
            Violation::InvalidTransaction => 2,
            Violation::InvalidUrl => 3,
            Violation::InvalidHandshake => 6,
            Violation::InvalidBlock => 7,
            Violation::InvalidSyncBlock => 8,
            Violation::OversizedBlock => 3,
            Violation::NonContinuousBlocks => 4,
            Violation::RejectedSync => 3,
            Violation::PropagationFailure => 1,
        }
    }
}

#[derive(Debug, Default)]
struct PeerReputation {
    score: i64,
    violations: Vec<(u64, Violation)>,
}

#[derive(Default)]
pub struct ReputationManager {
    peers: HashMap<String, PeerReputation>,
}

impl ReputationManager {
    pub fn new() -> Self {
        ReputationManager {
            peers: HashMap::new(),
        }
    }

    pub fn record_violation(&mut self, node_id: &str, violation: Violation) -> i64 {
        let entry = self.peers.entry(node_id.to_string()).or_default();
        entry.score = (entry.score - 10 * violation.severity())
            .clamp(REPUTATION_FLOOR, REPUTATION_CEILING);
        if entry.violations.len() < MAX_VIOLATIONS_PER_PEER {
            entry.violations.push((unix_now(), violation));
        }
        eprintln!(
            "[reputation] {node_id} violated ({violation:?}), score now {}",
            entry.score
        );
        entry.score
    }

    pub fn reward(&mut self, node_id: &str, points: i64) -> i64 {
        let entry = self.peers.entry(node_id.to_string()).or_default();
        entry.score = (entry.score + points).clamp(REPUTATION_FLOOR, REPUTATION_CEILING);
        entry.score
    }

    pub fn score(&self, node_id: &str) -> i64 {
        self.peers.get(node_id).map(|p| p.score).unwrap_or(0)
    }

    pub fn is_banned(&self, node_id: &str) -> bool {
        self.score(node_id) <= REPUTATION_FLOOR
    }

    /// Drop expired violations and forget peers in good standing.
    pub fn gc(&mut self) {
        let cutoff = unix_now().saturating_sub(VIOLATION_TTL_SECS);
        self.peers.retain(|_, entry| {
            entry.violations.retain(|(at, _)| *at > cutoff);
            !(entry.violations.is_empty() && entry.score >= 0)
        });
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

    fn tmp_registry() -> (tempfile::TempDir, PeerRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = PeerRegistry::load(dir.path().join("peers.json"), "self".to_string());
        (dir, registry)
    }

    #[test]
    fn test_add_update_and_persist() {
        let (dir, mut registry) = tmp_registry();
        assert!(registry.add_or_update_peer("a", "pk-a", Some("http://a/".to_string()), true));
        assert!(!registry.add_or_update_peer("a", "pk-a", Some("http://a".to_string()), true));
        assert_eq!(registry.get_peer("a").unwrap().url.as_deref(), Some("http://a"));

        // A fresh load sees the same record.
        let reloaded = PeerRegistry::load(dir.path().join("peers.json"), "self".to_string());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get_peer("a").unwrap().pubkey, "pk-a");
    }

    #[test]
    fn test_self_never_stored() {
        let (_dir, mut registry) = tmp_registry();
        assert!(!registry.add_or_update_peer("self", "pk", None, false));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_by_url_and_remove() {
        let (_dir, mut registry) = tmp_registry();
        registry.add_or_update_peer("a", "pk-a", Some("http://a:3006".to_string()), true);
        assert_eq!(registry.find_peer_by_url("http://a:3006/"), Some("a".to_string()));
        assert!(registry.remove_peer("a"));
        assert!(!registry.remove_peer("a"));
    }

    #[test]
    fn test_propagate_peers_only_dialable() {
        let (_dir, mut registry) = tmp_registry();
        registry.add_or_update_peer("a", "pk-a", Some("http://a".to_string()), true);
        registry.add_or_update_peer("b", "pk-b", None, false);
        let sample = registry.propagate_peers(10);
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].0, "a");
    }

    #[test]
    fn test_table_cap() {
        let (_dir, mut registry) = tmp_registry();
        for i in 0..MAX_PEERS_COUNT {
            assert!(registry.add_or_update_peer(&format!("p{i}"), "pk", None, false));
        }
        assert!(!registry.add_or_update_peer("overflow", "pk", None, false));
        // Updates to existing peers still work at capacity.
        assert!(!registry.add_or_update_peer("p0", "pk2", None, false));
        assert_eq!(registry.get_peer("p0").unwrap().pubkey, "pk2");
    }

    #[test]
    fn test_violation_scoring_and_ban() {
        let mut reputation = ReputationManager::new();
        assert_eq!(
            reputation.record_violation("peer", Violation::InvalidTransaction),
            -20
        );
        assert_eq!(
            reputation.record_violation("peer", Violation::InvalidSyncBlock),
            -100
        );
        assert!(reputation.is_banned("peer"));
        // Clamped at the floor.
        assert_eq!(
            reputation.record_violation("peer", Violation::InvalidBlock),
            -100
        );
    }

    #[test]
    fn test_reward_and_gc() {
        let mut reputation = ReputationManager::new();
        reputation.record_violation("peer", Violation::PropagationFailure);
        assert_eq!(reputation.score("peer"), -10);
        reputation.reward("peer", 15);
        assert_eq!(reputation.score("peer"), 5);

        // Fresh violations survive GC; a peer back in good standing with no
        // violations on record is forgotten.
        reputation.gc();
        assert_eq!(reputation.score("peer"), 5);
        reputation.peers.get_mut("peer").unwrap().violations.clear();
        reputation.gc();
        assert_eq!(reputation.score("peer"), 0);
    }
}
