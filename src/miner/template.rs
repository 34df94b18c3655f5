// Mining template assembly.
//
// Candidates are taken in mempool insertion order and arranged by Kahn
// traversal over the intra-pool dependency DAG, so a parent always precedes
// its child. A running spent-prevout set drops conflicting branches: when
// a transaction is skipped its descendants never become ready, which keeps
// exactly one branch of any conflict. Selection stops outright at the size
// cap, leaving headroom below the block limit for the coinbase.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::consensus::merkle::transactions_merkle_root;
use crate::node::db::{ChainStore, StoreError};
use crate::primitives::transaction::{outputs_of_content, Transaction};

pub const TEMPLATE_CANDIDATE_CAP: usize = 5_000;
pub const TEMPLATE_SIZE_LIMIT_HEX: usize = 1_900_000;

#[derive(Debug)]
pub struct BlockTemplate {
    pub transactions: Vec<Transaction>,
    pub hashes: Vec<String>,
    pub merkle_root: String,
}

#[derive(Debug)]
pub struct TemplateOutcome {
    pub template: BlockTemplate,
    /// Candidates that referenced a missing on-chain parent or failed
    /// verification; the caller purges them from the pool and store.
    pub invalid: Vec<String>,
}

pub async fn assemble_template(
    store: &dyn ChainStore,
    candidates: Vec<(String, Transaction)>,
    max_size_hex: usize,
) -> Result<TemplateOutcome, StoreError> {
    let candidates: Vec<(String, Transaction)> = candidates
        .into_iter()
        .take(TEMPLATE_CANDIDATE_CAP)
        .collect();

    let index_of: HashMap<&str, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, (hash, _))| (hash.as_str(), i))
        .collect();

    // Classify inputs: pool parents become DAG edges, on-chain parents must
    // exist with the claimed output index.
    let mut invalid: HashSet<usize> = HashSet::new();
    let mut parents: Vec<HashSet<usize>> = vec![HashSet::new(); candidates.len()];
    for (i, (_, tx)) in candidates.iter().enumerate() {
        for input in &tx.inputs {
            if let Some(&parent) = index_of.get(input.tx_hash.as_str()) {
                if parent != i {
                    parents[i].insert(parent);
                }
                continue;
            }
            let exists = match store.get_transaction(&input.tx_hash).await? {
                Some(record) => outputs_of_content(&record.content)
                    .map(|outs| (input.index as usize) < outs.len())
                    .unwrap_or(false),
                None => false,
            };
            if !exists {
                invalid.insert(i);
                break;
            }
        }
    }

    for (i, (_, tx)) in candidates.iter().enumerate() {
        if invalid.contains(&i) {
            continue;
        }
        if !tx.verify(store, true).await? {
            invalid.insert(i);
        }
    }

    // Kahn traversal, stable on original insertion order.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); candidates.len()];
    let mut in_degree: Vec<usize> = vec![0; candidates.len()];
    for (i, deps) in parents.iter().enumerate() {
        if invalid.contains(&i) {
            continue;
        }
        let live_deps: Vec<usize> = deps
            .iter()
            .copied()
            .filter(|p| !invalid.contains(p))
            .collect();
        in_degree[i] = live_deps.len();
        for parent in live_deps {
            children[parent].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = BinaryHeap::new();
    for (i, _) in candidates.iter().enumerate() {
        if !invalid.contains(&i) && in_degree[i] == 0 {
            ready.push(Reverse(i));
        }
    }

    let mut selected: Vec<usize> = Vec::new();
    let mut spent: HashSet<(String, u8)> = HashSet::new();
    let mut total_hex = 0usize;
    let mut steps = 0usize;

    while let Some(Reverse(i)) = ready.pop() {
        steps += 1;
        if steps % 100 == 0 {
            tokio::task::yield_now().await;
        }

        let (_, tx) = &candidates[i];
        let keys = tx.input_keys();
        if keys.iter().any(|k| spent.contains(k)) {
            // In-block conflict: this branch dies here, its descendants
            // never become ready.
            continue;
        }
        let tx_hex_len = tx.hex().len();
        if total_hex + tx_hex_len > max_size_hex {
            break;
        }

        total_hex += tx_hex_len;
        spent.extend(keys);
        selected.push(i);
        for &child in &children[i] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }

    let transactions: Vec<Transaction> = selected
        .iter()
        .map(|&i| candidates[i].1.clone())
        .collect();
    let hashes: Vec<String> = selected
        .iter()
        .map(|&i| candidates[i].0.clone())
        .collect();
    let merkle_root = transactions_merkle_root(&hashes);

    Ok(TemplateOutcome {
        template: BlockTemplate {
            transactions,
            hashes,
            merkle_root,
        },
        invalid: invalid
            .into_iter()
            .map(|i| candidates[i].0.clone())
            .collect(),
    })
}
