use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use serde_json::Value;

use denaro::config::{NodeConfig, NODE_VERSION};
use denaro::consensus::validator::ChainState;
use denaro::crypto::identity::NodeIdentity;
use denaro::node::{ChainStore, RocksStore};
use denaro::rpc::server::{run_pull, run_push, start_node_server, NodeState};

fn banner() {
    println!(
        "{}",
        " ██████╗ ███████╗███╗   ██╗ █████╗ ██████╗  ██████╗ ".bright_cyan()
    );
    println!(
        "{}",
        " ██╔══██╗██╔════╝████╗  ██║██╔══██╗██╔══██╗██╔═══██╗".bright_cyan()
    );
    println!(
        "{}",
        " ██║  ██║█████╗  ██╔██╗ ██║███████║██████╔╝██║   ██║".bright_cyan().bold()
    );
    println!(
        "{}",
        " ██║  ██║██╔══╝  ██║╚██╗██║██╔══██║██╔══██╗██║   ██║".bright_cyan().bold()
    );
    println!(
        "{}",
        " ██████╔╝███████╗██║ ╚████║██║  ██║██║  ██║╚██████╔╝".blue()
    );
    println!(
        "{}",
        " ╚═════╝ ╚══════╝╚═╝  ╚═══╝╚═╝  ╚═╝╚═╝  ╚═╝ ╚═════╝ ".blue()
    );
    println!();
    println!(
        "{}",
        format!("              v{NODE_VERSION} — proof-of-work node              ")
            .bright_green()
            .bold()
    );
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    banner();

    let config = NodeConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    let identity = Arc::new(NodeIdentity::load_or_create(&config.key_file())?);
    eprintln!("[node] identity {}", identity.node_id);

    let store = Arc::new(RocksStore::open(&config.db_dir())?);
    let chain = ChainState::new(store.clone());
    let state = Arc::new(NodeState::new(config.clone(), chain, identity));

    state
        .mempool
        .lock()
        .await
        .hydrate(store.as_ref())
        .await?;

    let height = store.get_next_block_id().await?;
    eprintln!("[node] chain height {}", height as i64 - 1);

    spawn_cache_cleaner(state.clone());
    spawn_bootstrap(state.clone());
    spawn_update_fetcher(state.clone());

    tokio::select! {
        server = start_node_server(state.clone()) => {
            server?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[node] shutting down");
        }
    }
    Ok(())
}

/// Periodic GC for the TTL caches and reputation records.
fn spawn_cache_cleaner(state: Arc<NodeState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            state.nonces.lock().await.gc();
            state.challenges.lock().await.gc();
            state.propagation.lock().await.gc();
            state.reputation.lock().await.gc();
        }
    });
}

/// First contact: handshake with the bootstrap node, learn its peers,
/// probe our own reachability, and catch up on the chain.
fn spawn_bootstrap(state: Arc<NodeState>) {
    let Some(bootstrap_url) = state.config.bootstrap_node.clone() else {
        eprintln!("[node] no bootstrap node configured, waiting for peers");
        return;
    };
    tokio::spawn(async move {
        let interface = state.peer_interface(&bootstrap_url);

        // Phase 1+2 handshake: bind our chain state into the response.
        let challenge = match interface.handshake_challenge().await {
            Ok(response) => response
                .result()
                .and_then(|r| r.get("challenge"))
                .and_then(Value::as_str)
                .map(String::from),
            Err(e) => {
                eprintln!("[node] bootstrap unreachable: {e}");
                return;
            }
        };
        if let Some(challenge) = challenge {
            let (height, last_hash) = match state.chain_tip().await {
                Ok(tip) => tip,
                Err(_) => (-1, None),
            };
            if let Ok(response) = interface
                .handshake_response(&challenge, height, last_hash.as_deref())
                .await
            {
                // The bootstrap node is behind us: it asked for a push.
                let detail = &response.body["result"]["detail"];
                if response.body["result"]["result"] == serde_json::json!("sync_requested") {
                    if let (Some(start), Some(target)) = (
                        detail["start_block"].as_u64(),
                        detail["target_block"].as_u64(),
                    ) {
                        run_push(&state, &bootstrap_url, start, target).await;
                    }
                }
            }
        }

        // Self-reachability probe decides whether we advertise publicly.
        if let Some(self_url) = state.config.self_url.clone() {
            match interface.check_peer_reachability(&self_url).await {
                Ok(reachable) => {
                    state.is_public.store(reachable, Ordering::Relaxed);
                    eprintln!("[node] reachability probe: public={reachable}");
                }
                Err(e) => eprintln!("[node] reachability probe failed: {e}"),
            }
        }

        // Learn the bootstrap node's peer table.
        if let Ok(response) = interface.get_peers().await {
            if let Some(peers) = response
                .result()
                .and_then(|r| r.get("peers"))
                .and_then(Value::as_array)
            {
                let mut registry = state.registry.lock().await;
                for peer in peers {
                    let (Some(node_id), Some(pubkey)) = (
                        peer.get("node_id").and_then(Value::as_str),
                        peer.get("pubkey").and_then(Value::as_str),
                    ) else {
                        continue;
                    };
                    let url = peer.get("url").and_then(Value::as_str).map(String::from);
                    let is_public = peer
                        .get("is_public")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    registry.add_or_update_peer(node_id, pubkey, url, is_public);
                }
                eprintln!("[node] learned {} peer(s) from bootstrap", registry.len());
            }
        }

        // Initial catch-up.
        if state.slots.lock().await.try_begin_pull() {
            if let Err(e) = run_pull(&state, &bootstrap_url).await {
                eprintln!("[sync] bootstrap pull failed: {e}");
            }
            state.slots.lock().await.end_pull();
        }
    });
}

/// Stay current: periodically compare heights with a random active peer
/// and pull when behind.
fn spawn_update_fetcher(state: Arc<NodeState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(180));
        loop {
            interval.tick().await;

            let target = state
                .registry
                .lock()
                .await
                .propagate_peers(1)
                .into_iter()
                .find_map(|(_, peer)| peer.url);
            let Some(url) = target else {
                continue;
            };

            if !state.slots.lock().await.try_begin_pull() {
                continue;
            }
            if let Err(e) = run_pull(&state, &url).await {
                eprintln!("[sync] update pull from {url} failed: {e}");
            }
            state.slots.lock().await.end_pull();
        }
    });
}
