// Node HTTP API.
//
// Hand-rolled routing over hyper/http1. Every response uses the
// `{ok, result?, error?}` envelope; 409 carries chain-state detail, 413
// oversize, 429 query-cost exhaustion, 503 busy sync slots. Signed
// endpoints authenticate the canonical-JSON payload over the raw body,
// timestamp, nonce, and any `x-denaro-*` bound headers, with a TTL nonce
// cache as replay defense. No error escapes a handler: anything unexpected
// becomes a logged 500 with a generic body.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};

use crate::config::{NodeConfig, NODE_VERSION};
use crate::consensus::reorg::rollback_to_common_ancestor;
use crate::consensus::validator::{BlockError, ChainState};
use crate::crypto::identity::{
    canonical_json_bytes, node_id_for, signed_payload, verify_signature, NodeIdentity,
};
use crate::net::client::{check_outbound_url, NodeInterface, ResolutionCache};
use crate::net::mempool::{Mempool, MempoolError};
use crate::net::peers::{PeerRegistry, ReputationManager, Violation};
use crate::net::sync::{
    handshake_decision, propagate, pull_sync, push_sync, BlockPayload, ChallengeStore,
    HandshakeDecision, NonceCache, PropagationCache, PushTracker, SyncError, SyncSlots,
    GOSSIP_PERMITS, SUBMIT_BLOCKS_MAX,
};
use crate::node::db::StoreError;
use crate::primitives::transaction::Transaction;

const AUTH_TIMESTAMP_WINDOW_SECS: i64 = 300;
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;
const QUERY_COST_HOURLY_CAP: u64 = 1000;
const GET_BLOCKS_MAX_LIMIT: usize = 512;

/// Everything the endpoints share. Each concurrent structure sits behind
/// its own lock; the chain tip has a single writer through the
/// block-processing guard.
pub struct NodeState {
    pub config: NodeConfig,
    pub chain: ChainState,
    pub mempool: Mutex<Mempool>,
    pub identity: Arc<NodeIdentity>,
    pub registry: Mutex<PeerRegistry>,
    pub reputation: Mutex<ReputationManager>,
    pub challenges: Mutex<ChallengeStore>,
    pub nonces: Mutex<NonceCache>,
    pub slots: Mutex<SyncSlots>,
    pub push_tracker: Mutex<PushTracker>,
    pub propagation: Mutex<PropagationCache>,
    pub gossip_permits: Arc<Semaphore>,
    pub cost_budget: Mutex<CostBudget>,
    pub resolution_cache: Mutex<ResolutionCache>,
    pub http: reqwest::Client,
    pub is_public: AtomicBool,
}

impl NodeState {
    pub fn new(config: NodeConfig, chain: ChainState, identity: Arc<NodeIdentity>) -> Self {
        let registry = PeerRegistry::load(config.peers_file(), identity.node_id.clone());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(crate::config::HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        NodeState {
            config,
            chain,
            mempool: Mutex::new(Mempool::new()),
            identity,
            registry: Mutex::new(registry),
            reputation: Mutex::new(ReputationManager::new()),
            challenges: Mutex::new(ChallengeStore::default()),
            nonces: Mutex::new(NonceCache::default()),
            slots: Mutex::new(SyncSlots::default()),
            push_tracker: Mutex::new(PushTracker::default()),
            propagation: Mutex::new(PropagationCache::default()),
            gossip_permits: Arc::new(Semaphore::new(GOSSIP_PERMITS)),
            cost_budget: Mutex::new(CostBudget::default()),
            resolution_cache: Mutex::new(ResolutionCache::default()),
            http,
            is_public: AtomicBool::new(false),
        }
    }

    pub fn peer_interface(&self, url: &str) -> NodeInterface {
        NodeInterface::new(
            url,
            self.http.clone(),
            self.identity.clone(),
            self.config.self_url.clone(),
        )
    }

    /// Current tip as (height, last hash); an empty chain is height -1.
    pub async fn chain_tip(&self) -> Result<(i64, Option<String>), StoreError> {
        Ok(match self.chain.store().get_last_block().await? {
            Some(block) => (block.id as i64, Some(block.hash)),
            None => (-1, None),
        })
    }

    fn propagate_background(self: &Arc<Self>, path: &'static str, payload: Value, exclude: HashSet<String>) {
        let state = self.clone();
        tokio::spawn(async move {
            propagate(
                &state.registry,
                &state.reputation,
                &state.propagation,
                &state.gossip_permits,
                state.http.clone(),
                state.identity.clone(),
                state.config.self_url.clone(),
                path,
                payload,
                &exclude,
            )
            .await;
        });
    }

    async fn record_violation(&self, peer: &Option<AuthenticatedPeer>, violation: Violation) {
        if let Some(peer) = peer {
            self.reputation
                .lock()
                .await
                .record_violation(&peer.node_id, violation);
        }
    }
}

/// Per-identifier hourly query-cost budget: cost = offset/100 + limit/50.
#[derive(Default)]
pub struct CostBudget {
    windows: HashMap<String, (u64, u64)>,
}

impl CostBudget {
    pub fn charge(&mut self, identifier: &str, offset: u64, limit: u64) -> bool {
        let cost = offset / 100 + limit / 50 + 1;
        let now = unix_now();
        let entry = self.windows.entry(identifier.to_string()).or_insert((now, 0));
        if now.saturating_sub(entry.0) >= 3600 {
            *entry = (now, 0);
        }
        if entry.1 + cost > QUERY_COST_HOURLY_CAP {
            return false;
        }
        entry.1 += cost;
        true
    }
}

/// The verified sender of a signed request.
#[derive(Debug, Clone)]
pub struct AuthenticatedPeer {
    pub node_id: String,
    pub public_key: String,
    pub bound: BTreeMap<String, Value>,
    pub peer_url: Option<String>,
}

/// `x-denaro-*` values are strings on the wire; numbers and nulls must be
/// parsed back before the signature can be checked.
fn parse_bound_value(raw: &str) -> Value {
    if raw == "null" {
        return Value::Null;
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    Value::String(raw.to_string())
}

/// Verify the request signature, timestamp window, and nonce freshness.
/// Returns "no authenticated sender" (None) on any failure.
pub async fn authenticate(
    state: &NodeState,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Option<AuthenticatedPeer> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let node_id = header("x-node-id")?;
    let public_key = header("x-public-key")?;
    let signature = header("x-signature")?;
    let timestamp: i64 = header("x-timestamp")?.parse().ok()?;
    let nonce = header("x-nonce")?;

    if (unix_now() as i64 - timestamp).abs() > AUTH_TIMESTAMP_WINDOW_SECS {
        return None;
    }
    if node_id_for(&public_key)? != node_id {
        return None;
    }
    if state.reputation.lock().await.is_banned(&node_id) {
        return None;
    }

    let mut bound = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if let Some(key) = name.strip_prefix("x-denaro-") {
            bound.insert(key.to_string(), parse_bound_value(value.to_str().ok()?));
        }
    }

    let payload = signed_payload(body, timestamp, &nonce, &bound);
    if !verify_signature(&public_key, &canonical_json_bytes(&payload), &signature) {
        return None;
    }

    // Only a valid signature consumes the nonce.
    if !state.nonces.lock().await.check_and_insert(&node_id, &nonce) {
        return None;
    }

    let peer_url = header("x-peer-url");
    if let Some(url) = &peer_url {
        if check_outbound_url(url, state.is_public.load(Ordering::Relaxed), &state.resolution_cache)
            .await
            .is_ok()
        {
            state.registry.lock().await.add_or_update_peer(
                &node_id,
                &public_key,
                Some(url.clone()),
                false,
            );
        }
    }
    state.registry.lock().await.update_last_seen(&node_id);

    Some(AuthenticatedPeer {
        node_id,
        public_key,
        bound,
        peer_url,
    })
}

// --- envelope helpers ---------------------------------------------------

type ApiResult = (StatusCode, Value);

fn ok_result(result: Value) -> ApiResult {
    (StatusCode::OK, json!({ "ok": true, "result": result }))
}

fn ok_empty() -> ApiResult {
    (StatusCode::OK, json!({ "ok": true }))
}

fn fail(status: StatusCode, error: &str) -> ApiResult {
    (status, json!({ "ok": false, "error": error }))
}

fn forbidden() -> ApiResult {
    fail(StatusCode::FORBIDDEN, "no authenticated sender")
}

fn block_error_response(error: &BlockError) -> ApiResult {
    match error {
        BlockError::Oversized | BlockError::TransactionsOversized => {
            fail(StatusCode::PAYLOAD_TOO_LARGE, &error.to_string())
        }
        BlockError::UnknownPreviousHash => fail(StatusCode::CONFLICT, "unknown previous hash"),
        BlockError::Store(e) => {
            eprintln!("[api] storage failure during block accept: {e}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
        other => fail(StatusCode::BAD_REQUEST, &other.to_string()),
    }
}

// --- server loop --------------------------------------------------------

pub async fn start_node_server(state: Arc<NodeState>) -> Result<(), std::io::Error> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(addr).await?;
    eprintln!("[api] listening on {addr}");

    loop {
        let (stream, remote) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(state, req, remote).await }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                eprintln!("[api] connection error from {remote}: {e}");
            }
        });
    }
}

async fn handle_request(
    state: Arc<NodeState>,
    req: Request<Incoming>,
    remote: SocketAddr,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));
    let headers = req.headers().clone();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let (status, value) = if body.len() > MAX_REQUEST_BODY_BYTES {
        fail(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    } else {
        let body = String::from_utf8_lossy(&body).to_string();
        match route(state, method.as_str(), &path, query, headers, body, remote).await {
            Ok(result) => result,
            Err(e) => {
                eprintln!("[api] unhandled error on /{path}: {e}");
                fail(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", hyper::header::HeaderValue::from_static("application/json"));
    Ok(response)
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (percent_decode(k), percent_decode(v)))
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let pair = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(pair, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

#[derive(Debug, thiserror::Error)]
enum RouteError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

async fn route(
    state: Arc<NodeState>,
    method: &str,
    path: &str,
    query: HashMap<String, String>,
    headers: hyper::HeaderMap,
    body: String,
    remote: SocketAddr,
) -> Result<ApiResult, RouteError> {
    match (method, path) {
        ("GET", "") => root(&state).await,
        ("GET", "get_status") => get_status(&state).await,
        ("GET", "handshake/challenge") => handshake_challenge(&state).await,
        ("POST", "handshake/response") => handshake_response(&state, &headers, &body).await,
        ("POST", "get_peers") => get_peers(&state, &headers, &body).await,
        ("POST", "push_tx") => push_tx(&state, &headers, &body, true).await,
        ("POST", "submit_tx") => push_tx(&state, &headers, &body, false).await,
        ("POST", "push_block") => submit_block(&state, &body, None).await,
        ("POST", "submit_block") => {
            let Some(peer) = authenticate(&state, &headers, &body).await else {
                return Ok(forbidden());
            };
            submit_block(&state, &body, Some(peer)).await
        }
        ("POST", "submit_blocks") => submit_blocks(&state, &headers, &body).await,
        ("GET", "sync_blockchain") => sync_blockchain(&state, &query).await,
        ("GET", "get_mining_info") => get_mining_info(&state).await,
        ("GET", "get_block") => get_block(&state, &query).await,
        ("GET", "get_blocks") => get_blocks(&state, &query, &remote).await,
        ("GET", "get_transaction") => get_transaction(&state, &query).await,
        ("POST", "get_mempool_hashes") => get_mempool_hashes(&state, &headers, &body).await,
        ("POST", "get_transactions_by_hash") => {
            get_transactions_by_hash(&state, &headers, &body).await
        }
        ("POST", "check_reachability") => check_reachability(&state, &headers, &body).await,
        ("GET", "get_address_info") => get_address_info(&state, &query, &remote).await,
        ("GET", "get_nodes") => get_nodes(&state).await,
        _ => Ok(fail(StatusCode::NOT_FOUND, "unknown endpoint")),
    }
}

// --- endpoints ----------------------------------------------------------

async fn root(state: &NodeState) -> Result<ApiResult, RouteError> {
    let unspent_outputs_hash = state.chain.store().get_unspent_outputs_hash().await?;
    Ok(ok_result(json!({
        "version": NODE_VERSION,
        "unspent_outputs_hash": unspent_outputs_hash,
    })))
}

async fn get_status(state: &NodeState) -> Result<ApiResult, RouteError> {
    let (height, last_block_hash) = state.chain_tip().await?;
    Ok(ok_result(json!({
        "height": height,
        "last_block_hash": last_block_hash,
        "node_id": state.identity.node_id,
    })))
}

async fn handshake_challenge(state: &NodeState) -> Result<ApiResult, RouteError> {
    let challenge = state.challenges.lock().await.issue();
    let (height, last_hash) = state.chain_tip().await?;
    Ok(ok_result(json!({
        "challenge": challenge,
        "node": {
            "node_id": state.identity.node_id,
            "pubkey": state.identity.public_key_hex,
            "is_public": state.is_public.load(Ordering::Relaxed),
            "url": state.config.self_url,
            "height": height,
            "last_hash": last_hash,
        },
    })))
}

async fn handshake_response(
    state: &NodeState,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Result<ApiResult, RouteError> {
    let Some(peer) = authenticate(state, headers, body).await else {
        return Ok(forbidden());
    };

    let challenge = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("challenge").and_then(Value::as_str).map(String::from));
    let Some(challenge) = challenge else {
        state
            .record_violation(&Some(peer.clone()), Violation::InvalidHandshake)
            .await;
        return Ok(fail(StatusCode::BAD_REQUEST, "missing challenge"));
    };
    if !state.challenges.lock().await.consume(&challenge) {
        state
            .record_violation(&Some(peer.clone()), Violation::InvalidHandshake)
            .await;
        return Ok(fail(StatusCode::FORBIDDEN, "unknown or expired challenge"));
    }

    state.registry.lock().await.add_or_update_peer(
        &peer.node_id,
        &peer.public_key,
        peer.peer_url.clone(),
        false,
    );

    let peer_height = peer
        .bound
        .get("height")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let (local_height, _) = state.chain_tip().await?;

    Ok(match handshake_decision(local_height, peer_height) {
        HandshakeDecision::SyncRequested {
            start_block,
            target_block,
        } => ok_result(json!({
            "result": "sync_requested",
            "detail": { "start_block": start_block, "target_block": target_block },
        })),
        HandshakeDecision::SyncRequired {
            next_block_expected,
        } => (
            StatusCode::CONFLICT,
            json!({
                "ok": false,
                "error": "sync_required",
                "result": { "next_block_expected": next_block_expected },
            }),
        ),
        HandshakeDecision::InSync => ok_empty(),
    })
}

async fn get_peers(
    state: &NodeState,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Result<ApiResult, RouteError> {
    if authenticate(state, headers, body).await.is_none() {
        return Ok(forbidden());
    }
    let reputation = state.reputation.lock().await;
    let peers: Vec<Value> = state
        .registry
        .lock()
        .await
        .all_peers()
        .into_iter()
        .filter(|(id, _)| !reputation.is_banned(id))
        .map(|(node_id, peer)| {
            json!({
                "node_id": node_id,
                "pubkey": peer.pubkey,
                "url": peer.url,
                "is_public": peer.is_public,
                "last_seen": peer.last_seen,
            })
        })
        .collect();
    Ok(ok_result(json!({ "peers": peers })))
}

async fn push_tx(
    state: &Arc<NodeState>,
    headers: &hyper::HeaderMap,
    body: &str,
    signed: bool,
) -> Result<ApiResult, RouteError> {
    let peer = if signed {
        match authenticate(state, headers, body).await {
            Some(peer) => Some(peer),
            None => return Ok(forbidden()),
        }
    } else {
        None
    };

    let tx_hex = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("tx_hex").and_then(Value::as_str).map(String::from));
    let Some(tx_hex) = tx_hex else {
        return Ok(fail(StatusCode::BAD_REQUEST, "missing tx_hex"));
    };
    let tx = match Transaction::from_hex(&tx_hex) {
        Ok(tx) => tx,
        Err(e) => {
            state.record_violation(&peer, Violation::InvalidTransaction).await;
            return Ok(fail(StatusCode::BAD_REQUEST, &e.to_string()));
        }
    };

    let admitted = state
        .mempool
        .lock()
        .await
        .add_transaction(state.chain.store().as_ref(), tx)
        .await;
    match admitted {
        Ok(hash) => {
            let exclude: HashSet<String> =
                peer.iter().map(|p| p.node_id.clone()).collect();
            state.propagate_background("push_tx", json!({ "tx_hex": tx_hex }), exclude);
            Ok(ok_result(json!({ "hash": hash })))
        }
        Err(MempoolError::Duplicate) => Ok(fail(StatusCode::OK, "transaction already pending")),
        Err(MempoolError::Invalid) => {
            state.record_violation(&peer, Violation::InvalidTransaction).await;
            Ok(fail(StatusCode::BAD_REQUEST, "transaction failed verification"))
        }
        Err(MempoolError::Refused(_)) => Ok(fail(
            StatusCode::BAD_REQUEST,
            "transaction conflicts with the pending pool",
        )),
        Err(MempoolError::Store(e)) => Err(e.into()),
    }
}

async fn submit_block(
    state: &Arc<NodeState>,
    body: &str,
    peer: Option<AuthenticatedPeer>,
) -> Result<ApiResult, RouteError> {
    let Ok(payload) = serde_json::from_str::<BlockPayload>(body) else {
        return Ok(fail(StatusCode::BAD_REQUEST, "malformed block payload"));
    };
    let txs = match payload.parse_txs() {
        Ok(txs) => txs,
        Err(_) => {
            state.record_violation(&peer, Violation::InvalidTransaction).await;
            return Ok(fail(StatusCode::BAD_REQUEST, "malformed transaction hex"));
        }
    };
    let hashes: Vec<String> = txs.iter().map(|tx| tx.hash()).collect();

    let _guard = state.chain.block_processing_guard().await;
    match state.chain.create_block(&payload.block_content, txs).await {
        Ok(_) => {
            state.mempool.lock().await.forget_included(&hashes);
            let exclude: HashSet<String> =
                peer.iter().map(|p| p.node_id.clone()).collect();
            state.propagate_background(
                "submit_block",
                serde_json::to_value(&payload).unwrap_or_default(),
                exclude,
            );
            Ok(ok_empty())
        }
        Err(e) => {
            let violation = match &e {
                BlockError::Oversized | BlockError::TransactionsOversized => {
                    Some(Violation::OversizedBlock)
                }
                BlockError::Store(_) => None,
                _ => Some(Violation::InvalidBlock),
            };
            if let Some(violation) = violation {
                state.record_violation(&peer, violation).await;
            }
            Ok(block_error_response(&e))
        }
    }
}

async fn submit_blocks(
    state: &Arc<NodeState>,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Result<ApiResult, RouteError> {
    let Some(peer) = authenticate(state, headers, body).await else {
        return Ok(forbidden());
    };
    let peer = Some(peer);

    let Ok(payloads) = serde_json::from_str::<Vec<BlockPayload>>(body) else {
        return Ok(fail(StatusCode::BAD_REQUEST, "malformed batch payload"));
    };
    if payloads.len() > SUBMIT_BLOCKS_MAX {
        return Ok(fail(StatusCode::PAYLOAD_TOO_LARGE, "too many blocks"));
    }

    let _guard = state.chain.block_processing_guard().await;
    let mut expected = state.chain.store().get_next_block_id().await?;

    // The batch must start at our next height and stay continuous.
    if let Some(first_id) = payloads.first().and_then(|p| p.id) {
        if first_id != expected {
            return Ok(fail(StatusCode::CONFLICT, "Blocks sequence out of order"));
        }
    }
    for payload in &payloads {
        if let Some(id) = payload.id {
            if id != expected {
                state
                    .record_violation(&peer, Violation::NonContinuousBlocks)
                    .await;
                return Ok(fail(
                    StatusCode::BAD_REQUEST,
                    "Block sequence must be continuous",
                ));
            }
        }
        expected += 1;
    }

    // Apply in strict height order; a mid-batch failure aborts the rest.
    for payload in &payloads {
        let txs = match payload.parse_txs() {
            Ok(txs) => txs,
            Err(_) => {
                state
                    .record_violation(&peer, Violation::InvalidSyncBlock)
                    .await;
                return Ok(fail(StatusCode::BAD_REQUEST, "malformed transaction hex"));
            }
        };
        let hashes: Vec<String> = txs.iter().map(|tx| tx.hash()).collect();
        match state.chain.create_block(&payload.block_content, txs).await {
            Ok(_) => {
                state.mempool.lock().await.forget_included(&hashes);
            }
            Err(e) => {
                state
                    .record_violation(&peer, Violation::InvalidSyncBlock)
                    .await;
                return Ok(block_error_response(&e));
            }
        }
    }
    Ok(ok_empty())
}

async fn sync_blockchain(
    state: &Arc<NodeState>,
    query: &HashMap<String, String>,
) -> Result<ApiResult, RouteError> {
    let peer_url = match query.get("node_url") {
        Some(url) => Some(url.clone()),
        None => state
            .registry
            .lock()
            .await
            .propagate_peers(1)
            .into_iter()
            .find_map(|(_, peer)| peer.url),
    };
    let Some(peer_url) = peer_url else {
        return Ok(fail(StatusCode::BAD_REQUEST, "no peer to sync from"));
    };

    if check_outbound_url(
        &peer_url,
        state.is_public.load(Ordering::Relaxed),
        &state.resolution_cache,
    )
    .await
    .is_err()
    {
        return Ok(fail(StatusCode::BAD_REQUEST, "unsafe peer url"));
    }

    if !state.slots.lock().await.try_begin_pull() {
        return Ok(fail(StatusCode::SERVICE_UNAVAILABLE, "a sync is already running"));
    }

    let state_bg = state.clone();
    tokio::spawn(async move {
        if let Err(e) = run_pull(&state_bg, &peer_url).await {
            eprintln!("[sync] pull from {peer_url} failed: {e}");
        }
        state_bg.slots.lock().await.end_pull();
    });
    Ok(ok_result(json!("sync started")))
}

/// Pull driver: reorganize first when the peer's chain diverges at our tip
/// height, then fetch forward.
pub async fn run_pull(state: &Arc<NodeState>, peer_url: &str) -> Result<(), String> {
    let interface = state.peer_interface(peer_url);

    let status = interface.get_status().await.map_err(|e| e.to_string())?;
    let remote_height = status
        .result()
        .and_then(|r| r.get("height"))
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let (local_height, local_hash) = state.chain_tip().await.map_err(|e| e.to_string())?;

    if remote_height <= local_height {
        return Ok(());
    }

    if let (Some(local_hash), true) = (local_hash, local_height >= 0) {
        use crate::consensus::reorg::RemoteChain;
        let remote_at_tip = interface
            .block_hash_at(local_height as u64)
            .await
            .map_err(|e| e.to_string())?;
        if remote_at_tip.as_deref() != Some(local_hash.as_str()) {
            let mut mempool = state.mempool.lock().await;
            rollback_to_common_ancestor(&state.chain, &mut mempool, &interface)
                .await
                .map_err(|e| e.to_string())?;
        }
    }

    match pull_sync(&state.chain, &state.mempool, &interface).await {
        Ok(applied) => {
            if applied > 0 {
                eprintln!("[sync] applied {applied} block(s) from {peer_url}");
            }
            Ok(())
        }
        Err(e) => {
            if let Some(node_id) = state.registry.lock().await.find_peer_by_url(peer_url) {
                state
                    .reputation
                    .lock()
                    .await
                    .record_violation(&node_id, Violation::InvalidSyncBlock);
            }
            Err(e.to_string())
        }
    }
}

/// Push driver: bounded by the sync slots and the per-peer single-flight
/// tracker. A "sequence" rejection yields silently inside `push_sync`;
/// any other rejection counts against the peer.
pub async fn run_push(
    state: &Arc<NodeState>,
    peer_url: &str,
    start_block: u64,
    target_block: u64,
) {
    let node_id = state.registry.lock().await.find_peer_by_url(peer_url);
    let tracker_key = node_id.clone().unwrap_or_else(|| peer_url.to_string());

    if !state.slots.lock().await.try_begin_push() {
        return;
    }
    if !state.push_tracker.lock().await.try_begin(&tracker_key) {
        state.slots.lock().await.end_push();
        return;
    }

    let interface = state.peer_interface(peer_url);
    let result = push_sync(
        state.chain.store().as_ref(),
        &interface,
        start_block,
        target_block,
    )
    .await;
    if let Err(e) = result {
        let rejected = matches!(
            e,
            SyncError::Rejected(_) | SyncError::Client(crate::net::client::ClientError::Status(_))
        );
        if let (Some(node_id), true) = (&node_id, rejected) {
            state
                .reputation
                .lock()
                .await
                .record_violation(node_id, Violation::RejectedSync);
        }
        eprintln!("[sync] push to {peer_url} failed: {e}");
    }

    state.push_tracker.lock().await.end(&tracker_key);
    state.slots.lock().await.end_push();
}

async fn get_mining_info(state: &NodeState) -> Result<ApiResult, RouteError> {
    let store = state.chain.store().clone();
    let mut mempool = state.mempool.lock().await;
    mempool.clear_pending_transactions(store.as_ref()).await?;

    let candidates = mempool.entries_in_order();
    let outcome = crate::miner::template::assemble_template(
        store.as_ref(),
        candidates,
        crate::miner::template::TEMPLATE_SIZE_LIMIT_HEX,
    )
    .await?;
    for hash in &outcome.invalid {
        mempool.remove(store.as_ref(), hash).await?;
    }
    drop(mempool);

    let info = state.chain.get_difficulty().await?;
    let last_block = match &info.last_block {
        Some(block) => serde_json::to_value(block).unwrap_or_else(|_| json!({})),
        None => json!({}),
    };
    let pending_hex: Vec<String> = outcome
        .template
        .transactions
        .iter()
        .map(|tx| tx.hex())
        .collect();

    Ok(ok_result(json!({
        "difficulty": info.difficulty.to_f64(),
        "last_block": last_block,
        "pending_transactions": pending_hex,
        "pending_transactions_hashes": outcome.template.hashes,
        "merkle_root": outcome.template.merkle_root,
    })))
}

async fn block_with_transactions(state: &NodeState, block: crate::node::db::Block) -> Result<Value, StoreError> {
    let txs: Vec<String> = state
        .chain
        .store()
        .get_block_transactions(&block.hash)
        .await?
        .into_iter()
        .map(|tx| tx.hex())
        .collect();
    Ok(json!({
        "block": serde_json::to_value(&block).unwrap_or_default(),
        "transactions": txs,
    }))
}

async fn get_block(
    state: &NodeState,
    query: &HashMap<String, String>,
) -> Result<ApiResult, RouteError> {
    let Some(wanted) = query.get("block") else {
        return Ok(fail(StatusCode::BAD_REQUEST, "missing block parameter"));
    };
    let block = if wanted.chars().all(|c| c.is_ascii_digit()) {
        let id: u64 = wanted.parse().unwrap_or(u64::MAX);
        state.chain.store().get_block_by_id(id).await?
    } else {
        state.chain.store().get_block(wanted).await?
    };
    match block {
        Some(block) => Ok(ok_result(block_with_transactions(state, block).await?)),
        None => Ok(fail(StatusCode::NOT_FOUND, "block not found")),
    }
}

async fn get_blocks(
    state: &NodeState,
    query: &HashMap<String, String>,
    remote: &SocketAddr,
) -> Result<ApiResult, RouteError> {
    let offset: u64 = query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100)
        .min(GET_BLOCKS_MAX_LIMIT);

    if !state
        .cost_budget
        .lock()
        .await
        .charge(&remote.ip().to_string(), offset, limit as u64)
    {
        return Ok(fail(StatusCode::TOO_MANY_REQUESTS, "query cost budget exceeded"));
    }

    let blocks = state.chain.store().get_blocks(offset, limit).await?;
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        out.push(block_with_transactions(state, block).await?);
    }
    Ok(ok_result(json!(out)))
}

async fn get_transaction(
    state: &NodeState,
    query: &HashMap<String, String>,
) -> Result<ApiResult, RouteError> {
    let Some(tx_hash) = query.get("tx_hash") else {
        return Ok(fail(StatusCode::BAD_REQUEST, "missing tx_hash parameter"));
    };
    match state.chain.store().get_nice_transaction(tx_hash).await? {
        Some(view) => Ok(ok_result(view)),
        None => Ok(fail(StatusCode::NOT_FOUND, "transaction not found")),
    }
}

async fn get_mempool_hashes(
    state: &NodeState,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Result<ApiResult, RouteError> {
    if authenticate(state, headers, body).await.is_none() {
        return Ok(forbidden());
    }
    let hashes = state.mempool.lock().await.hashes();
    Ok(ok_result(json!({ "hashes": hashes })))
}

async fn get_transactions_by_hash(
    state: &NodeState,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Result<ApiResult, RouteError> {
    if authenticate(state, headers, body).await.is_none() {
        return Ok(forbidden());
    }
    let hashes = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("hashes").and_then(Value::as_array).map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect::<Vec<String>>()
            })
        })
        .unwrap_or_default();
    if hashes.len() > SUBMIT_BLOCKS_MAX {
        return Ok(fail(StatusCode::PAYLOAD_TOO_LARGE, "too many hashes"));
    }
    let txs: Vec<String> = state
        .chain
        .store()
        .get_pending_transactions_by_hash(&hashes)
        .await?
        .into_iter()
        .map(|tx| tx.hex())
        .collect();
    Ok(ok_result(json!({ "transactions": txs })))
}

async fn check_reachability(
    state: &NodeState,
    headers: &hyper::HeaderMap,
    body: &str,
) -> Result<ApiResult, RouteError> {
    let Some(peer) = authenticate(state, headers, body).await else {
        return Ok(forbidden());
    };

    let url = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("url_to_check").and_then(Value::as_str).map(String::from));
    let Some(url) = url else {
        return Ok(fail(StatusCode::BAD_REQUEST, "missing url_to_check"));
    };

    if check_outbound_url(&url, state.is_public.load(Ordering::Relaxed), &state.resolution_cache)
        .await
        .is_err()
    {
        state
            .record_violation(&Some(peer), Violation::InvalidUrl)
            .await;
        return Ok(fail(StatusCode::BAD_REQUEST, "unsafe url"));
    }

    let reachable = state
        .http
        .get(format!("{}/get_status", url.trim_end_matches('/')))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);
    Ok(ok_result(json!({ "reachable": reachable })))
}

async fn get_address_info(
    state: &NodeState,
    query: &HashMap<String, String>,
    remote: &SocketAddr,
) -> Result<ApiResult, RouteError> {
    let Some(address) = query.get("address") else {
        return Ok(fail(StatusCode::BAD_REQUEST, "missing address parameter"));
    };
    let offset: usize = query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
        .min(GET_BLOCKS_MAX_LIMIT);

    if !state
        .cost_budget
        .lock()
        .await
        .charge(&remote.ip().to_string(), offset as u64, limit as u64)
    {
        return Ok(fail(StatusCode::TOO_MANY_REQUESTS, "query cost budget exceeded"));
    }

    let spendable = state.chain.store().get_spendable_outputs(address).await?;
    let balance: rust_decimal::Decimal = spendable.iter().map(|r| r.amount).sum();
    let transactions = state
        .chain
        .store()
        .get_address_transactions(address, offset, limit)
        .await?;

    Ok(ok_result(json!({
        "balance": balance.to_f64(),
        "spendable_outputs": spendable
            .iter()
            .map(|r| json!({
                "tx_hash": r.tx_hash,
                "index": r.index,
                "amount": r.amount.to_f64(),
            }))
            .collect::<Vec<Value>>(),
        "transactions": transactions,
    })))
}

async fn get_nodes(state: &NodeState) -> Result<ApiResult, RouteError> {
    let nodes: Vec<String> = state
        .registry
        .lock()
        .await
        .recent_peers()
        .into_iter()
        .filter(|(_, peer)| peer.is_public)
        .filter_map(|(_, peer)| peer.url)
        .collect();
    Ok(ok_result(json!({ "nodes": nodes })))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
