// Outbound peer interface.
//
// Every call to a peer goes through one connection-pooled reqwest client
// with a 10-second timeout. Signed requests serialize the body once, sign
// the canonical payload covering that exact string plus timestamp, nonce,
// and any `x-denaro-*` bound values, and send the same string on the wire.
//
// Outbound URL safety: the hostname must resolve to a single IPv4 address
// that is neither loopback nor link-local; RFC1918 space is allowed only
// while this node itself is not public. Resolutions are cached for 300 s.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::consensus::reorg::{RemoteChain, ReorgError};
use crate::crypto::identity::{canonical_json_bytes, signed_payload, NodeIdentity};

const RESOLUTION_TTL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed url")]
    BadUrl,
    #[error("unsafe destination: {0}")]
    UnsafeUrl(&'static str),
    #[error("peer returned status {0}")]
    Status(u16),
    #[error("peer returned a non-json body")]
    BadBody,
}

#[derive(Debug)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Value,
}

impl PeerResponse {
    pub fn ok(&self) -> bool {
        self.body.get("ok").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn result(&self) -> Option<&Value> {
        self.body.get("result")
    }
}

#[derive(Default)]
pub struct ResolutionCache {
    entries: HashMap<String, (Ipv4Addr, u64)>,
}

/// Extract (host, port) from an http(s) URL without pulling in a URL crate.
fn host_and_port(url: &str) -> Result<(String, u16), ClientError> {
    let rest = url
        .strip_prefix("http://")
        .map(|r| (r, 80u16))
        .or_else(|| url.strip_prefix("https://").map(|r| (r, 443u16)));
    let (rest, default_port) = rest.ok_or(ClientError::BadUrl)?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() || authority.contains('@') {
        return Err(ClientError::BadUrl);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| ClientError::BadUrl)?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

fn ip_allowed(ip: Ipv4Addr, self_is_public: bool) -> Result<(), ClientError> {
    if ip.is_loopback() {
        return Err(ClientError::UnsafeUrl("loopback address"));
    }
    if ip.is_link_local() {
        return Err(ClientError::UnsafeUrl("link-local address"));
    }
    if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        return Err(ClientError::UnsafeUrl("non-routable address"));
    }
    if ip.is_private() && self_is_public {
        return Err(ClientError::UnsafeUrl("private address from a public node"));
    }
    Ok(())
}

/// Resolve and police an outbound URL. The successful resolution is cached.
pub async fn check_outbound_url(
    url: &str,
    self_is_public: bool,
    cache: &Mutex<ResolutionCache>,
) -> Result<Ipv4Addr, ClientError> {
    let (host, port) = host_and_port(url)?;

    {
        let cache = cache.lock().await;
        if let Some((ip, at)) = cache.entries.get(&host) {
            if unix_now().saturating_sub(*at) < RESOLUTION_TTL_SECS {
                let ip = *ip;
                drop(cache);
                ip_allowed(ip, self_is_public)?;
                return Ok(ip);
            }
        }
    }

    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| ClientError::UnsafeUrl("hostname does not resolve"))?;
    let ip = addrs
        .find_map(|a| match a {
            std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
            std::net::SocketAddr::V6(_) => None,
        })
        .ok_or(ClientError::UnsafeUrl("no IPv4 address"))?;

    ip_allowed(ip, self_is_public)?;
    cache.lock().await.entries.insert(host, (ip, unix_now()));
    Ok(ip)
}

/// Whether a URL points at private/loopback space (used to decide if the
/// node's own URL is worth advertising).
pub async fn is_local_url(url: &str) -> bool {
    let Ok((host, port)) = host_and_port(url) else {
        return false;
    };
    let Ok(mut addrs) = tokio::net::lookup_host((host.as_str(), port)).await else {
        return false;
    };
    addrs.any(|a| match a {
        std::net::SocketAddr::V4(v4) => {
            let ip = v4.ip();
            ip.is_private() || ip.is_loopback() || ip.is_link_local()
        }
        std::net::SocketAddr::V6(v6) => v6.ip().is_loopback(),
    })
}

/// A handle to one remote peer.
pub struct NodeInterface {
    pub url: String,
    client: reqwest::Client,
    identity: Arc<NodeIdentity>,
    self_url: Option<String>,
    advertise: tokio::sync::OnceCell<bool>,
}

impl NodeInterface {
    pub fn new(
        url: &str,
        client: reqwest::Client,
        identity: Arc<NodeIdentity>,
        self_url: Option<String>,
    ) -> Self {
        NodeInterface {
            url: url.trim_end_matches('/').to_string(),
            client,
            identity,
            self_url,
            advertise: tokio::sync::OnceCell::new(),
        }
    }

    async fn should_advertise(&self) -> bool {
        let Some(self_url) = &self.self_url else {
            return false;
        };
        *self
            .advertise
            .get_or_init(|| async {
                // Advertise a public URL anywhere; a local URL only to local
                // peers (development setups).
                !is_local_url(self_url).await || is_local_url(&self.url).await
            })
            .await
    }

    async fn parse_response(response: reqwest::Response) -> Result<PeerResponse, ClientError> {
        let status = response.status().as_u16();
        // 409 carries structured chain-state detail, not a failure.
        if status >= 400 && status != 409 {
            return Err(ClientError::Status(status));
        }
        let body = response.json::<Value>().await.map_err(|_| ClientError::BadBody)?;
        Ok(PeerResponse { status, body })
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<PeerResponse, ClientError> {
        let response = self
            .client
            .get(format!("{}/{}", self.url, path))
            .query(query)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    pub async fn signed_request(
        &self,
        path: &str,
        body: Value,
        bound_headers: Option<BTreeMap<String, Value>>,
    ) -> Result<PeerResponse, ClientError> {
        let timestamp = unix_now() as i64;
        let mut nonce_bytes = [0u8; 16];
        let _ = getrandom::getrandom(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);

        let body_str = body.to_string();
        let extras = bound_headers.unwrap_or_default();
        let payload = signed_payload(&body_str, timestamp, &nonce, &extras);
        let signature = self.identity.sign(&canonical_json_bytes(&payload));

        let mut request = self
            .client
            .post(format!("{}/{}", self.url, path))
            .header("content-type", "application/json")
            .header("x-node-id", self.identity.node_id.as_str())
            .header("x-public-key", self.identity.public_key_hex.as_str())
            .header("x-signature", signature)
            .header("x-timestamp", timestamp.to_string())
            .header("x-nonce", nonce)
            .body(body_str);

        for (key, value) in &extras {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(format!("x-denaro-{key}"), rendered);
        }
        if self.should_advertise().await {
            if let Some(self_url) = &self.self_url {
                request = request.header("x-peer-url", self_url.as_str());
            }
        }

        Self::parse_response(request.send().await?).await
    }

    // -- protocol calls --------------------------------------------------

    pub async fn get_status(&self) -> Result<PeerResponse, ClientError> {
        self.get("get_status", &[]).await
    }

    pub async fn get_block(&self, id: u64) -> Result<PeerResponse, ClientError> {
        self.get("get_block", &[("block", id.to_string())]).await
    }

    pub async fn get_blocks(&self, offset: u64, limit: usize) -> Result<PeerResponse, ClientError> {
        self.get(
            "get_blocks",
            &[("offset", offset.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    pub async fn push_tx(&self, tx_hex: &str) -> Result<PeerResponse, ClientError> {
        self.signed_request("push_tx", json!({ "tx_hex": tx_hex }), None)
            .await
    }

    pub async fn submit_block(&self, payload: Value) -> Result<PeerResponse, ClientError> {
        self.signed_request("submit_block", payload, None).await
    }

    pub async fn submit_blocks(&self, payload: Value) -> Result<PeerResponse, ClientError> {
        self.signed_request("submit_blocks", payload, None).await
    }

    pub async fn get_peers(&self) -> Result<PeerResponse, ClientError> {
        self.signed_request("get_peers", json!({}), None).await
    }

    pub async fn handshake_challenge(&self) -> Result<PeerResponse, ClientError> {
        self.get("handshake/challenge", &[]).await
    }

    /// Phase two: prove identity and bind our chain state into the
    /// signature so the peer can negotiate sync direction.
    pub async fn handshake_response(
        &self,
        challenge: &str,
        height: i64,
        last_hash: Option<&str>,
    ) -> Result<PeerResponse, ClientError> {
        let mut bound = BTreeMap::new();
        bound.insert("height".to_string(), Value::from(height));
        bound.insert(
            "last_hash".to_string(),
            last_hash.map(|h| Value::String(h.to_string())).unwrap_or(Value::Null),
        );
        self.signed_request(
            "handshake/response",
            json!({ "challenge": challenge }),
            Some(bound),
        )
        .await
    }

    pub async fn check_peer_reachability(&self, url_to_check: &str) -> Result<bool, ClientError> {
        let response = self
            .signed_request(
                "check_reachability",
                json!({ "url_to_check": url_to_check }),
                None,
            )
            .await?;
        Ok(response
            .result()
            .and_then(|r| r.get("reachable"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn get_mempool_hashes(&self) -> Result<PeerResponse, ClientError> {
        self.signed_request("get_mempool_hashes", json!({}), None).await
    }

    pub async fn get_transactions_by_hash(
        &self,
        hashes: &[String],
    ) -> Result<PeerResponse, ClientError> {
        self.signed_request("get_transactions_by_hash", json!({ "hashes": hashes }), None)
            .await
    }
}

#[async_trait::async_trait]
impl RemoteChain for NodeInterface {
    async fn block_hash_at(&self, id: u64) -> Result<Option<String>, ReorgError> {
        let response = self
            .get_block(id)
            .await
            .map_err(|e| ReorgError::Remote(e.to_string()))?;
        Ok(response
            .result()
            .and_then(|r| r.get("block"))
            .and_then(|b| b.get("hash"))
            .and_then(Value::as_str)
            .map(|s| s.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
