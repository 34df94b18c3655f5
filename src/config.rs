use std::path::PathBuf;

/// Protocol version advertised on the root endpoint and in handshakes
pub const NODE_VERSION: &str = "2.0.0";

/// Default HTTP bind address for the node API
pub const DEFAULT_NODE_HOST: &str = "127.0.0.1";
pub const DEFAULT_NODE_PORT: u16 = 3006;

/// Data directory name (RocksDB store, node key, peers.json)
pub const DATA_DIR: &str = ".denaro/mainnet";

/// Timeout for every outbound HTTP call
pub const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// URL other peers can reach this node at, if any
    pub self_url: Option<String>,
    /// Seed node used for first contact and the reachability self-probe
    pub bootstrap_node: Option<String>,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let host = env_or("DENARO_NODE_HOST", DEFAULT_NODE_HOST);
        let port = std::env::var("DENARO_NODE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_NODE_PORT);
        let data_dir = std::env::var("DENARO_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        NodeConfig {
            host,
            port,
            data_dir,
            self_url: env_opt("DENARO_SELF_URL"),
            bootstrap_node: env_opt("DENARO_BOOTSTRAP_NODE"),
        }
    }

    pub fn key_file(&self) -> PathBuf {
        self.data_dir.join("node_key.json")
    }

    pub fn peers_file(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("chainstate")
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(DATA_DIR)
}
