//! TOML file configuration structures.
//!
//! These structs directly map to the `vpspay-config.toml` file format.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub provisioner: ProvisionerConfig,
    /// Seconds a bus request waits for its response.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Ledger endpoints and the token contract to reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub http_url: Url,
    pub ws_url: Url,
    /// `0x`-prefixed contract address.
    pub contract_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub start_height: i64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backfill_chunk")]
    pub backfill_chunk: i64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            start_height: 0,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backfill_chunk: default_backfill_chunk(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backfill_chunk() -> i64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_confirmations")]
    pub confirmations: i64,
    #[serde(default = "default_matching_window")]
    pub matching_window: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            confirmations: default_confirmations(),
            matching_window: default_matching_window(),
        }
    }
}

fn default_confirmations() -> i64 {
    60
}

fn default_matching_window() -> i64 {
    2_880
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Hex private key of the service wallet. `VPSPAY_PRIVATE_KEY` wins
    /// over this value when set.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            gas_limit: default_gas_limit(),
        }
    }
}

fn default_gas_limit() -> u64 {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub base_url: Url,
    #[serde(default = "default_provision_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provision_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parsing() {
        let toml_str = r#"
[ledger]
http_url = "http://127.0.0.1:8545"
ws_url = "ws://127.0.0.1:8546"
contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"

[provisioner]
base_url = "http://127.0.0.1:9000/api"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.watcher.backoff_base_ms, 500);
        assert_eq!(config.reconciler.confirmations, 60);
        assert_eq!(config.executor.gas_limit, 100_000);
        assert!(config.executor.private_key.is_none());
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
request_timeout_secs = 15

[server]
listen = "127.0.0.1:3000"

[ledger]
http_url = "https://rpc.example.com"
ws_url = "wss://rpc.example.com/ws"
contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"

[watcher]
start_height = 1200
backoff_base_ms = 250
backoff_max_ms = 10000
backfill_chunk = 500

[reconciler]
confirmations = 12
matching_window = 100

[executor]
private_key = "0x01"
gas_limit = 80000

[provisioner]
base_url = "http://127.0.0.1:9000/"
request_timeout_secs = 5
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.watcher.start_height, 1200);
        assert_eq!(config.reconciler.matching_window, 100);
        assert_eq!(config.executor.private_key.as_deref(), Some("0x01"));
        assert_eq!(config.provisioner.request_timeout_secs, 5);
        assert_eq!(config.request_timeout_secs, 15);
    }
}
