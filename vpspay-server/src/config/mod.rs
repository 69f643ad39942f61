//! Configuration module for vpspay-server.
//!
//! Handles loading configuration from the TOML file, CLI arguments and
//! environment variables, and converting it into the engine's runtime types.

pub mod file;

use crate::config::file::FileConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vpspay_core::chain::Address;
use vpspay_core::config::{
    EngineConfig, ExecutorConfig, LedgerConfig, ProvisionerConfig, ReconcilerConfig,
    WatcherConfig,
};

/// Environment variable holding the executor key; overrides the file.
pub const PRIVATE_KEY_ENV: &str = "VPSPAY_PRIVATE_KEY";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration result containing all parts.
#[derive(Debug)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub engine: EngineConfig,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Read the TOML file, apply overrides and validate.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let file_config: FileConfig = toml::from_str(&config_content)?;
        let env_key = std::env::var(PRIVATE_KEY_ENV).ok();
        build_loaded_config(file_config, self.listen_override, env_key)
    }
}

fn build_loaded_config(
    file_config: FileConfig,
    listen_override: Option<SocketAddr>,
    env_key: Option<String>,
) -> Result<LoadedConfig, ConfigError> {
    let contract_address: Address = file_config
        .ledger
        .contract_address
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("ledger.contract_address: {e}")))?;

    let private_key = env_key
        .filter(|k| !k.trim().is_empty())
        .or(file_config.executor.private_key)
        .ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "executor.private_key is not set (file or {PRIVATE_KEY_ENV})"
            ))
        })?;

    let watcher = file_config.watcher;
    if watcher.backoff_base_ms == 0 || watcher.backoff_max_ms < watcher.backoff_base_ms {
        return Err(ConfigError::ValidationError(
            "watcher backoff must satisfy 0 < backoff_base_ms <= backoff_max_ms".to_string(),
        ));
    }
    if watcher.backfill_chunk <= 0 {
        return Err(ConfigError::ValidationError(
            "watcher.backfill_chunk must be positive".to_string(),
        ));
    }
    let reconciler = file_config.reconciler;
    if reconciler.confirmations < 0 || reconciler.matching_window < 0 {
        return Err(ConfigError::ValidationError(
            "reconciler.confirmations and reconciler.matching_window must not be negative"
                .to_string(),
        ));
    }

    Ok(LoadedConfig {
        listen: listen_override.unwrap_or(file_config.server.listen),
        engine: EngineConfig {
            ledger: LedgerConfig {
                http_url: file_config.ledger.http_url,
                ws_url: file_config.ledger.ws_url,
                contract_address,
            },
            watcher: WatcherConfig {
                start_height: watcher.start_height,
                backoff_base: Duration::from_millis(watcher.backoff_base_ms),
                backoff_max: Duration::from_millis(watcher.backoff_max_ms),
                backfill_chunk: watcher.backfill_chunk,
            },
            reconciler: ReconcilerConfig {
                confirmations: reconciler.confirmations,
                matching_window: reconciler.matching_window,
            },
            executor: ExecutorConfig {
                private_key,
                gas_limit: file_config.executor.gas_limit,
            },
            provisioner: ProvisionerConfig {
                base_url: file_config.provisioner.base_url,
                request_timeout: Duration::from_secs(file_config.provisioner.request_timeout_secs),
            },
            request_timeout: Duration::from_secs(file_config.request_timeout_secs),
        },
    })
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[ledger]
http_url = "http://127.0.0.1:8545"
ws_url = "ws://127.0.0.1:8546"
contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"

[executor]
private_key = "0xfile"

[provisioner]
base_url = "http://127.0.0.1:9000/"
"#;

    fn parse(extra: &str) -> FileConfig {
        toml::from_str(&format!("{BASE}{extra}")).unwrap()
    }

    #[test]
    fn test_env_key_overrides_file_key() {
        let loaded = build_loaded_config(parse(""), None, Some("0xenv".into())).unwrap();
        assert_eq!(loaded.engine.executor.private_key, "0xenv");

        let loaded = build_loaded_config(parse(""), None, Some("  ".into())).unwrap();
        assert_eq!(loaded.engine.executor.private_key, "0xfile");
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut config = parse("");
        config.executor.private_key = None;
        let err = build_loaded_config(config, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains(PRIVATE_KEY_ENV)));
    }

    #[test]
    fn test_bad_contract_address_is_rejected() {
        let mut config = parse("");
        config.ledger.contract_address = "0x1234".into();
        let err = build_loaded_config(config, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("contract_address")));
    }

    #[test]
    fn test_durations_and_listen_override() {
        let listen: SocketAddr = "127.0.0.1:3001".parse().unwrap();
        let loaded = build_loaded_config(
            parse("\n[watcher]\nbackoff_base_ms = 250\nbackoff_max_ms = 1000\n"),
            Some(listen),
            None,
        )
        .unwrap();
        assert_eq!(loaded.listen, listen);
        assert_eq!(loaded.engine.watcher.backoff_base, Duration::from_millis(250));
        assert_eq!(loaded.engine.watcher.backoff_max, Duration::from_secs(1));
        assert_eq!(loaded.engine.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_inverted_backoff_is_rejected() {
        let config = parse("\n[watcher]\nbackoff_base_ms = 5000\nbackoff_max_ms = 1000\n");
        assert!(build_loaded_config(config, None, None).is_err());
    }
}
