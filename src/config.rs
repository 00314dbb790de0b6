use std::{env, net::SocketAddr, time::Duration};

use anyhow::Result;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub endpoint: Option<String>,
    pub structured_logging: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            endpoint: None,
            structured_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub compression_threshold_bytes: usize,
    pub local_max_entries: u64,
    pub shared_op_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = cache::CacheConfig::default();
        Self {
            ttl_secs: defaults.ttl.as_secs(),
            compression_threshold_bytes: defaults.compression_threshold_bytes,
            local_max_entries: defaults.local_max_entries,
            shared_op_timeout_ms: defaults.shared_op_timeout.as_millis() as u64,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> cache::CacheConfig {
        cache::CacheConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            compression_threshold_bytes: self.compression_threshold_bytes,
            local_max_entries: self.local_max_entries,
            shared_op_timeout: Duration::from_millis(self.shared_op_timeout_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub state_store_path: String,
    pub listen_addr: String,
    /// External base URL used to build share links and locally signed
    /// blob URLs.
    pub api_base_url: String,
    pub max_upload_size_bytes: u64,
    pub signed_url_ttl_secs: u64,
    /// Secret for locally signed blob URLs. Must be identical on every
    /// instance behind the same base URL.
    pub url_signing_secret: String,
    pub blob_storage: BlobStorageConfig,
    pub cache: CacheSettings,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_store_path = env::current_dir().unwrap().join("vault_storage/state");
        ServerConfig {
            state_store_path: state_store_path.to_str().unwrap().to_string(),
            listen_addr: "0.0.0.0:8900".to_string(),
            api_base_url: "http://localhost:8900".to_string(),
            max_upload_size_bytes: 512 * 1024 * 1024,
            signed_url_ttl_secs: 300,
            url_signing_secret: nanoid::nanoid!(32),
            blob_storage: Default::default(),
            cache: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blob_storage.path.is_none() {
            return Err(anyhow::anyhow!("blob storage path must be configured"));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.max_upload_size_bytes == 0 {
            return Err(anyhow::anyhow!("max_upload_size_bytes must be positive"));
        }
        if self.url_signing_secret.is_empty() {
            return Err(anyhow::anyhow!("url_signing_secret must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let config = ServerConfig {
            listen_addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
