//! Gateway configuration: JSON file under the switchboard home directory
//! with environment-variable overrides for deployment secrets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub fn switchboard_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("SWITCHBOARD_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|h| h.join(".switchboard"))
        .context("Cannot determine home directory")
}

pub fn config_path() -> Result<PathBuf> {
    Ok(switchboard_home()?.join("config.json"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSection {
    #[serde(default, rename = "databaseUrl")]
    pub database_url: Option<String>,
    #[serde(default, rename = "databaseKey")]
    pub database_key: Option<String>,
    #[serde(default, rename = "kvUrl")]
    pub kv_url: Option<String>,
    #[serde(default, rename = "kvToken")]
    pub kv_token: Option<String>,
    /// Directory for the tier-3 snapshot file. Defaults to the switchboard
    /// home when unset.
    #[serde(default, rename = "dataDir")]
    pub data_dir: Option<PathBuf>,
    /// Issuance endpoint for bootstrap-token exchange. Without it, pushed
    /// configs must carry a long-lived token directly.
    #[serde(default, rename = "tokenIssuanceUrl")]
    pub token_issuance_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_timeout_secs", rename = "timeoutSecs")]
    pub timeout_secs: u64,
    #[serde(default = "default_summary_threshold", rename = "summaryThreshold")]
    pub summary_threshold: usize,
    #[serde(default = "default_summary_keep", rename = "summaryKeep")]
    pub summary_keep: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            summary_threshold: default_summary_threshold(),
            summary_keep: default_summary_keep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_throttle_ms", rename = "throttleMs")]
    pub throttle_ms: u64,
    #[serde(default, rename = "inferenceUrl")]
    pub inference_url: Option<String>,
    #[serde(default = "default_model", rename = "defaultModel")]
    pub default_model: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
            inference_url: None,
            default_model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventsSection {
    /// When set, unroutable work is published to this CloudEvent sink.
    #[serde(default, rename = "publishUrl")]
    pub publish_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub events: EventsSection,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_summary_threshold() -> usize {
    10
}

fn default_summary_keep() -> usize {
    5
}

fn default_throttle_ms() -> u64 {
    500
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let default_path = config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = path.unwrap_or(default_path.as_path());

    let mut config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Secrets come from the environment in deployed setups; env wins over file.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(url) = std::env::var("SWITCHBOARD_DATABASE_URL")
        && !url.is_empty()
    {
        config.storage.database_url = Some(url);
    }
    if let Ok(key) = std::env::var("SWITCHBOARD_DATABASE_KEY")
        && !key.is_empty()
    {
        config.storage.database_key = Some(key);
    }
    if let Ok(url) = std::env::var("SWITCHBOARD_KV_URL")
        && !url.is_empty()
    {
        config.storage.kv_url = Some(url);
    }
    if let Ok(token) = std::env::var("SWITCHBOARD_KV_TOKEN")
        && !token.is_empty()
    {
        config.storage.kv_token = Some(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_empty_object() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.context.timeout_secs, 3600);
        assert_eq!(config.context.summary_threshold, 10);
        assert_eq!(config.context.summary_keep, 5);
        assert_eq!(config.relay.throttle_ms, 500);
        assert!(config.storage.database_url.is_none());
    }

    #[test]
    fn camel_case_keys_deserialize() {
        let json = r#"{
            "gateway": {"host": "127.0.0.1", "port": 9000},
            "storage": {"databaseUrl": "https://db.example", "kvToken": "t"},
            "relay": {"throttleMs": 250, "defaultModel": "test-model"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.storage.database_url.as_deref(), Some("https://db.example"));
        assert_eq!(config.storage.kv_token.as_deref(), Some("t"));
        assert_eq!(config.relay.throttle_ms, 250);
        assert_eq!(config.relay.default_model, "test-model");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.gateway.port, 8080);
    }

    #[test]
    fn file_values_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"gateway": {"port": 3030}}"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 3030);
    }
}
