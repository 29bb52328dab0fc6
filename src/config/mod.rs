//! Configuration Module
//!
//! Handles configuration loading, validation, and persistence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External WhatsApp gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Webhook + operations HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Full sync tuning
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wa-gateway-sync")
        .join("sync.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Gateway REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway base URL (default: "http://localhost:8080")
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// API key sent as the `apikey` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds (default: 15)
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,

    /// Reserved instance id used by the connectivity probe; must not exist upstream
    #[serde(default = "default_probe_instance")]
    pub probe_instance: String,
}

fn default_gateway_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_gateway_timeout() -> u64 {
    15
}

fn default_probe_instance() -> String {
    "__probe__".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_key: None,
            timeout_secs: default_gateway_timeout(),
            probe_instance: default_probe_instance(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: "127.0.0.1")
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Port (default: 8787)
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// URL the gateway uses to reach this server (webhook registration)
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Shared secret every webhook delivery must carry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,

    /// Header carrying the webhook secret (default: "x-webhook-secret")
    #[serde(default = "default_webhook_header")]
    pub webhook_header: String,

    /// Maximum accepted request body (default: 5 MiB; history batches are large)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8787
}

fn default_public_url() -> String {
    format!("http://127.0.0.1:{}", default_server_port())
}

fn default_webhook_header() -> String {
    "x-webhook-secret".to_string()
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            port: default_server_port(),
            public_url: default_public_url(),
            webhook_secret: None,
            webhook_header: default_webhook_header(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    /// Full webhook URL registered with the gateway.
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.public_url.trim_end_matches('/'))
    }
}

/// Full sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on history pages fetched per full sync (default: 500)
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Messages requested per page (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Seconds a full-sync lease stays valid without renewal (default: 900).
    /// Renewed after every page; an expired lease may be taken over.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_max_pages() -> u32 {
    500
}

fn default_page_size() -> u32 {
    100
}

fn default_lease_secs() -> u64 {
    900
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            page_size: default_page_size(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Priority (lowest to highest):
    /// 1. Default values
    /// 2. System config: ~/.config/wa-gateway-sync/config.toml
    /// 3. Local config: ./wa-gateway-sync.toml
    /// 4. Environment variables
    pub fn load() -> Result<Self> {
        tracing::debug!("Loading configuration...");

        let mut config = Self::default();

        if let Some(system_config_path) = Self::system_config_path()
            && system_config_path.exists()
        {
            tracing::debug!("Loading system config from: {:?}", system_config_path);
            config = Self::load_file(&system_config_path)?;
        }

        let local_config_path = Self::local_config_path();
        if local_config_path.exists() {
            tracing::debug!("Loading local config from: {:?}", local_config_path);
            config = Self::load_file(&local_config_path)?;
        }

        config.apply_env_overrides();

        tracing::debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Loading configuration from custom path: {:?}", path);

        if !path.exists() {
            anyhow::bail!("Config file not found: {:?}", path);
        }
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the system config path: ~/.config/wa-gateway-sync/config.toml
    pub fn system_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wa-gateway-sync").join("config.toml"))
    }

    /// Get the local config path: ./wa-gateway-sync.toml
    pub fn local_config_path() -> PathBuf {
        PathBuf::from("./wa-gateway-sync.toml")
    }

    /// Read a TOML file. Sections missing from the file keep their defaults;
    /// a later file replaces an earlier one wholesale.
    fn load_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup. Split out so tests need not touch
    /// the process environment.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(db_path) = lookup("WA_SYNC_DB_PATH") {
            self.database.path = PathBuf::from(db_path);
        }
        if let Some(level) = lookup("WA_SYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(file) = lookup("WA_SYNC_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
        if let Some(url) = lookup("WA_GATEWAY_URL") {
            self.gateway.base_url = url;
        }
        if let Some(key) = lookup("WA_GATEWAY_API_KEY") {
            self.gateway.api_key = Some(key);
        }
        if let Some(timeout) = lookup("WA_GATEWAY_TIMEOUT_SECS") {
            match timeout.parse() {
                Ok(secs) => self.gateway.timeout_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid WA_GATEWAY_TIMEOUT_SECS: {}", timeout),
            }
        }
        if let Some(secret) = lookup("WA_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        if let Some(bind) = lookup("WA_SERVER_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = lookup("WA_SERVER_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid WA_SERVER_PORT: {}", port),
            }
        }
        if let Some(url) = lookup("WA_PUBLIC_URL") {
            self.server.public_url = url;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        tracing::debug!("Validating configuration...");

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        if self.gateway.base_url.trim().is_empty() {
            anyhow::bail!("gateway.base_url is empty");
        }

        if self.gateway.timeout_secs == 0 {
            anyhow::bail!("gateway.timeout_secs must be greater than zero");
        }

        if self.sync.page_size == 0 || self.sync.max_pages == 0 || self.sync.lease_secs == 0 {
            anyhow::bail!(
                "sync.page_size, sync.max_pages and sync.lease_secs must be greater than zero"
            );
        }

        if self.gateway.api_key.is_none() {
            tracing::warn!("gateway.api_key is not set; gateway calls will be unauthenticated");
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Stricter validation for `serve`: webhooks cannot be accepted without a secret.
    pub fn validate_for_serve(&self) -> Result<()> {
        self.validate()?;
        match self.server.webhook_secret.as_deref() {
            Some(secret) if !secret.trim().is_empty() => Ok(()),
            _ => anyhow::bail!(
                "server.webhook_secret must be set (or WA_WEBHOOK_SECRET) before serving webhooks"
            ),
        }
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.gateway.api_key.is_some() {
            copy.gateway.api_key = Some("********".to_string());
        }
        if copy.server.webhook_secret.is_some() {
            copy.server.webhook_secret = Some("********".to_string());
        }
        copy
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Configuration saved to: {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.gateway.timeout_secs, 15);
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.server.webhook_header, "x-webhook-secret");
        assert!(config.server.webhook_secret.is_none());
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = Config::default();
        config.gateway.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serve_requires_webhook_secret() {
        let mut config = Config::default();
        assert!(config.validate_for_serve().is_err());
        config.server.webhook_secret = Some("   ".to_string());
        assert!(config.validate_for_serve().is_err());
        config.server.webhook_secret = Some("s3cret".to_string());
        assert!(config.validate_for_serve().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_content = r#"
[database]
path = "/custom/path/sync.db"

[gateway]
base_url = "https://gw.example.com"
api_key = "abc"
timeout_secs = 5

[server]
port = 9000
webhook_secret = "hook"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/custom/path/sync.db"));
        assert_eq!(config.gateway.base_url, "https://gw.example.com");
        assert_eq!(config.gateway.api_key.as_deref(), Some("abc"));
        assert_eq!(config.gateway.timeout_secs, 5);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.webhook_secret.as_deref(), Some("hook"));
        // Untouched sections keep defaults
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.sync.lease_secs, 900);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WA_GATEWAY_URL", "http://gw:8080"),
            ("WA_GATEWAY_API_KEY", "from-env"),
            ("WA_WEBHOOK_SECRET", "env-secret"),
            ("WA_SERVER_PORT", "not-a-port"),
            ("WA_GATEWAY_TIMEOUT_SECS", "30"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.gateway.base_url, "http://gw:8080");
        assert_eq!(config.gateway.api_key.as_deref(), Some("from-env"));
        assert_eq!(config.server.webhook_secret.as_deref(), Some("env-secret"));
        assert_eq!(config.gateway.timeout_secs, 30);
        // Invalid port is ignored
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.gateway.api_key = Some("k".to_string());

        config.save(temp_file.path()).unwrap();

        let loaded = Config::load_file(temp_file.path()).unwrap();
        assert_eq!(loaded.logging.level, config.logging.level);
        assert_eq!(loaded.gateway.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_load_from_missing_path_fails() {
        assert!(Config::load_from_path("/definitely/not/here.toml").is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = Config::default();
        config.gateway.api_key = Some("real-key".to_string());
        config.server.webhook_secret = Some("real-secret".to_string());
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("real-key"));
        assert!(!shown.contains("real-secret"));
    }

    #[test]
    fn test_webhook_url() {
        let mut server = ServerConfig::default();
        server.public_url = "https://sync.example.com/".to_string();
        assert_eq!(server.webhook_url(), "https://sync.example.com/webhook");
    }

    #[test]
    fn test_system_config_path() {
        if let Some(path) = Config::system_config_path() {
            assert!(path.to_string_lossy().contains("wa-gateway-sync"));
            assert!(path.to_string_lossy().ends_with("config.toml"));
        }
    }
}
