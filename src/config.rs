//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. explicit path (`huginnd --config <path>`)
//! 2. `~/.huginn/config.toml` (user)
//! 3. `/etc/huginn/config.toml` (system)
//!
//! The sync API token is loaded separately with a mandatory permission check:
//! 1. `~/.huginn/secrets.toml` (user, must be 0600)
//! 2. `/etc/huginn/secrets.toml` (system, must be 0600)
//! 3. `HUGINN_API_TOKEN` environment variable
//!
//! Durations are written in milliseconds (`*_ms` keys).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::edge::{EdgeConfig, QueueConfig};
use crate::net::RetryConfig;
use crate::store::StoreConfig;
use crate::{HuginnError, Result};

const TOKEN_ENV_VAR: &str = "HUGINN_API_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Local-first stores to open.
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

/// Remote API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL every sync endpoint is resolved against.
    pub base_url: String,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Directory for the storage snapshot (default: platform data dir).
    pub data_dir: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            data_dir: None,
        }
    }
}

impl RemoteConfig {
    /// Resolved data directory: configured, else `<data_dir>/huginn`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from(".local/share"))
                .join("huginn")
        })
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.huginn/config.toml`
    /// 3. `/etc/huginn/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            HuginnError::Configuration(msg) => {
                HuginnError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Like [`load`](Self::load), but fall back to defaults when no
    /// implicit config file exists. A missing explicit path is still an error.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match explicit_path {
            Some(_) => Self::load(explicit_path),
            None => match Self::resolve_config_path(None) {
                Ok(path) => Self::load(Some(&path)),
                Err(_) => Ok(Self::default()),
            },
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            HuginnError::Configuration(format!("Failed to parse config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.edge.validate()?;
        url::Url::parse(&self.remote.base_url).map_err(|e| {
            HuginnError::Configuration(format!(
                "invalid remote.base_url '{}': {e}",
                self.remote.base_url
            ))
        })?;
        let mut names = std::collections::HashSet::new();
        for store in &self.stores {
            if !names.insert(store.name.as_str()) {
                return Err(HuginnError::Configuration(format!(
                    "store '{}' is configured twice",
                    store.name
                )));
            }
        }
        Ok(())
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(HuginnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".huginn").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/huginn/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(HuginnError::Configuration(
            "No config file found. Create ~/.huginn/config.toml or /etc/huginn/config.toml"
                .to_string(),
        ))
    }
}

/// Secrets (sync API token).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists.
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".huginn").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/huginn/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HuginnError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// The API token, falling back to `HUGINN_API_TOKEN`.
    pub fn api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
    }
}

/// Reject secrets files readable by group or others.
#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(|e| {
        HuginnError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
    })?;

    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(HuginnError::Configuration(format!(
            "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Serde adapter: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serde adapter: `Option<Duration>` as optional integer milliseconds.
pub(crate) mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConflictPolicy;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.remote.base_url, "http://localhost:8080");
        assert_eq!(config.edge.buckets.len(), 7);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.stores.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [remote]
            base_url = "https://console.example.org"
            request_timeout_ms = 5000

            [edge]
            default_bucket = "api"

            [edge.buckets.api]
            strategy = "network-first"
            max_age_ms = 60000
            max_entries = 10
            network_timeout_ms = 2000

            [queue]
            default_max_retries = 5

            [retry]
            max_attempts = 4
            initial_delay_ms = 100

            [[stores]]
            name = "evaluations"
            endpoint = "/api/evaluations"
            conflict_policy = "merge"
            batch_size = 5
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.remote.request_timeout, Duration::from_secs(5));
        assert_eq!(config.edge.default_bucket, "api");
        assert_eq!(config.edge.buckets["api"].max_entries, 10);
        // Buckets not mentioned keep their defaults.
        assert!(config.edge.buckets.contains_key("fonts"));
        assert_eq!(config.queue.default_max_retries, 5);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(100));
        let store = &config.stores[0];
        assert_eq!(store.conflict_policy, ConflictPolicy::Merge);
        assert_eq!(store.batch_size, 5);
        assert_eq!(store.debounce, Duration::from_secs(1));
    }

    #[test]
    fn duplicate_store_rejected() {
        let toml = r#"
            [[stores]]
            name = "a"
            endpoint = "/api/a"

            [[stores]]
            name = "a"
            endpoint = "/api/b"
        "#;
        assert!(matches!(
            Config::from_toml_str(toml),
            Err(HuginnError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_base_url_rejected() {
        let toml = r#"
            [remote]
            base_url = "not a url"
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn missing_explicit_path_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/huginn.toml"))).unwrap_err();
        assert!(matches!(err, HuginnError::Configuration(_)));
    }

    #[test]
    fn parse_secrets() {
        let secrets: Secrets = toml::from_str(r#"api_token = "tok""#).unwrap();
        assert_eq!(secrets.api_token(), Some("tok".to_string()));
    }
}
