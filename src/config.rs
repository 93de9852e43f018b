//! Server Configuration
//!
//! Configuration comes from an optional TOML file; every field has a default,
//! so an empty file (or no file) yields a working server. Command-line flags
//! parsed in `main.rs` override individual fields afterwards.
//!
//! ```toml
//! port = 6380
//! workers = 8
//! requirepass = "s3cret"
//! slave_readonly = true
//! slowlog_log_slower_than = 5000
//!
//! [namespaces]
//! analytics = "token-for-analytics"
//! ```

use crate::protocol::decoder::{
    DEFAULT_MAX_BULK_LEN, DEFAULT_MAX_HEADER_LINE, DEFAULT_MAX_MULTIBULK_LEN,
};
use crate::server::pubsub::DEFAULT_MAILBOX_CAPACITY;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Number of worker threads owning client sessions
    pub workers: usize,
    /// Password granting the admin namespace
    pub requirepass: Option<String>,
    /// Namespace name to token
    pub namespaces: HashMap<String, String>,
    /// Reject write commands on replica sessions
    pub slave_readonly: bool,
    /// Idle read timeout in seconds; 0 disables it
    pub timeout_secs: u64,
    pub max_multibulk_len: u64,
    pub max_bulk_len: u64,
    pub max_header_line: usize,
    /// Slow-log threshold in microseconds. Negative disables the slow-log.
    pub slowlog_log_slower_than: i64,
    pub slowlog_max_len: usize,
    /// Undelivered pub/sub messages a subscriber may fall behind by before
    /// it is disconnected
    pub pubsub_mailbox_capacity: usize,
    /// Directory served to replicas by `_FETCH_FILE`
    pub dir: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            workers: 4,
            requirepass: None,
            namespaces: HashMap::new(),
            slave_readonly: true,
            timeout_secs: 300,
            max_multibulk_len: DEFAULT_MAX_MULTIBULK_LEN,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_header_line: DEFAULT_MAX_HEADER_LINE,
            slowlog_log_slower_than: 10_000,
            slowlog_max_len: 128,
            pubsub_mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            dir: PathBuf::from("."),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.max_multibulk_len == 0 || self.max_bulk_len == 0 || self.max_header_line == 0 {
            return Err(ConfigError::Invalid(
                "protocol limits must be non-zero".into(),
            ));
        }
        if self.pubsub_mailbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pubsub_mailbox_capacity must be at least 1".into(),
            ));
        }
        if self.requirepass.as_deref() == Some("") {
            return Err(ConfigError::Invalid("requirepass must not be empty".into()));
        }
        self.validate_namespaces()
    }

    /// Every namespace needs a name and a token that maps back to it alone.
    fn validate_namespaces(&self) -> Result<(), ConfigError> {
        let mut namespaces: Vec<(&str, &str)> = self
            .namespaces
            .iter()
            .map(|(name, token)| (name.as_str(), token.as_str()))
            .collect();
        namespaces.sort_unstable();

        let mut tokens: HashSet<&str> = self.requirepass.iter().map(String::as_str).collect();
        for (name, token) in namespaces {
            if name.is_empty() {
                return Err(ConfigError::Invalid("namespace names must not be empty".into()));
            }
            if name == crate::ADMIN_NAMESPACE {
                return Err(ConfigError::Invalid(format!(
                    "namespace name {} is reserved",
                    name
                )));
            }
            if token.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "token for namespace {} must not be empty",
                    name
                )));
            }
            if !tokens.insert(token) {
                return Err(ConfigError::Invalid(format!(
                    "token for namespace {} is already in use",
                    name
                )));
            }
        }
        Ok(())
    }

    /// True when clients must `AUTH` before running other commands.
    pub fn auth_required(&self) -> bool {
        self.requirepass.is_some() || !self.namespaces.is_empty()
    }

    /// Resolves an `AUTH` token to the namespace it grants.
    pub fn namespace_for_token(&self, token: &[u8]) -> Option<&str> {
        if self.requirepass.as_deref().map(str::as_bytes) == Some(token) {
            return Some(crate::ADMIN_NAMESPACE);
        }
        self.namespaces
            .iter()
            .find(|(_, t)| t.as_bytes() == token)
            .map(|(name, _)| name.as_str())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.port, 6379);
        assert_eq!(config.workers, 4);
        assert!(config.slave_readonly);
        assert!(!config.auth_required());
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            port = 7000
            requirepass = "secret"
            timeout_secs = 0

            [namespaces]
            analytics = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.bind_address(), "127.0.0.1:7000");
        assert!(config.auth_required());
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.namespace_for_token(b"secret"), Some(crate::ADMIN_NAMESPACE));
        assert_eq!(config.namespace_for_token(b"abc"), Some("analytics"));
        assert_eq!(config.namespace_for_token(b"nope"), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_toml("workers = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("max_bulk_len = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("pubsub_mailbox_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("port = \"abc\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_namespace_validation() {
        let rejected = [
            "[namespaces]\n\"\" = \"tok\"",
            "[namespaces]\nanalytics = \"\"",
            "[namespaces]\n__namespace = \"tok\"",
            "[namespaces]\nanalytics = \"tok\"\nbilling = \"tok\"",
            "requirepass = \"tok\"\n[namespaces]\nanalytics = \"tok\"",
        ];
        for raw in rejected {
            assert!(
                matches!(Config::from_toml(raw), Err(ConfigError::Invalid(_))),
                "{}",
                raw
            );
        }

        let config = Config::from_toml(
            "requirepass = \"admin\"\n[namespaces]\nanalytics = \"a\"\nbilling = \"b\"",
        )
        .unwrap();
        assert_eq!(config.namespace_for_token(b"a"), Some("analytics"));
        assert_eq!(config.namespace_for_token(b"b"), Some("billing"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
