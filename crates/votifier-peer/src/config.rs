//! Runtime configuration.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use votifier_core::{PeerTarget, TokenKey, new_token};

/// Top-level receiver configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables debug-level logging.
    #[serde(default)]
    pub debug: bool,
    /// Sends v2 greetings and accepts v2 frames.
    #[serde(default)]
    pub token_support: bool,
    /// Seconds between offline-queue clears; 0 disables.
    #[serde(default = "default_auto_clear_delay")]
    pub auto_clear_delay_secs: u64,
    /// Seconds to wait before flushing a recipient that came online.
    #[serde(default)]
    pub waiting_delay_secs: u64,
    /// Appends undecodable votes to `failed-votes.log`.
    #[serde(default)]
    pub log_failed_votes: bool,
    /// Directory holding `rsa/` and `failed-votes.log`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Version word of the v1 greeting.
    #[serde(default = "default_advertised_version")]
    pub advertised_version: String,
    /// Socket timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Inbound token id to shared secret.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
    /// Forwarding peers by name.
    #[serde(default)]
    pub forwarding: BTreeMap<String, ForwardConfig>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            token_support: false,
            auto_clear_delay_secs: default_auto_clear_delay(),
            waiting_delay_secs: 0,
            log_failed_votes: false,
            data_dir: default_data_dir(),
            advertised_version: default_advertised_version(),
            timeouts: TimeoutConfig::default(),
            tokens: BTreeMap::new(),
            forwarding: BTreeMap::new(),
        }
    }
}

impl ReceiverConfig {
    /// Loads configuration from TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&data)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let cfg = toml::from_str::<Self>(data).map_err(ConfigError::Toml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Writes the configuration back, replacing the file.
    pub fn save_toml_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, text).map_err(ConfigError::Io)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_owned()));
        }
        if self.advertised_version.split_whitespace().count() != 1 {
            return Err(ConfigError::Invalid(
                "advertised_version must be a single word".to_owned(),
            ));
        }
        if self.timeouts.read_ms == 0 || self.timeouts.forward_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.read_ms and timeouts.forward_ms must be greater than zero".to_owned(),
            ));
        }
        for (name, entry) in &self.forwarding {
            if entry.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "forwarding.{name}.host must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Socket address the receiver binds.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directory with `private.key` and `public.key`.
    #[must_use]
    pub fn rsa_dir(&self) -> PathBuf {
        self.data_dir.join("rsa")
    }

    /// Durable failure record file.
    #[must_use]
    pub fn failed_votes_path(&self) -> PathBuf {
        self.data_dir.join("failed-votes.log")
    }

    /// Gives every forwarding entry without a token a fresh one and returns
    /// the names of the entries that changed.
    pub fn fill_missing_forward_tokens(&mut self) -> Vec<String> {
        let mut filled = Vec::new();
        for (name, entry) in &mut self.forwarding {
            if entry.token.trim().is_empty() {
                entry.token = new_token();
                filled.push(name.clone());
            }
        }
        filled
    }

    /// Every forwarding peer in core form, ordered by name.
    #[must_use]
    pub fn peer_targets(&self) -> Vec<(String, PeerTarget)> {
        self.forwarding
            .iter()
            .map(|(name, entry)| (name.clone(), entry.to_target()))
            .collect()
    }
}

/// One forwarding peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Disabled entries are never dialed.
    #[serde(default)]
    pub enabled: bool,
    /// Peer host.
    #[serde(default = "default_forward_host")]
    pub host: String,
    /// Peer port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Peer RSA public key (PEM or single-line base64), used when `use_token` is false.
    #[serde(default)]
    pub key: String,
    /// Shared secret, used when `use_token` is true.
    #[serde(default)]
    pub token: String,
    /// Forward with the v2 codec.
    #[serde(default)]
    pub use_token: bool,
}

impl ForwardConfig {
    fn to_target(&self) -> PeerTarget {
        let token = self.token.trim();
        PeerTarget {
            enabled: self.enabled,
            host: self.host.clone(),
            port: self.port,
            public_key_material: self.key.clone(),
            token: (!token.is_empty()).then(|| TokenKey::from_secret(token)),
            use_token: self.use_token,
        }
    }
}

/// Timeouts in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Inbound handshake and read budget per connection.
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    /// Outbound connect plus I/O budget per forward.
    #[serde(default = "default_forward_ms")]
    pub forward_ms: u64,
    /// How long shutdown waits for in-flight connections.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            forward_ms: default_forward_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Inbound read timeout.
    #[must_use]
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    /// Outbound forward timeout.
    #[must_use]
    pub fn forward(&self) -> Duration {
        Duration::from_millis(self.forward_ms)
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Embedded example configuration template.
pub const EXAMPLE_CONFIG_TOML: &str = include_str!("../votifier-peer.example.toml");

/// Writes the embedded example config to `path`.
pub fn write_example_config(path: impl AsRef<Path>, overwrite: bool) -> Result<(), std::io::Error> {
    if overwrite {
        return std::fs::write(path, EXAMPLE_CONFIG_TOML);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(EXAMPLE_CONFIG_TOML.as_bytes())
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File read or write error.
    #[error("failed to access config file: {0}")]
    Io(std::io::Error),
    /// TOML parse error.
    #[error("failed to parse config toml: {0}")]
    Toml(toml::de::Error),
    /// TOML encode error.
    #[error("failed to encode config toml: {0}")]
    Serialize(toml::ser::Error),
    /// Semantically invalid value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8192
}

fn default_forward_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_auto_clear_delay() -> u64 {
    7200
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_advertised_version() -> String {
    "1".to_owned()
}

fn default_read_ms() -> u64 {
    10_000
}

fn default_forward_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "votifier-peer-{tag}-{}-{}.toml",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ))
    }

    #[test]
    fn write_example_config_honors_overwrite_flag() {
        let path = temp_path("example-config");

        write_example_config(&path, false).expect("write initial template");
        let first = std::fs::read_to_string(&path).expect("read first");
        assert!(first.contains("token_support"));

        let err = write_example_config(&path, false).expect_err("second create should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);

        write_example_config(&path, true).expect("overwrite template");
        let second = std::fs::read_to_string(&path).expect("read second");
        assert_eq!(first, second);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn example_template_parses() {
        let cfg = ReceiverConfig::from_toml_str(EXAMPLE_CONFIG_TOML).expect("example parses");
        assert_eq!(cfg.port, 8192);
        assert!(cfg.forwarding.contains_key("example_server"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = ReceiverConfig::from_toml_str("").expect("defaults");
        assert_eq!(cfg.bind_address(), "0.0.0.0:8192");
        assert!(!cfg.token_support);
        assert_eq!(cfg.auto_clear_delay_secs, 7200);
        assert_eq!(cfg.timeouts.read(), Duration::from_secs(10));
        assert_eq!(cfg.failed_votes_path(), Path::new("./failed-votes.log"));
    }

    #[test]
    fn multi_word_version_is_rejected() {
        let err = ReceiverConfig::from_toml_str("advertised_version = \"1 2\"")
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        for toml in ["[timeouts]\nread_ms = 0", "[timeouts]\nforward_ms = 0"] {
            let err = ReceiverConfig::from_toml_str(toml).expect_err("must fail");
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}");
        }
        let cfg = ReceiverConfig::from_toml_str("[timeouts]\nread_ms = 1\nforward_ms = 1")
            .expect("positive timeouts");
        assert_eq!(cfg.timeouts.read(), std::time::Duration::from_millis(1));
    }

    #[test]
    fn missing_forward_tokens_are_filled_and_persisted() {
        let mut cfg = ReceiverConfig::from_toml_str(
            r#"
[forwarding.hub]
enabled = true
host = "10.0.0.2"
use_token = true

[forwarding.lobby]
token = "keep-me"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.fill_missing_forward_tokens(), ["hub"]);
        assert_eq!(cfg.forwarding["lobby"].token, "keep-me");
        assert_eq!(cfg.forwarding["hub"].token.len(), 16);

        let path = temp_path("saved-config");
        cfg.save_toml_file(&path).expect("save");
        let reloaded = ReceiverConfig::from_toml_file(&path).expect("reload");
        assert_eq!(reloaded.forwarding["hub"].token, cfg.forwarding["hub"].token);
        let targets = reloaded.peer_targets();
        let (name, target) = targets.first().expect("peer");
        assert_eq!(name, "hub");
        assert!(target.enabled && target.use_token && target.token.is_some());
        let _ = std::fs::remove_file(path);
    }
}
