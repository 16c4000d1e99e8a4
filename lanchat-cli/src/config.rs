//! Load config from file and environment, then validate before any socket is opened.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanchat_core::envelope::DEFAULT_MAX_MESSAGE_BYTES;
use lanchat_core::{validate_nickname, GroupKey, KeyError, NicknameError};
use serde::Deserialize;

use crate::session::SessionConfig;
use crate::transport::{DEFAULT_GROUP, DEFAULT_PORT};

/// Smallest accepted `max_message_bytes`.
pub const MIN_MESSAGE_BYTES: usize = 64;

/// Client configuration. File: $LANCHAT_CONFIG, ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_NICK, LANCHAT_GROUP, LANCHAT_PORT, LANCHAT_KEY, LANCHAT_HTTP_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name (default: login name).
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// Multicast group (default 230.0.0.1).
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    /// UDP port (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// 32 hex chars, or a passphrase. Unset means the legacy shared key.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_presence_timeout_secs")]
    pub presence_timeout_secs: u64,
    /// Plaintext cap before truncation (default 8192).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Local HTTP bridge port. Unset disables the bridge.
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Lines kept for GET /api/messages (default 500).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_nickname() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|n| validate_nickname(n).is_ok())
        .unwrap_or_else(|| "guest".to_string())
}
fn default_group() -> Ipv4Addr {
    DEFAULT_GROUP
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_presence_timeout_secs() -> u64 {
    20
}
fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}
fn default_shutdown_grace_ms() -> u64 {
    300
}
fn default_history_limit() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            group: default_group(),
            port: default_port(),
            key: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            presence_timeout_secs: default_presence_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            http_port: None,
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not valid")]
    Env { var: &'static str, value: String },
    #[error("nickname: {0}")]
    Nickname(#[from] NicknameError),
    #[error("group {0} is not an IPv4 multicast address")]
    Group(Ipv4Addr),
    #[error("key: {0}")]
    Key(#[from] KeyError),
    #[error("heartbeat interval ({heartbeat}s) must be shorter than presence timeout ({timeout}s)")]
    Heartbeat { heartbeat: u64, timeout: u64 },
    #[error("max_message_bytes must be at least {MIN_MESSAGE_BYTES}, got {0}")]
    MessageCap(usize),
}

impl Config {
    /// Check cross-field rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_nickname(&self.nickname)?;
        if !self.group.is_multicast() {
            return Err(ConfigError::Group(self.group));
        }
        if self.heartbeat_interval_secs == 0
            || self.heartbeat_interval_secs >= self.presence_timeout_secs
        {
            return Err(ConfigError::Heartbeat {
                heartbeat: self.heartbeat_interval_secs,
                timeout: self.presence_timeout_secs,
            });
        }
        if self.max_message_bytes < MIN_MESSAGE_BYTES {
            return Err(ConfigError::MessageCap(self.max_message_bytes));
        }
        self.group_key()?;
        Ok(())
    }

    /// Key from config, or the legacy shared key when unset.
    pub fn group_key(&self) -> Result<GroupKey, ConfigError> {
        match &self.key {
            Some(k) => Ok(GroupKey::parse(k)?),
            None => Ok(GroupKey::legacy()),
        }
    }

    /// Session settings after [`validate`](Self::validate) passed.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let key = self.group_key()?;
        if key.is_legacy() {
            tracing::warn!("using the built-in shared key; set `key` or LANCHAT_KEY for a private group");
        }
        let mut s = SessionConfig::new(validate_nickname(&self.nickname)?, key);
        s.max_message_bytes = self.max_message_bytes;
        s.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs);
        s.presence_timeout = Duration::from_secs(self.presence_timeout_secs);
        s.shutdown_grace = Duration::from_millis(self.shutdown_grace_ms);
        Ok(s)
    }

    /// Apply LANCHAT_* overrides from `lookup`.
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("LANCHAT_NICK") {
            self.nickname = s;
        }
        if let Some(s) = lookup("LANCHAT_GROUP") {
            self.group = s.parse().map_err(|_| ConfigError::Env {
                var: "LANCHAT_GROUP",
                value: s.clone(),
            })?;
        }
        if let Some(s) = lookup("LANCHAT_PORT") {
            self.port = s.parse().map_err(|_| ConfigError::Env {
                var: "LANCHAT_PORT",
                value: s.clone(),
            })?;
        }
        if let Some(s) = lookup("LANCHAT_KEY") {
            self.key = Some(s);
        }
        if let Some(s) = lookup("LANCHAT_HTTP_PORT") {
            self.http_port = Some(s.parse().map_err(|_| ConfigError::Env {
                var: "LANCHAT_HTTP_PORT",
                value: s.clone(),
            })?);
        }
        Ok(())
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit `path` must exist; the well-known locations are optional.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("LANCHAT_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME") {
        out.push(PathBuf::from(h).join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(c)
}
