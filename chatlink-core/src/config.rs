//! Persistent configuration.
//!
//! Config file lives at `~/.config/chatlink/config.toml`: a `[settings]`
//! table followed by one `[[servers]]` table per configured server.
//! Autoconnect state is kept next to it (see [`crate::autoconnect`]).
//! Chat logs go under `~/.local/share/chatlink/logs/<server id>/`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::policy::{BackoffRule, BackoffSchedule, default_rules};
use crate::prefs::NetworkType;

/// Default QUIT message.
pub const DEFAULT_QUIT_MESSAGE: &str = "chatlink";

/// Global settings shared by all connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Automatically reconnect after unexpected drops.
    pub reconnect_enabled: bool,
    /// Only reconnect automatically while on Wi-Fi.
    pub reconnect_wifi_required: bool,
    /// Reconnect after the network changes under a live connection.
    pub reconnect_on_connectivity_change: bool,
    /// Tiered reconnect delays.
    pub reconnect_intervals: Vec<BackoffRule>,
    /// Message sent when disconnecting gracefully.
    pub quit_message: String,
    /// Network type to assume when the platform can't tell us.
    pub network: NetworkType,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconnect_enabled: true,
            reconnect_wifi_required: false,
            reconnect_on_connectivity_change: true,
            reconnect_intervals: default_rules(),
            quit_message: DEFAULT_QUIT_MESSAGE.to_string(),
            network: NetworkType::Unknown,
        }
    }
}

impl Settings {
    pub fn backoff_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::new(self.reconnect_intervals.clone())
    }
}

/// SASL PLAIN credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslOptions {
    pub username: String,
    pub password: String,
}

/// One configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identity. Left out of a hand-written file, one is assigned on
    /// load and written back.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Server address (host:port).
    pub address: String,
    /// Use TLS. Auto-enabled for port 6697.
    #[serde(default)]
    pub tls: bool,
    /// Accept any server certificate. Without it an untrusted certificate
    /// counts as rejected and the connection won't retry on its own.
    #[serde(default)]
    pub tls_insecure: bool,
    pub nick: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    /// Server password (PASS).
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sasl: Option<SaslOptions>,
    /// Channels joined on every successful connect.
    #[serde(default)]
    pub autojoin: Vec<String>,
    /// Also rejoin the channels that were open before a drop.
    #[serde(default = "default_true")]
    pub rejoin_channels: bool,
    /// Nicks whose messages are not logged.
    #[serde(default)]
    pub ignore: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// A new server config with a fresh id.
    pub fn new(name: impl Into<String>, address: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            address: address.into(),
            tls: false,
            tls_insecure: false,
            nick: nick.into(),
            user: None,
            realname: None,
            password: None,
            sasl: None,
            autojoin: Vec::new(),
            rejoin_channels: true,
            ignore: Vec::new(),
        }
    }

    /// TLS explicitly requested or implied by the conventional TLS port.
    pub fn use_tls(&self) -> bool {
        self.tls || self.address.ends_with(":6697")
    }

    /// Host part of the address, for TLS server name checks.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host.trim_start_matches('[').trim_end_matches(']'),
            _ => &self.address,
        }
    }

    pub fn is_ignored(&self, nick: &str) -> bool {
        self.ignore.iter().any(|n| n.eq_ignore_ascii_case(nick))
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// `~/.config/chatlink`, or `./chatlink` when the platform has no config dir.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatlink")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Directory holding one log database per server.
pub fn chat_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatlink")
        .join("logs")
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    ///
    /// Servers without an id get a fresh one, and the file is rewritten so
    /// the id sticks across restarts.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.assign_missing_ids() > 0 {
            config.save(path)?;
        }
        Ok(config)
    }

    /// Give every server without an id a fresh one. Returns how many changed.
    pub fn assign_missing_ids(&mut self) -> usize {
        let mut assigned = 0;
        for server in self.servers.iter_mut().filter(|s| s.id.is_nil()) {
            server.id = Uuid::new_v4();
            assigned += 1;
        }
        assigned
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(path, &toml::to_string_pretty(self)?)
    }

}

pub(crate) fn write_toml(path: &Path, text: &str) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    // Write beside the target and rename over it, so readers never see a
    // half-written file.
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text).map_err(|source| ConfigError::Write {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
