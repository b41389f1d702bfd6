use rthk_playback::catalog::{self, ArchiveTemplate, Catalog};
use rthk_playback::{PlaybackPolicy, TransportCapabilities};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub playback: PlaybackPolicy,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_favorites_file")]
    pub favorites_file: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

/// UI command socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

/// HTTP fetch relay for browser-based clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Upstream request timeout.
    #[serde(default = "default_relay_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    /// Broadcaster timetable endpoint; `{date}` and `{channel}` are substituted.
    #[serde(default = "default_timetable_url")]
    pub timetable_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_segmented_streaming")]
    pub segmented_streaming: bool,
    /// A load that has not become ready after this long counts as a network failure.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl TransportConfig {
    pub fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            segmented_streaming: self.segmented_streaming,
        }
    }
}

/// Channel list and archive URL templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Optional `[[channel]]` file.  Replaces the built-in channels when present.
    #[serde(default = "default_channels_toml")]
    pub channels_toml: PathBuf,
    /// Archive templates tried in order.  Empty means the built-in family.
    #[serde(default)]
    pub archive_templates: Vec<ArchiveTemplate>,
}

impl CatalogConfig {
    pub fn load_catalog(&self) -> anyhow::Result<Catalog> {
        if !self.channels_toml.exists() {
            return Ok(Catalog::builtin());
        }
        let channels = catalog::load_channels_from_toml(&self.channels_toml)?;
        if channels.is_empty() {
            anyhow::bail!("{} defines no channels", self.channels_toml.display());
        }
        Ok(Catalog::new(channels))
    }

    pub fn templates(&self) -> Vec<ArchiveTemplate> {
        if self.archive_templates.is_empty() {
            catalog::builtin_archive_templates()
        } else {
            self.archive_templates.clone()
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            favorites_file: default_favorites_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: default_relay_enabled(),
            bind_address: default_bind_address(),
            port: default_relay_port(),
            timeout_secs: default_relay_timeout_secs(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
            timetable_url: default_timetable_url(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            segmented_streaming: default_segmented_streaming(),
            load_timeout_secs: default_load_timeout_secs(),
            default_volume: default_volume(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            channels_toml: default_channels_toml(),
            archive_templates: Vec::new(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_favorites_file() -> PathBuf {
    platform::data_dir().join("favorites.json")
}

fn default_log_file() -> PathBuf {
    platform::data_dir().join("daemon.log")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_relay_enabled() -> bool {
    true
}

fn default_relay_port() -> u16 {
    8787
}

fn default_relay_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_accept_language() -> String {
    "zh-HK,zh-TW,zh-CN,en-US,en;q=0.5".to_string()
}

fn default_timetable_url() -> String {
    "https://www.rthk.hk/radio/getTimetable?d={date}&c={channel}".to_string()
}

fn default_segmented_streaming() -> bool {
    true
}

fn default_load_timeout_secs() -> u64 {
    15
}

fn default_volume() -> f32 {
    0.8
}

fn default_channels_toml() -> PathBuf {
    platform::config_dir().join("channels.toml")
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
