use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ReconnectPolicy;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [channel]
//                    reconnect_delay_ms = 2000
//
//   env var:         FORKCHAT_CHANNEL__RECONNECT_DELAY_MS=2000   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
    #[serde(default)]
    pub engine: EngineFileConfig,
}

/// Backend location (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// WebSocket origin. Derived from `base_url` when unset.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: None,
            api_prefix: default_api_prefix(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    #[default]
    Fixed,
    Exponential,
}

/// Push channel tunables (lives under `[channel]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    #[serde(default)]
    pub reconnect: ReconnectMode,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound for exponential backoff; ignored in fixed mode.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectMode::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Engine tunables (lives under `[engine]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineFileConfig {
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
}

impl Default for EngineFileConfig {
    fn default() -> Self {
        Self {
            notify_capacity: default_notify_capacity(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_api_prefix() -> String {
    "/api/v1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_max_reconnect_delay_ms() -> u64 {
    60_000
}
fn default_event_capacity() -> usize {
    256
}
fn default_notify_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config.toml → FORKCHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `FORKCHAT_SERVER__BASE_URL=https://chat.example`  →  `server.base_url`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("FORKCHAT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Resolved backend endpoints.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// REST root including the API prefix, without a trailing slash.
    pub api_base: String,
    /// WebSocket origin, without a trailing slash.
    pub ws_base: String,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        let base = fc.base_url.trim_end_matches('/');
        let prefix = fc.api_prefix.trim_matches('/');
        let api_base = if prefix.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, prefix)
        };
        let ws_base = match &fc.ws_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => derive_ws_base(base),
        };
        Self {
            api_base,
            ws_base,
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }

    /// Push endpoint for one conversation. Both ids are percent-encoded as
    /// single path segments.
    pub fn ws_url(&self, conversation_id: &str, token: &str) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.ws_base)
            .with_context(|| format!("Invalid WebSocket base URL: {}", self.ws_base))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("WebSocket base URL cannot take a path: {}", self.ws_base))?
            .pop_if_empty()
            .extend(["ws", conversation_id, token]);
        Ok(url.into())
    }
}

fn derive_ws_base(http_base: &str) -> String {
    if let Some(rest) = http_base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = http_base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        http_base.to_string()
    }
}

/// Transport channel configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub reconnect: ReconnectPolicy,
    pub event_capacity: usize,
}

impl ChannelConfig {
    pub fn from_file(fc: &ChannelFileConfig) -> Self {
        let delay = Duration::from_millis(fc.reconnect_delay_ms);
        let reconnect = match fc.reconnect {
            ReconnectMode::Fixed => ReconnectPolicy::Fixed { delay },
            ReconnectMode::Exponential => ReconnectPolicy::Exponential {
                initial: delay,
                max: Duration::from_millis(fc.max_reconnect_delay_ms).max(delay),
            },
        };
        Self {
            reconnect,
            event_capacity: fc.event_capacity.max(1),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_file(&ChannelFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub channel: ChannelConfig,
    pub notify_capacity: usize,
}

impl EngineConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            channel: ChannelConfig::from_file(&fc.channel),
            notify_capacity: fc.engine.notify_capacity.max(1),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ForkchatConfig {
    pub data_dir: PathBuf,
}

impl ForkchatConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".forkchat"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        Ok(Self { data_dir })
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join("token")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
