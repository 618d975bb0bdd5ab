use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use peer_registry::RegistrySettings;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [frontend]
//                    port = 5173
//
//   env var:         PEERLINK_FRONTEND__PORT=5173   (double underscore = nesting)
//
//   CLI flag:        --frontend-port 5173
//
//   (single underscore stays within field names: PEERLINK_REGISTRY__RETRY_INTERVAL_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub frontend: FrontendFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub registry: RegistryFileConfig,
}

/// Control API listener (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    /// 0 picks a free port.
    #[serde(default)]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: 0,
        }
    }
}

/// Where inbound messages are delivered (lives under `[frontend]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrontendFileConfig {
    #[serde(default = "default_frontend_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Full notification URL; overrides host and port when set.
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FrontendFileConfig {
    fn default() -> Self {
        Self {
            host: default_frontend_host(),
            port: 0,
            notify_url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

/// Transport tunables (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    /// Single relay to use instead of iroh's public relays.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Run an in-process relay and use only that one.
    #[serde(default)]
    pub embedded_relay: bool,
    #[serde(default = "default_relay_bind_port")]
    pub relay_bind_port: u16,
    /// Disable relays entirely (direct connections only).
    #[serde(default)]
    pub disable_relays: bool,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            embedded_relay: false,
            relay_bind_port: default_relay_bind_port(),
            disable_relays: false,
        }
    }
}

/// Retry tuning (lives under `[registry]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryFileConfig {
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_send_retry_limit")]
    pub send_retry_limit: u32,
}

impl Default for RegistryFileConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            send_retry_limit: default_send_retry_limit(),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_frontend_host() -> String {
    "localhost".to_string()
}
fn default_notify_timeout_secs() -> u64 {
    10
}
fn default_relay_bind_port() -> u16 {
    4434
}
fn default_retry_interval_ms() -> u64 {
    3000
}
fn default_send_retry_limit() -> u32 {
    5
}

/// Build a figment that layers: defaults → config.toml → PEERLINK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PEERLINK_SERVER__PORT=8080`  →  `server.port = 8080`
///   `PEERLINK_TRANSPORT__EMBEDDED_RELAY=true`  →  `transport.embedded_relay = true`
///
/// CLI flags are applied on top by the caller.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PEERLINK_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

impl ServerFileConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// Frontend notification target (runtime view).
#[derive(Clone, Debug)]
pub struct FrontendConfig {
    pub notify_url: String,
    pub timeout: Duration,
}

impl FrontendConfig {
    pub fn from_file(fc: &FrontendFileConfig) -> Self {
        let notify_url = fc
            .notify_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}/receive_message", fc.host, fc.port));
        Self {
            notify_url,
            timeout: Duration::from_secs(fc.timeout_secs),
        }
    }
}

/// Relay selection (runtime view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayChoice {
    /// iroh's public relays.
    Public,
    /// A single external relay.
    Url(String),
    /// In-process relay bound on this address.
    Embedded(SocketAddr),
    Disabled,
}

impl RelayChoice {
    pub fn from_file(fc: &TransportFileConfig) -> Self {
        if fc.disable_relays {
            RelayChoice::Disabled
        } else if fc.embedded_relay {
            RelayChoice::Embedded(([127, 0, 0, 1], fc.relay_bind_port).into())
        } else if let Some(url) = fc.relay_url.as_ref().filter(|u| !u.trim().is_empty()) {
            RelayChoice::Url(url.clone())
        } else {
            RelayChoice::Public
        }
    }
}

pub fn registry_settings(fc: &RegistryFileConfig) -> RegistrySettings {
    RegistrySettings {
        retry_interval: Duration::from_millis(fc.retry_interval_ms.max(1)),
        send_retry_limit: fc.send_retry_limit.max(1),
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct PeerlinkConfig {
    pub data_dir: PathBuf,
}

impl PeerlinkConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".peerlink"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
