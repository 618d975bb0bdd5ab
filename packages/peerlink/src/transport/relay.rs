//! Relay selection for profile endpoints.
//!
//! Resolves the configured [`RelayChoice`] into the [`RelaySetting`] every
//! endpoint is built with, starting an in-process relay when one is asked for.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use iroh::RelayUrl;
use iroh_relay::server::{AccessConfig, RelayConfig, Server, ServerConfig};
use tracing::info;

use crate::config::RelayChoice;
use crate::transport::iroh_transport::RelaySetting;

/// The relay setting in effect, plus the embedded relay serving it, if any.
pub struct Relays {
    setting: RelaySetting,
    embedded: Option<Server>,
}

impl Relays {
    pub async fn from_choice(choice: &RelayChoice) -> Result<Self> {
        let (setting, embedded) = match choice {
            RelayChoice::Public => (RelaySetting::Default, None),
            RelayChoice::Url(url) => {
                let url: RelayUrl = url.parse().context("Invalid transport.relay_url")?;
                (RelaySetting::Custom(url), None)
            }
            RelayChoice::Embedded(addr) => {
                let (server, url) = spawn_embedded(*addr).await?;
                (RelaySetting::Custom(url), Some(server))
            }
            RelayChoice::Disabled => (RelaySetting::Disabled, None),
        };
        info!(relay = ?setting, embedded = embedded.is_some(), "relays configured");
        Ok(Self { setting, embedded })
    }

    pub fn setting(&self) -> &RelaySetting {
        &self.setting
    }

    /// Stop the embedded relay, if one was started.
    pub async fn shutdown(self) {
        if let Some(server) = self.embedded {
            info!("Shutting down embedded relay");
            let _ = server.shutdown().await;
        }
    }
}

/// Plain-HTTP relay open to every client; TLS belongs to a fronting proxy.
async fn spawn_embedded(bind_addr: SocketAddr) -> Result<(Server, RelayUrl)> {
    let config: ServerConfig<(), ()> = ServerConfig {
        relay: Some(RelayConfig {
            http_bind_addr: bind_addr,
            tls: None,
            limits: Default::default(),
            key_cache_capacity: None,
            access: AccessConfig::Everyone,
        }),
        quic: None,
        metrics_addr: None,
    };
    let server = Server::spawn(config)
        .await
        .with_context(|| format!("Failed to start embedded relay on {bind_addr}"))?;
    let http_addr = server.http_addr().context("Embedded relay has no HTTP address")?;
    let url: RelayUrl = format!("http://{http_addr}")
        .parse()
        .context("Invalid embedded relay URL")?;
    info!("Embedded relay listening at {}", url);
    Ok((server, url))
}
