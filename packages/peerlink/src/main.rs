use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use peer_registry::{ConnectionOrchestrator, ProfileRegistry};

mod config;
mod handlers;
mod identity;
mod notifier;
#[cfg(test)]
mod test_helpers;
mod transport;

use crate::config::{FileConfig, FrontendConfig, PeerlinkConfig, RelayChoice};
use crate::notifier::HttpNotifier;
use crate::transport::iroh_transport::IrohTransport;
use crate::transport::relay::Relays;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "P2P messaging backend for local chat profiles")]
struct Cli {
    /// Port for the control API (0 = auto-select)
    #[arg(long)]
    backend_port: Option<u16>,

    /// Port of the frontend that receives inbound messages
    #[arg(long)]
    frontend_port: Option<u16>,

    /// Host to bind the control API to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Custom data directory (defaults to ~/.peerlink)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConnectionOrchestrator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "peerlink=debug,peer_registry=debug,tower_http=debug,info"
    } else {
        "peerlink=info,peer_registry=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let paths = PeerlinkConfig::new(cli.data_dir.clone())?;
    let mut file_config: FileConfig = config::load_config(&paths.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", paths.config_toml_path()))?;

    // CLI flags win over config.toml and env
    if let Some(port) = cli.backend_port {
        file_config.server.port = port;
    }
    if let Some(port) = cli.frontend_port {
        file_config.frontend.port = port;
    }
    if let Some(host) = cli.host.clone() {
        file_config.server.host = host;
    }

    if cli.print_config {
        print!(
            "{}",
            toml::to_string_pretty(&file_config).context("Failed to render configuration")?
        );
        return Ok(());
    }

    run_server(file_config).await
}

async fn run_server(file_config: FileConfig) -> Result<()> {
    info!("Starting peerlink");

    let frontend = FrontendConfig::from_file(&file_config.frontend);
    if file_config.frontend.notify_url.is_none() && file_config.frontend.port == 0 {
        warn!("No frontend port configured; inbound messages will fail to deliver");
    }
    let notifier = HttpNotifier::new(&frontend).context("Failed to build HTTP client")?;
    info!("Delivering inbound messages to {}", notifier.url());

    let relays = Relays::from_choice(&RelayChoice::from_file(&file_config.transport)).await?;

    let settings = config::registry_settings(&file_config.registry);
    let orchestrator = ConnectionOrchestrator::new(
        Arc::new(ProfileRegistry::new()),
        Arc::new(IrohTransport::new(relays.setting().clone())),
        Arc::new(notifier),
        settings,
    );
    let orchestrator_for_shutdown = orchestrator.clone();

    let app = handlers::api_routes()
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(AppState { orchestrator });

    let addr = file_config.server.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("peerlink listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET|POST /get_new_keys_and_peer_id - Issue a profile keypair");
    info!("  POST     /add_connection           - Register and dial a contact");
    info!("  POST     /remove_connection        - Drop a contact");
    info!("  POST     /send_message             - Write a message to a contact");
    info!("  GET      /connections              - List connections");
    info!("  GET      /health                   - Registry health");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Closing peer connections...");
    orchestrator_for_shutdown.shutdown().await;

    relays.shutdown().await;

    info!("Shutdown complete");
    server_result
}
