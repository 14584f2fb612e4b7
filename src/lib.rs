//! wagate - multi-tenant messaging session gateway
//!
//! Each tenant links one device to the messaging network by scanning a
//! code; the gateway keeps that link alive, persists its credentials and
//! exposes a small JSON API to send text messages through it.

pub mod api;
pub mod config;
pub mod credentials;
pub mod protocol;
pub mod render;
pub mod session;

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;

use config::{Cli, GatewayConfig};
use credentials::FileCredentialStore;
use protocol::BridgeConnector;
use render::QrDataUrlRenderer;
use session::{spawn_event_logger, SessionRegistry};

/// Initialize logging. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Build the registry from configuration
pub fn build_registry(config: &GatewayConfig) -> SessionRegistry {
    let store = Arc::new(FileCredentialStore::new(&config.storage.sessions_dir));
    let connector = Arc::new(BridgeConnector::new(config.bridge.clone()));

    SessionRegistry::with_settings(
        connector,
        store,
        Arc::new(QrDataUrlRenderer::default()),
        config.reconnect.clone(),
        config.bridge.client_name.clone(),
    )
}

/// Run the gateway until interrupted
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    init_logging();

    let config = GatewayConfig::load(&cli).context("Failed to load configuration")?;
    let registry = build_registry(&config);
    let _event_logger = spawn_event_logger(registry.subscribe());

    if config.restore_on_start {
        if let Err(e) = registry.restore_persisted().await {
            warn!("Failed to restore persisted sessions: {}", e);
        }
    }

    let app = api::router(api::AppState::new(
        registry.clone(),
        config.server.auth_wait(),
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.shutdown_all().await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
