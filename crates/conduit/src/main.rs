//! Conduit Server
//!
//! Plugin host with a WebSocket API per plugin id.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use conduit_plugin::Dispatcher;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use conduit::config::{HostConfig, LogFormat};
use conduit::loader::{PluginCatalog, PluginLoader};
use conduit::server::{AppState, create_router};
use conduit::store::PluginStore;
use conduit::PluginRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config = HostConfig::parse();

    init_tracing(config.log_format);

    info!("Starting Conduit server v{}", env!("CARGO_PKG_VERSION"));

    // Builtin modules available to `runtime: builtin` loads
    let catalog = PluginCatalog::new().with(conduit_samples::NAME, conduit_samples::module);
    info!("Builtin modules: {}", catalog.names().join(", "));

    let pool = config.worker_pool();
    info!("Worker pool size: {}", pool.size());

    let registry = Arc::new(
        PluginRegistry::new(PluginStore::new(&config.plugins_dir, &config.entry_file))
            .with_loader(PluginLoader::new(catalog, config.process_settings()))
            .with_installer(config.installer())
            .with_dispatcher(Dispatcher::new(pool))
            .with_stream_settings(config.stream_settings())
            .with_default_runtime(config.default_runtime),
    );
    info!(
        "Plugin store: {} (default runtime: {})",
        config.plugins_dir.display(),
        config.default_runtime
    );

    // Create application state and router
    let state = AppState::new(Arc::clone(&registry), config.gateway_options());
    let app = create_router(state, config.cors_layer());

    // Start server
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws/{{pluginId}}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Unload every plugin so child processes get their shutdown frame
    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conduit=info,plugin=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
