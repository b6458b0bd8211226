//! Stagehand - control-surface connection managers for a streaming
//! dashboard

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagehand::{
    config::Args,
    credentials::CredentialStore,
    events::{SharedSink, TracingSink},
    service::ControlService,
    surface::{avatar::AvatarManager, compositor::CompositorManager, ControlSurface},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stagehand={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Stagehand - control-surface manager");
    info!("======================================");
    info!("Compositor: {}", args.compositor_config().url());
    info!("Avatar tool: {}", args.avatar_config().url());
    info!("Credential file: {}", args.avatar_token_file.display());
    info!(
        "Timeouts: connect {}ms, request {}ms",
        args.connect_timeout_ms, args.request_timeout_ms
    );
    info!("======================================");

    let sink: SharedSink = Arc::new(TracingSink);
    let store = CredentialStore::new(args.avatar_token_file.clone());
    let compositor = Arc::new(CompositorManager::new(args.compositor_config(), sink.clone()));
    let avatar = Arc::new(AvatarManager::new(args.avatar_config(), store, sink));
    let service = ControlService::new(compositor.clone(), avatar.clone());

    // Both targets may well be offline right now; that is steady state.
    // The dashboard retriggers these through the reconnect actions.
    avatar.start();
    let probe = compositor.clone();
    tokio::spawn(async move {
        probe.connect().await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for surface in service.surfaces() {
        info!(
            "{}: {}",
            surface.surface(),
            if surface.is_connected() { "connected" } else { "disconnected" }
        );
    }
    service.shutdown().await;

    Ok(())
}
