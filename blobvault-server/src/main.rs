//! BlobVault Server - HTTP front-end for the blob storage backends

mod api;

use blobvault_core::{open_storages, BackendRegistry};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "blobvault", version, about = "BlobVault blob storage server")]
pub struct ServerConfig {
    /// Storage root holding `storage.conf` and one directory per backend
    #[arg(long, default_value = "data")]
    pub storage: PathBuf,

    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8086")]
    pub listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::parse();

    info!("Starting BlobVault server...");
    info!("Storage root: {:?}", config.storage);

    let root = config.storage.clone();
    let backends = tokio::task::spawn_blocking(move || {
        open_storages(&root, &BackendRegistry::with_defaults())
    })
    .await??;

    if backends.is_empty() {
        anyhow::bail!("no backends configured in {:?}", config.storage);
    }
    for backend in &backends {
        info!(
            "Backend {} ({}): {} bytes free",
            backend.name,
            backend.node,
            backend.storage.free_capacity()
        );
    }

    let app = api::create_router(Arc::new(api::AppState::new(backends)));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("BlobVault server listening on {}", config.listen);

    axum::serve(listener, app).await?;

    Ok(())
}
