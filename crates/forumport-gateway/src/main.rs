//! Forumport redirect gateway binary.

use std::sync::Arc;

use clap::Parser;
use forumport_core::idmap::ReadOnlyIdMap;
use forumport_gateway::{create_router, AppState, Args, GatewayConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forumport_gateway=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::from(&args);

    info!(
        listen = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        import_table = %config.import_table,
        redirects = config.redirects_enabled,
        "Starting forumport gateway"
    );

    let db = sled::Config::new().path(&config.data_dir).open()?;
    let lookup = ReadOnlyIdMap::open(&db, &config.import_table)?;
    let state = AppState::new(Arc::new(lookup), config.clone())?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Gateway listening on {}", config.listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
