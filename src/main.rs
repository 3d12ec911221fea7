//! Supermandi POS backend.
//!
//! Server-side backbone for handheld POS devices: device enrollment and
//! store binding, scan-to-product resolution, two-phase sales with
//! serialized stock deduction, purchases, and idempotent offline sync.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use supermandi_backend::{api::routes::build_router, AppState, Config, Db};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,supermandi_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(db = %config.database_path, "🗄️  Opening database");
    let db = Db::open(&config.database_path)?;

    if config.admin_token.is_none() {
        info!("🔒 ADMIN_TOKEN not set; admin surface disabled");
    }

    let port = config.port;
    let state = AppState::new(db, config);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 POS API listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
