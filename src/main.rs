//! Serves the inventory store over HTTP.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use dinodb::config::Settings;
use dinodb::session::Database;
use dinodb::{inventory, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    // RUST_LOG overrides the configured filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database = Database::with_timeout(
        inventory::schema()?,
        settings.database.mode(),
        settings.database.busy_timeout(),
    )?;
    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    info!(bind = %settings.server.bind, "listening");
    axum::serve(listener, server::router(Arc::new(database))).await?;
    Ok(())
}
