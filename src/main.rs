//! Signalboat — candle ingestion, feature engineering, policy training,
//! and multi-timeframe inference behind an HTTP control plane.

use anyhow::{Context, Result};
use signalboat::api::{self, AppState};
use signalboat::config::Config;
use signalboat::exchange::HttpExchangeClient;
use signalboat::queue::BackfillExecutor;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalboat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env();
    tracing::info!(port = config.port, cache_dir = ?config.cache_dir, "starting signalboat");

    let exchange = Arc::new(
        HttpExchangeClient::new(
            config.exchange_base_url.clone(),
            config.exchange_connect_timeout_ms,
            config.exchange_read_timeout_ms,
        )
        .context("failed to build exchange client")?,
    );

    let config = Arc::new(config);
    let executor = Arc::new(BackfillExecutor {
        config: config.clone(),
        exchange: exchange.clone(),
    });

    let state = AppState::new((*config).clone(), exchange, executor);
    let app = api::router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("failed to bind listener")?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .await
        .context("server exited with an error")?;

    Ok(())
}
