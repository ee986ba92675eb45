mod config;
mod routes;

use crate::config::{Settings, StoreSettings};
use gatekeep::{InMemoryStore, LimiterStore};
use gatekeep_redis::RedisStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the subscriber so RUST_LOG is picked up
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    tracing::info!(
        listen = %settings.listen_addr,
        mode = %settings.limit_type,
        requests_limit = settings.requests_limit,
        block = ?settings.client_block_time,
        fail_open = settings.fail_open,
        "configuration loaded"
    );

    let store: Arc<dyn LimiterStore> = match &settings.store {
        StoreSettings::Redis { url } => {
            let store = RedisStore::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to redis: {}", e))?;
            tracing::info!("redis store connected");
            Arc::new(store)
        }
        StoreSettings::Memory => {
            tracing::warn!("using in-memory store; limits are not shared between instances");
            Arc::new(InMemoryStore::new())
        }
    };

    for policy in &settings.seed_api_keys {
        store.persist_policy(policy).await?;
        tracing::info!(api_key = %policy.id, max = policy.max_requests, "api key seeded");
    }

    let app = routes::router(store, &settings)?.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
