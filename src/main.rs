use std::sync::Arc;

use ride_dispatch::api;
use ride_dispatch::cache::{Cache, MemoryCache, RedisCache};
use ride_dispatch::config::{Config, LogFormat};
use ride_dispatch::engine;
use ride_dispatch::error::AppError;
use ride_dispatch::state::{AppState, StateOptions};
use ride_dispatch::store::{MemoryStore, RecordStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    let cache: Arc<dyn Cache> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            tracing::warn!("REDIS_URL not set; live positions are kept in process memory");
            Arc::new(MemoryCache::new())
        }
    };
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

    let (app_state, dispatch_rx) = AppState::new(
        store,
        cache,
        StateOptions {
            jwt_secret: config.jwt_secret.clone(),
            location_ttl: config.location_ttl,
            dispatch: config.dispatch.clone(),
            dispatch_queue_size: config.dispatch_queue_size,
            connection_buffer_size: config.connection_buffer_size,
        },
    );
    let shared_state = Arc::new(app_state);

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(engine::dispatcher::run_dispatcher(
        shared_state.clone(),
        dispatch_rx,
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
