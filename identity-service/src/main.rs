use identity_service::{
    build_router,
    config::{BrokerMode, IdentityConfig},
    db,
    services::{
        Broker, Database, HttpBroker, JwtService, MemoryBroker, MemoryStorage, ProjectionService,
        Storage, TokenSigner,
    },
    workers::spawn_event_workers,
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    identity_service::services::metrics::init_metrics()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Metrics init failed: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let storage: Arc<dyn Storage> = match &config.database.url {
        Some(url) => {
            let pool = db::create_pool(url, &config.database)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
            tracing::info!("Database initialized successfully");
            Arc::new(Database::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    };

    let broker: Arc<dyn Broker> = match config.broker.mode {
        BrokerMode::Memory => {
            tracing::warn!("Using in-process broker, events do not leave this instance");
            Arc::new(MemoryBroker::new())
        }
        BrokerMode::Http => {
            let url = config.broker.publish_url.as_deref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("BROKER_PUBLISH_URL is required"))
            })?;
            Arc::new(HttpBroker::new(url).map_err(|e| AppError::ConfigError(e.into()))?)
        }
    };

    let signer: Arc<dyn TokenSigner> =
        Arc::new(JwtService::new(&config.jwt).map_err(AppError::ConfigError)?);

    let shutdown = CancellationToken::new();
    let workers = spawn_event_workers(
        &config,
        storage.clone(),
        broker,
        ProjectionService::new(),
        shutdown.clone(),
    );

    let state = AppState::new(config.clone(), storage, signer);
    let app = build_router(state)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_shutdown.cancel();
    })
    .await?;

    // The server may also stop on its own; workers follow it either way.
    shutdown.cancel();

    let grace = Duration::from_secs(config.common.shutdown_grace_seconds);
    let joined = tokio::time::timeout(grace, futures::future::join_all(workers)).await;
    if joined.is_err() {
        tracing::warn!(grace_seconds = grace.as_secs(), "Workers did not stop within the grace period");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
