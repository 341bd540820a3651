use iam_service::{
    build_router,
    config::IamConfig,
    db,
    services::{metrics, Database, JwtService, PluginRegistry, RedisService, SharedStore, VerificationService},
    AppState,
};
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = IamConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;
    metrics::init_metrics()?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting IAM service"
    );

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    let database = Database::new(pool);

    let store: Arc<dyn SharedStore> = Arc::new(RedisService::new(&config.redis).await?);
    tracing::info!("Redis service initialized");

    let jwt = JwtService::new(&config.jwt)?;

    // Verification plugins are provided by the embedding deployment
    let plugins = PluginRegistry::new();
    tracing::info!(plugins = ?plugins.names(), "Plugin registry ready");

    let addr = config.common.socket_addr();
    let sweep_every = Duration::from_secs(config.verification.sweep_interval_seconds.max(1));
    let state = AppState::assemble(
        config,
        Arc::new(database.clone()),
        store,
        jwt,
        plugins,
        Some(database),
    );

    let sweeper = tokio::spawn(sweep_expired_sessions(state.verification.clone(), sweep_every));

    let app = build_router(state);

    tracing::info!(address = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    tracing::info!("Service shutdown complete");
    Ok(())
}

/// Periodically delete verification sessions past their expiry.
async fn sweep_expired_sessions(verification: VerificationService, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = verification.purge_expired().await {
            tracing::warn!(error = %e, "Expired session sweep failed");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
