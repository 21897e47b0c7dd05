use anyhow::Context;
use obspine::api::{router, AppState};
use obspine::config::Config;
use obspine::engine::{TransitionWatcher, WatcherConfig};
use obspine::store::{ObservationStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obspine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!("database at {}", config.database_path);

    let store: Arc<dyn ObservationStore> = Arc::new(SqliteStore::open(&config.database_path)?);

    let watcher_config = WatcherConfig {
        poll_interval: Duration::from_secs(config.poll_interval_secs),
        min_surprise_pct: config.min_surprise_pct,
    };
    let watcher = TransitionWatcher::new(store.clone(), watcher_config)
        .with_high_water(chrono::Utc::now());
    let events = watcher.sender();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(watcher.run(shutdown_rx));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let app = router(AppState::new(store, events));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("obspine listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
