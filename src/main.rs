use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slotguard::api::{self, AppState};
use slotguard::config::{Config, HoldStoreKind};
use slotguard::engine::ReservationEngine;
use slotguard::holds::{HoldStore, MemoryHoldStore};
use slotguard::ledger::Ledger;
use slotguard::observability::{self, PrometheusMetrics};
use slotguard::reaper;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn connect_hold_store(config: &Config) -> anyhow::Result<Arc<dyn HoldStore>> {
    match config.hold_store {
        HoldStoreKind::Memory => Ok(Arc::new(MemoryHoldStore::new())),
        #[cfg(feature = "redis")]
        HoldStoreKind::Redis => {
            let url = config.redis_url.as_deref().context("--redis-url is required")?;
            let store = slotguard::holds::RedisHoldStore::connect(url)
                .await
                .context("connecting to redis hold store")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        HoldStoreKind::Redis => Err(slotguard::config::ConfigError::RedisNotCompiled.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    config.validate()?;

    let prometheus = observability::init().context("installing metrics recorder")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let ledger = Arc::new(Ledger::open(config.ledger_path()).context("opening reservation ledger")?);
    let holds = connect_hold_store(&config).await?;

    let engine = Arc::new(ReservationEngine::new(
        holds,
        ledger,
        Arc::new(PrometheusMetrics),
        config.engine_config(),
    ));

    let background = [
        tokio::spawn(reaper::run_reconciler(engine.clone(), config.reconcile_interval())),
        tokio::spawn(reaper::run_hold_sweeper(engine.clone(), config.sweep_interval())),
        tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold)),
    ];

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!("slotguard listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hold_store: {:?}", config.hold_store);
    info!("  hold_ttl: {}s", config.hold_ttl_secs);
    info!("  ledger rows: {}", engine.ledger().len());

    let app = api::router(AppState {
        engine: engine.clone(),
        prometheus: Some(prometheus),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    for task in background {
        task.abort();
    }
    // Final pass so the log on disk is as small as the live state allows.
    if let Err(e) = engine.ledger().compact().await {
        warn!("final ledger compaction failed: {e}");
    }

    info!("slotguard stopped");
    Ok(())
}
