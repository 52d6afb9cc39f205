mod cache;
mod config;
mod engine;
mod framing;
mod http;
mod loader;
mod metrics;
mod params;
mod signature;
mod sniff;
mod state;
mod throttle;

use crate::cache::{Cache, FsCache, NoopCache};
use crate::config::Config;
use crate::engine::{EngineConfig, MediaEngine};
use crate::loader::HttpLoader;
use crate::metrics::Metrics;
use crate::state::AppState;
use crate::throttle::Throttle;
use anyhow::Context;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

const THROTTLE_BACKLOG: usize = 200;
const THROTTLE_BACKLOG_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const CACHE_METRICS_REFRESH: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter())),
        )
        .init();
    info!(
        env = %config.env,
        port = config.port,
        metrics_port = config.metrics_port,
        concurrency = config.concurrency,
        enable_unsafe = config.enable_unsafe,
        enable_loader_cache = config.enable_loader_cache,
        enable_result_cache = config.enable_result_cache,
        "startup config summary"
    );

    let metrics = Arc::new(Metrics::new());
    let mut fs_tiers: Vec<Arc<FsCache>> = Vec::new();
    let loader_cache: Arc<dyn Cache> = if config.enable_loader_cache {
        let tier = Arc::new(FsCache::new(config.cache_dir.join("original")));
        fs_tiers.push(tier.clone());
        tier
    } else {
        Arc::new(NoopCache)
    };
    let (metadata_cache, result_cache): (Arc<dyn Cache>, Arc<dyn Cache>) =
        if config.enable_result_cache {
            let metadata = Arc::new(FsCache::new(config.cache_dir.join("metadata")));
            let result = Arc::new(FsCache::new(config.cache_dir.join("result")));
            fs_tiers.push(metadata.clone());
            fs_tiers.push(result.clone());
            (metadata, result)
        } else {
            (Arc::new(NoopCache), Arc::new(NoopCache))
        };

    let engine = MediaEngine::new(EngineConfig::default());
    let loader = HttpLoader::new(config.base_url.clone(), metrics.clone())?;
    let throttle = Throttle::new(config.concurrency, THROTTLE_BACKLOG, THROTTLE_BACKLOG_TIMEOUT);
    let state = Arc::new(AppState::new(
        config,
        engine,
        loader,
        loader_cache,
        metadata_cache,
        result_cache,
        throttle,
        metrics.clone(),
    ));

    {
        let metrics = metrics.clone();
        let tiers = fs_tiers.clone();
        tokio::spawn(async move {
            loop {
                crate::metrics::refresh_cache_metrics(&metrics, &tiers).await;
                tokio::time::sleep(CACHE_METRICS_REFRESH).await;
            }
        });
    }

    let metrics_addr = format!("{}:{}", state.config.host, state.config.metrics_port);
    let metrics_listener = TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("bind metrics listener on {metrics_addr}"))?;
    {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            info!(address = %metrics_addr, "metrics listening");
            if let Err(err) = axum::serve(metrics_listener, http::metrics_router(metrics)).await {
                warn!(error = ?err, "metrics server failed");
            }
        });
    }

    let app = http::router(state.clone());
    let make_service = http::ConnectionCountedRouter::new(app, metrics.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind listener on {addr}"))?;
    info!(address = %addr, "media proxy listening");

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, make_service).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = drained_tx.send(());
    });
    let mut server_task = tokio::spawn(server.into_future());

    // Resolves on SIGINT/SIGTERM, or immediately if the server dies first.
    let _ = drained_rx.await;
    info!("shutting down");
    match tokio::time::timeout(SHUTDOWN_DRAIN, &mut server_task).await {
        Ok(result) => result.context("join server task")?.context("server error")?,
        Err(_) => {
            warn!("drain deadline exceeded; aborting open connections");
            server_task.abort();
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
