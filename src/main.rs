use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use kestrel::api::{self, AppState};
use kestrel::blocklist::Blocklist;
use kestrel::config::Config;
use kestrel::geo::GeoCache;
use kestrel::proxy;
use kestrel::stats::{StatsAccumulator, FLUSH_PERIOD};
use kestrel::storage::RecordStore;

const FINAL_FLUSH_CAP: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    init_logging(&config.log_file)?;
    info!("Loaded configuration");
    info!(
        "   control port {} | tunnel port {} | store {}",
        config.http_port, config.https_port, config.store_addr
    );

    // Store reachability is the one hard startup requirement.
    let store = RecordStore::connect(&config.store_addr, config.store_password.as_deref())?;
    store.ping().await.context("store initialization failed")?;

    let blocklist = match &config.block_file {
        Some(path) => match Blocklist::load(std::path::Path::new(path)) {
            Ok(list) => list,
            Err(e) => {
                error!("failed to load blocklist from {path}: {e}");
                Blocklist::empty()
            }
        },
        None => Blocklist::empty(),
    };
    let blocklist = Arc::new(blocklist);

    let accumulator = Arc::new(StatsAccumulator::new(store.clone()));
    let flush_task = accumulator.spawn_flush_task(FLUSH_PERIOD);

    let geo = if config.geo_enabled {
        match GeoCache::new(store.clone(), config.geo_cache_size, config.geo_debug) {
            Ok(cache) => {
                let cache = Arc::new(cache);
                cache.preload().await;
                info!(
                    "🌍 Geolocation enabled ({} cache slots)",
                    config.geo_cache_size
                );
                Some(cache)
            }
            Err(e) => {
                warn!("geolocation initialization failed, enrichment disabled: {e}");
                None
            }
        }
    } else {
        info!("Geolocation tracking disabled");
        None
    };

    let state = Arc::new(AppState {
        store,
        accumulator: Arc::clone(&accumulator),
        blocklist,
        geo: geo.clone(),
        forward_client: proxy::forward_client()?,
    });

    let control_addr = format!("0.0.0.0:{}", config.http_port);
    let control_listener = tokio::net::TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("failed to bind control port {control_addr}"))?;
    info!("🚀 Proxy + API listening on http://{control_addr}");

    let tunnel_addr = format!("0.0.0.0:{}", config.https_port);
    let tunnel_listener = tokio::net::TcpListener::bind(&tunnel_addr)
        .await
        .with_context(|| format!("failed to bind tunnel port {tunnel_addr}"))?;
    info!("🔒 CONNECT tunnel listening on {tunnel_addr}");

    let router = api::control_router(Arc::clone(&state));

    // The control server drains in-flight handlers on the signal; the
    // tunnel acceptor stops with it, leaving established tunnels to finish
    // on their own tasks.
    tokio::select! {
        res = axum::serve(control_listener, router).with_graceful_shutdown(shutdown_signal()).into_future() => {
            if let Err(e) = res {
                error!("control server error: {e}");
            }
        }
        _ = proxy::serve_tunnel(tunnel_listener, Arc::clone(&state)) => {}
    }

    info!("Shutting down");
    flush_task.abort();
    if tokio::time::timeout(FINAL_FLUSH_CAP, accumulator.flush())
        .await
        .is_err()
    {
        warn!("final stats flush exceeded {FINAL_FLUSH_CAP:?}");
    }
    if let Some(geo) = &geo {
        geo.shutdown();
    }
    info!("Shutdown complete");

    Ok(())
}

fn init_logging(log_file: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("failed to open log file {log_file}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
