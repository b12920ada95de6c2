//! Copilot Proxy
//!
//! Single-binary service that:
//! 1. Loads a directory-backed pool of GitHub Copilot tokens
//! 2. Listens for incoming API requests
//! 3. Dispatches each one with a pooled token, rotating on quota and auth
//!    failures and retrying transient ones
//! 4. Serves an optional admin API on a second listener

mod admin;
mod config;
mod metrics;
mod observer;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use copilot_auth::{CopilotExchange, PassthroughExchange, TokenExchange, TokenStore};
use copilot_client::ApiClient;
use copilot_pool::{TokenManager, spawn_reclaim_task};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, ExchangeKind};
use crate::observer::TracingObserver;
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    manager: Arc<TokenManager>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Requests beyond `max_connections` queue in the concurrency limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting copilot-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        tokens_dir = %config.tokens.directory.display(),
        exchange = ?config.tokens.exchange,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let store = TokenStore::open(&config.tokens.directory)
        .await
        .with_context(|| {
            format!(
                "failed to open token store at {}",
                config.tokens.directory.display()
            )
        })?;

    let exchange: Arc<dyn TokenExchange> = match config.tokens.exchange {
        ExchangeKind::Passthrough => Arc::new(PassthroughExchange),
        ExchangeKind::Copilot => Arc::new(CopilotExchange::new(http.clone())),
    };

    let tracker = config.quota_tracker();
    info!(categories = ?tracker.monitored(), "monitoring quota categories");

    let manager = Arc::new(TokenManager::new(
        Arc::new(store),
        tracker,
        exchange,
        config.manager_settings(),
    ));

    match manager.available_count().await {
        Ok(0) => warn!("no active tokens, requests will fail until one is added"),
        Ok(n) => info!(active = n, "token pool loaded"),
        Err(e) => warn!(error = %e, "could not count active tokens"),
    }

    let reclaim_handle = spawn_reclaim_task(manager.clone(), config.reclaim_interval());

    let client = ApiClient::new(http, manager.clone(), config.client_settings())
        .with_observer(Arc::new(TracingObserver));

    let app_state = AppState {
        proxy: ProxyState {
            handler: Arc::new(client),
        },
        manager: manager.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;

    // Both listeners drain on the same signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = match config.proxy.admin_addr {
        Some(addr) => {
            let admin_listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind admin API to {addr}"))?;
            info!(addr = %addr, "admin API listening");
            let admin_app = build_admin_router(AdminState::new(manager.clone()));
            let rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(wait_for_shutdown(rx))
                    .await
            }))
        }
        None => None,
    };

    info!(addr = %config.proxy.listen_addr, "accepting requests");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    reclaim_handle.abort();

    // The drain timer starts at signal receipt, not at server start
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = admin_handle {
        match tokio::time::timeout(Duration::from_secs(1), handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "admin server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "admin server task panicked"),
            Err(_) => warn!("admin server did not stop in time"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves once the shutdown flag flips (or the sender is gone).
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Pool health. 200 while at least one token is active, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.manager.health().await;
    let status_code = if health["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards everything else upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that cannot be installed is logged and treated as never firing.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
