//! Axum HTTP server and its lifecycle.

use std::future::Future;
use std::sync::Arc;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::modules::{ActiveModules, FeatureModuleRegistry};
use crate::registry;
use crate::state::AppState;

/// Router with `/health`, the active modules' routes, and `/metrics` when enabled.
pub fn build_router(state: Arc<AppState>, active: &ActiveModules) -> Router {
    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(active.router());

    #[cfg(feature = "metrics")]
    let app = match crate::metrics::install_prometheus_recorder() {
        Ok(handle) => app
            .route("/metrics", get(move || std::future::ready(handle.render())))
            .layer(axum::middleware::from_fn(crate::metrics::track_requests)),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
            app
        }
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the server until Ctrl+C (or SIGTERM on Unix).
pub async fn start_server(
    state: Arc<AppState>,
    modules: &FeatureModuleRegistry,
) -> anyhow::Result<()> {
    start_server_with_shutdown(state, modules, shutdown_signal()).await
}

/// Run the server until `shutdown` resolves.
///
/// Modules are acquired before the listener accepts anything and released
/// after it stops; the registry announcement brackets the serving period.
pub async fn start_server_with_shutdown(
    state: Arc<AppState>,
    modules: &FeatureModuleRegistry,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let server = state.config.server();
    let enabled = state.config.enabled_modules();
    let active = modules.activate(&state, &enabled).await?;

    let addr = format!("{}:{}", server.host, server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            if let Err(release_err) = active.shutdown(&state).await {
                error!(error = %release_err, "Module release failed after bind error");
            }
            return Err(anyhow::anyhow!("Failed to bind {addr}: {e}"));
        }
    };
    let app = build_router(state.clone(), &active);
    info!(%addr, modules = ?active.keys(), "Audio helper listening");

    let announcement = registry::announce(state.config.registry_settings(), &server).await;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    if let Some(announcement) = announcement {
        if let Err(e) = announcement.withdraw().await {
            warn!(error = %e, "Service registry deregistration failed");
        }
    }

    let released = active.shutdown(&state).await;
    served?;
    released?;
    info!("Audio helper stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let modules = state.modules.read().await.clone();
    let asr: Vec<String> = state
        .asr_models
        .loaded()
        .into_iter()
        .map(|(variant, _)| variant)
        .collect();
    let tts: Vec<String> = state
        .tts_models
        .loaded()
        .into_iter()
        .map(|(variant, _)| variant)
        .collect();

    Json(json!({
        "status": "ok",
        "version": version,
        "modules": modules,
        "loaded_models": { "asr": asr, "tts": tts },
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
