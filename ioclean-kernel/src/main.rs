/**
 * IOCLEAN KERNEL - Point d'entrée du bus de commandes
 *
 * RÔLE : Charge la config, ouvre les liens série, démarre le dispatcher et
 * l'API REST, puis attend Ctrl-C pour un arrêt ordonné.
 */

use anyhow::Context;
use ioclean_kernel::config::load_config;
use ioclean_kernel::http::{self, AppState};
use ioclean_kernel::link::SerialConnector;
use ioclean_kernel::sink::{JsonlSink, LogSink, MemorySink};
use ioclean_kernel::supervisor::Supervisor;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ioclean_kernel=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = load_config().await;
    if cfg.devices.is_empty() {
        warn!("no device configured, only the HTTP API will be available");
    }

    let sink: Arc<dyn LogSink> = match &cfg.telemetry_log {
        Some(path) => match JsonlSink::new(path) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(path = %path, error = %e, "telemetry file unavailable, keeping readings in memory");
                Arc::new(MemorySink::new())
            }
        },
        None => Arc::new(MemorySink::new()),
    };

    let bind = cfg.http.bind.clone();
    let supervisor = Supervisor::new(cfg, Arc::new(SerialConnector), sink);
    supervisor.start();

    let api_key = std::env::var("IOCLEAN_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("IOCLEAN_API_KEY not set, HTTP API is unauthenticated");
    }
    let app = http::build_router(AppState { supervisor: supervisor.clone(), api_key });

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("HTTP server failed")?;

    let report = supervisor.shutdown().await;
    if !report.is_empty() {
        warn!(in_flight = report.in_flight.len(), queued = report.queued.len(), "commands abandoned at shutdown");
    }
    Ok(())
}
