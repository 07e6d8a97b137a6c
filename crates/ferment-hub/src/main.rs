mod alerts;
mod config;
mod db;
mod dedup;
mod error;
mod freshness;
mod ingest;
mod normalize;
mod poller;
mod registry;
mod scheduler;
mod state;
mod web;

use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::Db;
use scheduler::Scheduler;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:ferment.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed batches + devices) ─────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    if cfg.devices.is_empty() {
        tracing::warn!("no devices configured; every push will be rejected as not found");
    }

    // ── Shared state (observational, for the status endpoint) ────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Background jobs ─────────────────────────────────────────────
    let scheduler = Scheduler::start(db.clone(), &cfg.scheduler, shared.clone()).await?;
    let status = scheduler.status().await;
    info!(status = status.status, jobs = status.jobs.len(), "background jobs ready");

    // ── HTTP API (runs until Ctrl-C) ────────────────────────────────
    let served = web::serve(AppState { db, shared }, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await;

    scheduler.stop().await;
    served
}
