mod api;
mod calendar;
mod clock;
mod config;
mod db;
mod error;
mod scheduler;
mod sync;
mod types;
mod upstream;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::db::Store;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::sync::backfill::Backfill;
use crate::sync::engine::ReconcileEngine;
use crate::upstream::EleringClient;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", cfg.db_path)).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let store = Store::new(pool);
    info!("Database ready at {} ({} prices stored)", cfg.db_path, store.price_count().await?);

    // --- Engine ---
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());
    let client = EleringClient::new(&cfg, Arc::clone(&latency))?;
    let engine = Arc::new(ReconcileEngine::new(
        &cfg,
        store.clone(),
        Arc::new(client),
        Arc::new(SystemClock::new()),
        Arc::clone(&health),
    ));
    let entities: Vec<String> = engine.entities().iter().map(|e| e.to_string()).collect();
    info!(
        "Tracking {} entities ({}), day boundaries in {}, window {}-{} {}",
        entities.len(),
        entities.join(","),
        cfg.reference_tz,
        cfg.window_open.format("%H:%M"),
        cfg.window_close.format("%H:%M"),
        cfg.window_tz,
    );

    let scheduler = Arc::new(Scheduler::new(&cfg, Arc::clone(&engine), Arc::clone(&health)));

    let backfill = Arc::new(Backfill::new(&cfg, Arc::clone(&engine)));

    // --- HTTP API server (up before startup sync so status is visible during backfill) ---
    let api_state = ApiState {
        store: store.clone(),
        scheduler: Arc::clone(&scheduler),
        health: Arc::clone(&health),
        latency: Arc::clone(&latency),
        backfill: Arc::clone(&backfill),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");
    let shutdown_scheduler = Arc::clone(&scheduler);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
                shutdown_scheduler.shutdown();
            })
            .await;
        if let Err(e) = result {
            error!("HTTP server failed: {e}");
        }
    });

    // --- Startup sync, then background tasks ---
    scheduler.startup(&backfill).await;

    let tasks = vec![
        tokio::spawn(Arc::clone(&scheduler).run_driver()),
        tokio::spawn(Arc::clone(&scheduler).run_watchdog()),
        tokio::spawn(Arc::clone(&scheduler).run_fallback()),
        tokio::spawn(Arc::clone(&scheduler).run_health()),
        tokio::spawn(Arc::clone(&scheduler).run_weekly()),
        tokio::spawn(Arc::clone(&scheduler).run_next_day()),
    ];

    if let Err(e) = server.await {
        error!("HTTP server task panicked: {e}");
    }
    scheduler.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task panicked: {e}");
        }
    }
    info!("Stopped");
    Ok(())
}
