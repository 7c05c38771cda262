//! Subscription Redemption Backend
//!
//! Off-chain service that redeems recurring subscription payments through
//! pre-signed delegations. Runs two concurrent subsystems:
//!
//! - **Scheduler** (optional): periodic transactional batch over due subscriptions.
//! - **HTTP server**: liveness (`/health`), readiness (`/status`), `/metrics`
//!   and the redemption endpoints under `/subscriptions`.

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod api;
mod config;
mod executor;
mod metrics;
mod models;
mod period;
mod processor;
mod redeemer;
mod redemption_client;
mod runner;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;

use api::ApiState;
use config::AppConfig;
use metrics::Metrics;
use processor::SubscriptionProcessor;
use redeemer::RetryingRedeemer;
use redemption_client::RedemptionClient;
use runner::DueBatchRunner;
use store::MemoryStore;

/// Shared application state accessible from the health and status handlers.
struct AppState {
    metrics: Arc<Metrics>,
}

/// Liveness check. Returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness / status check. Reports whether a batch run is in flight.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "batch_in_progress": data.metrics.runs_in_progress() > 0
    }))
}

async fn metrics_report(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.metrics.to_json())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,reqwest=warn,hyper=warn,actix_server=warn")
            }),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    info!(
        redemption_service = %config.redemption_service_url,
        max_attempts = config.retry.max_attempts,
        final_failure_status = ?config.final_failure_status,
        "Starting redemption backend"
    );

    let store = match &config.seed_path {
        Some(path) => {
            let store = MemoryStore::from_seed_file(path)?;
            info!(seed = %path, "Loaded seed data");
            store
        }
        None => {
            warn!("SEED_PATH not set, starting with an empty store");
            MemoryStore::default()
        }
    };

    let client = RedemptionClient::new(&config.redemption_service_url, config.redemption_timeout)?;
    let metrics = Arc::new(Metrics::new());
    let processor = SubscriptionProcessor::new(
        RetryingRedeemer::new(Arc::new(client), config.retry),
        config.final_failure_status,
        metrics.clone(),
    );
    let runner = Arc::new(DueBatchRunner::new(
        store,
        processor,
        metrics.clone(),
        config.batch_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background: periodic transactional batch.
    let scheduler_task = config.process_interval.map(|period| {
        tokio::spawn(scheduler::run_scheduler(
            runner.clone(),
            metrics.clone(),
            period,
            shutdown_rx,
        ))
    });

    let state = web::Data::new(AppState {
        metrics: metrics.clone(),
    });
    let api_state = web::Data::new(ApiState {
        runner: runner.clone(),
    });

    let addr = config.bind_addr();
    info!(host = %addr.0, port = addr.1, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(api_state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics_report))
            .configure(api::configure::<MemoryStore>)
    })
    .bind(addr)?
    .run()
    .await?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = scheduler_task {
        handle.await.ok();
    }
    info!("Shut down");
    Ok(())
}
