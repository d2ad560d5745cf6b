//! # Live Interview Backend
//!
//! Real-time voice interview service. Each browser client connects over a
//! WebSocket; the bridge actor splices that connection onto a realtime
//! speech provider, watches transcription quality, feeds an external
//! orchestrator for steering guidance, and persists the session so a
//! dropped connection can be resumed.
//!
//! ## Architecture:
//! - `bridge`: per-connection WebSocket actor, the core of the service
//! - `provider`: realtime speech provider abstraction (OpenAI, Azure)
//! - `quality`: transcription quality detectors and per-session aggregation
//! - `session`: session registry, watchdog, snapshots and resume tokens
//! - `orchestrator`: async analysis client producing guidance
//! - `handlers`/`health`: REST surface for operators and dashboards

mod bridge;
mod config;
mod error;
mod handlers;
mod health;
mod metrics;
mod middleware;
mod orchestrator;
mod protocol;
mod provider;
mod quality;
mod session;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use orchestrator::OrchestratorClient;
use session::persistence::SnapshotStore;
use session::registry::SessionRegistry;
use session::watchdog::spawn_watchdog;
use state::AppState;

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-interview-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let provider = provider::create_provider(&config.provider)
        .context("Failed to construct realtime provider")?;
    info!(provider = provider.name(), "Realtime provider configured");

    let store = Arc::new(SnapshotStore::new(&config.persistence.dir));
    store.ensure_dir().await?;

    let registry = Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions));

    let orchestrator = OrchestratorClient::from_config(&config.orchestrator).map(Arc::new);
    if orchestrator.is_none() {
        info!("No orchestrator URL configured; interviews run without steering guidance");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(
        config,
        registry.clone(),
        store.clone(),
        provider,
        orchestrator,
    );

    spawn_watchdog(registry, store, app_state.config.clone());
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session))
                    .route(
                        "/sessions/{session_id}/resume-token",
                        web::post().to(handlers::issue_resume_token),
                    ),
            )
            .route("/ws/interview", web::get().to(bridge::interview_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_interview_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
