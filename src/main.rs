//! # Speech Relay - Main Application Entry Point
//!
//! WebSocket relay between mobile clients streaming raw PCM and a cloud speech
//! recognition engine. Each connection gets its own recognition session; partial
//! and final transcripts are pushed back to the client as JSON.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared state, provider instance and relay metrics
//! - **websocket**: connection actor and upgrade endpoint
//! - **protocol**: command/audio classification and outbound event encoding
//! - **session**: per-connection state machine
//! - **relay**: ordered outbound queue from session to connection
//! - **provider**: recognition engine interface and the Azure Speech adapter
//! - **health**, **middleware**, **error**: operational HTTP surface

mod config;
mod error;
mod health;
mod middleware;
mod protocol;
mod provider;
mod relay;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::provider::{AzureSpeechProvider, RecognitionProvider};
use crate::state::AppState;
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared state** holding the recognition provider
/// 4. **Configures the HTTP server** with middleware, the WebSocket endpoint and
///    operational routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        max_sessions = config.relay.max_concurrent_sessions,
        default_language = %config.relay.default_language,
        "Configuration loaded"
    );

    let provider: Arc<dyn RecognitionProvider> = Arc::new(AzureSpeechProvider::from_config(&config));
    info!(provider = provider.name(), "Recognition provider ready");

    let app_state = AppState::new(config.clone(), provider);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Mobile and browser clients connect from anywhere
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(actix_web::middleware::from_fn(middleware::record_metrics))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(health::relay_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::relay_websocket))
            .route("/", web::get().to(websocket::relay_websocket))
    })
    .shutdown_timeout(config.server.shutdown_timeout_secs)
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server (usually an error) or a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
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

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "speech_relay=trace")
/// - If not set, defaults to "speech_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
///
/// If a handler cannot be installed that signal is simply not awaited; the
/// process can still be stopped through the other one.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", err);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
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
}
