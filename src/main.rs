//! # Live Tutor Engine - Main Application Entry Point
//!
//! Runs the real-time voice core of a language-tutoring assistant: microphone
//! capture, a live session with the remote model, gap-free playback of its
//! spoken replies, interruption handling and audio visualizers.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: capture, playback and the session all run as tokio tasks
//! - **trait objects**: the engine talks to audio devices and the remote model
//!   through `Arc<dyn AudioBackend>` and `Arc<dyn SessionConnector>`
//! - **channels**: tasks communicate over mpsc/watch/broadcast instead of sharing locks
//!
//! ## Application Architecture:
//! - **config**: application configuration (config file + environment variables)
//! - **error**: voice core error kinds and HTTP error responses
//! - **state**: shared application state and engine metrics
//! - **audio**: framing, analysis, playback scheduling and visualizers
//! - **device**: the audio device contract the engine runs against
//! - **session**: the remote live session contract and its Gemini implementation
//! - **lifecycle**: the engine task owning the session state machine
//! - **bridge**: a browser page acting as microphone, speaker and canvas
//! - **websocket**: the socket that browser pages attach through
//! - **handlers** / **health**: the HTTP control surface

mod audio;
mod bridge;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod lifecycle;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use bridge::BridgeBackend;
use config::AppConfig;
use session::gemini::GeminiConnector;
use state::{AppState, MetricsRecorder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Spawns the voice engine** wired to the browser bridge and Gemini Live
/// 4. **Serves the HTTP API and the bridge WebSocket**
/// 5. **Stops the engine** before exiting, so devices and the session are released
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-tutor-engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if !config.has_credential() {
        warn!("No API key configured; sessions cannot start until one is provided");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let metrics = MetricsRecorder::new();
    let bridge = BridgeBackend::new(config.visualizer.width, config.visualizer.height, metrics.clone());
    let shared_config = Arc::new(RwLock::new(config));

    let (engine, engine_task) = lifecycle::spawn_engine(
        shared_config.clone(),
        Arc::new(bridge.clone()),
        Arc::new(GeminiConnector::new()),
        metrics.clone(),
    );
    let forwarder = bridge.spawn_status_forwarder(&engine);

    let app_state = AppState::new(shared_config, engine.clone(), metrics, bridge);

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
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session))
                    .route("/session/status", web::get().to(handlers::session_status)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
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

    // Release the microphone, playback and the remote session before exiting
    if let Err(e) = engine.stop().await {
        warn!("Engine did not stop cleanly: {}", e);
    }
    drop(engine);
    forwarder.abort();
    engine_task.abort();

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged
/// - If not set, defaults to "live_tutor_engine=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_tutor_engine=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

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

/// Wait for the shutdown flag, polling every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
