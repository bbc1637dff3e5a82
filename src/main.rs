//! # Whisper Gateway - Main Application Entry Point
//!
//! Speech-to-text gateway with three ingress paths:
//! - single-shot HTTP upload (`POST /transcribe`)
//! - interactive WebSocket streaming (`GET /stream/{session_id}`)
//! - Wyoming device protocol on its own TCP port
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared handles (admission gate, model registry, normalizer)
//! - **admission**: global concurrency/memory gate with RAII tickets
//! - **audio**: VAD gate, utterance buffer, ffmpeg normalizer
//! - **transcription**: engine contract, candle Whisper, model registry
//! - **protocol**: abstract event vocabulary + the two wire codecs
//! - **session**: per-connection recognition state machine
//! - **websocket / wyoming**: the two streaming transports
//! - **handlers / health**: the HTTP surface

mod admission;
mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod protocol;
mod session;
mod state;
mod transcription;
mod websocket;
mod wyoming;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag flipped by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting whisper-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "HTTP on {}:{}, Wyoming on {}:{}, default model '{}'",
        config.server.host,
        config.server.port,
        config.wyoming.host,
        config.wyoming.port,
        config.models.default_model
    );

    // Loads the default model; a failure here is fatal (a gateway with no
    // model has nothing to serve). Runtime swap failures are not.
    let app_state = AppState::initialize(config.clone()).await?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    // Wyoming listener runs beside the HTTP server for the process lifetime.
    let wyoming_state = app_state.clone();
    tokio::spawn(async move {
        if let Err(err) = wyoming::run(wyoming_state).await {
            error!("Wyoming server failed: {}", err);
            SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
        }
    });

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
            .route("/health", web::get().to(health::health_check))
            .route("/transcribe", web::post().to(handlers::transcribe))
            .route("/stream", web::post().to(handlers::stream_negotiate))
            .route(
                "/stream/{session_id}",
                web::get().to(websocket::stream_websocket),
            )
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

/// Console logging via tracing; `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip the shutdown flag on SIGTERM or SIGINT.
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
