//! Nakle - OpenAI-style chat completions over the headless Claude Code CLI
//!
//! Each request runs one non-interactive `claude` invocation. Conversations
//! continue across requests by resuming the CLI session recorded for them.

mod api;
mod assembler;
mod cli;
mod config;
mod db;
mod runner;
mod serializer;
mod store;

use api::{create_router, AppState};
use cli::{prepare_scratch_dir, ClaudeInvoker, Invoker};
use config::NakleConfig;
use db::Database;
use runner::TurnRunner;
use std::net::SocketAddr;
use std::sync::Arc;
use store::DatabaseSessionStore;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nakle=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = NakleConfig::from_env();

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let scratch_dir = prepare_scratch_dir(&config.scratch_dir)?;
    tracing::info!(
        scratch_dir = %scratch_dir.display(),
        binary = %config.claude_bin.display(),
        allowed_tools = ?config.tool_policy.allowed(),
        accounting = ?config.accounting,
        "Claude invoker configured"
    );

    let invoker: Arc<dyn Invoker> = Arc::new(ClaudeInvoker::new(
        config.claude_bin.clone(),
        scratch_dir,
        config.tool_policy.clone(),
    ));
    let store = DatabaseSessionStore::new(db.clone(), config.eviction_policy());
    let runner = Arc::new(
        TurnRunner::new(store, invoker, config.runner_config()).with_usage_log(db.clone()),
    );

    let shutdown = CancellationToken::new();
    let sweeper = runner.spawn_sweeper(config.sweep_interval, shutdown.clone());

    let state = AppState {
        runner,
        db,
        default_model: config.default_model.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Install handlers before accepting connections
    let sigterm = signal(SignalKind::terminate())?;
    let sigint = signal(SignalKind::interrupt())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Nakle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sigterm, sigint))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Returns once SIGTERM or SIGINT arrives
async fn shutdown_signal(mut sigterm: Signal, mut sigint: Signal) {
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM - shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT - shutting down");
        }
    }
}
