#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agent-gateway
//!
//! HTTP gateway that fronts a CLI-driven coding agent: admits requests
//! through a bounded priority queue, caps concurrent child processes, and
//! normalises the agent's stdout into a consistent JSON response — all
//! protected by an optional pre-shared API key.
//!
//! ## Subcommands
//!
//! - `agent-gateway serve` (default) — run the HTTP server

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, routing::post, Extension, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agent_gateway::{
    auth::ApiKey,
    config::Config,
    executor::ClaudeExecutor,
    routes,
    scheduler::Scheduler,
    state::AppState,
};

/// HTTP gateway fronting a CLI-driven coding agent.
#[derive(Parser)]
#[command(name = "agent-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server().await,
    }
}

async fn run_server() {
    let config = Config::load();

    let log_filter = config.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter))
        .init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("agent-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on port {}", config.port);
    info!(
        "max_concurrent={} max_queue_depth={} queue_timeout_ms={}",
        config.max_concurrent, config.max_queue_depth, config.queue_timeout_ms
    );

    if config.proxy_api_key.is_none() {
        warn!("No GATEWAY_PROXY_API_KEY configured — authentication is disabled");
    }

    let config = Arc::new(config);
    let executor = Arc::new(ClaudeExecutor::new(config.cli_binary.clone()));
    let scheduler = Scheduler::new(config.clone(), executor);

    let state = AppState {
        config: config.clone(),
        start_time: Instant::now(),
        scheduler,
    };

    let public_routes = Router::new().route("/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/v1/agent", post(routes::agent::submit))
        .route("/v1/messages", post(routes::messages::submit))
        .route("/v1/metrics", get(routes::metrics::snapshot))
        .layer(middleware::from_fn(agent_gateway::auth::require_api_key));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(config.proxy_api_key.clone())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.max_concurrent * 4,
        ));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Goodbye");
}
