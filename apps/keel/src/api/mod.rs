//! # Keel HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Catalog revision and counts
//! - `POST /assemble` - Assemble the config of a module set
//! - `POST /mutations` - Apply one typed mutation
//! - `GET /modules/{key}/events` - Events available from the current state
//! - `POST /modules/{key}/events` - Fire a state machine event
//! - `GET /snapshot` - Export the catalog
//! - `POST /snapshot` - Replace the catalog
//!
//! ## Configuration (Environment Variables)
//!
//! - `KEEL_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all
//!   (default: localhost only)

mod handlers;
mod types;

pub use handlers::{
    assemble_handler, error_status, event_handler, events_handler, health_handler,
    mutation_handler, reload_handler, snapshot_handler, status_handler,
};
pub use types::{
    AssembleRequest, AssembleResponse, EventsResponse, FireRequest, FireResponse,
    HealthResponse, MutationResponse, ReloadResponse, StatusResponse,
};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use keel_core::{Engine, KeelError, primitives::MAX_SNAPSHOT_BYTES};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Snapshot uploads are the largest request body.
const MAX_BODY_BYTES: usize = MAX_SNAPSHOT_BYTES;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
///
/// The engine does its own locking, so handlers share it without a wrapper.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from `KEEL_CORS_ORIGINS`.
///
/// - `*`: allows all origins
/// - unset or no valid entry: localhost only
/// - otherwise: the comma-separated list
fn build_cors_layer() -> CorsLayer {
    match std::env::var("KEEL_CORS_ORIGINS").ok().as_deref() {
        Some("*") => {
            tracing::warn!("CORS: Allowing ALL origins (KEEL_CORS_ORIGINS=*)");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: No valid origins in KEEL_CORS_ORIGINS, using localhost");
                build_localhost_cors()
            } else {
                cors_with_origins(allowed)
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();
    cors_with_origins(origins)
}

fn cors_with_origins(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/assemble", post(handlers::assemble_handler))
        .route("/mutations", post(handlers::mutation_handler))
        .route(
            "/modules/{key}/events",
            get(handlers::events_handler).post(handlers::event_handler),
        )
        .route(
            "/snapshot",
            get(handlers::snapshot_handler).post(handlers::reload_handler),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Log every change notification until the engine goes away.
fn spawn_change_logger(engine: &Engine) -> tokio::task::JoinHandle<()> {
    let mut changes = engine.subscribe_changes();
    tokio::spawn(async move {
        while let Some(n) = changes.next().await {
            tracing::info!(
                module = %n.module,
                revision = n.revision,
                entity_type = ?n.entity_type,
                action = ?n.action,
                identity = %n.identity,
                changes = n.changes.len(),
                "change notification"
            );
        }
    })
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn run_server(addr: &str, engine: Engine) -> Result<(), KeelError> {
    let state = AppState::new(engine);
    let logger = spawn_change_logger(&state.engine);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| KeelError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("Keel HTTP server listening on {}", addr);

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await
        .map_err(|e| KeelError::IoError(format!("Server error: {}", e)));
    logger.abort();
    result
}
