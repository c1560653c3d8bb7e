//! # API Endpoint Handlers
//!
//! Thin adapters from HTTP to the `Engine`. Every handler maps a
//! `KeelError` to a status code with [`error_status`].
//!
//! The engine takes std locks, so every call runs on the blocking pool.

use super::{
    AppState,
    types::{
        AssembleRequest, AssembleResponse, EventsResponse, FireRequest, FireResponse,
        HealthResponse, MutationResponse, ReloadResponse, StatusResponse,
    },
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keel_core::{
    Engine, KeelError, ModuleKey, Mutation, Snapshot, canonical_checksum, canonical_crypto_hash,
    types::validate_key,
};
use std::sync::Arc;

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// HTTP status for an engine error.
#[must_use]
pub fn error_status(err: &KeelError) -> StatusCode {
    match err {
        KeelError::NotFound(_) | KeelError::NoSuchTransition { .. } => StatusCode::NOT_FOUND,
        KeelError::DuplicateKey(_) | KeelError::GuardRejected { .. } => StatusCode::CONFLICT,
        KeelError::DanglingReference { .. } | KeelError::InvalidTransition { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        KeelError::InvalidKey(_)
        | KeelError::InvalidValue(_)
        | KeelError::SerializationError(_) => StatusCode::BAD_REQUEST,
        KeelError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run `f` against the engine on the blocking pool.
async fn with_engine<T, F>(state: &AppState, f: F) -> Result<T, KeelError>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> Result<T, KeelError> + Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    match tokio::task::spawn_blocking(move || f(&engine)).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Engine task failed: {}", e);
            Err(KeelError::IoError(format!("engine task failed: {}", e)))
        }
    }
}

fn error_response(err: &KeelError) -> Response {
    let body = serde_json::json!({"success": false, "error": err.to_string()});
    (error_status(err), Json(body)).into_response()
}

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// STATUS HANDLER
// =============================================================================

/// Get catalog status.
pub async fn status_handler(State(state): State<AppState>) -> Response {
    let status = with_engine(&state, |engine| {
        let (revision, module_count, project_count, entity_count) = engine.read(|c| {
            (
                c.revision(),
                c.modules().len(),
                c.projects().count(),
                c.entity_count(),
            )
        });
        Ok(StatusResponse {
            revision,
            module_count,
            project_count,
            entity_count,
            cached_entries: engine.cached_entries(),
            subscribers: engine.subscriber_count(),
        })
    })
    .await;

    match status {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// ASSEMBLE HANDLER
// =============================================================================

/// Assemble the config of a set of modules, optionally for a project.
pub async fn assemble_handler(
    State(state): State<AppState>,
    Json(request): Json<AssembleRequest>,
) -> impl IntoResponse {
    let (modules, project) = match request.to_keys() {
        Ok(keys) => keys,
        Err(e) => return (error_status(&e), Json(AssembleResponse::error(e.to_string()))),
    };

    let assembled = with_engine(&state, move |engine| {
        let config = engine.assemble(&modules, project.as_ref())?;
        let checksum = canonical_checksum(&config)?;
        let hash = canonical_crypto_hash(&config)?;
        Ok(((*config).clone(), checksum, hash))
    })
    .await;

    match assembled {
        Ok((config, checksum, hash)) => (
            StatusCode::OK,
            Json(AssembleResponse::success(config, checksum, hash)),
        ),
        Err(e) => (error_status(&e), Json(AssembleResponse::error(e.to_string()))),
    }
}

// =============================================================================
// MUTATION HANDLER
// =============================================================================

/// Apply one typed mutation.
pub async fn mutation_handler(
    State(state): State<AppState>,
    Json(mutation): Json<Mutation>,
) -> impl IntoResponse {
    match with_engine(&state, move |engine| engine.apply_mutation(mutation)).await {
        Ok(scope) => (StatusCode::OK, Json(MutationResponse::success(scope))),
        Err(e) => {
            tracing::debug!("Mutation rejected: {}", e);
            (error_status(&e), Json(MutationResponse::error(e.to_string())))
        }
    }
}

// =============================================================================
// EVENT HANDLER
// =============================================================================

/// Fire an event on a module's state machine.
pub async fn event_handler(
    State(state): State<AppState>,
    Path(module): Path<String>,
    Json(request): Json<FireRequest>,
) -> impl IntoResponse {
    let project = match validate_key("module", &module).and_then(|()| request.project_key()) {
        Ok(p) => p,
        Err(e) => return (error_status(&e), Json(FireResponse::error(e.to_string()))),
    };

    let module = ModuleKey::new(module);
    let fired = with_engine(&state, move |engine| {
        engine.fire_event(&module, &request.event, project.as_ref())
    })
    .await;

    match fired {
        Ok(outcome) => (StatusCode::OK, Json(FireResponse::success(outcome))),
        Err(e) => (error_status(&e), Json(FireResponse::error(e.to_string()))),
    }
}

/// Events that can be fired on a module from its current state.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Response {
    if let Err(e) = validate_key("module", &module) {
        return error_response(&e);
    }
    let module = ModuleKey::new(module);
    let events = with_engine(&state, move |engine| {
        let events = engine.available_events(&module)?;
        Ok(EventsResponse { module, events })
    })
    .await;

    match events {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// SNAPSHOT HANDLERS
// =============================================================================

/// Export the current catalog.
pub async fn snapshot_handler(State(state): State<AppState>) -> Response {
    match with_engine(&state, |engine| Ok(engine.snapshot())).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Replace the whole catalog.
pub async fn reload_handler(
    State(state): State<AppState>,
    Json(snapshot): Json<Snapshot>,
) -> impl IntoResponse {
    match with_engine(&state, move |engine| engine.reload(snapshot)).await {
        Ok(revision) => (StatusCode::OK, Json(ReloadResponse::success(revision))),
        Err(e) => (error_status(&e), Json(ReloadResponse::error(e.to_string()))),
    }
}
