//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use keel_core::{
    AffectedScope, AssembledConfig, FireOutcome, KeelError, ModuleKey, ProjectKey,
    primitives::MAX_ASSEMBLE_MODULES, types::validate_key,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

/// Catalog status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub revision: u64,
    pub module_count: usize,
    pub project_count: usize,
    pub entity_count: usize,
    pub cached_entries: usize,
    /// Live change-notification subscribers.
    pub subscribers: usize,
}

// =============================================================================
// ASSEMBLE REQUEST/RESPONSE
// =============================================================================

/// Config assembly request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembleRequest {
    pub modules: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
}

impl AssembleRequest {
    /// Validate keys and convert to the engine's request shape.
    ///
    /// Duplicate module keys collapse into one.
    pub fn to_keys(&self) -> Result<(BTreeSet<ModuleKey>, Option<ProjectKey>), KeelError> {
        if self.modules.is_empty() {
            return Err(KeelError::InvalidValue(
                "assemble request names no modules".to_string(),
            ));
        }
        if self.modules.len() > MAX_ASSEMBLE_MODULES {
            return Err(KeelError::InvalidValue(format!(
                "assemble request names {} modules, maximum is {}",
                self.modules.len(),
                MAX_ASSEMBLE_MODULES
            )));
        }
        let mut modules = BTreeSet::new();
        for key in &self.modules {
            validate_key("module", key)?;
            modules.insert(ModuleKey::new(key.as_str()));
        }
        let project = match &self.project {
            Some(key) => {
                validate_key("project", key)?;
                Some(ProjectKey::new(key.as_str()))
            }
            None => None,
        };
        Ok((modules, project))
    }
}

/// Config assembly response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembleResponse {
    pub success: bool,
    pub config: Option<AssembledConfig>,
    /// Checksum of the canonical encoding of `config`.
    pub checksum: Option<u64>,
    /// BLAKE3 hex digest of the canonical encoding of `config`.
    pub hash: Option<String>,
    pub error: Option<String>,
}

impl AssembleResponse {
    #[must_use]
    pub fn success(config: AssembledConfig, checksum: u64, hash: String) -> Self {
        Self {
            success: true,
            config: Some(config),
            checksum: Some(checksum),
            hash: Some(hash),
            error: None,
        }
    }

    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            config: None,
            checksum: None,
            hash: None,
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// MUTATION RESPONSE
// =============================================================================

/// Mutation response. The request body is a `keel_core::Mutation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResponse {
    pub success: bool,
    pub scope: Option<AffectedScope>,
    pub error: Option<String>,
}

impl MutationResponse {
    #[must_use]
    pub fn success(scope: AffectedScope) -> Self {
        Self {
            success: true,
            scope: Some(scope),
            error: None,
        }
    }

    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            scope: None,
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// EVENT REQUEST/RESPONSE
// =============================================================================

/// State machine event request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireRequest {
    pub event: String,
    /// Project whose selection the guard is evaluated against.
    #[serde(default)]
    pub project: Option<String>,
}

impl FireRequest {
    /// Validate the optional project key.
    pub fn project_key(&self) -> Result<Option<ProjectKey>, KeelError> {
        if self.event.is_empty() {
            return Err(KeelError::InvalidValue("event is empty".to_string()));
        }
        match &self.project {
            Some(key) => {
                validate_key("project", key)?;
                Ok(Some(ProjectKey::new(key.as_str())))
            }
            None => Ok(None),
        }
    }
}

/// Events available from a module's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub module: ModuleKey,
    pub events: Vec<String>,
}

/// State machine event response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireResponse {
    pub success: bool,
    pub from: Option<String>,
    pub to: Option<String>,
    pub error: Option<String>,
}

impl FireResponse {
    #[must_use]
    pub fn success(outcome: FireOutcome) -> Self {
        Self {
            success: true,
            from: Some(outcome.from),
            to: Some(outcome.to),
            error: None,
        }
    }

    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            from: None,
            to: None,
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// RELOAD RESPONSE
// =============================================================================

/// Snapshot reload response. The request body is a `keel_core::Snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub revision: Option<u64>,
    pub error: Option<String>,
}

impl ReloadResponse {
    #[must_use]
    pub fn success(revision: u64) -> Self {
        Self {
            success: true,
            revision: Some(revision),
            error: None,
        }
    }

    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            revision: None,
            error: Some(msg.into()),
        }
    }
}
