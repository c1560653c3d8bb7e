//! # Configuration
//!
//! `keel.toml` loading with environment overrides.
//!
//! ```toml
//! snapshot = "keel.json"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [engine]
//! notification_capacity = 1024
//! max_predicate_depth = 32
//! ```
//!
//! Every field has a default. Environment overrides (applied last):
//! - `KEEL_HOST`, `KEEL_PORT`: server bind address
//! - `KEEL_SNAPSHOT`: snapshot path

use keel_core::primitives::MAX_SNAPSHOT_BYTES;
use keel_core::{Engine, EngineConfig, KeelError, snapshot_from_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    /// JSON snapshot loaded at startup; empty catalog when unset.
    pub snapshot: Option<PathBuf>,
}

impl KeelConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, KeelError> {
        toml::from_str(s)
            .map_err(|e| KeelError::SerializationError(format!("Invalid config: {}", e)))
    }

    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, KeelError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            KeelError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `KEEL_*` environment overrides.
    #[must_use]
    pub fn with_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("KEEL_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("KEEL_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(e) => tracing::warn!("Ignoring invalid KEEL_PORT '{}': {}", port, e),
            }
        }
        if let Some(snapshot) = lookup("KEEL_SNAPSHOT") {
            self.snapshot = Some(PathBuf::from(snapshot));
        }
        self
    }

    /// `host:port` bind address.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Build an engine from the configured snapshot (or an empty one).
    pub fn build_engine(&self) -> Result<Engine, KeelError> {
        match &self.snapshot {
            Some(path) => load_engine(path, self.engine),
            None => Ok(Engine::with_config(self.engine)),
        }
    }
}

/// Read a snapshot file and build an engine from it.
///
/// The file size is checked before reading.
pub fn load_engine(path: &Path, config: EngineConfig) -> Result<Engine, KeelError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        KeelError::IoError(format!("Cannot read snapshot '{}': {}", path.display(), e))
    })?;
    if metadata.len() > MAX_SNAPSHOT_BYTES as u64 {
        return Err(KeelError::SerializationError(format!(
            "Snapshot size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_SNAPSHOT_BYTES
        )));
    }
    let bytes = std::fs::read(path)
        .map_err(|e| KeelError::IoError(format!("Read snapshot: {}", e)))?;
    let snapshot = snapshot_from_json(&bytes)?;
    let engine = Engine::from_snapshot(snapshot, config)?;
    tracing::info!(
        "Loaded snapshot {} ({} entities)",
        path.display(),
        engine.read(|c| c.entity_count())
    );
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = KeelConfig::from_toml_str("").expect("parse");
        assert_eq!(config, KeelConfig::default());
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn partial_sections() {
        let config = KeelConfig::from_toml_str(
            "snapshot = \"data/keel.json\"\n\
             [server]\nport = 9000\n\
             [engine]\nmax_predicate_depth = 8\n",
        )
        .expect("parse");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.engine.max_predicate_depth, 8);
        assert_eq!(
            config.engine.notification_capacity,
            EngineConfig::default().notification_capacity
        );
        assert_eq!(config.snapshot, Some(PathBuf::from("data/keel.json")));
    }

    #[test]
    fn overrides_win_and_bad_port_is_ignored() {
        let config = KeelConfig::default().with_overrides(|name| match name {
            "KEEL_HOST" => Some("0.0.0.0".to_string()),
            "KEEL_PORT" => Some("not-a-port".to_string()),
            "KEEL_SNAPSHOT" => Some("/tmp/s.json".to_string()),
            _ => None,
        });
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.snapshot, Some(PathBuf::from("/tmp/s.json")));
    }

    #[test]
    fn unknown_toml_is_rejected() {
        assert!(matches!(
            KeelConfig::from_toml_str("[server]\nport = \"x\""),
            Err(KeelError::SerializationError(_))
        ));
    }
}
