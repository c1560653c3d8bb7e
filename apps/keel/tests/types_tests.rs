//! Unit tests for API types and configuration loading.

#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::StatusCode;
use keel::api::{
    AssembleRequest, AssembleResponse, FireRequest, HealthResponse, MutationResponse,
    error_status,
};
use keel::config::{KeelConfig, load_engine};
use keel_core::{
    EngineConfig, KeelError, ModuleKey, ProjectKey, primitives::MAX_ASSEMBLE_MODULES,
};
use std::io::Write;

// =============================================================================
// HEALTH RESPONSE TESTS
// =============================================================================

#[test]
fn test_health_response_default() {
    let health = HealthResponse::default();
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
}

// =============================================================================
// ASSEMBLE REQUEST TESTS
// =============================================================================

#[test]
fn test_assemble_request_collapses_duplicates() {
    let request: AssembleRequest =
        serde_json::from_str(r#"{"modules": ["video", "audio", "video"]}"#).unwrap();
    let (modules, project) = request.to_keys().unwrap();
    assert_eq!(
        modules.into_iter().collect::<Vec<_>>(),
        vec![ModuleKey::new("audio"), ModuleKey::new("video")]
    );
    assert!(project.is_none());
}

#[test]
fn test_assemble_request_with_project() {
    let request = AssembleRequest {
        modules: vec!["video".to_string()],
        project: Some("demo".to_string()),
    };
    let (_, project) = request.to_keys().unwrap();
    assert_eq!(project, Some(ProjectKey::new("demo")));
}

#[test]
fn test_assemble_request_limits() {
    let empty = AssembleRequest {
        modules: vec![],
        project: None,
    };
    assert!(matches!(empty.to_keys(), Err(KeelError::InvalidValue(_))));

    let too_many = AssembleRequest {
        modules: (0..=MAX_ASSEMBLE_MODULES).map(|i| format!("m{}", i)).collect(),
        project: None,
    };
    assert!(matches!(too_many.to_keys(), Err(KeelError::InvalidValue(_))));

    let bad_project = AssembleRequest {
        modules: vec!["video".to_string()],
        project: Some("a:b".to_string()),
    };
    assert!(matches!(bad_project.to_keys(), Err(KeelError::InvalidKey(_))));
}

#[test]
fn test_fire_request_validation() {
    let request: FireRequest = serde_json::from_str(r#"{"event": "ENABLE"}"#).unwrap();
    assert_eq!(request.project_key().unwrap(), None);

    let empty = FireRequest {
        event: String::new(),
        project: None,
    };
    assert!(empty.project_key().is_err());
}

// =============================================================================
// RESPONSE TESTS
// =============================================================================

#[test]
fn test_error_responses_carry_message_only() {
    let json = serde_json::to_value(AssembleResponse::error("Not found: module x")).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "Not found: module x");
    assert!(json["config"].is_null());

    let json = serde_json::to_value(MutationResponse::error("boom")).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["scope"].is_null());
}

#[test]
fn test_error_status_mapping() {
    let cases = [
        (KeelError::NotFound("x".into()), StatusCode::NOT_FOUND),
        (
            KeelError::NoSuchTransition {
                state: "idle".into(),
                event: "GO".into(),
            },
            StatusCode::NOT_FOUND,
        ),
        (KeelError::DuplicateKey("x".into()), StatusCode::CONFLICT),
        (
            KeelError::GuardRejected {
                state: "idle".into(),
                event: "GO".into(),
                reason: "guard is false".into(),
            },
            StatusCode::CONFLICT,
        ),
        (
            KeelError::DanglingReference {
                entity: "a".into(),
                missing: "b".into(),
            },
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
        (KeelError::InvalidKey("x".into()), StatusCode::BAD_REQUEST),
        (KeelError::IoError("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, status) in cases {
        assert_eq!(error_status(&err), status, "{}", err);
    }
}

// =============================================================================
// CONFIG LOADING TESTS
// =============================================================================

#[test]
fn test_config_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server]\nhost = \"0.0.0.0\"\nport = 9090").unwrap();

    let config = KeelConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.addr(), "0.0.0.0:9090");
    assert!(config.snapshot.is_none());
}

#[test]
fn test_config_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = KeelConfig::load(Some(&dir.path().join("absent.toml")));
    assert!(matches!(result, Err(KeelError::IoError(_))));
}

#[test]
fn test_build_engine_without_snapshot_is_empty() {
    let engine = KeelConfig::default().build_engine().unwrap();
    assert_eq!(engine.revision(), 0);
    assert_eq!(engine.read(|c| c.entity_count()), 0);
}

#[test]
fn test_load_engine_from_snapshot_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"modules": [{{"key": "video", "name": "Video"}}],
            "groups": [{{"module": "video", "group": "decoder", "name": "Decoder"}}]}}"#
    )
    .unwrap();

    let engine = load_engine(file.path(), EngineConfig::default()).unwrap();
    assert_eq!(engine.read(|c| c.entity_count()), 2);

    let mut broken = tempfile::NamedTempFile::new().unwrap();
    write!(broken, "{{ not json").unwrap();
    assert!(matches!(
        load_engine(broken.path(), EngineConfig::default()),
        Err(KeelError::SerializationError(_))
    ));
}
