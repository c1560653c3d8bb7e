//! # Snapshot Format
//!
//! JSON representation of a complete entity catalog, used for bulk load
//! (`Engine::reload`) and export.
//!
//! ## Input limits
//!
//! The payload size is checked against `MAX_SNAPSHOT_BYTES` BEFORE parsing.
//! Entity validation happens when the snapshot is applied to a catalog.

use crate::primitives::MAX_SNAPSHOT_BYTES;
use crate::types::{
    ConfigOption, Group, KeelError, Module, ModuleKey, Project, ProjectOption, Rule, State,
    Transition,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every entity of a catalog, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub options: Vec<ConfigOption>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub project_options: Vec<ProjectOption>,
    /// Runtime state per module.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub module_states: BTreeMap<ModuleKey, String>,
}

/// Parse a snapshot from JSON bytes.
///
/// # Errors
///
/// `SerializationError` when the payload is too large or malformed.
pub fn snapshot_from_json(bytes: &[u8]) -> Result<Snapshot, KeelError> {
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(KeelError::SerializationError(format!(
            "snapshot of {} bytes exceeds maximum {} bytes",
            bytes.len(),
            MAX_SNAPSHOT_BYTES
        )));
    }
    serde_json::from_slice(bytes).map_err(|e| KeelError::SerializationError(e.to_string()))
}

/// Serialize a snapshot to pretty-printed JSON.
pub fn snapshot_to_json(snapshot: &Snapshot) -> Result<Vec<u8>, KeelError> {
    serde_json::to_vec_pretty(snapshot).map_err(|e| KeelError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO: &str = r#"{
        "modules": [{"key": "video", "name": "Video", "initial_state": "idle",
                     "metadata": {"owner": "media", "tier": 2}}],
        "groups": [{"module": "video", "group": "decoder", "name": "Decoder"}],
        "options": [
            {"module": "video", "group": "decoder", "option": "h264", "name": "H.264",
             "value_type": {"type": "boolean"}, "default_value": true,
             "included_by_default": true},
            {"module": "video", "group": "decoder", "option": "hdr", "name": "HDR",
             "position": 1, "value_type": {"type": "boolean"}, "default_value": false,
             "editable": true}
        ],
        "rules": [{"module": "video", "group": "decoder", "option": "hdr",
                   "rule": "needs-h264",
                   "condition": {"kind": "requires", "targets": [{"option": "h264"}]}}],
        "states": [{"module": "video", "state": "idle"},
                   {"module": "video", "state": "active", "enables": ["hdr"]}],
        "transitions": [{"module": "video", "from": "idle", "event": "ENABLE",
                         "to": "active", "guard": {"op": "literal", "value": true}}]
    }"#;

    #[test]
    fn parses_full_snapshot() {
        let snapshot = snapshot_from_json(VIDEO.as_bytes()).expect("parse");
        assert_eq!(snapshot.modules.len(), 1);
        assert_eq!(snapshot.options.len(), 2);
        assert_eq!(snapshot.transitions[0].to, "active");
        assert!(snapshot.projects.is_empty());
        let keys: Vec<_> = snapshot.modules[0].metadata.keys().collect();
        assert_eq!(keys, vec!["owner", "tier"]);
    }

    #[test]
    fn rejects_malformed_json() {
        let result = snapshot_from_json(b"{\"modules\": [");
        assert!(matches!(result, Err(KeelError::SerializationError(_))));
    }

    #[test]
    fn json_round_trip() {
        let snapshot = snapshot_from_json(VIDEO.as_bytes()).expect("parse");
        let bytes = snapshot_to_json(&snapshot).expect("serialize");
        assert_eq!(snapshot_from_json(&bytes).expect("reparse"), snapshot);
    }
}
