//! # CLI Command Implementations
//!
//! Commands that change state (`fire`, `apply`) load the snapshot, commit
//! through the `Engine` and write the snapshot back only on success.

use keel::api::{self, AssembleRequest};
use keel::config::KeelConfig;
use keel_core::{
    Engine, KeelError, ModuleKey, Mutation, ProjectKey, Verdict, canonical_checksum,
    canonical_crypto_hash, primitives::MAX_SNAPSHOT_BYTES, snapshot_from_json, snapshot_to_json,
    types::validate_key,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Snapshot written by `init` when none is configured.
const DEFAULT_SNAPSHOT: &str = "keel.json";

/// Example catalog written by `init`.
const EXAMPLE_SNAPSHOT: &str = r#"{
  "modules": [
    {"key": "video", "name": "Video", "initial_state": "idle"},
    {"key": "audio", "name": "Audio", "position": 1}
  ],
  "groups": [
    {"module": "video", "group": "decoder", "name": "Decoder"},
    {"module": "audio", "group": "codec", "name": "Codec"}
  ],
  "options": [
    {"module": "video", "group": "decoder", "option": "h264", "name": "H.264",
     "value_type": {"type": "boolean"}, "default_value": true, "included_by_default": true},
    {"module": "video", "group": "decoder", "option": "hdr", "name": "HDR", "position": 1,
     "value_type": {"type": "boolean"}, "default_value": false, "editable": true},
    {"module": "video", "group": "decoder", "option": "profile", "name": "Profile", "position": 2,
     "value_type": {"type": "enum", "choices": ["main", "high"]}, "default_value": "main",
     "included_by_default": true, "editable": true},
    {"module": "audio", "group": "codec", "option": "aac", "name": "AAC",
     "value_type": {"type": "boolean"}, "default_value": true, "included_by_default": true}
  ],
  "rules": [
    {"module": "video", "group": "decoder", "option": "hdr", "rule": "needs-h264",
     "condition": {"kind": "requires", "targets": [{"option": "h264"}]}},
    {"module": "video", "group": "decoder", "option": "hdr", "rule": "needs-aac",
     "position": 1, "condition": {"kind": "requires", "targets": [{"option": "audio:aac"}]}}
  ],
  "states": [
    {"module": "video", "state": "idle"},
    {"module": "video", "state": "active", "enables": ["hdr"]}
  ],
  "transitions": [
    {"module": "video", "from": "idle", "event": "ENABLE", "to": "active",
     "guard": {"op": "included", "option": "h264"}},
    {"module": "video", "from": "active", "event": "DISABLE", "to": "idle"}
  ],
  "projects": [{"key": "demo", "name": "Demo"}],
  "project_options": [
    {"project": "demo", "module": "video", "group": "decoder", "option": "hdr",
     "included": true, "value": true}
  ]
}"#;

// =============================================================================
// PATH VALIDATION
// =============================================================================

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), KeelError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| KeelError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(KeelError::SerializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and require a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, KeelError> {
    let canonical = path.canonicalize().map_err(|e| {
        KeelError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(KeelError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }
    Ok(canonical)
}

/// Canonicalize the parent of an output path and require a directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, KeelError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        KeelError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;
    if !canonical_parent.is_dir() {
        return Err(KeelError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| KeelError::IoError("Output path has no filename".to_string()))?;
    Ok(canonical_parent.join(filename))
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_serve(config: &KeelConfig) -> Result<(), KeelError> {
    let engine = open_engine(config)?;

    println!("Keel Configuration Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", config.server.host);
    println!("  Port:     {}", config.server.port);
    match &config.snapshot {
        Some(path) => println!("  Snapshot: {}", path.display()),
        None => println!("  Snapshot: (empty catalog)"),
    }
    println!();
    println!("Endpoints:");
    println!("  GET  /health                - Health check");
    println!("  GET  /status                - Catalog status");
    println!("  POST /assemble              - Assemble a config tree");
    println!("  POST /mutations             - Apply a mutation");
    println!("  GET  /modules/{{key}}/events  - List available events");
    println!("  POST /modules/{{key}}/events  - Fire a state machine event");
    println!("  GET  /snapshot              - Export the catalog");
    println!("  POST /snapshot              - Replace the catalog");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(&config.addr(), engine).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show catalog status.
pub fn cmd_status(config: &KeelConfig, json_mode: bool) -> Result<(), KeelError> {
    let engine = open_engine(config)?;
    let (modules, projects, entities) = engine.read(|c| {
        (
            c.modules()
                .iter()
                .map(|m| (m.key.to_string(), m.active, c.current_state(&m.key).map(str::to_string)))
                .collect::<Vec<_>>(),
            c.projects().count(),
            c.entity_count(),
        )
    });
    // Modules without a state machine have no events.
    let events: Vec<Vec<String>> = modules
        .iter()
        .map(|(key, _, _)| {
            engine
                .available_events(&ModuleKey::new(key.as_str()))
                .unwrap_or_default()
        })
        .collect();

    if json_mode {
        let output = serde_json::json!({
            "snapshot": config.snapshot.as_ref().map(|p| p.to_string_lossy()),
            "module_count": modules.len(),
            "project_count": projects,
            "entity_count": entities,
            "modules": modules
                .iter()
                .zip(&events)
                .map(|((key, active, state), events)| serde_json::json!({
                    "key": key, "active": active, "state": state, "events": events
                }))
                .collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Keel Catalog Status");
    println!("===================");
    match &config.snapshot {
        Some(path) => println!("Snapshot: {}", path.display()),
        None => println!("Snapshot: (none)"),
    }
    println!();
    println!("Modules:  {}", modules.len());
    println!("Projects: {}", projects);
    println!("Entities: {}", entities);
    for ((key, active, state), events) in modules.iter().zip(&events) {
        println!(
            "  {:<24} {:<8} {:<12} {}",
            key,
            if *active { "active" } else { "inactive" },
            state.as_deref().unwrap_or("-"),
            events.join(", ")
        );
    }
    Ok(())
}

// =============================================================================
// ASSEMBLE COMMAND
// =============================================================================

/// Assemble and print (or write) a config tree.
pub fn cmd_assemble(
    config: &KeelConfig,
    json_mode: bool,
    modules: &[String],
    project: Option<&str>,
    output: Option<&Path>,
) -> Result<(), KeelError> {
    let request = AssembleRequest {
        modules: modules.to_vec(),
        project: project.map(str::to_string),
    };
    let (modules, project) = request.to_keys()?;
    let engine = open_engine(config)?;
    let assembled = engine.assemble(&modules, project.as_ref())?;

    let checksum = canonical_checksum(&assembled)?;
    let hash = canonical_crypto_hash(&assembled)?;
    let tree = serde_json::to_string_pretty(&*assembled)
        .map_err(|e| KeelError::SerializationError(e.to_string()))?;

    if let Some(path) = output {
        let path = validate_output_path(path)?;
        std::fs::write(&path, tree.as_bytes())
            .map_err(|e| KeelError::IoError(format!("Write output: {}", e)))?;
        if json_mode {
            let output = serde_json::json!({
                "output": path.to_string_lossy(),
                "checksum": checksum,
                "hash": hash,
                "violations": assembled.violations.len(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_default()
            );
        } else {
            println!("Wrote {}", path.display());
            println!("Checksum:   {:016x}", checksum);
            println!("BLAKE3:     {}", hash);
            println!("Violations: {}", assembled.violations.len());
        }
        return Ok(());
    }

    if json_mode {
        let output = serde_json::json!({
            "config": &*assembled,
            "checksum": checksum,
            "hash": hash,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
    } else {
        println!("{}", tree);
        eprintln!("Checksum: {:016x}", checksum);
    }
    Ok(())
}

// =============================================================================
// CHECK COMMAND
// =============================================================================

/// Assemble every active module (optionally per project) and fail when any
/// rule is violated. Indeterminate rules are reported but do not fail.
pub fn cmd_check(config: &KeelConfig, json_mode: bool, per_project: bool) -> Result<(), KeelError> {
    let engine = open_engine(config)?;
    let (modules, projects): (BTreeSet<ModuleKey>, Vec<ProjectKey>) = engine.read(|c| {
        (
            c.modules()
                .into_iter()
                .filter(|m| m.active)
                .map(|m| m.key.clone())
                .collect(),
            c.projects().map(|p| p.key.clone()).collect(),
        )
    });

    let mut scopes: Vec<Option<ProjectKey>> = vec![None];
    if per_project {
        scopes.extend(projects.into_iter().map(Some));
    }

    let mut report = Vec::new();
    let mut violated = 0usize;
    if !modules.is_empty() {
        for project in &scopes {
            let assembled = engine.assemble(&modules, project.as_ref())?;
            for v in &assembled.violations {
                if v.verdict == Verdict::Violated {
                    violated += 1;
                }
                report.push((project.clone(), v.clone()));
            }
        }
    }

    if json_mode {
        let output = serde_json::json!({
            "modules": modules.len(),
            "violated": violated,
            "findings": report
                .iter()
                .map(|(project, v)| serde_json::json!({
                    "project": project,
                    "ruleId": v.rule_id,
                    "optionKey": v.option_key,
                    "kind": v.kind,
                    "verdict": v.verdict,
                    "detail": v.detail,
                }))
                .collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
    } else {
        println!("Checked {} module(s) in {} scope(s)", modules.len(), scopes.len());
        for (project, v) in &report {
            println!(
                "  [{}] {:?} {} ({:?}){}",
                project.as_ref().map_or("-", ProjectKey::as_str),
                v.verdict,
                v.rule_id,
                v.kind,
                v.detail
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            );
        }
    }

    if violated > 0 {
        return Err(KeelError::InvalidValue(format!(
            "{} rule(s) violated",
            violated
        )));
    }
    Ok(())
}

// =============================================================================
// FIRE COMMAND
// =============================================================================

/// Fire a state machine event and persist the new state.
pub fn cmd_fire(
    config: &KeelConfig,
    json_mode: bool,
    module: &str,
    event: &str,
    project: Option<&str>,
) -> Result<(), KeelError> {
    validate_key("module", module)?;
    let project = project
        .map(|p| validate_key("project", p).map(|()| ProjectKey::new(p)))
        .transpose()?;
    let path = require_snapshot(config)?;
    let engine = open_engine(config)?;

    let outcome = engine.fire_event(&ModuleKey::new(module), event, project.as_ref())?;
    save_engine(&engine, path)?;

    if json_mode {
        let output = serde_json::json!({
            "module": outcome.module,
            "from": outcome.from,
            "to": outcome.to,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
    } else {
        println!("{}: {} -> {}", outcome.module, outcome.from, outcome.to);
    }
    Ok(())
}

// =============================================================================
// APPLY COMMAND
// =============================================================================

/// Apply a JSON array of mutations in order.
///
/// The snapshot is only written when every mutation commits.
pub fn cmd_apply(config: &KeelConfig, json_mode: bool, file: &Path) -> Result<(), KeelError> {
    let file = validate_file_path(file)?;
    validate_file_size(&file, MAX_SNAPSHOT_BYTES as u64)?;
    let path = require_snapshot(config)?;

    let data = std::fs::read(&file)
        .map_err(|e| KeelError::IoError(format!("Read mutations: {}", e)))?;
    let mutations: Vec<Mutation> = serde_json::from_slice(&data)
        .map_err(|e| KeelError::SerializationError(format!("Invalid mutations: {}", e)))?;

    let engine = open_engine(config)?;
    let applied = mutations.len();
    let mut changes = 0usize;
    for (i, mutation) in mutations.into_iter().enumerate() {
        let scope = engine.apply_mutation(mutation).inspect_err(|_| {
            tracing::error!("Mutation #{} rejected, snapshot left unchanged", i);
        })?;
        changes += scope.changes.len();
    }
    save_engine(&engine, path)?;

    if json_mode {
        let output = serde_json::json!({
            "applied": applied,
            "revision": engine.revision(),
            "changes": changes,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
    } else {
        println!(
            "Applied {} mutation(s), {} entity change(s)",
            applied,
            changes
        );
    }
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Write the example catalog.
pub fn cmd_init(config: &KeelConfig, force: bool) -> Result<(), KeelError> {
    let path = config
        .snapshot
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT));
    if path.exists() && !force {
        return Err(KeelError::IoError(format!(
            "Snapshot '{}' already exists. Use --force to overwrite.",
            path.display()
        )));
    }

    let snapshot = snapshot_from_json(EXAMPLE_SNAPSHOT.as_bytes())?;
    let engine = Engine::from_snapshot(snapshot, config.engine)?;
    save_engine(&engine, &path)?;
    println!("Initialized example snapshot at {}", path.display());
    Ok(())
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Build the engine for a command, from the configured snapshot if any.
pub fn open_engine(config: &KeelConfig) -> Result<Engine, KeelError> {
    if let Some(path) = &config.snapshot {
        validate_file_path(path)?;
    }
    config.build_engine()
}

fn require_snapshot(config: &KeelConfig) -> Result<&Path, KeelError> {
    config.snapshot.as_deref().ok_or_else(|| {
        KeelError::InvalidValue("no snapshot configured; pass --snapshot".to_string())
    })
}

/// Write the engine's catalog as a JSON snapshot.
pub fn save_engine(engine: &Engine, path: &Path) -> Result<(), KeelError> {
    let path = validate_output_path(path)?;
    let data = snapshot_to_json(&engine.snapshot())?;
    std::fs::write(&path, &data)
        .map_err(|e| KeelError::IoError(format!("Write snapshot: {}", e)))?;
    tracing::debug!("Saved snapshot to {}", path.display());
    Ok(())
}
