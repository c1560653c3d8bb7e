//! # keel-core
//!
//! The deterministic configuration engine for keel - THE LOGIC.
//!
//! This crate assembles hierarchical, project-scoped configuration trees
//! (module -> group -> option) from a catalog of normalized entities, checks
//! dependency rules, gates options through per-module state machines and
//! keeps cached results coherent as entities mutate.
//!
//! ## Components
//!
//! - `catalog` / `mutation` / `types`: the Entity Model
//! - `predicate`: the bounded, side-effect-free condition language
//! - `rules`: the Rule Evaluator
//! - `machine`: the State Machine Engine
//! - `assembler`: the Config Assembler
//! - `hub`: cache, reverse dependency index and change notifications
//! - `engine`: the process-wide facade with locking
//!
//! ## Architectural Constraints
//!
//! - No network, no disk I/O (snapshots are bytes in, bytes out)
//! - BTreeMap/BTreeSet only, no clocks, no randomness in assembled output
//! - Conditions use a closed operator set; there is no scripting

// =============================================================================
// MODULES
// =============================================================================

pub mod assembler;
pub mod catalog;
pub mod engine;
pub mod formats;
pub mod hub;
pub mod machine;
pub mod mutation;
pub mod predicate;
pub mod primitives;
pub mod rules;
pub mod types;

// =============================================================================
// RE-EXPORTS: Entity Model
// =============================================================================

pub use catalog::{Applied, Catalog};
pub use mutation::{
    AffectedScope, Entity, EntityChange, EntityKind, EntityRef, LockKey, Mutation,
    MutationAction,
};
pub use types::{
    ConfigOption, Group, GroupId, KeelError, Metadata, Module, ModuleKey, OptionId, OptionValue,
    Project, ProjectKey, ProjectOption, ProjectOptionId, Requirement, Rule, RuleCondition, RuleId,
    RuleKind, State, StateId, Transition, TransitionId, ValueType,
};

// =============================================================================
// RE-EXPORTS: Evaluation
// =============================================================================

pub use assembler::{
    AssembledConfig, AssembledGroup, AssembledModule, AssembledOption, Assembler, Assembly,
    ExcludeReason, ViolationEntry, Warning,
};
pub use machine::{CompiledMachine, StateMachine};
pub use predicate::{EvalError, OptionRef, Predicate, Selected, Selection, SelectionMap};
pub use rules::{RuleEvaluator, RuleVerdict, Verdict};

// =============================================================================
// RE-EXPORTS: Runtime
// =============================================================================

pub use engine::{Engine, EngineConfig, FireOutcome};
pub use hub::{CacheKey, ChangeNotification, ChangeStream, InvalidationHub};

// =============================================================================
// RE-EXPORTS: Formats
// =============================================================================

pub use formats::{
    Snapshot, canonical_bytes, canonical_checksum, snapshot_from_json, snapshot_to_json,
};
#[cfg(feature = "crypto-hash")]
pub use formats::canonical_crypto_hash;
