//! # Core Type Definitions
//!
//! This module contains the entity model of the keel CORE:
//! - Identity keys (`ModuleKey`, `GroupId`, `OptionId`, `RuleId`, `StateId`,
//!   `TransitionId`, `ProjectKey`, `ProjectOptionId`)
//! - Option values and value types
//! - Entities (`Module`, `Group`, `ConfigOption`, `Rule`, `State`,
//!   `Transition`, `Project`, `ProjectOption`)
//! - Error types (`KeelError`)
//!
//! ## Determinism Guarantees
//!
//! - Child identities embed their parent identity, so every entity names its
//!   owning Module without a lookup.
//! - All identities implement `Ord` for deterministic ordering in
//!   `BTreeMap`/`BTreeSet`.
//! - No floating-point values anywhere in the model.

use crate::predicate::{OptionRef, Predicate};
use crate::primitives::{KEY_SEPARATORS, MAX_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Free-form extension data attached to a Module.
///
/// Opaque to the core and forwarded untouched. The workspace enables
/// `serde_json/preserve_order`, so keys keep their declaration order.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// IDENTITY KEYS
// =============================================================================

/// Unique, stable key of a Module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleKey(pub String);

impl ModuleKey {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModuleKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique key of a Project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(pub String);

impl ProjectKey {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProjectKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a Group: unique within its Module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId {
    pub module: ModuleKey,
    pub group: String,
}

impl GroupId {
    #[must_use]
    pub fn new(module: impl Into<ModuleKey>, group: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.group)
    }
}

/// Identity of an Option: unique within its Group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OptionId {
    pub module: ModuleKey,
    pub group: String,
    pub option: String,
}

impl OptionId {
    #[must_use]
    pub fn new(
        module: impl Into<ModuleKey>,
        group: impl Into<String>,
        option: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            group: group.into(),
            option: option.into(),
        }
    }

    /// The Group that owns this Option.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        GroupId::new(self.module.clone(), self.group.clone())
    }
}

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.module, self.group, self.option)
    }
}

/// Identity of a Rule: unique within its Option.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId {
    #[serde(flatten)]
    pub option: OptionId,
    pub rule: String,
}

impl RuleId {
    #[must_use]
    pub fn new(option: OptionId, rule: impl Into<String>) -> Self {
        Self {
            option,
            rule: rule.into(),
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.option, self.rule)
    }
}

/// Identity of a State: a name unique within its Module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub module: ModuleKey,
    pub state: String,
}

impl StateId {
    #[must_use]
    pub fn new(module: impl Into<ModuleKey>, state: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            state: state.into(),
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.state)
    }
}

/// Identity of a Transition: `(from_state, event)` is unique per Module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransitionId {
    pub module: ModuleKey,
    pub from: String,
    pub event: String,
}

impl TransitionId {
    #[must_use]
    pub fn new(
        module: impl Into<ModuleKey>,
        from: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            from: from.into(),
            event: event.into(),
        }
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.module, self.from, self.event)
    }
}

/// Identity of a ProjectOption: one per (Project, Option) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectOptionId {
    pub project: ProjectKey,
    #[serde(flatten)]
    pub option: OptionId,
}

impl ProjectOptionId {
    #[must_use]
    pub fn new(project: impl Into<ProjectKey>, option: OptionId) -> Self {
        Self {
            project: project.into(),
            option,
        }
    }
}

impl fmt::Display for ProjectOptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.option)
    }
}

/// Validate a single key segment.
///
/// Segments must be non-empty, at most `MAX_KEY_LENGTH` bytes, and free of
/// the separator characters used by rendered identities.
pub fn validate_key(kind: &str, segment: &str) -> Result<(), KeelError> {
    if segment.is_empty() {
        return Err(KeelError::InvalidKey(format!("{} key is empty", kind)));
    }
    if segment.len() > MAX_KEY_LENGTH {
        return Err(KeelError::InvalidKey(format!(
            "{} key length {} exceeds maximum {} bytes",
            kind,
            segment.len(),
            MAX_KEY_LENGTH
        )));
    }
    if let Some(c) = segment.chars().find(|c| KEY_SEPARATORS.contains(c)) {
        return Err(KeelError::InvalidKey(format!(
            "{} key '{}' contains reserved character '{}'",
            kind, segment, c
        )));
    }
    Ok(())
}

// =============================================================================
// VALUES
// =============================================================================

/// A concrete option value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// The declared value type of an Option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    Integer,
    String,
    Enum { choices: Vec<String> },
}

impl ValueType {
    /// Check whether a value conforms to this type.
    #[must_use]
    pub fn accepts(&self, value: &OptionValue) -> bool {
        match (self, value) {
            (Self::Boolean, OptionValue::Bool(_))
            | (Self::Integer, OptionValue::Int(_))
            | (Self::String, OptionValue::Str(_)) => true,
            (Self::Enum { choices }, OptionValue::Str(s)) => choices.iter().any(|c| c == s),
            _ => false,
        }
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

fn default_true() -> bool {
    true
}

/// A Module: the top-level unit of assembly and of mutual exclusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub key: ModuleKey,
    pub name: String,
    /// Inactive modules are hidden from assembly, never deleted.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Declaration order; ties broken by key.
    #[serde(default)]
    pub position: u32,
    /// A state that is not declared means "no state machine".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Module {
    #[must_use]
    pub fn new(key: impl Into<ModuleKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            active: true,
            position: 0,
            initial_state: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }
}

/// A Group of options, exclusively owned by one Module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(flatten)]
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub position: u32,
}

impl Group {
    #[must_use]
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            position: 0,
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }
}

/// A configurable Option, exclusively owned by one Group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(flatten)]
    pub id: OptionId,
    pub name: String,
    #[serde(default)]
    pub position: u32,
    pub value_type: ValueType,
    pub default_value: OptionValue,
    /// Project overrides of the value only apply to editable options.
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub included_by_default: bool,
}

impl ConfigOption {
    /// A boolean option whose default value mirrors its default inclusion.
    #[must_use]
    pub fn boolean(id: OptionId, name: impl Into<String>, included_by_default: bool) -> Self {
        Self {
            id,
            name: name.into(),
            position: 0,
            value_type: ValueType::Boolean,
            default_value: OptionValue::Bool(included_by_default),
            editable: false,
            included_by_default,
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn editable(mut self) -> Self {
        self.editable = true;
        self
    }
}

/// Kind of a dependency rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Requires,
    Forbidden,
    Validation,
}

/// One target of a `requires` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub option: OptionRef,
    /// When set, the target must also carry exactly this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<OptionValue>,
}

impl Requirement {
    #[must_use]
    pub fn included(option: OptionRef) -> Self {
        Self {
            option,
            value: None,
        }
    }
}

/// The predicate a Rule asserts about other options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    Requires { targets: Vec<Requirement> },
    Forbidden { targets: Vec<OptionRef> },
    Validation { predicate: Predicate },
}

impl RuleCondition {
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Requires { .. } => RuleKind::Requires,
            Self::Forbidden { .. } => RuleKind::Forbidden,
            Self::Validation { .. } => RuleKind::Validation,
        }
    }

    /// Every option reference in the payload, in declaration order.
    #[must_use]
    pub fn references(&self) -> Vec<&OptionRef> {
        match self {
            Self::Requires { targets } => targets.iter().map(|t| &t.option).collect(),
            Self::Forbidden { targets } => targets.iter().collect(),
            Self::Validation { predicate } => predicate.references(),
        }
    }
}

/// A dependency Rule attached to exactly one Option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(flatten)]
    pub id: RuleId,
    /// Declaration order within the module.
    #[serde(default)]
    pub position: u32,
    pub condition: RuleCondition,
}

impl Rule {
    #[must_use]
    pub fn new(id: RuleId, condition: RuleCondition) -> Self {
        Self {
            id,
            position: 0,
            condition,
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn kind(&self) -> RuleKind {
        self.condition.kind()
    }
}

/// A State of a Module's state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(flatten)]
    pub id: StateId,
    /// Option keys of the same module gated to this state.
    ///
    /// A key that appears in no state's `enables` is never gated.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub enables: BTreeSet<String>,
}

impl State {
    #[must_use]
    pub fn new(id: StateId) -> Self {
        Self {
            id,
            enables: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn enabling<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enables.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// A guarded Transition `(from, event) -> to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(flatten)]
    pub id: TransitionId,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Predicate>,
}

impl Transition {
    #[must_use]
    pub fn new(id: TransitionId, to: impl Into<String>) -> Self {
        Self {
            id,
            to: to.into(),
            guard: None,
        }
    }

    #[must_use]
    pub fn guarded(mut self, guard: Predicate) -> Self {
        self.guard = Some(guard);
        self
    }
}

/// A Project: a named set of option overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub key: ProjectKey,
    #[serde(default)]
    pub name: String,
}

impl Project {
    #[must_use]
    pub fn new(key: impl Into<ProjectKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }
}

/// Project-level inclusion and override for one Option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectOption {
    #[serde(flatten)]
    pub id: ProjectOptionId,
    pub included: bool,
    /// Only applied when the Option is editable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<OptionValue>,
}

impl ProjectOption {
    #[must_use]
    pub fn new(id: ProjectOptionId, included: bool) -> Self {
        Self {
            id,
            included,
            value: None,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: OptionValue) -> Self {
        self.value = Some(value);
        self
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the keel system.
///
/// - Structural errors reject the triggering operation; nothing is committed
///   and nothing is cached.
/// - Rule and guard evaluation problems are NOT errors of `assemble`; they
///   become `indeterminate` verdicts in the output.
/// - The CORE never panics; all errors are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeelError {
    /// A mutation refers to an entity that does not exist.
    #[error("Dangling reference: {entity} refers to missing {missing}")]
    DanglingReference { entity: String, missing: String },

    /// A uniqueness invariant would be violated.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A key segment is empty, too long or contains a separator.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A value does not conform to the option's declared type.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A state machine references an undeclared state.
    #[error("Invalid transition {transition} in module {module}: undeclared state '{state}'")]
    InvalidTransition {
        module: String,
        transition: String,
        state: String,
    },

    /// No transition exists for the `(state, event)` pair.
    #[error("No transition from state '{state}' on event '{event}'")]
    NoSuchTransition { state: String, event: String },

    /// The transition exists but its guard did not hold.
    #[error("Guard rejected event '{event}' in state '{state}': {reason}")]
    GuardRejected {
        state: String,
        event: String,
        reason: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred (app layer only).
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
