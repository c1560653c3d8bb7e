//! # Mutations
//!
//! Typed entity mutations and the affected-scope descriptor they produce.
//!
//! A mutation is one of:
//! - `create` / `update` of a fully materialized entity (no partial patches)
//! - `delete` of an entity by identity, with its cascade
//! - `set_state` of a module's runtime state (used by event firing)
//!
//! The catalog applies a mutation atomically and reports every entity it
//! touched in one `AffectedScope`; the hub evicts and notifies from it.

use crate::catalog::Catalog;
use crate::types::{
    ConfigOption, Group, GroupId, Module, ModuleKey, OptionId, Project, ProjectKey,
    ProjectOption, ProjectOptionId, Rule, RuleId, State, StateId, Transition, TransitionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// ENTITIES AND REFERENCES
// =============================================================================

/// A fully materialized entity carried by a create or update mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    Module(Module),
    Group(Group),
    Option(ConfigOption),
    Rule(Rule),
    State(State),
    Transition(Transition),
    Project(Project),
    ProjectOption(ProjectOption),
}

impl Entity {
    /// Identity of the entity.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        match self {
            Self::Module(m) => EntityRef::Module(m.key.clone()),
            Self::Group(g) => EntityRef::Group(g.id.clone()),
            Self::Option(o) => EntityRef::Option(o.id.clone()),
            Self::Rule(r) => EntityRef::Rule(r.id.clone()),
            Self::State(s) => EntityRef::State(s.id.clone()),
            Self::Transition(t) => EntityRef::Transition(t.id.clone()),
            Self::Project(p) => EntityRef::Project(p.key.clone()),
            Self::ProjectOption(po) => EntityRef::ProjectOption(po.id.clone()),
        }
    }
}

/// Kind of entity, as reported in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Module,
    Group,
    Option,
    Rule,
    State,
    Transition,
    Project,
    ProjectOption,
    ModuleState,
}

/// Identity of any entity.
///
/// Ordering is deterministic: by kind first, then by identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Module(ModuleKey),
    Group(GroupId),
    Option(OptionId),
    Rule(RuleId),
    State(StateId),
    Transition(TransitionId),
    Project(ProjectKey),
    ProjectOption(ProjectOptionId),
    /// The runtime (current) state of a module.
    ModuleState(ModuleKey),
}

impl EntityRef {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Module(_) => EntityKind::Module,
            Self::Group(_) => EntityKind::Group,
            Self::Option(_) => EntityKind::Option,
            Self::Rule(_) => EntityKind::Rule,
            Self::State(_) => EntityKind::State,
            Self::Transition(_) => EntityKind::Transition,
            Self::Project(_) => EntityKind::Project,
            Self::ProjectOption(_) => EntityKind::ProjectOption,
            Self::ModuleState(_) => EntityKind::ModuleState,
        }
    }

    /// The top-level Module this entity belongs to, if any.
    ///
    /// Projects belong to no module; a ProjectOption belongs to the module of
    /// its Option.
    #[must_use]
    pub fn module(&self) -> Option<&ModuleKey> {
        match self {
            Self::Module(m) | Self::ModuleState(m) => Some(m),
            Self::Group(g) => Some(&g.module),
            Self::Option(o) => Some(&o.module),
            Self::Rule(r) => Some(&r.option.module),
            Self::State(s) => Some(&s.module),
            Self::Transition(t) => Some(&t.module),
            Self::Project(_) => None,
            Self::ProjectOption(po) => Some(&po.option.module),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(m) => write!(f, "{}", m),
            Self::Group(g) => write!(f, "{}", g),
            Self::Option(o) => write!(f, "{}", o),
            Self::Rule(r) => write!(f, "{}", r),
            Self::State(s) => write!(f, "{}", s),
            Self::Transition(t) => write!(f, "{}", t),
            Self::Project(p) => write!(f, "{}", p),
            Self::ProjectOption(po) => write!(f, "{}", po),
            Self::ModuleState(m) => write!(f, "{}@", m),
        }
    }
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

/// A typed mutation of exactly one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    Create { entity: Entity },
    Update { entity: Entity },
    Delete { target: EntityRef },
    /// Move a module's state machine to a declared state.
    SetState { module: ModuleKey, state: String },
}

impl Mutation {
    #[must_use]
    pub fn create(entity: Entity) -> Self {
        Self::Create { entity }
    }

    #[must_use]
    pub fn update(entity: Entity) -> Self {
        Self::Update { entity }
    }

    #[must_use]
    pub fn delete(target: EntityRef) -> Self {
        Self::Delete { target }
    }

    /// The entity the mutation is addressed to.
    #[must_use]
    pub fn target(&self) -> EntityRef {
        match self {
            Self::Create { entity } | Self::Update { entity } => entity.entity_ref(),
            Self::Delete { target } => target.clone(),
            Self::SetState { module, .. } => EntityRef::ModuleState(module.clone()),
        }
    }

    /// Exclusion keys this mutation must hold against the current catalog.
    ///
    /// A mutation holds its target's module; project-option changes also hold
    /// the project; cascades hold every module or project they rewrite.
    #[must_use]
    pub fn lock_keys(&self, catalog: &Catalog) -> BTreeSet<LockKey> {
        let target = self.target();
        let mut keys = BTreeSet::new();
        if let Some(module) = target.module() {
            keys.insert(LockKey::Module(module.clone()));
        }
        match (&target, self) {
            (EntityRef::Project(project), Self::Delete { .. }) => {
                keys.insert(LockKey::Project(project.clone()));
                for po in catalog.project_options_of(project) {
                    keys.insert(LockKey::Module(po.id.option.module.clone()));
                }
            }
            (EntityRef::Project(project), _) => {
                keys.insert(LockKey::Project(project.clone()));
            }
            (EntityRef::ProjectOption(id), _) => {
                keys.insert(LockKey::Project(id.project.clone()));
            }
            (_, Self::Delete { .. }) => {
                if let Some(module) = target.module() {
                    for project in catalog.projects_referencing(module) {
                        keys.insert(LockKey::Project(project));
                    }
                }
            }
            _ => {}
        }
        keys
    }
}

/// Unit of mutual exclusion for mutations.
///
/// Projects order before modules so every writer acquires in the same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Project(ProjectKey),
    Module(ModuleKey),
}

// =============================================================================
// AFFECTED SCOPE
// =============================================================================

/// One entity-level change inside a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity: EntityRef,
    pub action: MutationAction,
}

impl EntityChange {
    #[must_use]
    pub fn new(entity: EntityRef, action: MutationAction) -> Self {
        Self { entity, action }
    }
}

/// Everything a committed mutation touched.
///
/// - `changes`: the primary change first, then cascaded changes in
///   deterministic order.
/// - `entities`: every changed entity, plus the owning `Module` for changes
///   inside a module and the owning `Project` for project-option changes.
///   The hub evicts cache entries whose dependencies intersect this set.
/// - `modules`: every top-level module impacted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedScope {
    pub modules: BTreeSet<ModuleKey>,
    pub entities: BTreeSet<EntityRef>,
    pub changes: Vec<EntityChange>,
}

impl AffectedScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and the containers it invalidates.
    pub fn record(&mut self, entity: EntityRef, action: MutationAction) {
        match &entity {
            EntityRef::Project(_) => {}
            EntityRef::ProjectOption(id) => {
                self.modules.insert(id.option.module.clone());
                self.entities.insert(EntityRef::Project(id.project.clone()));
            }
            EntityRef::ModuleState(m) => {
                self.modules.insert(m.clone());
            }
            other => {
                if let Some(m) = other.module() {
                    self.modules.insert(m.clone());
                    self.entities.insert(EntityRef::Module(m.clone()));
                }
            }
        }
        self.entities.insert(entity.clone());
        self.changes.push(EntityChange::new(entity, action));
    }

    /// The change the mutation was addressed to.
    #[must_use]
    pub fn primary(&self) -> Option<&EntityChange> {
        self.changes.first()
    }

    /// Changes that belong to one module, in recorded order.
    pub fn changes_in<'a>(
        &'a self,
        module: &'a ModuleKey,
    ) -> impl Iterator<Item = &'a EntityChange> + 'a {
        self.changes
            .iter()
            .filter(move |c| c.entity.module() == Some(module))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
