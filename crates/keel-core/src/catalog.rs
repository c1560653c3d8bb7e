//! # Entity Catalog
//!
//! The in-memory Entity Model of the keel CORE.
//!
//! The catalog exclusively owns every entity. Other components only borrow
//! it for the duration of one call.
//!
//! All storage uses `BTreeMap` keyed by typed identities; since child
//! identities embed their parent identity, "children of X" is a range scan.
//!
//! Mutations are validated completely before anything is written, so a
//! rejected mutation leaves the catalog untouched.

use crate::formats::Snapshot;
use crate::mutation::{AffectedScope, Entity, EntityRef, Mutation, MutationAction};
use crate::types::{
    ConfigOption, Group, GroupId, KeelError, Module, ModuleKey, OptionId, Project, ProjectKey,
    ProjectOption, ProjectOptionId, Rule, RuleId, State, StateId, Transition, TransitionId,
    validate_key,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The created or updated entity; `None` for deletes.
    pub entity: Option<Entity>,
    pub scope: AffectedScope,
}

/// The entity store.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    modules: BTreeMap<ModuleKey, Module>,
    groups: BTreeMap<GroupId, Group>,
    options: BTreeMap<OptionId, ConfigOption>,
    rules: BTreeMap<RuleId, Rule>,
    states: BTreeMap<StateId, State>,
    transitions: BTreeMap<TransitionId, Transition>,
    projects: BTreeMap<ProjectKey, Project>,
    project_options: BTreeMap<ProjectOptionId, ProjectOption>,
    /// Runtime state per module, set by firing events.
    module_states: BTreeMap<ModuleKey, String>,
    /// Number of committed mutations.
    revision: u64,
}

/// Everything a delete removes or rewrites, computed before committing.
#[derive(Debug, Default)]
struct DeletePlan {
    removals: Vec<EntityRef>,
    pruned_states: Vec<(StateId, BTreeSet<String>)>,
}

impl Catalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a snapshot, validating every entity.
    ///
    /// Entities are applied in dependency order (modules, groups, options,
    /// rules, states, transitions, projects, project options, runtime states).
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, KeelError> {
        let mut catalog = Self::new();
        let Snapshot {
            modules,
            groups,
            options,
            rules,
            states,
            transitions,
            projects,
            project_options,
            module_states,
        } = snapshot;

        let entities = modules
            .into_iter()
            .map(Entity::Module)
            .chain(groups.into_iter().map(Entity::Group))
            .chain(options.into_iter().map(Entity::Option))
            .chain(rules.into_iter().map(Entity::Rule))
            .chain(states.into_iter().map(Entity::State))
            .chain(transitions.into_iter().map(Entity::Transition))
            .chain(projects.into_iter().map(Entity::Project))
            .chain(project_options.into_iter().map(Entity::ProjectOption));

        for entity in entities {
            catalog.apply(Mutation::create(entity))?;
        }
        for (module, state) in module_states {
            catalog.apply(Mutation::SetState { module, state })?;
        }

        catalog.revision = 0;
        Ok(catalog)
    }

    /// Export every entity in identity order.
    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            modules: self.modules.values().cloned().collect(),
            groups: self.groups.values().cloned().collect(),
            options: self.options.values().cloned().collect(),
            rules: self.rules.values().cloned().collect(),
            states: self.states.values().cloned().collect(),
            transitions: self.transitions.values().cloned().collect(),
            projects: self.projects.values().cloned().collect(),
            project_options: self.project_options.values().cloned().collect(),
            module_states: self.module_states.clone(),
        }
    }

    /// Number of committed mutations since load.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    // =========================================================================
    // READ ACCESS
    // =========================================================================

    #[must_use]
    pub fn module(&self, key: &ModuleKey) -> Option<&Module> {
        self.modules.get(key)
    }

    /// All modules in declaration order (position, then key).
    #[must_use]
    pub fn modules(&self) -> Vec<&Module> {
        let mut modules: Vec<_> = self.modules.values().collect();
        modules.sort_by(|a, b| (a.position, &a.key).cmp(&(b.position, &b.key)));
        modules
    }

    #[must_use]
    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Groups of a module in declaration order.
    #[must_use]
    pub fn groups_of(&self, module: &ModuleKey) -> Vec<&Group> {
        let start = GroupId::new(module.clone(), String::new());
        let mut groups: Vec<_> = self
            .groups
            .range(start..)
            .take_while(|(id, _)| id.module == *module)
            .map(|(_, g)| g)
            .collect();
        groups.sort_by(|a, b| (a.position, &a.id).cmp(&(b.position, &b.id)));
        groups
    }

    #[must_use]
    pub fn option(&self, id: &OptionId) -> Option<&ConfigOption> {
        self.options.get(id)
    }

    /// Options of a group in declaration order.
    #[must_use]
    pub fn options_of(&self, group: &GroupId) -> Vec<&ConfigOption> {
        let start = OptionId::new(group.module.clone(), group.group.clone(), String::new());
        let mut options: Vec<_> = self
            .options
            .range(start..)
            .take_while(|(id, _)| id.module == group.module && id.group == group.group)
            .map(|(_, o)| o)
            .collect();
        options.sort_by(|a, b| (a.position, &a.id).cmp(&(b.position, &b.id)));
        options
    }

    /// Options of a module in declaration order (group order, then option order).
    #[must_use]
    pub fn options_in_module(&self, module: &ModuleKey) -> Vec<&ConfigOption> {
        self.groups_of(module)
            .into_iter()
            .flat_map(|g| self.options_of(&g.id))
            .collect()
    }

    #[must_use]
    pub fn rule(&self, id: &RuleId) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Rules of an option in declaration order (position, then key).
    #[must_use]
    pub fn rules_of(&self, option: &OptionId) -> Vec<&Rule> {
        let start = RuleId::new(option.clone(), String::new());
        let mut rules: Vec<_> = self
            .rules
            .range(start..)
            .take_while(|(id, _)| id.option == *option)
            .map(|(_, r)| r)
            .collect();
        rules.sort_by(|a, b| (a.position, &a.id).cmp(&(b.position, &b.id)));
        rules
    }

    #[must_use]
    pub fn state(&self, id: &StateId) -> Option<&State> {
        self.states.get(id)
    }

    /// Declared states of a module, by name.
    #[must_use]
    pub fn states_of(&self, module: &ModuleKey) -> Vec<&State> {
        let start = StateId::new(module.clone(), String::new());
        self.states
            .range(start..)
            .take_while(|(id, _)| id.module == *module)
            .map(|(_, s)| s)
            .collect()
    }

    #[must_use]
    pub fn transition(&self, id: &TransitionId) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Transitions of a module, by (from, event).
    #[must_use]
    pub fn transitions_of(&self, module: &ModuleKey) -> Vec<&Transition> {
        let start = TransitionId::new(module.clone(), String::new(), String::new());
        self.transitions
            .range(start..)
            .take_while(|(id, _)| id.module == *module)
            .map(|(_, t)| t)
            .collect()
    }

    #[must_use]
    pub fn project(&self, key: &ProjectKey) -> Option<&Project> {
        self.projects.get(key)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    #[must_use]
    pub fn project_option(&self, id: &ProjectOptionId) -> Option<&ProjectOption> {
        self.project_options.get(id)
    }

    /// Overrides of a project, by option identity.
    #[must_use]
    pub fn project_options_of(&self, project: &ProjectKey) -> Vec<&ProjectOption> {
        let start = ProjectOptionId::new(
            project.clone(),
            OptionId::new("", "", ""),
        );
        self.project_options
            .range(start..)
            .take_while(|(id, _)| id.project == *project)
            .map(|(_, po)| po)
            .collect()
    }

    /// Projects holding at least one override on an option of `module`.
    #[must_use]
    pub fn projects_referencing(&self, module: &ModuleKey) -> BTreeSet<ProjectKey> {
        self.project_options
            .keys()
            .filter(|id| id.option.module == *module)
            .map(|id| id.project.clone())
            .collect()
    }

    /// Runtime state set by firing events, if any.
    #[must_use]
    pub fn runtime_state(&self, module: &ModuleKey) -> Option<&str> {
        self.module_states.get(module).map(String::as_str)
    }

    /// The state the module is in, if it has a state machine.
    ///
    /// The runtime state wins when it is still declared; otherwise the
    /// module's initial state. An undeclared initial state means no state
    /// machine.
    #[must_use]
    pub fn current_state(&self, module: &ModuleKey) -> Option<&str> {
        let declared = |s: &str| {
            self.states
                .contains_key(&StateId::new(module.clone(), s.to_string()))
        };
        if let Some(state) = self.runtime_state(module).filter(|&s| declared(s)) {
            return Some(state);
        }
        self.modules
            .get(module)?
            .initial_state
            .as_deref()
            .filter(|&s| declared(s))
    }

    /// Look up any entity by identity.
    #[must_use]
    pub fn get(&self, entity: &EntityRef) -> Option<Entity> {
        match entity {
            EntityRef::Module(k) => self.modules.get(k).cloned().map(Entity::Module),
            EntityRef::Group(id) => self.groups.get(id).cloned().map(Entity::Group),
            EntityRef::Option(id) => self.options.get(id).cloned().map(Entity::Option),
            EntityRef::Rule(id) => self.rules.get(id).cloned().map(Entity::Rule),
            EntityRef::State(id) => self.states.get(id).cloned().map(Entity::State),
            EntityRef::Transition(id) => {
                self.transitions.get(id).cloned().map(Entity::Transition)
            }
            EntityRef::Project(k) => self.projects.get(k).cloned().map(Entity::Project),
            EntityRef::ProjectOption(id) => self
                .project_options
                .get(id)
                .cloned()
                .map(Entity::ProjectOption),
            EntityRef::ModuleState(_) => None,
        }
    }

    /// Check whether an entity exists.
    #[must_use]
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match entity {
            EntityRef::Module(k) => self.modules.contains_key(k),
            EntityRef::Group(id) => self.groups.contains_key(id),
            EntityRef::Option(id) => self.options.contains_key(id),
            EntityRef::Rule(id) => self.rules.contains_key(id),
            EntityRef::State(id) => self.states.contains_key(id),
            EntityRef::Transition(id) => self.transitions.contains_key(id),
            EntityRef::Project(k) => self.projects.contains_key(k),
            EntityRef::ProjectOption(id) => self.project_options.contains_key(id),
            EntityRef::ModuleState(k) => self.module_states.contains_key(k),
        }
    }

    /// Total number of stored entities (runtime states excluded).
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.modules.len()
            + self.groups.len()
            + self.options.len()
            + self.rules.len()
            + self.states.len()
            + self.transitions.len()
            + self.projects.len()
            + self.project_options.len()
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Apply one mutation atomically.
    ///
    /// # Errors
    ///
    /// - `DuplicateKey` when creating an existing identity
    /// - `NotFound` when updating or deleting a missing identity
    /// - `DanglingReference` when a parent or referenced key is missing
    /// - `InvalidKey` / `InvalidValue` for malformed input
    ///
    /// On error nothing is changed.
    pub fn apply(&mut self, mutation: Mutation) -> Result<Applied, KeelError> {
        let applied = match mutation {
            Mutation::Create { entity } => {
                let target = entity.entity_ref();
                self.validate(&entity)?;
                if self.contains(&target) {
                    return Err(KeelError::DuplicateKey(target.to_string()));
                }
                self.store(entity.clone());
                let mut scope = AffectedScope::new();
                scope.record(target, MutationAction::Create);
                Applied {
                    entity: Some(entity),
                    scope,
                }
            }
            Mutation::Update { entity } => {
                let target = entity.entity_ref();
                if !self.contains(&target) {
                    return Err(KeelError::NotFound(target.to_string()));
                }
                self.validate(&entity)?;
                self.store(entity.clone());
                let mut scope = AffectedScope::new();
                scope.record(target, MutationAction::Update);
                Applied {
                    entity: Some(entity),
                    scope,
                }
            }
            Mutation::Delete { target } => {
                let plan = self.plan_delete(&target)?;
                let scope = self.commit_delete(plan);
                Applied {
                    entity: None,
                    scope,
                }
            }
            Mutation::SetState { module, state } => {
                validate_key("state", &state)?;
                if !self.modules.contains_key(&module) {
                    return Err(KeelError::NotFound(module.to_string()));
                }
                let state_id = StateId::new(module.clone(), state.clone());
                if !self.states.contains_key(&state_id) {
                    return Err(KeelError::DanglingReference {
                        entity: EntityRef::ModuleState(module).to_string(),
                        missing: state_id.to_string(),
                    });
                }
                self.module_states.insert(module.clone(), state);
                let mut scope = AffectedScope::new();
                scope.record(EntityRef::ModuleState(module), MutationAction::Update);
                Applied {
                    entity: None,
                    scope,
                }
            }
        };

        self.revision = self.revision.saturating_add(1);
        debug!(
            revision = self.revision,
            changes = applied.scope.changes.len(),
            "catalog mutation committed"
        );
        Ok(applied)
    }

    /// Check keys, parents, references and values of an entity.
    fn validate(&self, entity: &Entity) -> Result<(), KeelError> {
        let owner = entity.entity_ref().to_string();
        let require = |present: bool, missing: String| {
            if present {
                Ok(())
            } else {
                Err(KeelError::DanglingReference {
                    entity: owner.clone(),
                    missing,
                })
            }
        };

        match entity {
            Entity::Module(m) => {
                validate_key("module", m.key.as_str())?;
                if let Some(state) = &m.initial_state {
                    validate_key("state", state)?;
                }
                Ok(())
            }
            Entity::Group(g) => {
                validate_key("module", g.id.module.as_str())?;
                validate_key("group", &g.id.group)?;
                require(
                    self.modules.contains_key(&g.id.module),
                    g.id.module.to_string(),
                )
            }
            Entity::Option(o) => {
                validate_key("module", o.id.module.as_str())?;
                validate_key("group", &o.id.group)?;
                validate_key("option", &o.id.option)?;
                let group = o.id.group_id();
                require(self.groups.contains_key(&group), group.to_string())?;
                if !o.value_type.accepts(&o.default_value) {
                    return Err(KeelError::InvalidValue(format!(
                        "default value {} of {} does not match {:?}",
                        o.default_value, o.id, o.value_type
                    )));
                }
                Ok(())
            }
            Entity::Rule(r) => {
                validate_key("rule", &r.id.rule)?;
                require(
                    self.options.contains_key(&r.id.option),
                    r.id.option.to_string(),
                )
            }
            Entity::State(s) => {
                validate_key("state", &s.id.state)?;
                require(
                    self.modules.contains_key(&s.id.module),
                    s.id.module.to_string(),
                )?;
                let keys: BTreeSet<&str> = self
                    .options_in_module(&s.id.module)
                    .into_iter()
                    .map(|o| o.id.option.as_str())
                    .collect();
                for key in &s.enables {
                    require(
                        keys.contains(key.as_str()),
                        format!("option '{}' of module {}", key, s.id.module),
                    )?;
                }
                Ok(())
            }
            Entity::Transition(t) => {
                validate_key("state", &t.id.from)?;
                validate_key("event", &t.id.event)?;
                validate_key("state", &t.to)?;
                require(
                    self.modules.contains_key(&t.id.module),
                    t.id.module.to_string(),
                )?;
                for state in [&t.id.from, &t.to] {
                    let id = StateId::new(t.id.module.clone(), state.clone());
                    require(self.states.contains_key(&id), id.to_string())?;
                }
                Ok(())
            }
            Entity::Project(p) => validate_key("project", p.key.as_str()),
            Entity::ProjectOption(po) => {
                validate_key("project", po.id.project.as_str())?;
                require(
                    self.projects.contains_key(&po.id.project),
                    po.id.project.to_string(),
                )?;
                let option = self.options.get(&po.id.option);
                require(option.is_some(), po.id.option.to_string())?;
                if let (Some(option), Some(value)) = (option, &po.value) {
                    if !option.value_type.accepts(value) {
                        return Err(KeelError::InvalidValue(format!(
                            "override {} of {} does not match {:?}",
                            value, po.id, option.value_type
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Insert or replace an entity (last write wins).
    fn store(&mut self, entity: Entity) {
        match entity {
            Entity::Module(m) => {
                self.modules.insert(m.key.clone(), m);
            }
            Entity::Group(g) => {
                self.groups.insert(g.id.clone(), g);
            }
            Entity::Option(o) => {
                self.options.insert(o.id.clone(), o);
            }
            Entity::Rule(r) => {
                self.rules.insert(r.id.clone(), r);
            }
            Entity::State(s) => {
                self.states.insert(s.id.clone(), s);
            }
            Entity::Transition(t) => {
                self.transitions.insert(t.id.clone(), t);
            }
            Entity::Project(p) => {
                self.projects.insert(p.key.clone(), p);
            }
            Entity::ProjectOption(po) => {
                self.project_options.insert(po.id.clone(), po);
            }
        }
    }

    /// Compute the full cascade of a delete without changing anything.
    fn plan_delete(&self, target: &EntityRef) -> Result<DeletePlan, KeelError> {
        if !self.contains(target) {
            return Err(KeelError::NotFound(target.to_string()));
        }

        let mut plan = DeletePlan::default();
        plan.removals.push(target.clone());

        match target {
            EntityRef::Module(module) => {
                let groups: Vec<_> = self.groups_of(module).into_iter().map(|g| &g.id).collect();
                let options = self.options_under(&groups);
                plan.removals
                    .extend(groups.iter().map(|g| EntityRef::Group((*g).clone())));
                self.push_option_cascade(&mut plan, &options);
                plan.removals.extend(
                    self.states_of(module)
                        .into_iter()
                        .map(|s| EntityRef::State(s.id.clone())),
                );
                plan.removals.extend(
                    self.transitions_of(module)
                        .into_iter()
                        .map(|t| EntityRef::Transition(t.id.clone())),
                );
                if self.module_states.contains_key(module) {
                    plan.removals.push(EntityRef::ModuleState(module.clone()));
                }
            }
            EntityRef::Group(group) => {
                let options = self.options_under(&[group]);
                self.push_option_cascade(&mut plan, &options);
                self.plan_pruning(&mut plan, &group.module, &options);
            }
            EntityRef::Option(option) => {
                // The option itself is already the primary removal.
                plan.removals.extend(
                    self.rules_of(option)
                        .into_iter()
                        .map(|r| EntityRef::Rule(r.id.clone())),
                );
                plan.removals.extend(
                    self.project_options_on(option)
                        .into_iter()
                        .map(EntityRef::ProjectOption),
                );
                self.plan_pruning(&mut plan, &option.module, std::slice::from_ref(option));
            }
            EntityRef::State(state) => {
                plan.removals.extend(
                    self.transitions_of(&state.module)
                        .into_iter()
                        .filter(|t| t.id.from == state.state || t.to == state.state)
                        .map(|t| EntityRef::Transition(t.id.clone())),
                );
                if self.runtime_state(&state.module) == Some(state.state.as_str()) {
                    plan.removals
                        .push(EntityRef::ModuleState(state.module.clone()));
                }
            }
            EntityRef::Project(project) => {
                plan.removals.extend(
                    self.project_options_of(project)
                        .into_iter()
                        .map(|po| EntityRef::ProjectOption(po.id.clone())),
                );
            }
            EntityRef::Rule(_)
            | EntityRef::Transition(_)
            | EntityRef::ProjectOption(_)
            | EntityRef::ModuleState(_) => {}
        }

        Ok(plan)
    }

    /// Options of the given groups, in identity order.
    fn options_under(&self, groups: &[&GroupId]) -> Vec<OptionId> {
        groups
            .iter()
            .flat_map(|g| self.options_of(g))
            .map(|o| o.id.clone())
            .collect()
    }

    /// Project overrides referencing one option.
    fn project_options_on(&self, option: &OptionId) -> Vec<ProjectOptionId> {
        self.project_options
            .keys()
            .filter(|id| id.option == *option)
            .cloned()
            .collect()
    }

    /// Queue options with their rules and project overrides for removal.
    fn push_option_cascade(&self, plan: &mut DeletePlan, options: &[OptionId]) {
        plan.removals
            .extend(options.iter().cloned().map(EntityRef::Option));
        for option in options {
            plan.removals.extend(
                self.rules_of(option)
                    .into_iter()
                    .map(|r| EntityRef::Rule(r.id.clone())),
            );
        }
        for option in options {
            plan.removals.extend(
                self.project_options_on(option)
                    .into_iter()
                    .map(EntityRef::ProjectOption),
            );
        }
    }

    /// Drop deleted option keys from state gating when no surviving option
    /// of the module shares the key.
    fn plan_pruning(&self, plan: &mut DeletePlan, module: &ModuleKey, removed: &[OptionId]) {
        let removed_ids: BTreeSet<&OptionId> = removed.iter().collect();
        let surviving: BTreeSet<&str> = self
            .options_in_module(module)
            .into_iter()
            .filter(|o| !removed_ids.contains(&o.id))
            .map(|o| o.id.option.as_str())
            .collect();
        let dropped: BTreeSet<&str> = removed
            .iter()
            .map(|o| o.option.as_str())
            .filter(|k| !surviving.contains(k))
            .collect();
        if dropped.is_empty() {
            return;
        }

        for state in self.states_of(module) {
            if state.enables.iter().any(|k| dropped.contains(k.as_str())) {
                let kept = state
                    .enables
                    .iter()
                    .filter(|k| !dropped.contains(k.as_str()))
                    .cloned()
                    .collect();
                plan.pruned_states.push((state.id.clone(), kept));
            }
        }
    }

    /// Remove everything in the plan and report it.
    fn commit_delete(&mut self, plan: DeletePlan) -> AffectedScope {
        let mut scope = AffectedScope::new();
        for entity in plan.removals {
            match &entity {
                EntityRef::Module(k) => {
                    self.modules.remove(k);
                }
                EntityRef::Group(id) => {
                    self.groups.remove(id);
                }
                EntityRef::Option(id) => {
                    self.options.remove(id);
                }
                EntityRef::Rule(id) => {
                    self.rules.remove(id);
                }
                EntityRef::State(id) => {
                    self.states.remove(id);
                }
                EntityRef::Transition(id) => {
                    self.transitions.remove(id);
                }
                EntityRef::Project(k) => {
                    self.projects.remove(k);
                }
                EntityRef::ProjectOption(id) => {
                    self.project_options.remove(id);
                }
                EntityRef::ModuleState(k) => {
                    self.module_states.remove(k);
                }
            }
            scope.record(entity, MutationAction::Delete);
        }
        for (id, enables) in plan.pruned_states {
            if let Some(state) = self.states.get_mut(&id) {
                state.enables = enables;
                scope.record(EntityRef::State(id), MutationAction::Update);
            }
        }
        scope
    }
}

// =============================================================================
// TESTS
// =============================================================================
