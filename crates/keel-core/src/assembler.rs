//! # Config Assembler
//!
//! Builds the deterministic module -> group -> option tree for a set of
//! modules and an optional project.
//!
//! Pipeline per request:
//! 1. Resolve modules (unknown -> `NotFound`, inactive -> skipped)
//! 2. Merge project inclusion/overrides with option defaults
//! 3. Apply state gating from each module's current state
//! 4. Evaluate all rules over the gated selection of the whole set
//! 5. Attach non-satisfied verdicts as option warnings and flat violations
//!
//! The assembler also reports every entity it read, which the hub uses as
//! the dependency set of the cached result.

use crate::catalog::Catalog;
use crate::machine::StateMachine;
use crate::mutation::EntityRef;
use crate::predicate::{Selected, SelectionMap};
use crate::primitives::MAX_ASSEMBLE_MODULES;
use crate::rules::{RuleEvaluator, Verdict};
use crate::types::{
    KeelError, Metadata, ModuleKey, OptionId, OptionValue, ProjectKey, ProjectOption, Rule,
    RuleKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

// =============================================================================
// OUTPUT TREE
// =============================================================================

/// The assembled configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledConfig {
    pub modules: Vec<AssembledModule>,
    pub violations: Vec<ViolationEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledModule {
    pub key: ModuleKey,
    pub name: String,
    /// `None` when the module has no usable state machine.
    pub current_state: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub groups: Vec<AssembledGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledGroup {
    pub key: String,
    pub name: String,
    pub options: Vec<AssembledOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledOption {
    pub key: String,
    pub name: String,
    pub included: bool,
    pub value: OptionValue,
    pub editable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_reason: Option<ExcludeReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

/// Why an option is excluded regardless of its own flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcludeReason {
    StateGated,
}

/// A non-satisfied rule attached to its owning option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub rule_id: String,
    pub kind: RuleKind,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A non-satisfied rule in the flat violation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationEntry {
    pub rule_id: String,
    pub option_key: String,
    pub kind: RuleKind,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of one assembly: the tree plus what it was computed from.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub config: AssembledConfig,
    /// Every entity read, including absent-but-relevant containers.
    pub touched: BTreeSet<EntityRef>,
    /// The gated selection the rules were evaluated against.
    pub selection: SelectionMap,
}

// =============================================================================
// ASSEMBLER
// =============================================================================

/// Position of an option inside the output tree.
type Slot = (usize, usize, usize);

/// Rule ordering key: (rule position, option declaration index, rule key).
type RuleOrder<'a> = (u32, usize, &'a str);

/// Config assembly engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler {
    rules: RuleEvaluator,
    machine: StateMachine,
}

impl Assembler {
    /// Create an assembler whose predicates evaluate with the given depth bound.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            rules: RuleEvaluator::new(max_depth),
            machine: StateMachine::new(max_depth),
        }
    }

    /// Assemble the configuration of `module_keys`, optionally for `project`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown module or project, `InvalidValue` when more
    /// than `MAX_ASSEMBLE_MODULES` modules are requested.
    pub fn assemble(
        &self,
        catalog: &Catalog,
        module_keys: &BTreeSet<ModuleKey>,
        project: Option<&ProjectKey>,
    ) -> Result<Assembly, KeelError> {
        if module_keys.len() > MAX_ASSEMBLE_MODULES {
            return Err(KeelError::InvalidValue(format!(
                "{} modules requested, maximum is {}",
                module_keys.len(),
                MAX_ASSEMBLE_MODULES
            )));
        }

        let mut touched = BTreeSet::new();
        let mut modules = Vec::with_capacity(module_keys.len());
        for key in module_keys {
            let module = catalog
                .module(key)
                .ok_or_else(|| KeelError::NotFound(format!("module {}", key)))?;
            touched.insert(EntityRef::Module(key.clone()));
            touched.insert(EntityRef::ModuleState(key.clone()));
            if module.active {
                modules.push(module);
            }
        }
        modules.sort_by(|a, b| (a.position, &a.key).cmp(&(b.position, &b.key)));

        let mut overrides: BTreeMap<&OptionId, &ProjectOption> = BTreeMap::new();
        if let Some(project) = project {
            if catalog.project(project).is_none() {
                return Err(KeelError::NotFound(format!("project {}", project)));
            }
            touched.insert(EntityRef::Project(project.clone()));
            for po in catalog.project_options_of(project) {
                if module_keys.contains(&po.id.option.module) {
                    touched.insert(EntityRef::ProjectOption(po.id.clone()));
                    overrides.insert(&po.id.option, po);
                }
            }
        }

        let mut selection = SelectionMap::new();
        let mut tree = Vec::with_capacity(modules.len());
        let mut slots: BTreeMap<OptionId, Slot> = BTreeMap::new();
        let mut module_rules: Vec<Vec<&Rule>> = Vec::with_capacity(modules.len());

        for (mi, module) in modules.iter().enumerate() {
            let states = catalog.states_of(&module.key);
            let transitions = catalog.transitions_of(&module.key);
            touched.extend(states.iter().map(|s| EntityRef::State(s.id.clone())));
            touched.extend(transitions.iter().map(|t| EntityRef::Transition(t.id.clone())));

            let groups = catalog.groups_of(&module.key);
            let options: Vec<_> = groups
                .iter()
                .map(|g| catalog.options_of(&g.id))
                .collect();

            // State gating: compile only when the current state is declared.
            let mut current_state = catalog.current_state(&module.key).map(str::to_string);
            let mut reachable: Option<BTreeSet<String>> = None;
            if let Some(state) = &current_state {
                let keys = options.iter().flatten().map(|o| o.id.option.as_str());
                let compiled = self
                    .machine
                    .compile(&module.key, &states, &transitions, keys)
                    .and_then(|m| self.machine.reachable_options(&m, state));
                match compiled {
                    Ok(keys) => reachable = Some(keys),
                    Err(e) => {
                        warn!(
                            module = %module.key,
                            error = %e,
                            "state machine not compiled, gating skipped"
                        );
                        current_state = None;
                    }
                }
            }

            let mut ordered_rules: Vec<(RuleOrder<'_>, &Rule)> = Vec::new();
            let mut declared = 0usize;
            let mut out_groups = Vec::with_capacity(groups.len());
            for (gi, (group, group_options)) in groups.iter().zip(&options).enumerate() {
                touched.insert(EntityRef::Group(group.id.clone()));
                let mut out_options = Vec::with_capacity(group_options.len());
                for (oi, option) in group_options.iter().enumerate() {
                    touched.insert(EntityRef::Option(option.id.clone()));

                    let (mut included, value) = match overrides.get(&option.id) {
                        Some(po) => {
                            let value = po
                                .value
                                .as_ref()
                                .filter(|v| option.editable && option.value_type.accepts(v))
                                .unwrap_or(&option.default_value)
                                .clone();
                            (po.included, value)
                        }
                        None => (option.included_by_default, option.default_value.clone()),
                    };

                    let gated = reachable
                        .as_ref()
                        .is_some_and(|keys| !keys.contains(&option.id.option));
                    if gated {
                        included = false;
                    }

                    selection.insert(option.id.clone(), Selected::new(included, value.clone()));
                    slots.insert(option.id.clone(), (mi, gi, oi));
                    out_options.push(AssembledOption {
                        key: option.id.option.clone(),
                        name: option.name.clone(),
                        included,
                        value,
                        editable: option.editable,
                        exclude_reason: gated.then_some(ExcludeReason::StateGated),
                        warnings: Vec::new(),
                    });

                    for rule in catalog.rules_of(&option.id) {
                        touched.insert(EntityRef::Rule(rule.id.clone()));
                        let order = (rule.position, declared, rule.id.rule.as_str());
                        ordered_rules.push((order, rule));
                    }
                    declared += 1;
                }
                out_groups.push(AssembledGroup {
                    key: group.id.group.clone(),
                    name: group.name.clone(),
                    options: out_options,
                });
            }

            ordered_rules.sort_by(|a, b| a.0.cmp(&b.0));
            module_rules.push(ordered_rules.into_iter().map(|(_, r)| r).collect());

            tree.push(AssembledModule {
                key: module.key.clone(),
                name: module.name.clone(),
                current_state,
                metadata: module.metadata.clone(),
                groups: out_groups,
            });
        }

        // Rules see the complete, gated selection of every requested module.
        let mut violations = Vec::new();
        for rules in &module_rules {
            for verdict in self.rules.evaluate(rules, &selection) {
                if verdict.verdict == Verdict::Satisfied {
                    continue;
                }
                let rule_id = verdict.rule.to_string();
                if let Some(&(mi, gi, oi)) = slots.get(&verdict.rule.option) {
                    if let Some(option) = tree
                        .get_mut(mi)
                        .and_then(|m| m.groups.get_mut(gi))
                        .and_then(|g| g.options.get_mut(oi))
                    {
                        option.warnings.push(Warning {
                            rule_id: rule_id.clone(),
                            kind: verdict.kind,
                            verdict: verdict.verdict,
                            detail: verdict.detail.clone(),
                        });
                    }
                }
                violations.push(ViolationEntry {
                    rule_id,
                    option_key: verdict.rule.option.to_string(),
                    kind: verdict.kind,
                    verdict: verdict.verdict,
                    detail: verdict.detail,
                });
            }
        }

        Ok(Assembly {
            config: AssembledConfig {
                modules: tree,
                violations,
            },
            touched,
            selection,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
