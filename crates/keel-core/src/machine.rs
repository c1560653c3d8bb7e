//! # State Machine Engine
//!
//! Compiles a module's States and Transitions into a transition table, fires
//! events against it and computes which options a state makes reachable.
//!
//! - `(from, event)` has at most one edge; there are no implicit transitions
//! - A guard that is false or cannot be evaluated rejects the event
//! - An option key listed in no state's `enables` is reachable everywhere

use crate::predicate::{Predicate, Selection};
use crate::primitives::MAX_PREDICATE_DEPTH;
use crate::types::{KeelError, ModuleKey, State, Transition};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    to: String,
    guard: Option<Predicate>,
}

/// A validated transition table for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMachine {
    module: ModuleKey,
    /// state -> option keys it enables
    states: BTreeMap<String, BTreeSet<String>>,
    /// from -> event -> edge
    edges: BTreeMap<String, BTreeMap<String, Edge>>,
    option_keys: BTreeSet<String>,
    /// Keys enabled by at least one state.
    gated: BTreeSet<String>,
}

/// State machine engine.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    max_depth: usize,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(MAX_PREDICATE_DEPTH)
    }
}

impl StateMachine {
    /// Create an engine whose guards evaluate with the given depth bound.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Build the transition table of a module.
    ///
    /// `option_keys` are the keys of the module's options; reachability is
    /// computed over them.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when a transition names an undeclared state.
    pub fn compile<'a>(
        &self,
        module: &ModuleKey,
        states: &[&State],
        transitions: &[&Transition],
        option_keys: impl IntoIterator<Item = &'a str>,
    ) -> Result<CompiledMachine, KeelError> {
        let states: BTreeMap<String, BTreeSet<String>> = states
            .iter()
            .map(|s| (s.id.state.clone(), s.enables.clone()))
            .collect();

        let mut edges: BTreeMap<String, BTreeMap<String, Edge>> = BTreeMap::new();
        for t in transitions {
            for state in [&t.id.from, &t.to] {
                if !states.contains_key(state) {
                    return Err(KeelError::InvalidTransition {
                        module: module.to_string(),
                        transition: t.id.to_string(),
                        state: state.clone(),
                    });
                }
            }
            edges.entry(t.id.from.clone()).or_default().insert(
                t.id.event.clone(),
                Edge {
                    to: t.to.clone(),
                    guard: t.guard.clone(),
                },
            );
        }

        let gated = states.values().flatten().cloned().collect();

        Ok(CompiledMachine {
            module: module.clone(),
            states,
            edges,
            option_keys: option_keys.into_iter().map(str::to_string).collect(),
            gated,
        })
    }

    /// Fire `event` in state `current` and return the destination state.
    ///
    /// # Errors
    ///
    /// - `NoSuchTransition` when `(current, event)` has no edge
    /// - `GuardRejected` when the guard is false or cannot be evaluated
    pub fn fire<S: Selection + ?Sized>(
        &self,
        machine: &CompiledMachine,
        current: &str,
        event: &str,
        selection: &S,
    ) -> Result<String, KeelError> {
        let edge = machine
            .edges
            .get(current)
            .and_then(|events| events.get(event))
            .ok_or_else(|| KeelError::NoSuchTransition {
                state: current.to_string(),
                event: event.to_string(),
            })?;

        let Some(guard) = &edge.guard else {
            return Ok(edge.to.clone());
        };

        let rejected = |reason: String| KeelError::GuardRejected {
            state: current.to_string(),
            event: event.to_string(),
            reason,
        };
        match guard.evaluate_bounded(&machine.module, selection, self.max_depth) {
            Ok(true) => Ok(edge.to.clone()),
            Ok(false) => Err(rejected("guard evaluated to false".to_string())),
            Err(e) => Err(rejected(e.to_string())),
        }
    }

    /// Option keys reachable in `state`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the state is not declared.
    pub fn reachable_options(
        &self,
        machine: &CompiledMachine,
        state: &str,
    ) -> Result<BTreeSet<String>, KeelError> {
        let enabled = machine.states.get(state).ok_or_else(|| {
            KeelError::NotFound(format!("state '{}' of module {}", state, machine.module))
        })?;
        Ok(machine
            .option_keys
            .iter()
            .filter(|k| !machine.gated.contains(*k) || enabled.contains(*k))
            .cloned()
            .collect())
    }

    /// Events that have an edge out of `state`, sorted.
    #[must_use]
    pub fn events_from(&self, machine: &CompiledMachine, state: &str) -> Vec<String> {
        machine
            .edges
            .get(state)
            .map(|events| events.keys().cloned().collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// TESTS
// =============================================================================
