//! # Predicate Evaluator
//!
//! The restricted condition language shared by `validation` rules and
//! transition guards.
//!
//! A predicate is a small tagged-variant AST:
//! - `literal`, `included`, `equals`, `in_set` (leaves)
//! - `and`, `or`, `not` (combinators)
//!
//! Evaluation is a pure recursive interpretation over a `Selection`:
//! - No side effects, no external calls, no scripting
//! - Recursion depth is bounded (`MAX_PREDICATE_DEPTH` by default)
//! - Failures are values (`EvalError`), never panics

use crate::primitives::MAX_PREDICATE_DEPTH;
use crate::types::{KeelError, ModuleKey, OptionId, OptionValue, validate_key};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// OPTION REFERENCES
// =============================================================================

/// A reference to an option by key, as written in rule payloads and guards.
///
/// Textual form: `"hdr"` (an option of the evaluating module) or
/// `"video:hdr"` (an option of another module).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OptionRef {
    pub module: Option<ModuleKey>,
    pub key: String,
}

impl OptionRef {
    /// Reference an option of the evaluating module.
    #[must_use]
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            module: None,
            key: key.into(),
        }
    }

    /// Reference an option of a specific module.
    #[must_use]
    pub fn qualified(module: impl Into<ModuleKey>, key: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            key: key.into(),
        }
    }

    /// The module this reference resolves in, given the evaluating module.
    #[must_use]
    pub fn module_or<'a>(&'a self, scope: &'a ModuleKey) -> &'a ModuleKey {
        self.module.as_ref().unwrap_or(scope)
    }
}

impl fmt::Display for OptionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}:{}", module, self.key),
            None => f.write_str(&self.key),
        }
    }
}

impl FromStr for OptionRef {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((module, key)) => {
                validate_key("module", module)?;
                validate_key("option", key)?;
                Ok(Self::qualified(module, key))
            }
            None => {
                validate_key("option", s)?;
                Ok(Self::local(s))
            }
        }
    }
}

impl TryFrom<String> for OptionRef {
    type Error = KeelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<OptionRef> for String {
    fn from(r: OptionRef) -> Self {
        r.to_string()
    }
}

// =============================================================================
// SELECTION
// =============================================================================

/// The selection state of one option: inclusion plus effective value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selected {
    pub included: bool,
    pub value: OptionValue,
}

impl Selected {
    #[must_use]
    pub fn new(included: bool, value: OptionValue) -> Self {
        Self { included, value }
    }
}

/// Read-only view of a selection set, consumed by rule and guard evaluation.
pub trait Selection {
    /// Selection of an option by full identity.
    fn get(&self, option: &OptionId) -> Option<&Selected>;

    /// Selection of an option by key within a module.
    fn resolve(&self, module: &ModuleKey, key: &str) -> Option<&Selected>;
}

/// The assembler's selection set.
///
/// When several groups of a module declare the same option key, `resolve`
/// returns the first one inserted; the assembler inserts in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionMap {
    entries: BTreeMap<OptionId, Selected>,
    index: BTreeMap<(ModuleKey, String), OptionId>,
}

impl SelectionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the selection of an option.
    pub fn insert(&mut self, option: OptionId, selected: Selected) {
        self.index
            .entry((option.module.clone(), option.option.clone()))
            .or_insert_with(|| option.clone());
        self.entries.insert(option, selected);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All selections in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&OptionId, &Selected)> {
        self.entries.iter()
    }
}

impl Selection for SelectionMap {
    fn get(&self, option: &OptionId) -> Option<&Selected> {
        self.entries.get(option)
    }

    fn resolve(&self, module: &ModuleKey, key: &str) -> Option<&Selected> {
        let id = self.index.get(&(module.clone(), key.to_string()))?;
        self.entries.get(id)
    }
}

// =============================================================================
// PREDICATE AST
// =============================================================================

/// Why a predicate could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unresolved option reference '{0}'")]
    Unresolved(OptionRef),

    #[error("predicate nesting exceeds depth limit {0}")]
    DepthExceeded(usize),
}

/// A side-effect-free condition over option inclusion and values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Literal { value: bool },
    /// The option is included.
    Included { option: OptionRef },
    /// The option's effective value equals `value` (inclusion not checked).
    Equals { option: OptionRef, value: OptionValue },
    /// The option's effective value is one of `values`.
    InSet {
        option: OptionRef,
        values: Vec<OptionValue>,
    },
    /// True when every branch holds; `and([])` is true.
    And { all: Vec<Predicate> },
    /// True when any branch holds; `or([])` is false.
    Or { any: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    #[must_use]
    pub fn always() -> Self {
        Self::Literal { value: true }
    }

    #[must_use]
    pub fn never() -> Self {
        Self::Literal { value: false }
    }

    #[must_use]
    pub fn included(option: OptionRef) -> Self {
        Self::Included { option }
    }

    #[must_use]
    pub fn equals(option: OptionRef, value: OptionValue) -> Self {
        Self::Equals { option, value }
    }

    #[must_use]
    pub fn in_set(option: OptionRef, values: Vec<OptionValue>) -> Self {
        Self::InSet { option, values }
    }

    #[must_use]
    pub fn all(all: Vec<Predicate>) -> Self {
        Self::And { all }
    }

    #[must_use]
    pub fn any(any: Vec<Predicate>) -> Self {
        Self::Or { any }
    }

    #[must_use]
    pub fn negate(predicate: Predicate) -> Self {
        Self::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Evaluate with the default depth bound.
    ///
    /// `scope` is the module that unqualified references resolve in.
    pub fn evaluate<S: Selection + ?Sized>(
        &self,
        scope: &ModuleKey,
        selection: &S,
    ) -> Result<bool, EvalError> {
        self.evaluate_bounded(scope, selection, MAX_PREDICATE_DEPTH)
    }

    /// Evaluate with an explicit depth bound.
    pub fn evaluate_bounded<S: Selection + ?Sized>(
        &self,
        scope: &ModuleKey,
        selection: &S,
        max_depth: usize,
    ) -> Result<bool, EvalError> {
        self.eval_at(scope, selection, 1, max_depth)
    }

    fn eval_at<S: Selection + ?Sized>(
        &self,
        scope: &ModuleKey,
        selection: &S,
        depth: usize,
        max_depth: usize,
    ) -> Result<bool, EvalError> {
        if depth > max_depth {
            return Err(EvalError::DepthExceeded(max_depth));
        }

        let lookup = |option: &OptionRef| {
            selection
                .resolve(option.module_or(scope), &option.key)
                .ok_or_else(|| EvalError::Unresolved(option.clone()))
        };

        match self {
            Self::Literal { value } => Ok(*value),
            Self::Included { option } => Ok(lookup(option)?.included),
            Self::Equals { option, value } => Ok(lookup(option)?.value == *value),
            Self::InSet { option, values } => {
                let selected = lookup(option)?;
                Ok(values.contains(&selected.value))
            }
            Self::And { all } => {
                for p in all {
                    if !p.eval_at(scope, selection, depth + 1, max_depth)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or { any } => {
                for p in any {
                    if p.eval_at(scope, selection, depth + 1, max_depth)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { predicate } => {
                Ok(!predicate.eval_at(scope, selection, depth + 1, max_depth)?)
            }
        }
    }

    /// Every option reference in the predicate, in declaration order.
    ///
    /// Walks with an explicit stack, so arbitrarily nested input is safe.
    #[must_use]
    pub fn references(&self) -> Vec<&OptionRef> {
        let mut refs = Vec::new();
        let mut stack = vec![self];
        while let Some(p) = stack.pop() {
            match p {
                Self::Literal { .. } => {}
                Self::Included { option }
                | Self::Equals { option, .. }
                | Self::InSet { option, .. } => refs.push(option),
                Self::And { all: children } | Self::Or { any: children } => {
                    stack.extend(children.iter().rev());
                }
                Self::Not { predicate } => stack.push(predicate),
            }
        }
        refs
    }

    /// Nesting depth of the predicate (a leaf has depth 1).
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 1usize)];
        while let Some((p, d)) = stack.pop() {
            max = max.max(d);
            match p {
                Self::And { all: children } | Self::Or { any: children } => {
                    stack.extend(children.iter().map(|c| (c, d + 1)));
                }
                Self::Not { predicate } => stack.push((predicate, d + 1)),
                _ => {}
            }
        }
        max
    }
}

// =============================================================================
// TESTS
// =============================================================================
