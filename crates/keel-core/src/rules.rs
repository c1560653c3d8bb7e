//! # Rule Evaluator
//!
//! Computes one verdict per dependency rule against a selection set.
//!
//! The evaluator is pure: it never mutates the selection and returns the
//! same verdicts for the same input, in input order.

use crate::predicate::{EvalError, Selection};
use crate::primitives::MAX_PREDICATE_DEPTH;
use crate::types::{Rule, RuleCondition, RuleId, RuleKind};
use serde::{Deserialize, Serialize};

/// Outcome of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Satisfied,
    Violated,
    /// The rule could not be decided (unresolved reference, depth overflow).
    Indeterminate,
}

/// Verdict of one rule with a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVerdict {
    pub rule: RuleId,
    pub kind: RuleKind,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RuleVerdict {
    fn new(rule: &Rule, verdict: Verdict, detail: Option<String>) -> Self {
        Self {
            rule: rule.id.clone(),
            kind: rule.kind(),
            verdict,
            detail,
        }
    }
}

/// Rule evaluation engine.
#[derive(Debug, Clone, Copy)]
pub struct RuleEvaluator {
    max_depth: usize,
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new(MAX_PREDICATE_DEPTH)
    }
}

impl RuleEvaluator {
    /// Create an evaluator with a predicate depth bound.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Evaluate rules in order.
    pub fn evaluate<S: Selection + ?Sized>(
        &self,
        rules: &[&Rule],
        selection: &S,
    ) -> Vec<RuleVerdict> {
        rules
            .iter()
            .map(|rule| self.evaluate_rule(rule, selection))
            .collect()
    }

    /// Evaluate a single rule.
    ///
    /// Unresolved references are checked first, so a broken rule is always
    /// `indeterminate`, even when its owner is excluded.
    pub fn evaluate_rule<S: Selection + ?Sized>(&self, rule: &Rule, selection: &S) -> RuleVerdict {
        let scope = &rule.id.option.module;

        if let Some(missing) = rule
            .condition
            .references()
            .into_iter()
            .find(|r| selection.resolve(r.module_or(scope), &r.key).is_none())
        {
            let err = EvalError::Unresolved(missing.clone());
            return RuleVerdict::new(rule, Verdict::Indeterminate, Some(err.to_string()));
        }

        let Some(owner) = selection.get(&rule.id.option) else {
            return RuleVerdict::new(
                rule,
                Verdict::Indeterminate,
                Some(format!("owner option '{}' is not selected", rule.id.option)),
            );
        };

        // Rules only constrain included owners.
        if !owner.included {
            return RuleVerdict::new(rule, Verdict::Satisfied, None);
        }

        match &rule.condition {
            RuleCondition::Requires { targets } => {
                for target in targets {
                    let module = target.option.module_or(scope);
                    let Some(selected) = selection.resolve(module, &target.option.key) else {
                        continue;
                    };
                    if !selected.included {
                        return RuleVerdict::new(
                            rule,
                            Verdict::Violated,
                            Some(format!("requires '{}' to be included", target.option)),
                        );
                    }
                    if let Some(required) = &target.value {
                        if selected.value != *required {
                            return RuleVerdict::new(
                                rule,
                                Verdict::Violated,
                                Some(format!(
                                    "requires '{}' = {}, found {}",
                                    target.option, required, selected.value
                                )),
                            );
                        }
                    }
                }
                RuleVerdict::new(rule, Verdict::Satisfied, None)
            }
            RuleCondition::Forbidden { targets } => {
                let conflict = targets.iter().find(|t| {
                    selection
                        .resolve(t.module_or(scope), &t.key)
                        .is_some_and(|s| s.included)
                });
                match conflict {
                    Some(t) => RuleVerdict::new(
                        rule,
                        Verdict::Violated,
                        Some(format!("forbids '{}', which is included", t)),
                    ),
                    None => RuleVerdict::new(rule, Verdict::Satisfied, None),
                }
            }
            RuleCondition::Validation { predicate } => {
                match predicate.evaluate_bounded(scope, selection, self.max_depth) {
                    Ok(true) => RuleVerdict::new(rule, Verdict::Satisfied, None),
                    Ok(false) => RuleVerdict::new(
                        rule,
                        Verdict::Violated,
                        Some("validation predicate is false".to_string()),
                    ),
                    Err(e) => RuleVerdict::new(rule, Verdict::Indeterminate, Some(e.to_string())),
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{OptionRef, Predicate, Selected, SelectionMap};
    use crate::types::{OptionId, OptionValue, Requirement};

    fn hdr_rule(condition: RuleCondition) -> Rule {
        Rule::new(
            RuleId::new(OptionId::new("video", "decoder", "hdr"), "r"),
            condition,
        )
    }

    fn selection(hdr: bool, h264: bool) -> SelectionMap {
        let mut s = SelectionMap::new();
        s.insert(
            OptionId::new("video", "decoder", "h264"),
            Selected::new(h264, OptionValue::Bool(h264)),
        );
        s.insert(
            OptionId::new("video", "decoder", "hdr"),
            Selected::new(hdr, OptionValue::Bool(hdr)),
        );
        s.insert(
            OptionId::new("video", "decoder", "profile"),
            Selected::new(true, OptionValue::Str("main".into())),
        );
        s
    }

    fn requires_h264() -> Rule {
        hdr_rule(RuleCondition::Requires {
            targets: vec![Requirement::included(OptionRef::local("h264"))],
        })
    }

    #[test]
    fn requires_only_fires_for_included_owner() {
        let eval = RuleEvaluator::default();
        let rule = requires_h264();
        assert_eq!(
            eval.evaluate_rule(&rule, &selection(false, false)).verdict,
            Verdict::Satisfied
        );
        assert_eq!(
            eval.evaluate_rule(&rule, &selection(true, true)).verdict,
            Verdict::Satisfied
        );
        let v = eval.evaluate_rule(&rule, &selection(true, false));
        assert_eq!(v.verdict, Verdict::Violated);
        assert!(v.detail.is_some());
    }

    #[test]
    fn requires_checks_value() {
        let eval = RuleEvaluator::default();
        let rule = hdr_rule(RuleCondition::Requires {
            targets: vec![Requirement {
                option: OptionRef::local("profile"),
                value: Some(OptionValue::Str("high".into())),
            }],
        });
        assert_eq!(
            eval.evaluate_rule(&rule, &selection(true, true)).verdict,
            Verdict::Violated
        );
    }

    #[test]
    fn forbidden_violated_when_target_included() {
        let eval = RuleEvaluator::default();
        let rule = hdr_rule(RuleCondition::Forbidden {
            targets: vec![OptionRef::local("h264")],
        });
        assert_eq!(
            eval.evaluate_rule(&rule, &selection(true, true)).verdict,
            Verdict::Violated
        );
        assert_eq!(
            eval.evaluate_rule(&rule, &selection(true, false)).verdict,
            Verdict::Satisfied
        );
    }

    #[test]
    fn unresolved_reference_is_indeterminate_even_when_excluded() {
        let eval = RuleEvaluator::default();
        let rule = hdr_rule(RuleCondition::Requires {
            targets: vec![Requirement::included(OptionRef::qualified("audio", "aac"))],
        });
        let v = eval.evaluate_rule(&rule, &selection(false, true));
        assert_eq!(v.verdict, Verdict::Indeterminate);
        assert_eq!(v.kind, RuleKind::Requires);
    }

    #[test]
    fn validation_depth_overflow_is_indeterminate() {
        let mut p = Predicate::included(OptionRef::local("h264"));
        for _ in 0..8 {
            p = Predicate::negate(p);
        }
        let rule = hdr_rule(RuleCondition::Validation { predicate: p });
        let v = RuleEvaluator::new(4).evaluate_rule(&rule, &selection(true, true));
        assert_eq!(v.verdict, Verdict::Indeterminate);
        let v = RuleEvaluator::default().evaluate_rule(&rule, &selection(true, true));
        assert_eq!(v.verdict, Verdict::Satisfied);
    }

    #[test]
    fn evaluate_keeps_input_order_and_selection() {
        let eval = RuleEvaluator::default();
        let a = requires_h264();
        let mut b = hdr_rule(RuleCondition::Validation {
            predicate: Predicate::never(),
        });
        b.id.rule = "b".into();
        let s = selection(true, false);
        let before = s.clone();
        let verdicts = eval.evaluate(&[&b, &a], &s);
        assert_eq!(verdicts[0].rule.rule, "b");
        assert_eq!(verdicts[1].verdict, Verdict::Violated);
        assert_eq!(s, before);
    }
}
