//! # Property-Based Tests
//!
//! Determinism and purity properties of the keel CORE, checked with
//! `proptest` over generated catalogs, selections and predicates.

use keel_core::{
    Assembler, Catalog, ConfigOption, Entity, Group, GroupId, Module, ModuleKey, Mutation,
    OptionId, OptionRef, OptionValue, Predicate, Requirement, Rule, RuleCondition, RuleEvaluator,
    RuleId, Selected, SelectionMap, State, StateId, StateMachine, Transition, TransitionId,
    canonical_bytes,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;

const KEYS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

/// A single-module catalog with one option per key, `requires` rules
/// between them, and optional state gating.
fn build_catalog(
    included: &[bool],
    rules: &[(usize, usize)],
    gated: &[usize],
) -> Catalog {
    let mut c = Catalog::new();
    let mut apply = |e: Entity| {
        c.apply(Mutation::create(e)).expect("create");
    };
    let module = if gated.is_empty() {
        Module::new("m", "M")
    } else {
        Module::new("m", "M").with_initial_state("s0")
    };
    apply(Entity::Module(module));
    apply(Entity::Group(Group::new(GroupId::new("m", "g"), "G")));
    for (i, inc) in included.iter().enumerate() {
        apply(Entity::Option(
            ConfigOption::boolean(OptionId::new("m", "g", KEYS[i]), KEYS[i], *inc)
                .with_position(i as u32),
        ));
    }
    for (n, (owner, target)) in rules.iter().enumerate() {
        if *owner >= included.len() || *target >= included.len() {
            continue;
        }
        apply(Entity::Rule(Rule::new(
            RuleId::new(OptionId::new("m", "g", KEYS[*owner]), format!("r{}", n)),
            RuleCondition::Requires {
                targets: vec![Requirement::included(OptionRef::local(KEYS[*target]))],
            },
        )));
    }
    if !gated.is_empty() {
        let enables: BTreeSet<&str> = gated
            .iter()
            .filter(|i| **i < included.len())
            .map(|i| KEYS[*i])
            .collect();
        apply(Entity::State(State::new(StateId::new("m", "s0"))));
        apply(Entity::State(
            State::new(StateId::new("m", "s1")).enabling(enables),
        ));
    }
    c
}

fn selection(flags: &[bool]) -> SelectionMap {
    let mut s = SelectionMap::new();
    for (i, f) in flags.iter().enumerate() {
        s.insert(
            OptionId::new("m", "g", KEYS[i]),
            Selected::new(*f, OptionValue::Bool(*f)),
        );
    }
    s
}

fn arb_predicate() -> impl Strategy<Value = Predicate> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(|value| Predicate::Literal { value }),
        (0..KEYS.len()).prop_map(|i| Predicate::included(OptionRef::local(KEYS[i]))),
        (0..KEYS.len(), any::<bool>())
            .prop_map(|(i, b)| Predicate::equals(OptionRef::local(KEYS[i]), OptionValue::Bool(b))),
    ];
    leaf.prop_recursive(6, 48, 4, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..4).prop_map(Predicate::all),
            vec(inner.clone(), 0..4).prop_map(Predicate::any),
            inner.prop_map(Predicate::negate),
        ]
    })
}

fn modules() -> BTreeSet<ModuleKey> {
    BTreeSet::from([ModuleKey::new("m")])
}

proptest! {
    /// Same catalog, same request: byte-identical output.
    #[test]
    fn assembly_is_deterministic(
        included in vec(any::<bool>(), 1..6),
        rules in vec((0usize..6, 0usize..6), 0..8),
        gated in vec(0usize..6, 0..3),
    ) {
        let c1 = build_catalog(&included, &rules, &gated);
        let c2 = build_catalog(&included, &rules, &gated);
        let a1 = Assembler::default().assemble(&c1, &modules(), None).expect("a1");
        let a2 = Assembler::default().assemble(&c2, &modules(), None).expect("a2");
        prop_assert_eq!(
            canonical_bytes(&a1.config).expect("bytes"),
            canonical_bytes(&a2.config).expect("bytes")
        );
    }

    /// Rule evaluation never mutates the selection and is repeatable.
    #[test]
    fn rule_evaluation_is_pure(
        flags in vec(any::<bool>(), 6),
        predicate in arb_predicate(),
    ) {
        let s = selection(&flags);
        let before = s.clone();
        let rule = Rule::new(
            RuleId::new(OptionId::new("m", "g", "a"), "p"),
            RuleCondition::Validation { predicate },
        );
        let eval = RuleEvaluator::default();
        let first = eval.evaluate(&[&rule], &s);
        let second = eval.evaluate(&[&rule], &s);
        prop_assert_eq!(first, second);
        prop_assert_eq!(s, before);
    }

    /// Predicates within the depth bound always evaluate to a value.
    #[test]
    fn bounded_predicates_evaluate(
        flags in vec(any::<bool>(), 6),
        predicate in arb_predicate(),
    ) {
        let s = selection(&flags);
        let result = predicate.evaluate_bounded(&ModuleKey::new("m"), &s, predicate.depth());
        prop_assert!(result.is_ok());
    }

    /// Same snapshot, same state, same event and selection: same outcome.
    #[test]
    fn firing_is_deterministic(
        included in vec(any::<bool>(), 1..6),
        gated in vec(0usize..6, 1..4),
        flags in vec(any::<bool>(), 6),
        guard in arb_predicate(),
    ) {
        let m = ModuleKey::new("m");
        let transition = Transition::new(TransitionId::new("m", "s0", "GO"), "s1")
            .guarded(guard);
        let mut first = build_catalog(&included, &[], &gated);
        first
            .apply(Mutation::create(Entity::Transition(transition)))
            .expect("transition");
        let second = Catalog::from_snapshot(first.to_snapshot()).expect("restore");

        let sm = StateMachine::default();
        let s = selection(&flags);
        let mut outcomes = Vec::new();
        for c in [&first, &second] {
            let options = c.options_in_module(&m);
            let compiled = sm
                .compile(
                    &m,
                    &c.states_of(&m),
                    &c.transitions_of(&m),
                    options.iter().map(|o| o.id.option.as_str()),
                )
                .expect("compile");
            for _ in 0..2 {
                let outcome = sm
                    .fire(&compiled, "s0", "GO", &s)
                    .and_then(|to| Ok((sm.reachable_options(&compiled, &to)?, to)))
                    .map_err(|e| e.to_string());
                outcomes.push(outcome);
            }
        }
        prop_assert!(outcomes.windows(2).all(|w| w[0] == w[1]), "{:?}", outcomes);

        let a1 = Assembler::default().assemble(&first, &modules(), None).expect("a1");
        let a2 = Assembler::default().assemble(&second, &modules(), None).expect("a2");
        prop_assert_eq!(a1.config, a2.config);
    }

    /// A snapshot restores an equivalent catalog.
    #[test]
    fn snapshot_restores_catalog(
        included in vec(any::<bool>(), 1..6),
        rules in vec((0usize..6, 0usize..6), 0..8),
    ) {
        let c = build_catalog(&included, &rules, &[]);
        let restored = Catalog::from_snapshot(c.to_snapshot()).expect("restore");
        prop_assert_eq!(restored.to_snapshot(), c.to_snapshot());
    }
}
