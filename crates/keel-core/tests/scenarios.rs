//! # Scenario Tier Tests (S0-S3)
//!
//! End-to-end behavior through the public `Engine` API.
//!
//! ## Tiers
//! - S0: Assembly scenarios (defaults, project overrides, violations, gating)
//! - S1: Cascade completeness
//! - S2: Cache coherence
//! - S3: Change notifications

use keel_core::{
    ConfigOption, Engine, EngineConfig, Entity, EntityKind, EntityRef, ExcludeReason, Group,
    GroupId, KeelError, Module, ModuleKey, Mutation, MutationAction, OptionId, OptionRef,
    Predicate, Project, ProjectKey, ProjectOption, ProjectOptionId, Requirement, Rule,
    RuleCondition, RuleId, State, StateId, Transition, TransitionId, Verdict,
};
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// FIXTURES
// =============================================================================

fn create(engine: &Engine, entity: Entity) {
    engine
        .apply_mutation(Mutation::create(entity))
        .expect("create");
}

fn h264() -> OptionId {
    OptionId::new("video", "decoder", "h264")
}

fn hdr() -> OptionId {
    OptionId::new("video", "decoder", "hdr")
}

fn video() -> BTreeSet<ModuleKey> {
    BTreeSet::from([ModuleKey::new("video")])
}

fn demo() -> ProjectKey {
    ProjectKey::new("demo")
}

/// Module `video`, group `decoder`, options `h264` (included) and `hdr`
/// (excluded, editable), rule `requires(hdr -> h264)`, project `demo`.
fn video_engine() -> Engine {
    let engine = Engine::new();
    create(&engine, Entity::Module(Module::new("video", "Video")));
    create(
        &engine,
        Entity::Group(Group::new(GroupId::new("video", "decoder"), "Decoder")),
    );
    create(
        &engine,
        Entity::Option(ConfigOption::boolean(h264(), "H.264", true)),
    );
    create(
        &engine,
        Entity::Option(
            ConfigOption::boolean(hdr(), "HDR", false)
                .with_position(1)
                .editable(),
        ),
    );
    create(
        &engine,
        Entity::Rule(Rule::new(
            RuleId::new(hdr(), "needs-h264"),
            RuleCondition::Requires {
                targets: vec![Requirement::included(OptionRef::local("h264"))],
            },
        )),
    );
    create(&engine, Entity::Project(Project::new("demo", "Demo")));
    engine
}

/// Adds states `idle` / `active` (gating `hdr`) and `idle --ENABLE--> active`.
fn with_state_machine(engine: &Engine) {
    engine
        .apply_mutation(Mutation::update(Entity::Module(
            Module::new("video", "Video").with_initial_state("idle"),
        )))
        .expect("initial state");
    create(
        engine,
        Entity::State(State::new(StateId::new("video", "idle"))),
    );
    create(
        engine,
        Entity::State(State::new(StateId::new("video", "active")).enabling(["hdr"])),
    );
    create(
        engine,
        Entity::Transition(
            Transition::new(TransitionId::new("video", "idle", "ENABLE"), "active")
                .guarded(Predicate::always()),
        ),
    );
}

fn override_option(engine: &Engine, option: OptionId, included: bool) {
    let po = ProjectOption::new(ProjectOptionId::new("demo", option), included);
    engine
        .apply_mutation(Mutation::create(Entity::ProjectOption(po)))
        .expect("project option");
}

fn find<'a>(config: &'a keel_core::AssembledConfig, key: &str) -> &'a keel_core::AssembledOption {
    config
        .modules
        .iter()
        .flat_map(|m| &m.groups)
        .flat_map(|g| &g.options)
        .find(|o| o.key == key)
        .expect("option in tree")
}

// =============================================================================
// TIER S0: ASSEMBLY SCENARIOS
// =============================================================================

mod s0_assembly {
    use super::*;

    /// S0.1: Excluded owner never fires its rule; override includes it.
    #[test]
    fn project_override_satisfies_requires() {
        let engine = video_engine();

        let base = engine.assemble(&video(), None).expect("assemble");
        assert!(!find(&base, "hdr").included);
        assert!(base.violations.is_empty());

        override_option(&engine, hdr(), true);
        let config = engine.assemble(&video(), Some(&demo())).expect("assemble");
        assert!(find(&config, "hdr").included);
        assert!(find(&config, "h264").included);
        assert!(config.violations.is_empty());
    }

    /// S0.2: Violated rule keeps the option in the tree with a warning.
    #[test]
    fn violated_requires_is_reported_not_removed() {
        let engine = video_engine();
        override_option(&engine, hdr(), true);
        override_option(&engine, h264(), false);

        let config = engine.assemble(&video(), Some(&demo())).expect("assemble");
        let hdr = find(&config, "hdr");
        assert!(hdr.included);
        assert_eq!(hdr.warnings.len(), 1);
        assert_eq!(hdr.warnings[0].verdict, Verdict::Violated);
        assert_eq!(config.violations.len(), 1);
        assert_eq!(config.violations[0].option_key, "video/decoder/hdr");
    }

    /// S0.3: Gating follows the current state, and firing ungates.
    #[test]
    fn state_gating_and_fire() {
        let engine = video_engine();
        with_state_machine(&engine);
        override_option(&engine, hdr(), true);

        let idle = engine.assemble(&video(), Some(&demo())).expect("assemble");
        let gated = find(&idle, "hdr");
        assert_eq!(gated.exclude_reason, Some(ExcludeReason::StateGated));
        assert!(!gated.included);

        let outcome = engine
            .fire_event(&ModuleKey::new("video"), "ENABLE", Some(&demo()))
            .expect("fire");
        assert_eq!(outcome.to, "active");

        let active = engine.assemble(&video(), Some(&demo())).expect("assemble");
        let open = find(&active, "hdr");
        assert_eq!(open.exclude_reason, None);
        assert!(open.included);
        assert_eq!(active.modules[0].current_state.as_deref(), Some("active"));
    }

    /// S0.4: Firing an event with no edge fails and changes nothing.
    #[test]
    fn fire_without_edge_is_rejected() {
        let engine = video_engine();
        with_state_machine(&engine);
        let revision = engine.revision();
        let result = engine.fire_event(&ModuleKey::new("video"), "DISABLE", None);
        assert!(matches!(result, Err(KeelError::NoSuchTransition { .. })));
        assert_eq!(engine.revision(), revision);
    }

    /// S0.5: Cross-module reference outside the requested set is indeterminate.
    #[test]
    fn cross_module_reference_is_indeterminate() {
        let engine = video_engine();
        create(
            &engine,
            Entity::Rule(Rule::new(
                RuleId::new(h264(), "audio-codec"),
                RuleCondition::Forbidden {
                    targets: vec![OptionRef::qualified("audio", "aac")],
                },
            )),
        );
        let config = engine.assemble(&video(), None).expect("assemble");
        assert_eq!(config.violations.len(), 1);
        assert_eq!(config.violations[0].verdict, Verdict::Indeterminate);
    }

    /// S0.6: Unknown module in the request is NotFound.
    #[test]
    fn unknown_module_is_not_found() {
        let engine = video_engine();
        let modules = BTreeSet::from([ModuleKey::new("video"), ModuleKey::new("audio")]);
        assert!(matches!(
            engine.assemble(&modules, None),
            Err(KeelError::NotFound(_))
        ));
    }

    /// S0.7: Identical inputs produce identical output.
    #[test]
    fn assembly_is_deterministic() {
        let a = video_engine();
        let b = video_engine();
        let ca = a.assemble(&video(), None).expect("a");
        let cb = b.assemble(&video(), None).expect("b");
        assert_eq!(
            keel_core::canonical_bytes(&ca).expect("bytes"),
            keel_core::canonical_bytes(&cb).expect("bytes")
        );
    }
}

// =============================================================================
// TIER S1: CASCADE COMPLETENESS
// =============================================================================

mod s1_cascade {
    use super::*;

    /// S1.1: Deleting a group removes options, rules and project overrides.
    #[test]
    fn group_delete_cascades() {
        let engine = video_engine();
        override_option(&engine, hdr(), true);

        let scope = engine
            .apply_mutation(Mutation::delete(EntityRef::Group(GroupId::new(
                "video", "decoder",
            ))))
            .expect("delete");

        let kinds: BTreeSet<EntityKind> = scope.changes.iter().map(|c| c.entity.kind()).collect();
        assert!(kinds.contains(&EntityKind::Option));
        assert!(kinds.contains(&EntityKind::Rule));
        assert!(kinds.contains(&EntityKind::ProjectOption));
        assert!(scope.changes.iter().all(|c| c.action == MutationAction::Delete));

        engine.read(|c| {
            assert!(c.option(&hdr()).is_none());
            assert!(c.rules_of(&hdr()).is_empty());
            assert!(c.project_options_of(&demo()).is_empty());
        });

        let config = engine.assemble(&video(), Some(&demo())).expect("assemble");
        assert!(config.modules[0].groups.is_empty());
        assert!(config.violations.is_empty());
    }

    /// S1.4: Deleting a module evicts its cached trees and hides it.
    #[test]
    fn module_delete_evicts_and_hides() {
        let engine = video_engine();
        override_option(&engine, hdr(), true);
        engine.assemble(&video(), None).expect("assemble");
        engine.assemble(&video(), Some(&demo())).expect("assemble");
        assert_eq!(engine.cached_entries(), 2);

        let scope = engine
            .apply_mutation(Mutation::delete(EntityRef::Module(ModuleKey::new("video"))))
            .expect("delete");
        assert!(scope.changes.iter().any(|c| c.entity.kind() == EntityKind::ProjectOption));
        assert_eq!(engine.cached_entries(), 0);

        assert!(matches!(
            engine.assemble(&video(), None),
            Err(KeelError::NotFound(_))
        ));
        assert!(matches!(
            engine.assemble(&video(), Some(&demo())),
            Err(KeelError::NotFound(_))
        ));
        assert_eq!(engine.cached_entries(), 0);
        engine.read(|c| {
            assert!(c.option(&h264()).is_none());
            assert!(c.project_options_of(&demo()).is_empty());
        });
    }

    /// S1.2: Deleting a project removes only its overrides.
    #[test]
    fn project_delete_cascades() {
        let engine = video_engine();
        override_option(&engine, hdr(), true);
        let scope = engine
            .apply_mutation(Mutation::delete(EntityRef::Project(demo())))
            .expect("delete");
        assert_eq!(scope.changes.len(), 2);
        assert!(scope.modules.contains(&ModuleKey::new("video")));
        engine.read(|c| assert!(c.option(&hdr()).is_some()));
    }

    /// S1.3: Dangling references are rejected and nothing is committed.
    #[test]
    fn dangling_reference_rejected() {
        let engine = video_engine();
        let revision = engine.revision();
        let po = ProjectOption::new(
            ProjectOptionId::new("demo", OptionId::new("video", "decoder", "av1")),
            true,
        );
        let result = engine.apply_mutation(Mutation::create(Entity::ProjectOption(po)));
        assert!(matches!(result, Err(KeelError::DanglingReference { .. })));
        assert_eq!(engine.revision(), revision);
    }
}

// =============================================================================
// TIER S2: CACHE COHERENCE
// =============================================================================

mod s2_cache {
    use super::*;
    use std::thread;

    /// S2.1: An unaffected key stays cached across a mutation elsewhere.
    #[test]
    fn unrelated_mutation_keeps_entry() {
        let engine = video_engine();
        create(&engine, Entity::Module(Module::new("audio", "Audio")));
        let audio = BTreeSet::from([ModuleKey::new("audio")]);

        let before = engine.assemble(&audio, None).expect("audio");
        override_option(&engine, hdr(), true);
        let after = engine.assemble(&audio, None).expect("audio");
        assert!(Arc::ptr_eq(&before, &after));
    }

    /// S2.2: Read-after-write: a mutation is always visible to the next read.
    #[test]
    fn read_after_write() {
        let engine = video_engine();
        let cached = engine.assemble(&video(), Some(&demo())).expect("assemble");
        assert!(!find(&cached, "hdr").included);

        override_option(&engine, hdr(), true);
        let fresh = engine.assemble(&video(), Some(&demo())).expect("assemble");
        assert!(find(&fresh, "hdr").included);
    }

    /// S2.3: A newly created option invalidates the module's entries.
    #[test]
    fn created_option_is_visible() {
        let engine = video_engine();
        engine.assemble(&video(), None).expect("assemble");
        create(
            &engine,
            Entity::Option(ConfigOption::boolean(
                OptionId::new("video", "decoder", "av1"),
                "AV1",
                false,
            )),
        );
        let config = engine.assemble(&video(), None).expect("assemble");
        assert_eq!(config.modules[0].groups[0].options.len(), 3);
    }

    /// S2.4: Concurrent readers and writers on disjoint modules stay coherent.
    #[test]
    fn concurrent_assemble_and_mutate() {
        let engine = Arc::new(video_engine());
        create(&engine, Entity::Module(Module::new("audio", "Audio")));

        let writer = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..20 {
                    let group = Group::new(GroupId::new("audio", format!("g{}", i)), "G");
                    engine
                        .apply_mutation(Mutation::create(Entity::Group(group)))
                        .expect("create group");
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..20 {
                        engine.assemble(&video(), None).expect("assemble");
                    }
                })
            })
            .collect();

        writer.join().expect("writer");
        for r in readers {
            r.join().expect("reader");
        }

        let audio = BTreeSet::from([ModuleKey::new("audio")]);
        let config = engine.assemble(&audio, None).expect("assemble");
        assert_eq!(config.modules[0].groups.len(), 20);
    }
}

// =============================================================================
// TIER S3: CHANGE NOTIFICATIONS
// =============================================================================

mod s3_notifications {
    use super::*;

    /// S3.1: One notification per affected module, in commit order.
    #[test]
    fn notifications_in_commit_order() {
        let engine = video_engine();
        let mut stream = engine.subscribe_changes();

        override_option(&engine, hdr(), true);
        engine
            .apply_mutation(Mutation::delete(EntityRef::Option(hdr())))
            .expect("delete");

        let first = stream.try_next().expect("first");
        assert_eq!(first.entity_type, EntityKind::ProjectOption);
        assert_eq!(first.action, MutationAction::Create);
        let second = stream.try_next().expect("second");
        assert_eq!(second.action, MutationAction::Delete);
        assert_eq!(second.identity, "video/decoder/hdr");
        assert!(second.revision > first.revision);
        assert!(stream.try_next().is_none());
    }

    /// S3.2: Project-only mutations notify no module.
    #[test]
    fn project_only_mutation_is_silent() {
        let engine = video_engine();
        let mut stream = engine.subscribe_changes();
        create(&engine, Entity::Project(Project::new("other", "Other")));
        assert!(stream.try_next().is_none());
    }

    /// S3.3: Async subscribers receive the same stream.
    #[tokio::test]
    async fn async_subscriber_receives() {
        let engine = Engine::with_config(EngineConfig {
            notification_capacity: 8,
            ..EngineConfig::default()
        });
        let mut stream = engine.subscribe_changes();
        create(&engine, Entity::Module(Module::new("video", "Video")));
        let n = stream.next().await.expect("notification");
        assert_eq!(n.module, ModuleKey::new("video"));
        assert_eq!(n.revision, 1);
    }
}
