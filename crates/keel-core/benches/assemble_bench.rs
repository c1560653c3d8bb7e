//! # Assembly Benchmarks
//!
//! Performance benchmarks for keel-core assembly and caching.
//!
//! Run with: `cargo bench -p keel-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use keel_core::{
    Assembler, Catalog, ConfigOption, Engine, EngineConfig, Entity, Group, GroupId, Module,
    ModuleKey, Mutation, OptionId, OptionRef, Requirement, Rule, RuleCondition, RuleId,
};
use std::collections::BTreeSet;
use std::hint::black_box;

/// A catalog with `modules` modules of 4 groups x 8 options, each option
/// requiring its predecessor.
fn create_catalog(modules: usize) -> Catalog {
    let mut c = Catalog::new();
    for m in 0..modules {
        let module = format!("m{}", m);
        c.apply(Mutation::create(Entity::Module(
            Module::new(module.as_str(), "Module").with_position(m as u32),
        )))
        .expect("module");
        for g in 0..4 {
            let group = format!("g{}", g);
            c.apply(Mutation::create(Entity::Group(Group::new(
                GroupId::new(module.as_str(), group.as_str()),
                "Group",
            ))))
            .expect("group");
            for o in 0..8 {
                let key = format!("o{}_{}", g, o);
                let id = OptionId::new(module.as_str(), group.as_str(), key.as_str());
                c.apply(Mutation::create(Entity::Option(ConfigOption::boolean(
                    id.clone(),
                    "Option",
                    o % 2 == 0,
                ))))
                .expect("option");
                if o > 0 {
                    let target = format!("o{}_{}", g, o - 1);
                    c.apply(Mutation::create(Entity::Rule(Rule::new(
                        RuleId::new(id, "prev"),
                        RuleCondition::Requires {
                            targets: vec![Requirement::included(OptionRef::local(target))],
                        },
                    ))))
                    .expect("rule");
                }
            }
        }
    }
    c
}

fn keys(modules: usize) -> BTreeSet<ModuleKey> {
    (0..modules).map(|m| ModuleKey::new(format!("m{}", m))).collect()
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_assemble_uncached(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble_uncached");
    for size in [1, 8, 32] {
        let catalog = create_catalog(size);
        let modules = keys(size);
        let assembler = Assembler::default();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                black_box(
                    assembler
                        .assemble(&catalog, &modules, None)
                        .expect("assemble"),
                )
            });
        });
    }
    group.finish();
}

fn bench_assemble_cached(c: &mut Criterion) {
    let catalog = create_catalog(8);
    let engine =
        Engine::from_snapshot(catalog.to_snapshot(), EngineConfig::default()).expect("engine");
    let modules = keys(8);
    engine.assemble(&modules, None).expect("warm");

    c.bench_function("assemble_cached_8", |b| {
        b.iter(|| black_box(engine.assemble(&modules, None).expect("assemble")));
    });
}

criterion_group!(benches, bench_assemble_uncached, bench_assemble_cached);
criterion_main!(benches);
