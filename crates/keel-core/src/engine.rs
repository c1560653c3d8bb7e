//! # Engine
//!
//! The process-wide keel structure: owns the catalog, the per-key lock table
//! and the invalidation hub, and exposes the external operations.
//!
//! ## Locking
//!
//! Lock order is always: key locks (projects before modules, each set in
//! sorted order) -> catalog -> hub.
//!
//! - `assemble` holds the catalog read lock for one assembly and records the
//!   touched entities before releasing it.
//! - `apply_mutation` commits and evicts under the catalog write lock, then
//!   publishes while still holding its key locks, so notifications of one
//!   module are emitted in commit order.
//! - `fire_event` holds its module lock across read-state, guard evaluation
//!   and commit.

use crate::assembler::{AssembledConfig, Assembler};
use crate::catalog::Catalog;
use crate::formats::Snapshot;
use crate::hub::{CacheKey, ChangeStream, InvalidationHub};
use crate::machine::{CompiledMachine, StateMachine};
use crate::mutation::{AffectedScope, LockKey, Mutation};
use crate::primitives::{MAX_PREDICATE_DEPTH, NOTIFICATION_CHANNEL_CAPACITY};
use crate::types::{KeelError, ModuleKey, ProjectKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, info};

/// Runtime settings of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffered notifications per subscriber before it lags.
    pub notification_capacity: usize,
    /// Depth bound for rule predicates and transition guards.
    pub max_predicate_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notification_capacity: NOTIFICATION_CHANNEL_CAPACITY,
            max_predicate_depth: MAX_PREDICATE_DEPTH,
        }
    }
}

/// Result of a successful `fire_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireOutcome {
    pub module: ModuleKey,
    pub from: String,
    pub to: String,
    pub scope: AffectedScope,
}

/// The keel engine.
#[derive(Debug)]
pub struct Engine {
    catalog: RwLock<Catalog>,
    locks: LockTable,
    hub: InvalidationHub,
    assembler: Assembler,
    machine: StateMachine,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with an empty catalog and default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with an empty catalog.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_catalog(Catalog::new(), config)
    }

    /// Create an engine from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot, config: EngineConfig) -> Result<Self, KeelError> {
        Ok(Self::with_catalog(Catalog::from_snapshot(snapshot)?, config))
    }

    fn with_catalog(catalog: Catalog, config: EngineConfig) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            locks: LockTable::default(),
            hub: InvalidationHub::new(config.notification_capacity),
            assembler: Assembler::new(config.max_predicate_depth),
            machine: StateMachine::new(config.max_predicate_depth),
        }
    }

    fn read_catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_catalog(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutexes of `keys`, in key order.
    fn key_locks(&self, keys: &BTreeSet<LockKey>) -> KeyLocks<'_> {
        let mut table = self.locks.lock();
        let handles = keys
            .iter()
            .map(|k| Arc::clone(table.entry(k.clone()).or_default()))
            .collect();
        KeyLocks {
            table: &self.locks,
            handles,
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Assemble (or fetch from cache) the config of `modules` for `project`.
    ///
    /// Concurrent calls for the same key share one computation. Errors are
    /// returned to every waiter and never cached.
    pub fn assemble(
        &self,
        modules: &BTreeSet<ModuleKey>,
        project: Option<&ProjectKey>,
    ) -> Result<Arc<AssembledConfig>, KeelError> {
        let key = CacheKey::new(modules.clone(), project.cloned());
        let catalog = self.read_catalog();
        let slot = self.hub.slot(&key);

        let mut computed = false;
        let result = slot
            .get_or_init(|| {
                computed = true;
                let assembly = self.assembler.assemble(&catalog, modules, project)?;
                self.hub.record(&key, assembly.touched);
                Ok(Arc::new(assembly.config))
            })
            .clone();
        if result.is_err() {
            self.hub.discard(&key, &slot);
        }
        drop(catalog);

        debug!(
            modules = modules.len(),
            project = project.map(ProjectKey::as_str),
            cache_hit = !computed,
            ok = result.is_ok(),
            "assemble"
        );
        result
    }

    /// Run `f` against the current catalog under the read lock.
    pub fn read<T>(&self, f: impl FnOnce(&Catalog) -> T) -> T {
        f(&self.read_catalog())
    }

    /// Export the current catalog.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.read_catalog().to_snapshot()
    }

    /// Number of committed mutations.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.read_catalog().revision()
    }

    /// Number of successfully cached assemblies.
    #[must_use]
    pub fn cached_entries(&self) -> usize {
        self.hub.len()
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe_changes(&self) -> ChangeStream {
        self.hub.subscribe()
    }

    /// Number of live change subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Apply one mutation: commit, evict, notify.
    pub fn apply_mutation(&self, mutation: Mutation) -> Result<AffectedScope, KeelError> {
        let mut keys = mutation.lock_keys(&self.read_catalog());
        loop {
            let locks = self.key_locks(&keys);
            let _guards = locks.acquire();

            let catalog = self.write_catalog();
            // A cascade may have grown while we waited for the locks.
            let required = mutation.lock_keys(&catalog);
            if !required.is_subset(&keys) {
                drop(catalog);
                debug!(
                    extra = required.difference(&keys).count(),
                    "lock set grew, retrying"
                );
                keys.extend(required);
                continue;
            }
            return self.commit(catalog, mutation);
        }
    }

    /// Fire `event` on `module`'s state machine and commit the new state.
    ///
    /// Guards are evaluated against the module's assembled selection for
    /// `project`.
    pub fn fire_event(
        &self,
        module: &ModuleKey,
        event: &str,
        project: Option<&ProjectKey>,
    ) -> Result<FireOutcome, KeelError> {
        let keys = BTreeSet::from([LockKey::Module(module.clone())]);
        let locks = self.key_locks(&keys);
        let _guards = locks.acquire();

        let (from, to) = {
            let catalog = self.read_catalog();
            let (compiled, from) = self.compile_machine(&catalog, module)?;
            let scope = BTreeSet::from([module.clone()]);
            let assembly = self.assembler.assemble(&catalog, &scope, project)?;
            let to = self
                .machine
                .fire(&compiled, from, event, &assembly.selection)?;
            (from.to_string(), to)
        };

        let mutation = Mutation::SetState {
            module: module.clone(),
            state: to.clone(),
        };
        let scope = self.commit(self.write_catalog(), mutation)?;
        info!(module = %module, event, from = %from, to = %to, "event fired");
        Ok(FireOutcome {
            module: module.clone(),
            from,
            to,
            scope,
        })
    }

    /// Events that can be fired on `module` from its current state, sorted.
    pub fn available_events(&self, module: &ModuleKey) -> Result<Vec<String>, KeelError> {
        let catalog = self.read_catalog();
        let (compiled, current) = self.compile_machine(&catalog, module)?;
        Ok(self.machine.events_from(&compiled, current))
    }

    /// Compile `module`'s machine and return it with the current state.
    fn compile_machine<'c>(
        &self,
        catalog: &'c Catalog,
        module: &ModuleKey,
    ) -> Result<(CompiledMachine, &'c str), KeelError> {
        let definition = catalog
            .module(module)
            .filter(|m| m.active)
            .ok_or_else(|| KeelError::NotFound(format!("module {}", module)))?;
        let current = catalog.current_state(module).ok_or_else(|| {
            KeelError::NotFound(format!("state machine of module {}", definition.key))
        })?;

        let options = catalog.options_in_module(module);
        let compiled = self.machine.compile(
            module,
            &catalog.states_of(module),
            &catalog.transitions_of(module),
            options.iter().map(|o| o.id.option.as_str()),
        )?;
        Ok((compiled, current))
    }

    /// Commit under the held write lock, evict, then publish after release.
    fn commit(
        &self,
        mut catalog: RwLockWriteGuard<'_, Catalog>,
        mutation: Mutation,
    ) -> Result<AffectedScope, KeelError> {
        let applied = catalog.apply(mutation)?;
        let evicted = self.hub.invalidate(&applied.scope);
        let revision = catalog.revision();
        drop(catalog);

        let notified = self.hub.publish(&applied.scope, revision);
        info!(
            revision,
            target = %applied
                .scope
                .primary()
                .map(|c| c.entity.to_string())
                .unwrap_or_default(),
            changes = applied.scope.changes.len(),
            evicted,
            notified,
            "mutation committed"
        );
        Ok(applied.scope)
    }

    /// Replace the whole catalog and tear down the cache.
    ///
    /// Holds the key lock of every module and project present before or
    /// after the reload, so it serializes with mutations and events on
    /// them. Every such module is notified.
    pub fn reload(&self, snapshot: Snapshot) -> Result<u64, KeelError> {
        let mut next = Catalog::from_snapshot(snapshot)?;
        let mut keys = Self::reload_keys(&self.read_catalog(), &next);
        loop {
            let locks = self.key_locks(&keys);
            let _guards = locks.acquire();

            let mut catalog = self.write_catalog();
            let required = Self::reload_keys(&catalog, &next);
            if !required.is_subset(&keys) {
                drop(catalog);
                keys.extend(required);
                continue;
            }

            let modules: BTreeSet<ModuleKey> = keys
                .iter()
                .filter_map(|k| match k {
                    LockKey::Module(m) => Some(m.clone()),
                    LockKey::Project(_) => None,
                })
                .collect();
            let revision = catalog.revision().saturating_add(1);
            next.set_revision(revision);
            *catalog = next;
            let evicted = self.hub.clear();
            drop(catalog);

            self.hub.publish_reload(&modules, revision);
            info!(revision, modules = modules.len(), evicted, "catalog reloaded");
            return Ok(revision);
        }
    }

    fn reload_keys(current: &Catalog, next: &Catalog) -> BTreeSet<LockKey> {
        let mut keys = BTreeSet::new();
        for catalog in [current, next] {
            keys.extend(
                catalog
                    .modules()
                    .into_iter()
                    .map(|m| LockKey::Module(m.key.clone())),
            );
            keys.extend(catalog.projects().map(|p| LockKey::Project(p.key.clone())));
        }
        keys
    }
}

// =============================================================================
// KEY LOCKS
// =============================================================================

/// Table of per-key mutexes. Entries live only while some caller holds them.
#[derive(Debug, Default)]
struct LockTable(Mutex<BTreeMap<LockKey, Arc<Mutex<()>>>>);

impl LockTable {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<LockKey, Arc<Mutex<()>>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handles on the mutexes of a key set.
///
/// Dropping it releases the handles and removes every table entry no other
/// caller still refers to. Guards from `acquire` must be dropped first.
struct KeyLocks<'a> {
    table: &'a LockTable,
    handles: Vec<Arc<Mutex<()>>>,
}

impl KeyLocks<'_> {
    fn acquire(&self) -> Vec<MutexGuard<'_, ()>> {
        self.handles
            .iter()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

impl Drop for KeyLocks<'_> {
    fn drop(&mut self) {
        self.handles.clear();
        // Clones are only taken under the table lock, so a count of one
        // means nobody else can be waiting on this mutex.
        self.table
            .lock()
            .retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}

// =============================================================================
// TESTS
// =============================================================================
