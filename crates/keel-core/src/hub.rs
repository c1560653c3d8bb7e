//! # Invalidation & Notification Hub
//!
//! Owns the process-wide cache of assembled configs, the reverse dependency
//! index used to evict them, and the change-notification broadcast.
//!
//! ## Lifecycle
//!
//! - Empty at startup, filled lazily by `Engine::assemble`
//! - Entries are evicted whole, never patched
//! - `clear` tears everything down (full reload only)
//!
//! ## Single flight
//!
//! Each cache key maps to one `OnceLock` slot. Concurrent requests for the
//! same key share the slot and wait for the first computation.

use crate::assembler::AssembledConfig;
use crate::mutation::{AffectedScope, EntityChange, EntityKind, EntityRef, MutationAction};
use crate::types::{KeelError, ModuleKey, ProjectKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

/// Identity of a cached assembly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub modules: BTreeSet<ModuleKey>,
    pub project: Option<ProjectKey>,
}

impl CacheKey {
    #[must_use]
    pub fn new(modules: BTreeSet<ModuleKey>, project: Option<ProjectKey>) -> Self {
        Self { modules, project }
    }
}

/// Outcome of one assembly, shared by every waiter on the slot.
pub type AssemblyResult = Result<Arc<AssembledConfig>, KeelError>;

/// A single-flight cache slot.
pub type Slot = Arc<OnceLock<AssemblyResult>>;

/// Notification emitted once per affected module per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub module: ModuleKey,
    /// Catalog revision after the commit.
    pub revision: u64,
    /// Kind of the entity the mutation was addressed to.
    pub entity_type: EntityKind,
    pub action: MutationAction,
    /// Rendered identity of that entity.
    pub identity: String,
    /// The changes of this mutation that belong to `module`.
    pub changes: Vec<EntityChange>,
}

#[derive(Debug, Default)]
struct HubState {
    slots: BTreeMap<CacheKey, Slot>,
    dependencies: BTreeMap<CacheKey, BTreeSet<EntityRef>>,
    reverse: BTreeMap<EntityRef, BTreeSet<CacheKey>>,
}

impl HubState {
    fn evict(&mut self, key: &CacheKey) -> bool {
        let removed = self.slots.remove(key).is_some();
        if let Some(deps) = self.dependencies.remove(key) {
            for dep in deps {
                if let Some(keys) = self.reverse.get_mut(&dep) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.reverse.remove(&dep);
                    }
                }
            }
        }
        removed
    }
}

/// The invalidation and notification hub.
#[derive(Debug)]
pub struct InvalidationHub {
    state: Mutex<HubState>,
    sender: broadcast::Sender<ChangeNotification>,
}

impl InvalidationHub {
    /// Create a hub whose broadcast channel buffers `capacity` notifications.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(HubState::default()),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // CACHE
    // =========================================================================

    /// Get or create the slot of `key`.
    ///
    /// A completed slot holding an error is never handed out again: it is
    /// replaced by a fresh one so the next caller recomputes.
    pub fn slot(&self, key: &CacheKey) -> Slot {
        let mut state = self.lock();
        if state
            .slots
            .get(key)
            .is_some_and(|slot| matches!(slot.get(), Some(Err(_))))
        {
            state.evict(key);
        }
        Arc::clone(state.slots.entry(key.clone()).or_default())
    }

    /// The completed, successful entry of `key`, if cached.
    #[must_use]
    pub fn cached(&self, key: &CacheKey) -> Option<Arc<AssembledConfig>> {
        let state = self.lock();
        match state.slots.get(key)?.get()? {
            Ok(config) => Some(Arc::clone(config)),
            Err(_) => None,
        }
    }

    /// Record the entities an assembly read.
    ///
    /// Must be called while the catalog read lock used for that assembly is
    /// still held.
    pub fn record(&self, key: &CacheKey, touched: BTreeSet<EntityRef>) {
        let mut state = self.lock();
        if !state.slots.contains_key(key) {
            return;
        }
        for entity in &touched {
            state
                .reverse
                .entry(entity.clone())
                .or_default()
                .insert(key.clone());
        }
        state.dependencies.insert(key.clone(), touched);
    }

    /// Drop a slot whose computation failed, unless it was already replaced.
    pub fn discard(&self, key: &CacheKey, slot: &Slot) {
        let mut state = self.lock();
        if state.slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            state.evict(key);
        }
    }

    /// Evict every entry that depends on an entity of `scope`.
    ///
    /// Returns the number of evicted entries.
    pub fn invalidate(&self, scope: &AffectedScope) -> usize {
        let mut state = self.lock();
        let stale: BTreeSet<CacheKey> = scope
            .entities
            .iter()
            .filter_map(|e| state.reverse.get(e))
            .flatten()
            .cloned()
            .collect();
        let evicted = stale.iter().filter(|key| state.evict(key)).count();
        if evicted > 0 {
            debug!(evicted, "cache entries invalidated");
        }
        evicted
    }

    /// Evict everything.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.slots.len();
        *state = HubState::default();
        count
    }

    /// Number of successfully cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| matches!(slot.get(), Some(Ok(_))))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // NOTIFICATIONS
    // =========================================================================

    /// Emit one notification per module of `scope`.
    ///
    /// Returns the number of notifications built. A send without
    /// subscribers is not an error.
    pub fn publish(&self, scope: &AffectedScope, revision: u64) -> usize {
        let Some(primary) = scope.primary() else {
            return 0;
        };
        for module in &scope.modules {
            let notification = ChangeNotification {
                module: module.clone(),
                revision,
                entity_type: primary.entity.kind(),
                action: primary.action,
                identity: primary.entity.to_string(),
                changes: scope.changes_in(module).cloned().collect(),
            };
            self.send(notification);
        }
        scope.modules.len()
    }

    /// Emit a module-level update for every module touched by a reload.
    pub fn publish_reload(&self, modules: &BTreeSet<ModuleKey>, revision: u64) -> usize {
        for module in modules {
            let entity = EntityRef::Module(module.clone());
            self.send(ChangeNotification {
                module: module.clone(),
                revision,
                entity_type: EntityKind::Module,
                action: MutationAction::Update,
                identity: entity.to_string(),
                changes: vec![EntityChange::new(entity, MutationAction::Update)],
            });
        }
        modules.len()
    }

    fn send(&self, notification: ChangeNotification) {
        if self.sender.send(notification).is_err() {
            debug!("change notification dropped: no subscribers");
        }
    }

    /// Subscribe to change notifications emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> ChangeStream {
        ChangeStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Current number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InvalidationHub {
    fn default() -> Self {
        Self::new(crate::primitives::NOTIFICATION_CHANNEL_CAPACITY)
    }
}

/// A subscriber's view of the notification stream.
///
/// A subscriber that falls behind the channel capacity skips the oldest
/// notifications (logged) and continues. The stream ends when the hub is
/// dropped.
#[derive(Debug)]
pub struct ChangeStream {
    receiver: broadcast::Receiver<ChangeNotification>,
}

impl ChangeStream {
    /// Wait for the next notification.
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(n) => return Some(n),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next notification if one is already queued.
    pub fn try_next(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.receiver.try_recv() {
                Ok(n) => return Some(n),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
