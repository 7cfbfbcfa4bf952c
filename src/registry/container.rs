//! Keyed, observable containers.
//!
//! Contexts, instances, metrics and the two context queues all converge
//! through the same upsert contract: a template is either move-constructed
//! into place (insert) or merged into the existing value (conflict), and a
//! react hook runs after the container lock is released. The per-level
//! invariants live in those three hooks, encoded once per node type.
//!
//! Items are handed out as [`Arc`] handles; a deleted item stays alive for
//! any holder of a handle and is freed when the last handle drops, which is
//! what makes reentrant walks with deletions safe.

use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHasher;

type Map<V> = IndexMap<Arc<str>, Arc<V>, BuildHasherDefault<FxHasher>>;

/// Mutation counters shared by a family of containers.
///
/// Passed in at construction so tests can observe churn without a
/// process-wide singleton.
#[derive(Debug, Default)]
pub struct ContainerStats {
    /// Items created.
    pub inserts: AtomicU64,
    /// Templates merged into existing items.
    pub conflicts: AtomicU64,
    /// Items removed.
    pub removals: AtomicU64,
}

impl ContainerStats {
    /// A fresh sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A value that can live in an [`ObservableMap`].
pub trait ContainerItem: Send + Sync + Sized + 'static {
    /// Hook context handed to every callback; the owning node for tree
    /// levels, `()` for the queues.
    type Parent: Send + Sync;
    /// The move-constructed input of an upsert.
    type Template;

    /// Constructor: builds the value from the template and links it to its
    /// parent. `self_ref` is the value's own (not yet upgradable) handle,
    /// for containers nested inside the value.
    fn on_insert(parent: &Self::Parent, template: Self::Template, self_ref: &Weak<Self>) -> Self;

    /// Merge: folds the template into the existing value. Returns whether
    /// anything changed. Runs under the container write lock.
    fn on_conflict(&self, parent: &Self::Parent, template: Self::Template) -> bool;

    /// Runs after insert or conflict, with the container unlocked.
    fn on_react(self: &Arc<Self>, parent: &Self::Parent, created: bool);

    /// Runs when the item is removed from the container.
    fn on_remove(&self, _parent: &Self::Parent) {}
}

/// Single-writer/many-reader keyed map with lifecycle hooks.
pub struct ObservableMap<V: ContainerItem> {
    parent: V::Parent,
    items: RwLock<Map<V>>,
    version: AtomicU64,
    stats: Arc<ContainerStats>,
}

impl<V: ContainerItem> ObservableMap<V> {
    /// Creates an empty container bound to its hook parent.
    pub fn new(parent: V::Parent, stats: Arc<ContainerStats>) -> Self {
        Self {
            parent,
            items: RwLock::new(Map::default()),
            version: AtomicU64::new(0),
            stats,
        }
    }

    /// The hook parent this container was built with.
    pub fn parent(&self) -> &V::Parent {
        &self.parent
    }

    /// The statistics sink this container reports to.
    pub fn stats(&self) -> &Arc<ContainerStats> {
        &self.stats
    }

    /// Monotonic change counter; bumps on insert, merge-with-change and
    /// removal. Queried by the scope evaluator's cache hashes.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Inserts or merges `template` under `key`, returning the item handle
    /// and whether the key already existed. The react hook has run by the
    /// time this returns.
    pub fn upsert(&self, key: &str, template: V::Template) -> (Arc<V>, bool) {
        let (item, existed) = {
            let mut items = self.items.write();
            if let Some(existing) = items.get(key) {
                let existing = Arc::clone(existing);
                let changed = existing.on_conflict(&self.parent, template);
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                if changed {
                    self.bump();
                }
                (existing, true)
            } else {
                let item = Arc::new_cyclic(|weak| V::on_insert(&self.parent, template, weak));
                items.insert(Arc::from(key), Arc::clone(&item));
                self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                self.bump();
                (item, false)
            }
        };
        item.on_react(&self.parent, !existed);
        (item, existed)
    }

    /// Acquires a handle to the item under `key`.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.items.read().get(key).cloned()
    }

    /// Removes `key`, running the removal hook. The value itself is freed
    /// when the last outstanding handle drops.
    pub fn del(&self, key: &str) -> bool {
        let removed = self.items.write().shift_remove(key);
        match removed {
            Some(item) => {
                item.on_remove(&self.parent);
                self.stats.removals.fetch_add(1, Ordering::Relaxed);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// True when the container has no items.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Visits every item under the shared lock. The callback must not
    /// mutate this container.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<V>)) {
        let items = self.items.read();
        for item in items.values() {
            f(item);
        }
    }

    /// Handles to every item, in insertion order. The reentrant walk: the
    /// caller iterates the snapshot without holding the lock and may delete
    /// visited items through [`ObservableMap::del`].
    pub fn snapshot(&self) -> Vec<Arc<V>> {
        self.items.read().values().cloned().collect()
    }

    /// Number of handles still held outside the container for any item.
    ///
    /// Used by the deletion gates: a sub-tree with outstanding references
    /// is not eligible for garbage collection yet.
    pub fn referenced_items(&self) -> usize {
        let items = self.items.read();
        items
            .values()
            .map(|item| Arc::strong_count(item).saturating_sub(1))
            .sum()
    }
}
