//! The storage engine seam.
//!
//! The index never reads samples; all it needs from the time-series store
//! is the retention window of a metric UUID per tier, and a notification
//! when the store rotates old data out.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

/// Read-only retention oracle implemented by the time-series storage
/// engine.
pub trait RetentionSource: Send + Sync {
    /// Number of retention tiers the engine maintains.
    fn tiers(&self) -> usize;

    /// Inclusive `(first, last)` sample times for `uuid` in `tier`, or
    /// `None` when the tier holds nothing for it.
    fn metric_retention(&self, tier: usize, uuid: &Uuid) -> Option<(i64, i64)>;
}

/// In-memory single-tier retention source for tests and tooling.
#[derive(Default)]
pub struct MemoryRetention {
    entries: RwLock<HashMap<Uuid, (i64, i64)>>,
}

impl MemoryRetention {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retention window of a metric.
    pub fn set(&self, uuid: Uuid, first_time_s: i64, last_time_s: i64) {
        self.entries.write().insert(uuid, (first_time_s, last_time_s));
    }

    /// Drops a metric, as a store rotation would.
    pub fn remove(&self, uuid: &Uuid) {
        self.entries.write().remove(uuid);
    }

    /// Drops every metric.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl RetentionSource for MemoryRetention {
    fn tiers(&self) -> usize {
        1
    }

    fn metric_retention(&self, _tier: usize, uuid: &Uuid) -> Option<(i64, i64)> {
        self.entries.read().get(uuid).copied()
    }
}
