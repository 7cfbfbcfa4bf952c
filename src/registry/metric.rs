//! Metric nodes, the leaves of the tree.
//!
//! One metric node tracks one collected dimension: its identity, its
//! retention window in the store, and whether a live dimension currently
//! feeds it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

use crate::collection::Dimension;
use crate::registry::container::ContainerItem;
use crate::registry::context::ContextNode;
use crate::registry::flags::{flag, NodeFlags, ALLOWED_EXTERNALLY_ON_NEW_OBJECTS,
    PREVENTING_DELETIONS, REQUIRED_FOR_DELETIONS};
use crate::registry::instance::InstanceNode;
use crate::retention::RetentionSource;

/// Mutable identity of a metric node.
#[derive(Debug, Clone)]
pub struct MetricMeta {
    /// Stable binary identity, used for retention queries.
    pub uuid: Uuid,
    /// Display name; defaults to the id.
    pub name: Arc<str>,
}

/// Template handed to the metrics container on upsert.
pub struct MetricTemplate {
    /// Stable binary identity.
    pub uuid: Uuid,
    /// Textual id, the container key.
    pub id: String,
    /// Display name.
    pub name: Arc<str>,
    /// Live dimension feeding this metric, when collected.
    pub link: Option<Arc<Dimension>>,
    /// Initial flag bits; masked to the externally-allowed set.
    pub flags: u32,
    /// Known oldest sample time, or zero.
    pub first_time_s: i64,
    /// Known latest sample time, or zero.
    pub last_time_s: i64,
}

/// One collected dimension of one instance.
pub struct MetricNode {
    /// Textual id, unique within the instance.
    pub id: Arc<str>,
    meta: RwLock<MetricMeta>,
    /// Live dimension link; `None` once archived.
    pub link: Mutex<Option<Arc<Dimension>>>,
    /// Oldest sample time, seconds; zero when unknown.
    pub first_time_s: AtomicI64,
    /// Latest sample time, seconds; zero when unknown.
    pub last_time_s: AtomicI64,
    /// The node's flag word.
    pub flags: NodeFlags,
    instance: Weak<InstanceNode>,
}

impl MetricNode {
    /// The owning instance.
    pub fn instance(&self) -> Option<Arc<InstanceNode>> {
        self.instance.upgrade()
    }

    /// The owning context, two levels up.
    pub fn context(&self) -> Option<Arc<ContextNode>> {
        self.instance().and_then(|ri| ri.context())
    }

    /// The stable binary identity.
    pub fn uuid(&self) -> Uuid {
        self.meta.read().uuid
    }

    /// The display name.
    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.meta.read().name)
    }

    /// Retention window `(first, last)`, zeros when unknown.
    pub fn retention(&self) -> (i64, i64) {
        (
            self.first_time_s.load(Ordering::SeqCst),
            self.last_time_s.load(Ordering::SeqCst),
        )
    }

    /// Latest sample time as exposed to queries: zero while collected.
    pub fn last_entry_s(&self) -> i64 {
        if self.flags.is_collected() {
            0
        } else {
            self.last_time_s.load(Ordering::SeqCst)
        }
    }

    /// Re-reads the retention window from every tier of the store.
    ///
    /// Updates the node's window, emits the first/last change reasons on
    /// actual change, marks the node deleted when the window is empty, and
    /// asserts `LIVE_RETENTION`. Returns true iff any tier answered.
    pub fn refresh_retention(&self, source: &dyn RetentionSource) -> bool {
        let uuid = self.uuid();
        let mut min_first = i64::MAX;
        let mut max_last = 0i64;
        let mut answered = false;

        for tier in 0..source.tiers() {
            if let Some((first, last)) = source.metric_retention(tier, &uuid) {
                answered = true;
                if first < min_first {
                    min_first = first;
                }
                if last > max_last {
                    max_last = last;
                }
            }
        }

        if min_first == i64::MAX {
            min_first = 0;
        }
        if min_first > max_last {
            warn!(
                metric = %self.id,
                first = min_first,
                last = max_last,
                "metric.retention.flipped"
            );
            std::mem::swap(&mut min_first, &mut max_last);
        }

        if min_first != self.first_time_s.swap(min_first, Ordering::SeqCst) {
            self.flags.set_updated(flag::CHANGED_FIRST_TIME);
        }
        if max_last != self.last_time_s.swap(max_last, Ordering::SeqCst) {
            self.flags.set_updated(flag::CHANGED_LAST_TIME);
        }

        if min_first == 0 && max_last == 0 {
            self.flags.set_deleted(flag::ZERO_RETENTION);
        }
        self.flags.set(flag::LIVE_RETENTION);

        answered
    }

    /// The metric deletion gate.
    pub fn should_be_deleted(&self, source: &dyn RetentionSource) -> bool {
        if !self.flags.check_all(REQUIRED_FOR_DELETIONS) {
            return false;
        }
        if self.flags.check(PREVENTING_DELETIONS) {
            return false;
        }
        if self.link.lock().is_some() {
            return false;
        }
        self.refresh_retention(source);
        let (first, last) = self.retention();
        first == 0 && last == 0
    }

    /// Escalates pending updates to the owning instance and queues the
    /// context for post-processing.
    pub(crate) fn trigger_updates(self: &Arc<Self>) {
        if self.flags.is_collected()
            && (self.link.lock().is_none() || self.flags.check(flag::DISCONNECTED_CHILD))
        {
            self.flags.set_archived();
        }

        if self.flags.is_updated() || !self.flags.check(flag::LIVE_RETENTION) {
            if let Some(ri) = self.instance() {
                ri.flags.set_updated(flag::TRIGGERED);
                if let Some(rc) = ri.context() {
                    rc.queue_for_post_processing();
                }
            }
        }
    }
}

impl ContainerItem for MetricNode {
    type Parent = Weak<InstanceNode>;
    type Template = MetricTemplate;

    fn on_insert(parent: &Weak<InstanceNode>, t: MetricTemplate, _self_ref: &Weak<Self>) -> Self {
        Self {
            id: Arc::from(t.id.as_str()),
            meta: RwLock::new(MetricMeta { uuid: t.uuid, name: t.name }),
            link: Mutex::new(t.link),
            first_time_s: AtomicI64::new(t.first_time_s),
            last_time_s: AtomicI64::new(t.last_time_s),
            flags: NodeFlags::new(
                (t.flags & ALLOWED_EXTERNALLY_ON_NEW_OBJECTS)
                    | flag::UPDATED
                    | flag::NEW_OBJECT,
            ),
            instance: Weak::clone(parent),
        }
    }

    fn on_conflict(&self, _parent: &Weak<InstanceNode>, t: MetricTemplate) -> bool {
        {
            let mut meta = self.meta.write();
            if meta.uuid != t.uuid {
                // the new identity wins; the caller re-queries retention
                meta.uuid = t.uuid;
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.name != t.name {
                meta.name = Arc::clone(&t.name);
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
        }

        {
            let mut link = self.link.lock();
            let differs = match (&*link, &t.link) {
                (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                (None, None) => false,
                _ => true,
            };
            if differs {
                if link.is_some() && t.link.is_some() {
                    self.flags.set_updated(flag::CHANGED_LINKING);
                }
                *link = t.link;
            }
        }

        let first = self.first_time_s.load(Ordering::SeqCst);
        if t.first_time_s != 0 && (first == 0 || t.first_time_s < first) {
            self.first_time_s.store(t.first_time_s, Ordering::SeqCst);
            self.flags.set_updated(flag::CHANGED_FIRST_TIME);
        }
        let last = self.last_time_s.load(Ordering::SeqCst);
        if t.last_time_s != 0 && (last == 0 || t.last_time_s > last) {
            self.last_time_s.store(t.last_time_s, Ordering::SeqCst);
            self.flags.set_updated(flag::CHANGED_LAST_TIME);
        }

        self.flags.set(t.flags & ALLOWED_EXTERNALLY_ON_NEW_OBJECTS);
        if self.flags.is_collected() && self.flags.is_archived() {
            self.flags.set_collected();
        }
        if self.flags.is_updated() {
            self.flags.set(flag::UPDATED_OBJECT);
        }

        self.flags.is_updated()
    }

    fn on_react(self: &Arc<Self>, _parent: &Weak<InstanceNode>, _created: bool) {
        self.trigger_updates();
    }

    fn on_remove(&self, _parent: &Weak<InstanceNode>) {
        if self.link.lock().is_some() {
            error!(metric = %self.id, "metric removed while a live dimension is linked to it");
        }
    }
}
