//! Context nodes, the unit of hub communication.
//!
//! A context groups the instances that share a semantic identity. It
//! carries the monotonic version counter, the shadow of the state last
//! sent to the hub, and the bookkeeping of the two queues it can sit on.
//! The shadow mutex doubles as the context's serialisation lock: metadata
//! merges and dispatch decisions both hold it.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::warn;

use crate::clock::now_s;
use crate::collection::ChartType;
use crate::registry::container::{ContainerItem, ContainerStats, ObservableMap};
use crate::registry::flags::{flag, NodeFlags, ALLOWED_EXTERNALLY_ON_NEW_OBJECTS,
    PREVENTING_DELETIONS, REQUIRED_FOR_DELETIONS};
use crate::registry::host::HostNode;
use crate::registry::instance::InstanceNode;
use crate::registry::merge::two_way_merge;
use crate::store::ShadowRecord;

/// Mutable descriptive metadata of a context.
#[derive(Debug, Clone)]
pub struct ContextMeta {
    /// Context title, two-way merged across collectors.
    pub title: Arc<str>,
    /// Measurement units.
    pub units: Arc<str>,
    /// Family grouping, two-way merged across collectors.
    pub family: Arc<str>,
    /// Menu ordering priority, folded from the instances.
    pub priority: u32,
    /// Rendering type.
    pub chart_type: ChartType,
}

/// Template handed to the contexts container on upsert.
pub struct ContextTemplate {
    /// Textual id, the container key.
    pub id: String,
    /// Context title.
    pub title: Arc<str>,
    /// Measurement units.
    pub units: Arc<str>,
    /// Family grouping.
    pub family: Arc<str>,
    /// Menu ordering priority.
    pub priority: u32,
    /// Rendering type.
    pub chart_type: ChartType,
    /// Initial flag bits; masked to the externally-allowed set.
    pub flags: u32,
    /// Stored state when rehydrating from the persistence bridge.
    pub shadow: Option<ShadowRecord>,
}

/// Post-processing queue bookkeeping, updated by the queue callbacks.
#[derive(Debug, Default)]
pub struct PpStamps {
    /// Flags observed when (re-)queued, OR-merged.
    pub queued_flags: AtomicU32,
    /// When the context was last queued, microseconds.
    pub queued_us: AtomicU64,
    /// When the context was last dequeued, microseconds.
    pub dequeued_us: AtomicU64,
    /// Reducer executions over this context.
    pub executions: AtomicU64,
}

/// Hub dispatch queue bookkeeping.
#[derive(Debug, Default)]
pub struct DispatchStamps {
    /// Flags observed when (re-)queued, OR-merged.
    pub queued_flags: AtomicU32,
    /// When the context was last queued, microseconds.
    pub queued_us: AtomicU64,
    /// When the dispatch delay was last derived from the queued flags.
    pub delay_calc_us: AtomicU64,
    /// The cached scheduled dispatch time, microseconds.
    pub scheduled_dispatch_us: AtomicU64,
    /// When the context was last dequeued (sent or deduplicated).
    pub dequeued_us: AtomicU64,
    /// Messages dispatched for this context.
    pub dispatches: AtomicU64,
}

/// One semantic grouping of instances, as exposed to the hub.
pub struct ContextNode {
    /// Textual id, unique per host.
    pub id: Arc<str>,
    meta: RwLock<ContextMeta>,
    /// Monotonic version counter; bumped on every dispatch.
    pub version: AtomicU64,
    /// Oldest sample time folded from the instances; zero when unknown.
    pub first_time_s: AtomicI64,
    /// Latest sample time folded from the instances; zero when unknown.
    pub last_time_s: AtomicI64,
    /// The node's flag word.
    pub flags: NodeFlags,
    /// Instances of this context, keyed by textual id.
    pub instances: ObservableMap<InstanceNode>,
    host: Weak<HostNode>,
    shadow: Mutex<Option<ShadowRecord>>,
    /// Post-processing queue stamps.
    pub pp: PpStamps,
    /// Dispatch queue stamps.
    pub queue: DispatchStamps,
}

impl ContextNode {
    /// The owning host.
    pub fn host(&self) -> Option<Arc<HostNode>> {
        self.host.upgrade()
    }

    /// The context title.
    pub fn title(&self) -> Arc<str> {
        Arc::clone(&self.meta.read().title)
    }

    /// The measurement units.
    pub fn units(&self) -> Arc<str> {
        Arc::clone(&self.meta.read().units)
    }

    /// The family grouping.
    pub fn family(&self) -> Arc<str> {
        Arc::clone(&self.meta.read().family)
    }

    /// The menu ordering priority.
    pub fn priority(&self) -> u32 {
        self.meta.read().priority
    }

    /// The rendering type.
    pub fn chart_type(&self) -> ChartType {
        self.meta.read().chart_type
    }

    /// Updates the folded priority; reducer only.
    pub(crate) fn set_priority(&self, priority: u32) {
        self.meta.write().priority = priority;
    }

    /// Retention window `(first, last)`, zeros when unknown.
    pub fn retention(&self) -> (i64, i64) {
        (
            self.first_time_s.load(Ordering::SeqCst),
            self.last_time_s.load(Ordering::SeqCst),
        )
    }

    /// Takes the serialisation lock, guarding the last-sent shadow.
    pub(crate) fn lock_shadow(&self) -> MutexGuard<'_, Option<ShadowRecord>> {
        self.shadow.lock()
    }

    /// A copy of the last-sent shadow, if any dispatch happened yet.
    pub fn shadow(&self) -> Option<ShadowRecord> {
        self.shadow.lock().clone()
    }

    /// Builds the hub-visible snapshot of the live state. While collected,
    /// the last time is reported as zero.
    pub fn current_shadow(&self) -> ShadowRecord {
        let meta = self.meta.read();
        let bits = self.flags.get();
        ShadowRecord {
            id: self.id.to_string(),
            version: self.version.load(Ordering::SeqCst),
            title: meta.title.to_string(),
            units: meta.units.to_string(),
            family: meta.family.to_string(),
            chart_type: meta.chart_type,
            priority: meta.priority,
            first_time_s: self.first_time_s.load(Ordering::SeqCst),
            last_time_s: if bits & flag::COLLECTED != 0 {
                0
            } else {
                self.last_time_s.load(Ordering::SeqCst)
            },
            deleted: bits & flag::DELETED != 0,
        }
    }

    /// Queues the context for post-processing, if not already queued.
    pub fn queue_for_post_processing(self: &Arc<Self>) {
        if self.flags.check(flag::QUEUED_FOR_PP) {
            return;
        }
        if let Some(host) = self.host() {
            host.enqueue_post_processing(self);
        }
    }

    /// Queues the context for hub dispatch; re-queueing merges flags and
    /// restarts the debounce window.
    pub fn queue_for_hub(self: &Arc<Self>) {
        if let Some(host) = self.host() {
            host.enqueue_hub(self);
        }
    }

    /// The context deletion gate.
    pub fn should_be_deleted(&self) -> bool {
        if !self.flags.check_all(REQUIRED_FOR_DELETIONS) {
            return false;
        }
        if self.flags.check(PREVENTING_DELETIONS) {
            return false;
        }
        if self.instances.referenced_items() != 0 {
            return false;
        }
        if !self.instances.is_empty() {
            return false;
        }
        let (first, last) = self.retention();
        first == 0 && last == 0
    }

    /// Queues for post-processing when anything is pending.
    pub(crate) fn trigger_updates(self: &Arc<Self>) {
        if self.flags.is_updated() || !self.flags.check(flag::LIVE_RETENTION) {
            self.queue_for_post_processing();
        }
    }
}

impl ContainerItem for ContextNode {
    type Parent = Weak<HostNode>;
    type Template = ContextTemplate;

    fn on_insert(parent: &Weak<HostNode>, t: ContextTemplate, self_ref: &Weak<Self>) -> Self {
        let stats = parent
            .upgrade()
            .map(|host| Arc::clone(host.contexts.stats()))
            .unwrap_or_else(ContainerStats::new);

        let bits =
            (t.flags & ALLOWED_EXTERNALLY_ON_NEW_OBJECTS) | flag::UPDATED | flag::NEW_OBJECT;

        let node = Self {
            id: Arc::from(t.id.as_str()),
            meta: RwLock::new(ContextMeta {
                title: t.title,
                units: t.units,
                family: t.family,
                priority: t.priority,
                chart_type: t.chart_type,
            }),
            version: AtomicU64::new(0),
            first_time_s: AtomicI64::new(0),
            last_time_s: AtomicI64::new(0),
            flags: NodeFlags::new(bits),
            instances: ObservableMap::new(Weak::clone(self_ref), stats),
            host: Weak::clone(parent),
            shadow: Mutex::new(None),
            pp: PpStamps::default(),
            queue: DispatchStamps::default(),
        };

        match t.shadow {
            Some(sh) => {
                // rehydrating from the store: the stored row is authoritative
                {
                    let mut meta = node.meta.write();
                    meta.title = Arc::from(sh.title.as_str());
                    meta.units = Arc::from(sh.units.as_str());
                    meta.family = Arc::from(sh.family.as_str());
                    meta.priority = sh.priority;
                    meta.chart_type = sh.chart_type;
                }
                node.version.store(sh.version, Ordering::SeqCst);
                node.first_time_s.store(sh.first_time_s, Ordering::SeqCst);
                node.last_time_s.store(sh.last_time_s, Ordering::SeqCst);

                if sh.deleted || sh.first_time_s == 0 {
                    node.flags.set_deleted(0);
                } else if sh.last_time_s == 0 {
                    node.flags.set_collected();
                } else {
                    node.flags.set_archived();
                }
                node.flags.set(flag::LOADED_FROM_STORE | flag::UPDATED);
                *node.shadow.lock() = Some(sh);
            }
            None => {
                // brand new context: seed the version from the wall clock
                node.version.store(now_s().max(0) as u64, Ordering::SeqCst);
            }
        }

        node
    }

    fn on_conflict(&self, _parent: &Weak<HostNode>, t: ContextTemplate) -> bool {
        let template_archived = t.flags & flag::ARCHIVED != 0;

        if let Some(sh) = t.shadow {
            // a stored row re-surfacing for a known context reconciles the
            // version only; the live metadata stays authoritative
            let mut shadow = self.shadow.lock();
            let current = self.version.load(Ordering::SeqCst);
            if current != sh.version {
                warn!(
                    context = %self.id,
                    stored = sh.version,
                    live = current,
                    "context.shadow.version_mismatch"
                );
                if sh.version > current {
                    self.version.store(sh.version, Ordering::SeqCst);
                }
            }
            if shadow.is_none() {
                *shadow = Some(sh);
            }
            drop(shadow);

            self.flags.set(t.flags & ALLOWED_EXTERNALLY_ON_NEW_OBJECTS);
            if self.flags.is_collected() && self.flags.is_archived() {
                self.flags.set_collected();
            }
            self.flags.set_updated(flag::LOADED_FROM_STORE | flag::UPDATED_OBJECT);
            return true;
        }

        // an archived template never overrides a live context
        if !self.flags.is_archived() && template_archived {
            return false;
        }

        // serialize the merge against the dispatch path
        let _shadow = self.shadow.lock();

        {
            let archived = self.flags.is_archived();
            let mut meta = self.meta.write();

            if meta.title != t.title && !t.title.is_empty() {
                meta.title = if archived && !template_archived || meta.title.is_empty() {
                    Arc::clone(&t.title)
                } else {
                    Arc::from(two_way_merge(&meta.title, &t.title))
                };
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.units != t.units && !t.units.is_empty() {
                meta.units = Arc::clone(&t.units);
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.family != t.family && !t.family.is_empty() {
                meta.family = if archived && !template_archived || meta.family.is_empty() {
                    Arc::clone(&t.family)
                } else {
                    Arc::from(two_way_merge(&meta.family, &t.family))
                };
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.chart_type != t.chart_type {
                meta.chart_type = t.chart_type;
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.priority != t.priority {
                meta.priority = t.priority;
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
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

    fn on_react(self: &Arc<Self>, _parent: &Weak<HostNode>, _created: bool) {
        self.trigger_updates();
    }
}
