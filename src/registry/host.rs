//! Host binding: the per-host containers, the two context queues and the
//! cached host-wide retention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::now_us;
use crate::registry::container::{ContainerItem, ContainerStats, ObservableMap};
use crate::registry::context::ContextNode;
use crate::registry::flags::flag;

/// Membership record on the post-processing queue.
pub struct PpQueueEntry {
    /// The queued context.
    pub context: Arc<ContextNode>,
}

impl ContainerItem for PpQueueEntry {
    type Parent = ();
    type Template = Arc<ContextNode>;

    fn on_insert(_: &(), rc: Arc<ContextNode>, _self_ref: &std::sync::Weak<Self>) -> Self {
        rc.flags.set(flag::QUEUED_FOR_PP);
        rc.pp.queued_flags.store(rc.flags.get(), Ordering::SeqCst);
        rc.pp.queued_us.store(now_us(), Ordering::SeqCst);
        Self { context: rc }
    }

    fn on_conflict(&self, _: &(), _rc: Arc<ContextNode>) -> bool {
        let rc = &self.context;
        let mut changed = false;
        if !rc.flags.check(flag::QUEUED_FOR_PP) {
            rc.flags.set(flag::QUEUED_FOR_PP);
            changed = true;
        }
        let bits = rc.flags.get();
        let prev = rc.pp.queued_flags.fetch_or(bits, Ordering::SeqCst);
        if prev | bits != prev {
            changed = true;
        }
        changed
    }

    fn on_react(self: &Arc<Self>, _: &(), _created: bool) {}

    fn on_remove(&self, _: &()) {
        self.context.flags.clear(flag::QUEUED_FOR_PP);
        self.context.pp.dequeued_us.store(now_us(), Ordering::SeqCst);
    }
}

/// Membership record on the hub dispatch queue.
pub struct HubQueueEntry {
    /// The queued context.
    pub context: Arc<ContextNode>,
}

impl ContainerItem for HubQueueEntry {
    type Parent = ();
    type Template = Arc<ContextNode>;

    fn on_insert(_: &(), rc: Arc<ContextNode>, _self_ref: &std::sync::Weak<Self>) -> Self {
        rc.flags.set(flag::QUEUED_FOR_HUB);
        rc.queue.queued_us.store(now_us(), Ordering::SeqCst);
        rc.queue.queued_flags.store(rc.flags.get(), Ordering::SeqCst);
        // the dispatch delay is derived lazily on first inspection
        rc.queue.delay_calc_us.store(0, Ordering::SeqCst);
        Self { context: rc }
    }

    fn on_conflict(&self, _: &(), _rc: Arc<ContextNode>) -> bool {
        // same context; refresh the stamp and fold the newly observed flags
        let rc = &self.context;
        rc.flags.set(flag::QUEUED_FOR_HUB);
        rc.queue.queued_us.store(now_us(), Ordering::SeqCst);
        rc.queue.queued_flags.fetch_or(rc.flags.get(), Ordering::SeqCst);
        rc.queue.delay_calc_us.store(0, Ordering::SeqCst);
        true
    }

    fn on_react(self: &Arc<Self>, _: &(), _created: bool) {}

    fn on_remove(&self, _: &()) {
        self.context.flags.clear(flag::QUEUED_FOR_HUB);
    }
}

/// One monitored host and its context index state.
pub struct HostNode {
    /// Host name, unique within the index.
    pub hostname: Arc<str>,
    /// Stable binary identity, the persistence key.
    pub uuid: Uuid,
    node_id: Mutex<Option<Uuid>>,
    /// Contexts of this host, keyed by textual id.
    pub contexts: ObservableMap<ContextNode>,
    /// Contexts awaiting the reducer.
    pub pp_queue: ObservableMap<PpQueueEntry>,
    /// Contexts awaiting hub dispatch.
    pub hub_queue: ObservableMap<HubQueueEntry>,
    retention: Mutex<(i64, i64)>,
    stream_enabled: AtomicBool,
}

impl HostNode {
    /// Creates a host binding with empty containers.
    pub fn new(
        hostname: &str,
        uuid: Uuid,
        node_id: Option<Uuid>,
        stats: Arc<ContainerStats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            hostname: Arc::from(hostname),
            uuid,
            node_id: Mutex::new(node_id),
            contexts: ObservableMap::new(weak.clone(), Arc::clone(&stats)),
            pp_queue: ObservableMap::new((), Arc::clone(&stats)),
            hub_queue: ObservableMap::new((), stats),
            retention: Mutex::new((0, 0)),
            stream_enabled: AtomicBool::new(false),
        })
    }

    /// The hub-assigned node identity, once claimed.
    pub fn node_id(&self) -> Option<Uuid> {
        *self.node_id.lock()
    }

    /// Records the hub-assigned node identity.
    pub fn set_node_id(&self, node_id: Option<Uuid>) {
        *self.node_id.lock() = node_id;
    }

    /// Whether the hub asked for context streaming.
    pub fn stream_enabled(&self) -> bool {
        self.stream_enabled.load(Ordering::SeqCst)
    }

    /// Sets the streaming flag.
    pub fn set_stream_enabled(&self, enabled: bool) {
        self.stream_enabled.store(enabled, Ordering::SeqCst);
    }

    /// The cached host-wide retention window.
    pub fn cached_retention(&self) -> (i64, i64) {
        *self.retention.lock()
    }

    /// Refreshes the cached retention: `global` replaces it, otherwise the
    /// window is widened to include the given bounds.
    pub fn update_cached_retention(&self, first_time_s: i64, last_time_s: i64, global: bool) {
        let mut retention = self.retention.lock();
        if global {
            *retention = (first_time_s, last_time_s);
        } else {
            if retention.0 == 0 || (first_time_s != 0 && first_time_s < retention.0) {
                retention.0 = first_time_s;
            }
            if retention.1 == 0 || last_time_s > retention.1 {
                retention.1 = last_time_s;
            }
        }
    }

    /// Puts a context on the post-processing queue.
    pub fn enqueue_post_processing(&self, rc: &Arc<ContextNode>) {
        self.pp_queue.upsert(&rc.id, Arc::clone(rc));
    }

    /// Puts a context on the hub dispatch queue.
    pub fn enqueue_hub(&self, rc: &Arc<ContextNode>) {
        self.hub_queue.upsert(&rc.id, Arc::clone(rc));
    }
}
