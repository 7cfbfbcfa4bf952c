//! The root object tying the index together.
//!
//! A [`ContextIndex`] owns the host bindings and the three seams the
//! surrounding agent provides: the retention oracle of the storage engine,
//! the persistence bridge and the hub transport. Collection hooks, hub
//! commands and the worker loop are all inherent methods on it, split
//! across the modules that own their logic.

use std::hash::BuildHasherDefault;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use tracing::info;
use uuid::Uuid;

use crate::clock::now_us;
use crate::collection::Chart;
use crate::config::IndexConfig;
use crate::error::Result;
use crate::hub::HubTransport;
use crate::query::pattern::SimplePattern;
use crate::registry::container::ContainerStats;
use crate::registry::context::{ContextNode, ContextTemplate};
use crate::registry::flags::flag;
use crate::registry::host::HostNode;
use crate::registry::instance::{InstanceNode, InstanceTemplate};
use crate::registry::metric::{MetricNode, MetricTemplate};
use crate::retention::RetentionSource;
use crate::store::ContextStore;
use crate::worker::{gc, post_process};

type HostMap = IndexMap<Arc<str>, Arc<HostNode>, BuildHasherDefault<FxHasher>>;

/// An acquired (context, instance, metric) path into the tree.
pub struct MetricTriple {
    /// The context handle.
    pub context: Arc<ContextNode>,
    /// The instance handle.
    pub instance: Arc<InstanceNode>,
    /// The metric handle.
    pub metric: Arc<MetricNode>,
}

/// The in-process context index of a monitoring agent.
pub struct ContextIndex {
    config: IndexConfig,
    retention: Arc<dyn RetentionSource>,
    store: Arc<dyn ContextStore>,
    transport: Arc<dyn HubTransport>,
    hosts: RwLock<HostMap>,
    stats: Arc<ContainerStats>,
    next_rotation_us: AtomicU64,
}

impl ContextIndex {
    /// Creates an index over the given collaborators.
    pub fn new(
        config: IndexConfig,
        retention: Arc<dyn RetentionSource>,
        store: Arc<dyn ContextStore>,
        transport: Arc<dyn HubTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            retention,
            store,
            transport,
            hosts: RwLock::new(HostMap::default()),
            stats: ContainerStats::new(),
            next_rotation_us: AtomicU64::new(0),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The persistence bridge.
    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    /// The hub transport.
    pub fn transport(&self) -> &Arc<dyn HubTransport> {
        &self.transport
    }

    /// The storage engine's retention oracle.
    pub fn retention_source(&self) -> &Arc<dyn RetentionSource> {
        &self.retention
    }

    /// The container statistics sink shared by every host.
    pub fn container_stats(&self) -> &Arc<ContainerStats> {
        &self.stats
    }

    /// Registers a host (idempotent by hostname).
    pub fn add_host(&self, hostname: &str, uuid: Uuid, node_id: Option<Uuid>) -> Arc<HostNode> {
        let mut hosts = self.hosts.write();
        if let Some(existing) = hosts.get(hostname) {
            return Arc::clone(existing);
        }
        let host = HostNode::new(hostname, uuid, node_id, Arc::clone(&self.stats));
        hosts.insert(Arc::from(hostname), Arc::clone(&host));
        host
    }

    /// Looks a host up by name.
    pub fn host(&self, hostname: &str) -> Option<Arc<HostNode>> {
        self.hosts.read().get(hostname).cloned()
    }

    /// Handles to every host, in registration order.
    pub fn hosts_snapshot(&self) -> Vec<Arc<HostNode>> {
        self.hosts.read().values().cloned().collect()
    }

    /// Finds the host carrying the given hub node id.
    pub fn find_host_by_node_id(&self, node_id: &Uuid) -> Option<Arc<HostNode>> {
        self.hosts
            .read()
            .values()
            .find(|host| host.node_id() == Some(*node_id))
            .cloned()
    }

    /// Storage engine rotation event: arms the delayed full retention
    /// rescan the worker performs.
    pub fn storage_rotated(&self) {
        let due = now_us() + self.config.rotation_scan_delay.as_micros() as u64;
        self.next_rotation_us.store(due, Ordering::SeqCst);
        info!(due_us = due, "index.storage_rotation.armed");
    }

    /// Consumes the rotation marker when due.
    pub(crate) fn take_due_rotation(&self, now_us: u64) -> bool {
        let due = self.next_rotation_us.load(Ordering::SeqCst);
        if due != 0 && now_us >= due {
            self.next_rotation_us.store(0, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Rehydrates a host from the persistence bridge: shadow rows first,
    /// then the archived charts with their dimensions and labels, then one
    /// unbudgeted garbage-collection pass for rows whose retention is gone.
    pub fn load_host(&self, host: &Arc<HostNode>) -> Result<()> {
        let mut shadows = Vec::new();
        self.store.load_contexts(&host.uuid, &mut |sh| shadows.push(sh))?;
        for shadow in shadows {
            let template = ContextTemplate {
                id: shadow.id.clone(),
                title: Arc::from(""),
                units: Arc::from(""),
                family: Arc::from(""),
                priority: 0,
                chart_type: Default::default(),
                flags: flag::ARCHIVED | flag::LOADED_FROM_STORE,
                shadow: Some(shadow),
            };
            let id = template.id.clone();
            host.contexts.upsert(&id, template);
        }

        let mut charts = Vec::new();
        self.store.load_charts(&host.uuid, &mut |c| charts.push(c))?;
        for chart in charts {
            let (rca, _) = host.contexts.upsert(
                &chart.context,
                ContextTemplate {
                    id: chart.context.clone(),
                    title: Arc::from(chart.title.as_str()),
                    units: Arc::from(chart.units.as_str()),
                    family: Arc::from(chart.family.as_str()),
                    priority: chart.priority,
                    chart_type: chart.chart_type,
                    flags: flag::ARCHIVED | flag::LOADED_FROM_STORE,
                    shadow: None,
                },
            );
            let (ria, _) = rca.instances.upsert(
                &chart.id,
                InstanceTemplate {
                    uuid: chart.uuid,
                    id: chart.id.clone(),
                    name: Some(Arc::from(chart.name.as_str())),
                    title: Arc::from(chart.title.as_str()),
                    units: Arc::from(chart.units.as_str()),
                    family: Arc::from(chart.family.as_str()),
                    chart_type: chart.chart_type,
                    priority: chart.priority,
                    update_every_s: chart.update_every_s,
                    link: None,
                    flags: flag::ARCHIVED | flag::LOADED_FROM_STORE,
                },
            );

            let mut dims = Vec::new();
            self.store.load_dimensions(&chart.uuid, &mut |d| dims.push(d))?;
            for dim in dims {
                let mut bits = flag::ARCHIVED | flag::LOADED_FROM_STORE;
                if dim.hidden {
                    bits |= flag::HIDDEN;
                }
                ria.metrics.upsert(
                    &dim.id,
                    MetricTemplate {
                        uuid: dim.uuid,
                        id: dim.id.clone(),
                        name: Arc::from(dim.name.as_str()),
                        link: None,
                        flags: bits,
                        first_time_s: 0,
                        last_time_s: 0,
                    },
                );
            }

            let mut labels = Vec::new();
            self.store.load_labels(&chart.uuid, &mut |l| labels.push(l))?;
            if !labels.is_empty() {
                let handle = ria.labels();
                let mut set = handle.write();
                for label in labels {
                    set.insert(label.key, label.value);
                }
            }

            ria.trigger_updates();
        }

        for rc in host.contexts.snapshot() {
            rc.trigger_updates();
        }

        gc::garbage_collect_host(self, host, &mut None);
        Ok(())
    }

    /// Forces a reducer pass over one context, with an extra reason.
    pub fn recalculate_context_retention(&self, rc: &Arc<ContextNode>, reason: u32) {
        post_process::context_post_process(self, rc, true, reason);
    }

    /// Forces a reducer pass over every context of a host and refreshes the
    /// host's cached retention window.
    pub fn recalculate_host_retention(&self, host: &Arc<HostNode>, reason: u32) {
        let mut first = 0i64;
        let mut last = 0i64;
        for rc in host.contexts.snapshot() {
            self.recalculate_context_retention(&rc, reason);
            let (f, l) = rc.retention();
            if f != 0 && (first == 0 || f < first) {
                first = f;
            }
            if l > last {
                last = l;
            }
        }
        host.update_cached_retention(first, last, true);
    }

    /// A child host disconnected from this agent: archive its collected
    /// nodes and recompute retention.
    pub fn host_child_disconnected(&self, host: &Arc<HostNode>) {
        self.recalculate_host_retention(host, flag::DISCONNECTED_CHILD);
    }

    /// Looks up the stored UUID of a dimension by the ids of its chart, so
    /// the storage engine can reuse identities across restarts.
    pub fn find_dimension_uuid(&self, chart: &Chart, dim_id: &str) -> Option<Uuid> {
        let host = chart.host()?;
        let rc = host.contexts.get(&chart.context())?;
        let ri = rc.instances.get(&chart.id)?;
        let rm = ri.metrics.get(dim_id)?;
        Some(rm.uuid())
    }

    /// Looks up the stored UUID of a chart by its ids.
    pub fn find_chart_uuid(&self, chart: &Chart) -> Option<Uuid> {
        let host = chart.host()?;
        let rc = host.contexts.get(&chart.context())?;
        let ri = rc.instances.get(&chart.id)?;
        Some(ri.uuid())
    }

    /// Visits every instance of a context that still has a live chart.
    /// The callback's counts are summed; `Break` stops the walk.
    pub fn foreach_instance_in_context(
        &self,
        host: &Arc<HostNode>,
        context_id: &str,
        mut cb: impl FnMut(&Arc<Chart>) -> ControlFlow<(), u64>,
    ) -> u64 {
        let Some(rc) = host.contexts.get(context_id) else {
            return 0;
        };
        let mut total = 0;
        for ri in rc.instances.snapshot() {
            let link = ri.link.lock().clone();
            if let Some(chart) = link {
                match cb(&chart) {
                    ControlFlow::Continue(n) => total += n,
                    ControlFlow::Break(()) => break,
                }
            }
        }
        total
    }

    /// Acquired triples for every non-deleted metric of the host whose
    /// context matches the pattern (all contexts when `None`).
    pub fn all_metrics(
        &self,
        host: &Arc<HostNode>,
        contexts: Option<&SimplePattern>,
    ) -> Vec<MetricTriple> {
        let mut out = Vec::new();
        for rc in host.contexts.snapshot() {
            if rc.flags.is_deleted() {
                continue;
            }
            if let Some(pattern) = contexts {
                if !pattern.matches(&rc.id) {
                    continue;
                }
            }
            for ri in rc.instances.snapshot() {
                if ri.flags.is_deleted() {
                    continue;
                }
                for rm in ri.metrics.snapshot() {
                    if rm.flags.is_deleted() {
                        continue;
                    }
                    out.push(MetricTriple {
                        context: Arc::clone(&rc),
                        instance: Arc::clone(&ri),
                        metric: rm,
                    });
                }
            }
        }
        out
    }
}
