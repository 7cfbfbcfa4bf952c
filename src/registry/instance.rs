//! Instance nodes.
//!
//! An instance groups the metrics of one collected chart and owns the
//! chart's descriptive metadata inside the index. Its label set is
//! borrowed from the live chart while one is linked and becomes an owned
//! copy the moment the link is severed.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::error;
use uuid::Uuid;

use crate::collection::{live_flag, Chart, ChartType, Labels};
use crate::registry::container::{ContainerItem, ContainerStats, ObservableMap};
use crate::registry::context::ContextNode;
use crate::registry::flags::{flag, NodeFlags, ALLOWED_EXTERNALLY_ON_NEW_OBJECTS,
    PREVENTING_DELETIONS, REQUIRED_FOR_DELETIONS};
use crate::registry::metric::MetricNode;

/// Label set of an instance: shared with the live chart, or an owned copy.
pub enum LabelLink {
    /// Borrowed from the linked chart.
    Borrowed(Arc<RwLock<Labels>>),
    /// Independent copy, made when the link was severed.
    Owned(Arc<RwLock<Labels>>),
}

impl LabelLink {
    fn handle(&self) -> Arc<RwLock<Labels>> {
        match self {
            LabelLink::Borrowed(l) | LabelLink::Owned(l) => Arc::clone(l),
        }
    }
}

/// Mutable descriptive metadata of an instance.
#[derive(Debug, Clone)]
pub struct InstanceMeta {
    /// Stable binary identity of the chart.
    pub uuid: Uuid,
    /// Display name; defaults to the id.
    pub name: Arc<str>,
    /// Chart title.
    pub title: Arc<str>,
    /// Measurement units.
    pub units: Arc<str>,
    /// Family grouping.
    pub family: Arc<str>,
    /// Menu ordering priority (24-bit in practice).
    pub priority: u32,
    /// Rendering type.
    pub chart_type: ChartType,
    /// Collection cadence in seconds.
    pub update_every_s: i64,
}

/// Template handed to the instances container on upsert.
pub struct InstanceTemplate {
    /// Stable binary identity.
    pub uuid: Uuid,
    /// Textual id, the container key.
    pub id: String,
    /// Display name; `None` defaults to the id.
    pub name: Option<Arc<str>>,
    /// Chart title.
    pub title: Arc<str>,
    /// Measurement units.
    pub units: Arc<str>,
    /// Family grouping.
    pub family: Arc<str>,
    /// Rendering type.
    pub chart_type: ChartType,
    /// Menu ordering priority.
    pub priority: u32,
    /// Collection cadence in seconds.
    pub update_every_s: i64,
    /// Live chart feeding this instance, when collected.
    pub link: Option<Arc<Chart>>,
    /// Initial flag bits; masked to the externally-allowed set.
    pub flags: u32,
}

/// One collected chart inside its context.
pub struct InstanceNode {
    /// Textual id, unique within the context.
    pub id: Arc<str>,
    meta: RwLock<InstanceMeta>,
    labels: RwLock<LabelLink>,
    /// Live chart link; `None` once archived.
    pub link: Mutex<Option<Arc<Chart>>>,
    /// Oldest sample time folded from the metrics; zero when unknown.
    pub first_time_s: AtomicI64,
    /// Latest sample time folded from the metrics; zero when unknown.
    pub last_time_s: AtomicI64,
    /// The node's flag word.
    pub flags: NodeFlags,
    /// Metrics of this instance, keyed by textual id.
    pub metrics: ObservableMap<MetricNode>,
    /// Dimension-collected events observed; diagnostic counter.
    pub collected_metrics: AtomicU32,
    context: Weak<ContextNode>,
}

impl InstanceNode {
    /// The owning context.
    pub fn context(&self) -> Option<Arc<ContextNode>> {
        self.context.upgrade()
    }

    /// The stable binary identity.
    pub fn uuid(&self) -> Uuid {
        self.meta.read().uuid
    }

    /// The display name.
    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.meta.read().name)
    }

    /// The chart title.
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

    /// The collection cadence in seconds.
    pub fn update_every_s(&self) -> i64 {
        self.meta.read().update_every_s
    }

    /// Retention window `(first, last)`, zeros when unknown.
    pub fn retention(&self) -> (i64, i64) {
        (
            self.first_time_s.load(Ordering::SeqCst),
            self.last_time_s.load(Ordering::SeqCst),
        )
    }

    /// Handle to the instance's label set, borrowed or owned.
    pub fn labels(&self) -> Arc<RwLock<Labels>> {
        self.labels.read().handle()
    }

    /// True when the label set is an owned copy.
    pub fn owns_labels(&self) -> bool {
        self.flags.check(flag::OWN_LABELS)
    }

    /// Severs label borrowing by deep-copying the given set, if the
    /// instance does not already own its labels.
    pub(crate) fn own_labels_copy(&self, source: &Arc<RwLock<Labels>>) {
        let mut labels = self.labels.write();
        if !self.flags.check(flag::OWN_LABELS) {
            let copy = source.read().clone();
            *labels = LabelLink::Owned(Arc::new(RwLock::new(copy)));
            self.flags.set(flag::OWN_LABELS);
        }
    }

    /// Replaces the label set with a fresh owned one.
    pub(crate) fn own_labels_empty(&self) {
        *self.labels.write() = LabelLink::Owned(Arc::new(RwLock::new(Labels::default())));
        self.flags.set(flag::OWN_LABELS);
    }

    /// The instance deletion gate.
    pub fn should_be_deleted(&self) -> bool {
        if !self.flags.check_all(REQUIRED_FOR_DELETIONS) {
            return false;
        }
        if self.flags.check(PREVENTING_DELETIONS) {
            return false;
        }
        if self.link.lock().is_some() {
            return false;
        }
        if self.metrics.referenced_items() != 0 {
            return false;
        }
        if !self.metrics.is_empty() {
            return false;
        }
        let (first, last) = self.retention();
        first == 0 && last == 0
    }

    /// Re-derives priority and cadence from the live chart, archives the
    /// instance when collected without a link, and queues the context for
    /// post-processing when anything is pending.
    pub(crate) fn trigger_updates(self: &Arc<Self>) {
        let link = self.link.lock().clone();
        if let Some(chart) = link {
            let priority = chart.priority();
            let update_every_s = chart.update_every_s();
            let mut meta = self.meta.write();
            if meta.priority != priority {
                meta.priority = priority;
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.update_every_s != update_every_s {
                meta.update_every_s = update_every_s;
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
        } else if self.flags.is_collected() {
            // no live chart, but still marked collected
            self.flags.set_archived();
            self.flags.set_updated(flag::CHANGED_LINKING);
        }

        if self.flags.is_updated() || !self.flags.check(flag::LIVE_RETENTION) {
            if let Some(rc) = self.context() {
                rc.flags.set_updated(flag::TRIGGERED);
                rc.queue_for_post_processing();
            }
        }
    }
}

impl ContainerItem for InstanceNode {
    type Parent = Weak<ContextNode>;
    type Template = InstanceTemplate;

    fn on_insert(parent: &Weak<ContextNode>, t: InstanceTemplate, self_ref: &Weak<Self>) -> Self {
        let stats = parent
            .upgrade()
            .map(|rc| Arc::clone(rc.instances.stats()))
            .unwrap_or_else(ContainerStats::new);

        let name = t.name.unwrap_or_else(|| Arc::from(t.id.as_str()));
        let mut bits =
            (t.flags & ALLOWED_EXTERNALLY_ON_NEW_OBJECTS) | flag::UPDATED | flag::NEW_OBJECT;

        let labels = match &t.link {
            Some(chart) => {
                if chart.flag_check(live_flag::HIDDEN) {
                    bits |= flag::HIDDEN;
                } else {
                    bits &= !flag::HIDDEN;
                }
                LabelLink::Borrowed(Arc::clone(&chart.labels))
            }
            None => {
                bits |= flag::OWN_LABELS;
                LabelLink::Owned(Arc::new(RwLock::new(Labels::default())))
            }
        };

        Self {
            id: Arc::from(t.id.as_str()),
            meta: RwLock::new(InstanceMeta {
                uuid: t.uuid,
                name,
                title: t.title,
                units: t.units,
                family: t.family,
                priority: t.priority,
                chart_type: t.chart_type,
                update_every_s: t.update_every_s,
            }),
            labels: RwLock::new(labels),
            link: Mutex::new(t.link),
            first_time_s: AtomicI64::new(0),
            last_time_s: AtomicI64::new(0),
            flags: NodeFlags::new(bits),
            metrics: ObservableMap::new(Weak::clone(self_ref), stats),
            collected_metrics: AtomicU32::new(0),
            context: Weak::clone(parent),
        }
    }

    fn on_conflict(&self, _parent: &Weak<ContextNode>, t: InstanceTemplate) -> bool {
        {
            let mut meta = self.meta.write();
            if meta.uuid != t.uuid {
                meta.uuid = t.uuid;
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if let Some(name) = &t.name {
                if meta.name != *name {
                    meta.name = Arc::clone(name);
                    self.flags.set_updated(flag::CHANGED_METADATA);
                }
            }
            if meta.title != t.title {
                meta.title = Arc::clone(&t.title);
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.units != t.units {
                meta.units = Arc::clone(&t.units);
                self.flags.set_updated(flag::CHANGED_METADATA);
            }
            if meta.family != t.family {
                meta.family = Arc::clone(&t.family);
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
            if meta.update_every_s != t.update_every_s {
                meta.update_every_s = t.update_every_s;
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
                *link = t.link.clone();

                match &*link {
                    Some(chart) if self.flags.check(flag::OWN_LABELS) => {
                        // back to borrowing the live chart's labels
                        *self.labels.write() = LabelLink::Borrowed(Arc::clone(&chart.labels));
                        self.flags.clear(flag::OWN_LABELS);
                    }
                    None if !self.flags.check(flag::OWN_LABELS) => {
                        self.own_labels_empty();
                    }
                    _ => {}
                }
            }

            if let Some(chart) = &*link {
                if chart.flag_check(live_flag::HIDDEN) {
                    self.flags.set(flag::HIDDEN);
                } else {
                    self.flags.clear(flag::HIDDEN);
                }
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

    fn on_react(self: &Arc<Self>, _parent: &Weak<ContextNode>, _created: bool) {
        self.trigger_updates();
    }

    fn on_remove(&self, _parent: &Weak<ContextNode>) {
        if self.link.lock().is_some() {
            error!(instance = %self.id, "instance removed while a live chart is linked to it");
        }
    }
}
