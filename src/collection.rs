//! Live collection objects.
//!
//! A [`Chart`] and its [`Dimension`]s are what the collector side of the
//! agent maintains while a data source is active. The index never owns
//! them: instance and metric nodes hold an optional link to them, and the
//! collection hooks ([`crate::ContextIndex`]) translate their lifecycle
//! into index mutations. When a chart or dimension goes away, the link is
//! severed and the index node lives on with archived state.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::context::ContextNode;
use crate::registry::host::HostNode;
use crate::registry::instance::InstanceNode;
use crate::registry::metric::MetricNode;

/// Ordered label map attached to a chart (and borrowed or copied by its
/// instance node).
pub type Labels = IndexMap<String, String>;

/// Flag bits for live charts and dimensions.
pub mod live_flag {
    /// Not exposed to the hub or queries.
    pub const HIDDEN: u32 = 1 << 0;
    /// Marked obsolete by the collector; will be freed soon.
    pub const OBSOLETE: u32 = 1 << 1;
    /// No longer collected.
    pub const ARCHIVED: u32 = 1 << 2;
}

/// Rendering type of a chart, also folded into its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    /// Plain line chart.
    #[default]
    Line,
    /// Filled area chart.
    Area,
    /// Stacked area chart.
    Stacked,
}

impl ChartType {
    /// Canonical textual form, as persisted and sent to the hub.
    pub fn as_str(self) -> &'static str {
        match self {
            ChartType::Line => "line",
            ChartType::Area => "area",
            ChartType::Stacked => "stacked",
        }
    }

    /// Parses the canonical textual form; unknown input falls back to line.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "area" => ChartType::Area,
            "stacked" => ChartType::Stacked,
            _ => ChartType::Line,
        }
    }
}

/// Everything needed to register a chart with the collection side.
#[derive(Debug, Clone)]
pub struct ChartDef {
    /// Stable binary identity.
    pub uuid: Uuid,
    /// Textual id, unique per host.
    pub id: String,
    /// Display name; defaults to the id when empty.
    pub name: String,
    /// Semantic (context) id this chart belongs to.
    pub context: String,
    /// Chart title.
    pub title: String,
    /// Measurement units.
    pub units: String,
    /// Family grouping.
    pub family: String,
    /// Menu ordering priority.
    pub priority: u32,
    /// Rendering type.
    pub chart_type: ChartType,
    /// Collection cadence in seconds.
    pub update_every_s: i64,
}

/// Index-node links held by a live chart.
#[derive(Default)]
pub struct ChartLinks {
    /// Acquired context node, once the chart is indexed.
    pub context: Option<Arc<ContextNode>>,
    /// Acquired instance node, once the chart is indexed.
    pub instance: Option<Arc<InstanceNode>>,
}

/// One live chart, the collector-side realisation of an instance.
pub struct Chart {
    /// Stable binary identity.
    pub uuid: Uuid,
    /// Textual id, unique per host.
    pub id: Arc<str>,
    name: RwLock<Arc<str>>,
    context: RwLock<Arc<str>>,
    /// Chart title.
    pub title: Arc<str>,
    /// Measurement units.
    pub units: Arc<str>,
    /// Family grouping.
    pub family: Arc<str>,
    priority: AtomicU32,
    /// Rendering type.
    pub chart_type: ChartType,
    update_every_s: AtomicI64,
    /// Labels shared with (or copied by) the instance node.
    pub labels: Arc<RwLock<Labels>>,
    flags: AtomicU32,
    host: Weak<HostNode>,
    /// Back-links to the acquired index nodes.
    pub links: Mutex<ChartLinks>,
    dimensions: RwLock<Vec<Arc<Dimension>>>,
}

impl Chart {
    /// Creates a live chart bound to its host.
    pub fn new(host: &Arc<HostNode>, def: ChartDef) -> Arc<Self> {
        let name = if def.name.is_empty() { def.id.clone() } else { def.name };
        Arc::new(Self {
            uuid: def.uuid,
            id: Arc::from(def.id.as_str()),
            name: RwLock::new(Arc::from(name.as_str())),
            context: RwLock::new(Arc::from(def.context.as_str())),
            title: Arc::from(def.title.as_str()),
            units: Arc::from(def.units.as_str()),
            family: Arc::from(def.family.as_str()),
            priority: AtomicU32::new(def.priority),
            chart_type: def.chart_type,
            update_every_s: AtomicI64::new(def.update_every_s),
            labels: Arc::new(RwLock::new(Labels::default())),
            flags: AtomicU32::new(0),
            host: Arc::downgrade(host),
            links: Mutex::new(ChartLinks::default()),
            dimensions: RwLock::new(Vec::new()),
        })
    }

    /// Handles to the chart's dimensions, in creation order.
    pub fn dimensions(&self) -> Vec<Arc<Dimension>> {
        self.dimensions.read().clone()
    }

    /// The owning host, while it is alive.
    pub fn host(&self) -> Option<Arc<HostNode>> {
        self.host.upgrade()
    }

    /// Current display name.
    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.name.read())
    }

    /// Renames the chart; the caller follows up with the chart hook.
    pub fn set_name(&self, name: &str) {
        *self.name.write() = Arc::from(name);
    }

    /// Current semantic (context) id.
    pub fn context(&self) -> Arc<str> {
        Arc::clone(&self.context.read())
    }

    /// Repoints the chart at another context; the caller follows up with
    /// the chart hook so the index migrates the sub-tree.
    pub fn set_context(&self, context: &str) {
        *self.context.write() = Arc::from(context);
    }

    /// Menu ordering priority.
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Updates the priority.
    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Collection cadence in seconds.
    pub fn update_every_s(&self) -> i64 {
        self.update_every_s.load(Ordering::Relaxed)
    }

    /// Updates the collection cadence.
    pub fn set_update_every_s(&self, seconds: i64) {
        self.update_every_s.store(seconds, Ordering::Relaxed);
    }

    /// True when any of the given [`live_flag`] bits is set.
    pub fn flag_check(&self, bits: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bits != 0
    }

    /// Sets [`live_flag`] bits.
    pub fn flag_set(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::SeqCst);
    }

    /// Clears [`live_flag`] bits.
    pub fn flag_clear(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::SeqCst);
    }
}

/// One live dimension of a chart.
pub struct Dimension {
    /// Stable binary identity.
    pub uuid: Uuid,
    /// Textual id, unique within the chart.
    pub id: Arc<str>,
    name: RwLock<Arc<str>>,
    chart: Weak<Chart>,
    flags: AtomicU32,
    /// Back-link to the acquired metric node.
    pub link: Mutex<Option<Arc<MetricNode>>>,
}

impl Dimension {
    /// Creates a live dimension bound to its chart.
    pub fn new(chart: &Arc<Chart>, uuid: Uuid, id: &str, name: &str) -> Arc<Self> {
        let name = if name.is_empty() { id } else { name };
        let dim = Arc::new(Self {
            uuid,
            id: Arc::from(id),
            name: RwLock::new(Arc::from(name)),
            chart: Arc::downgrade(chart),
            flags: AtomicU32::new(0),
            link: Mutex::new(None),
        });
        chart.dimensions.write().push(Arc::clone(&dim));
        dim
    }

    /// The owning chart, while it is alive.
    pub fn chart(&self) -> Option<Arc<Chart>> {
        self.chart.upgrade()
    }

    /// Current display name.
    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.name.read())
    }

    /// Renames the dimension; the caller follows up with the dimension hook.
    pub fn set_name(&self, name: &str) {
        *self.name.write() = Arc::from(name);
    }

    /// True when any of the given [`live_flag`] bits is set.
    pub fn flag_check(&self, bits: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bits != 0
    }

    /// Sets [`live_flag`] bits.
    pub fn flag_set(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::SeqCst);
    }

    /// Clears [`live_flag`] bits.
    pub fn flag_clear(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::SeqCst);
    }
}
