//! The persistence bridge.
//!
//! Context-level metadata survives restarts through a small tabular store:
//! one row per (host, context) holding the last state successfully sent to
//! the hub, plus read-only streams of archived charts, dimensions and
//! labels used to rehydrate the tree at startup. Everything else about the
//! store is opaque to the index.

mod sqlite;

pub use sqlite::SqliteContextStore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collection::ChartType;
use crate::error::{ContextError, Result};

/// The last-sent state of one context, as persisted and compared against
/// the live tree by the dispatch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowRecord {
    /// Context id, unique per host.
    pub id: String,
    /// Monotonic version counter, bumped on every dispatch.
    pub version: u64,
    /// Context title.
    pub title: String,
    /// Measurement units.
    pub units: String,
    /// Family grouping.
    pub family: String,
    /// Rendering type.
    pub chart_type: ChartType,
    /// Menu ordering priority.
    pub priority: u32,
    /// Oldest sample time, seconds.
    pub first_time_s: i64,
    /// Latest sample time, seconds; zero while the context is collected.
    pub last_time_s: i64,
    /// Whether the context was deleted when last dispatched.
    pub deleted: bool,
}

impl ShadowRecord {
    /// Structural equality of everything the hub can see, ignoring the
    /// version counter. The dispatch path transmits iff this is false.
    pub fn same_visible_state(&self, other: &ShadowRecord) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.units == other.units
            && self.family == other.family
            && self.chart_type == other.chart_type
            && self.priority == other.priority
            && self.first_time_s == other.first_time_s
            && self.last_time_s == other.last_time_s
            && self.deleted == other.deleted
    }
}

/// Archived chart metadata streamed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartRecord {
    /// Stable binary identity of the chart.
    pub uuid: Uuid,
    /// Textual chart id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Semantic (context) id.
    pub context: String,
    /// Chart title.
    pub title: String,
    /// Measurement units.
    pub units: String,
    /// Family grouping.
    pub family: String,
    /// Menu ordering priority.
    pub priority: u32,
    /// Collection cadence, seconds.
    pub update_every_s: i64,
    /// Rendering type.
    pub chart_type: ChartType,
}

/// Archived dimension metadata streamed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRecord {
    /// Stable binary identity of the dimension.
    pub uuid: Uuid,
    /// Textual dimension id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the dimension is hidden from the hub.
    pub hidden: bool,
}

/// Archived chart label streamed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Label key.
    pub key: String,
    /// Label value.
    pub value: String,
}

/// The tabular store consumed by the index.
pub trait ContextStore: Send + Sync {
    /// Streams the shadow records of every context of a host.
    fn load_contexts(&self, host_uuid: &Uuid, cb: &mut dyn FnMut(ShadowRecord)) -> Result<()>;

    /// Streams the archived charts of a host.
    fn load_charts(&self, host_uuid: &Uuid, cb: &mut dyn FnMut(ChartRecord)) -> Result<()>;

    /// Streams the archived dimensions of a chart.
    fn load_dimensions(&self, chart_uuid: &Uuid, cb: &mut dyn FnMut(DimensionRecord))
        -> Result<()>;

    /// Streams the archived labels of a chart.
    fn load_labels(&self, chart_uuid: &Uuid, cb: &mut dyn FnMut(LabelRecord)) -> Result<()>;

    /// Upserts the shadow row of a context. Called on every successful
    /// dispatch.
    fn store_context(&self, host_uuid: &Uuid, shadow: &ShadowRecord) -> Result<()>;

    /// Removes the shadow row of a context. Called on terminal deletion.
    fn delete_context(&self, host_uuid: &Uuid, id: &str) -> Result<()>;
}

/// One recorded mutation of a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    /// `store_context(host, shadow)`.
    Store(Uuid, ShadowRecord),
    /// `delete_context(host, id)`.
    Delete(Uuid, String),
}

/// In-memory store that records every mutation; the test double for the
/// persistence bridge.
#[derive(Default)]
pub struct MemoryStore {
    contexts: Mutex<HashMap<(Uuid, String), ShadowRecord>>,
    charts: Mutex<HashMap<Uuid, Vec<ChartRecord>>>,
    dimensions: Mutex<HashMap<Uuid, Vec<DimensionRecord>>>,
    labels: Mutex<HashMap<Uuid, Vec<LabelRecord>>>,
    calls: Mutex<Vec<StoreCall>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a shadow row, as a previous run would have left it.
    pub fn seed_context(&self, host_uuid: Uuid, shadow: ShadowRecord) {
        self.contexts
            .lock()
            .insert((host_uuid, shadow.id.clone()), shadow);
    }

    /// Seeds an archived chart for `load_charts`.
    pub fn seed_chart(&self, host_uuid: Uuid, chart: ChartRecord) {
        self.charts.lock().entry(host_uuid).or_default().push(chart);
    }

    /// Seeds an archived dimension for `load_dimensions`.
    pub fn seed_dimension(&self, chart_uuid: Uuid, dim: DimensionRecord) {
        self.dimensions
            .lock()
            .entry(chart_uuid)
            .or_default()
            .push(dim);
    }

    /// Seeds an archived label for `load_labels`.
    pub fn seed_label(&self, chart_uuid: Uuid, label: LabelRecord) {
        self.labels.lock().entry(chart_uuid).or_default().push(label);
    }

    /// Makes every write fail until called again with `false`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every mutation recorded so far, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    /// The current shadow row of a context, if present.
    pub fn shadow(&self, host_uuid: &Uuid, id: &str) -> Option<ShadowRecord> {
        self.contexts
            .lock()
            .get(&(*host_uuid, id.to_string()))
            .cloned()
    }

    /// Number of shadow rows stored for a host.
    pub fn context_rows(&self, host_uuid: &Uuid) -> usize {
        self.contexts
            .lock()
            .keys()
            .filter(|(h, _)| h == host_uuid)
            .count()
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ContextError::Corruption("injected write failure".into()));
        }
        Ok(())
    }
}

impl ContextStore for MemoryStore {
    fn load_contexts(&self, host_uuid: &Uuid, cb: &mut dyn FnMut(ShadowRecord)) -> Result<()> {
        let contexts = self.contexts.lock();
        for ((host, _), shadow) in contexts.iter() {
            if host == host_uuid {
                cb(shadow.clone());
            }
        }
        Ok(())
    }

    fn load_charts(&self, host_uuid: &Uuid, cb: &mut dyn FnMut(ChartRecord)) -> Result<()> {
        if let Some(charts) = self.charts.lock().get(host_uuid) {
            for chart in charts {
                cb(chart.clone());
            }
        }
        Ok(())
    }

    fn load_dimensions(
        &self,
        chart_uuid: &Uuid,
        cb: &mut dyn FnMut(DimensionRecord),
    ) -> Result<()> {
        if let Some(dims) = self.dimensions.lock().get(chart_uuid) {
            for dim in dims {
                cb(dim.clone());
            }
        }
        Ok(())
    }

    fn load_labels(&self, chart_uuid: &Uuid, cb: &mut dyn FnMut(LabelRecord)) -> Result<()> {
        if let Some(labels) = self.labels.lock().get(chart_uuid) {
            for label in labels {
                cb(label.clone());
            }
        }
        Ok(())
    }

    fn store_context(&self, host_uuid: &Uuid, shadow: &ShadowRecord) -> Result<()> {
        self.check_writes()?;
        self.contexts
            .lock()
            .insert((*host_uuid, shadow.id.clone()), shadow.clone());
        self.calls
            .lock()
            .push(StoreCall::Store(*host_uuid, shadow.clone()));
        Ok(())
    }

    fn delete_context(&self, host_uuid: &Uuid, id: &str) -> Result<()> {
        self.check_writes()?;
        self.contexts.lock().remove(&(*host_uuid, id.to_string()));
        self.calls
            .lock()
            .push(StoreCall::Delete(*host_uuid, id.to_string()));
        Ok(())
    }
}
