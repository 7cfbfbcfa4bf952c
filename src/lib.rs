//! # ctxindex - Context Metadata Index
//!
//! The in-process hierarchical metadata index a monitoring agent keeps
//! over every metric it collects: contexts group instances, instances
//! group metrics, and a background worker keeps retention and state
//! consistent with the time-series store while dispatching incremental
//! updates to a remote hub.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use ctxindex::{ContextIndex, IndexConfig, MemoryRetention, MemoryStore, RecordingTransport};
//! use ctxindex::{Chart, ChartDef, ChartType, Dimension};
//! use uuid::Uuid;
//!
//! let index = ContextIndex::new(
//!     IndexConfig::default(),
//!     Arc::new(MemoryRetention::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(RecordingTransport::claimed("claim")),
//! );
//! let host = index.add_host("localhost", Uuid::new_v4(), None);
//!
//! let chart = Chart::new(&host, ChartDef {
//!     uuid: Uuid::new_v4(),
//!     id: "system.cpu".into(),
//!     name: "cpu".into(),
//!     context: "system.cpu".into(),
//!     title: "CPU usage".into(),
//!     units: "percentage".into(),
//!     family: "utilization".into(),
//!     priority: 100,
//!     chart_type: ChartType::Stacked,
//!     update_every_s: 1,
//! });
//! index.chart_created(&chart);
//!
//! let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
//! index.dimension_created(&dim);
//! index.dimension_collected(&dim);
//!
//! index.run_tick(0);
//! assert!(host.contexts.get("system.cpu").is_some());
//! ```
//!
//! ## Architecture
//!
//! - **Containers**: every level of the tree and both context queues go
//!   through one observable keyed map with insert/conflict/react hooks.
//! - **Hooks**: the collection side reports chart/dimension lifecycle
//!   through O(1) entry points that only flip atomic flag bits.
//! - **Worker**: a single cooperative loop folds child state upward,
//!   debounces hub dispatch and garbage-collects deleted nodes.
//! - **Persistence**: context shadows survive restarts in a small SQLite
//!   table so reconnection never resends unchanged state.

pub mod clock;
pub mod collection;
pub mod config;
pub mod error;
pub mod hooks;
pub mod hub;
pub mod index;
pub mod logging;
pub mod query;
pub mod registry;
pub mod retention;
pub mod store;
pub mod worker;

// Re-export the main public API
pub use crate::collection::{Chart, ChartDef, ChartType, Dimension, Labels};
pub use crate::config::IndexConfig;
pub use crate::error::{ContextError, Result};
pub use crate::hub::{
    CheckpointCommand, ContextMessage, HubTransport, RecordingTransport, SnapshotBundle,
    StopStreamingCommand, UpdateBundle,
};
pub use crate::index::{ContextIndex, MetricTriple};
pub use crate::query::pattern::{PatternMatch, SimplePattern};
pub use crate::query::scope::{ScopeError, ScopeOptions, ScopeStats, ScopeVisit};
pub use crate::registry::context::ContextNode;
pub use crate::registry::host::HostNode;
pub use crate::registry::instance::InstanceNode;
pub use crate::registry::metric::MetricNode;
pub use crate::retention::{MemoryRetention, RetentionSource};
pub use crate::store::{
    ChartRecord, ContextStore, DimensionRecord, LabelRecord, MemoryStore, ShadowRecord,
    SqliteContextStore, StoreCall,
};
pub use crate::worker::WorkerHandle;
