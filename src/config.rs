//! Tunables for the worker loop, garbage collection and hub dispatch.

use std::time::Duration;

/// Configuration for a [`crate::ContextIndex`] and its worker.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Worker loop heartbeat.
    pub heartbeat: Duration,
    /// Delay between a storage rotation event and the full retention rescan.
    pub rotation_scan_delay: Duration,
    /// Maximum node deletions per garbage-collection pass.
    pub gc_max_rows_per_pass: usize,
    /// Maximum messages per dispatch bundle, per host, per drain pass.
    pub dispatch_bundle_cap: usize,
    /// Instances below this priority do not participate in the context
    /// priority fold.
    pub minimum_priority: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(1),
            rotation_scan_delay: Duration::from_secs(120),
            gc_max_rows_per_pass: 500,
            dispatch_bundle_cap: 5_000,
            minimum_priority: 10,
        }
    }
}

impl IndexConfig {
    /// Aggressive settings for tests: tiny GC budget, immediate rotation scan.
    pub fn for_tests() -> Self {
        Self {
            heartbeat: Duration::from_millis(10),
            rotation_scan_delay: Duration::from_millis(0),
            ..Self::default()
        }
    }
}
