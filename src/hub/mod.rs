//! The hub-facing edge.
//!
//! The index never speaks the wire protocol itself: it appends messages to
//! opaque bundles and hands them to a [`HubTransport`]. Inbound, the hub
//! can ask for a checkpoint (a version-hash comparison) or tell a host to
//! stop streaming; both commands are validated against the agent's claim
//! id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::report_store_error;
use crate::index::ContextIndex;
use crate::registry::flags::flag;
use crate::registry::host::HostNode;
use crate::store::ShadowRecord;
use crate::worker::dispatch::send_context_unsafe;

/// One context update as sent to the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMessage {
    /// Context id.
    pub id: String,
    /// Version being announced.
    pub version: u64,
    /// Context title.
    pub title: String,
    /// Measurement units.
    pub units: String,
    /// Family grouping.
    pub family: String,
    /// Rendering type, canonical text.
    pub chart_type: &'static str,
    /// Menu ordering priority.
    pub priority: u32,
    /// Oldest sample time, seconds.
    pub first_entry: i64,
    /// Latest sample time, seconds; zero while collected.
    pub last_entry: i64,
    /// Whether the context is deleted.
    pub deleted: bool,
}

impl ContextMessage {
    /// Builds the message for a freshly committed shadow.
    pub fn from_shadow(shadow: &ShadowRecord) -> Self {
        Self {
            id: shadow.id.clone(),
            version: shadow.version,
            title: shadow.title.clone(),
            units: shadow.units.clone(),
            family: shadow.family.clone(),
            chart_type: shadow.chart_type.as_str(),
            priority: shadow.priority,
            first_entry: shadow.first_time_s,
            last_entry: shadow.last_time_s,
            deleted: shadow.deleted,
        }
    }
}

/// A batch of incremental context updates for one host.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateBundle {
    /// The agent's claim id.
    pub claim_id: String,
    /// The host's hub-assigned node id.
    pub node_id: Uuid,
    /// Version hash of the host after these updates.
    pub version_hash: u64,
    /// When the bundle was assembled, microseconds.
    pub created_at_us: u64,
    /// The updates, at most the configured bundle cap.
    pub messages: Vec<ContextMessage>,
}

impl UpdateBundle {
    /// Serialises the bundle for transports that speak JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A full snapshot of every non-deleted context of one host.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotBundle {
    /// The agent's claim id.
    pub claim_id: String,
    /// The host's hub-assigned node id.
    pub node_id: Uuid,
    /// Version hash matching the snapshot contents.
    pub version_hash: u64,
    /// One message per non-deleted context.
    pub messages: Vec<ContextMessage>,
}

impl SnapshotBundle {
    /// Serialises the bundle for transports that speak JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The outbound transport the index hands bundles to.
pub trait HubTransport: Send + Sync {
    /// The agent's claim id, once claimed.
    fn claim_id(&self) -> Option<String>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Ships an incremental update bundle.
    fn send_updates(&self, bundle: UpdateBundle);

    /// Ships a full snapshot bundle.
    fn send_snapshot(&self, bundle: SnapshotBundle);
}

/// Transport double that records every bundle; used by tests and tooling.
#[derive(Default)]
pub struct RecordingTransport {
    claim: Mutex<Option<String>>,
    connected: AtomicBool,
    updates: Mutex<Vec<UpdateBundle>>,
    snapshots: Mutex<Vec<SnapshotBundle>>,
}

impl RecordingTransport {
    /// A connected transport with the given claim id.
    pub fn claimed(claim_id: &str) -> Self {
        let t = Self::default();
        *t.claim.lock() = Some(claim_id.to_string());
        t.connected.store(true, Ordering::SeqCst);
        t
    }

    /// Sets or clears the claim id.
    pub fn set_claim_id(&self, claim_id: Option<String>) {
        *self.claim.lock() = claim_id;
    }

    /// Flips the connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every update bundle sent so far.
    pub fn updates(&self) -> Vec<UpdateBundle> {
        self.updates.lock().clone()
    }

    /// Every snapshot bundle sent so far.
    pub fn snapshots(&self) -> Vec<SnapshotBundle> {
        self.snapshots.lock().clone()
    }
}

impl HubTransport for RecordingTransport {
    fn claim_id(&self) -> Option<String> {
        self.claim.lock().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_updates(&self, bundle: UpdateBundle) {
        self.updates.lock().push(bundle);
    }

    fn send_snapshot(&self, bundle: SnapshotBundle) {
        self.snapshots.lock().push(bundle);
    }
}

/// Inbound checkpoint command: the hub announces the version hash it holds.
#[derive(Debug, Clone)]
pub struct CheckpointCommand {
    /// Claim id the hub believes it is talking to.
    pub claim_id: String,
    /// Target host.
    pub node_id: Uuid,
    /// The hub's version hash for that host.
    pub version_hash: u64,
}

/// Inbound stop-streaming command.
#[derive(Debug, Clone)]
pub struct StopStreamingCommand {
    /// Claim id the hub believes it is talking to.
    pub claim_id: String,
    /// Target host.
    pub node_id: Uuid,
}

/// 64-bit mix summarising the dispatched state of a host: the wrapping sum
/// of `version + last_time - first_time` over every non-hidden,
/// non-deleted context's shadow.
pub fn version_hash(host: &HostNode) -> u64 {
    let mut hash = 0u64;
    for rc in host.contexts.snapshot() {
        if rc.flags.check(flag::HIDDEN) || rc.flags.is_deleted() {
            continue;
        }
        let Some(shadow) = rc.shadow() else { continue };
        hash = hash
            .wrapping_add(shadow.version)
            .wrapping_add(shadow.last_time_s as u64)
            .wrapping_sub(shadow.first_time_s as u64);
    }
    hash
}

impl ContextIndex {
    fn claim_matches(&self, claim_id: &str) -> bool {
        match self.transport().claim_id() {
            Some(ours) => ours.eq_ignore_ascii_case(claim_id),
            None => false,
        }
    }

    /// Handles a hub checkpoint: on hash mismatch, deep-rescans retention
    /// and ships a snapshot of every non-deleted context, then (re)enables
    /// streaming for the host.
    pub fn hub_checkpoint(&self, cmd: &CheckpointCommand) {
        if !self.claim_matches(&cmd.claim_id) {
            error!(claim = %cmd.claim_id, node = %cmd.node_id,
                "hub.checkpoint.claim_mismatch");
            return;
        }
        let Some(host) = self.find_host_by_node_id(&cmd.node_id) else {
            error!(node = %cmd.node_id, "hub.checkpoint.unknown_node");
            return;
        };

        if host.stream_enabled() {
            info!(host = %host.hostname, "hub.checkpoint.pausing_active_stream");
            host.set_stream_enabled(false);
        }

        let ours = version_hash(&host);
        if cmd.version_hash != ours {
            error!(
                host = %host.hostname,
                hub_hash = cmd.version_hash,
                our_hash = ours,
                "hub.checkpoint.hash_mismatch"
            );
            let bundle = self.build_snapshot(&host, &cmd.claim_id, cmd.node_id);
            self.transport().send_snapshot(bundle);
        }

        info!(host = %host.hostname, "hub.stream.enabled");
        host.set_stream_enabled(true);
    }

    /// Handles a hub stop-streaming command.
    pub fn hub_stop_streaming(&self, cmd: &StopStreamingCommand) {
        if !self.claim_matches(&cmd.claim_id) {
            error!(claim = %cmd.claim_id, node = %cmd.node_id,
                "hub.stop_streaming.claim_mismatch");
            return;
        }
        let Some(host) = self.find_host_by_node_id(&cmd.node_id) else {
            error!(node = %cmd.node_id, "hub.stop_streaming.unknown_node");
            return;
        };
        if !host.stream_enabled() {
            error!(host = %host.hostname, "hub.stop_streaming.not_streaming");
            return;
        }
        info!(host = %host.hostname, "hub.stream.disabled");
        host.set_stream_enabled(false);
    }

    fn build_snapshot(
        &self,
        host: &Arc<HostNode>,
        claim_id: &str,
        node_id: Uuid,
    ) -> SnapshotBundle {
        // make sure every context carries fresh retention before hashing
        self.recalculate_host_retention(host, 0);

        let mut messages = Vec::new();
        let mut hash = 0u64;
        for rc in host.contexts.snapshot() {
            if rc.flags.check(flag::HIDDEN) {
                continue;
            }
            {
                let mut shadow = rc.lock_shadow();
                if let Err(err) = send_context_unsafe(
                    self.store(),
                    host,
                    &rc,
                    &mut shadow,
                    true,
                    &mut messages,
                ) {
                    report_store_error("snapshot", &err);
                }
            }
            if rc.flags.is_deleted() {
                continue;
            }
            if let Some(shadow) = rc.shadow() {
                hash = hash
                    .wrapping_add(shadow.version)
                    .wrapping_add(shadow.last_time_s as u64)
                    .wrapping_sub(shadow.first_time_s as u64);
            }
        }

        SnapshotBundle {
            claim_id: claim_id.to_string(),
            node_id,
            version_hash: hash,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::ChartType;

    fn message() -> ContextMessage {
        ContextMessage::from_shadow(&ShadowRecord {
            id: "system.cpu".into(),
            version: 7,
            title: "CPU usage".into(),
            units: "percentage".into(),
            family: "utilization".into(),
            chart_type: ChartType::Stacked,
            priority: 100,
            first_time_s: 1,
            last_time_s: 10,
            deleted: false,
        })
    }

    #[test]
    fn bundles_serialise_to_json() {
        let bundle = UpdateBundle {
            claim_id: "claim".into(),
            node_id: Uuid::nil(),
            version_hash: 42,
            created_at_us: 0,
            messages: vec![message()],
        };
        let json = bundle.to_json();
        assert!(json.contains("\"system.cpu\""));
        assert!(json.contains("\"stacked\""));

        let snapshot = SnapshotBundle {
            claim_id: "claim".into(),
            node_id: Uuid::nil(),
            version_hash: 42,
            messages: vec![message()],
        };
        assert!(snapshot.to_json().contains("\"version_hash\":42"));
    }

    #[test]
    fn recording_transport_records() {
        let transport = RecordingTransport::claimed("claim");
        assert!(transport.is_connected());
        assert_eq!(transport.claim_id().as_deref(), Some("claim"));

        transport.send_updates(UpdateBundle {
            claim_id: "claim".into(),
            node_id: Uuid::nil(),
            version_hash: 0,
            created_at_us: 0,
            messages: Vec::new(),
        });
        assert_eq!(transport.updates().len(), 1);

        transport.set_connected(false);
        assert!(!transport.is_connected());
    }
}
