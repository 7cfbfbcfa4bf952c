#![allow(missing_docs)]

use std::sync::Arc;

use ctxindex::clock::now_us;
use ctxindex::hub::version_hash;
use ctxindex::{
    ChartRecord, ChartType, CheckpointCommand, ContextIndex, DimensionRecord, HostNode,
    IndexConfig, LabelRecord, MemoryRetention, MemoryStore, RecordingTransport, ShadowRecord,
    SqliteContextStore, StopStreamingCommand,
};
use uuid::Uuid;

const SEC: u64 = 1_000_000;

fn shadow(id: &str, version: u64) -> ShadowRecord {
    ShadowRecord {
        id: id.to_string(),
        version,
        title: format!("{id} title"),
        units: "units".into(),
        family: "family".into(),
        chart_type: ChartType::Line,
        priority: 100,
        first_time_s: 100,
        last_time_s: 200,
        deleted: false,
    }
}

struct Harness {
    index: Arc<ContextIndex>,
    host: Arc<HostNode>,
    node_id: Uuid,
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
}

fn loaded_harness() -> Harness {
    let retention = Arc::new(MemoryRetention::new());
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::claimed("claim-1"));
    let index = ContextIndex::new(
        IndexConfig::default(),
        Arc::clone(&retention) as _,
        Arc::clone(&store) as _,
        Arc::clone(&transport) as _,
    );
    let node_id = Uuid::new_v4();
    let host_uuid = Uuid::new_v4();

    // three archived contexts with one chart and one dimension each
    for (i, ctx) in ["system.cpu", "system.ram", "disk.io"].iter().enumerate() {
        store.seed_context(host_uuid, shadow(ctx, 100 * (i as u64 + 1)));

        let chart_uuid = Uuid::new_v4();
        let dim_uuid = Uuid::new_v4();
        store.seed_chart(
            host_uuid,
            ChartRecord {
                uuid: chart_uuid,
                id: format!("{ctx}.chart"),
                name: format!("{ctx}.chart"),
                context: ctx.to_string(),
                title: format!("{ctx} title"),
                units: "units".into(),
                family: "family".into(),
                priority: 100,
                update_every_s: 1,
                chart_type: ChartType::Line,
            },
        );
        store.seed_dimension(
            chart_uuid,
            DimensionRecord {
                uuid: dim_uuid,
                id: "value".into(),
                name: "value".into(),
                hidden: false,
            },
        );
        store.seed_label(
            chart_uuid,
            LabelRecord { key: "origin".into(), value: ctx.to_string() },
        );
        retention.set(dim_uuid, 100, 200);
    }

    let host = index.add_host("localhost", host_uuid, Some(node_id));
    index.load_host(&host).expect("load host");
    Harness { index, host, node_id, store, transport }
}

#[test]
fn load_restores_archived_tree() {
    let h = loaded_harness();

    assert_eq!(h.host.contexts.len(), 3);
    let rc = h.host.contexts.get("system.cpu").expect("context");
    assert!(rc.flags.is_archived());
    assert_eq!(rc.version.load(std::sync::atomic::Ordering::SeqCst), 100);

    let ri = rc.instances.get("system.cpu.chart").expect("instance");
    assert!(ri.flags.is_archived());
    assert!(ri.owns_labels());
    let labels = ri.labels();
    assert_eq!(
        labels.read().get("origin").map(String::as_str),
        Some("system.cpu")
    );
    assert!(ri.metrics.get("value").is_some());

    // restart is transparent: the reducer finds nothing to dispatch
    h.index.run_tick(now_us() + 100 * SEC);
    assert!(h.transport.updates().is_empty());
}

#[test]
fn checkpoint_mismatch_sends_snapshot() {
    let h = loaded_harness();

    let ours = version_hash(&h.host);
    assert_ne!(ours, 0);

    h.index.hub_checkpoint(&CheckpointCommand {
        claim_id: "claim-1".into(),
        node_id: h.node_id,
        version_hash: ours ^ 0xdead_beef,
    });

    let snapshots = h.transport.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].messages.len(), 3, "all non-deleted contexts");
    assert_eq!(
        snapshots[0].version_hash,
        version_hash(&h.host),
        "hash matches the recomputed local state"
    );
    assert!(h.host.stream_enabled());
}

#[test]
fn checkpoint_match_skips_snapshot() {
    let h = loaded_harness();

    h.index.hub_checkpoint(&CheckpointCommand {
        claim_id: "claim-1".into(),
        node_id: h.node_id,
        version_hash: version_hash(&h.host),
    });

    assert!(h.transport.snapshots().is_empty());
    assert!(h.host.stream_enabled());
}

#[test]
fn commands_validate_claim_and_node() {
    let h = loaded_harness();

    h.index.hub_checkpoint(&CheckpointCommand {
        claim_id: "someone-else".into(),
        node_id: h.node_id,
        version_hash: 0,
    });
    assert!(h.transport.snapshots().is_empty());
    assert!(!h.host.stream_enabled());

    h.index.hub_checkpoint(&CheckpointCommand {
        claim_id: "claim-1".into(),
        node_id: Uuid::new_v4(),
        version_hash: 0,
    });
    assert!(h.transport.snapshots().is_empty());

    h.host.set_stream_enabled(true);
    h.index.hub_stop_streaming(&StopStreamingCommand {
        claim_id: "claim-1".into(),
        node_id: h.node_id,
    });
    assert!(!h.host.stream_enabled());
}

#[test]
fn higher_stored_version_wins_on_reload() {
    let h = loaded_harness();
    let rc = h.host.contexts.get("system.cpu").expect("context");
    assert_eq!(rc.version.load(std::sync::atomic::Ordering::SeqCst), 100);

    h.store.seed_context(h.host.uuid, shadow("system.cpu", 900));
    h.index.load_host(&h.host).expect("reload");
    assert_eq!(rc.version.load(std::sync::atomic::Ordering::SeqCst), 900);

    // a lower stored version is ignored
    h.store.seed_context(h.host.uuid, shadow("system.cpu", 10));
    h.index.load_host(&h.host).expect("reload again");
    assert_eq!(rc.version.load(std::sync::atomic::Ordering::SeqCst), 900);
}

#[test]
fn dispatched_shadow_round_trips_through_sqlite() {
    let dir = tempfile::tempdir().expect("temp dir");
    let retention = Arc::new(MemoryRetention::new());
    let store = Arc::new(
        SqliteContextStore::open(dir.path().join("context-meta.db")).expect("open"),
    );
    let transport = Arc::new(RecordingTransport::claimed("claim-1"));
    let index = ContextIndex::new(
        IndexConfig::default(),
        Arc::clone(&retention) as _,
        Arc::clone(&store) as _,
        Arc::clone(&transport) as _,
    );
    let host = index.add_host("localhost", Uuid::new_v4(), Some(Uuid::new_v4()));
    host.set_stream_enabled(true);

    let chart = ctxindex::Chart::new(
        &host,
        ctxindex::ChartDef {
            uuid: Uuid::new_v4(),
            id: "system.cpu".into(),
            name: "cpu".into(),
            context: "system.cpu".into(),
            title: "CPU usage".into(),
            units: "percentage".into(),
            family: "utilization".into(),
            priority: 100,
            chart_type: ChartType::Stacked,
            update_every_s: 1,
        },
    );
    index.chart_created(&chart);
    let dim = ctxindex::Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    index.dimension_created(&dim);
    retention.set(dim.uuid, 1, 10);
    index.dimension_collected(&dim);

    let now = now_us();
    index.run_tick(now);
    index.run_tick(now + 6 * SEC);
    assert_eq!(transport.updates().len(), 1);

    let rc = host.contexts.get("system.cpu").expect("context");
    let sent = rc.shadow().expect("shadow committed");

    let mut loaded = Vec::new();
    use ctxindex::ContextStore;
    store
        .load_contexts(&host.uuid, &mut |s| loaded.push(s))
        .expect("load");
    assert_eq!(loaded, vec![sent]);
}
