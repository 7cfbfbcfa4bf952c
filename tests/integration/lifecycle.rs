#![allow(missing_docs)]

use std::sync::Arc;

use ctxindex::clock::now_us;
use ctxindex::registry::flags::flag;
use ctxindex::{
    Chart, ChartDef, ChartType, ContextIndex, Dimension, HostNode, IndexConfig, MemoryRetention,
    MemoryStore, RecordingTransport,
};
use uuid::Uuid;

const SEC: u64 = 1_000_000;

struct Harness {
    index: Arc<ContextIndex>,
    host: Arc<HostNode>,
    retention: Arc<MemoryRetention>,
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
}

fn harness() -> Harness {
    let retention = Arc::new(MemoryRetention::new());
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::claimed("claim-1"));
    let index = ContextIndex::new(
        IndexConfig::default(),
        Arc::clone(&retention) as _,
        Arc::clone(&store) as _,
        Arc::clone(&transport) as _,
    );
    let host = index.add_host("localhost", Uuid::new_v4(), Some(Uuid::new_v4()));
    host.set_stream_enabled(true);
    Harness { index, host, retention, store, transport }
}

fn cpu_chart(host: &Arc<HostNode>, id: &str, context: &str) -> Arc<Chart> {
    Chart::new(
        host,
        ChartDef {
            uuid: Uuid::new_v4(),
            id: id.to_string(),
            name: id.to_string(),
            context: context.to_string(),
            title: "CPU usage".into(),
            units: "percentage".into(),
            family: "utilization".into(),
            priority: 100,
            chart_type: ChartType::Stacked,
            update_every_s: 1,
        },
    )
}

fn assert_single_state(flags: u32, what: &str) {
    let states = [flag::COLLECTED, flag::ARCHIVED, flag::DELETED]
        .iter()
        .filter(|bit| flags & **bit != 0)
        .count();
    assert!(states <= 1, "{what} carries {states} state bits: {flags:#x}");
}

#[test]
fn create_collect_archive() {
    let h = harness();
    let chart = cpu_chart(&h.host, "system.cpu", "system.cpu");
    chart.labels.write().insert("device".into(), "cpu0".into());
    h.index.chart_created(&chart);

    let user = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    let system = Dimension::new(&chart, Uuid::new_v4(), "system", "system");
    h.index.dimension_created(&user);
    h.index.dimension_created(&system);

    // ten seconds of samples in the store
    h.retention.set(user.uuid, 1, 10);
    h.retention.set(system.uuid, 1, 10);
    h.index.dimension_collected(&user);
    h.index.dimension_collected(&system);

    let now = now_us();
    h.index.run_tick(now);

    let rc = h.host.contexts.get("system.cpu").expect("context exists");
    assert!(rc.flags.is_collected());
    assert_eq!(rc.retention(), (1, 10));

    let ri = rc.instances.get("system.cpu").expect("instance exists");
    assert!(ri.flags.is_collected());
    assert!(!ri.owns_labels(), "labels borrowed while the chart is live");
    assert_eq!(ri.retention(), (1, 10));

    // instance retention nested inside the context window
    let (ctx_first, ctx_last) = rc.retention();
    let (ri_first, ri_last) = ri.retention();
    assert!(ri_first >= ctx_first && ri_last <= ctx_last);

    // started-collecting debounces at five seconds
    h.index.run_tick(now + 6 * SEC);
    let updates = h.transport.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].messages.len(), 1);
    assert_eq!(updates[0].messages[0].id, "system.cpu");
    assert_eq!(updates[0].messages[0].last_entry, 0, "collected reports zero");

    let row = h.store.shadow(&h.host.uuid, "system.cpu").expect("row stored");
    assert!(!row.deleted);
    assert_eq!(row.last_time_s, 0);

    // the collection side tears the chart down
    h.index.dimension_freed(&user);
    h.index.dimension_freed(&system);
    h.index.chart_freed(&chart);

    let now = now_us();
    h.index.run_tick(now);

    assert!(rc.flags.is_archived());
    assert_eq!(rc.retention(), (1, 10));
    assert!(ri.flags.is_archived());
    assert!(ri.owns_labels(), "labels copied when the link was severed");
    let labels = ri.labels();
    assert_eq!(
        labels.read().get("device").map(String::as_str),
        Some("cpu0")
    );

    for node in [rc.flags.get(), ri.flags.get()] {
        assert_single_state(node, "node");
    }

    // stopped-collecting debounces at 65 seconds, then the row updates
    h.index.run_tick(now + 70 * SEC);
    let updates = h.transport.updates();
    assert_eq!(updates.len(), 2);
    let row = h.store.shadow(&h.host.uuid, "system.cpu").expect("row stored");
    assert!(!row.deleted);
    assert_eq!(row.last_time_s, 10);
}

#[test]
fn context_rename_migrates_metrics() {
    let h = harness();
    let chart = cpu_chart(&h.host, "app.chart", "a.b");
    h.index.chart_created(&chart);

    let dim = Dimension::new(&chart, Uuid::new_v4(), "value", "value");
    h.index.dimension_created(&dim);

    let now = now_us();
    h.index.run_tick(now);
    assert!(h.host.contexts.get("a.b").is_some());

    // the collector re-announces the chart under a different context
    chart.set_context("c.d");
    h.index.chart_created(&chart);

    let now = now_us();
    h.index.run_tick(now);

    let old = h.host.contexts.get("a.b").expect("old context still present");
    let new = h.host.contexts.get("c.d").expect("new context present");

    assert!(old.flags.is_deleted());
    assert!(old.flags.check(flag::ZERO_RETENTION));

    let new_ri = new.instances.get("app.chart").expect("instance migrated");
    assert!(new_ri.metrics.get("value").is_some(), "metric re-attached");

    // the live dimension link points into the new sub-tree
    let rm = dim.link.lock().clone().expect("dimension linked");
    let owner = rm.context().expect("metric context");
    assert_eq!(&*owner.id, "c.d");

    // drain: exactly two messages, the old context announced as deleted
    h.index.run_tick(now + 70 * SEC);
    let messages: Vec<_> = h
        .transport
        .updates()
        .into_iter()
        .flat_map(|bundle| bundle.messages)
        .collect();
    assert_eq!(messages.len(), 2);
    let old_msg = messages.iter().find(|m| m.id == "a.b").expect("old message");
    assert!(old_msg.deleted);
    assert!(messages.iter().any(|m| m.id == "c.d"));

    // terminal deletion removes the old context entirely
    h.index.run_tick(now + 75 * SEC);
    assert!(h.host.contexts.get("a.b").is_none());
    assert!(h.host.contexts.get("c.d").is_some());
}

#[test]
fn child_disconnect_archives_collected_metrics() {
    let h = harness();
    let chart = cpu_chart(&h.host, "system.cpu", "system.cpu");
    h.index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    h.index.dimension_created(&dim);
    h.retention.set(dim.uuid, 1, 10);
    h.index.dimension_collected(&dim);

    h.index.run_tick(now_us());
    let rc = h.host.contexts.get("system.cpu").expect("context");
    assert!(rc.flags.is_collected());

    h.index.host_child_disconnected(&h.host);

    let rm = dim.link.lock().clone().expect("metric");
    assert!(rm.flags.is_archived());
    assert!(rc.flags.is_archived());
    assert_eq!(h.host.cached_retention(), (1, 10));
}
