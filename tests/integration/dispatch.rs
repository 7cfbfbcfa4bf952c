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
    Harness { index, host, retention, transport }
}

fn chart_with(host: &Arc<HostNode>, id: &str, title: &str) -> Arc<Chart> {
    Chart::new(
        host,
        ChartDef {
            uuid: Uuid::new_v4(),
            id: id.to_string(),
            name: id.to_string(),
            context: "system.cpu".into(),
            title: title.to_string(),
            units: "percentage".into(),
            family: "utilization".into(),
            priority: 100,
            chart_type: ChartType::Stacked,
            update_every_s: 1,
        },
    )
}

#[test]
fn diverging_titles_two_way_merge() {
    let h = harness();

    let chart_a = chart_with(&h.host, "system.cpu.a", "CPU usage");
    h.index.chart_created(&chart_a);
    let dim_a = Dimension::new(&chart_a, Uuid::new_v4(), "user", "user");
    h.index.dimension_created(&dim_a);
    h.retention.set(dim_a.uuid, 1, 10);
    h.index.dimension_collected(&dim_a);

    let chart_b = chart_with(&h.host, "system.cpu.b", "CPU utilization");
    h.index.chart_created(&chart_b);
    let dim_b = Dimension::new(&chart_b, Uuid::new_v4(), "user", "user");
    h.index.dimension_created(&dim_b);
    h.retention.set(dim_b.uuid, 1, 10);
    h.index.dimension_collected(&dim_b);

    let rc = h.host.contexts.get("system.cpu").expect("merged context");
    assert_eq!(&*rc.title(), "CPU u[x]");
    assert_eq!(rc.instances.len(), 2);

    let now = now_us();
    h.index.run_tick(now);
    assert!(
        rc.queue.queued_flags.load(std::sync::atomic::Ordering::SeqCst)
            & flag::CHANGED_METADATA
            != 0,
        "metadata change recorded on the queued context"
    );

    h.index.run_tick(now + 70 * SEC);
    let updates = h.transport.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].messages.len(), 1);
    assert_eq!(updates[0].messages[0].title, "CPU u[x]");
}

#[test]
fn repeated_dirtying_debounces_to_one_message() {
    let h = harness();
    let chart = chart_with(&h.host, "system.cpu", "CPU usage");
    h.index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    h.index.dimension_created(&dim);
    h.retention.set(dim.uuid, 1, 10);
    h.index.dimension_collected(&dim);

    // collect, archive and drain a baseline dispatch
    let now = now_us();
    h.index.run_tick(now);
    h.index.dimension_freed(&dim);
    h.index.chart_freed(&chart);
    let now = now_us();
    h.index.run_tick(now);
    h.index.run_tick(now + 70 * SEC);
    let baseline = h.transport.updates().len();
    assert!(baseline >= 1);

    let rc = h.host.contexts.get("system.cpu").expect("context");
    assert!(rc.flags.is_archived());

    // ten retention bumps within a second
    for i in 1..=10 {
        h.retention.set(dim.uuid, 1, 10 + i);
        h.index
            .recalculate_context_retention(&rc, flag::UPDATE_RETENTION);
    }
    assert_eq!(h.host.hub_queue.len(), 1, "one queue entry, not ten");

    let queued = rc.queue.queued_us.load(std::sync::atomic::Ordering::SeqCst);

    // nothing goes out before the 65 second debounce
    h.index.run_tick(queued + 10 * SEC);
    assert_eq!(h.transport.updates().len(), baseline);
    h.index.run_tick(queued + 64 * SEC);
    assert_eq!(h.transport.updates().len(), baseline);

    // one message once the window elapses
    h.index.run_tick(queued + 66 * SEC);
    let updates = h.transport.updates();
    assert_eq!(updates.len(), baseline + 1);
    let last = updates.last().expect("bundle");
    assert_eq!(last.messages.len(), 1);
    assert_eq!(last.messages[0].last_entry, 20);
    assert!(h.host.hub_queue.is_empty());
}

#[test]
fn disconnected_transport_keeps_the_queue() {
    let h = harness();
    h.transport.set_connected(false);

    let chart = chart_with(&h.host, "system.cpu", "CPU usage");
    h.index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    h.index.dimension_created(&dim);
    h.retention.set(dim.uuid, 1, 10);
    h.index.dimension_collected(&dim);

    let now = now_us();
    h.index.run_tick(now);
    h.index.run_tick(now + 70 * SEC);
    assert!(h.transport.updates().is_empty());
    assert_eq!(h.host.hub_queue.len(), 1, "queue grows without loss");

    // reconnect: the queued context drains on the next tick
    h.transport.set_connected(true);
    h.index.run_tick(now + 71 * SEC);
    assert_eq!(h.transport.updates().len(), 1);
    assert!(h.host.hub_queue.is_empty());
}

#[test]
fn store_failure_leaves_context_queued() {
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

    let chart = chart_with(&host, "system.cpu", "CPU usage");
    index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    index.dimension_created(&dim);
    retention.set(dim.uuid, 1, 10);
    index.dimension_collected(&dim);

    let now = now_us();
    index.run_tick(now);

    store.fail_writes(true);
    index.run_tick(now + 6 * SEC);
    assert!(transport.updates().is_empty(), "failed store write sends nothing");
    assert_eq!(host.hub_queue.len(), 1, "context stays queued for retry");

    store.fail_writes(false);
    index.run_tick(now + 7 * SEC);
    assert_eq!(transport.updates().len(), 1);
    assert!(host.hub_queue.is_empty());
    assert!(store.shadow(&host.uuid, "system.cpu").is_some());
}
