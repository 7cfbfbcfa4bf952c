#![allow(missing_docs)]

use std::sync::Arc;

use ctxindex::clock::now_us;
use ctxindex::{
    Chart, ChartDef, ChartType, ContextIndex, Dimension, HostNode, IndexConfig, MemoryRetention,
    MemoryStore, RecordingTransport,
};
use uuid::Uuid;

fn harness() -> (Arc<ContextIndex>, Arc<HostNode>) {
    let retention = Arc::new(MemoryRetention::new());
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let index = ContextIndex::new(
        IndexConfig::default(),
        Arc::clone(&retention) as _,
        Arc::clone(&store) as _,
        Arc::clone(&transport) as _,
    );
    let host = index.add_host("localhost", Uuid::new_v4(), None);
    (index, host)
}

#[test]
fn gc_deletes_at_most_the_budget_per_tick() {
    let (index, host) = harness();

    let chart = Chart::new(
        &host,
        ChartDef {
            uuid: Uuid::new_v4(),
            id: "app.metrics".into(),
            name: "metrics".into(),
            context: "app.metrics".into(),
            title: "App metrics".into(),
            units: "events".into(),
            family: "app".into(),
            priority: 100,
            chart_type: ChartType::Line,
            update_every_s: 1,
        },
    );
    index.chart_created(&chart);

    let mut dims = Vec::new();
    for i in 0..1_000 {
        let dim = Dimension::new(&chart, Uuid::new_v4(), &format!("m{i}"), "");
        index.dimension_created(&dim);
        dims.push(dim);
    }

    let rc = host.contexts.get("app.metrics").expect("context");
    let ri = rc.instances.get("app.metrics").expect("instance");
    assert_eq!(ri.metrics.len(), 1_000);

    // the store never held samples for these; free everything
    for dim in &dims {
        index.dimension_freed(dim);
    }
    index.chart_freed(&chart);

    // tick 1: the reducer marks the tree deleted, GC removes the budget
    index.run_tick(now_us());
    assert_eq!(ri.metrics.len(), 500);

    // tick 2: the remainder
    index.run_tick(now_us());
    assert_eq!(ri.metrics.len(), 0);

    // tick 3: the emptied instance goes too
    index.run_tick(now_us());
    assert!(rc.instances.is_empty());
}

#[test]
fn nodes_with_retention_survive_gc() {
    let retention = Arc::new(MemoryRetention::new());
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let index = ContextIndex::new(
        IndexConfig::for_tests(),
        Arc::clone(&retention) as _,
        Arc::clone(&store) as _,
        Arc::clone(&transport) as _,
    );
    let host = index.add_host("localhost", Uuid::new_v4(), None);

    let chart = Chart::new(
        &host,
        ChartDef {
            uuid: Uuid::new_v4(),
            id: "system.cpu".into(),
            name: "cpu".into(),
            context: "system.cpu".into(),
            title: "CPU usage".into(),
            units: "percentage".into(),
            family: "utilization".into(),
            priority: 100,
            chart_type: ChartType::Line,
            update_every_s: 1,
        },
    );
    index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    index.dimension_created(&dim);
    retention.set(dim.uuid, 1, 10);
    index.dimension_collected(&dim);
    index.dimension_freed(&dim);
    index.chart_freed(&chart);

    for _ in 0..3 {
        index.run_tick(now_us());
    }

    // archived but with samples in the store: everything stays
    let rc = host.contexts.get("system.cpu").expect("context survives");
    let ri = rc.instances.get("system.cpu").expect("instance survives");
    assert!(ri.metrics.get("user").is_some());
    assert!(rc.flags.is_archived());

    // rotation expires the samples: the delayed rescan zeroes retention
    // and the tree drains through the deletion gates
    retention.clear();
    index.storage_rotated();
    for _ in 0..4 {
        index.run_tick(now_us() + 1);
    }
    assert!(
        host.contexts.get("system.cpu").is_none()
            || host
                .contexts
                .get("system.cpu")
                .map(|rc| rc.flags.is_deleted())
                .unwrap_or(false),
        "rotation drives the tree to deletion"
    );
}
