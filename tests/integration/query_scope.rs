#![allow(missing_docs)]

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use ctxindex::query::scope::{foreach_context, foreach_host, ScopeError, ScopeOptions, ScopeVisit};
use ctxindex::{
    Chart, ChartDef, ChartType, ContextIndex, Dimension, HostNode, IndexConfig, MemoryRetention,
    MemoryStore, RecordingTransport, SimplePattern,
};
use uuid::Uuid;

struct Harness {
    index: Arc<ContextIndex>,
    retention: Arc<MemoryRetention>,
}

fn harness() -> Harness {
    let retention = Arc::new(MemoryRetention::new());
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let index = ContextIndex::new(
        IndexConfig::default(),
        Arc::clone(&retention) as _,
        Arc::clone(&store) as _,
        Arc::clone(&transport) as _,
    );
    Harness { index, retention }
}

fn seed_chart(h: &Harness, host: &Arc<HostNode>, context: &str) {
    let chart = Chart::new(
        host,
        ChartDef {
            uuid: Uuid::new_v4(),
            id: format!("{context}.0"),
            name: format!("{context}.0"),
            context: context.to_string(),
            title: format!("{context} title"),
            units: "units".into(),
            family: "family".into(),
            priority: 100,
            chart_type: ChartType::Line,
            update_every_s: 1,
        },
    );
    h.index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "value", "value");
    h.index.dimension_created(&dim);
    h.retention.set(dim.uuid, 1, 10);
    h.index.dimension_collected(&dim);
}

#[test]
fn host_scope_and_filter_patterns() {
    let h = harness();
    let web1 = h.index.add_host("web-1", Uuid::new_v4(), None);
    let web2 = h.index.add_host("web-2", Uuid::new_v4(), None);
    let db1 = h.index.add_host("db-1", Uuid::new_v4(), None);
    seed_chart(&h, &web1, "system.cpu");
    seed_chart(&h, &web2, "system.cpu");
    seed_chart(&h, &db1, "system.cpu");

    let scope = SimplePattern::parse("web-*");
    let filter = SimplePattern::parse("web-1");

    let mut visited = Vec::new();
    let stats = foreach_host(
        &h.index,
        Some(&scope),
        Some(&filter),
        &ScopeOptions::default(),
        &mut |host, queryable| {
            visited.push((host.hostname.to_string(), queryable));
            ScopeVisit::Continue
        },
    )
    .expect("walk completes");

    assert_eq!(stats.hosts, 2);
    assert_eq!(
        visited,
        vec![("web-1".to_string(), true), ("web-2".to_string(), false)]
    );
}

#[test]
fn hashes_track_mutations() {
    let h = harness();
    let host = h.index.add_host("web-1", Uuid::new_v4(), None);
    seed_chart(&h, &host, "system.cpu");

    let walk = |index: &Arc<ContextIndex>| {
        foreach_host(index, None, None, &ScopeOptions::default(), &mut |_, _| {
            ScopeVisit::Continue
        })
        .expect("walk")
    };

    let before = walk(&h.index);
    seed_chart(&h, &host, "system.ram");
    let after = walk(&h.index);
    assert_ne!(before.hard_hash, after.hard_hash, "content hash moved");
}

#[test]
fn context_scope_literal_and_pattern() {
    let h = harness();
    let host = h.index.add_host("web-1", Uuid::new_v4(), None);
    seed_chart(&h, &host, "system.cpu");
    seed_chart(&h, &host, "system.ram");
    seed_chart(&h, &host, "disk.io");

    // literal hit visits exactly that context
    let mut seen = Vec::new();
    let added = foreach_context(&host, Some("system.cpu"), None, None, true, &mut |rc, q| {
        seen.push((rc.id.to_string(), q));
        true
    });
    assert_eq!(added, 1);
    assert_eq!(seen, vec![("system.cpu".to_string(), true)]);

    // pattern scan with a narrowing filter
    let scope = SimplePattern::parse("system.*");
    let filter = SimplePattern::parse("*.cpu");
    let mut seen = Vec::new();
    let added = foreach_context(
        &host,
        None,
        Some(&scope),
        Some(&filter),
        true,
        &mut |rc, queryable| {
            seen.push((rc.id.to_string(), queryable));
            queryable
        },
    );
    assert_eq!(added, 1, "only the queryable context counts");
    assert_eq!(seen.len(), 2, "both in-scope contexts were offered");

    // a non-queryable host never yields queryable contexts
    let mut any_queryable = false;
    foreach_context(&host, None, None, None, false, &mut |_, queryable| {
        any_queryable |= queryable;
        true
    });
    assert!(!any_queryable);
}

#[test]
fn deadline_interrupt_and_abort_surface_verbatim() {
    let h = harness();
    h.index.add_host("web-1", Uuid::new_v4(), None);

    let expired = ScopeOptions {
        deadline: Some(Instant::now() - std::time::Duration::from_millis(1)),
        interrupt: None,
    };
    let result = foreach_host(&h.index, None, None, &expired, &mut |_, _| {
        panic!("must not visit after the deadline")
    });
    assert_eq!(result.unwrap_err(), ScopeError::Timeout);

    let interrupt = || true;
    let interrupted = ScopeOptions { deadline: None, interrupt: Some(&interrupt) };
    let result = foreach_host(&h.index, None, None, &interrupted, &mut |_, _| {
        panic!("must not visit after an interrupt")
    });
    assert_eq!(result.unwrap_err(), ScopeError::Interrupted);

    let result = foreach_host(
        &h.index,
        None,
        None,
        &ScopeOptions::default(),
        &mut |_, _| ScopeVisit::Abort,
    );
    assert_eq!(result.unwrap_err(), ScopeError::Aborted);
}

#[test]
fn instance_walk_and_uuid_lookups() {
    let h = harness();
    let host = h.index.add_host("web-1", Uuid::new_v4(), None);

    let chart = Chart::new(
        &host,
        ChartDef {
            uuid: Uuid::new_v4(),
            id: "system.cpu.0".into(),
            name: "cpu0".into(),
            context: "system.cpu".into(),
            title: "CPU usage".into(),
            units: "percentage".into(),
            family: "utilization".into(),
            priority: 100,
            chart_type: ChartType::Line,
            update_every_s: 1,
        },
    );
    h.index.chart_created(&chart);
    let dim = Dimension::new(&chart, Uuid::new_v4(), "user", "user");
    h.index.dimension_created(&dim);

    let visited = h
        .index
        .foreach_instance_in_context(&host, "system.cpu", |c| {
            assert_eq!(&*c.id, "system.cpu.0");
            ControlFlow::Continue(1)
        });
    assert_eq!(visited, 1);

    assert_eq!(h.index.find_chart_uuid(&chart), Some(chart.uuid));
    assert_eq!(
        h.index.find_dimension_uuid(&chart, "user"),
        Some(dim.uuid)
    );
    assert_eq!(h.index.find_dimension_uuid(&chart, "missing"), None);

    let triples = h.index.all_metrics(&host, None);
    assert_eq!(triples.len(), 1);
    assert_eq!(&*triples[0].metric.id, "user");

    let pattern = SimplePattern::parse("apps.*");
    assert!(h.index.all_metrics(&host, Some(&pattern)).is_empty());
}
