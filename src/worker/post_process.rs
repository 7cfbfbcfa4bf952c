//! The retention/state reducer.
//!
//! Runs only on the worker thread. For every queued context it refreshes
//! metric retention from the store, folds state and retention upward one
//! level at a time, and queues the context for hub dispatch when the
//! hub-visible state changed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::index::ContextIndex;
use crate::registry::context::ContextNode;
use crate::registry::flags::{flag, NodeFlags};
use crate::registry::host::HostNode;
use crate::registry::instance::InstanceNode;
use crate::registry::metric::MetricNode;
use crate::retention::RetentionSource;
use crate::worker::dispatch;

fn apply_retention(
    flags: &NodeFlags,
    first_cell: &AtomicI64,
    last_cell: &AtomicI64,
    first: i64,
    last: i64,
) {
    if first_cell.swap(first, Ordering::SeqCst) != first {
        flags.set_updated(flag::CHANGED_FIRST_TIME);
    }
    if last_cell.swap(last, Ordering::SeqCst) != last {
        flags.set_updated(flag::CHANGED_LAST_TIME);
    }
}

pub(crate) fn metric_process_updates(
    rm: &Arc<MetricNode>,
    force: bool,
    reason: u32,
    source: &dyn RetentionSource,
) {
    if reason != 0 {
        rm.flags.set_updated(reason);
    }
    if !force
        && !rm.flags.is_updated()
        && rm.flags.check(flag::LIVE_RETENTION)
        && !rm.flags.check(flag::UPDATE_RETENTION)
    {
        return;
    }

    if reason & flag::DISCONNECTED_CHILD != 0 {
        rm.flags.set_archived();
        rm.flags.set(flag::DISCONNECTED_CHILD);
    }
    if rm.flags.is_deleted() && reason & flag::UPDATE_RETENTION != 0 {
        // retention may have reappeared; resurrect as archived and re-check
        rm.flags.set_archived();
    }

    rm.refresh_retention(source);
    rm.flags.clear_updated();
}

pub(crate) fn instance_post_process(
    ri: &Arc<InstanceNode>,
    force: bool,
    reason: u32,
    source: &dyn RetentionSource,
) {
    if reason != 0 {
        ri.flags.set_updated(reason);
    }
    if !force && !ri.flags.is_updated() && ri.flags.check(flag::LIVE_RETENTION) {
        return;
    }

    let pass_retention = ri.flags.check(flag::UPDATE_RETENTION);

    let mut min_first = i64::MAX;
    let mut max_last = 0i64;
    let mut metrics_active = 0usize;
    let mut live_retention = true;
    let mut currently_collected = false;

    for rm in ri.metrics.snapshot() {
        let mut pass = reason;
        if pass_retention {
            pass |= flag::UPDATE_RETENTION;
        }
        metric_process_updates(&rm, force, pass, source);

        if !rm.flags.check(flag::LIVE_RETENTION) {
            live_retention = false;
        }
        if rm.should_be_deleted(source) {
            continue;
        }

        let (first, last) = rm.retention();
        if !currently_collected && rm.flags.is_collected() && first != 0 {
            currently_collected = true;
        }
        metrics_active += 1;
        if first != 0 && first < min_first {
            min_first = first;
        }
        if last != 0 && last > max_last {
            max_last = last;
        }
    }

    if live_retention {
        ri.flags.set(flag::LIVE_RETENTION);
    } else {
        ri.flags.clear(flag::LIVE_RETENTION);
    }

    if metrics_active == 0 {
        // no surviving metrics
        apply_retention(&ri.flags, &ri.first_time_s, &ri.last_time_s, 0, 0);
        ri.flags.set_deleted(flag::ZERO_RETENTION);
    } else {
        if min_first == i64::MAX {
            min_first = 0;
        }

        if min_first == 0 || max_last == 0 {
            apply_retention(&ri.flags, &ri.first_time_s, &ri.last_time_s, 0, 0);
            if live_retention {
                ri.flags.set_deleted(flag::ZERO_RETENTION);
            }
        } else {
            ri.flags.clear(flag::ZERO_RETENTION);
            apply_retention(
                &ri.flags,
                &ri.first_time_s,
                &ri.last_time_s,
                min_first,
                max_last,
            );
            if currently_collected {
                ri.flags.set_collected();
            } else {
                ri.flags.set_archived();
            }
        }
    }

    ri.flags.clear_updated();
}

pub(crate) fn context_post_process(
    index: &ContextIndex,
    rc: &Arc<ContextNode>,
    force: bool,
    reason: u32,
) {
    if reason != 0 {
        rc.flags.set_updated(reason);
    }

    let source = index.retention_source();
    let min_allowed_priority = index.config().minimum_priority;
    let pass_retention = rc.flags.check(flag::UPDATE_RETENTION);

    let mut min_priority_collected = u32::MAX;
    let mut min_priority_archived = u32::MAX;
    let mut min_first = i64::MAX;
    let mut max_last = 0i64;
    let mut instances_active = 0usize;
    let mut live_retention = true;
    let mut currently_collected = false;
    let mut hidden = true;

    for ri in rc.instances.snapshot() {
        let mut pass = reason;
        if pass_retention {
            pass |= flag::UPDATE_RETENTION;
        }
        instance_post_process(&ri, force, pass, source.as_ref());

        if !ri.flags.check(flag::HIDDEN) {
            hidden = false;
        }
        if !ri.flags.check(flag::LIVE_RETENTION) {
            live_retention = false;
        }
        if ri.should_be_deleted() {
            continue;
        }

        let (first, last) = ri.retention();
        if !currently_collected && ri.flags.is_collected() && first != 0 {
            currently_collected = true;
        }
        instances_active += 1;

        let priority = ri.priority();
        if priority >= min_allowed_priority {
            if ri.flags.is_collected() {
                min_priority_collected = min_priority_collected.min(priority);
            } else {
                min_priority_archived = min_priority_archived.min(priority);
            }
        }

        if first != 0 && first < min_first {
            min_first = first;
        }
        if last != 0 && last > max_last {
            max_last = last;
        }
    }

    // a collected instance pins the context priority; archived ones only
    // count when nothing is collected
    let min_priority = if min_priority_collected != u32::MAX {
        min_priority_collected
    } else {
        min_priority_archived
    };

    if hidden {
        rc.flags.set(flag::HIDDEN);
    } else {
        rc.flags.clear(flag::HIDDEN);
    }
    if live_retention {
        rc.flags.set(flag::LIVE_RETENTION);
    } else {
        rc.flags.clear(flag::LIVE_RETENTION);
    }

    let mut shadow = rc.lock_shadow();
    rc.pp.executions.fetch_add(1, Ordering::Relaxed);

    if instances_active == 0 {
        apply_retention(&rc.flags, &rc.first_time_s, &rc.last_time_s, 0, 0);
        rc.flags.set_deleted(flag::ZERO_RETENTION);
    } else {
        if min_first == i64::MAX {
            min_first = 0;
        }

        if min_first == 0 && max_last == 0 {
            apply_retention(&rc.flags, &rc.first_time_s, &rc.last_time_s, 0, 0);
            rc.flags.set_deleted(flag::ZERO_RETENTION);
        } else {
            rc.flags.clear(flag::ZERO_RETENTION);
            apply_retention(
                &rc.flags,
                &rc.first_time_s,
                &rc.last_time_s,
                min_first,
                max_last,
            );
            if currently_collected {
                rc.flags.set_collected();
            } else {
                rc.flags.set_archived();
            }
        }

        if min_priority != u32::MAX && rc.priority() != min_priority {
            rc.set_priority(min_priority);
            rc.flags.set_updated(flag::CHANGED_METADATA);
        }
    }

    if rc.flags.is_updated() && dispatch::cloud_version_changed_unsafe(rc, &shadow, false) {
        let version = dispatch::next_version(rc, &shadow);
        rc.version.store(version, Ordering::SeqCst);
        rc.queue_for_hub();
    }

    rc.flags.clear_updated();
    drop(shadow);
}

/// Drains a host's post-processing queue, running the reducer over every
/// queued context. Hooks firing concurrently re-queue contexts for the
/// next tick.
pub(crate) fn post_process_queued(index: &ContextIndex, host: &Arc<HostNode>) {
    for entry in host.pp_queue.snapshot() {
        let rc = Arc::clone(&entry.context);
        host.pp_queue.del(&rc.id);
        context_post_process(index, &rc, false, 0);
    }
}
