//! Garbage collection of deleted nodes.
//!
//! Bottom-up sweep over a host's tree, deleting every node whose deletion
//! gate is satisfied. The budget bounds deletions per pass so one huge
//! cleanup cannot starve a tick; `None` means unbudgeted (startup only).

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::report_store_error;
use crate::index::ContextIndex;
use crate::registry::host::HostNode;

fn exhausted(budget: &Option<usize>) -> bool {
    matches!(budget, Some(0))
}

fn debit(budget: &mut Option<usize>) {
    if let Some(rows) = budget {
        *rows = rows.saturating_sub(1);
    }
}

pub(crate) fn garbage_collect_host(
    index: &ContextIndex,
    host: &Arc<HostNode>,
    budget: &mut Option<usize>,
) {
    let source = Arc::clone(index.retention_source());

    for rc in host.contexts.snapshot() {
        if exhausted(budget) {
            return;
        }

        for ri in rc.instances.snapshot() {
            if exhausted(budget) {
                return;
            }

            for rm in ri.metrics.snapshot() {
                if exhausted(budget) {
                    return;
                }
                if rm.should_be_deleted(source.as_ref()) {
                    if ri.metrics.del(&rm.id) {
                        debit(budget);
                        debug!(
                            metric = %rm.id,
                            instance = %ri.id,
                            context = %rc.id,
                            "gc.metric.deleted"
                        );
                    } else {
                        error!(metric = %rm.id, "gc.metric.delete_failed");
                    }
                }
            }

            if ri.should_be_deleted() {
                if rc.instances.del(&ri.id) {
                    debit(budget);
                    debug!(instance = %ri.id, context = %rc.id, "gc.instance.deleted");
                } else {
                    error!(instance = %ri.id, "gc.instance.delete_failed");
                }
            }
        }

        if rc.should_be_deleted() {
            host.pp_queue.del(&rc.id);
            // the row goes first; the in-memory node follows only then
            if let Err(err) = index.store().delete_context(&host.uuid, &rc.id) {
                report_store_error("gc_delete", &err);
                continue;
            }
            if host.contexts.del(&rc.id) {
                debit(budget);
                debug!(context = %rc.id, host = %host.hostname, "gc.context.deleted");
            }
        }
    }
}
