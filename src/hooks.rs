//! Collection hooks: the thin edge the storage/collection side calls.
//!
//! Every hook is O(affected node) and lock-free on the happy path; the
//! heavy lifting (retention folds, state transitions visible to the hub)
//! is deferred to the worker through the post-processing queue.

use std::sync::Arc;

use tracing::error;

use crate::collection::{live_flag, Chart, Dimension};
use crate::index::ContextIndex;
use crate::registry::context::ContextTemplate;
use crate::registry::flags::flag;
use crate::registry::instance::InstanceTemplate;
use crate::registry::metric::{MetricNode, MetricTemplate};

impl ContextIndex {
    /// A dimension was created (or re-announced): upsert its metric node
    /// under the chart's instance.
    pub fn dimension_created(&self, dim: &Arc<Dimension>) {
        let Some(chart) = dim.chart() else {
            error!(dimension = %dim.id, "hook.dimension_created.chart_gone");
            return;
        };
        let instance = {
            let links = chart.links.lock();
            links.instance.clone()
        };
        let Some(instance) = instance else {
            panic!(
                "chart '{}' has no instance node while creating dimension '{}'",
                chart.id, dim.id
            );
        };

        let template = MetricTemplate {
            uuid: dim.uuid,
            id: dim.id.to_string(),
            name: dim.name(),
            link: Some(Arc::clone(dim)),
            flags: 0,
            first_time_s: 0,
            last_time_s: 0,
        };
        let (rm, _) = instance.metrics.upsert(&dim.id, template);
        *dim.link.lock() = Some(rm);
    }

    /// The storage engine released a dimension: sever the link and archive
    /// the metric if it was still collected.
    pub fn dimension_freed(&self, dim: &Arc<Dimension>) {
        let Some(rm) = dim.link.lock().take() else {
            return;
        };
        if rm.flags.is_collected() {
            rm.flags.set_archived();
        }
        *rm.link.lock() = None;
        rm.trigger_updates();
    }

    /// The dimension's hidden/obsolete flags changed: fold them into the
    /// metric node.
    pub fn dimension_flags_changed(&self, dim: &Arc<Dimension>) {
        let Some(rm) = dimension_metric(dim) else {
            return;
        };
        if dim.flag_check(live_flag::ARCHIVED | live_flag::OBSOLETE) && rm.flags.is_collected() {
            rm.flags.set_archived();
        }
        let dim_hidden = dim.flag_check(live_flag::HIDDEN);
        let rm_hidden = rm.flags.check(flag::HIDDEN);
        if dim_hidden != rm_hidden {
            if dim_hidden {
                rm.flags.set(flag::HIDDEN);
            } else {
                rm.flags.clear(flag::HIDDEN);
            }
            rm.flags.set_updated(flag::CHANGED_METADATA);
        }
        rm.trigger_updates();
    }

    /// A sample was stored for the dimension: mark the metric collected
    /// and bump the instance's live counter.
    pub fn dimension_collected(&self, dim: &Arc<Dimension>) {
        let Some(rm) = dimension_metric(dim) else {
            return;
        };
        if !rm.flags.is_collected() {
            rm.flags.set_collected();
        }
        if let Some(ri) = rm.instance() {
            ri.collected_metrics
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        rm.trigger_updates();
    }

    /// A chart was created or re-announced: upsert its context and
    /// instance, migrating the metrics when the chart switched context.
    pub fn chart_created(&self, chart: &Arc<Chart>) {
        let Some(host) = chart.host() else {
            error!(chart = %chart.id, "hook.chart_created.host_gone");
            return;
        };
        let context_id = chart.context();

        let (rca, _) = host.contexts.upsert(
            &context_id,
            ContextTemplate {
                id: context_id.to_string(),
                title: Arc::clone(&chart.title),
                units: Arc::clone(&chart.units),
                family: Arc::clone(&chart.family),
                priority: chart.priority(),
                chart_type: chart.chart_type,
                flags: 0,
                shadow: None,
            },
        );

        let (ria, _) = rca.instances.upsert(
            &chart.id,
            InstanceTemplate {
                uuid: chart.uuid,
                id: chart.id.to_string(),
                name: Some(chart.name()),
                title: Arc::clone(&chart.title),
                units: Arc::clone(&chart.units),
                family: Arc::clone(&chart.family),
                chart_type: chart.chart_type,
                priority: chart.priority(),
                update_every_s: chart.update_every_s(),
                link: Some(Arc::clone(chart)),
                flags: 0,
            },
        );

        let (old_context, old_instance) = {
            let mut links = chart.links.lock();
            let old_context = links.context.replace(Arc::clone(&rca));
            let old_instance = links.instance.replace(Arc::clone(&ria));
            (old_context, old_instance)
        };

        let old_context = old_context.filter(|old| !Arc::ptr_eq(old, &rca));
        let old_instance = old_instance.filter(|old| !Arc::ptr_eq(old, &ria));

        match (old_context, old_instance) {
            (None, None) => {}
            (Some(_old_rc), Some(old_ri)) => {
                // the chart switched context: metrics move to the fresh
                // instance, the old one is emptied in place and left for GC
                for dim in chart.dimensions() {
                    let Some(rm_old) = dim.link.lock().take() else {
                        continue;
                    };
                    rm_old.flags.replace(
                        flag::DELETED
                            | flag::UPDATED
                            | flag::LIVE_RETENTION
                            | flag::UNUSED
                            | flag::ZERO_RETENTION,
                    );
                    *rm_old.link.lock() = None;
                    rm_old
                        .first_time_s
                        .store(0, std::sync::atomic::Ordering::SeqCst);
                    rm_old
                        .last_time_s
                        .store(0, std::sync::atomic::Ordering::SeqCst);

                    self.dimension_created(&dim);
                }

                if !old_ri.flags.check(flag::OWN_LABELS) {
                    old_ri.own_labels_empty();
                }
                old_ri.flags.replace(
                    flag::OWN_LABELS
                        | flag::DELETED
                        | flag::UPDATED
                        | flag::LIVE_RETENTION
                        | flag::UNUSED
                        | flag::ZERO_RETENTION,
                );
                *old_ri.link.lock() = None;
                old_ri
                    .first_time_s
                    .store(0, std::sync::atomic::Ordering::SeqCst);
                old_ri
                    .last_time_s
                    .store(0, std::sync::atomic::Ordering::SeqCst);

                old_ri.trigger_updates();
            }
            _ => panic!(
                "chart '{}' cannot switch context without switching instance too",
                chart.id
            ),
        }
    }

    /// The collection side freed a chart: archive the instance, copy the
    /// labels and sever the links.
    pub fn chart_freed(&self, chart: &Arc<Chart>) {
        let (old_context, old_instance) = {
            let mut links = chart.links.lock();
            (links.context.take(), links.instance.take())
        };
        drop(old_context);

        let Some(ri) = old_instance else {
            return;
        };
        ri.flags.set_archived();
        ri.own_labels_copy(&chart.labels);
        *ri.link.lock() = None;
        ri.trigger_updates();
    }

    /// The storage engine changed the chart's retention (samples expired
    /// or backfilled): schedule a retention refresh.
    pub fn chart_retention_changed(&self, chart: &Arc<Chart>) {
        let Some(ri) = chart_instance(chart) else {
            return;
        };
        ri.flags.set_updated(flag::UPDATE_RETENTION);
        ri.trigger_updates();
    }

    /// The chart's hidden/obsolete/archived flags changed: fold them into
    /// the instance node.
    pub fn chart_flags_changed(&self, chart: &Arc<Chart>) {
        let Some(ri) = chart_instance(chart) else {
            return;
        };
        if chart.flag_check(live_flag::ARCHIVED | live_flag::OBSOLETE) {
            ri.flags.set_archived();
        }

        let chart_hidden = chart.flag_check(live_flag::HIDDEN);
        let ri_hidden = ri.flags.check(flag::HIDDEN);
        if chart_hidden != ri_hidden {
            if chart_hidden {
                ri.flags.set(flag::HIDDEN);
            } else {
                ri.flags.clear(flag::HIDDEN);
            }
            ri.flags.set_updated(flag::CHANGED_METADATA);
        }
        ri.trigger_updates();
    }
}

fn dimension_metric(dim: &Arc<Dimension>) -> Option<Arc<MetricNode>> {
    let link = dim.link.lock().clone();
    match link {
        Some(rm) => {
            let consistent = rm
                .link
                .lock()
                .as_ref()
                .map(|d| Arc::ptr_eq(d, dim))
                .unwrap_or(false);
            if !consistent {
                panic!("metric '{}' is not linked back to its dimension", rm.id);
            }
            Some(rm)
        }
        None => {
            error!(dimension = %dim.id, "hook.dimension.unlinked");
            None
        }
    }
}

fn chart_instance(chart: &Arc<Chart>) -> Option<Arc<crate::registry::instance::InstanceNode>> {
    let links = chart.links.lock();
    match &links.instance {
        Some(ri) => Some(Arc::clone(ri)),
        None => {
            error!(chart = %chart.id, "hook.chart.unlinked");
            None
        }
    }
}
