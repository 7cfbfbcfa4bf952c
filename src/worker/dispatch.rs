//! Hub dispatch: the debounced drain of the per-host queue.
//!
//! A queued context is transmitted once its debounce window elapsed and
//! its live state still differs from the last-sent shadow. Transmission
//! commits the new shadow to the persistence bridge first; a store failure
//! leaves the context queued so the next tick retries it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::error::{report_store_error, Result};
use crate::hub::{version_hash, ContextMessage, UpdateBundle};
use crate::index::ContextIndex;
use crate::registry::context::ContextNode;
use crate::registry::flags::{flag, minimum_dispatch_delay};
use crate::registry::host::HostNode;
use crate::store::{ContextStore, ShadowRecord};

/// The next version a dispatch announces: strictly above the live version,
/// the last-sent version and the wall clock.
pub(crate) fn next_version(rc: &ContextNode, shadow: &Option<ShadowRecord>) -> u64 {
    let sent = shadow.as_ref().map(|s| s.version).unwrap_or(0);
    let now = crate::clock::now_s().max(0) as u64;
    rc.version.load(Ordering::SeqCst).max(sent).max(now) + 1
}

/// The hub-visibility predicate: does the live context differ from the
/// last-sent shadow? Refreshes the host's cached retention as a side
/// effect, the way the original dispatch check does.
pub(crate) fn cloud_version_changed_unsafe(
    rc: &ContextNode,
    shadow: &Option<ShadowRecord>,
    _sending: bool,
) -> bool {
    let current = rc.current_shadow();
    let changed = match shadow {
        Some(prev) => !current.same_visible_state(prev),
        None => true,
    };

    if let Some(host) = rc.host() {
        let (first, last) = rc.retention();
        if changed || !rc.flags.is_collected() {
            host.update_cached_retention(first, last, false);
        }
    }

    changed
}

/// Commits a dispatch of one context: bumps the version, persists the new
/// shadow, and appends the message to the bundle. Caller holds the
/// serialisation lock. Nothing is mutated when the store write fails.
pub(crate) fn send_context_unsafe(
    store: &Arc<dyn ContextStore>,
    host: &Arc<HostNode>,
    rc: &Arc<ContextNode>,
    shadow: &mut Option<ShadowRecord>,
    snapshot: bool,
    messages: &mut Vec<ContextMessage>,
) -> Result<()> {
    let mut candidate = rc.current_shadow();
    candidate.version = next_version(rc, shadow);

    if candidate.deleted {
        store.delete_context(&host.uuid, &candidate.id)?;
    } else {
        store.store_context(&host.uuid, &candidate)?;
    }

    rc.version.store(candidate.version, Ordering::SeqCst);
    if !rc.flags.check(flag::HIDDEN) {
        if snapshot {
            if !candidate.deleted {
                messages.push(ContextMessage::from_shadow(&candidate));
            }
        } else {
            messages.push(ContextMessage::from_shadow(&candidate));
        }
    }
    *shadow = Some(candidate);
    Ok(())
}

/// The scheduled dispatch time for a queued context, derived lazily from
/// the fastest debounce among the reasons observed while queued and cached
/// until the next (re-)queue.
pub(crate) fn scheduled_dispatch_us(rc: &ContextNode, now_us: u64) -> u64 {
    let queued_us = rc.queue.queued_us.load(Ordering::SeqCst);
    if rc.queue.delay_calc_us.load(Ordering::SeqCst) >= queued_us {
        return rc.queue.scheduled_dispatch_us.load(Ordering::SeqCst);
    }

    let delay = minimum_dispatch_delay(rc.queue.queued_flags.load(Ordering::SeqCst));
    let scheduled = queued_us + delay.as_micros() as u64;
    rc.queue.delay_calc_us.store(now_us, Ordering::SeqCst);
    rc.queue.scheduled_dispatch_us.store(scheduled, Ordering::SeqCst);
    scheduled
}

/// Drains the host's dispatch queue into one bundle, bounded by the
/// configured message cap; the remainder carries over to the next tick.
pub(crate) fn dispatch_queued(index: &ContextIndex, host: &Arc<HostNode>, now_us: u64) {
    if !host.stream_enabled() || !index.transport().is_connected() {
        return;
    }
    if host.hub_queue.is_empty() {
        return;
    }
    let Some(claim_id) = index.transport().claim_id() else {
        return;
    };
    let Some(node_id) = host.node_id() else {
        return;
    };

    let cap = index.config().dispatch_bundle_cap;
    let mut messages = Vec::new();

    for entry in host.hub_queue.snapshot() {
        if messages.len() >= cap {
            break;
        }
        let rc = &entry.context;

        let dispatch_at = scheduled_dispatch_us(rc, now_us);
        if now_us < dispatch_at {
            continue;
        }

        {
            let mut shadow = rc.lock_shadow();
            if cloud_version_changed_unsafe(rc, &shadow, true) {
                match send_context_unsafe(index.store(), host, rc, &mut shadow, false, &mut messages)
                {
                    Ok(()) => {
                        rc.queue.dispatches.fetch_add(1, Ordering::Relaxed);
                        rc.queue.dequeued_us.store(now_us, Ordering::SeqCst);
                    }
                    Err(err) => {
                        // stays queued; retried on the next tick
                        report_store_error("dispatch", &err);
                        continue;
                    }
                }
            } else if let Some(sent) = shadow.as_ref() {
                // deduplicated: align the live version with the sent one
                rc.version.store(sent.version, Ordering::SeqCst);
            }
        }

        host.hub_queue.del(&rc.id);

        if rc.should_be_deleted() {
            debug!(context = %rc.id, "dispatch.context.terminal_delete");
            host.pp_queue.del(&rc.id);
            if let Err(err) = index.store().delete_context(&host.uuid, &rc.id) {
                report_store_error("delete", &err);
            }
            host.contexts.del(&rc.id);
        }
    }

    if !messages.is_empty() {
        let bundle = UpdateBundle {
            claim_id,
            node_id,
            version_hash: version_hash(host),
            created_at_us: now_us,
            messages,
        };
        index.transport().send_updates(bundle);
    }
}
