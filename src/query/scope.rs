//! The scope evaluator: the read path every query surface goes through.

use std::sync::Arc;
use std::time::Instant;

use crate::index::ContextIndex;
use crate::query::pattern::SimplePattern;
use crate::registry::context::ContextNode;
use crate::registry::host::HostNode;

/// What a visit callback asks the evaluator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeVisit {
    /// Keep walking.
    Continue,
    /// Stop; the evaluator returns [`ScopeError::Aborted`].
    Abort,
}

/// Why a walk ended early. Partial output must be discarded by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeError {
    /// The caller-supplied deadline fired.
    Timeout,
    /// The interrupt callback fired.
    Interrupted,
    /// The visit callback aborted.
    Aborted,
}

/// Aggregates returned by a completed host walk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeStats {
    /// Hosts matched by the scope pattern.
    pub hosts: u64,
    /// Mix of the contexts container versions; invalidates content caches.
    pub hard_hash: u64,
    /// Mix of the hub queue versions; invalidates dispatch-state caches.
    pub soft_hash: u64,
}

/// Deadline and interruption for long walks, polled between hosts.
#[derive(Default)]
pub struct ScopeOptions<'a> {
    /// Absolute deadline; `Timeout` once reached.
    pub deadline: Option<Instant>,
    /// Interrupt poll; `Interrupted` once it returns true.
    pub interrupt: Option<&'a dyn Fn() -> bool>,
}

fn host_matches(pattern: &SimplePattern, host: &HostNode) -> bool {
    if pattern.matches(&host.hostname) {
        return true;
    }
    if pattern.matches(&host.uuid.to_string()) {
        return true;
    }
    match host.node_id() {
        Some(node_id) => pattern.matches(&node_id.to_string()),
        None => false,
    }
}

/// Enumerates hosts matching `scope`, flagging each as queryable per
/// `filter`, and mixes the cache hashes of every visited host.
pub fn foreach_host(
    index: &ContextIndex,
    scope: Option<&SimplePattern>,
    filter: Option<&SimplePattern>,
    options: &ScopeOptions<'_>,
    cb: &mut dyn FnMut(&Arc<HostNode>, bool) -> ScopeVisit,
) -> Result<ScopeStats, ScopeError> {
    let mut stats = ScopeStats::default();

    for host in index.hosts_snapshot() {
        if let Some(deadline) = options.deadline {
            if Instant::now() >= deadline {
                return Err(ScopeError::Timeout);
            }
        }
        if let Some(interrupt) = options.interrupt {
            if interrupt() {
                return Err(ScopeError::Interrupted);
            }
        }

        if let Some(scope) = scope {
            if !host_matches(scope, &host) {
                continue;
            }
        }
        let queryable = match filter {
            Some(filter) => host_matches(filter, &host),
            None => true,
        };

        stats.hosts += 1;
        stats.hard_hash = stats.hard_hash.wrapping_add(host.contexts.version());
        stats.soft_hash = stats.soft_hash.wrapping_add(host.hub_queue.version());

        if cb(&host, queryable) == ScopeVisit::Abort {
            return Err(ScopeError::Aborted);
        }
    }

    Ok(stats)
}

/// Visits the contexts of one host.
///
/// When `scope_literal` names an existing context, only that context is
/// visited; otherwise every context is tested against `scope_pattern`.
/// The callback receives the queryable verdict (host verdict narrowed by
/// `filter`) and returns whether it used the context; used visits are
/// counted.
pub fn foreach_context(
    host: &Arc<HostNode>,
    scope_literal: Option<&str>,
    scope_pattern: Option<&SimplePattern>,
    filter: Option<&SimplePattern>,
    queryable_host: bool,
    cb: &mut dyn FnMut(&Arc<ContextNode>, bool) -> bool,
) -> usize {
    if let Some(literal) = scope_literal {
        if let Some(rc) = host.contexts.get(literal) {
            let mut queryable = queryable_host;
            if queryable {
                if let Some(filter) = filter {
                    queryable = filter.matches(&rc.id);
                }
            }
            return usize::from(cb(&rc, queryable));
        }
    }

    let mut added = 0;
    for rc in host.contexts.snapshot() {
        if let Some(scope) = scope_pattern {
            if !scope.matches(&rc.id) {
                continue;
            }
        }
        let mut queryable = queryable_host;
        if queryable {
            if let Some(filter) = filter {
                queryable = filter.matches(&rc.id);
            }
        }
        if cb(&rc, queryable) {
            added += 1;
        }
    }
    added
}
