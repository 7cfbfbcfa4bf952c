//! The per-node atomic flag word.
//!
//! Every node in the tree (metric, instance, context) carries one `u32`
//! partitioned into three groups: current state, queue membership and
//! pending-update reasons. All updates go through atomics so that the
//! collection hooks stay lock-free; the collected/archived/deleted
//! transitions are single compare-and-swap loops so that no reader can
//! observe two exclusive state bits at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Flag bit constants.
pub mod flag {
    /// The object is deleted and waits for garbage collection.
    pub const DELETED: u32 = 1 << 0;
    /// The object is currently being collected.
    pub const COLLECTED: u32 = 1 << 1;
    /// The object has updates to propagate.
    pub const UPDATED: u32 = 1 << 2;
    /// The object is not currently being collected.
    pub const ARCHIVED: u32 = 1 << 3;
    /// The instance owns its label set instead of borrowing the chart's.
    pub const OWN_LABELS: u32 = 1 << 4;
    /// Retention has been reconciled against the store at least once.
    pub const LIVE_RETENTION: u32 = 1 << 5;
    /// Queued on the hub dispatch queue.
    pub const QUEUED_FOR_HUB: u32 = 1 << 6;
    /// Queued on the post-processing queue.
    pub const QUEUED_FOR_PP: u32 = 1 << 7;
    /// Not exposed to the hub or queries.
    pub const HIDDEN: u32 = 1 << 8;

    /// A child object triggered this update.
    pub const TRIGGERED: u32 = 1 << 9;
    /// The object was just loaded from the persistent store.
    pub const LOADED_FROM_STORE: u32 = 1 << 10;
    /// The object was just created.
    pub const NEW_OBJECT: u32 = 1 << 11;
    /// An update was received for an existing object.
    pub const UPDATED_OBJECT: u32 = 1 << 12;
    /// An instance or metric switched its live collection link.
    pub const CHANGED_LINKING: u32 = 1 << 13;
    /// UUID, name, units, title, family, chart type or priority changed.
    pub const CHANGED_METADATA: u32 = 1 << 14;
    /// The object has no retention.
    pub const ZERO_RETENTION: u32 = 1 << 15;
    /// The oldest sample time changed.
    pub const CHANGED_FIRST_TIME: u32 = 1 << 16;
    /// The latest sample time changed.
    pub const CHANGED_LAST_TIME: u32 = 1 << 17;
    /// The object stopped being collected.
    pub const STOPPED_COLLECTING: u32 = 1 << 18;
    /// The object started being collected.
    pub const STARTED_COLLECTING: u32 = 1 << 19;
    /// The child host feeding this object disconnected.
    pub const DISCONNECTED_CHILD: u32 = 1 << 20;
    /// The object is not used anymore.
    pub const UNUSED: u32 = 1 << 21;
    /// The storage engine rotated its database.
    pub const STORAGE_ROTATION: u32 = 1 << 22;
    /// The object must refresh its retention from the store.
    pub const UPDATE_RETENTION: u32 = 1 << 30;
}

/// Every pending-update reason bit.
pub const ALL_UPDATE_REASONS: u32 = flag::TRIGGERED
    | flag::LOADED_FROM_STORE
    | flag::NEW_OBJECT
    | flag::UPDATED_OBJECT
    | flag::CHANGED_LINKING
    | flag::CHANGED_METADATA
    | flag::ZERO_RETENTION
    | flag::CHANGED_FIRST_TIME
    | flag::CHANGED_LAST_TIME
    | flag::STOPPED_COLLECTING
    | flag::STARTED_COLLECTING
    | flag::DISCONNECTED_CHILD
    | flag::UNUSED
    | flag::STORAGE_ROTATION;

/// Bits a template may carry into an insert or conflict callback.
pub const ALLOWED_EXTERNALLY_ON_NEW_OBJECTS: u32 =
    flag::ARCHIVED | flag::HIDDEN | ALL_UPDATE_REASONS | flag::UPDATE_RETENTION;

/// Bits that must all be present before a node may be garbage collected.
pub const REQUIRED_FOR_DELETIONS: u32 = flag::DELETED | flag::LIVE_RETENTION;

/// Any of these bits blocks garbage collection.
pub const PREVENTING_DELETIONS: u32 =
    flag::QUEUED_FOR_HUB | flag::COLLECTED | flag::QUEUED_FOR_PP;

/// A pending-update reason with its display name and dispatch debounce.
pub struct Reason {
    /// The reason bit.
    pub flag: u32,
    /// Human readable name, for diagnostics.
    pub name: &'static str,
    /// Debounce applied when this reason queues a context for the hub.
    pub delay: Duration,
}

const FAST: Duration = Duration::from_secs(5);
const SLOW: Duration = Duration::from_secs(65);

/// The reasons table. Delays are fixed at build time.
pub const REASONS: &[Reason] = &[
    Reason { flag: flag::TRIGGERED, name: "triggered transition", delay: SLOW },
    Reason { flag: flag::NEW_OBJECT, name: "object created", delay: SLOW },
    Reason { flag: flag::UPDATED_OBJECT, name: "object updated", delay: SLOW },
    Reason { flag: flag::LOADED_FROM_STORE, name: "loaded from store", delay: SLOW },
    Reason { flag: flag::CHANGED_METADATA, name: "changed metadata", delay: SLOW },
    Reason { flag: flag::ZERO_RETENTION, name: "has no retention", delay: SLOW },
    Reason { flag: flag::CHANGED_FIRST_TIME, name: "updated first time", delay: SLOW },
    Reason { flag: flag::CHANGED_LAST_TIME, name: "updated last time", delay: SLOW },
    Reason { flag: flag::STOPPED_COLLECTING, name: "stopped collecting", delay: SLOW },
    Reason { flag: flag::STARTED_COLLECTING, name: "started collecting", delay: FAST },
    Reason { flag: flag::UNUSED, name: "unused", delay: FAST },
    Reason { flag: flag::CHANGED_LINKING, name: "changed live link", delay: SLOW },
    Reason { flag: flag::DISCONNECTED_CHILD, name: "child disconnected", delay: SLOW },
    Reason { flag: flag::STORAGE_ROTATION, name: "storage rotation", delay: SLOW },
    Reason { flag: flag::UPDATE_RETENTION, name: "updated retention", delay: SLOW },
];

/// Names of every reason bit set in `flags`, for diagnostics.
pub fn reason_names(flags: u32) -> Vec<&'static str> {
    REASONS
        .iter()
        .filter(|r| flags & r.flag != 0)
        .map(|r| r.name)
        .collect()
}

/// The smallest debounce among the reasons set in `flags`.
///
/// Falls back to one minute when no reason bit is set, which only happens
/// if a context was queued without a recorded cause.
pub fn minimum_dispatch_delay(flags: u32) -> Duration {
    REASONS
        .iter()
        .filter(|r| flags & r.flag != 0)
        .map(|r| r.delay)
        .min()
        .unwrap_or(Duration::from_secs(60))
}

/// The atomic flag word carried by every node.
#[derive(Debug)]
pub struct NodeFlags(AtomicU32);

impl NodeFlags {
    /// Creates a flag word with the given initial bits.
    pub fn new(bits: u32) -> Self {
        Self(AtomicU32::new(bits))
    }

    /// Returns all bits.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns true when ANY of the given bits is set.
    pub fn check(&self, bits: u32) -> bool {
        self.get() & bits != 0
    }

    /// Returns true when ALL the given bits are set.
    pub fn check_all(&self, bits: u32) -> bool {
        self.get() & bits == bits
    }

    /// Sets the given bits.
    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::SeqCst);
    }

    /// Clears the given bits.
    pub fn clear(&self, bits: u32) {
        self.0.fetch_and(!bits, Ordering::SeqCst);
    }

    /// Replaces the whole word.
    pub fn replace(&self, bits: u32) {
        self.0.store(bits, Ordering::SeqCst);
    }

    /// Marks the node updated, recording the given reason bits.
    pub fn set_updated(&self, reason: u32) {
        self.set(flag::UPDATED | reason);
    }

    /// Clears the updated marker together with every reason bit.
    pub fn clear_updated(&self) {
        self.clear(flag::UPDATED | ALL_UPDATE_REASONS | flag::UPDATE_RETENTION);
    }

    /// True when the node is currently collected.
    pub fn is_collected(&self) -> bool {
        self.check(flag::COLLECTED)
    }

    /// True when the node is archived.
    pub fn is_archived(&self) -> bool {
        self.check(flag::ARCHIVED)
    }

    /// True when the node is deleted, pending garbage collection.
    pub fn is_deleted(&self) -> bool {
        self.check(flag::DELETED)
    }

    /// True when the node carries pending updates.
    pub fn is_updated(&self) -> bool {
        self.check(flag::UPDATED)
    }

    // One CAS: when `check` is absent, add it together with
    // `conditionally_add`; unconditionally drop `always_remove`.
    fn add_remove(&self, check: u32, conditionally_add: u32, always_remove: u32) {
        let mut expected = self.0.load(Ordering::SeqCst);
        loop {
            let mut desired = expected & !always_remove;
            if expected & check == 0 {
                desired |= check | conditionally_add;
            }
            match self.0.compare_exchange(
                expected,
                desired,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => expected = actual,
            }
        }
    }

    /// Transitions the node to collected.
    pub fn set_collected(&self) {
        self.add_remove(
            flag::COLLECTED,
            flag::STARTED_COLLECTING | flag::UPDATED,
            flag::ARCHIVED
                | flag::DELETED
                | flag::STOPPED_COLLECTING
                | flag::ZERO_RETENTION
                | flag::DISCONNECTED_CHILD,
        );
    }

    /// Transitions the node to archived.
    pub fn set_archived(&self) {
        self.add_remove(
            flag::ARCHIVED,
            flag::STOPPED_COLLECTING | flag::UPDATED,
            flag::COLLECTED | flag::DELETED | flag::STARTED_COLLECTING | flag::ZERO_RETENTION,
        );
    }

    /// Transitions the node to deleted, recording an extra reason.
    pub fn set_deleted(&self, reason: u32) {
        self.add_remove(
            flag::DELETED,
            flag::ZERO_RETENTION | flag::UPDATED | reason,
            flag::ARCHIVED | flag::COLLECTED,
        );
    }
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self::new(0)
    }
}
