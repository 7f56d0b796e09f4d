//! Per-encode identity bookkeeping.
//!
//! One [`IdentityTracker`] lives for exactly one top-level encode. It answers two
//! questions about a shared value: "am I already inside it?" (cycle detection)
//! and "did I already mint a marker for it?" (memoization).

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::{value::Value, wire::WireValue};

/// Address of a shared allocation.
///
/// Only meaningful while the allocation is alive; the tracker pins every value it
/// memoizes so an address cannot be reused mid-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(usize);

impl Identity {
    #[must_use]
    pub fn of<T: ?Sized>(arc: &Arc<T>) -> Self {
        Self(Arc::as_ptr(arc).cast::<()>().addr())
    }
}

/// Outcome of [`IdentityTracker::visit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// First entry into this value on the current path.
    New,
    /// The value is an ancestor of the current position: a cycle.
    AlreadyVisiting,
}

#[derive(Debug)]
struct Memo {
    marker: WireValue,
    /// Keeps the allocation alive so its address stays unique.
    _pin: Value,
}

#[derive(Debug, Default)]
pub struct IdentityTracker {
    memo: AHashMap<Identity, Memo>,
    visiting: AHashSet<Identity>,
}

impl IdentityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `identity` as being encoded, unless it already is.
    pub fn visit(&mut self, identity: Identity) -> Visit {
        if self.visiting.insert(identity) {
            Visit::New
        } else {
            Visit::AlreadyVisiting
        }
    }

    /// Ends the visit started by [`IdentityTracker::visit`].
    pub fn leave(&mut self, identity: Identity) {
        self.visiting.remove(&identity);
    }

    /// The marker already minted for `identity` in this encode, if any.
    #[must_use]
    pub fn memo_id(&self, identity: Identity) -> Option<&WireValue> {
        self.memo.get(&identity).map(|memo| &memo.marker)
    }

    /// Records the marker minted for `value`.
    pub fn remember(&mut self, identity: Identity, value: Value, marker: WireValue) {
        self.memo.insert(identity, Memo { marker, _pin: value });
    }

    /// Number of distinct values a marker was minted for.
    #[must_use]
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}
