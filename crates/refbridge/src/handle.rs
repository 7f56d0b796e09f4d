//! The handle table: an arena of live values addressed by session-scoped ids.
//!
//! Every value that cannot cross the wire is parked here and replaced by a
//! reference marker. The far side addresses it later by `(session_id, id)`.
//!
//! Two eviction policies bound the table:
//! - **TTL**: an entry idle for longer than the TTL is dropped. Expiry is also
//!   checked lazily on lookup, so an expired entry is never returned even if no
//!   prune pass has run since.
//! - **Capacity**: when the table is full, the least-recently-accessed entries
//!   are dropped. Recency is a monotonically increasing access tick, so there
//!   are no ties.
//!
//! Both run on every [`HandleTable::store`] and from [`HandleTable::prune`],
//! which the background [`EvictionWorker`](crate::eviction::EvictionWorker)
//! calls periodically. Handles minted earlier in the same encode are never
//! evicted for capacity by that encode's own stores, so a single result can
//! briefly push the table over its cap; the next store or prune trims it. Eviction is cleanup, not correctness: a lookup that loses
//! a race with it simply reports `ReferenceNotFound`.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use ahash::{AHashMap, AHashSet};
use uuid::Uuid;

use crate::{
    config::BridgeConfig,
    error::{BridgeError, BridgeResult},
    session::SessionRegistry,
    value::Value,
};

// =============================================================================
// Clock
// =============================================================================

/// Time source for TTL decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Policy and reports
// =============================================================================

/// TTL and capacity limits of a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionPolicy {
    /// Idle lifetime; `None` never expires by time.
    pub ttl: Option<Duration>,
    /// Maximum number of live handles; `None` is unbounded.
    pub max_size: Option<usize>,
}

impl EvictionPolicy {
    #[must_use]
    pub fn new(ttl: Option<Duration>, max_size: Option<usize>) -> Self {
        Self { ttl, max_size }
    }

    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.ttl(), config.max_size())
    }
}

/// What one prune pass removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneReport {
    /// Entries removed because their TTL elapsed.
    pub expired: usize,
    /// Entries removed to get back under the capacity cap.
    pub evicted: usize,
}

impl PruneReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.evicted == 0
    }
}

/// Lifetime counters of a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    /// Handles currently live.
    pub live: usize,
    /// Handles ever stored.
    pub minted: u64,
    /// Handles dropped by TTL, during prune or on lookup.
    pub expired: u64,
    /// Handles dropped by the capacity cap.
    pub evicted: u64,
    /// Handles removed by explicit release or session release.
    pub released: u64,
}

// =============================================================================
// Table internals
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandleKey {
    session_id: String,
    id: String,
}

/// One parked value.
#[derive(Debug)]
struct Handle {
    value: Value,
    created_at: Instant,
    last_accessed_at: Instant,
    /// Key into the LRU index.
    tick: u64,
}

#[derive(Debug, Default)]
struct TableState {
    entries: AHashMap<HandleKey, Handle>,
    /// Access tick -> key; the first entry is the least recently used.
    lru: BTreeMap<u64, HandleKey>,
    sessions: SessionRegistry,
    next_tick: u64,
    stats: TableStats,
}

impl TableState {
    fn bump_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &HandleKey) -> Option<Handle> {
        let handle = self.entries.remove(key)?;
        self.lru.remove(&handle.tick);
        self.sessions.remove(&key.session_id, &key.id);
        Some(handle)
    }
}

// =============================================================================
// HandleTable
// =============================================================================

/// Concurrent, session-partitioned store of live values.
///
/// All operations take one internal lock briefly; none of them call back into
/// user code while holding it (evicted values are dropped after unlocking).
#[derive(Debug)]
pub struct HandleTable {
    state: Mutex<TableState>,
    policy: EvictionPolicy,
    clock: Arc<dyn Clock>,
}

impl HandleTable {
    #[must_use]
    pub fn new(policy: EvictionPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(policy: EvictionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            policy,
            clock,
        }
    }

    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Parks `value` under a fresh id in `session_id` and returns the id.
    ///
    /// Runs a prune pass first, making room for the new entry if the table is
    /// at capacity.
    pub fn store(&self, session_id: &str, value: Value) -> String {
        self.store_pinned(session_id, value, &AHashSet::new())
    }

    /// [`HandleTable::store`], but the ids in `pinned` are skipped by capacity
    /// eviction. TTL expiry still applies to them.
    pub(crate) fn store_pinned(&self, session_id: &str, value: Value, pinned: &AHashSet<String>) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let now = self.clock.now();
        let (report, garbage) = {
            let mut state = self.lock();
            let (report, garbage) = self.prune_locked(&mut state, now, 1, pinned);
            let tick = state.bump_tick();
            let key = HandleKey {
                session_id: session_id.to_owned(),
                id: id.clone(),
            };
            state.sessions.insert(session_id, &id);
            state.lru.insert(tick, key.clone());
            state.entries.insert(
                key,
                Handle {
                    value,
                    created_at: now,
                    last_accessed_at: now,
                    tick,
                },
            );
            state.stats.minted += 1;
            (report, garbage)
        };
        drop(garbage);
        if !report.is_empty() {
            tracing::debug!(expired = report.expired, evicted = report.evicted, "pruned handles on store");
        }
        tracing::debug!(session_id, id = %id, "stored handle");
        id
    }

    /// Looks up a live value and refreshes its last-access time.
    ///
    /// A missing, expired or other-session entry is `ReferenceNotFound`.
    pub fn resolve(&self, session_id: &str, id: &str) -> BridgeResult<Value> {
        let now = self.clock.now();
        let key = HandleKey {
            session_id: session_id.to_owned(),
            id: id.to_owned(),
        };
        let mut state = self.lock();
        let expired = match state.entries.get(&key) {
            None => None,
            Some(handle) => Some(self.is_expired(handle, now)),
        };
        match expired {
            Some(false) => {
                let tick = state.bump_tick();
                let TableState { entries, lru, .. } = &mut *state;
                let Some(handle) = entries.get_mut(&key) else {
                    return Err(BridgeError::not_found(session_id, id));
                };
                lru.remove(&handle.tick);
                handle.tick = tick;
                handle.last_accessed_at = now;
                let value = handle.value.clone();
                lru.insert(tick, key);
                Ok(value)
            }
            Some(true) => {
                let garbage = state.remove(&key);
                state.stats.expired += 1;
                drop(state);
                drop(garbage);
                tracing::debug!(session_id, id, "handle expired on lookup");
                Err(BridgeError::not_found(session_id, id))
            }
            None => {
                drop(state);
                tracing::debug!(session_id, id, "handle not found");
                Err(BridgeError::not_found(session_id, id))
            }
        }
    }

    /// Removes one handle. Returns `false` if it was already gone.
    pub fn release(&self, session_id: &str, id: &str) -> bool {
        let key = HandleKey {
            session_id: session_id.to_owned(),
            id: id.to_owned(),
        };
        let garbage = {
            let mut state = self.lock();
            let removed = state.remove(&key);
            if removed.is_some() {
                state.stats.released += 1;
            }
            removed
        };
        let released = garbage.is_some();
        drop(garbage);
        if released {
            tracing::debug!(session_id, id, "released handle");
        }
        released
    }

    /// Removes every handle of a session and returns how many there were.
    pub fn release_session(&self, session_id: &str) -> usize {
        let garbage: Vec<Handle> = {
            let mut state = self.lock();
            let ids = state.sessions.take(session_id);
            let removed: Vec<Handle> = ids
                .into_iter()
                .filter_map(|id| {
                    let key = HandleKey {
                        session_id: session_id.to_owned(),
                        id,
                    };
                    let handle = state.entries.remove(&key)?;
                    state.lru.remove(&handle.tick);
                    Some(handle)
                })
                .collect();
            state.stats.released += removed.len() as u64;
            removed
        };
        let count = garbage.len();
        drop(garbage);
        tracing::info!(session_id, released = count, "released session");
        count
    }

    /// Applies the TTL and capacity policies now.
    pub fn prune(&self) -> PruneReport {
        let now = self.clock.now();
        let (report, garbage) = {
            let mut state = self.lock();
            self.prune_locked(&mut state, now, 0, &AHashSet::new())
        };
        drop(garbage);
        if !report.is_empty() {
            tracing::debug!(expired = report.expired, evicted = report.evicted, "pruned handles");
        }
        report
    }

    /// Whether a live, unexpired handle exists. Does not refresh it.
    #[must_use]
    pub fn contains(&self, session_id: &str, id: &str) -> bool {
        let now = self.clock.now();
        let key = HandleKey {
            session_id: session_id.to_owned(),
            id: id.to_owned(),
        };
        self.lock()
            .entries
            .get(&key)
            .is_some_and(|handle| !self.is_expired(handle, now))
    }

    /// Age of a handle since it was stored. Does not refresh it.
    #[must_use]
    pub fn age(&self, session_id: &str, id: &str) -> Option<Duration> {
        let now = self.clock.now();
        let key = HandleKey {
            session_id: session_id.to_owned(),
            id: id.to_owned(),
        };
        self.lock()
            .entries
            .get(&key)
            .map(|handle| now.saturating_duration_since(handle.created_at))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn session_len(&self, session_id: &str) -> usize {
        self.lock().sessions.session_len(session_id)
    }

    /// Sessions that currently own at least one handle, sorted.
    #[must_use]
    pub fn sessions(&self) -> Vec<String> {
        self.lock().sessions.sessions()
    }

    #[must_use]
    pub fn stats(&self) -> TableStats {
        let state = self.lock();
        TableStats {
            live: state.entries.len(),
            ..state.stats
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, handle: &Handle, now: Instant) -> bool {
        self.policy
            .ttl
            .is_some_and(|ttl| now.saturating_duration_since(handle.last_accessed_at) > ttl)
    }

    /// Runs both policies, leaving room for `reserve` new entries under the cap.
    /// Capacity eviction passes over ids in `pinned`.
    ///
    /// Returns the removed handles so the caller can drop them after unlocking.
    fn prune_locked(
        &self,
        state: &mut TableState,
        now: Instant,
        reserve: usize,
        pinned: &AHashSet<String>,
    ) -> (PruneReport, Vec<Handle>) {
        let mut report = PruneReport::default();
        let mut garbage = Vec::new();

        if self.policy.ttl.is_some() {
            let expired: Vec<HandleKey> = state
                .entries
                .iter()
                .filter(|(_, handle)| self.is_expired(handle, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(handle) = state.remove(&key) {
                    garbage.push(handle);
                    report.expired += 1;
                }
            }
        }

        if let Some(max_size) = self.policy.max_size {
            let excess = (state.entries.len() + reserve).saturating_sub(max_size);
            let victims: Vec<HandleKey> = state
                .lru
                .values()
                .filter(|key| !pinned.contains(&key.id))
                .take(excess)
                .cloned()
                .collect();
            for key in victims {
                if let Some(handle) = state.remove(&key) {
                    garbage.push(handle);
                    report.evicted += 1;
                }
            }
        }

        state.stats.expired += report.expired as u64;
        state.stats.evicted += report.evicted as u64;
        (report, garbage)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(EvictionPolicy::from_config(&BridgeConfig::default()))
    }
}
