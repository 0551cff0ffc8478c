//! Bounded thumbnail store with batched, visibility-aware eviction.
//!
//! The store itself is not synchronised: it lives inside the scheduler
//! lock, so workers publishing results and the public API never race.
//!
//! Accounting is in "cost units": pixel bytes under a memory limit, one per
//! payload under an item-count limit. `used` covers every payload-holding
//! entry that is not pending removal. When a publish pushes `used` over the
//! limit, every non-visible payload is moved to the pending-removal set;
//! once pending cost exceeds a quarter of the limit, all pending entries
//! are dropped in one pass.

use std::collections::{HashMap, HashSet};

use crate::config::CacheLimit;
use crate::decoder::Payload;
use crate::key::{EmbeddedPolicy, ItemKey, ThumbSize};
use crate::visibility::VisibilityOracle;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    /// Never generated, or invalidated by a rebuild.
    #[default]
    Unknown,
    Cached,
    Error,
}

/// One stored decode result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub size: ThumbSize,
    pub policy: EmbeddedPolicy,
    pub state: EntryState,
    pub payload: Option<Payload>,
}

impl CacheEntry {
    /// Whether this entry already answers a request for `size`/`policy`.
    fn satisfies(&self, size: ThumbSize, policy: EmbeddedPolicy) -> bool {
        self.state != EntryState::Unknown && self.size == size && self.policy == policy
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Cost units held by live entries.
    pub used: u64,
    pub items: usize,
    pub pending_removal: usize,
    pub queued: usize,
}

/// Map from item key to decode result, with cost accounting.
pub struct CacheStore {
    entries: HashMap<ItemKey, CacheEntry>,
    pending: HashSet<ItemKey>,
    pending_cost: u64,
    used: u64,
    limit: CacheLimit,
    editing: HashSet<ItemKey>,
    hits: u64,
    misses: u64,
}

impl CacheStore {
    pub fn new(limit: CacheLimit) -> Self {
        Self {
            entries: HashMap::new(),
            pending: HashSet::new(),
            pending_cost: 0,
            used: 0,
            limit,
            editing: HashSet::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn limit(&self) -> CacheLimit {
        self.limit
    }

    /// Change the limit, re-costing every entry in the new unit.
    pub fn set_limit(&mut self, limit: CacheLimit) {
        self.limit = limit;
        self.used = 0;
        self.pending_cost = 0;
        for (key, entry) in &self.entries {
            let cost = entry.payload.as_ref().map_or(0, |p| cost_of(limit, p));
            if self.pending.contains(key) {
                self.pending_cost += cost;
            } else {
                self.used += cost;
            }
        }
    }

    fn cost(&self, payload: &Payload) -> u64 {
        cost_of(self.limit, payload)
    }

    /// Whether a request for `key` at `size`/`policy` would be redundant.
    ///
    /// Entries pending removal never satisfy a request; re-adding one
    /// regenerates it.
    pub fn is_satisfied(&self, key: &ItemKey, size: ThumbSize, policy: EmbeddedPolicy) -> bool {
        !self.pending.contains(key)
            && self
                .entries
                .get(key)
                .is_some_and(|e| e.satisfies(size, policy))
    }

    /// Payload for `key`, if any. `clone` returns a deep copy.
    pub fn get_image(&mut self, key: &ItemKey, clone: bool) -> Option<Payload> {
        match self.entries.get(key).and_then(|e| e.payload.as_ref()) {
            Some(payload) => {
                self.hits += 1;
                Some(if clone { payload.deep_clone() } else { payload.clone() })
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// State of `key`; absent entries report `Unknown`.
    pub fn state(&self, key: &ItemKey) -> EntryState {
        self.entries.get(key).map_or(EntryState::Unknown, |e| e.state)
    }

    /// Raw entry for `key`, including entries pending removal.
    pub fn entry(&self, key: &ItemKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn begin_edit(&mut self, key: ItemKey) {
        self.editing.insert(key);
    }

    pub fn end_edit(&mut self, key: &ItemKey) {
        self.editing.remove(key);
    }

    pub fn is_editing(&self, key: &ItemKey) -> bool {
        self.editing.contains(key)
    }

    /// Drop the entry for `key` and take its cost off whichever counter holds it.
    fn detach(&mut self, key: &ItemKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        let cost = entry.payload.as_ref().map_or(0, |p| self.cost(p));
        if self.pending.remove(key) {
            self.pending_cost -= cost;
        } else {
            self.used -= cost;
        }
        Some(entry)
    }

    /// Store a successful decode, then evict if the limit is exceeded.
    pub fn insert_payload(
        &mut self,
        key: ItemKey,
        size: ThumbSize,
        policy: EmbeddedPolicy,
        payload: Payload,
        oracle: &dyn VisibilityOracle,
    ) {
        self.detach(&key);
        self.used += self.cost(&payload);
        self.entries.insert(
            key.clone(),
            CacheEntry {
                size,
                policy,
                state: EntryState::Cached,
                payload: Some(payload),
            },
        );

        if self.over_limit() {
            self.evict(oracle, &key);
        }
        self.purge_if_due(oracle);
    }

    /// Record a failed decode as a negative entry.
    pub fn insert_error(
        &mut self,
        key: ItemKey,
        size: ThumbSize,
        policy: EmbeddedPolicy,
        oracle: &dyn VisibilityOracle,
    ) {
        self.detach(&key);
        self.entries.insert(
            key,
            CacheEntry {
                size,
                policy,
                state: EntryState::Error,
                payload: None,
            },
        );
        self.purge_if_due(oracle);
    }

    fn over_limit(&self) -> bool {
        self.limit.units().is_some_and(|limit| self.used > limit)
    }

    /// Move every non-visible payload except `keep` and keys under edit to
    /// the pending-removal set.
    fn evict(&mut self, oracle: &dyn VisibilityOracle, keep: &ItemKey) {
        let visible = oracle.visible_keys();
        let limit = self.limit;
        let mut marked = 0usize;
        for (key, entry) in &self.entries {
            let Some(payload) = entry.payload.as_ref() else {
                continue;
            };
            if key == keep
                || visible.contains(key)
                || self.editing.contains(key)
                || self.pending.contains(key)
            {
                continue;
            }
            let cost = cost_of(limit, payload);
            self.pending.insert(key.clone());
            self.used -= cost;
            self.pending_cost += cost;
            marked += 1;
        }
        tracing::debug!(
            "eviction marked {marked} entries, {} visible kept, pending cost {}",
            visible.len(),
            self.pending_cost
        );
    }

    /// Remove `key`: immediately, or lazily through the pending-removal batch.
    pub fn remove(&mut self, key: &ItemKey, now: bool, oracle: &dyn VisibilityOracle) -> bool {
        if now {
            return self.detach(key).is_some();
        }
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        if self.pending.insert(key.clone()) {
            let cost = entry.payload.as_ref().map_or(0, |p| cost_of(self.limit, p));
            self.used -= cost;
            self.pending_cost += cost;
        }
        self.purge_if_due(oracle);
        true
    }

    /// Whether pending cost has crossed a quarter of the limit.
    fn purge_due(&self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.limit.units() {
            Some(limit) => self.pending_cost.saturating_mul(4) > limit,
            None => true,
        }
    }

    fn purge_if_due(&mut self, oracle: &dyn VisibilityOracle) {
        if self.purge_due() {
            self.purge(oracle);
        }
    }

    /// Physically drop every pending entry that is not visible now.
    ///
    /// Pending entries that scrolled back into view are returned to the
    /// live set. Returns the number of entries dropped.
    pub fn purge(&mut self, oracle: &dyn VisibilityOracle) -> usize {
        let visible = oracle.visible_keys();
        let limit = self.limit;
        let mut dropped = 0;
        for key in std::mem::take(&mut self.pending) {
            if visible.contains(&key) {
                if let Some(payload) = self.entries.get(&key).and_then(|e| e.payload.as_ref()) {
                    self.used += cost_of(limit, payload);
                }
                continue;
            }
            self.entries.remove(&key);
            dropped += 1;
        }
        self.pending_cost = 0;
        dropped
    }

    /// Mark every finished entry stale so the next `add` regenerates it.
    ///
    /// Payloads stay displayable and counted; error entries become
    /// retryable.
    pub fn rebuild(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = EntryState::Unknown;
        }
    }

    /// Drop every entry and reset counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.pending_cost = 0;
        self.used = 0;
    }

    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            used: self.used,
            items: self.entries.len(),
            pending_removal: self.pending.len(),
            queued: 0,
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &ItemKey) -> bool {
        self.pending.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recomputed cost of live entries; equals `used()` whenever the store is consistent.
    pub fn live_cost(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(k, _)| !self.pending.contains(*k))
            .filter_map(|(_, e)| e.payload.as_ref())
            .map(|p| self.cost(p))
            .sum()
    }
}

fn cost_of(limit: CacheLimit, payload: &Payload) -> u64 {
    match limit {
        CacheLimit::Items(_) => 1,
        CacheLimit::Bytes(_) | CacheLimit::Unbounded => payload.approx_bytes(),
    }
}
