//! Visibility of items in the owning view.
//!
//! Workers consult the oracle before decoding in on-demand mode, and the
//! evictor never removes an item the oracle reports as visible.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::key::ItemKey;

/// Answers which items are currently on screen.
///
/// `visible_keys` is called while the cache lock is held, so implementations
/// must not call back into the cache.
pub trait VisibilityOracle: Send + Sync {
    fn is_visible(&self, key: &ItemKey) -> bool;

    fn visible_keys(&self) -> HashSet<ItemKey>;
}

/// Visible-set snapshot updated by the view whenever it scrolls or resizes.
#[derive(Default)]
pub struct VisibleSet {
    keys: RwLock<HashSet<ItemKey>>,
}

impl VisibleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the visible set.
    pub fn set<I: IntoIterator<Item = ItemKey>>(&self, keys: I) {
        *self.keys.write() = keys.into_iter().collect();
    }

    pub fn insert(&self, key: ItemKey) {
        self.keys.write().insert(key);
    }

    pub fn remove(&self, key: &ItemKey) {
        self.keys.write().remove(key);
    }

    pub fn clear(&self) {
        self.keys.write().clear();
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl VisibilityOracle for VisibleSet {
    fn is_visible(&self, key: &ItemKey) -> bool {
        self.keys.read().contains(key)
    }

    fn visible_keys(&self) -> HashSet<ItemKey> {
        self.keys.read().clone()
    }
}
