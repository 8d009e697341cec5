//! Idle Entry Queue
//!
//! A per-shard priority queue of unreferenced entries, ordered by the tick at
//! which their reference count last reached zero. The oldest idle entry is
//! always at the front.
//!
//! ## Layout
//!
//! ```text
//!   order: BTreeMap<(idle_since, entry id), Arc<Entry>>   front = oldest
//!   slots: HashMap<entry id, idle_since>                  membership index
//! ```
//!
//! Re-parking an entry that is already queued moves it instead of adding a
//! second slot. Entries that were overwritten or removed from the shard map
//! stay queued until a sweep pops them; the sweep recognizes them as stale.
//!
//! The queue has no interior locking. Each shard keeps it behind its own
//! `parking_lot::Mutex`.

use crate::state::entry::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Min-ordered queue of idle entries.
#[derive(Debug)]
pub struct IdleQueue<K, V> {
    order: BTreeMap<(u64, u64), Arc<Entry<K, V>>>,
    slots: HashMap<u64, u64>,
}

impl<K, V> IdleQueue<K, V> {
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            slots: HashMap::new(),
        }
    }

    /// Queues `entry` as idle since `now`, replacing any earlier slot it held.
    pub fn park(&mut self, entry: Arc<Entry<K, V>>, now: u64) {
        let id = entry.id();
        if let Some(previous) = self.slots.insert(id, now) {
            self.order.remove(&(previous, id));
        }
        self.order.insert((now, id), entry);
    }

    /// Returns the oldest idle entry and its idle-since tick.
    pub fn peek(&self) -> Option<(u64, &Arc<Entry<K, V>>)> {
        self.order
            .first_key_value()
            .map(|(&(idle_since, _), entry)| (idle_since, entry))
    }

    /// Removes and returns the oldest idle entry.
    pub fn pop(&mut self) -> Option<(u64, Arc<Entry<K, V>>)> {
        let ((idle_since, id), entry) = self.order.pop_first()?;
        self.slots.remove(&id);
        Some((idle_since, entry))
    }

    /// Returns the tick at which the entry with `id` was parked, if queued.
    pub fn idle_since(&self, id: u64) -> Option<u64> {
        self.slots.get(&id).copied()
    }

    /// Number of queued slots, stale ones included.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<K, V> Default for IdleQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
