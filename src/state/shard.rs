//! Flow State Shards
//!
//! A shard owns one partition of the keyspace. Its map is written by a single
//! owner thread and read by everyone; its idle queue is shared under a
//! shard-local lock.
//!
//! ## Lookup Fallback
//!
//! ```text
//!   shard[i].get(k)
//!        │
//!        ├── local hit ─────────────────────────> value
//!        │
//!        └── miss ──> shard[0..n] except i, in creation order
//!                         (shallow lookups only) ──> first hit / None
//! ```
//!
//! Writes never touch sibling shards. Writing the same key through two
//! different shards is a client error.

use crate::clock::Clock;
use crate::error::Result;
use crate::state::entry::{self, Entry};
use crate::state::idle_queue::IdleQueue;
use crate::state::table::Registry;
use crate::state::{FlowStateTable, IdleExpiration, Reducer};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Point-in-time counters for one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Creation-order index of the shard
    pub index: usize,
    /// Entries currently in the map
    pub entries: usize,
    /// Idle queue slots, stale ones included
    pub idle_slots: usize,
    /// Entries evicted by expiration sweeps so far
    pub expired: u64,
}

/// Storage behind a shard, shared between the shard handle and the table.
///
/// Operations that need time take the clock explicitly.
pub(crate) struct ShardCore<K, V> {
    index: usize,
    data: DashMap<K, Arc<Entry<K, V>>>,
    idle: Mutex<IdleQueue<K, V>>,
    next_id: AtomicU64,
    expired: AtomicU64,
}

impl<K, V> ShardCore<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            data: DashMap::new(),
            idle: Mutex::new(IdleQueue::new()),
            next_id: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Clones the entry out so no map guard outlives the lookup.
    #[inline]
    fn lookup(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        self.data.get(key).map(|e| Arc::clone(e.value()))
    }

    fn insert(&self, key: K, value: V) -> Arc<Entry<K, V>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry::new(id, key.clone(), value));
        self.data.insert(key, Arc::clone(&entry));
        entry
    }

    pub(crate) fn shallow_get(&self, key: &K) -> Option<V> {
        self.lookup(key).map(|e| e.value().clone())
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        self.data.remove(key).map(|(_, e)| e.value().clone())
    }

    pub(crate) fn reference(&self, key: &K) -> Option<V> {
        let entry = self.lookup(key)?;
        entry.reference();
        Some(entry.value().clone())
    }

    pub(crate) fn ref_count(&self, key: &K) -> usize {
        self.lookup(key).map_or(0, |e| e.ref_count())
    }

    pub(crate) fn unref(&self, key: &K, clock: &dyn Clock) {
        if let Some(entry) = self.lookup(key) {
            entry::release(&entry, clock, &self.idle);
        }
    }

    pub(crate) fn touch(&self, key: K, value: V, clock: &dyn Clock) {
        let entry = match self.lookup(&key) {
            Some(existing) => {
                existing.reference();
                existing
            }
            None => self.insert(key, value),
        };
        entry::release(&entry, clock, &self.idle);
    }

    pub(crate) fn fold<U, R>(&self, seed: U, reducer: &mut R) -> U
    where
        R: Reducer<K, V, U>,
    {
        // Snapshot first so the reducer runs without holding map guards
        let entries: Vec<_> = self.data.iter().map(|e| Arc::clone(e.value())).collect();
        entries
            .iter()
            .fold(seed, |acc, e| reducer.apply(acc, e.key(), e.value()))
    }

    /// Pops every idle slot whose budget has run out and evicts the entries
    /// that are still unreferenced and still current in the map.
    ///
    /// The ref-count check and the map removal are not atomic with respect to
    /// a concurrent [`reference`](Self::reference): a reference landing in
    /// between is evicted anyway.
    pub(crate) fn expire_idle_entries<U, R>(
        &self,
        seed: U,
        reducer: &mut R,
        clock: &dyn Clock,
    ) -> U
    where
        R: Reducer<K, V, U>,
    {
        let now = clock.tick();
        let mut evicted = Vec::new();
        let mut stale = 0usize;

        {
            let mut queue = self.idle.lock();
            loop {
                let due = queue
                    .peek()
                    .is_some_and(|(idle_since, e)| is_expired(idle_since, e.key(), now));
                if !due {
                    break;
                }
                let Some((_, entry)) = queue.pop() else {
                    break;
                };

                let current = entry.ref_count() == 0
                    && self
                        .data
                        .remove_if(entry.key(), |_, held| Arc::ptr_eq(held, &entry))
                        .is_some();
                if current {
                    evicted.push(entry);
                } else {
                    stale += 1;
                }
            }
        }

        if stale > 0 {
            trace!(shard = self.index, stale, "Discarded stale idle slots");
        }
        if !evicted.is_empty() {
            self.expired
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(
                shard = self.index,
                evicted = evicted.len(),
                remaining = self.data.len(),
                "Expired idle flow entries"
            );
        }

        // Queue lock is released here, so the reducer may call back into shards
        evicted
            .iter()
            .fold(seed, |acc, e| reducer.apply(acc, e.key(), e.value()))
    }

    pub(crate) fn idle_since(&self, key: &K) -> Option<u64> {
        let entry = self.lookup(key)?;
        self.idle.lock().idle_since(entry.id())
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn stats(&self) -> ShardStats {
        ShardStats {
            index: self.index,
            entries: self.len(),
            idle_slots: self.idle_len(),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Elapsed idle time must strictly exceed the key's budget.
#[inline]
fn is_expired<K: IdleExpiration>(idle_since: u64, key: &K, now: u64) -> bool {
    let budget = u64::try_from(key.expires_after().as_nanos()).unwrap_or(u64::MAX);
    now.saturating_sub(idle_since) > budget
}

/// Writer handle for one shard of a [`ShardedFlowStateTable`].
///
/// Hand each handle to exactly one owner thread. Lookups that miss locally
/// fall back to the sibling shards of the same table.
///
/// [`ShardedFlowStateTable`]: crate::state::ShardedFlowStateTable
pub struct FlowStateShard<K, V> {
    core: Arc<ShardCore<K, V>>,
    registry: Arc<Registry<K, V>>,
}

impl<K, V> FlowStateShard<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    pub(crate) fn new(core: Arc<ShardCore<K, V>>, registry: Arc<Registry<K, V>>) -> Self {
        Self { core, registry }
    }

    /// Creation-order index of this shard within its table.
    pub fn index(&self) -> usize {
        self.core.index()
    }

    /// Looks `key` up in this shard only.
    pub fn shallow_get(&self, key: &K) -> Option<V> {
        self.core.shallow_get(key)
    }

    /// Tick at which the local entry for `key` was last parked as idle.
    ///
    /// `None` when the key is absent or its entry has never been idle.
    pub fn idle_since(&self, key: &K) -> Option<u64> {
        self.core.idle_since(key)
    }

    /// Number of entries stored in this shard.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle queue slots, including stale ones.
    pub fn idle_len(&self) -> usize {
        self.core.idle_len()
    }

    pub fn stats(&self) -> ShardStats {
        self.core.stats()
    }
}

impl<K, V> FlowStateTable<K, V> for FlowStateShard<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    fn store_and_reference(&self, key: K, value: V) -> Result<Option<V>> {
        let previous = self.get(&key);
        self.core.insert(key, value);
        Ok(previous)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self.core.remove(key))
    }

    fn get(&self, key: &K) -> Option<V> {
        self.core
            .shallow_get(key)
            .or_else(|| self.registry.get_skipping(key, Some(self.core.index())))
    }

    fn reference(&self, key: &K) -> Option<V> {
        self.core.reference(key)
    }

    fn touch(&self, key: K, value: V) {
        self.core.touch(key, value, self.registry.clock())
    }

    fn ref_count(&self, key: &K) -> usize {
        self.core.ref_count(key)
    }

    fn unref(&self, key: &K) {
        self.core.unref(key, self.registry.clock())
    }

    fn reduce<U, R>(&self, seed: U, mut reducer: R) -> U
    where
        R: Reducer<K, V, U>,
    {
        self.core.fold(seed, &mut reducer)
    }

    fn reduce_expired<U, R>(&self, seed: U, mut reducer: R) -> U
    where
        R: Reducer<K, V, U>,
    {
        self.core
            .expire_idle_entries(seed, &mut reducer, self.registry.clock())
    }
}

impl<K, V> std::fmt::Debug for FlowStateShard<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStateShard")
            .field("index", &self.core.index)
            .field("entries", &self.core.data.len())
            .finish()
    }
}
