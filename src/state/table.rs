//! Sharded Flow State Table
//!
//! The aggregate view over every shard. It answers reads, reference-count
//! changes, folds and expiration sweeps by fanning out over the shards in
//! creation order. It refuses direct writes: those must go through the shard
//! that owns the key.
//!
//! ## Fan-out Semantics
//!
//! ```text
//!   get / reference      first shard with a local hit wins
//!   ref_count            sum over shards holding the key
//!   unref                every shard holding the key
//!   touch                every shard, creating idle entries where absent
//!   fold / expire        every shard, accumulator threaded in order
//! ```
//!
//! `touch` on the aggregate materializes the key in every shard that did not
//! already hold it, so a key's reference count can be spread across shards.
//!
//! ## Shard List
//!
//! The list is append-only and copy-on-write. `add_shard` swaps in a new
//! snapshot under a short write lock; readers clone the current snapshot and
//! iterate it lock-free, so a concurrent append is simply not seen yet.

use crate::clock::{Clock, SystemClock};
use crate::error::{FlowStateError, Result};
use crate::state::shard::{FlowStateShard, ShardCore, ShardStats};
use crate::state::{FlowStateTable, IdleExpiration, Reducer};
use parking_lot::RwLock;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

type Shards<K, V> = Arc<[Arc<ShardCore<K, V>>]>;

/// State shared by the aggregate table and every shard handle it issued.
pub(crate) struct Registry<K, V> {
    shards: RwLock<Shards<K, V>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: RwLock::new(Arc::from(Vec::new())),
            clock,
        }
    }

    #[inline]
    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    #[inline]
    fn snapshot(&self) -> Shards<K, V> {
        Arc::clone(&self.shards.read())
    }

    fn push(&self) -> Arc<ShardCore<K, V>> {
        let mut shards = self.shards.write();
        let core = Arc::new(ShardCore::new(shards.len()));
        let mut next: Vec<_> = shards.iter().cloned().collect();
        next.push(Arc::clone(&core));
        *shards = Arc::from(next);
        core
    }

    /// Shallow lookup over every shard in creation order, skipping `skip`.
    pub(crate) fn get_skipping(&self, key: &K, skip: Option<usize>) -> Option<V> {
        self.snapshot()
            .iter()
            .filter(|shard| Some(shard.index()) != skip)
            .find_map(|shard| shard.shallow_get(key))
    }
}

/// Point-in-time counters summed over every shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub shards: usize,
    pub entries: usize,
    pub idle_slots: usize,
    pub expired: u64,
}

/// A sharded per-flow state table.
///
/// Create it once, hand one [`FlowStateShard`] to each worker thread via
/// [`add_shard`](Self::add_shard), and use the table itself as a read view
/// spanning all shards.
///
/// # Example
///
/// ```
/// use flowstate::clock::ManualClock;
/// use flowstate::state::{FlowStateTable, IdleExpiration, ShardedFlowStateTable};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[derive(Clone, PartialEq, Eq, Hash)]
/// struct Flow(&'static str);
///
/// impl IdleExpiration for Flow {
///     fn expires_after(&self) -> Duration {
///         Duration::from_nanos(100)
///     }
/// }
///
/// let clock = Arc::new(ManualClock::new(0));
/// let table = ShardedFlowStateTable::with_clock(clock.clone());
/// let worker = table.add_shard();
///
/// worker.store_and_reference(Flow("f1"), "v1").unwrap();
/// table.unref(&Flow("f1"));
///
/// clock.advance(Duration::from_nanos(101));
/// table.expire_idle_entries();
/// assert_eq!(table.get(&Flow("f1")), None);
/// ```
pub struct ShardedFlowStateTable<K, V> {
    registry: Arc<Registry<K, V>>,
}

impl<K, V> ShardedFlowStateTable<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    /// Creates an empty table driven by a [`SystemClock`].
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Creates an empty table driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Arc::new(Registry::new(clock)),
        }
    }

    /// Appends a new shard and returns its writer handle.
    ///
    /// Indices are assigned sequentially from zero and never reused.
    pub fn add_shard(&self) -> FlowStateShard<K, V> {
        let core = self.registry.push();
        debug!(shard = core.index(), "Flow state shard added");
        FlowStateShard::new(core, Arc::clone(&self.registry))
    }

    /// Number of shards created so far.
    pub fn shard_count(&self) -> usize {
        self.registry.shards.read().len()
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.registry.snapshot().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.snapshot().iter().all(|s| s.len() == 0)
    }

    /// Per-shard counters, in creation order.
    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.registry.snapshot().iter().map(|s| s.stats()).collect()
    }

    pub fn stats(&self) -> TableStats {
        let shards = self.registry.snapshot();
        shards.iter().map(|s| s.stats()).fold(
            TableStats {
                shards: shards.len(),
                ..TableStats::default()
            },
            |mut total, s| {
                total.entries += s.entries;
                total.idle_slots += s.idle_slots;
                total.expired += s.expired;
                total
            },
        )
    }
}

impl<K, V> FlowStateTable<K, V> for ShardedFlowStateTable<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    fn store_and_reference(&self, _key: K, _value: V) -> Result<Option<V>> {
        warn!("store_and_reference called on the aggregate flow state table");
        Err(FlowStateError::InvalidUsage {
            operation: "store_and_reference",
        })
    }

    fn remove(&self, _key: &K) -> Result<Option<V>> {
        warn!("remove called on the aggregate flow state table");
        Err(FlowStateError::InvalidUsage {
            operation: "remove",
        })
    }

    fn get(&self, key: &K) -> Option<V> {
        self.registry.get_skipping(key, None)
    }

    fn reference(&self, key: &K) -> Option<V> {
        self.registry
            .snapshot()
            .iter()
            .find_map(|shard| shard.reference(key))
    }

    fn touch(&self, key: K, value: V) {
        let clock = self.registry.clock();
        for shard in self.registry.snapshot().iter() {
            shard.touch(key.clone(), value.clone(), clock);
        }
    }

    fn ref_count(&self, key: &K) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|shard| shard.shallow_get(key).is_some())
            .map(|shard| shard.ref_count(key))
            .sum()
    }

    fn unref(&self, key: &K) {
        let clock = self.registry.clock();
        for shard in self.registry.snapshot().iter() {
            if shard.shallow_get(key).is_some() {
                shard.unref(key, clock);
            }
        }
    }

    fn reduce<U, R>(&self, seed: U, mut reducer: R) -> U
    where
        R: Reducer<K, V, U>,
    {
        self.registry
            .snapshot()
            .iter()
            .fold(seed, |acc, shard| shard.fold(acc, &mut reducer))
    }

    fn reduce_expired<U, R>(&self, seed: U, mut reducer: R) -> U
    where
        R: Reducer<K, V, U>,
    {
        let clock = self.registry.clock();
        self.registry
            .snapshot()
            .iter()
            .fold(seed, |acc, shard| {
                shard.expire_idle_entries(acc, &mut reducer, clock)
            })
    }
}

impl<K, V> Clone for ShardedFlowStateTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K, V> Default for ShardedFlowStateTable<K, V>
where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for ShardedFlowStateTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedFlowStateTable")
            .field("shards", &self.registry.shards.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::testing::{BudgetKey, TestKey, BUDGET};

    const T: u64 = 5_000;

    fn table_with_shards(
        n: usize,
    ) -> (
        Arc<ManualClock>,
        ShardedFlowStateTable<TestKey, &'static str>,
        Vec<FlowStateShard<TestKey, &'static str>>,
    ) {
        let clock = Arc::new(ManualClock::new(T));
        let table = ShardedFlowStateTable::with_clock(clock.clone());
        let shards = (0..n).map(|_| table.add_shard()).collect();
        (clock, table, shards)
    }

    #[test]
    fn test_add_shard_assigns_sequential_indices() {
        let (_clock, table, shards) = table_with_shards(4);
        let indices: Vec<_> = shards.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(table.shard_count(), 4);
        assert_eq!(table.add_shard().index(), 4);
    }

    #[test]
    fn test_writes_on_aggregate_are_rejected() {
        let (_clock, table, _shards) = table_with_shards(2);
        let key = TestKey("f1");

        assert_eq!(
            table.store_and_reference(key.clone(), "v1"),
            Err(FlowStateError::InvalidUsage {
                operation: "store_and_reference"
            })
        );
        assert_eq!(
            table.remove(&key),
            Err(FlowStateError::InvalidUsage { operation: "remove" })
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_scans_in_creation_order() {
        let (_clock, table, shards) = table_with_shards(3);
        let key = TestKey("f1");

        assert_eq!(table.get(&key), None);

        shards[2].store_and_reference(key.clone(), "from-2").unwrap();
        assert_eq!(table.get(&key), Some("from-2"));

        shards[1].store_and_reference(key.clone(), "from-1").unwrap();
        assert_eq!(table.get(&key), Some("from-1"));

        shards[1].remove(&key).unwrap();
        shards[2].remove(&key).unwrap();
        assert_eq!(table.get(&key), None);
    }

    #[test]
    fn test_reference_stops_at_first_hit() {
        let (_clock, table, shards) = table_with_shards(3);
        let key = TestKey("f1");

        shards[1].store_and_reference(key.clone(), "from-1").unwrap();
        shards[2].store_and_reference(key.clone(), "from-2").unwrap();

        assert_eq!(table.reference(&key), Some("from-1"));
        assert_eq!(shards[1].ref_count(&key), 2);
        assert_eq!(shards[2].ref_count(&key), 1);
        assert_eq!(table.reference(&TestKey("missing")), None);
    }

    #[test]
    fn test_touch_fans_out_to_every_shard() {
        let (_clock, table, shards) = table_with_shards(3);
        let key = TestKey("f1");

        table.touch(key.clone(), "v1");

        for shard in &shards {
            assert_eq!(shard.shallow_get(&key), Some("v1"));
            assert_eq!(shard.ref_count(&key), 0);
            assert_eq!(shard.idle_since(&key), Some(T));
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.ref_count(&key), 0);
    }

    #[test]
    fn test_touch_keeps_existing_values() {
        let (_clock, table, shards) = table_with_shards(2);
        let key = TestKey("f1");

        shards[0].store_and_reference(key.clone(), "owned").unwrap();
        table.touch(key.clone(), "broadcast");

        assert_eq!(shards[0].shallow_get(&key), Some("owned"));
        assert_eq!(shards[0].ref_count(&key), 1);
        assert_eq!(shards[1].shallow_get(&key), Some("broadcast"));
        assert_eq!(shards[1].ref_count(&key), 0);
    }

    #[test]
    fn test_ref_count_sums_across_shards() {
        let (_clock, table, shards) = table_with_shards(3);
        let key = TestKey("f1");

        shards[0].store_and_reference(key.clone(), "a").unwrap();
        shards[2].store_and_reference(key.clone(), "c").unwrap();
        shards[2].reference(&key);

        assert_eq!(table.ref_count(&key), 3);
        assert_eq!(table.ref_count(&TestKey("missing")), 0);
    }

    #[test]
    fn test_unref_releases_every_holder() {
        let (_clock, table, shards) = table_with_shards(3);
        let key = TestKey("f1");

        shards[0].store_and_reference(key.clone(), "a").unwrap();
        shards[1].store_and_reference(key.clone(), "b").unwrap();
        shards[1].reference(&key);

        table.unref(&key);
        assert_eq!(shards[0].ref_count(&key), 0);
        assert_eq!(shards[1].ref_count(&key), 1);
        assert_eq!(shards[2].idle_len(), 0);
        assert_eq!(table.ref_count(&key), 1);
    }

    #[test]
    fn test_fold_visits_each_entry_once() {
        let (_clock, table, shards) = table_with_shards(4);
        let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];

        for (i, name) in names.iter().enumerate() {
            shards[i % 3].store_and_reference(TestKey(*name), "v").unwrap();
        }

        let mut visited = table.fold(Vec::new(), |mut acc, k, _| {
            acc.push(k.0);
            acc
        });
        visited.sort();
        assert_eq!(visited, names.to_vec());
        assert_eq!(table.fold(0, |n, _, _| n + 1), names.len());
    }

    /// Keeps the key names it visits and sums the value lengths.
    struct NameCollector<'a> {
        seen: &'a mut Vec<&'static str>,
    }

    impl Reducer<TestKey, &'static str, usize> for NameCollector<'_> {
        fn apply(&mut self, acc: usize, key: &TestKey, value: &&'static str) -> usize {
            self.seen.push(key.0);
            acc + value.len()
        }
    }

    #[test]
    fn test_struct_reducer_for_fold_and_sweep() {
        let (clock, table, shards) = table_with_shards(2);
        shards[0].store_and_reference(TestKey("a"), "xx").unwrap();
        shards[1].touch(TestKey("b"), "yyy");

        let mut seen = Vec::new();
        let total = table.reduce(0, NameCollector { seen: &mut seen });
        seen.sort();
        assert_eq!(total, 5);
        assert_eq!(seen, vec!["a", "b"]);

        clock.set(T + BUDGET + 1);
        let mut evicted = Vec::new();
        let total = table.reduce_expired(0, NameCollector { seen: &mut evicted });
        assert_eq!(total, 3);
        assert_eq!(evicted, vec!["b"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expire_scenario_after_budget() {
        let (clock, table, shards) = table_with_shards(2);
        let key = TestKey("f1");

        shards[0].store_and_reference(key.clone(), "v1").unwrap();
        table.unref(&key);
        assert_eq!(table.ref_count(&key), 0);

        clock.set(T + BUDGET + 1);
        table.expire_idle_entries();
        assert_eq!(table.get(&key), None);
        assert_eq!(shards[1].get(&key), None);
    }

    #[test]
    fn test_expire_scenario_rereference_defers_eviction() {
        let (clock, table, shards) = table_with_shards(2);
        let key = TestKey("f1");

        shards[0].store_and_reference(key.clone(), "v1").unwrap();
        table.unref(&key);

        clock.advance_ticks(BUDGET / 2);
        table.reference(&key);
        table.unref(&key);

        clock.set(T + BUDGET + 1);
        table.expire_idle_entries();
        assert_eq!(table.get(&key), Some("v1"));
    }

    #[test]
    fn test_expire_threads_accumulator_across_shards() {
        let (clock, table, shards) = table_with_shards(3);

        shards[0].touch(TestKey("a"), "0");
        shards[1].touch(TestKey("b"), "1");
        shards[2].store_and_reference(TestKey("c"), "2").unwrap();
        shards[2].touch(TestKey("d"), "2");

        clock.set(T + BUDGET + 1);
        let evicted = table.expire_idle_entries_with(Vec::new(), |mut acc, k, v| {
            acc.push((k.0, *v));
            acc
        });

        assert_eq!(evicted, vec![("a", "0"), ("b", "1"), ("d", "2")]);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.stats(),
            TableStats {
                shards: 3,
                entries: 1,
                idle_slots: 0,
                expired: 3,
            }
        );
    }

    #[test]
    fn test_shard_stats_in_creation_order() {
        let (_clock, table, shards) = table_with_shards(2);
        shards[1].touch(TestKey("a"), "v");

        let stats = table.shard_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].entries, 0);
        assert_eq!(stats[1].index, 1);
        assert_eq!(stats[1].entries, 1);
        assert_eq!(stats[1].idle_slots, 1);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let clock = Arc::new(ManualClock::new(0));
        let table = ShardedFlowStateTable::<BudgetKey, u32>::with_clock(clock.clone());
        let shards: Vec<_> = (0..4).map(|_| table.add_shard()).collect();
        let key = |owner: u32, i: u32| BudgetKey(owner * 1_000 + i, 10);

        let writers: Vec<_> = shards
            .into_iter()
            .map(|shard| {
                std::thread::spawn(move || {
                    let owner = shard.index() as u32;
                    for i in 0..500 {
                        shard.store_and_reference(key(owner, i), i).unwrap();
                        shard.unref(&key(owner, i));
                    }
                    shard
                })
            })
            .collect();

        let reader = {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    table.get(&key(0, i));
                    if table.reference(&key(1, i)).is_some() {
                        table.unref(&key(1, i));
                    }
                }
            })
        };

        let shards: Vec<_> = writers.into_iter().map(|h| h.join().unwrap()).collect();
        reader.join().unwrap();

        assert_eq!(table.len(), 2_000);
        assert_eq!(table.fold(0, |n, _, _| n + 1), 2_000);
        assert_eq!(shards[3].get(&key(0, 499)), Some(499));

        clock.set(1_000);
        let evicted = table.expire_idle_entries_with(0, |n, _, _| n + 1);
        assert_eq!(evicted, 2_000);
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_racing_sweeps_keeps_idle_queue_consistent() {
        const KEYS: u32 = 200;
        const BUDGET_TICKS: u64 = 10;

        let clock = Arc::new(ManualClock::new(0));
        let table = ShardedFlowStateTable::<BudgetKey, u32>::with_clock(clock.clone());
        let shard = table.add_shard();
        for i in 0..KEYS {
            shard.store_and_reference(BudgetKey(i, BUDGET_TICKS), i).unwrap();
        }

        let sweeper = {
            let (clock, table) = (clock.clone(), table.clone());
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    clock.advance_ticks(1);
                    table.expire_idle_entries();
                }
            })
        };

        let releaser = {
            let table = table.clone();
            std::thread::spawn(move || {
                for round in 0..2_000 {
                    let key = BudgetKey(round % KEYS, BUDGET_TICKS);
                    table.reference(&key);
                    table.unref(&key);
                    table.unref(&key);
                }
            })
        };

        sweeper.join().unwrap();
        releaser.join().unwrap();

        // Survivors are unreferenced, so each one has a slot waiting for it
        assert_eq!(table.fold(0, |n, k, _| n + shard.ref_count(k)), 0);

        clock.advance_ticks(BUDGET_TICKS + 1);
        table.expire_idle_entries();
        assert_eq!(
            table.stats(),
            TableStats {
                shards: 1,
                entries: 0,
                idle_slots: 0,
                expired: KEYS as u64,
            }
        );
    }
}
