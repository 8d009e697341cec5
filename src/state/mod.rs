//! Flow State Module
//!
//! This module provides the sharded, reference-counted flow-state table and
//! the background sweeper that evicts idle entries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ShardedFlowStateTable                      │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ DashMap │ │ DashMap │ │ DashMap │ │ DashMap │           │
//! │  │ IdleQ   │ │ IdleQ   │ │ IdleQ   │ │ IdleQ   │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!       ▲ writes            ▲ reads / ref / unref      ▲
//!       │ (owner thread)    │ (any thread)             │
//!                                        ┌─────────────┴─────────────┐
//!                                        │     ExpirySweeper         │
//!                                        │  (Background Tokio Task)  │
//!                                        └───────────────────────────┘
//! ```
//!
//! Every shard is written by exactly one thread. Reads, reference-count
//! changes and expiration sweeps may come from anywhere. The only lock on the
//! data path is the shard-local idle queue lock, taken when an entry's
//! reference count drops to zero and while sweeping.
//!
//! ## Example
//!
//! ```
//! use flowstate::state::{FlowStateTable, IdleExpiration, ShardedFlowStateTable};
//! use std::time::Duration;
//!
//! #[derive(Clone, PartialEq, Eq, Hash)]
//! struct Flow(u32);
//!
//! impl IdleExpiration for Flow {
//!     fn expires_after(&self) -> Duration {
//!         Duration::from_secs(60)
//!     }
//! }
//!
//! let table = ShardedFlowStateTable::<Flow, &str>::new();
//! let worker = table.add_shard();
//!
//! worker.store_and_reference(Flow(1), "nat:10.0.0.1").unwrap();
//! assert_eq!(table.get(&Flow(1)), Some("nat:10.0.0.1"));
//! assert_eq!(table.ref_count(&Flow(1)), 1);
//!
//! // Writes must go through a shard
//! assert!(table.remove(&Flow(1)).is_err());
//! ```

pub mod entry;
pub mod expiry;
pub mod idle_queue;
pub mod shard;
pub mod table;

use crate::error::Result;
use std::time::Duration;

// Re-export commonly used types
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use shard::{FlowStateShard, ShardStats};
pub use table::{ShardedFlowStateTable, TableStats};

/// Capability every key must provide: how long its entry may stay
/// unreferenced before a sweep is allowed to evict it.
pub trait IdleExpiration {
    fn expires_after(&self) -> Duration;
}

/// Folds visited entries into an accumulator.
///
/// Any `FnMut(U, &K, &V) -> U` closure is a reducer. Implement it on a struct
/// when the reduction carries state worth naming.
pub trait Reducer<K, V, U> {
    fn apply(&mut self, acc: U, key: &K, value: &V) -> U;
}

impl<K, V, U, F> Reducer<K, V, U> for F
where
    F: FnMut(U, &K, &V) -> U,
{
    #[inline]
    fn apply(&mut self, acc: U, key: &K, value: &V) -> U {
        self(acc, key, value)
    }
}

/// The contract shared by a single shard and the aggregate table.
pub trait FlowStateTable<K, V> {
    /// Stores `value` under `key` with a reference count of one and returns
    /// the value previously visible to [`get`](Self::get).
    fn store_and_reference(&self, key: K, value: V) -> Result<Option<V>>;

    /// Removes the entry for `key` regardless of its reference count.
    fn remove(&self, key: &K) -> Result<Option<V>>;

    fn get(&self, key: &K) -> Option<V>;

    /// Increments the reference count of `key` and returns its value.
    fn reference(&self, key: &K) -> Option<V>;

    /// Refreshes the idle timestamp of `key`, creating an idle entry if needed.
    fn touch(&self, key: K, value: V);

    fn ref_count(&self, key: &K) -> usize;

    /// Releases one reference to `key`. Never drops the count below zero.
    fn unref(&self, key: &K);

    /// Applies `reducer` to every entry, starting from `seed`.
    fn reduce<U, R>(&self, seed: U, reducer: R) -> U
    where
        R: Reducer<K, V, U>;

    /// Evicts every entry that has been idle for longer than its budget,
    /// applying `reducer` to each evicted entry.
    fn reduce_expired<U, R>(&self, seed: U, reducer: R) -> U
    where
        R: Reducer<K, V, U>;

    /// Closure form of [`reduce`](Self::reduce).
    fn fold<U, F>(&self, seed: U, reducer: F) -> U
    where
        F: FnMut(U, &K, &V) -> U,
    {
        self.reduce(seed, reducer)
    }

    /// Evicts every entry that has been idle for longer than its budget.
    fn expire_idle_entries(&self) {
        self.expire_idle_entries_with((), |acc, _, _| acc);
    }

    /// Closure form of [`reduce_expired`](Self::reduce_expired).
    fn expire_idle_entries_with<U, F>(&self, seed: U, reducer: F) -> U
    where
        F: FnMut(U, &K, &V) -> U,
    {
        self.reduce_expired(seed, reducer)
    }
}
