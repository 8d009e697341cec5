//! Reference-Counted Flow Entries
//!
//! An [`Entry`] is the unit of stored state. It is shared between its shard's
//! map and, while idle, the shard's idle queue, so it lives behind an `Arc`.
//!
//! ## Reference Counting
//!
//! ```text
//!   store_and_reference ──> refs = 1
//!   reference()         ──> refs + 1
//!   release()           ──> max(refs - 1, 0), reports 0 when floored
//! ```
//!
//! A release that reports zero parks the entry in the idle queue with a fresh
//! timestamp, see [`release`].

use crate::clock::Clock;
use crate::state::idle_queue::IdleQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A stored key/value pair plus its reference count.
#[derive(Debug)]
pub struct Entry<K, V> {
    /// Shard-unique identity; survives overwrites of the same key
    id: u64,
    key: K,
    value: V,
    refs: AtomicUsize,
}

impl<K, V> Entry<K, V> {
    /// Creates a referenced (non-idle) entry.
    pub fn new(id: u64, key: K, value: V) -> Self {
        Self {
            id,
            key,
            value,
            refs: AtomicUsize::new(1),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Increments the reference count and returns the new count.
    #[inline]
    pub fn reference(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reference count, floored at zero.
    ///
    /// Returns the remaining count. A release on an entry already at zero is
    /// rejected and also returns zero.
    #[inline]
    pub fn release(&self) -> usize {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }
}

/// Releases one reference to `entry`; if that leaves it at zero, stamps the
/// current tick and (re)parks it in `idle`.
///
/// Returns the remaining reference count.
pub fn release<K, V>(
    entry: &Arc<Entry<K, V>>,
    clock: &dyn Clock,
    idle: &Mutex<IdleQueue<K, V>>,
) -> usize {
    let remaining = entry.release();
    if remaining == 0 {
        let mut queue = idle.lock();
        queue.park(Arc::clone(entry), clock.tick());
    }
    remaining
}
