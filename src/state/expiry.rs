//! Background Expiry Sweeper
//!
//! Idle entries are only ever deleted by an expiration sweep. This module runs
//! that sweep periodically on a Tokio task so that callers do not have to
//! schedule it themselves.
//!
//! ## Design
//!
//! The sweeper:
//! 1. Sleeps for the current interval (default: 100ms)
//! 2. Calls `expire_idle_entries` on the aggregate table, counting evictions
//! 3. Adapts the interval to the eviction rate
//! 4. Logs statistics about the cleanup
//!
//! ## Adaptive Frequency
//!
//! If a large fraction of the table is being evicted, the sweeper runs more
//! often. If nothing expires, it backs off to save CPU.

use crate::state::{FlowStateTable, IdleExpiration, ShardedFlowStateTable};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Base interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// If this fraction of entries was evicted, speed up sweeping
    pub speedup_threshold: f64,

    /// If this fraction of entries was evicted, slow down sweeping
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

impl ExpiryConfig {
    /// Computes the interval to use after a sweep that evicted `evicted` out
    /// of `entries_before` entries.
    pub fn next_interval(
        &self,
        current: Duration,
        entries_before: usize,
        evicted: u64,
    ) -> Duration {
        if entries_before == 0 {
            return current;
        }

        let rate = evicted as f64 / entries_before as f64;
        if rate > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else if rate < self.slowdown_threshold && evicted == 0 {
            (current * 2).min(self.max_interval)
        } else {
            current
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// Must be called from within a Tokio runtime. The sweeper stops when the
    /// returned handle is dropped.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use flowstate::state::{ExpiryConfig, ExpirySweeper, ShardedFlowStateTable};
    /// use std::sync::Arc;
    ///
    /// let table = Arc::new(ShardedFlowStateTable::<FlowKey, Binding>::new());
    /// let sweeper = ExpirySweeper::start(Arc::clone(&table), ExpiryConfig::default());
    ///
    /// // Sweeper runs in the background...
    ///
    /// drop(sweeper);
    /// ```
    pub fn start<K, V>(table: Arc<ShardedFlowStateTable<K, V>>, config: ExpiryConfig) -> Self
    where
        K: Eq + Hash + Clone + IdleExpiration + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(table, config, shutdown_rx));

        info!("Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop<K, V>(
    table: Arc<ShardedFlowStateTable<K, V>>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    K: Eq + Hash + Clone + IdleExpiration,
    V: Clone,
{
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let entries_before = table.len();
        let evicted = table.expire_idle_entries_with(0u64, |n, _, _| n + 1);

        let next = config.next_interval(current_interval, entries_before, evicted);
        if next != current_interval {
            trace!(
                evicted,
                entries_before,
                new_interval_ms = next.as_millis(),
                "Adjusted expiry sweep interval"
            );
            current_interval = next;
        }

        if evicted > 0 {
            debug!(
                evicted,
                entries_remaining = table.len(),
                "Expired idle flow entries"
            );
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper<K, V>(table: Arc<ShardedFlowStateTable<K, V>>) -> ExpirySweeper
where
    K: Eq + Hash + Clone + IdleExpiration + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    ExpirySweeper::start(table, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::testing::{TestKey, BUDGET};

    fn fast_config() -> ExpiryConfig {
        ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_next_interval_adapts_to_eviction_rate() {
        let config = ExpiryConfig::default();
        let base = config.base_interval;

        assert_eq!(config.next_interval(base, 0, 0), base);
        assert_eq!(config.next_interval(base, 100, 50), base / 2);
        assert_eq!(config.next_interval(base, 100, 0), base * 2);
        assert_eq!(config.next_interval(base, 100, 5), base);

        assert_eq!(
            config.next_interval(config.min_interval, 100, 100),
            config.min_interval
        );
        assert_eq!(
            config.next_interval(config.max_interval, 100, 0),
            config.max_interval
        );
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let table = Arc::new(ShardedFlowStateTable::with_clock(clock.clone()));
        let shard = table.add_shard();

        for name in ["a", "b", "c", "d"] {
            shard.touch(TestKey(name), 1u32);
        }
        shard.store_and_reference(TestKey("held"), 2).unwrap();
        assert_eq!(table.len(), 5);

        clock.advance_ticks(BUDGET + 1);
        let _sweeper = ExpirySweeper::start(Arc::clone(&table), fast_config());

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Only the referenced entry should remain
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&TestKey("held")), Some(2));
        assert_eq!(table.stats().expired, 4);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let clock = Arc::new(ManualClock::new(0));
        let table = Arc::new(ShardedFlowStateTable::with_clock(clock.clone()));
        let shard = table.add_shard();

        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&table), fast_config());
            tokio::time::sleep(Duration::from_millis(50)).await;
            // Sweeper is dropped here
        }

        shard.touch(TestKey("a"), 1u32);
        clock.advance_ticks(BUDGET + 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // Nothing swept it, but a manual sweep still can
        assert_eq!(table.len(), 1);
        table.expire_idle_entries();
        assert!(table.is_empty());
    }
}
