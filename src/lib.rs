//! # flowstate - A Sharded Per-Flow State Table
//!
//! flowstate tracks live per-flow state (NAT bindings, connection-tracking
//! entries, ...) for a software dataplane whose packets are processed by many
//! worker threads in parallel.
//!
//! ## Features
//!
//! - **Single Writer per Shard**: each worker owns one shard and writes only there
//! - **Cross-Shard Reads**: lookups that miss locally fall back to every other shard
//! - **Reference Counting**: entries are pinned while referenced, never below zero
//! - **Idle Expiry**: unreferenced entries are evicted once idle past their key's budget
//! - **No Global Lock**: the only lock is a short-held, shard-local idle queue lock
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               flowstate                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Worker 0   │    │  Worker 1   │    │  Worker N   │   (owner threads)│
//! │  └──────┬──────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │         │ writes           │ writes           │ writes                   │
//! │         ▼                  ▼                  ▼                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                   ShardedFlowStateTable                          │   │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐            │   │
//! │  │  │   Shard 0    │  │   Shard 1    │  │   Shard N    │            │   │
//! │  │  │ map + idle Q │  │ map + idle Q │  │ map + idle Q │            │   │
//! │  │  └──────────────┘  └──────────────┘  └──────────────┘            │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │         ▲ get / reference / unref / fold (any thread)                   │
//! │         │                                                               │
//! │  ┌──────┴──────────────────────────────────────────────────────────┐    │
//! │  │                    ExpirySweeper                                 │    │
//! │  │                (Background Tokio Task)                           │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flowstate::state::{start_expiry_sweeper, FlowStateTable, ShardedFlowStateTable};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let table = Arc::new(ShardedFlowStateTable::<FlowKey, Binding>::new());
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&table));
//!
//!     for _ in 0..num_workers {
//!         let shard = table.add_shard();
//!         std::thread::spawn(move || worker_loop(shard));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`clock`]: Injectable monotonic tick sources
//! - [`error`]: The table's error type
//! - [`state`]: Entries, idle queues, shards, the aggregate table and the sweeper
//!
//! ## Design Highlights
//!
//! ### Entry Lifecycle
//!
//! An entry is created with one reference. When a release brings it to zero
//! it is parked in its shard's idle queue with the current tick; every later
//! zero-reporting release re-parks it with a fresh tick. A sweep evicts it once
//! `now - idle_since` exceeds the key's idle budget, provided it is still
//! unreferenced and still the current entry for its key.
//!
//! ### Accepted Races
//!
//! A `reference` that lands between a sweep's ref-count check and its map
//! removal can lose the entry. Flow state is always re-derivable, so callers
//! simply re-create it.

pub mod clock;
pub mod error;
pub mod state;

// Re-export commonly used types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::FlowStateError;
pub use state::{
    start_expiry_sweeper, ExpiryConfig, ExpirySweeper, FlowStateShard, FlowStateTable,
    IdleExpiration, Reducer, ShardStats, ShardedFlowStateTable, TableStats,
};

/// Version of flowstate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
