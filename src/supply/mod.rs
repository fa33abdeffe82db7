//! The partition supply engine.
//!
//! This module implements the supplier side of partition rebalancing for a
//! distributed partitioned key-value store:
//!
//! - **Demand handling**: peers send demand messages naming the partitions
//!   they need; the supplier streams them back in size-bounded batches.
//! - **Resumable iteration**: a demand that exhausts its turn budget
//!   suspends into a [`SupplyContext`] and resumes on the next demand
//!   exactly where it stopped, anywhere in the memory scan, the overflow
//!   scan, or the promotion drain of a partition.
//! - **Fairness**: a fresh demand may stream several batches; a resumed one
//!   gets exactly one per turn, so no demander starves the rest.
//! - **Consistency under promotion**: a listener on the overflow channels
//!   captures entries that move tiers mid-scan, so nothing is lost to the
//!   race between the two snapshots.
//! - **Topology hygiene**: stale demands are dropped, ownership is
//!   re-validated per entry, and contexts of departed demanders are evicted
//!   with their reservations and listeners.
//!
//! # Architecture
//!
//! ```text
//!   demand ──▶ PartitionSupplier::handle_demand
//!                │
//!                ├─ stale topology? ──▶ drop (evict stale context)
//!                ├─ resume context?  ──▶ SupplyContextStore::take
//!                ▼
//!        per partition: reserve ─▶ memory ─▶ overflow ─▶ promotion ─▶ last
//!                │                   (batch full: rotate or suspend)
//!                ▼
//!        MessageBus::send_ordered ──▶ demander
//!
//!   NodeLeft / NodeFailed / RebalanceStopped ──▶ TopologyWatcher ──▶ evict
//! ```

mod config;
mod context;
mod error;
mod events;
mod message;
pub mod metrics;
mod promotion;
mod supplier;
pub mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use config::SupplyConfig;
pub use context::{
    EntryCursor, MemoryCursor, OverflowCursor, PromotionCursor, SupplyContext, SupplyContextStore,
    SupplyKey,
};
pub use error::{SendOutcome, SupplyError, SupplyResult};
pub use events::TopologyWatcher;
pub use message::{DemandMessage, SupplyMessage};
pub use promotion::PromotionBuffer;
pub use supplier::{PartitionSupplier, PartitionSupplierBuilder, PreloadPredicate};
