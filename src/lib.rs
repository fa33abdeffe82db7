//! # Supplyline
//! Partition supply engine for distributed partitioned key-value stores.
//!
//! When a peer node joins, leaves, or rebalances, it demands ranges of keys
//! ("partitions") from the nodes that currently own them. This crate
//! implements the *supplier* half of that exchange: it streams partition
//! contents back to the demander in size-bounded batches, resumes exactly
//! where it left off across repeated demands, and tears everything down
//! cleanly when the cluster view changes underneath it.
//!
//! # Architecture
//!
//! ```text
//!                         ┌──────────────┐
//!            demand ────▶ │ MessageBus   │ ◀──── supply batches
//!                         └──────┬───────┘
//!                                ▼
//!                     ┌─────────────────────┐
//!                     │  PartitionSupplier  │
//!                     │                     │
//!                     │  ┌───────────────┐  │     ┌──────────────────┐
//!                     │  │ demand handler│◀─┼────▶│SupplyContextStore│
//!                     │  └──────┬────────┘  │     └────────▲─────────┘
//!                     │         ▼           │              │ evict
//!                     │  ┌───────────────┐  │     ┌────────┴─────────┐
//!                     │  │ phase machine │  │     │ TopologyWatcher  │
//!                     │  └──┬────┬────┬──┘  │     └──────────────────┘
//!                     └─────┼────┼────┼─────┘
//!                           ▼    ▼    ▼
//!                      memory overflow promotion
//!                       scan    scan    drain
//! ```
//!
//! The heavy lifting (the local partition store, the overflow tier, the
//! affinity function, cluster membership, and the wire transport) lives
//! behind traits in [`supply::traits`]. The engine only drives them.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use supplyline::supply::{PartitionSupplier, SupplyConfig};
//! # use supplyline::supply::traits::*;
//! # fn collaborators() -> (Arc<dyn AffinityOracle>, Arc<dyn PartitionTopology>,
//! #     Arc<dyn OverflowStore>, Arc<dyn MessageBus>, Arc<dyn ClusterMembership>) { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (affinity, topology, overflow, bus, membership) = collaborators();
//!     let supplier = PartitionSupplier::builder()
//!         .config(SupplyConfig::default())
//!         .affinity(affinity)
//!         .topology(topology)
//!         .overflow(overflow)
//!         .bus(bus)
//!         .membership(membership)
//!         .build()
//!         .expect("collaborators wired");
//!     supplier.start(tokio::runtime::Handle::current());
//!
//!     // feed demands from your transport:
//!     // supplier.handle_demand(demand).await;
//! }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod supply;
pub mod telemetry;
pub mod types;

pub use supply::{
    DemandMessage, PartitionSupplier, SupplyConfig, SupplyContextStore, SupplyError,
    SupplyMessage, SupplyResult,
};
pub use types::{
    DeploymentInfo, EntryInfo, LoaderId, NodeId, OverflowEntry, PartitionId, ReplyTopic,
    TopologyVersion, WorkerSlot,
};
