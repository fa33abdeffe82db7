//! Collaborator contracts for the supply engine.
//!
//! These traits abstract everything the supplier drives but does not own:
//! the affinity function, the local partition store, the overflow tier, the
//! message bus, cluster membership, and the deployment registry. Keeping
//! them as seams allows:
//! - Different backend implementations behind one engine
//! - Easier testing with the in-memory mocks in the `mock` module
//! - Clear separation between the supply algorithm and storage/transport
//!
//! Only the bus is async. Store iteration is synchronous: the state
//! machine never parks on I/O except at a batch boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::{SendOutcome, SupplyResult};
use super::message::SupplyMessage;
use crate::types::{
    DeploymentInfo, EntryInfo, IoPolicy, LoaderId, NodeId, OverflowEntry, PartitionId, ReplyTopic,
    TopologyVersion,
};

// ============================================================================
// Affinity
// ============================================================================

/// The mapping from partitions to responsible nodes at a topology version.
pub trait AffinityOracle: Send + Sync {
    /// The topology version the local node currently operates at.
    fn current_topology_version(&self) -> TopologyVersion;

    /// Whether `node` is assigned `partition` at `topology_version`.
    ///
    /// The supplier re-checks this on every entry it ships; a `false` answer
    /// mid-stream turns the partition into a `missed` marker.
    fn belongs(
        &self,
        node: NodeId,
        partition: PartitionId,
        topology_version: TopologyVersion,
    ) -> bool;
}

// ============================================================================
// Local partitions
// ============================================================================

/// Lifecycle state of a local partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Authoritative copy present; the only valid supply source.
    Owning,
    /// Being loaded from a remote owner.
    Moving,
    /// Scheduled for eviction once all reservations drop.
    Renting,
    /// Evicted.
    Evicted,
}

/// One local partition: a counted-lease reservation plus an entry scan.
///
/// A reserved `Owning` partition cannot be evicted until released. The
/// supplier holds the reservation for as long as it is streaming the
/// partition, including across suspensions.
pub trait LocalPartition: Send + Sync {
    fn id(&self) -> PartitionId;

    fn state(&self) -> PartitionState;

    /// Take one reservation. Returns `false` if the partition is already
    /// past the point of no return (eviction in progress).
    fn reserve(&self) -> bool;

    /// Drop one reservation. Must be called exactly once per successful
    /// `reserve`.
    fn release(&self);

    /// Snapshot scan of the in-memory entries of this partition.
    fn entries(&self) -> Box<dyn Iterator<Item = EntryInfo> + Send>;
}

/// Outcome of reserving a partition for supply.
pub enum ReserveOutcome {
    /// Partition reserved; the handle owns one reservation count.
    Reserved(Arc<dyn LocalPartition>),
    /// Partition present but not an authoritative source (or the
    /// reservation raced with eviction).
    NotOwner,
    /// No local copy of the partition at this topology version.
    NotPresent,
}

/// Access to the node's local partitions.
pub trait PartitionTopology: Send + Sync {
    /// Look up the local partition, never creating one.
    fn local_partition(
        &self,
        partition: PartitionId,
        topology_version: TopologyVersion,
    ) -> Option<Arc<dyn LocalPartition>>;

    /// Reserve `partition` if it is locally `Owning`.
    fn reserve_owning(
        &self,
        partition: PartitionId,
        topology_version: TopologyVersion,
    ) -> ReserveOutcome {
        match self.local_partition(partition, topology_version) {
            None => ReserveOutcome::NotPresent,
            Some(part) => {
                if part.state() != PartitionState::Owning {
                    ReserveOutcome::NotOwner
                } else if part.reserve() {
                    ReserveOutcome::Reserved(part)
                } else {
                    ReserveOutcome::NotOwner
                }
            }
        }
    }
}

// ============================================================================
// Overflow tier
// ============================================================================

/// Receives entries the overflow tier promotes (or evicts/overwrites) while
/// a listener is registered on a partition's channels.
pub trait OverflowListener: Send + Sync {
    fn on_entry(&self, entry: EntryInfo);
}

/// An iterator over a partition's overflow entries that must be closed when
/// the scan ends, releasing whatever off-heap or on-disk cursor backs it.
pub trait CloseableIterator<T>: Iterator<Item = T> + Send {
    /// Release the underlying cursor. Closing an already-closed iterator is
    /// a no-op.
    fn close(&mut self) -> SupplyResult<()>;

    fn is_closed(&self) -> bool;
}

/// The secondary storage tier holding entries evicted from memory.
///
/// Listener registration is keyed by partition and compared by `Arc`
/// identity; removing a listener that is not registered is a no-op.
pub trait OverflowStore: Send + Sync {
    /// Whether an overflow tier is configured at all. When `false` the
    /// supplier skips the overflow scan and the promotion machinery.
    fn enabled(&self) -> bool;

    /// Open a scan over a partition's overflow entries. Returns `None` when
    /// the partition has no overflow space.
    fn iterator(
        &self,
        partition: PartitionId,
    ) -> SupplyResult<Option<Box<dyn CloseableIterator<OverflowEntry>>>>;

    fn add_overflow_listener(&self, partition: PartitionId, listener: Arc<dyn OverflowListener>);

    fn remove_overflow_listener(
        &self,
        partition: PartitionId,
        listener: &Arc<dyn OverflowListener>,
    );

    fn add_promotion_listener(&self, partition: PartitionId, listener: Arc<dyn OverflowListener>);

    fn remove_promotion_listener(
        &self,
        partition: PartitionId,
        listener: &Arc<dyn OverflowListener>,
    );
}

// ============================================================================
// Transport
// ============================================================================

/// Ordered, topic-addressed delivery of supply batches.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `message` to `node` on `topic`, blocking until acknowledged or
    /// timed out. Batches sent on one topic are delivered in emission order.
    ///
    /// A recipient that has left the cluster is reported through
    /// [`SendOutcome::RecipientGone`], not an error; errors are reserved for
    /// transport failures the caller treats as internal.
    async fn send_ordered(
        &self,
        node: NodeId,
        topic: &ReplyTopic,
        message: SupplyMessage,
        policy: IoPolicy,
        timeout: Duration,
    ) -> SupplyResult<SendOutcome>;
}

// ============================================================================
// Membership
// ============================================================================

/// Kind of membership event the supplier reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventKind {
    NodeLeft,
    NodeFailed,
    RebalanceStopped,
}

/// A membership event carrying the node it concerns.
#[derive(Debug, Clone, Copy)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub node: NodeId,
}

/// Cluster membership event distribution.
pub trait ClusterMembership: Send + Sync {
    /// Subscribe to membership events. Every subscriber sees every event;
    /// a lagging subscriber may miss events and must tolerate that.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

// ============================================================================
// Deployments
// ============================================================================

/// Resolves loader ids carried by overflow entries to deployment metadata.
pub trait DeploymentRegistry: Send + Sync {
    /// Deployment info for `loader`, or `None` when the loader is unknown
    /// or exposes no deployment info.
    fn deployment_for(&self, loader: LoaderId) -> Option<DeploymentInfo>;
}
