//! Demand and supply messages.
//!
//! A [`SupplyMessage`] doubles as its own builder: the demand handler
//! appends entries until the estimated size reaches the batch cut-off, then
//! ships the message and starts a fresh one. Size accounting is a
//! conservative upper bound maintained incrementally; nothing is
//! serialized to measure it.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::MESSAGE_HEADER_BYTES;
use crate::types::{
    CacheId, DeploymentInfo, EntryInfo, NodeId, PartitionId, ReplyTopic, TopologyVersion,
    UpdateSequence, WorkerSlot,
};

/// A request for the contents of a set of partitions.
///
/// One `(demander, worker_slot)` pair has at most one outstanding demand;
/// repeated demands on the same pair resume the previous stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandMessage {
    /// Node requesting the partitions.
    pub demander: NodeId,
    /// Demander-side worker this demand belongs to.
    pub worker_slot: WorkerSlot,
    /// Demander's sequence number, echoed on every reply.
    pub update_sequence: UpdateSequence,
    /// Cluster view this demand was computed against.
    pub topology_version: TopologyVersion,
    /// Partitions requested, in supply order.
    pub partitions: Vec<PartitionId>,
    /// Topic the demander listens on for its batches.
    pub reply_topic: ReplyTopic,
    /// Per-send timeout for replies to this demand.
    pub timeout: Duration,
}

/// One size-bounded batch of supplied entries.
///
/// Entries for the same partition appear in the order they were added.
/// `missed` and `last` are idempotent per partition: a partition either
/// completes (`last`) or is withdrawn (`missed`), never both in one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyMessage {
    worker_slot: WorkerSlot,
    update_sequence: UpdateSequence,
    cache_id: CacheId,
    topology_version: TopologyVersion,
    entries: Vec<(PartitionId, EntryInfo)>,
    missed: BTreeSet<PartitionId>,
    last: BTreeSet<PartitionId>,
    deployment: Option<DeploymentInfo>,
    #[serde(skip, default)]
    estimated_size: usize,
}

impl SupplyMessage {
    /// Start an empty batch echoing the demand's identity fields.
    pub fn new(
        worker_slot: WorkerSlot,
        update_sequence: UpdateSequence,
        cache_id: CacheId,
        topology_version: TopologyVersion,
    ) -> Self {
        Self {
            worker_slot,
            update_sequence,
            cache_id,
            topology_version,
            entries: Vec::new(),
            missed: BTreeSet::new(),
            last: BTreeSet::new(),
            deployment: None,
            estimated_size: MESSAGE_HEADER_BYTES,
        }
    }

    /// Append an in-memory entry for `partition`.
    pub fn add_entry(&mut self, partition: PartitionId, info: EntryInfo) {
        self.estimated_size += info.estimated_size();
        self.entries.push((partition, info));
    }

    /// Append an entry sourced from the overflow tier.
    ///
    /// Identical layout to [`add_entry`](Self::add_entry); the demander
    /// tells the two apart only by whether deployment info is attached to
    /// the batch.
    pub fn add_overflow_entry(&mut self, partition: PartitionId, info: EntryInfo) {
        self.add_entry(partition, info);
    }

    /// Mark `partition` as no longer supplied from this node. Idempotent.
    pub fn missed(&mut self, partition: PartitionId) {
        self.missed.insert(partition);
    }

    /// Mark this batch as the terminal batch for `partition`. Idempotent.
    pub fn last(&mut self, partition: PartitionId) {
        self.last.insert(partition);
    }

    /// Attach deployment info. First attachment wins; later calls are
    /// no-ops. Returns whether this call attached.
    pub fn set_deployment_info(&mut self, deployment: DeploymentInfo) -> bool {
        if self.deployment.is_some() {
            return false;
        }
        self.deployment = Some(deployment);
        true
    }

    pub fn has_deployment(&self) -> bool {
        self.deployment.is_some()
    }

    /// Conservative upper bound on the serialized size of this message.
    pub fn message_size(&self) -> usize {
        self.estimated_size
    }

    pub fn worker_slot(&self) -> WorkerSlot {
        self.worker_slot
    }

    pub fn update_sequence(&self) -> UpdateSequence {
        self.update_sequence
    }

    pub fn cache_id(&self) -> CacheId {
        self.cache_id
    }

    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version
    }

    /// All entries in emission order.
    pub fn entries(&self) -> &[(PartitionId, EntryInfo)] {
        &self.entries
    }

    /// Entries belonging to one partition, in the order they were added.
    pub fn entries_for(&self, partition: PartitionId) -> impl Iterator<Item = &EntryInfo> {
        self.entries
            .iter()
            .filter(move |(p, _)| *p == partition)
            .map(|(_, info)| info)
    }

    pub fn missed_partitions(&self) -> &BTreeSet<PartitionId> {
        &self.missed
    }

    pub fn last_partitions(&self) -> &BTreeSet<PartitionId> {
        &self.last
    }

    pub fn deployment(&self) -> Option<&DeploymentInfo> {
        self.deployment.as_ref()
    }

    /// Whether the message carries nothing at all: no entries and no
    /// markers. Empty messages are still sent when they close out a turn.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.missed.is_empty() && self.last.is_empty()
    }
}
