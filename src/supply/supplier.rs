//! The partition supplier: demand handling and the four-phase stream.
//!
//! For every partition a demand names, the supplier streams three sources in
//! a fixed order:
//!
//! 1. **Memory scan**: a snapshot iteration over the partition's in-memory
//!    entries, with a promotion listener registered on the overflow channels
//!    before the scan starts.
//! 2. **Overflow scan**: a closeable iteration over the partition's
//!    overflow entries, attaching deployment info to the batch at most once.
//! 3. **Promotion drain**: the listener is deregistered and the entries it
//!    captured while the scans raced with live promotion are replayed.
//!
//! Batches are size-bounded; when one fills, it is either *rotated* (sent,
//! and a fresh batch started) or, once the turn budget is exhausted, the
//! stream *suspends*: cursor, listener, and partition reservation move into
//! a [`SupplyContext`] and the turn ends. The next demand on the same
//! `(demander, worker_slot)` resumes from the context with a budget of one
//! batch, so no demander can monopolise the supplier.
//!
//! Ownership is re-validated against the affinity oracle before every entry;
//! a partition whose assignment moved away mid-stream is withdrawn with a
//! `missed` marker instead of a `last` marker.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::runtime::Handle;
use tracing::{debug, error};

use super::config::SupplyConfig;
use super::context::{
    EntryCursor, MemoryCursor, OverflowCursor, PromotionCursor, SupplyContext, SupplyContextStore,
    SupplyKey,
};
use super::error::{SendOutcome, SupplyResult};
use super::events::TopologyWatcher;
use super::message::{DemandMessage, SupplyMessage};
use super::metrics;
use super::promotion::PromotionBuffer;
use super::traits::{
    AffinityOracle, ClusterMembership, DeploymentRegistry, LocalPartition, MessageBus,
    OverflowListener, OverflowStore, PartitionTopology, ReserveOutcome,
};
use crate::types::{EntryInfo, PartitionId};

/// Entry filter applied before an entry is admitted to a batch.
pub type PreloadPredicate = Arc<dyn Fn(&EntryInfo) -> bool + Send + Sync>;

/// Streams owned partitions to demanding nodes in bounded batches.
pub struct PartitionSupplier {
    config: SupplyConfig,
    affinity: Arc<dyn AffinityOracle>,
    topology: Arc<dyn PartitionTopology>,
    overflow: Arc<dyn OverflowStore>,
    bus: Arc<dyn MessageBus>,
    deployments: Option<Arc<dyn DeploymentRegistry>>,
    contexts: Arc<SupplyContextStore>,
    watcher: TopologyWatcher,
    preload_predicate: RwLock<Option<PreloadPredicate>>,
}

impl std::fmt::Debug for PartitionSupplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSupplier").finish_non_exhaustive()
    }
}

/// Builder for [`PartitionSupplier`].
#[derive(Default)]
pub struct PartitionSupplierBuilder {
    config: Option<SupplyConfig>,
    affinity: Option<Arc<dyn AffinityOracle>>,
    topology: Option<Arc<dyn PartitionTopology>>,
    overflow: Option<Arc<dyn OverflowStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    membership: Option<Arc<dyn ClusterMembership>>,
    deployments: Option<Arc<dyn DeploymentRegistry>>,
}

impl PartitionSupplierBuilder {
    pub fn config(mut self, config: SupplyConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn affinity(mut self, affinity: Arc<dyn AffinityOracle>) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn topology(mut self, topology: Arc<dyn PartitionTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn overflow(mut self, overflow: Arc<dyn OverflowStore>) -> Self {
        self.overflow = Some(overflow);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn membership(mut self, membership: Arc<dyn ClusterMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Optional: without a registry, overflow entries ship without
    /// deployment handling.
    pub fn deployments(mut self, deployments: Arc<dyn DeploymentRegistry>) -> Self {
        self.deployments = Some(deployments);
        self
    }

    pub fn build(self) -> Result<PartitionSupplier, String> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let affinity = self.affinity.ok_or("affinity oracle is required")?;
        let topology = self.topology.ok_or("partition topology is required")?;
        let overflow = self.overflow.ok_or("overflow store is required")?;
        let bus = self.bus.ok_or("message bus is required")?;
        let membership = self.membership.ok_or("cluster membership is required")?;

        let contexts = Arc::new(SupplyContextStore::new(Arc::clone(&overflow)));
        let watcher = TopologyWatcher::new(membership, Arc::clone(&contexts), config.worker_slots);

        Ok(PartitionSupplier {
            config,
            affinity,
            topology,
            overflow,
            bus,
            deployments: self.deployments,
            contexts,
            watcher,
            preload_predicate: RwLock::new(None),
        })
    }
}

impl PartitionSupplier {
    pub fn builder() -> PartitionSupplierBuilder {
        PartitionSupplierBuilder::default()
    }

    pub fn config(&self) -> &SupplyConfig {
        &self.config
    }

    /// The context store, shared with the topology watcher.
    pub fn contexts(&self) -> &Arc<SupplyContextStore> {
        &self.contexts
    }

    /// Start reacting to membership events.
    pub fn start(&self, runtime: Handle) {
        self.watcher.start(runtime);
    }

    /// Stop the topology watcher and evict every in-flight stream.
    pub fn stop(&self) {
        self.watcher.stop();
        self.contexts.evict_all();
    }

    /// Install an entry filter applied in all three phases. Entries the
    /// predicate rejects are not shipped.
    pub fn set_preload_predicate(&self, predicate: PreloadPredicate) {
        *self
            .preload_predicate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(predicate);
    }

    /// Entry point for one demand message.
    ///
    /// Internal failures are logged at error level and never propagated back
    /// to the transport; the demander recovers by reissuing its demand.
    pub async fn handle_demand(&self, demand: DemandMessage) {
        let demander = demand.demander;
        let worker_slot = demand.worker_slot;
        if let Err(e) = self.process_demand(&demand).await {
            error!(
                demander = %demander,
                worker_slot,
                error = %e,
                "failed to supply partition demand"
            );
        }
    }

    async fn process_demand(&self, demand: &DemandMessage) -> SupplyResult<()> {
        let key: SupplyKey = (demand.demander, demand.worker_slot);
        let current = self.affinity.current_topology_version();

        if demand.topology_version != current {
            metrics::DEMANDS_DROPPED_STALE.inc();
            debug!(
                demander = %demand.demander,
                demand_version = %demand.topology_version,
                current_version = %current,
                "dropping demand with stale topology version"
            );
            // A context at this key was built against an old view and can
            // never be driven again.
            self.contexts.evict(key);
            return Ok(());
        }

        let mut resumed = self.contexts.take(key);
        if let Some(ctx) = resumed.take() {
            if ctx.topology_version() == demand.topology_version {
                resumed = Some(ctx);
            } else {
                debug!(
                    demander = %demand.demander,
                    context_version = %ctx.topology_version(),
                    demand_version = %demand.topology_version,
                    "invalidating supply context from older cluster view"
                );
                metrics::CONTEXTS_EVICTED.inc();
                self.contexts.dispose(ctx);
            }
        }

        if resumed.is_none() && demand.partitions.is_empty() {
            return Ok(());
        }

        // A fresh demand may stream a full turn; a resumed one yields after
        // a single batch.
        let max_batches = match resumed {
            Some(_) => 1,
            None => self.config.batches_per_turn,
        };
        let mut batches_sent: u64 = 0;

        let predicate = self
            .preload_predicate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut message = self.new_message(demand);

        let (mut partition_iter, mut pending) = match resumed {
            Some(ctx) => {
                let SupplyContext {
                    partition_iter,
                    partition,
                    reservation,
                    cursor,
                    listener,
                    ..
                } = ctx;
                (partition_iter, Some((partition, reservation, cursor, listener)))
            }
            None => (demand.partitions.clone().into_iter(), None),
        };

        loop {
            let (part, mut turn, mut cursor) = match pending.take() {
                Some((part, reservation, cursor, listener)) => (
                    part,
                    PartitionTurn::adopt(part, reservation, listener, Arc::clone(&self.overflow)),
                    Some(cursor),
                ),
                None => {
                    let Some(part) = partition_iter.next() else {
                        break;
                    };
                    match self.topology.reserve_owning(part, demand.topology_version) {
                        ReserveOutcome::Reserved(reservation) => (
                            part,
                            PartitionTurn::fresh(part, reservation, Arc::clone(&self.overflow)),
                            None,
                        ),
                        ReserveOutcome::NotOwner | ReserveOutcome::NotPresent => {
                            message.missed(part);
                            metrics::PARTITIONS_MISSED.inc();
                            debug!(
                                partition = part,
                                demander = %demand.demander,
                                "requested partition is not owned by local node"
                            );
                            continue;
                        }
                    }
                }
            };

            // A partition starting from scratch gets a promotion listener
            // before its memory scan; a resumed one carries its own.
            if cursor.is_none() && self.overflow.enabled() {
                turn.register_listener();
            }

            let mut part_missed = false;

            // ---- memory scan ----------------------------------------------

            let memory_cursor: Option<MemoryCursor> = match cursor.take() {
                None => Some(turn.entries().peekable()),
                Some(EntryCursor::InMemory(scan)) => Some(scan),
                Some(later) => {
                    cursor = Some(later);
                    None
                }
            };

            if let Some(mut scan) = memory_cursor {
                while scan.peek().is_some() {
                    if !self.affinity.belongs(demand.demander, part, demand.topology_version) {
                        self.withdraw(&mut message, part, demand);
                        part_missed = true;
                        break;
                    }
                    if message.message_size() >= self.config.batch_size_bytes {
                        batches_sent += 1;
                        if batches_sent >= max_batches {
                            self.suspend(key, partition_iter, part, turn, EntryCursor::InMemory(scan), demand);
                            self.reply(demand, message, false).await?;
                            return Ok(());
                        }
                        if self.reply(demand, message, true).await? == SendOutcome::RecipientGone {
                            return Ok(());
                        }
                        message = self.new_message(demand);
                    }
                    let Some(info) = scan.next() else { break };
                    if info.is_new {
                        continue;
                    }
                    if let Some(pred) = &predicate {
                        if !pred(&info) {
                            debug!(partition = part, "preload predicate rejected entry");
                            continue;
                        }
                    }
                    metrics::ENTRIES_SENT
                        .with_label_values(&[metrics::source::MEMORY])
                        .inc();
                    message.add_entry(part, info);
                }
            }

            if part_missed {
                continue;
            }

            // ---- overflow scan --------------------------------------------

            if self.overflow.enabled() {
                let overflow_cursor: Option<OverflowCursor> = match cursor.take() {
                    Some(EntryCursor::Overflow(scan)) => Some(scan),
                    Some(later) => {
                        cursor = Some(later);
                        None
                    }
                    // The scan may be absent when the partition never spilled.
                    None => self.overflow.iterator(part)?.map(OverflowCursor::new),
                };

                if let Some(mut scan) = overflow_cursor {
                    while scan.has_next() {
                        if !self.affinity.belongs(demand.demander, part, demand.topology_version) {
                            self.withdraw(&mut message, part, demand);
                            part_missed = true;
                            break;
                        }
                        if message.message_size() >= self.config.batch_size_bytes {
                            batches_sent += 1;
                            if batches_sent >= max_batches {
                                self.suspend(key, partition_iter, part, turn, EntryCursor::Overflow(scan), demand);
                                self.reply(demand, message, false).await?;
                                return Ok(());
                            }
                            if self.reply(demand, message, true).await? == SendOutcome::RecipientGone {
                                return Ok(());
                            }
                            message = self.new_message(demand);
                        }
                        let Some(entry) = scan.next() else { break };

                        let loader = entry.loader();
                        let info = entry.into_info();
                        if let Some(pred) = &predicate {
                            if !pred(&info) {
                                debug!(partition = part, "preload predicate rejected entry");
                                continue;
                            }
                        }

                        // The first entry with a resolvable loader stamps the
                        // partition's scan, exactly once even across batch
                        // rotations; entries whose loader cannot be resolved
                        // are not shipped at all.
                        if self.deployments.is_some() && !turn.deployment_stamped {
                            if let Some(loader) = loader {
                                let resolved = self
                                    .deployments
                                    .as_ref()
                                    .and_then(|registry| registry.deployment_for(loader));
                                match resolved {
                                    Some(deployment) => {
                                        message.set_deployment_info(deployment);
                                        turn.deployment_stamped = true;
                                    }
                                    None => {
                                        debug!(
                                            partition = part,
                                            %loader,
                                            "loader did not resolve to deployment info, skipping entry"
                                        );
                                        continue;
                                    }
                                }
                            }
                        }

                        metrics::ENTRIES_SENT
                            .with_label_values(&[metrics::source::OVERFLOW])
                            .inc();
                        message.add_overflow_entry(part, info);
                    }

                    if let Err(e) = scan.close() {
                        error!(partition = part, error = %e, "failed to close overflow scan");
                    }
                }
            }

            if part_missed {
                continue;
            }

            // ---- promotion drain ------------------------------------------

            // Deregister before reading: entries reported after this point
            // belong to the next rebalance, not this stream.
            let drain_cursor: Option<PromotionCursor> = match cursor.take() {
                Some(EntryCursor::Promotion(replay)) => Some(replay),
                _ => turn
                    .take_listener()
                    .map(|buffer| buffer.drain().into_iter().peekable()),
            };

            if let Some(mut replay) = drain_cursor {
                while replay.peek().is_some() {
                    if !self.affinity.belongs(demand.demander, part, demand.topology_version) {
                        self.withdraw(&mut message, part, demand);
                        part_missed = true;
                        break;
                    }
                    if message.message_size() >= self.config.batch_size_bytes {
                        batches_sent += 1;
                        if batches_sent >= max_batches {
                            self.suspend(key, partition_iter, part, turn, EntryCursor::Promotion(replay), demand);
                            self.reply(demand, message, false).await?;
                            return Ok(());
                        }
                        if self.reply(demand, message, true).await? == SendOutcome::RecipientGone {
                            return Ok(());
                        }
                        message = self.new_message(demand);
                    }
                    let Some(info) = replay.next() else { break };
                    if let Some(pred) = &predicate {
                        if !pred(&info) {
                            debug!(partition = part, "preload predicate rejected entry");
                            continue;
                        }
                    }
                    metrics::ENTRIES_SENT
                        .with_label_values(&[metrics::source::PROMOTION])
                        .inc();
                    message.add_entry(part, info);
                }
            }

            if part_missed {
                continue;
            }

            // ---- epilogue -------------------------------------------------

            message.last(part);
            metrics::PARTITIONS_COMPLETED.inc();
            debug!(partition = part, demander = %demand.demander, "partition fully supplied");
            // The reservation drops with the turn.
        }

        // Terminal batch for this turn; it may carry only markers.
        self.reply(demand, message, false).await?;
        Ok(())
    }

    fn new_message(&self, demand: &DemandMessage) -> SupplyMessage {
        SupplyMessage::new(
            demand.worker_slot,
            demand.update_sequence,
            self.config.cache_id,
            demand.topology_version,
        )
    }

    fn withdraw(&self, message: &mut SupplyMessage, part: PartitionId, demand: &DemandMessage) {
        message.missed(part);
        metrics::PARTITIONS_MISSED.inc();
        debug!(
            partition = part,
            demander = %demand.demander,
            "demanding node no longer needs requested partition"
        );
    }

    /// Park the stream: cursor, listener, and reservation move into a stored
    /// context that the next demand on this key resumes from.
    fn suspend(
        &self,
        key: SupplyKey,
        partition_iter: std::vec::IntoIter<PartitionId>,
        partition: PartitionId,
        turn: PartitionTurn,
        cursor: EntryCursor,
        demand: &DemandMessage,
    ) {
        if let Some((reservation, listener)) = turn.detach() {
            debug!(
                demander = %demand.demander,
                worker_slot = demand.worker_slot,
                partition,
                phase = cursor.phase_name(),
                "suspending supply stream"
            );
            self.contexts.put(
                key,
                SupplyContext {
                    partition_iter,
                    partition,
                    reservation,
                    cursor,
                    listener,
                    topology_version: demand.topology_version,
                },
            );
        }
    }

    async fn reply(
        &self,
        demand: &DemandMessage,
        message: SupplyMessage,
        throttle: bool,
    ) -> SupplyResult<SendOutcome> {
        debug!(
            demander = %demand.demander,
            worker_slot = demand.worker_slot,
            entries = message.entries().len(),
            size = message.message_size(),
            "replying to partition demand"
        );

        let outcome = self
            .bus
            .send_ordered(
                demand.demander,
                &demand.reply_topic,
                message,
                self.config.io_policy,
                demand.timeout,
            )
            .await?;

        match outcome {
            SendOutcome::Delivered => {
                metrics::BATCHES_SENT.inc();
                if throttle && !self.config.throttle.is_zero() {
                    tokio::time::sleep(self.config.throttle).await;
                }
            }
            SendOutcome::RecipientGone => {
                debug!(
                    demander = %demand.demander,
                    "recipient left cluster, stopping supply turn"
                );
            }
        }

        Ok(outcome)
    }
}

/// Resources held while actively streaming one partition.
///
/// Dropping the turn releases everything it still holds; suspension defuses
/// it by moving the reservation and listener into the stored context.
struct PartitionTurn {
    partition: PartitionId,
    overflow: Arc<dyn OverflowStore>,
    reservation: Option<Arc<dyn LocalPartition>>,
    listener: Option<Arc<PromotionBuffer>>,
    /// Whether this partition's overflow scan has attached deployment info.
    /// Survives batch rotation; a resumed scan starts unstamped.
    deployment_stamped: bool,
}

impl PartitionTurn {
    fn fresh(
        partition: PartitionId,
        reservation: Arc<dyn LocalPartition>,
        overflow: Arc<dyn OverflowStore>,
    ) -> Self {
        Self {
            partition,
            overflow,
            reservation: Some(reservation),
            listener: None,
            deployment_stamped: false,
        }
    }

    fn adopt(
        partition: PartitionId,
        reservation: Arc<dyn LocalPartition>,
        listener: Option<Arc<PromotionBuffer>>,
        overflow: Arc<dyn OverflowStore>,
    ) -> Self {
        Self {
            partition,
            overflow,
            reservation: Some(reservation),
            listener,
            deployment_stamped: false,
        }
    }

    fn entries(&self) -> Box<dyn Iterator<Item = EntryInfo> + Send> {
        match &self.reservation {
            Some(partition) => partition.entries(),
            None => Box::new(std::iter::empty()),
        }
    }

    fn register_listener(&mut self) {
        let buffer = Arc::new(PromotionBuffer::new(self.partition));
        let listener: Arc<dyn OverflowListener> = buffer.clone();
        self.overflow
            .add_overflow_listener(self.partition, listener.clone());
        self.overflow.add_promotion_listener(self.partition, listener);
        self.listener = Some(buffer);
    }

    /// Deregister the promotion listener and hand back its buffer for the
    /// drain. No-op if the turn carries no listener.
    fn take_listener(&mut self) -> Option<Arc<PromotionBuffer>> {
        let buffer = self.listener.take()?;
        let listener: Arc<dyn OverflowListener> = buffer.clone();
        self.overflow
            .remove_overflow_listener(self.partition, &listener);
        self.overflow
            .remove_promotion_listener(self.partition, &listener);
        Some(buffer)
    }

    /// Transfer the reservation and listener out without releasing them.
    fn detach(mut self) -> Option<(Arc<dyn LocalPartition>, Option<Arc<PromotionBuffer>>)> {
        let reservation = self.reservation.take()?;
        let listener = self.listener.take();
        Some((reservation, listener))
    }
}

impl Drop for PartitionTurn {
    fn drop(&mut self) {
        if let Some(buffer) = self.listener.take() {
            let listener: Arc<dyn OverflowListener> = buffer;
            self.overflow
                .remove_overflow_listener(self.partition, &listener);
            self.overflow
                .remove_promotion_listener(self.partition, &listener);
        }
        if let Some(reservation) = self.reservation.take() {
            reservation.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supply::mock::{MockAffinity, MockBus, MockMembership, MockOverflowStore, MockTopology};
    use crate::types::TopologyVersion;

    fn collaborators() -> (
        Arc<MockAffinity>,
        Arc<MockTopology>,
        Arc<MockOverflowStore>,
        Arc<MockBus>,
        Arc<MockMembership>,
    ) {
        (
            Arc::new(MockAffinity::new(TopologyVersion::new(1, 0))),
            Arc::new(MockTopology::new()),
            Arc::new(MockOverflowStore::new(true)),
            Arc::new(MockBus::new()),
            Arc::new(MockMembership::new()),
        )
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = PartitionSupplier::builder().build().unwrap_err();
        assert!(err.contains("affinity"));

        let (affinity, topology, overflow, bus, _) = collaborators();
        let err = PartitionSupplier::builder()
            .affinity(affinity)
            .topology(topology)
            .overflow(overflow)
            .bus(bus)
            .build()
            .unwrap_err();
        assert!(err.contains("membership"));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let (affinity, topology, overflow, bus, membership) = collaborators();
        let err = PartitionSupplier::builder()
            .config(SupplyConfig::default().with_batches_per_turn(0))
            .affinity(affinity)
            .topology(topology)
            .overflow(overflow)
            .bus(bus)
            .membership(membership)
            .build()
            .unwrap_err();
        assert!(err.contains("batches_per_turn"));
    }

    #[test]
    fn test_builder_defaults_config() {
        let (affinity, topology, overflow, bus, membership) = collaborators();
        let supplier = PartitionSupplier::builder()
            .affinity(affinity)
            .topology(topology)
            .overflow(overflow)
            .bus(bus)
            .membership(membership)
            .build()
            .expect("builds with default config");
        assert_eq!(
            supplier.config().batch_size_bytes,
            SupplyConfig::default().batch_size_bytes
        );
        assert!(supplier.contexts().is_empty());
    }
}
