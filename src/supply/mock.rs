//! In-memory mock collaborators for testing.
//!
//! Full-featured in-memory implementations of every collaborator trait, so
//! the supply engine can be exercised end to end without a cluster, a
//! storage engine, or a wire transport.
//!
//! # Usage
//!
//! Available when the `test-utilities` feature is enabled, or during unit
//! tests:
//!
//! ```toml
//! [dev-dependencies]
//! supplyline = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::error::{SendOutcome, SupplyResult};
use super::message::SupplyMessage;
use super::traits::{
    AffinityOracle, CloseableIterator, ClusterMembership, DeploymentRegistry, LocalPartition,
    MembershipEvent, MembershipEventKind, MessageBus, OverflowListener, OverflowStore,
    PartitionState, PartitionTopology,
};
use crate::types::{
    DeploymentInfo, EntryInfo, IoPolicy, LoaderId, NodeId, OverflowEntry, PartitionId, ReplyTopic,
    TopologyVersion,
};

/// Build a committed entry with the given key/value payload.
pub fn entry(key: impl Into<Bytes>, value: impl Into<Bytes>, version: u64) -> EntryInfo {
    EntryInfo {
        key: key.into(),
        value: value.into(),
        version,
        ttl_millis: 0,
        expire_time_millis: 0,
        is_new: false,
    }
}

/// Build an overflow entry with the given key/value payload.
pub fn overflow_entry(key: impl Into<Bytes>, value: impl Into<Bytes>, version: u64) -> OverflowEntry {
    OverflowEntry {
        key: key.into(),
        value: value.into(),
        version,
        ttl_millis: 0,
        expire_time_millis: 0,
        key_loader: None,
        value_loader: None,
    }
}

// ============================================================================
// Affinity
// ============================================================================

/// Scriptable affinity oracle.
///
/// By default every node belongs to every partition at the current version.
/// Assignments can be revoked outright or after a set number of ownership
/// checks, which lets tests flip ownership mid-stream deterministically.
pub struct MockAffinity {
    current: Mutex<TopologyVersion>,
    revoked: DashMap<(NodeId, PartitionId), ()>,
    revoke_countdown: DashMap<(NodeId, PartitionId), AtomicI64>,
}

impl MockAffinity {
    pub fn new(version: TopologyVersion) -> Self {
        Self {
            current: Mutex::new(version),
            revoked: DashMap::new(),
            revoke_countdown: DashMap::new(),
        }
    }

    pub fn set_topology_version(&self, version: TopologyVersion) {
        *self.current.lock().unwrap() = version;
    }

    /// Advance the major version, simulating a membership change.
    pub fn advance(&self) -> TopologyVersion {
        let mut current = self.current.lock().unwrap();
        current.major += 1;
        *current
    }

    /// Drop `partition` from `node`'s assignment immediately.
    pub fn revoke(&self, node: NodeId, partition: PartitionId) {
        self.revoked.insert((node, partition), ());
    }

    /// Keep the assignment for the next `checks` ownership checks, then
    /// drop it.
    pub fn revoke_after_checks(&self, node: NodeId, partition: PartitionId, checks: i64) {
        self.revoke_countdown
            .insert((node, partition), AtomicI64::new(checks));
    }
}

impl AffinityOracle for MockAffinity {
    fn current_topology_version(&self) -> TopologyVersion {
        *self.current.lock().unwrap()
    }

    fn belongs(
        &self,
        node: NodeId,
        partition: PartitionId,
        _topology_version: TopologyVersion,
    ) -> bool {
        if self.revoked.contains_key(&(node, partition)) {
            return false;
        }
        if let Some(countdown) = self.revoke_countdown.get(&(node, partition)) {
            return countdown.fetch_sub(1, Ordering::SeqCst) > 0;
        }
        true
    }
}

// ============================================================================
// Partitions
// ============================================================================

/// One in-memory partition with a reservation counter.
pub struct MockPartition {
    id: PartitionId,
    state: Mutex<PartitionState>,
    entries: Mutex<Vec<EntryInfo>>,
    reservations: AtomicUsize,
    refuse_reservations: AtomicBool,
}

impl MockPartition {
    pub fn new(id: PartitionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(PartitionState::Owning),
            entries: Mutex::new(Vec::new()),
            reservations: AtomicUsize::new(0),
            refuse_reservations: AtomicBool::new(false),
        })
    }

    pub fn with_entries(id: PartitionId, entries: Vec<EntryInfo>) -> Arc<Self> {
        let partition = Self::new(id);
        *partition.entries.lock().unwrap() = entries;
        partition
    }

    pub fn push_entry(&self, entry: EntryInfo) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn set_state(&self, state: PartitionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Make every future reservation attempt fail.
    pub fn refuse_reservations(&self) {
        self.refuse_reservations.store(true, Ordering::SeqCst);
    }

    /// Reservations currently held.
    pub fn live_reservations(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }
}

impl LocalPartition for MockPartition {
    fn id(&self) -> PartitionId {
        self.id
    }

    fn state(&self) -> PartitionState {
        *self.state.lock().unwrap()
    }

    fn reserve(&self) -> bool {
        if self.refuse_reservations.load(Ordering::SeqCst) {
            return false;
        }
        self.reservations.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn release(&self) {
        self.reservations.fetch_sub(1, Ordering::SeqCst);
    }

    fn entries(&self) -> Box<dyn Iterator<Item = EntryInfo> + Send> {
        let snapshot = self.entries.lock().unwrap().clone();
        Box::new(snapshot.into_iter())
    }
}

/// Partition registry backing [`PartitionTopology`].
#[derive(Default)]
pub struct MockTopology {
    partitions: DashMap<PartitionId, Arc<MockPartition>>,
}

impl MockTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_partition(&self, partition: Arc<MockPartition>) {
        self.partitions.insert(partition.id, partition);
    }

    pub fn partition(&self, id: PartitionId) -> Option<Arc<MockPartition>> {
        self.partitions.get(&id).map(|p| Arc::clone(&p))
    }

    /// Sum of reservations across all partitions.
    pub fn total_live_reservations(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.live_reservations())
            .sum()
    }
}

impl PartitionTopology for MockTopology {
    fn local_partition(
        &self,
        partition: PartitionId,
        _topology_version: TopologyVersion,
    ) -> Option<Arc<dyn LocalPartition>> {
        self.partitions
            .get(&partition)
            .map(|p| Arc::clone(&p) as Arc<dyn LocalPartition>)
    }
}

// ============================================================================
// Overflow tier
// ============================================================================

type ListenerRegistry = Mutex<HashMap<PartitionId, Vec<Arc<dyn OverflowListener>>>>;

/// In-memory overflow tier with listener channels and promotion support.
pub struct MockOverflowStore {
    enabled: AtomicBool,
    spaces: DashMap<PartitionId, Vec<OverflowEntry>>,
    overflow_listeners: ListenerRegistry,
    promotion_listeners: ListenerRegistry,
    open_scans: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockOverflowStore {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            spaces: DashMap::new(),
            overflow_listeners: Mutex::new(HashMap::new()),
            promotion_listeners: Mutex::new(HashMap::new()),
            open_scans: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn put_overflow(&self, partition: PartitionId, entry: OverflowEntry) {
        self.spaces.entry(partition).or_default().push(entry);
    }

    /// Promote the entry with `key` out of overflow: remove it from the
    /// space and report it on the partition's promotion channel, the way the
    /// real tier does when an access pulls an entry back into memory.
    pub fn promote(&self, partition: PartitionId, key: &[u8]) -> bool {
        let promoted = match self.spaces.get_mut(&partition) {
            Some(mut space) => {
                match space.iter().position(|e| e.key.as_ref() == key) {
                    Some(index) => Some(space.remove(index)),
                    None => None,
                }
            }
            None => None,
        };

        match promoted {
            Some(entry) => {
                let info = entry.into_info();
                let listeners = self
                    .promotion_listeners
                    .lock()
                    .unwrap()
                    .get(&partition)
                    .cloned()
                    .unwrap_or_default();
                for listener in listeners {
                    listener.on_entry(info.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Listeners currently registered for `partition` across both channels.
    pub fn listener_count(&self, partition: PartitionId) -> usize {
        let count = |registry: &ListenerRegistry| {
            registry
                .lock()
                .unwrap()
                .get(&partition)
                .map(|l| l.len())
                .unwrap_or(0)
        };
        count(&self.overflow_listeners) + count(&self.promotion_listeners)
    }

    /// Scans opened and not yet closed.
    pub fn open_scan_count(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }

    /// Total scans closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn add_to(registry: &ListenerRegistry, partition: PartitionId, listener: Arc<dyn OverflowListener>) {
        registry
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .push(listener);
    }

    fn remove_from(
        registry: &ListenerRegistry,
        partition: PartitionId,
        listener: &Arc<dyn OverflowListener>,
    ) {
        let mut map = registry.lock().unwrap();
        if let Some(listeners) = map.get_mut(&partition) {
            listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        }
    }
}

impl OverflowStore for MockOverflowStore {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn iterator(
        &self,
        partition: PartitionId,
    ) -> SupplyResult<Option<Box<dyn CloseableIterator<OverflowEntry>>>> {
        let snapshot = match self.spaces.get(&partition) {
            Some(space) => space.clone(),
            None => return Ok(None),
        };
        self.open_scans.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(MockOverflowScan {
            entries: snapshot.into(),
            closed: false,
            open_scans: Arc::clone(&self.open_scans),
            closes: Arc::clone(&self.closes),
        })))
    }

    fn add_overflow_listener(&self, partition: PartitionId, listener: Arc<dyn OverflowListener>) {
        Self::add_to(&self.overflow_listeners, partition, listener);
    }

    fn remove_overflow_listener(
        &self,
        partition: PartitionId,
        listener: &Arc<dyn OverflowListener>,
    ) {
        Self::remove_from(&self.overflow_listeners, partition, listener);
    }

    fn add_promotion_listener(&self, partition: PartitionId, listener: Arc<dyn OverflowListener>) {
        Self::add_to(&self.promotion_listeners, partition, listener);
    }

    fn remove_promotion_listener(
        &self,
        partition: PartitionId,
        listener: &Arc<dyn OverflowListener>,
    ) {
        Self::remove_from(&self.promotion_listeners, partition, listener);
    }
}

struct MockOverflowScan {
    entries: VecDeque<OverflowEntry>,
    closed: bool,
    open_scans: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Iterator for MockOverflowScan {
    type Item = OverflowEntry;

    fn next(&mut self) -> Option<OverflowEntry> {
        if self.closed {
            return None;
        }
        self.entries.pop_front()
    }
}

impl CloseableIterator<OverflowEntry> for MockOverflowScan {
    fn close(&mut self) -> SupplyResult<()> {
        if !self.closed {
            self.closed = true;
            self.open_scans.fetch_sub(1, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One delivered supply batch.
pub struct SentBatch {
    pub node: NodeId,
    pub topic: ReplyTopic,
    pub message: SupplyMessage,
}

/// Recording message bus with scriptable recipient departure.
#[derive(Default)]
pub struct MockBus {
    delivered: Mutex<Vec<SentBatch>>,
    gone: DashMap<NodeId, ()>,
    attempts: AtomicU64,
    gone_from_attempt: AtomicU64,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report this node as departed on every future send.
    pub fn mark_gone(&self, node: NodeId) {
        self.gone.insert(node, ());
    }

    /// Report the recipient gone starting with send attempt `attempt`
    /// (1-based).
    pub fn gone_from_attempt(&self, attempt: u64) {
        self.gone_from_attempt.store(attempt, Ordering::SeqCst);
    }

    /// Total send attempts, delivered or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages actually delivered, in send order.
    pub fn delivered(&self) -> Vec<SupplyMessage> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.message.clone())
            .collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn send_ordered(
        &self,
        node: NodeId,
        topic: &ReplyTopic,
        message: SupplyMessage,
        _policy: IoPolicy,
        _timeout: Duration,
    ) -> SupplyResult<SendOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let gone_from = self.gone_from_attempt.load(Ordering::SeqCst);
        if self.gone.contains_key(&node) || (gone_from > 0 && attempt >= gone_from) {
            return Ok(SendOutcome::RecipientGone);
        }
        let batch = SentBatch {
            node,
            topic: topic.clone(),
            message,
        };
        self.delivered.lock().unwrap().push(batch);
        Ok(SendOutcome::Delivered)
    }
}

// ============================================================================
// Membership
// ============================================================================

/// Broadcast-backed membership event source.
pub struct MockMembership {
    sender: broadcast::Sender<MembershipEvent>,
}

impl Default for MockMembership {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }
}

impl MockMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a membership event to all subscribers. Returns how many
    /// subscribers saw it.
    pub fn emit(&self, kind: MembershipEventKind, node: NodeId) -> usize {
        self.sender
            .send(MembershipEvent { kind, node })
            .unwrap_or(0)
    }
}

impl ClusterMembership for MockMembership {
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.sender.subscribe()
    }
}

// ============================================================================
// Deployments
// ============================================================================

/// Static loader-to-deployment mapping.
#[derive(Default)]
pub struct MockDeployments {
    deployments: DashMap<LoaderId, DeploymentInfo>,
}

impl MockDeployments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, loader: LoaderId, user_version: impl Into<String>) {
        self.deployments.insert(
            loader,
            DeploymentInfo {
                loader,
                user_version: user_version.into(),
            },
        );
    }
}

impl DeploymentRegistry for MockDeployments {
    fn deployment_for(&self, loader: LoaderId) -> Option<DeploymentInfo> {
        self.deployments.get(&loader).map(|d| d.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_revoke_after_checks() {
        let node = NodeId::new_v4();
        let affinity = MockAffinity::new(TopologyVersion::new(1, 0));
        affinity.revoke_after_checks(node, 7, 2);

        let version = TopologyVersion::new(1, 0);
        assert!(affinity.belongs(node, 7, version));
        assert!(affinity.belongs(node, 7, version));
        assert!(!affinity.belongs(node, 7, version));
        assert!(!affinity.belongs(node, 7, version));
    }

    #[test]
    fn test_partition_reservation_counting() {
        let partition = MockPartition::new(3);
        assert!(partition.reserve());
        assert!(partition.reserve());
        assert_eq!(partition.live_reservations(), 2);
        partition.release();
        assert_eq!(partition.live_reservations(), 1);

        partition.refuse_reservations();
        assert!(!partition.reserve());
        assert_eq!(partition.live_reservations(), 1);
    }

    #[test]
    fn test_overflow_promote_notifies_and_removes() {
        use crate::supply::promotion::PromotionBuffer;

        let store = MockOverflowStore::new(true);
        store.put_overflow(9, overflow_entry(&b"a"[..], &b"1"[..], 1));
        store.put_overflow(9, overflow_entry(&b"b"[..], &b"2"[..], 2));

        let buffer = Arc::new(PromotionBuffer::new(9));
        let listener: Arc<dyn OverflowListener> = buffer.clone();
        store.add_promotion_listener(9, listener.clone());

        assert!(store.promote(9, b"a"));
        assert!(!store.promote(9, b"a"));
        assert_eq!(buffer.len(), 1);

        // The promoted entry is gone from the overflow space.
        let remaining: Vec<_> = store
            .iterator(9)
            .expect("iterator")
            .expect("space exists")
            .collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key.as_ref(), b"b");

        store.remove_promotion_listener(9, &listener);
        assert_eq!(store.listener_count(9), 0);
        // Removing again is a no-op.
        store.remove_promotion_listener(9, &listener);
    }

    #[test]
    fn test_overflow_scan_close_is_idempotent() {
        let store = MockOverflowStore::new(true);
        store.put_overflow(4, overflow_entry(&b"k"[..], &b"v"[..], 1));

        let mut scan = store.iterator(4).expect("iterator").expect("space exists");
        assert_eq!(store.open_scan_count(), 1);

        scan.close().expect("close");
        scan.close().expect("second close");
        assert_eq!(store.open_scan_count(), 0);
        assert_eq!(store.close_count(), 1);
        assert!(scan.next().is_none());
    }

    #[tokio::test]
    async fn test_bus_gone_from_attempt() {
        let bus = MockBus::new();
        bus.gone_from_attempt(2);
        let node = NodeId::new_v4();
        let topic = ReplyTopic::new("t");
        let message = SupplyMessage::new(0, 0, 0, TopologyVersion::ZERO);

        let first = bus
            .send_ordered(node, &topic, message.clone(), IoPolicy::Rebalance, Duration::ZERO)
            .await
            .expect("send");
        let second = bus
            .send_ordered(node, &topic, message, IoPolicy::Rebalance, Duration::ZERO)
            .await
            .expect("send");

        assert_eq!(first, SendOutcome::Delivered);
        assert_eq!(second, SendOutcome::RecipientGone);
        assert_eq!(bus.delivered_count(), 1);
        assert_eq!(bus.attempts(), 2);
    }
}
