//! Resume state for in-flight demands.
//!
//! A [`SupplyContext`] is everything needed to pick a partition stream back
//! up where the previous turn left it: the remaining partition list, the
//! current partition's reservation, the mid-stream entry cursor, and the
//! promotion listener if one is still registered. Contexts are keyed by
//! `(demander, worker_slot)` and stored in a concurrent map with a de facto
//! single writer per key: the demander sends at most one outstanding demand
//! per slot, so the handler never locks individual contexts.
//!
//! The context is the sole owner of its cursor, listener, and reservation;
//! the stores hold only listener registry back-references, which eviction
//! clears. Evicting an absent or already-evicted key is a no-op.

use std::iter::Peekable;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tracing::{debug, error};

use super::metrics;
use super::promotion::PromotionBuffer;
use super::traits::{CloseableIterator, LocalPartition, OverflowListener, OverflowStore};
use crate::types::{EntryInfo, NodeId, OverflowEntry, PartitionId, TopologyVersion, WorkerSlot};

/// Key of one in-flight demand stream.
pub type SupplyKey = (NodeId, WorkerSlot);

/// Mid-stream cursor over the in-memory tier.
pub type MemoryCursor = Peekable<Box<dyn Iterator<Item = EntryInfo> + Send>>;

/// Mid-stream cursor over the promotion buffer drain.
pub type PromotionCursor = Peekable<std::vec::IntoIter<EntryInfo>>;

/// Peekable adapter over an overflow scan that keeps the underlying cursor
/// closeable. A peeked entry is held back and re-yielded by `next`, so
/// suspending between peek and consume loses nothing.
pub struct OverflowCursor {
    inner: Box<dyn CloseableIterator<OverflowEntry>>,
    head: Option<OverflowEntry>,
}

impl OverflowCursor {
    pub fn new(inner: Box<dyn CloseableIterator<OverflowEntry>>) -> Self {
        Self { inner, head: None }
    }

    /// Whether another entry is available without consuming it.
    pub fn has_next(&mut self) -> bool {
        if self.head.is_none() {
            self.head = self.inner.next();
        }
        self.head.is_some()
    }

    /// Close the underlying scan, discarding any held-back entry.
    pub fn close(&mut self) -> crate::supply::SupplyResult<()> {
        self.head = None;
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Iterator for OverflowCursor {
    type Item = OverflowEntry;

    fn next(&mut self) -> Option<OverflowEntry> {
        self.head.take().or_else(|| self.inner.next())
    }
}

impl Drop for OverflowCursor {
    fn drop(&mut self) {
        // Backstop for abnormal exits; explicit close paths log failures.
        let _ = self.close();
    }
}

/// Where a suspended stream is inside its current partition.
///
/// The variant names the phase: memory scan, then overflow scan, then
/// promotion drain. Within one partition the cursor only ever advances in
/// that order.
pub enum EntryCursor {
    /// Mid memory scan. The promotion listener is still registered.
    InMemory(MemoryCursor),
    /// Mid overflow scan. The promotion listener is still registered.
    Overflow(OverflowCursor),
    /// Mid promotion drain. The listener has been deregistered and its
    /// buffer snapshot is being replayed.
    Promotion(PromotionCursor),
}

impl EntryCursor {
    /// Short label for logs.
    pub fn phase_name(&self) -> &'static str {
        match self {
            EntryCursor::InMemory(_) => "memory",
            EntryCursor::Overflow(_) => "overflow",
            EntryCursor::Promotion(_) => "promotion",
        }
    }
}

/// Resume state for one `(demander, worker_slot)` stream.
///
/// Owns one reservation on `partition` for as long as it exists; eviction
/// releases it. If `listener` is set, it is registered on both overflow
/// channels of `partition` and travels with the context until the promotion
/// drain (or eviction) deregisters it.
pub struct SupplyContext {
    /// Partitions not yet started.
    pub(crate) partition_iter: std::vec::IntoIter<PartitionId>,
    /// Partition the stream is suspended inside.
    pub(crate) partition: PartitionId,
    /// Reserved handle for `partition`.
    pub(crate) reservation: Arc<dyn LocalPartition>,
    /// Where inside `partition` the stream stopped.
    pub(crate) cursor: EntryCursor,
    /// Promotion listener, if still registered.
    pub(crate) listener: Option<Arc<PromotionBuffer>>,
    /// Cluster view of the demand that created this context. A demand with
    /// a different version evicts the context before processing.
    pub(crate) topology_version: TopologyVersion,
}

impl SupplyContext {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn topology_version(&self) -> TopologyVersion {
        self.topology_version
    }

    /// Phase label of the suspended cursor, for logs and tests.
    pub fn phase_name(&self) -> &'static str {
        self.cursor.phase_name()
    }
}

/// Concurrent store of supply contexts with resource-owning eviction.
///
/// Values are mutex-wrapped only to make the map shareable across threads;
/// every access takes or inserts a whole context, and each key has a single
/// writer at any instant.
pub struct SupplyContextStore {
    contexts: DashMap<SupplyKey, Mutex<SupplyContext>>,
    overflow: Arc<dyn OverflowStore>,
}

impl SupplyContextStore {
    pub fn new(overflow: Arc<dyn OverflowStore>) -> Self {
        Self {
            contexts: DashMap::new(),
            overflow,
        }
    }

    /// Claim the context for `key`, transferring ownership of its resources
    /// to the caller. The caller either completes the stream or stores a
    /// successor context.
    pub fn take(&self, key: SupplyKey) -> Option<SupplyContext> {
        let ctx = self
            .contexts
            .remove(&key)
            .map(|(_, cell)| cell.into_inner().unwrap_or_else(PoisonError::into_inner));
        if ctx.is_some() {
            metrics::CONTEXTS_ACTIVE.dec();
        }
        ctx
    }

    /// Store a suspended context. A context displaced at the same key is
    /// disposed: iterator closed, listener deregistered, reservation
    /// released.
    pub fn put(&self, key: SupplyKey, ctx: SupplyContext) {
        metrics::CONTEXTS_ACTIVE.inc();
        if let Some(displaced) = self.contexts.insert(key, Mutex::new(ctx)) {
            metrics::CONTEXTS_ACTIVE.dec();
            self.dispose(displaced.into_inner().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// Remove and dispose the context at `key`, if any. Safe to call any
    /// number of times; returns whether a context was actually evicted.
    pub fn evict(&self, key: SupplyKey) -> bool {
        match self.contexts.remove(&key) {
            Some((_, cell)) => {
                let ctx = cell.into_inner().unwrap_or_else(PoisonError::into_inner);
                metrics::CONTEXTS_ACTIVE.dec();
                metrics::CONTEXTS_EVICTED.inc();
                debug!(
                    demander = %key.0,
                    worker_slot = key.1,
                    partition = ctx.partition,
                    phase = ctx.phase_name(),
                    "evicted supply context"
                );
                self.dispose(ctx);
                true
            }
            None => false,
        }
    }

    /// Evict every stored context. Used on supplier shutdown.
    pub fn evict_all(&self) {
        let keys: Vec<SupplyKey> = self.contexts.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.evict(key);
        }
    }

    /// Whether a context is stored for `key`.
    pub fn contains(&self, key: SupplyKey) -> bool {
        self.contexts.contains_key(&key)
    }

    /// Phase label of the stored context at `key`, if any.
    pub fn phase_of(&self, key: SupplyKey) -> Option<&'static str> {
        self.contexts.get(&key).map(|cell| {
            cell.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .phase_name()
        })
    }

    /// Number of in-flight contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Release everything a context owns: close a closeable cursor,
    /// deregister a still-registered listener, drop the reservation.
    pub(crate) fn dispose(&self, ctx: SupplyContext) {
        let SupplyContext {
            partition,
            reservation,
            cursor,
            listener,
            ..
        } = ctx;

        if let EntryCursor::Overflow(mut scan) = cursor {
            if let Err(e) = scan.close() {
                error!(partition, error = %e, "failed to close overflow scan during eviction");
            }
        }

        if let Some(buffer) = listener {
            let listener: Arc<dyn OverflowListener> = buffer;
            self.overflow.remove_overflow_listener(partition, &listener);
            self.overflow.remove_promotion_listener(partition, &listener);
        }

        reservation.release();
    }
}
