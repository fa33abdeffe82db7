//! Type-safe wrappers for supply protocol primitives.
//!
//! These newtypes keep the various integers that travel with a demand from
//! being mixed up, and define the transferable entry shapes shared by the
//! collaborator traits and the wire messages.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Unique identifier of a cluster node.
pub type NodeId = uuid::Uuid;

/// Numeric identifier of a partition (a shard of the keyspace).
pub type PartitionId = u32;

/// Index of a demander-side rebalance worker, in `[0, worker_slots)`.
pub type WorkerSlot = usize;

/// Monotonic sequence number a demander stamps on each demand.
pub type UpdateSequence = u64;

/// Identifier of the keyspace (cache) a supplier serves.
pub type CacheId = u32;

/// A totally ordered tag denoting one cluster view.
///
/// Every demand and every reply carries one. Two values are equal iff they
/// denote the same membership and assignment; the supplier only ever checks
/// equality, but ordering is derived for callers that track history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TopologyVersion {
    /// Major version, advanced on membership changes.
    pub major: u64,
    /// Minor version, advanced on assignment-only changes.
    pub minor: u64,
}

impl TopologyVersion {
    /// Create a topology version from its parts.
    #[inline]
    pub const fn new(major: u64, minor: u64) -> Self {
        TopologyVersion { major, minor }
    }

    /// The version before any cluster event.
    pub const ZERO: Self = TopologyVersion { major: 0, minor: 0 };
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identifier of the code module (loader) an overflow entry was written by.
///
/// Purely metadata: the supplier resolves it through the deployment registry
/// to attach deployment info to a batch exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoaderId(pub u64);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader-{}", self.0)
    }
}

/// Topic a demander listens on for its supply batches.
///
/// Uses `Arc<str>` so cloning a demand does not copy the topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyTopic(Arc<str>);

impl ReplyTopic {
    pub fn new(name: impl AsRef<str>) -> Self {
        ReplyTopic(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ReplyTopic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ReplyTopic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ReplyTopic::new(s))
    }
}

/// Delivery class for outbound bus messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IoPolicy {
    /// Dedicated rebalance lane, isolated from foreground traffic.
    #[default]
    Rebalance,
    /// Shared system lane.
    System,
}

/// The transferable unit: one committed key/value pair with its metadata.
///
/// `version` establishes a per-key total order the demander uses for
/// conflict resolution. Entries flagged `is_new` have never been committed
/// and are never shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub key: Bytes,
    pub value: Bytes,
    pub version: u64,
    pub ttl_millis: u64,
    pub expire_time_millis: u64,
    pub is_new: bool,
}

impl EntryInfo {
    /// Conservative upper bound on this entry's serialized size.
    pub fn estimated_size(&self) -> usize {
        self.key.len() + self.value.len() + crate::constants::ENTRY_OVERHEAD_BYTES
    }
}

/// An entry as stored in the overflow tier.
///
/// Same payload as [`EntryInfo`] plus optional loader ids used to attach
/// deployment information to the batch that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub version: u64,
    pub ttl_millis: u64,
    pub expire_time_millis: u64,
    pub key_loader: Option<LoaderId>,
    pub value_loader: Option<LoaderId>,
}

impl OverflowEntry {
    /// The loader id to resolve deployment info through, if any.
    /// Key loader wins over value loader.
    pub fn loader(&self) -> Option<LoaderId> {
        self.key_loader.or(self.value_loader)
    }

    /// Convert into the transferable entry shape. Overflow entries are always
    /// committed, so the result is never `is_new`.
    pub fn into_info(self) -> EntryInfo {
        EntryInfo {
            key: self.key,
            value: self.value,
            version: self.version,
            ttl_millis: self.ttl_millis,
            expire_time_millis: self.expire_time_millis,
            is_new: false,
        }
    }
}

/// Deployment metadata attached to a supply batch at most once.
///
/// The demander uses it to resolve the code module that produced the
/// overflow entries in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Loader the metadata was resolved from.
    pub loader: LoaderId,
    /// Version tag of the deployed module.
    pub user_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_version_ordering() {
        let a = TopologyVersion::new(1, 0);
        let b = TopologyVersion::new(1, 1);
        let c = TopologyVersion::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, TopologyVersion::new(1, 0));
    }

    #[test]
    fn test_topology_version_display() {
        assert_eq!(TopologyVersion::new(3, 7).to_string(), "3.7");
    }

    #[test]
    fn test_reply_topic_cheap_clone() {
        let topic = ReplyTopic::new("rebalance/42");
        let clone = topic.clone();
        assert_eq!(topic, clone);
        assert_eq!(clone.as_str(), "rebalance/42");
    }

    #[test]
    fn test_overflow_loader_precedence() {
        let entry = OverflowEntry {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            version: 1,
            ttl_millis: 0,
            expire_time_millis: 0,
            key_loader: Some(LoaderId(1)),
            value_loader: Some(LoaderId(2)),
        };
        assert_eq!(entry.loader(), Some(LoaderId(1)));

        let entry = OverflowEntry {
            key_loader: None,
            ..entry
        };
        assert_eq!(entry.loader(), Some(LoaderId(2)));
    }

    #[test]
    fn test_overflow_into_info_never_new() {
        let entry = OverflowEntry {
            key: Bytes::from_static(b"key"),
            value: Bytes::from_static(b"value"),
            version: 9,
            ttl_millis: 100,
            expire_time_millis: 200,
            key_loader: None,
            value_loader: None,
        };
        let info = entry.into_info();
        assert!(!info.is_new);
        assert_eq!(info.version, 9);
        assert_eq!(info.ttl_millis, 100);
    }

    #[test]
    fn test_entry_estimated_size_exceeds_payload() {
        let info = EntryInfo {
            key: Bytes::from_static(b"0123456789"),
            value: Bytes::from_static(b"abcdef"),
            version: 1,
            ttl_millis: 0,
            expire_time_millis: 0,
            is_new: false,
        };
        assert!(info.estimated_size() > 16);
    }
}
