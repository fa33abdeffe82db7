//! Side-channel capture of entries promoted during a supply scan.
//!
//! The memory and overflow scans read two snapshots that can race with live
//! mutation: an entry that moves from overflow into memory *after* the
//! memory scan passed its slot but *before* the overflow scan reaches its
//! old slot would vanish from both. A [`PromotionBuffer`] registered on the
//! partition's overflow channels for the duration of the memory scan
//! captures every such movement; the promotion drain replays the buffer
//! after the listener is deregistered, so every entry alive during the
//! supply window ships at least once.

use std::sync::{Mutex, PoisonError};

use tracing::trace;

use super::traits::OverflowListener;
use crate::types::{EntryInfo, PartitionId};

/// Append-only buffer of entries the overflow tier reported while
/// registered. Read exactly once, after deregistration.
pub struct PromotionBuffer {
    partition: PartitionId,
    entries: Mutex<Vec<EntryInfo>>,
}

impl PromotionBuffer {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Number of entries captured so far.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the buffered entries in capture order.
    ///
    /// Call only after the buffer has been deregistered from the overflow
    /// channels; entries reported after draining would be lost.
    pub fn drain(&self) -> Vec<EntryInfo> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *entries)
    }
}

impl OverflowListener for PromotionBuffer {
    fn on_entry(&self, entry: EntryInfo) {
        trace!(
            partition = self.partition,
            key_len = entry.key.len(),
            "captured promoted entry"
        );
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(key: &'static [u8]) -> EntryInfo {
        EntryInfo {
            key: Bytes::from_static(key),
            value: Bytes::from_static(b"v"),
            version: 1,
            ttl_millis: 0,
            expire_time_millis: 0,
            is_new: false,
        }
    }

    #[test]
    fn test_capture_order_preserved() {
        let buffer = PromotionBuffer::new(9);
        buffer.on_entry(entry(b"a"));
        buffer.on_entry(entry(b"b"));
        buffer.on_entry(entry(b"c"));

        let drained = buffer.drain();
        let keys: Vec<&[u8]> = drained.iter().map(|e| e.key.as_ref()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let buffer = PromotionBuffer::new(9);
        buffer.on_entry(entry(b"a"));
        assert_eq!(buffer.len(), 1);

        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_concurrent_capture() {
        use std::sync::Arc;

        let buffer = Arc::new(PromotionBuffer::new(3));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let buf = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    buf.on_entry(entry(b"k"));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("capture thread panicked");
        }
        assert_eq!(buffer.len(), 400);
    }
}
