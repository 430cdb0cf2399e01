//! Deduplicated, capacity-bounded store of gossiped payloads.
//!
//! Membership is answered by a cheap-hash filter (buckets of 16 64-bit
//! fingerprints, most-recent first) backed by the exact in-memory index.
//! Eviction is FIFO by insertion label.

use std::collections::{BTreeMap, HashMap};

use conclave_primitives::prelude::*;
use parking_lot::Mutex;

pub const DEFAULT_PROPAGATE_STORE_SIZE: usize = 0x10000;
pub const DEFAULT_PROPAGATE_HASH_SIZE: usize = 0x100000;
const HASH_BUCKET_LOG: usize = 4;
const HASH_BUCKET_SIZE: usize = 1 << HASH_BUCKET_LOG;

/// Fixed-capacity fingerprint filter.  False positives are possible and
/// resolved against the exact index; false negatives only occur for
/// entries displaced from their bucket.
struct CheapHashFilter {
    buckets_mask: usize,
    data: Vec<u64>,
}

impl CheapHashFilter {
    fn new(size: usize) -> Self {
        assert!(size.is_power_of_two());
        Self {
            buckets_mask: size / HASH_BUCKET_SIZE - 1,
            data: vec![0; size],
        }
    }

    fn bucket_of(&self, hash: &Buf32) -> usize {
        (hash.cheap_hash_alt() as usize & self.buckets_mask) << HASH_BUCKET_LOG
    }

    fn fingerprint(hash: &Buf32) -> u64 {
        // Low bit set so an empty slot can never match.
        hash.cheap_hash() | 1
    }

    fn find(&self, hash: &Buf32) -> bool {
        let fp = Self::fingerprint(hash);
        let start = self.bucket_of(hash);
        self.data[start..start + HASH_BUCKET_SIZE]
            .iter()
            .any(|slot| *slot == fp)
    }

    /// Inserts the fingerprint at the bucket front, shifting the rest back
    /// until the fingerprint itself (already present) or the bucket end.
    fn insert(&mut self, hash: &Buf32) {
        let fp = Self::fingerprint(hash);
        let start = self.bucket_of(hash);
        let mut carry = fp;
        for slot in self.data[start..start + HASH_BUCKET_SIZE].iter_mut() {
            std::mem::swap(&mut carry, slot);
            if carry == fp {
                break;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PropagateMessage {
    pub bytes: Vec<u8>,
    pub label: u64,
    pub hash: Buf32,
}

impl PropagateMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = blake2b(&bytes);
        Self {
            bytes,
            label: 0,
            hash,
        }
    }
}

struct StoreInner {
    filter: CheapHashFilter,
    max_size: usize,
    first_label: u64,
    next_label: u64,
    by_hash: HashMap<Buf32, u64>,
    by_label: BTreeMap<u64, PropagateMessage>,
}

pub struct PropagateStore {
    inner: Mutex<StoreInner>,
}

impl Default for PropagateStore {
    fn default() -> Self {
        Self::new(DEFAULT_PROPAGATE_STORE_SIZE, DEFAULT_PROPAGATE_HASH_SIZE)
    }
}

impl PropagateStore {
    pub fn new(max_size: usize, hash_size: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                filter: CheapHashFilter::new(hash_size),
                max_size,
                first_label: 0,
                next_label: 0,
                by_hash: HashMap::new(),
                by_label: BTreeMap::new(),
            }),
        }
    }

    fn contains(inner: &StoreInner, hash: &Buf32) -> bool {
        inner.filter.find(hash) || inner.by_hash.contains_key(hash)
    }

    pub fn find(&self, msg: &PropagateMessage) -> bool {
        let inner = self.inner.lock();
        Self::contains(&inner, &msg.hash)
    }

    /// Inserts unless already present.  Returns whether the message is new
    /// (and should be propagated).
    pub fn insert(&self, mut msg: PropagateMessage) -> bool {
        let mut inner = self.inner.lock();
        if Self::contains(&inner, &msg.hash) {
            return false;
        }

        // FIFO eviction by label once at capacity.
        while inner.by_label.len() >= inner.max_size && inner.first_label < inner.next_label {
            let evict = inner.first_label;
            if let Some(old) = inner.by_label.remove(&evict) {
                inner.by_hash.remove(&old.hash);
            }
            inner.first_label += 1;
        }

        msg.label = inner.next_label;
        inner.next_label += 1;
        inner.filter.insert(&msg.hash);
        inner.by_hash.insert(msg.hash, msg.label);
        inner.by_label.insert(msg.label, msg);
        true
    }

    /// Returns the next stored message at or after `current_label`,
    /// advancing the cursor past it.
    pub fn get_next(&self, current_label: &mut u64) -> Option<PropagateMessage> {
        let inner = self.inner.lock();
        if *current_label < inner.first_label {
            *current_label = inner.first_label;
        }
        let (label, msg) = inner.by_label.range(*current_label..).next()?;
        *current_label = label + 1;
        Some(msg.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(tag: u8) -> PropagateMessage {
        PropagateMessage::new(vec![tag; 64])
    }

    #[test]
    fn test_insert_then_find() {
        let store = PropagateStore::default();
        let m = msg(1);
        assert!(!store.find(&m));
        assert!(store.insert(m.clone()));
        assert!(store.find(&m));
        // Second insert is a duplicate.
        assert!(!store.insert(m));
    }

    #[test]
    fn test_fifo_eviction_by_label() {
        let store = PropagateStore::new(4, 64);
        for tag in 0..6u8 {
            assert!(store.insert(msg(tag)));
        }
        assert_eq!(store.len(), 4);

        // Oldest labels were evicted; cursor skips to the survivors.
        let mut cursor = 0;
        let first = store.get_next(&mut cursor).unwrap();
        assert_eq!(first.label, 2);
        assert_eq!(first.bytes, vec![2; 64]);
    }

    #[test]
    fn test_cursor_iteration_in_label_order() {
        let store = PropagateStore::default();
        for tag in 0..5u8 {
            store.insert(msg(tag));
        }
        let mut cursor = 0;
        let mut seen = Vec::new();
        while let Some(m) = store.get_next(&mut cursor) {
            seen.push(m.label);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_filter_survives_bucket_pressure() {
        // Tiny filter: lots of displacement, exact index still answers.
        let store = PropagateStore::new(1024, 32);
        let msgs: Vec<_> = (0..200u8).map(msg).collect();
        for m in &msgs {
            store.insert(m.clone());
        }
        for m in &msgs {
            assert!(store.find(m));
        }
    }
}
