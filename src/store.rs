//! Value model and keyspace: typed entries in a hash map, plus the TTL
//! min-heap.
//!
//! The heap and the map form a bidirectional index. A heap item carries the
//! owning entry's key; the entry carries its heap position. Every sift that
//! moves an item re-points the owner, so for each position `i` it holds
//! that `map[heap[i].key].heap_idx == Some(i)`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::zset::ZSet;

/// Entries holding a container above this many members are dropped on the
/// worker pool instead of the event-loop thread.
pub const K_LARGE_CONTAINER_SIZE: usize = 1000;

#[derive(Debug)]
pub enum Value {
    Str(Vec<u8>),
    ZSet(ZSet),
}

#[derive(Debug)]
pub struct Entry {
    pub key: Arc<[u8]>,
    pub value: Value,
    heap_idx: Option<usize>,
}

impl Entry {
    /// Whether destruction should be off-loaded to the worker pool.
    pub fn is_large(&self) -> bool {
        match &self.value {
            Value::ZSet(z) => z.len() > K_LARGE_CONTAINER_SIZE,
            Value::Str(_) => false,
        }
    }
}

#[derive(Debug)]
struct TtlItem {
    expire_at_ms: u64,
    key: Arc<[u8]>,
}

/// Remaining-TTL answer for a live key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    None,
    ExpiresIn(u64),
}

#[derive(Debug, Default)]
pub struct Store {
    map: HashMap<Arc<[u8]>, Entry>,
    heap: Vec<TtlItem>,
}

type Map = HashMap<Arc<[u8]>, Entry>;

fn set_owner_idx(map: &mut Map, key: &[u8], idx: Option<usize>) {
    if let Some(ent) = map.get_mut(key) {
        ent.heap_idx = idx;
    }
}

fn heap_swap(heap: &mut Vec<TtlItem>, map: &mut Map, i: usize, j: usize) {
    heap.swap(i, j);
    let ki = heap[i].key.clone();
    let kj = heap[j].key.clone();
    set_owner_idx(map, &ki, Some(i));
    set_owner_idx(map, &kj, Some(j));
}

fn heap_up(heap: &mut Vec<TtlItem>, map: &mut Map, mut pos: usize) {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if heap[parent].expire_at_ms <= heap[pos].expire_at_ms {
            break;
        }
        heap_swap(heap, map, parent, pos);
        pos = parent;
    }
}

fn heap_down(heap: &mut Vec<TtlItem>, map: &mut Map, mut pos: usize) {
    loop {
        let (left, right) = (pos * 2 + 1, pos * 2 + 2);
        let mut least = pos;
        if left < heap.len() && heap[left].expire_at_ms < heap[least].expire_at_ms {
            least = left;
        }
        if right < heap.len() && heap[right].expire_at_ms < heap[least].expire_at_ms {
            least = right;
        }
        if least == pos {
            break;
        }
        heap_swap(heap, map, least, pos);
        pos = least;
    }
}

fn heap_update(heap: &mut Vec<TtlItem>, map: &mut Map, pos: usize) {
    if pos > 0 && heap[(pos - 1) / 2].expire_at_ms > heap[pos].expire_at_ms {
        heap_up(heap, map, pos);
    } else {
        heap_down(heap, map, pos);
    }
}

/// Detach the item at `pos`, clearing its owner's back-link and re-sifting
/// whatever item was swapped into its place.
fn heap_remove(heap: &mut Vec<TtlItem>, map: &mut Map, pos: usize) {
    let owner = heap[pos].key.clone();
    set_owner_idx(map, &owner, None);
    let last = heap.len() - 1;
    heap.swap(pos, last);
    heap.pop();
    if pos < heap.len() {
        let moved = heap[pos].key.clone();
        set_owner_idx(map, &moved, Some(pos));
        heap_update(heap, map, pos);
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        self.map.get_mut(key)
    }

    /// Create a fresh entry. The key must not already be present.
    pub fn insert(&mut self, key: &[u8], value: Value) -> &mut Entry {
        let key: Arc<[u8]> = Arc::from(key);
        let entry = Entry {
            key: key.clone(),
            value,
            heap_idx: None,
        };
        debug_assert!(!self.map.contains_key(&key));
        self.map.entry(key).or_insert(entry)
    }

    /// Look up an entry, creating it with `default` when absent.
    pub fn get_or_insert_with(
        &mut self,
        key: &[u8],
        default: impl FnOnce() -> Value,
    ) -> &mut Entry {
        let key: Arc<[u8]> = Arc::from(key);
        self.map.entry(key.clone()).or_insert_with(|| Entry {
            key,
            value: default(),
            heap_idx: None,
        })
    }

    /// Remove an entry, detaching its TTL heap item first. The caller owns
    /// the returned entry and decides how to dispose of it.
    pub fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        let mut entry = self.map.remove(key)?;
        if let Some(pos) = entry.heap_idx.take() {
            heap_remove(&mut self.heap, &mut self.map, pos);
        }
        Some(entry)
    }

    /// Set, update, or clear (negative `ttl_ms`) the TTL of a key.
    /// Returns false when the key does not exist.
    pub fn set_ttl(&mut self, key: &[u8], ttl_ms: i64, now_ms: u64) -> bool {
        let Some(entry) = self.map.get_mut(key) else {
            return false;
        };
        if ttl_ms < 0 {
            if let Some(pos) = entry.heap_idx {
                heap_remove(&mut self.heap, &mut self.map, pos);
            }
        } else {
            let expire_at_ms = now_ms + ttl_ms as u64;
            match entry.heap_idx {
                Some(pos) => {
                    self.heap[pos].expire_at_ms = expire_at_ms;
                    heap_update(&mut self.heap, &mut self.map, pos);
                }
                None => {
                    let key = entry.key.clone();
                    entry.heap_idx = Some(self.heap.len());
                    self.heap.push(TtlItem { expire_at_ms, key });
                    let last = self.heap.len() - 1;
                    heap_up(&mut self.heap, &mut self.map, last);
                }
            }
        }
        true
    }

    /// Remaining TTL of a live key, clamped to zero once the deadline has
    /// passed but not yet been collected. `None` means the key is missing.
    pub fn ttl(&self, key: &[u8], now_ms: u64) -> Option<Ttl> {
        let entry = self.map.get(key)?;
        Some(match entry.heap_idx {
            None => Ttl::None,
            Some(pos) => {
                let expire_at = self.heap[pos].expire_at_ms;
                Ttl::ExpiresIn(expire_at.saturating_sub(now_ms))
            }
        })
    }

    /// The nearest TTL deadline, if any key has one.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.first().map(|item| item.expire_at_ms)
    }

    /// Detach and return every entry whose deadline has passed, up to
    /// `max` of them; the remainder rolls over to the next tick.
    pub fn expire_due(&mut self, now_ms: u64, max: usize) -> Vec<Entry> {
        let mut out = Vec::new();
        while out.len() < max {
            let due = match self.heap.first() {
                Some(item) if item.expire_at_ms < now_ms => item.key.clone(),
                _ => break,
            };
            let mut entry = self
                .map
                .remove(due.as_ref())
                .expect("ttl heap references a live entry");
            debug_assert_eq!(entry.heap_idx, Some(0));
            entry.heap_idx = None;
            heap_remove(&mut self.heap, &mut self.map, 0);
            out.push(entry);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.map.values()
    }

    #[cfg(test)]
    fn assert_heap_invariant(&self) {
        for (i, item) in self.heap.iter().enumerate() {
            let entry = self.map.get(item.key.as_ref()).expect("owner is live");
            assert_eq!(entry.heap_idx, Some(i), "back-link of {:?}", item.key);
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].expire_at_ms <= item.expire_at_ms);
            }
        }
        for entry in self.map.values() {
            if let Some(pos) = entry.heap_idx {
                assert!(std::ptr::eq(
                    self.heap[pos].key.as_ref(),
                    entry.key.as_ref()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> Vec<u8> {
        format!("key-{i}").into_bytes()
    }

    #[test]
    fn insert_get_remove() {
        let mut store = Store::new();
        store.insert(b"k", Value::Str(b"v".to_vec()));
        assert!(matches!(
            store.get(b"k").map(|e| &e.value),
            Some(Value::Str(v)) if v == b"v"
        ));
        let entry = store.remove(b"k").unwrap();
        assert_eq!(entry.key.as_ref(), b"k");
        assert!(store.get(b"k").is_none());
        assert!(store.remove(b"k").is_none());
    }

    #[test]
    fn ttl_set_update_clear() {
        let mut store = Store::new();
        store.insert(b"k", Value::Str(vec![]));
        assert!(!store.set_ttl(b"missing", 100, 0));
        assert_eq!(store.ttl(b"missing", 0), None);

        assert!(store.set_ttl(b"k", 100, 0));
        assert_eq!(store.ttl(b"k", 40), Some(Ttl::ExpiresIn(60)));
        store.assert_heap_invariant();

        // update in place
        assert!(store.set_ttl(b"k", 500, 0));
        assert_eq!(store.ttl(b"k", 40), Some(Ttl::ExpiresIn(460)));
        assert_eq!(store.next_deadline(), Some(500));

        // clamped after the deadline
        assert_eq!(store.ttl(b"k", 600), Some(Ttl::ExpiresIn(0)));

        // negative clears
        assert!(store.set_ttl(b"k", -1, 0));
        assert_eq!(store.ttl(b"k", 0), Some(Ttl::None));
        assert_eq!(store.next_deadline(), None);
        store.assert_heap_invariant();
    }

    #[test]
    fn back_links_survive_heap_churn() {
        let mut store = Store::new();
        // deadlines chosen to force sifts in both directions
        for i in 0..32 {
            store.insert(&key(i), Value::Str(vec![]));
            store.set_ttl(&key(i), ((i * 37) % 19) as i64 + 1, 0);
            store.assert_heap_invariant();
        }
        for i in (0..32).step_by(3) {
            store.remove(&key(i));
            store.assert_heap_invariant();
        }
        for i in (1..32).step_by(3) {
            store.set_ttl(&key(i), 1000 - i as i64, 0);
            store.assert_heap_invariant();
        }
        for i in (2..32).step_by(3) {
            store.set_ttl(&key(i), -1, 0);
            store.assert_heap_invariant();
        }
    }

    #[test]
    fn expire_due_is_strict_and_bounded() {
        let mut store = Store::new();
        for i in 0..10 {
            store.insert(&key(i), Value::Str(vec![]));
            store.set_ttl(&key(i), i as i64, 0); // deadlines 0..9
        }
        // strictly-less comparison: deadline 5 is not yet due at now=5
        let expired = store.expire_due(5, 100);
        assert_eq!(expired.len(), 5);
        store.assert_heap_invariant();
        assert_eq!(store.len(), 5);

        // bounded batch
        let expired = store.expire_due(100, 2);
        assert_eq!(expired.len(), 2);
        assert_eq!(store.len(), 3);
        let expired = store.expire_due(100, 100);
        assert_eq!(expired.len(), 3);
        assert_eq!(store.next_deadline(), None);
    }

    #[test]
    fn large_entry_classification() {
        let mut store = Store::new();
        let mut z = crate::zset::ZSet::new();
        for i in 0..=K_LARGE_CONTAINER_SIZE {
            z.insert(format!("m{i}").as_bytes(), i as f64);
        }
        store.insert(b"big", Value::ZSet(z));
        assert!(store.get(b"big").unwrap().is_large());
        store.insert(b"s", Value::Str(b"x".to_vec()));
        assert!(!store.get(b"s").unwrap().is_large());
    }
}
