//! The shared response cache (C4): a fixed-capacity LRU keyed by normalized
//! URL, with single-flight `set()` semantics under concurrent misses.
//!
//! The map itself is a `HashMap<String, usize>` index over a slab of slots
//! threaded together as an intrusive doubly-linked list, so promote/evict are
//! O(1) without reshuffling a `Vec`. A single `Mutex<Inner>` guards the whole
//! structure; a fixed array of per-shard `Mutex<()>` gives single-flight
//! behavior on a specific key without serializing unrelated keys behind the
//! same lock, mirroring the two-lock protocol this proxy has always used.

pub mod normalize;
pub mod persist;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;

pub use normalize::normalize;

const KEY_LOCK_SHARDS: usize = 64;

/// A cached response, stored as the exact bytes streamed from upstream
/// (status line, headers, and body) so a hit can be replayed to the client
/// verbatim, with no re-encoding. Backed by `bytes::Bytes` so a cache hit
/// clones a refcounted view instead of copying the whole response on every
/// `get`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            inserted_at: Instant::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

struct Slot {
    key: String,
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// The linked-list + index, guarded as a single unit.
struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used, next to evict
    capacity: usize,
}

impl Inner {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("slot present");
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("slot present");
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn evict_one(&mut self) {
        let Some(tail) = self.tail else { return };
        self.detach(tail);
        let slot = self.slots[tail].take().expect("tail slot present");
        self.index.remove(&slot.key);
        self.free.push(tail);
    }

    fn insert_new(&mut self, key: String, entry: CacheEntry) {
        if self.index.len() >= self.capacity {
            self.evict_one();
        }
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(Slot {
                    key: key.clone(),
                    entry,
                    prev: None,
                    next: None,
                });
                idx
            }
            None => {
                self.slots.push(Some(Slot {
                    key: key.clone(),
                    entry,
                    prev: None,
                    next: None,
                }));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    /// Snapshot in recency order, most recently used first.
    fn snapshot(&self) -> Vec<(String, CacheEntry)> {
        let mut out = Vec::with_capacity(self.index.len());
        let mut cur = self.head;
        while let Some(idx) = cur {
            let slot = self.slots[idx].as_ref().expect("linked slot present");
            out.push((slot.key.clone(), slot.entry.clone()));
            cur = slot.next;
        }
        out
    }
}

fn shard_for(key: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % KEY_LOCK_SHARDS
}

/// The cache itself. `Cache` is `Send + Sync` and intended to live behind an
/// `Arc`, shared across every connection worker.
pub struct Cache {
    inner: Mutex<Inner>,
    key_locks: [Mutex<()>; KEY_LOCK_SHARDS],
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(capacity)),
            key_locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Returns a clone of the cached entry, promoting it to most-recently-used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let idx = *inner.index.get(key)?;
        inner.promote(idx);
        Some(inner.slots[idx].as_ref().expect("promoted slot present").entry.clone())
    }

    /// Inserts `entry` under `key` unless another writer already won the race
    /// for this key, in which case this call just promotes the existing
    /// entry. Holds the key's shard lock for the duration so concurrent
    /// `set()` calls on the SAME key serialize into a single winner; calls on
    /// different keys proceed independently.
    pub fn set(&self, key: String, entry: CacheEntry) {
        let shard = shard_for(&key);
        let _key_guard = self.key_locks[shard].lock().expect("key lock poisoned");
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if let Some(&idx) = inner.index.get(&key) {
            // Lost the race: somebody else already inserted while we were
            // fetching from upstream. Promote-only, never overwrite.
            inner.promote(idx);
            return;
        }
        inner.insert_new(key, entry);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        *inner = Inner::new(inner.capacity);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries most-recently-used first; used both for the control-surface
    /// cache listing and for snapshot persistence.
    pub fn snapshot(&self) -> Vec<(String, CacheEntry)> {
        self.inner.lock().expect("cache lock poisoned").snapshot()
    }

    /// Rebuilds the cache from a previously captured snapshot, inserting in
    /// the order given (first entry ends up most recently used).
    pub fn restore(&self, entries: Vec<(String, CacheEntry)>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        *inner = Inner::new(inner.capacity);
        for (key, entry) in entries.into_iter().rev() {
            inner.insert_new(key, entry);
        }
    }
}
