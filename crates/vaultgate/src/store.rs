use crate::bucket::{ConsumeResult, TokenBucket};
use crate::clock::{Clock, SystemClock};
use dashmap::DashMap;
use std::hash::{BuildHasher, RandomState};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Marks an empty recency shard and a missing list link.
const EMPTY: u64 = u64::MAX;
const NIL: usize = usize::MAX;

/// One client's bucket plus the handle of its recency node.
///
/// The mutex makes refill-then-consume a single step for every caller that
/// shares this entry.
#[derive(Debug)]
pub struct BucketEntry {
    bucket: Mutex<TokenBucket>,
    id: u64,
    shard: usize,
    slot: usize,
}

impl BucketEntry {
    pub fn try_consume(&self, n: NonZeroU32, now: Instant) -> ConsumeResult {
        self.lock().try_consume(n, now)
    }

    pub fn available_tokens(&self, now: Instant) -> u64 {
        self.lock().available_tokens(now)
    }

    // A panic mid-consume cannot leave the bucket half-updated.
    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Node {
    key: Arc<str>,
    id: u64,
    /// Last access, nanoseconds since the store's origin.
    stamp: u64,
    prev: usize,
    next: usize,
}

/// Doubly linked list over a slab, most recent access at the head.
///
/// Stamps never decrease from tail to head, so the tail is always the
/// least recently used node of the shard.
struct RecencyList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl RecencyList {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn get(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.nodes[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("linked slot {slot} is vacant"))
    }

    fn head_stamp(&self) -> u64 {
        self.get(self.head).map_or(0, |node| node.stamp)
    }

    fn tail(&self) -> Option<(usize, u64)> {
        self.get(self.tail).map(|node| (self.tail, node.stamp))
    }

    fn push_front(&mut self, key: Arc<str>, id: u64, stamp: u64) -> usize {
        let node = Node {
            key,
            id,
            stamp: stamp.max(self.head_stamp()),
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.link_front(slot);
        slot
    }

    fn move_to_front(&mut self, slot: usize, stamp: u64) {
        let stamp = stamp.max(self.head_stamp());
        self.detach(slot);
        self.node_mut(slot).stamp = stamp;
        self.link_front(slot);
    }

    fn remove(&mut self, slot: usize) -> Node {
        self.detach(slot);
        self.free.push(slot);
        self.nodes[slot]
            .take()
            .unwrap_or_else(|| unreachable!("linked slot {slot} is vacant"))
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head == NIL {
            self.tail = slot;
        } else {
            self.node_mut(old_head).prev = slot;
        }
        self.head = slot;
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node_mut(slot);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
    }
}

/// A recency list plus a lock-free copy of its oldest stamp, so callers can
/// skip shards with nothing to expire without taking the lock.
struct RecencyShard {
    list: Mutex<RecencyList>,
    oldest: AtomicU64,
}

impl RecencyShard {
    fn new() -> Self {
        Self {
            list: Mutex::new(RecencyList::new()),
            oldest: AtomicU64::new(EMPTY),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecencyList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn oldest(&self) -> u64 {
        self.oldest.load(Ordering::Acquire)
    }

    fn sync_oldest(&self, list: &RecencyList) {
        let oldest = list.tail().map_or(EMPTY, |(_, stamp)| stamp);
        self.oldest.store(oldest, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
enum Eviction {
    Idle,
    Capacity,
}

/// How many entries the store has dropped, by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionCounts {
    pub idle: u64,
    pub capacity: u64,
}

/// Concurrent map from client key to bucket, bounded in time and size.
///
/// - Existing keys take a map shard read lock and the lock of their own
///   recency shard, so keys in different shards never contend.
/// - Creation of new keys is serialized by `insert_lock`, which is what makes
///   "one bucket per key" and the entry ceiling hold under races.
/// - Every access first drops the idle tails of the recency shards. Each
///   entry is unlinked at most once, so the cost per access is amortized O(1).
/// - At the ceiling the oldest tail across shards is the victim.
pub struct BucketStore {
    entries: DashMap<String, Arc<BucketEntry>>,
    shards: Box<[RecencyShard]>,
    hasher: RandomState,
    limit: NonZeroU32,
    idle_nanos: u64,
    max_entries: usize,
    live: AtomicUsize,
    next_id: AtomicU64,
    idle_evictions: AtomicU64,
    capacity_evictions: AtomicU64,
    origin: Instant,
    insert_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl BucketStore {
    /// - `limit`: capacity of each bucket, also its refill per minute
    /// - `idle_timeout`: entries untouched for longer are forgotten
    /// - `max_entries`: hard ceiling on tracked keys
    pub fn new(limit: NonZeroU32, idle_timeout: Duration, max_entries: usize) -> Self {
        Self::with_clock(limit, idle_timeout, max_entries, Arc::new(SystemClock))
    }

    pub fn with_clock(
        limit: NonZeroU32,
        idle_timeout: Duration,
        max_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shard_count = std::thread::available_parallelism()
            .map_or(1, usize::from)
            .saturating_mul(4)
            .next_power_of_two();
        Self {
            entries: DashMap::new(),
            shards: (0..shard_count).map(|_| RecencyShard::new()).collect(),
            hasher: RandomState::new(),
            limit,
            idle_nanos: duration_nanos(idle_timeout),
            max_entries: max_entries.max(1),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            idle_evictions: AtomicU64::new(0),
            capacity_evictions: AtomicU64::new(0),
            origin: clock.now(),
            insert_lock: Mutex::new(()),
            clock,
        }
    }

    /// The bucket for `key`, created full on first use or after it went idle.
    pub fn get_or_create(&self, key: &str) -> Arc<BucketEntry> {
        let now = self.clock.now();
        let stamp = self.stamp(now);
        self.expire_idle(stamp);

        if let Some(entry) = self.lookup(key)
            && self.touch(&entry, stamp)
        {
            return entry;
        }
        self.insert(key, now, stamp)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is tracked. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn evictions(&self) -> EvictionCounts {
        EvictionCounts {
            idle: self.idle_evictions.load(Ordering::Relaxed),
            capacity: self.capacity_evictions.load(Ordering::Relaxed),
        }
    }

    // The map guard is released before any recency lock is taken.
    fn lookup(&self, key: &str) -> Option<Arc<BucketEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Record an access. False if the entry was already evicted or has gone
    /// idle, in which case it is unlinked and the caller starts afresh.
    fn touch(&self, entry: &BucketEntry, stamp: u64) -> bool {
        let shard = &self.shards[entry.shard];
        let mut list = shard.lock();
        let Some(node) = list.get(entry.slot).filter(|node| node.id == entry.id) else {
            return false;
        };
        if stamp.saturating_sub(node.stamp) > self.idle_nanos {
            self.unlink(shard, &mut list, entry.slot, Eviction::Idle);
            return false;
        }
        list.move_to_front(entry.slot, stamp);
        shard.sync_oldest(&list);
        true
    }

    fn insert(&self, key: &str, now: Instant, stamp: u64) -> Arc<BucketEntry> {
        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another caller may have created it while we waited.
        if let Some(entry) = self.lookup(key)
            && self.touch(&entry, stamp)
        {
            return entry;
        }

        while self.live.load(Ordering::Acquire) >= self.max_entries {
            if !self.evict_least_recent() {
                break;
            }
        }

        let shard_index = self.shard_for(key);
        let shard = &self.shards[shard_index];
        let mut list = shard.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared_key: Arc<str> = Arc::from(key);
        let slot = list.push_front(shared_key, id, stamp);
        shard.sync_oldest(&list);

        let entry = Arc::new(BucketEntry {
            bucket: Mutex::new(TokenBucket::per_minute(self.limit, now)),
            id,
            shard: shard_index,
            slot,
        });
        self.entries.insert(key.to_string(), Arc::clone(&entry));
        let tracked = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(key = %key, tracked, "created bucket");
        entry
    }

    fn expire_idle(&self, stamp: u64) {
        for shard in self.shards.iter() {
            if stamp.saturating_sub(shard.oldest()) <= self.idle_nanos {
                continue;
            }
            let mut list = shard.lock();
            let mut evicted = 0usize;
            while let Some((slot, oldest)) = list.tail() {
                if stamp.saturating_sub(oldest) <= self.idle_nanos {
                    break;
                }
                self.unlink(shard, &mut list, slot, Eviction::Idle);
                evicted += 1;
            }
            if evicted > 0 {
                tracing::debug!(evicted, "evicted idle buckets");
            }
        }
    }

    /// Drop the oldest tail across shards. False if there is nothing to drop.
    fn evict_least_recent(&self) -> bool {
        let Some(shard) = self
            .shards
            .iter()
            .filter(|shard| shard.oldest() != EMPTY)
            .min_by_key(|shard| shard.oldest())
        else {
            return false;
        };
        let mut list = shard.lock();
        // An empty tail means a concurrent expiry got there first; `live`
        // already reflects it.
        if let Some((slot, _)) = list.tail() {
            self.unlink(shard, &mut list, slot, Eviction::Capacity);
        }
        true
    }

    /// Remove the node at `slot` and its map entry. The map entry is only
    /// removed if it still belongs to that node.
    fn unlink(&self, shard: &RecencyShard, list: &mut RecencyList, slot: usize, cause: Eviction) {
        let node = list.remove(slot);
        self.entries
            .remove_if(&*node.key, |_, entry| entry.id == node.id);
        self.live.fetch_sub(1, Ordering::AcqRel);
        shard.sync_oldest(list);
        match cause {
            Eviction::Idle => {
                self.idle_evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %node.key, "evicted idle bucket");
            }
            Eviction::Capacity => {
                self.capacity_evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %node.key, "evicted least recently used bucket at capacity");
            }
        }
    }

    fn shard_for(&self, key: &str) -> usize {
        // Shard count is a power of two.
        (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1)
    }

    fn stamp(&self, now: Instant) -> u64 {
        duration_nanos(now.saturating_duration_since(self.origin))
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    const ONE: NonZeroU32 = NonZeroU32::MIN;
    const IDLE: Duration = Duration::from_secs(300);

    fn store(limit: u32, max_entries: usize) -> (BucketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = BucketStore::with_clock(
            NonZeroU32::new(limit).unwrap(),
            IDLE,
            max_entries,
            clock.clone(),
        );
        (store, clock)
    }

    #[test]
    fn same_key_same_bucket() {
        let (store, _) = store(5, 100);
        let a = store.get_or_create("a");
        let b = store.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &store.get_or_create("b")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn concurrent_first_calls_collapse_to_one_bucket() {
        let (store, _) = store(5, 100);
        let barrier = Barrier::new(16);
        let (store, barrier) = (&store, &barrier);
        let handles: Vec<Arc<BucketEntry>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        store.get_or_create("fresh")
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_consumers_never_overdraw() {
        let (store, clock) = store(10, 100);
        let allowed = AtomicUsize::new(0);
        let barrier = Barrier::new(32);
        std::thread::scope(|s| {
            for _ in 0..32 {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..5 {
                        let entry = store.get_or_create("shared");
                        if entry.try_consume(ONE, clock.now()).allowed {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(allowed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn idle_entry_swept_on_access_to_other_key() {
        let (store, clock) = store(5, 100);
        store.get_or_create("a");
        assert!(store.contains("a"));

        clock.advance(IDLE + Duration::from_secs(1));
        store.get_or_create("b");

        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn recently_used_entry_survives_sweep() {
        let (store, clock) = store(5, 100);
        store.get_or_create("a");
        clock.advance(Duration::from_secs(200));
        store.get_or_create("a");
        clock.advance(Duration::from_secs(200));
        store.get_or_create("b");
        assert!(store.contains("a"));
    }

    #[test]
    fn evicted_client_returns_to_full_bucket() {
        let (store, clock) = store(3, 100);
        let entry = store.get_or_create("a");
        for _ in 0..3 {
            assert!(entry.try_consume(ONE, clock.now()).allowed);
        }
        drop(entry);

        clock.advance(IDLE + Duration::from_secs(1));
        store.get_or_create("b");
        let fresh = store.get_or_create("a");
        assert_eq!(fresh.available_tokens(clock.now()), 3);
    }

    #[test]
    fn ceiling_is_never_exceeded() {
        let (store, clock) = store(5, 3);
        for i in 0..100 {
            store.get_or_create(&format!("client-{i}"));
            clock.advance(Duration::from_millis(10));
            assert!(store.len() <= 3);
        }
        assert!(store.contains("client-99"));
    }

    #[test]
    fn least_recently_used_is_evicted_at_capacity() {
        let (store, clock) = store(5, 2);
        store.get_or_create("a");
        clock.advance(Duration::from_millis(10));
        store.get_or_create("b");
        clock.advance(Duration::from_millis(10));
        store.get_or_create("a");
        clock.advance(Duration::from_millis(10));
        store.get_or_create("c");

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn ceiling_holds_under_concurrent_distinct_keys() {
        let (store, _) = store(5, 50);
        std::thread::scope(|s| {
            for t in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..200 {
                        store.get_or_create(&format!("t{t}-k{i}"));
                        assert!(store.len() <= 50);
                    }
                });
            }
        });
        assert!(store.len() <= 50);
        assert!(!store.is_empty());
    }

    #[test]
    fn idle_entry_swept_even_after_an_earlier_sweep() {
        let (store, clock) = store(5, 100);
        store.get_or_create("a");
        clock.advance(Duration::from_secs(290));
        store.get_or_create("c");
        assert!(store.contains("a"));

        clock.advance(Duration::from_secs(11));
        store.get_or_create("b");

        assert!(!store.contains("a"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.evictions().idle, 1);
    }

    #[test]
    fn idle_window_holds_at_every_step() {
        let (store, clock) = store(5, 1_000);
        let step = Duration::from_secs(10);
        for i in 0..60usize {
            store.get_or_create(&format!("k{i}"));
            // Keys created exactly one window ago are still within it.
            let oldest_kept = i.saturating_sub(30);
            for j in 0..=i {
                assert_eq!(
                    store.contains(&format!("k{j}")),
                    j >= oldest_kept,
                    "k{j} at step {i}"
                );
            }
            assert_eq!(store.len(), i + 1 - oldest_kept);
            clock.advance(step);
        }
    }

    #[test]
    fn expired_key_is_recreated_on_its_own_access() {
        let (store, clock) = store(2, 100);
        let stale = store.get_or_create("a");
        assert!(stale.try_consume(ONE, clock.now()).allowed);
        assert!(stale.try_consume(ONE, clock.now()).allowed);

        clock.advance(IDLE + Duration::from_secs(1));
        let fresh = store.get_or_create("a");

        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.available_tokens(clock.now()), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.evictions().idle, 1);
    }

    #[test]
    fn each_insert_at_capacity_evicts_exactly_one_oldest() {
        let (store, clock) = store(5, 100);
        for i in 0..100 {
            store.get_or_create(&format!("old-{i}"));
            clock.advance(Duration::from_millis(1));
        }
        for i in 0..1_000 {
            store.get_or_create(&format!("new-{i}"));
            clock.advance(Duration::from_millis(1));
            let counts = store.evictions();
            assert_eq!(counts.capacity, i + 1);
            assert_eq!(counts.idle, 0);
            assert_eq!(store.len(), 100);
        }
        assert!((0..100).all(|i| !store.contains(&format!("old-{i}"))));
        assert!((900..1_000).all(|i| store.contains(&format!("new-{i}"))));
    }

    #[test]
    fn capacity_victims_follow_access_order() {
        let (store, clock) = store(5, 3);
        for key in ["a", "b", "c"] {
            store.get_or_create(key);
            clock.advance(Duration::from_millis(10));
        }
        store.get_or_create("a");
        clock.advance(Duration::from_millis(10));

        store.get_or_create("d");
        assert!(!store.contains("b"));
        store.get_or_create("e");
        assert!(!store.contains("c"));
        assert!(store.contains("a"));
        assert_eq!(store.evictions().capacity, 2);
    }

    #[test]
    fn system_clock_store_reuses_bucket() {
        let store = BucketStore::new(NonZeroU32::new(3).unwrap(), IDLE, 10);
        let entry = store.get_or_create("a");
        assert!(entry.try_consume(ONE, Instant::now()).allowed);
        let again = store.get_or_create("a");
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(again.available_tokens(Instant::now()), 2);
    }
}
