/*!
 * Scoped LRU cache with single-flight fills (C2)
 *
 * Grounded on `examples/original_source/nsd/cache.c`: the doubly-linked
 * MRU list, the createEntry/setValue/wait single-flight collapsing
 * pattern, the named cache registry with duplicate-name tolerance, and
 * destroy-time coordination with a running sweep.
 */

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

struct Entry<V> {
    value: Option<V>,
    size: usize,
    touched_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<V>>>,
    free_slots: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    current_size: usize,
    max_size: usize,
    hits: u64,
    misses: u64,
    flushes: u64,
    stop: bool,
    sweep_running: bool,
}

/// A bounded, keyed LRU cache. Callers coordinate concurrent fills
/// through [`Cache::wait`]/[`Cache::signal`] rather than a dedicated
/// "fetch or compute" API, matching the donor's single-flight idiom.
pub struct Cache<K, V> {
    inner: Mutex<Inner<K, V>>,
    cond: Condvar,
    sweep_done: Condvar,
    ttl: Option<Duration>,
}

pub struct EntryHandle(usize);

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                slots: Vec::new(),
                free_slots: Vec::new(),
                head: None,
                tail: None,
                current_size: 0,
                max_size,
                hits: 0,
                misses: 0,
                flushes: 0,
                stop: false,
                sweep_running: false,
            }),
            cond: Condvar::new(),
            sweep_done: Condvar::new(),
            ttl,
        })
    }

    /// Find an entry by key, promoting it to most-recently-used on hit.
    pub fn find(&self, key: &K) -> Option<EntryHandle> {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.hits += 1;
                inner.touch(idx);
                Some(EntryHandle(idx))
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Find-or-insert. Returns the entry handle and whether it was freshly
    /// created (with no value yet).
    pub fn create_entry(&self, key: K) -> (EntryHandle, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.map.get(&key) {
            inner.hits += 1;
            inner.touch(idx);
            return (EntryHandle(idx), false);
        }
        inner.misses += 1;
        let idx = inner.alloc_slot(Entry {
            value: None,
            size: 0,
            touched_at: Instant::now(),
            prev: None,
            next: None,
        });
        inner.map.insert(key, idx);
        inner.push_front(idx);
        (EntryHandle(idx), true)
    }

    /// Read the current value, if any, under the cache lock.
    pub fn value(&self, entry: &EntryHandle) -> Option<V>
    where
        V: Clone,
    {
        let inner = self.inner.lock().unwrap();
        inner.slots[entry.0].as_ref().and_then(|e| e.value.clone())
    }

    pub fn has_value(&self, entry: &EntryHandle) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.slots[entry.0].as_ref().map_or(false, |e| e.value.is_some())
    }

    /// Set an entry's value, evicting LRU tail entries until the cache is
    /// back under `max_size` (never evicting the entry being set).
    pub fn set_value(&self, entry: &EntryHandle, value: V, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        let idx = entry.0;
        let old_size = inner.slots[idx].as_ref().map(|e| e.size).unwrap_or(0);
        {
            let slot = inner.slots[idx].as_mut().unwrap();
            slot.value = Some(value);
            slot.size = size;
            slot.touched_at = Instant::now();
        }
        inner.current_size = inner.current_size - old_size + size;

        let max_size = inner.max_size;
        if max_size > 0 {
            while inner.current_size > max_size {
                let Some(tail) = inner.tail else { break };
                if tail == idx {
                    break;
                }
                inner.remove_slot(tail);
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Flush (evict) a single entry.
    pub fn flush(&self, entry: &EntryHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove_slot(entry.0);
        inner.flushes += 1;
    }

    pub fn flush_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let all: Vec<usize> = inner.map.values().copied().collect();
        for idx in all {
            inner.remove_slot(idx);
            inner.flushes += 1;
        }
    }

    /// Block until signalled or `timeout` elapses. Used by callers waiting
    /// on a concurrent fill of the same key.
    pub fn wait(&self, timeout: Duration) {
        let inner = self.inner.lock().unwrap();
        let _ = self.cond.wait_timeout(inner, timeout).unwrap();
    }

    pub fn signal(&self) {
        self.cond.notify_one();
    }

    pub fn broadcast(&self) {
        self.cond.notify_all();
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.hits, inner.misses, inner.flushes)
    }

    pub fn current_size(&self) -> usize {
        self.inner.lock().unwrap().current_size
    }

    /// Walk the LRU tail evicting entries older than `ttl`, stopping at
    /// the first entry still fresh. Intended to be driven periodically by
    /// the scheduler (C1).
    pub fn sweep_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        let mut inner = self.inner.lock().unwrap();
        if inner.stop {
            return;
        }
        inner.sweep_running = true;
        let now = Instant::now();
        loop {
            let Some(tail) = inner.tail else { break };
            let touched_at = inner.slots[tail].as_ref().unwrap().touched_at;
            if now.duration_since(touched_at) <= ttl {
                break;
            }
            inner.remove_slot(tail);
            inner.flushes += 1;
        }
        inner.sweep_running = false;
        drop(inner);
        self.sweep_done.notify_all();
    }

    /// Stop the cache: prevent further sweeps, and if one is already
    /// running, wait for it to finish before returning.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stop = true;
        while inner.sweep_running {
            inner = self.sweep_done.wait(inner).unwrap();
        }
    }
}

impl<K, V> Inner<K, V> {
    fn alloc_slot(&mut self, entry: Entry<V>) -> usize {
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx] = Some(entry);
            idx
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().unwrap();
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

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().unwrap();
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

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(entry) = self.slots[idx].take() {
            self.current_size = self.current_size.saturating_sub(entry.size);
        }
        self.free_slots.push(idx);
    }
}

/// Process-wide registry of named caches. A second `get_or_create` call
/// with an existing name returns the existing cache rather than erroring,
/// matching `cache.c`'s `CacheCreate` duplicate-name tolerance.
pub struct CacheRegistry<K, V> {
    caches: Mutex<HashMap<String, Arc<Cache<K, V>>>>,
}

impl<K: Eq + Hash + Clone + Send + 'static, V: Send + 'static> CacheRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str, max_size: usize, ttl: Option<Duration>) -> Arc<Cache<K, V>> {
        let mut caches = self.caches.lock().unwrap();
        if let Some(existing) = caches.get(name) {
            debug!(cache = name, "cache already registered, returning existing instance");
            return existing.clone();
        }
        let cache = Cache::new(max_size, ttl);
        caches.insert(name.to_string(), cache.clone());
        cache
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cache<K, V>>> {
        self.caches.lock().unwrap().get(name).cloned()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static, V: Send + 'static> Default for CacheRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn create_entry_then_set_value_roundtrips() {
        let cache: Arc<Cache<String, String>> = Cache::new(1024, None);
        let (entry, is_new) = cache.create_entry("k".to_string());
        assert!(is_new);
        cache.set_value(&entry, "payload".to_string(), 7);
        assert_eq!(cache.value(&entry), Some("payload".to_string()));
    }

    #[test]
    fn size_bound_evicts_lru_tail() {
        let cache: Arc<Cache<String, Vec<u8>>> = Cache::new(10, None);
        let (e1, _) = cache.create_entry("a".to_string());
        cache.set_value(&e1, vec![0; 6], 6);
        let (e2, _) = cache.create_entry("b".to_string());
        cache.set_value(&e2, vec![0; 6], 6);

        // "a" was least-recently-used and should have been evicted to
        // keep current_size <= max_size.
        assert!(cache.find(&"a".to_string()).is_none());
        assert!(cache.find(&"b".to_string()).is_some());
    }

    #[test]
    fn single_flight_collapses_concurrent_fills() {
        let cache: Arc<Cache<String, String>> = Cache::new(1024, None);
        let fill_count = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..3 {
            let cache = cache.clone();
            let fill_count = fill_count.clone();
            handles.push(thread::spawn(move || loop {
                let (entry, is_new) = cache.create_entry("k".to_string());
                if is_new {
                    fill_count.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    cache.set_value(&entry, "v".to_string(), 1);
                    cache.broadcast();
                    return "filled";
                }
                if let Some(v) = cache.value(&entry) {
                    return Box::leak(v.into_boxed_str());
                }
                cache.wait(Duration::from_millis(50));
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(fill_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registry_name_returns_existing() {
        let registry: CacheRegistry<String, String> = CacheRegistry::new();
        let a = registry.get_or_create("shared", 1024, None);
        let b = registry.get_or_create("shared", 2048, None);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn sweep_expired_evicts_stale_entries() {
        let cache: Arc<Cache<String, String>> = Cache::new(1024, Some(Duration::from_millis(20)));
        let (entry, _) = cache.create_entry("k".to_string());
        cache.set_value(&entry, "v".to_string(), 1);

        thread::sleep(Duration::from_millis(40));
        cache.sweep_expired();

        assert!(cache.find(&"k".to_string()).is_none());
    }

    #[test]
    fn shutdown_waits_for_running_sweep() {
        let cache: Arc<Cache<String, String>> = Cache::new(1024, Some(Duration::from_millis(1)));
        cache.shutdown();
        // Further sweeps are no-ops once stopped.
        cache.sweep_expired();
    }
}
