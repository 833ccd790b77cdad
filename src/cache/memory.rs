// Copyright 2021 The yadcc developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-sized adaptive-replacement cache fronting the disk cache. Two
//! resident lists (one-hit, multi-hit), two phantom lists remembering recent
//! evictions, and an adaptive parameter steering bytes between the two
//! resident lists. All list sizes are measured in bytes, not entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    HitOnce,        // T1
    HitMany,        // T2
    HitOncePhantom, // B1
    HitManyPhantom, // B2
}

#[derive(Default)]
struct CacheList {
    // Sequence number -> key. Smallest sequence is the LRU end.
    order: BTreeMap<u64, String>,
    size_in_bytes: usize,
}

struct EntryDesc {
    list: ListId,
    seq: u64,
    size: usize,
    // Present for resident entries, absent for phantoms.
    buffer: Option<Vec<u8>>,
}

struct State {
    max_size_in_bytes: usize,
    // The adaptive parameter ("p"): target byte size of the one-hit list.
    adaptive_size_of_once: usize,
    next_seq: u64,
    entries: HashMap<String, EntryDesc>,
    hit_once: CacheList,
    hit_many: CacheList,
    hit_once_phantom: CacheList,
    hit_many_phantom: CacheList,
}

pub struct InMemoryCache {
    state: Mutex<State>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryCache {
    pub fn new(max_size_in_bytes: usize) -> InMemoryCache {
        InMemoryCache {
            state: Mutex::new(State {
                max_size_in_bytes,
                adaptive_size_of_once: 0,
                next_seq: 0,
                entries: HashMap::new(),
                hit_once: CacheList::default(),
                hit_many: CacheList::default(),
                hit_once_phantom: CacheList::default(),
                hit_many_phantom: CacheList::default(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Inserts (or refreshes) `key`. Fails only if the buffer alone exceeds
    /// the cache's byte bound; otherwise room is made by evicting.
    pub fn put(&self, key: &str, buffer: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        if buffer.len() > state.max_size_in_bytes {
            return false;
        }
        // Repacked into a tight allocation of our own; the source buffer may
        // be a slice of something much larger.
        let buffer = buffer.to_vec();

        let resident = state
            .entries
            .get(key)
            .map(|e| e.buffer.is_some())
            .unwrap_or(false);
        if resident {
            state.overwrite(key, buffer);
        } else if state.entries.contains_key(key) {
            state.revive_phantom(key, buffer);
        } else {
            state.insert_on_miss(key, buffer);
        }
        state.evict_memory_overflow();
        debug_assert!(state.check_invariants());
        true
    }

    /// Looks `key` up among resident entries. A hit promotes the entry to
    /// the multi-hit list's MRU position.
    pub fn try_get(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let resident = state
            .entries
            .get(key)
            .map(|e| e.buffer.is_some())
            .unwrap_or(false);
        if !resident {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        state.detach(key);
        state.attach_mru(key, ListId::HitMany);
        self.hits.fetch_add(1, Ordering::Relaxed);
        state.entries.get(key).and_then(|e| e.buffer.clone())
    }

    /// Drops the given keys, resident or phantom. Not a hot path.
    pub fn remove(&self, keys: &[String]) {
        let mut state = self.state.lock().unwrap();
        for key in keys {
            if state.entries.contains_key(key) {
                state.detach(key);
                state.entries.remove(key);
            }
        }
        debug_assert!(state.check_invariants());
    }

    /// Keys of resident entries.
    pub fn get_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|&(_, e)| e.buffer.is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        json!({
            "actual_size_in_bytes":
                state.hit_once.size_in_bytes + state.hit_many.size_in_bytes,
            "actual_entries":
                state.hit_once.order.len() + state.hit_many.order.len(),
            "phantom_size_in_bytes":
                state.hit_once_phantom.size_in_bytes + state.hit_many_phantom.size_in_bytes,
            "phantom_entries":
                state.hit_once_phantom.order.len() + state.hit_many_phantom.order.len(),
            "adaptive_size_of_once": state.adaptive_size_of_once,
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
        })
    }

    #[cfg(test)]
    fn with_state<R, F: FnOnce(&State) -> R>(&self, f: F) -> R {
        f(&self.state.lock().unwrap())
    }
}

impl State {
    fn list(&mut self, id: ListId) -> &mut CacheList {
        match id {
            ListId::HitOnce => &mut self.hit_once,
            ListId::HitMany => &mut self.hit_many,
            ListId::HitOncePhantom => &mut self.hit_once_phantom,
            ListId::HitManyPhantom => &mut self.hit_many_phantom,
        }
    }

    // Removes `key` from whatever list it is on. The entry record stays.
    fn detach(&mut self, key: &str) {
        let (list, seq, size) = {
            let e = &self.entries[key];
            (e.list, e.seq, e.size)
        };
        let l = self.list(list);
        l.order.remove(&seq);
        l.size_in_bytes -= size;
    }

    // Appends `key` at the MRU end of `list`.
    fn attach_mru(&mut self, key: &str, list: ListId) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let size = self.entries[key].size;
        {
            let l = self.list(list);
            l.order.insert(seq, key.to_owned());
            l.size_in_bytes += size;
        }
        let e = self.entries.get_mut(key).unwrap();
        e.list = list;
        e.seq = seq;
    }

    // Replaces a resident entry's bytes in place, list position unchanged.
    fn overwrite(&mut self, key: &str, buffer: Vec<u8>) {
        let (list, old_size) = {
            let e = &self.entries[key];
            (e.list, e.size)
        };
        let new_size = buffer.len();
        {
            let l = self.list(list);
            l.size_in_bytes = l.size_in_bytes - old_size + new_size;
        }
        let e = self.entries.get_mut(key).unwrap();
        e.size = new_size;
        e.buffer = Some(buffer);
    }

    // A hit on one of the phantom lists: the access pattern tells us the
    // adaptive split was wrong, so shift it before bringing the entry back
    // as resident in the multi-hit list.
    fn revive_phantom(&mut self, key: &str, buffer: Vec<u8>) {
        let from_once = self.entries[key].list == ListId::HitOncePhantom;
        let size = buffer.len();
        let b1 = self.hit_once_phantom.size_in_bytes;
        let b2 = self.hit_many_phantom.size_in_bytes;
        if from_once {
            // LRU-friendly workload: grow the one-hit target.
            let ratio = if b1 < b2 && b1 > 0 { b2 as f64 / b1 as f64 } else { 1.0 };
            self.adaptive_size_of_once = ::std::cmp::min(
                self.adaptive_size_of_once
                    .saturating_add((size as f64 * ratio) as usize),
                self.max_size_in_bytes,
            );
        } else {
            // LFU-friendly workload: shrink it.
            let ratio = if b2 < b1 && b2 > 0 { b1 as f64 / b2 as f64 } else { 1.0 };
            self.adaptive_size_of_once = self
                .adaptive_size_of_once
                .saturating_sub((size as f64 * ratio) as usize);
        }
        self.adaptive_adjust(if from_once { 1 } else { 2 });

        self.detach(key);
        {
            let e = self.entries.get_mut(key).unwrap();
            e.size = size;
            e.buffer = Some(buffer);
        }
        self.attach_mru(key, ListId::HitMany);
    }

    // Complete miss: make room per the adaptive policy, then insert at the
    // one-hit list's MRU position.
    fn insert_on_miss(&mut self, key: &str, buffer: Vec<u8>) {
        let size = buffer.len();
        let mut remaining = size;
        let max = self.max_size_in_bytes;

        if self.hit_once.size_in_bytes + self.hit_many.size_in_bytes + remaining > max {
            if self.hit_once.size_in_bytes + self.hit_once_phantom.size_in_bytes + remaining
                > max
            {
                // The one-hit side is over budget; trim its phantom first,
                // then the resident list itself.
                if self.hit_once_phantom.size_in_bytes > 0 {
                    remaining = self.try_evict(ListId::HitOncePhantom, remaining);
                }
                if remaining > 0 {
                    remaining = self.try_evict(ListId::HitOnce, remaining);
                }
            }
            if remaining > 0 {
                let total = self.hit_once.size_in_bytes
                    + self.hit_many.size_in_bytes
                    + self.hit_once_phantom.size_in_bytes
                    + self.hit_many_phantom.size_in_bytes
                    + remaining;
                if total > max {
                    if total >= 2 * max {
                        if self.hit_many_phantom.size_in_bytes > 0 {
                            remaining = self.try_evict(ListId::HitManyPhantom, remaining);
                        }
                        if remaining > 0 {
                            let _ = self.try_evict(ListId::HitMany, remaining);
                        }
                    } else {
                        self.adaptive_adjust(1);
                    }
                }
            }
        }

        self.entries.insert(
            key.to_owned(),
            EntryDesc {
                list: ListId::HitOnce, // attach_mru sets it for real.
                seq: 0,
                size,
                buffer: Some(buffer),
            },
        );
        self.attach_mru(key, ListId::HitOnce);
    }

    // Frees at least `desired` bytes from the LRU end of `list` (or runs the
    // list dry). Evicted entries are forgotten entirely; each phantom
    // eviction also re-balances the adaptive split.
    fn try_evict(&mut self, list: ListId, mut desired: usize) -> usize {
        let phantom = list == ListId::HitOncePhantom || list == ListId::HitManyPhantom;
        while desired > 0 && self.list(list).size_in_bytes > 0 {
            let (seq, key) = {
                let l = self.list(list);
                let (&seq, key) = l.order.iter().next().unwrap();
                (seq, key.clone())
            };
            let size = self.entries[&key].size;
            {
                let l = self.list(list);
                l.order.remove(&seq);
                l.size_in_bytes -= size;
            }
            self.entries.remove(&key);
            desired = desired.saturating_sub(size);
            if phantom {
                self.adaptive_adjust(1);
            }
        }
        desired
    }

    // Demotes the LRU resident entry of `list` into its phantom list,
    // dropping the bytes but remembering the key and its size.
    fn evict_resident_to_phantom(&mut self, list: ListId) {
        let phantom = match list {
            ListId::HitOnce => ListId::HitOncePhantom,
            ListId::HitMany => ListId::HitManyPhantom,
            _ => unreachable!(),
        };
        let key = {
            let l = self.list(list);
            l.order.iter().next().map(|(_, k)| k.clone()).unwrap()
        };
        self.detach(&key);
        self.entries.get_mut(&key).unwrap().buffer = None;
        self.attach_mru(&key, phantom);
    }

    fn adaptive_adjust(&mut self, phantom_index: u32) {
        let p = self.adaptive_size_of_once;
        if self.hit_once.size_in_bytes > p
            || (phantom_index == 2 && self.hit_once.size_in_bytes >= p)
        {
            if self.hit_once.size_in_bytes > 0 {
                self.evict_resident_to_phantom(ListId::HitOnce);
            }
        } else {
            let adaptive_size_of_many = self.max_size_in_bytes - p;
            if self.hit_many.size_in_bytes > 0
                && self.hit_many.size_in_bytes >= adaptive_size_of_many
            {
                self.evict_resident_to_phantom(ListId::HitMany);
            }
        }
    }

    // Restores the three byte-bound invariants after any mutation.
    fn evict_memory_overflow(&mut self) {
        while self.hit_once.size_in_bytes + self.hit_many.size_in_bytes
            > self.max_size_in_bytes
        {
            if self.hit_once.size_in_bytes > self.adaptive_size_of_once {
                self.evict_resident_to_phantom(ListId::HitOnce);
            } else {
                self.evict_resident_to_phantom(ListId::HitMany);
            }
        }
        while self.hit_once.size_in_bytes + self.hit_once_phantom.size_in_bytes
            > self.max_size_in_bytes
        {
            let _ = self.try_evict_one(ListId::HitOncePhantom);
        }
        while self.hit_many.size_in_bytes + self.hit_many_phantom.size_in_bytes
            > self.max_size_in_bytes
        {
            let _ = self.try_evict_one(ListId::HitManyPhantom);
        }
    }

    // Drops the LRU entry of a phantom list outright.
    fn try_evict_one(&mut self, list: ListId) -> bool {
        let key = {
            let l = self.list(list);
            match l.order.iter().next() {
                Some((_, k)) => k.clone(),
                None => return false,
            }
        };
        self.detach(&key);
        self.entries.remove(&key);
        true
    }

    fn check_invariants(&self) -> bool {
        let t1 = self.hit_once.size_in_bytes;
        let t2 = self.hit_many.size_in_bytes;
        let b1 = self.hit_once_phantom.size_in_bytes;
        let b2 = self.hit_many_phantom.size_in_bytes;
        t1 + t2 <= self.max_size_in_bytes
            && t1 + b1 <= self.max_size_in_bytes
            && t2 + b2 <= self.max_size_in_bytes
            && self.adaptive_size_of_once <= self.max_size_in_bytes
            && self.entries.len()
                == self.hit_once.order.len()
                    + self.hit_many.order.len()
                    + self.hit_once_phantom.order.len()
                    + self.hit_many_phantom.order.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_invariants(cache: &InMemoryCache) {
        assert!(cache.with_state(|s| s.check_invariants()));
    }

    #[test]
    fn test_basic_put_get() {
        let cache = InMemoryCache::new(1024);
        assert!(cache.put("a", b"hello"));
        assert_eq!(cache.try_get("a").unwrap(), b"hello");
        assert!(cache.try_get("b").is_none());
        assert_invariants(&cache);
    }

    #[test]
    fn test_oversized_put_fails() {
        let cache = InMemoryCache::new(16);
        assert!(!cache.put("a", &[0u8; 17]));
        assert!(cache.put("b", &[0u8; 16]));
        assert_invariants(&cache);
    }

    #[test]
    fn test_overwrite_updates_bytes() {
        let cache = InMemoryCache::new(1024);
        assert!(cache.put("a", b"v1"));
        assert!(cache.put("a", b"value-two"));
        assert_eq!(cache.try_get("a").unwrap(), b"value-two");
        assert_invariants(&cache);
    }

    #[test]
    fn test_resident_bytes_never_exceed_bound() {
        let cache = InMemoryCache::new(10_000);
        for i in 0..500 {
            assert!(cache.put(&format!("key-{}", i), &[0u8; 92]));
            assert_invariants(&cache);
        }
        let resident: usize =
            cache.with_state(|s| s.hit_once.size_in_bytes + s.hit_many.size_in_bytes);
        assert!(resident <= 10_000);
    }

    #[test]
    fn test_hit_promotes_to_multi_hit_list() {
        let cache = InMemoryCache::new(1024);
        cache.put("a", b"data");
        assert!(cache.try_get("a").is_some());
        cache.with_state(|s| {
            assert_eq!(s.entries["a"].list, ListId::HitMany);
            assert_eq!(s.hit_once.size_in_bytes, 0);
        });
    }

    #[test]
    fn test_ghost_promotion_shifts_adaptive_parameter() {
        const MAX: usize = 10_000;
        const SIZE: usize = 92;
        let cache = InMemoryCache::new(MAX);

        // Insert 100 entries and read each once; they all end up in the
        // multi-hit list.
        for i in 0..100 {
            cache.put(&format!("a-{}", i), &[0u8; SIZE]);
        }
        for i in 0..100 {
            assert!(cache.try_get(&format!("a-{}", i)).is_some());
        }
        // Push 100 fresh entries through the one-hit list. With the
        // multi-hit list near budget, the one-hit list keeps overflowing and
        // demotes its LRU entries into the one-hit phantom list.
        for i in 0..100 {
            cache.put(&format!("b-{}", i), &[0u8; SIZE]);
            assert_invariants(&cache);
        }
        let phantoms: Vec<String> = cache.with_state(|s| {
            s.hit_once_phantom.order.values().cloned().collect()
        });
        assert!(!phantoms.is_empty(), "expected demotions into the phantom list");
        // The first batch stayed resident in the multi-hit list throughout.
        cache.with_state(|s| {
            assert_eq!(s.entries["a-99"].list, ListId::HitMany);
            assert!(s.entries["a-99"].buffer.is_some());
        });

        // Re-inserting a phantom promotes it straight into the multi-hit
        // list and moves the adaptive parameter toward LRU.
        let p_before = cache.with_state(|s| s.adaptive_size_of_once);
        let revived = phantoms[0].clone();
        cache.put(&revived, &[0u8; SIZE]);
        assert_invariants(&cache);
        cache.with_state(|s| {
            assert_eq!(s.entries[&revived].list, ListId::HitMany);
            assert!(s.entries[&revived].buffer.is_some());
        });
        let p_after = cache.with_state(|s| s.adaptive_size_of_once);
        assert!(
            p_after > p_before,
            "adaptive parameter did not move toward LRU ({} -> {})",
            p_before,
            p_after
        );
    }

    #[test]
    fn test_remove_and_get_keys() {
        let cache = InMemoryCache::new(1024);
        cache.put("a", b"1");
        cache.put("b", b"2");
        let mut keys = cache.get_keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
        cache.remove(&["a".to_owned(), "nonexistent".to_owned()]);
        assert_eq!(cache.get_keys(), vec!["b".to_owned()]);
        assert_invariants(&cache);
    }

    #[test]
    fn test_dump_internals_reports_sizes() {
        let cache = InMemoryCache::new(1024);
        cache.put("a", b"four");
        let dump = cache.dump_internals();
        assert_eq!(dump["actual_size_in_bytes"], 4);
        assert_eq!(dump["actual_entries"], 1);
    }
}
