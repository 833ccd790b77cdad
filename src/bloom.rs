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

//! Membership filter over the cache's keys. Requestors keep a local copy and
//! use it to skip cache lookups that would certainly miss; the generator on
//! the cache server keeps the filter fresh and answers incremental updates.

use blake3;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use errors::*;

/// 2^25 bits = 4 MiB. Sized for ~10^6 keys at roughly 1e-5 false-positive
/// rate with 10 hash iterations. Power-of-two so snapshot consumers can
/// sanity-check sizes cheaply.
pub const BLOOM_FILTER_SIZE_IN_BITS: usize = 1 << 25;
pub const HASH_ITERATION_COUNT: u32 = 10;

/// Keys inserted during the last hour are remembered individually, to serve
/// incremental fetches and rebuild compensation.
const NEWLY_POPULATED_KEY_HISTORY: Duration = Duration::from_secs(3600);

// Keeps the filter's hash family distinct from the plain content-hash uses
// of blake3 elsewhere.
const HASH_SALT: &[u8] = b"yadcc-bloom-1";

#[derive(Clone)]
pub struct SaltedBloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
}

impl SaltedBloomFilter {
    /// `size_in_bits` must be a power of two no smaller than a byte.
    pub fn new(size_in_bits: usize, num_hashes: u32) -> SaltedBloomFilter {
        assert!(size_in_bits >= 8 && size_in_bits.is_power_of_two());
        assert!(num_hashes > 0);
        SaltedBloomFilter {
            bits: vec![0u8; size_in_bits / 8],
            num_hashes,
        }
    }

    /// Reconstructs a filter from a snapshot previously taken with
    /// `as_bytes()`.
    pub fn from_bytes(bytes: Vec<u8>, num_hashes: u32) -> Result<SaltedBloomFilter> {
        if bytes.is_empty() || !bytes.len().is_power_of_two() || num_hashes == 0 {
            bail!(ErrorKind::InvalidArgument("invalid bloom filter snapshot".into()));
        }
        Ok(SaltedBloomFilter { bits: bytes, num_hashes })
    }

    pub fn add(&mut self, key: &str) {
        let (h1, h2) = self.hash_pair(key);
        let mask = (self.bits.len() as u64 * 8) - 1;
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) & mask;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn possibly_contains(&self, key: &str) -> bool {
        let (h1, h2) = self.hash_pair(key);
        let mask = (self.bits.len() as u64 * 8) - 1;
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) & mask;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    // Classic double hashing: every probe index derives from two 64-bit
    // halves of one salted digest.
    fn hash_pair(&self, key: &str) -> (u64, u64) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_SALT);
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let raw = digest.as_bytes();
        let mut h1 = 0u64;
        let mut h2 = 0u64;
        for i in 0..8 {
            h1 |= (raw[i] as u64) << (i * 8);
            h2 |= (raw[i + 8] as u64) << (i * 8);
        }
        (h1, h2 | 1) // Odd step so all probes differ.
    }
}

struct GeneratorState {
    filter: SaltedBloomFilter,
    // (key, inserted_at), oldest first.
    newly_populated: VecDeque<(String, Instant)>,
}

/// Thread-safe owner of the current filter plus a short history of recent
/// insertions.
pub struct BloomFilterGenerator {
    state: Mutex<GeneratorState>,
}

impl BloomFilterGenerator {
    pub fn new() -> BloomFilterGenerator {
        BloomFilterGenerator {
            state: Mutex::new(GeneratorState {
                filter: SaltedBloomFilter::new(BLOOM_FILTER_SIZE_IN_BITS, HASH_ITERATION_COUNT),
                newly_populated: VecDeque::new(),
            }),
        }
    }

    /// Replaces the filter with a fresh one built from `keys` plus whatever
    /// was inserted within the last `compensation`. The compensation covers
    /// keys racing with the (possibly slow) key enumeration that produced
    /// `keys`.
    pub fn rebuild(&self, keys: &[String], compensation: Duration) {
        let mut state = self.state.lock().unwrap();
        let recent = prune_and_collect(&mut state.newly_populated, compensation);
        let mut filter =
            SaltedBloomFilter::new(BLOOM_FILTER_SIZE_IN_BITS, HASH_ITERATION_COUNT);
        for key in keys {
            filter.add(key);
        }
        for key in &recent {
            filter.add(key);
        }
        state.filter = filter;
    }

    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.filter.add(key);
        state.newly_populated.push_back((key.to_owned(), Instant::now()));
    }

    /// Keys inserted within `window`, newest first. History older than one
    /// hour is dropped on the way.
    pub fn get_newly_populated_keys(&self, window: Duration) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        prune_and_collect(&mut state.newly_populated, window)
    }

    /// Copy of the current filter's bytes and its hash-iteration count.
    pub fn snapshot(&self) -> (Vec<u8>, u32) {
        let state = self.state.lock().unwrap();
        (state.filter.as_bytes().to_vec(), state.filter.num_hashes())
    }

    pub fn possibly_contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().filter.possibly_contains(key)
    }
}

fn prune_and_collect(
    deque: &mut VecDeque<(String, Instant)>,
    window: Duration,
) -> Vec<String> {
    let now = Instant::now();
    while let Some(dropping) = deque
        .front()
        .map(|&(_, at)| now.duration_since(at) > NEWLY_POPULATED_KEY_HISTORY)
    {
        if !dropping {
            break;
        }
        deque.pop_front();
    }
    let mut result = Vec::new();
    for &(ref key, at) in deque.iter().rev() {
        if now.duration_since(at) > window {
            break;
        }
        result.push(key.clone());
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_filter_membership() {
        let mut filter = SaltedBloomFilter::new(1 << 16, 10);
        for i in 0..100 {
            filter.add(&format!("key-{}", i));
        }
        for i in 0..100 {
            assert!(filter.possibly_contains(&format!("key-{}", i)));
        }
        let mut false_positives = 0;
        for i in 100..1100 {
            if filter.possibly_contains(&format!("key-{}", i)) {
                false_positives += 1;
            }
        }
        // At this fill rate the FP rate should be tiny; 5% is a very loose cap.
        assert!(false_positives < 50, "{} false positives", false_positives);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut filter = SaltedBloomFilter::new(1 << 16, 10);
        filter.add("hello");
        let restored =
            SaltedBloomFilter::from_bytes(filter.as_bytes().to_vec(), filter.num_hashes())
                .unwrap();
        assert!(restored.possibly_contains("hello"));
        assert!(!restored.possibly_contains("goodbye"));
    }

    #[test]
    fn test_snapshot_size_must_be_power_of_two() {
        assert!(SaltedBloomFilter::from_bytes(vec![0u8; 1000], 10).is_err());
        assert!(SaltedBloomFilter::from_bytes(vec![0u8; 1024], 10).is_ok());
    }

    #[test]
    fn test_generator_rebuild_covers_keys_and_recent_insertions() {
        let generator = BloomFilterGenerator::new();
        generator.add("recently-added");
        generator.rebuild(
            &["a".to_owned(), "b".to_owned()],
            Duration::from_secs(10),
        );
        assert!(generator.possibly_contains("a"));
        assert!(generator.possibly_contains("b"));
        // Inserted moments ago, within compensation.
        assert!(generator.possibly_contains("recently-added"));
    }

    #[test]
    fn test_generator_rebuild_without_compensation_drops_unlisted_keys() {
        let generator = BloomFilterGenerator::new();
        generator.add("dropped");
        generator.rebuild(&["kept".to_owned()], Duration::from_secs(0));
        assert!(generator.possibly_contains("kept"));
        assert!(!generator.possibly_contains("dropped"));
    }

    #[test]
    fn test_newly_populated_keys_ordering_and_window() {
        let generator = BloomFilterGenerator::new();
        generator.add("first");
        generator.add("second");
        let keys = generator.get_newly_populated_keys(Duration::from_secs(60));
        assert_eq!(keys, vec!["second".to_owned(), "first".to_owned()]);
        assert!(generator
            .get_newly_populated_keys(Duration::from_secs(0))
            .len()
            <= 2); // Everything was inserted "now"; zero window may keep them.
    }
}
