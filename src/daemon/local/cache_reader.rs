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

//! Requestor-side view of the distributed cache: a local Bloom-filter
//! snapshot to rule out certain misses for free, and the actual entry fetch
//! for probable hits.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zstd;

use bloom::SaltedBloomFilter;
use cache::format::{self, CacheEntry};
use errors::*;
use protocol::{FetchBloomFilterRequest, FetchBloomFilterResponse, TryGetEntryRequest};
use rpc::{self, CacheClient};
use util::PeriodicTimer;

const RELOAD_INTERVAL: Duration = Duration::from_secs(2);
/// Past this the snapshot is too old to trust its negatives; go straight to
/// the server instead.
const SNAPSHOT_STALENESS_LIMIT: Duration = Duration::from_secs(600);

struct FilterState {
    filter: SaltedBloomFilter,
    last_update: Option<Instant>,
    last_full_update: Option<Instant>,
}

pub struct DistributedCacheReader {
    cache: Option<CacheClient>,
    token: String,
    state: Mutex<FilterState>,
    timer: Mutex<Option<PeriodicTimer>>,
}

impl DistributedCacheReader {
    /// `cache = None` disables distributed caching entirely.
    pub fn new(cache: Option<CacheClient>, token: String) -> Arc<DistributedCacheReader> {
        let reader = Arc::new(DistributedCacheReader {
            cache,
            token,
            state: Mutex::new(FilterState {
                // Dummy; overwritten by the first successful load.
                filter: SaltedBloomFilter::new(1024, 10),
                last_update: None,
                last_full_update: None,
            }),
            timer: Mutex::new(None),
        });
        if reader.cache.is_some() {
            reader.load_bloom_filter();
            let r = reader.clone();
            *reader.timer.lock().unwrap() = Some(PeriodicTimer::spawn(
                "cache-bf-reload",
                RELOAD_INTERVAL,
                move || r.load_bloom_filter(),
            ));
        }
        reader
    }

    /// Fetches `key` if it plausibly exists. Corrupted entries degrade to a
    /// miss.
    pub fn try_read(&self, key: &str) -> Option<CacheEntry> {
        let client = match self.cache {
            Some(ref c) => c,
            None => return None,
        };
        {
            let state = self.state.lock().unwrap();
            let fresh = state
                .last_update
                .map(|at| at.elapsed() < SNAPSHOT_STALENESS_LIMIT)
                .unwrap_or(false);
            if fresh && !state.filter.possibly_contains(key) {
                return None;
            }
        }

        let result = client.try_get_entry(
            TryGetEntryRequest {
                token: self.token.clone(),
                key: key.to_owned(),
            },
            Duration::from_secs(10), // The response can be large.
        );
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                match *e.kind() {
                    ErrorKind::NotFound => {}
                    _ => warn!("Failed to load cache: {}", e),
                }
                return None;
            }
        };
        match format::try_parse_cache_entry(&response.entry) {
            Ok(entry) => {
                trace!("Hit compilation cache entry [{}].", key);
                Some(entry)
            }
            Err(_) => {
                error!(
                    "Unexpected: Compilation cache entry [{}] is found but cannot be parsed.",
                    key
                );
                None
            }
        }
    }

    pub fn load_bloom_filter(&self) {
        let client = match self.cache {
            Some(ref c) => c,
            None => return,
        };
        let now = Instant::now();
        let (since_fetch, since_full) = {
            let state = self.state.lock().unwrap();
            match (state.last_update, state.last_full_update) {
                (Some(fetch), Some(full)) => {
                    (fetch.elapsed().as_secs(), full.elapsed().as_secs())
                }
                // Never succeeded: force a full snapshot.
                _ => (0x7fff_ffff, 0x7fff_ffff),
            }
        };

        let result = client.fetch_bloom_filter(
            FetchBloomFilterRequest {
                token: self.token.clone(),
                seconds_since_last_fetch: since_fetch,
                seconds_since_last_full_fetch: since_full,
            },
            Duration::from_secs(10), // Full snapshots are sizable.
        );
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "Failed to load compilation cache bloom filter from cache server: {}",
                    e
                );
                return;
            }
        };
        match response {
            FetchBloomFilterResponse::Incremental { newly_populated_keys } => {
                trace!(
                    "Fetched {} newly populated cache entry keys.",
                    newly_populated_keys.len()
                );
                let mut state = self.state.lock().unwrap();
                for key in &newly_populated_keys {
                    state.filter.add(key);
                }
                state.last_update = Some(now);
            }
            FetchBloomFilterResponse::Full { num_hashes, compressed_filter } => {
                let bytes = match zstd::decode_all(&compressed_filter[..]) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(
                            "Unexpected: Failed to decompress compilation cache bloom \
                             filter: {}",
                            e
                        );
                        return;
                    }
                };
                let filter = match SaltedBloomFilter::from_bytes(bytes, num_hashes) {
                    Ok(f) => f,
                    Err(_) => {
                        error!("Unexpected: Invalid bloom filter.");
                        return;
                    }
                };
                let mut state = self.state.lock().unwrap();
                state.filter = filter;
                state.last_update = Some(now);
                state.last_full_update = Some(now);
            }
        }
    }

    /// True if the local snapshot asserts the key cannot be cached. Used by
    /// tests; the dispatcher goes through `try_read`.
    pub fn certainly_missing(&self, key: &str) -> bool {
        let state = self.state.lock().unwrap();
        let fresh = state
            .last_update
            .map(|at| at.elapsed() < SNAPSHOT_STALENESS_LIMIT)
            .unwrap_or(false);
        fresh && !state.filter.possibly_contains(key)
    }

    pub fn stop(&self) {
        if let Some(ref timer) = *self.timer.lock().unwrap() {
            timer.stop();
        }
    }

    pub fn join(&self) {
        if let Some(ref mut timer) = *self.timer.lock().unwrap() {
            timer.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cache::disk;
    use cache::server::{CacheService, CacheServiceOptions};
    use config::MisplacedEntryAction;
    use protocol::PutEntryRequest;
    use rpc::Server;
    use tempdir::TempDir;

    fn start_cache(tmp: &TempDir) -> (Server, CacheClient) {
        let service = Arc::new(
            CacheService::new(CacheServiceOptions {
                engine: "disk".to_owned(),
                disk: disk::Options::new(
                    vec![(tmp.path().to_string_lossy().into_owned(), 1 << 20)],
                    MisplacedEntryAction::Delete,
                ),
                max_in_memory_cache_size: 1 << 20,
                user_tokens: vec!["token".to_owned()],
                servant_tokens: vec!["token".to_owned()],
            })
            .unwrap(),
        );
        let server = Server::start("127.0.0.1:0", service.clone()).unwrap();
        let client = CacheClient::new(&server.location());
        (server, client)
    }

    #[test]
    fn test_read_through_bloom_filter() {
        let tmp = TempDir::new("cache-reader").unwrap();
        let (_server, client) = start_cache(&tmp);

        let entry = format::CacheEntry {
            exit_code: 0,
            standard_output: "ok".to_owned(),
            ..Default::default()
        };
        client
            .put_entry(
                PutEntryRequest {
                    token: "token".to_owned(),
                    key: "present".to_owned(),
                    entry: format::write_cache_entry(&entry).unwrap(),
                },
                Duration::from_secs(5),
            )
            .unwrap();

        let reader = DistributedCacheReader::new(Some(client), "token".to_owned());
        // The initial full snapshot predates the put or includes it; either
        // way an incremental reload catches up.
        reader.load_bloom_filter();
        assert!(!reader.certainly_missing("present"));
        assert!(reader.certainly_missing("definitely-absent"));

        let got = reader.try_read("present").unwrap();
        assert_eq!(got.standard_output, "ok");
        assert!(reader.try_read("definitely-absent").is_none());
        reader.stop();
        reader.join();
    }

    #[test]
    fn test_disabled_cache_reads_nothing() {
        let reader = DistributedCacheReader::new(None, "token".to_owned());
        assert!(reader.try_read("anything").is_none());
    }
}
