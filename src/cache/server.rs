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

//! The cache service: an ARC front over a (disk) cache engine, plus the
//! Bloom-filter endpoints that let requestors skip certain misses without a
//! round trip.

use rand::{self, Rng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use zstd;

use bloom::BloomFilterGenerator;
use cache::memory::InMemoryCache;
use cache::{disk, make_cache_engine, CacheEngine};
use errors::*;
use protocol::*;
use rpc;
use serde_json;
use util::{PeriodicTimer, TokenVerifier};

/// Base interval between full Bloom-filter fetches of one client.
const BF_FULL_FETCH_BASE: Duration = Duration::from_secs(600);
const BF_MAX_PER_CLIENT_BIAS_SECS: u64 = 120;
const BF_MAX_RANDOM_DELAY_SECS: u64 = 120;

/// Covers keys in flight between the client's fetch and our answer.
const BF_NETWORK_DELAY_COMPENSATION: Duration = Duration::from_secs(5);

/// Covers keys inserted while the rebuild enumerates live keys.
const BF_REBUILD_COMPENSATION: Duration = Duration::from_secs(10);

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const BF_REBUILD_INTERVAL: Duration = Duration::from_secs(60);

pub struct CacheServiceOptions {
    pub engine: String,
    pub disk: disk::Options,
    pub max_in_memory_cache_size: u64,
    pub user_tokens: Vec<String>,
    pub servant_tokens: Vec<String>,
}

pub struct CacheService {
    user_verifier: TokenVerifier,
    servant_verifier: TokenVerifier,
    in_memory_cache: InMemoryCache,
    engine: Box<CacheEngine>,
    bf_gen: BloomFilterGenerator,
    hits: AtomicU64,
    misses: AtomicU64,
    timers: Mutex<Vec<PeriodicTimer>>,
}

impl CacheService {
    pub fn new(options: CacheServiceOptions) -> Result<CacheService> {
        let engine = make_cache_engine(&options.engine, options.disk)?;
        let service = CacheService {
            user_verifier: TokenVerifier::new(options.user_tokens),
            servant_verifier: TokenVerifier::new(options.servant_tokens),
            in_memory_cache: InMemoryCache::new(options.max_in_memory_cache_size as usize),
            engine,
            bf_gen: BloomFilterGenerator::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timers: Mutex::new(Vec::new()),
        };
        // The filter must be ready before the first client asks.
        service.bf_gen.rebuild(&service.get_keys(), Duration::from_secs(0));
        Ok(service)
    }

    /// Starts the background timers. `self` is shared with them.
    pub fn start(service: &::std::sync::Arc<CacheService>) {
        let mut timers = service.timers.lock().unwrap();
        let s = service.clone();
        timers.push(PeriodicTimer::spawn("cache-purge", PURGE_INTERVAL, move || {
            s.engine.purge();
        }));
        let s = service.clone();
        timers.push(PeriodicTimer::spawn(
            "bf-rebuild",
            BF_REBUILD_INTERVAL,
            move || {
                let keys = s.get_keys();
                s.bf_gen.rebuild(&keys, BF_REBUILD_COMPENSATION);
            },
        ));
    }

    pub fn stop(&self) {
        for timer in self.timers.lock().unwrap().iter() {
            timer.stop();
        }
    }

    pub fn join(&self) {
        for timer in self.timers.lock().unwrap().iter_mut() {
            timer.join();
        }
    }

    fn get_keys(&self) -> Vec<String> {
        // Duplicates between the layers don't matter; the filter tolerates
        // repeated insertion.
        let mut keys = self.in_memory_cache.get_keys();
        keys.extend(self.engine.get_keys());
        keys
    }

    fn try_get_entry(&self, request: TryGetEntryRequest) -> Result<TryGetEntryResponse> {
        if !self.user_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        let mut bytes = self.in_memory_cache.try_get(&request.key);
        if bytes.is_none() {
            bytes = self.engine.try_get(&request.key); // Try L2 then.
        }
        let bytes = match bytes {
            Some(b) => b,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                bail!(ErrorKind::NotFound);
            }
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        // Warm the front regardless of which layer answered.
        self.in_memory_cache.put(&request.key, &bytes);
        Ok(TryGetEntryResponse { entry: bytes })
    }

    fn put_entry(&self, request: PutEntryRequest) -> Result<PutEntryResponse> {
        if !self.servant_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        // For better auditability.
        info!(
            "Filled cache entry [{}] with {} bytes.",
            request.key,
            request.entry.len()
        );
        self.engine.put(&request.key, &request.entry);
        self.in_memory_cache.put(&request.key, &request.entry);
        self.bf_gen.add(&request.key);
        Ok(PutEntryResponse {})
    }

    fn fetch_bloom_filter(
        &self,
        peer: SocketAddr,
        request: FetchBloomFilterRequest,
    ) -> Result<FetchBloomFilterResponse> {
        if !self.user_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        if request.seconds_since_last_fetch > request.seconds_since_last_full_fetch {
            bail!(ErrorKind::InvalidArgument(
                "last full fetch predates last fetch".into()
            ));
        }

        // Full snapshots are bandwidth-heavy, so each client gets a slightly
        // different refresh interval and full fetches spread out over time.
        let interval = bf_full_fetch_interval_for(&peer);
        if Duration::from_secs(request.seconds_since_last_full_fetch) < interval {
            let window = Duration::from_secs(request.seconds_since_last_fetch)
                + BF_NETWORK_DELAY_COMPENSATION;
            Ok(FetchBloomFilterResponse::Incremental {
                newly_populated_keys: self.bf_gen.get_newly_populated_keys(window),
            })
        } else {
            let (bytes, num_hashes) = self.bf_gen.snapshot();
            let compressed = zstd::encode_all(&bytes[..], 0)
                .chain_err(|| "failed to compress bloom filter")?;
            Ok(FetchBloomFilterResponse::Full {
                num_hashes,
                compressed_filter: compressed,
            })
        }
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        json!({
            "l1": self.in_memory_cache.dump_internals(),
            "l2": self.engine.dump_internals(),
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
        })
    }
}

fn bf_full_fetch_interval_for(peer: &SocketAddr) -> Duration {
    let mut hasher = DefaultHasher::new();
    peer.ip().hash(&mut hasher);
    let per_client_bias = hasher.finish() % BF_MAX_PER_CLIENT_BIAS_SECS;
    let random_delay = rand::thread_rng().gen_range(0, BF_MAX_RANDOM_DELAY_SECS);
    BF_FULL_FETCH_BASE + Duration::from_secs(per_client_bias + random_delay)
}

impl rpc::Service for CacheService {
    type Request = CacheRequest;
    type Response = CacheResponse;

    fn handle(&self, peer: SocketAddr, request: CacheRequest) -> Result<CacheResponse> {
        match request {
            CacheRequest::TryGetEntry(r) => {
                Ok(CacheResponse::TryGetEntry(self.try_get_entry(r)?))
            }
            CacheRequest::PutEntry(r) => Ok(CacheResponse::PutEntry(self.put_entry(r)?)),
            CacheRequest::FetchBloomFilter(r) => Ok(CacheResponse::FetchBloomFilter(
                self.fetch_bloom_filter(peer, r)?,
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bloom::SaltedBloomFilter;
    use config::MisplacedEntryAction;
    use rpc::{CacheClient, Server};
    use std::sync::Arc;
    use tempdir::TempDir;

    fn start_cache_server(tmp: &TempDir) -> (Server, CacheClient, Arc<CacheService>) {
        let service = Arc::new(
            CacheService::new(CacheServiceOptions {
                engine: "disk".to_owned(),
                disk: disk::Options::new(
                    vec![(tmp.path().to_string_lossy().into_owned(), 1 << 20)],
                    MisplacedEntryAction::Delete,
                ),
                max_in_memory_cache_size: 1 << 20,
                user_tokens: vec!["user-token".to_owned()],
                servant_tokens: vec!["servant-token".to_owned()],
            })
            .unwrap(),
        );
        let server = Server::start("127.0.0.1:0", service.clone()).unwrap();
        let client = CacheClient::new(&server.location());
        (server, client, service)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_get_put_round_trip_over_rpc() {
        let tmp = TempDir::new("cache-server").unwrap();
        let (_server, client, _service) = start_cache_server(&tmp);

        let miss = client.try_get_entry(
            TryGetEntryRequest {
                token: "user-token".to_owned(),
                key: "k1".to_owned(),
            },
            TIMEOUT,
        );
        match *miss.unwrap_err().kind() {
            ErrorKind::NotFound => {}
            ref e => panic!("unexpected error: {:?}", e),
        }

        client
            .put_entry(
                PutEntryRequest {
                    token: "servant-token".to_owned(),
                    key: "k1".to_owned(),
                    entry: b"entry bytes".to_vec(),
                },
                TIMEOUT,
            )
            .unwrap();
        let hit = client
            .try_get_entry(
                TryGetEntryRequest {
                    token: "user-token".to_owned(),
                    key: "k1".to_owned(),
                },
                TIMEOUT,
            )
            .unwrap();
        assert_eq!(hit.entry, b"entry bytes");
    }

    #[test]
    fn test_token_separation() {
        let tmp = TempDir::new("cache-server").unwrap();
        let (_server, client, _service) = start_cache_server(&tmp);

        // A user token cannot fill the cache...
        let denied = client.put_entry(
            PutEntryRequest {
                token: "user-token".to_owned(),
                key: "k".to_owned(),
                entry: vec![1],
            },
            TIMEOUT,
        );
        match *denied.unwrap_err().kind() {
            ErrorKind::AccessDenied => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
        // ...and a servant token cannot read it.
        let denied = client.try_get_entry(
            TryGetEntryRequest {
                token: "servant-token".to_owned(),
                key: "k".to_owned(),
            },
            TIMEOUT,
        );
        match *denied.unwrap_err().kind() {
            ErrorKind::AccessDenied => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_bloom_filter_full_then_incremental() {
        let tmp = TempDir::new("cache-server").unwrap();
        let (_server, client, _service) = start_cache_server(&tmp);

        client
            .put_entry(
                PutEntryRequest {
                    token: "servant-token".to_owned(),
                    key: "a".to_owned(),
                    entry: vec![1],
                },
                TIMEOUT,
            )
            .unwrap();

        // Way past any staggered interval: must be a full snapshot.
        let full = client
            .fetch_bloom_filter(
                FetchBloomFilterRequest {
                    token: "user-token".to_owned(),
                    seconds_since_last_fetch: 0x7fff_ffff,
                    seconds_since_last_full_fetch: 0x7fff_ffff,
                },
                TIMEOUT,
            )
            .unwrap();
        let filter = match full {
            FetchBloomFilterResponse::Full { num_hashes, compressed_filter } => {
                let bytes = zstd::decode_all(&compressed_filter[..]).unwrap();
                SaltedBloomFilter::from_bytes(bytes, num_hashes).unwrap()
            }
            _ => panic!("expected a full snapshot"),
        };
        assert!(filter.possibly_contains("a"));
        assert!(!filter.possibly_contains("d"));

        // A new key lands; a fresh client fetch gets it incrementally.
        client
            .put_entry(
                PutEntryRequest {
                    token: "servant-token".to_owned(),
                    key: "d".to_owned(),
                    entry: vec![2],
                },
                TIMEOUT,
            )
            .unwrap();
        let incremental = client
            .fetch_bloom_filter(
                FetchBloomFilterRequest {
                    token: "user-token".to_owned(),
                    seconds_since_last_fetch: 1,
                    seconds_since_last_full_fetch: 1,
                },
                TIMEOUT,
            )
            .unwrap();
        match incremental {
            FetchBloomFilterResponse::Incremental { newly_populated_keys } => {
                assert!(newly_populated_keys.contains(&"d".to_owned()));
            }
            _ => panic!("expected an incremental response"),
        }
    }

    #[test]
    fn test_bloom_filter_fetch_validates_arguments() {
        let tmp = TempDir::new("cache-server").unwrap();
        let (_server, client, _service) = start_cache_server(&tmp);
        let result = client.fetch_bloom_filter(
            FetchBloomFilterRequest {
                token: "user-token".to_owned(),
                seconds_since_last_fetch: 100,
                seconds_since_last_full_fetch: 50,
            },
            TIMEOUT,
        );
        match *result.unwrap_err().kind() {
            ErrorKind::InvalidArgument(_) => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }
}
