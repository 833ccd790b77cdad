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

//! Fills the distributed cache with fresh compilation results, off the
//! critical path. The requestor already has its answer by the time the
//! entry lands.

use futures::Future;
use futures_cpupool::CpuPool;
use std::time::Duration;

use cache::format::{self, CacheEntry};
use protocol::PutEntryRequest;
use rpc::CacheClient;

pub struct DistributedCacheWriter {
    cache: Option<CacheClient>,
    token: String,
    pool: CpuPool,
}

impl DistributedCacheWriter {
    pub fn new(cache: Option<CacheClient>, token: String) -> DistributedCacheWriter {
        DistributedCacheWriter {
            cache,
            token,
            pool: CpuPool::new(2),
        }
    }

    /// Serializes and uploads asynchronously; failures are logged and
    /// otherwise ignored (the cache is best-effort by nature).
    pub fn write(&self, key: String, entry: CacheEntry) {
        let client = match self.cache {
            Some(ref c) => c.clone(),
            None => return,
        };
        let token = self.token.clone();
        self.pool
            .spawn_fn(move || -> ::std::result::Result<(), ()> {
                let bytes = match format::write_cache_entry(&entry) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("Failed to serialize cache entry [{}]: {}", key, e);
                        return Ok(());
                    }
                };
                let result = client.put_entry(
                    PutEntryRequest { token, key: key.clone(), entry: bytes },
                    Duration::from_secs(10),
                );
                if let Err(e) = result {
                    warn!("Failed to fill cache entry [{}]: {}", key, e);
                }
                Ok(())
            })
            .forget();
    }

    /// Blocks until previously queued writes drain. Shutdown only.
    pub fn join(&self) {
        let _ = self
            .pool
            .spawn_fn(|| -> ::std::result::Result<(), ()> { Ok(()) })
            .wait();
    }
}
