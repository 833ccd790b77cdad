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

pub mod disk;
pub mod format;
pub mod memory;
pub mod server;

use errors::*;
use serde_json;

/// Capability set of a second-level cache engine. The disk engine is the
/// only one today; the cache server is written against this seam.
pub trait CacheEngine: Send + Sync {
    fn get_keys(&self) -> Vec<String>;
    fn try_get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, payload: &[u8]);
    fn purge(&self);
    fn dump_internals(&self) -> serde_json::Value;
}

impl CacheEngine for disk::DiskCache {
    fn get_keys(&self) -> Vec<String> {
        disk::DiskCache::get_keys(self)
    }

    fn try_get(&self, key: &str) -> Option<Vec<u8>> {
        disk::DiskCache::try_get(self, key)
    }

    fn put(&self, key: &str, payload: &[u8]) {
        // Write failures are logged and counted by the engine; callers don't
        // retry them.
        let _ = disk::DiskCache::put(self, key, payload);
    }

    fn purge(&self) {
        disk::DiskCache::purge(self)
    }

    fn dump_internals(&self) -> serde_json::Value {
        disk::DiskCache::dump_internals(self)
    }
}

/// Instantiates the engine named by the configuration string.
pub fn make_cache_engine(name: &str, options: disk::Options) -> Result<Box<CacheEngine>> {
    match name {
        "disk" => Ok(Box::new(disk::DiskCache::new(options)?)),
        _ => bail!(ErrorKind::InvalidArgument(format!(
            "unknown cache engine [{}]",
            name
        ))),
    }
}
