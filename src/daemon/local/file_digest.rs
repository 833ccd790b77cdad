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

//! Remembers compiler digests by `(path, size, mtime)`. Hashing a compiler
//! binary is costly; the wrapper does it once and teaches us the result, so
//! subsequent submissions only need an `lstat`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json;

#[derive(Hash, PartialEq, Eq, Clone)]
struct FilePersonality {
    path: String,
    size: u64,
    timestamp: u64,
}

pub struct FileDigestCache {
    digests: Mutex<HashMap<FilePersonality, String>>,
}

impl FileDigestCache {
    pub fn new() -> FileDigestCache {
        FileDigestCache {
            digests: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_get(&self, path: &str, size: u64, timestamp: u64) -> Option<String> {
        self.digests
            .lock()
            .unwrap()
            .get(&FilePersonality {
                path: path.to_owned(),
                size,
                timestamp,
            })
            .cloned()
    }

    pub fn set(&self, path: String, size: u64, timestamp: u64, digest: String) {
        self.digests
            .lock()
            .unwrap()
            .insert(FilePersonality { path, size, timestamp }, digest);
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let digests = self.digests.lock().unwrap();
        let mut map = serde_json::Map::new();
        for (personality, digest) in digests.iter() {
            map.insert(
                personality.path.clone(),
                json!({
                    "size": personality.size,
                    "mtime": personality.timestamp,
                    "digest": digest,
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lookup_is_exact() {
        let cache = FileDigestCache::new();
        cache.set("/usr/bin/g++".to_owned(), 1234, 99, "digest-a".to_owned());
        assert_eq!(
            cache.try_get("/usr/bin/g++", 1234, 99),
            Some("digest-a".to_owned())
        );
        // A recompiled compiler (same path, new size/mtime) must not match.
        assert_eq!(cache.try_get("/usr/bin/g++", 1235, 99), None);
        assert_eq!(cache.try_get("/usr/bin/g++", 1234, 100), None);
        assert_eq!(cache.try_get("/usr/bin/gcc", 1234, 99), None);
    }
}
