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

//! Sharded content-addressed on-disk store. Keys map to one of the
//! configured shard directories via a weighted consistent-hash ring, then
//! down a fixed-depth fan-out of numbered subdirectories so no directory
//! holds an unbounded number of files. File names are the percent-encoded
//! keys; payloads are sealed with an integrity header (`cache::format`).

use filetime::FileTime;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use cache::format;
use config::MisplacedEntryAction;
use consistent_hash::ConsistentHash;
use errors::*;
use serde_json;
use util;

/// Stop purging once a shard is back under this share of its budget.
const DISCARD_THRESHOLD: f64 = 0.95;

// One ring weight unit per 128 MiB of shard budget.
const WEIGHT_PER_DIR_SHIFT: u32 = 7;

const MAX_MARSHALLED_KEY: usize = 255; // NAME_MAX.

#[derive(Clone)]
pub struct Options {
    /// `(path, byte budget)` per shard.
    pub shards: Vec<(String, u64)>,
    pub sub_dir_level: usize,
    pub sub_dirs: usize,
    pub action_on_misplaced_entry: MisplacedEntryAction,
}

impl Options {
    pub fn new(shards: Vec<(String, u64)>, action: MisplacedEntryAction) -> Options {
        Options {
            shards,
            sub_dir_level: 2,
            sub_dirs: 16,
            action_on_misplaced_entry: action,
        }
    }
}

struct EntryDesc {
    // Guards the file's bytes. Readers take it shared, the writer exclusive.
    file_lock: RwLock<()>,
    file_size: AtomicU64,
    last_accessed: Mutex<SystemTime>,
}

impl EntryDesc {
    fn new(file_size: u64, last_accessed: SystemTime) -> EntryDesc {
        EntryDesc {
            file_lock: RwLock::new(()),
            file_size: AtomicU64::new(file_size),
            last_accessed: Mutex::new(last_accessed),
        }
    }
}

// Entry map of one leaf directory. The map's own RwLock doubles as the
// per-directory lock.
type DirEntries = RwLock<HashMap<String, Arc<EntryDesc>>>;

pub struct DiskCache {
    options: Options,
    ring: ConsistentHash,
    // Leaf directory -> its entries. The key set is fixed at startup.
    entries_per_dir: HashMap<String, DirEntries>,
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    overwrites: AtomicU64,
}

struct FileInfo {
    path: String,
    size: u64,
    last_used: SystemTime,
}

fn marshal_key(key: &str) -> String {
    // Percent-encoded is safe to use as a file name; a hostile key cannot
    // escape the workspace.
    utf8_percent_encode(key, NON_ALPHANUMERIC).to_string()
}

fn key_from_path(path: &str) -> Option<String> {
    let name = path.rsplitn(2, '/').next()?;
    percent_decode_str(name).decode_utf8().ok().map(|c| c.into_owned())
}

fn dir_of(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[..pos].to_owned(),
        None => String::new(),
    }
}

impl DiskCache {
    pub fn new(options: Options) -> Result<DiskCache> {
        let mut weighted = Vec::new();
        for &(ref path, size) in &options.shards {
            let weight = ::std::cmp::max(1, (size >> 20) >> WEIGHT_PER_DIR_SHIFT);
            weighted.push((path.clone(), weight));
        }
        let mut cache = DiskCache {
            ring: ConsistentHash::new(weighted),
            entries_per_dir: HashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            overwrites: AtomicU64::new(0),
            options,
        };
        for i in 0..cache.options.shards.len() {
            let shard = cache.options.shards[i].0.clone();
            cache.initialize_workspace_at(&shard)?;
        }
        cache.reconcile()?;
        Ok(cache)
    }

    // Eagerly creates the whole directory tree of one shard and registers
    // its leaf directories.
    fn initialize_workspace_at(&mut self, shard: &str) -> Result<()> {
        let mut dirs = vec![shard.to_owned()];
        for level in 0..self.options.sub_dir_level {
            let mut next = Vec::new();
            for dir in &dirs {
                for i in 0..self.options.sub_dirs {
                    let sub = format!("{}/{}", dir, i);
                    if level + 1 == self.options.sub_dir_level {
                        self.entries_per_dir
                            .insert(sub.clone(), RwLock::new(HashMap::new()));
                    }
                    next.push(sub);
                }
            }
            dirs = next;
        }
        for dir in &dirs {
            fs::create_dir_all(dir)
                .chain_err(|| format!("failed to create cache directory [{}]", dir))?;
        }
        Ok(())
    }

    // Walks what's already on disk, moves / deletes / ignores entries the
    // current shard set would place elsewhere, and loads per-entry metadata.
    fn reconcile(&mut self) -> Result<()> {
        for i in 0..self.options.shards.len() {
            let shard = self.options.shards[i].0.clone();
            for file in self.enumerate_entries(&shard)? {
                let key = match key_from_path(&file.path) {
                    Some(k) => k,
                    None => {
                        warn!("Found invalid cache file at [{}]", file.path);
                        continue;
                    }
                };
                let expected = match self.try_get_path_of_key(&key) {
                    Some(p) => p,
                    None => {
                        warn!("Found unplaceable cache file at [{}]", file.path);
                        continue;
                    }
                };
                let mut dir = dir_of(&file.path);
                let expected_dir = dir_of(&expected);
                if dir != expected_dir {
                    match self.options.action_on_misplaced_entry {
                        MisplacedEntryAction::Move => {
                            fs::rename(&file.path, &expected)
                                .chain_err(|| format!("failed to move [{}]", file.path))?;
                            dir = expected_dir;
                        }
                        MisplacedEntryAction::Delete => {
                            fs::remove_file(&file.path)
                                .chain_err(|| format!("failed to remove [{}]", file.path))?;
                            continue;
                        }
                        MisplacedEntryAction::Ignore => continue,
                    }
                }
                let mut entries = self.entries_per_dir[&dir].write().unwrap();
                entries.insert(key, Arc::new(EntryDesc::new(file.size, file.last_used)));
            }
        }
        Ok(())
    }

    /// All keys currently known, across shards.
    pub fn get_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for entries in self.entries_per_dir.values() {
            let entries = entries.read().unwrap();
            keys.extend(entries.keys().cloned());
        }
        keys
    }

    /// Reads the entry, bumps its recency, verifies integrity. Any I/O or
    /// verification failure degrades to a miss.
    pub fn try_get(&self, key: &str) -> Option<Vec<u8>> {
        let path = match self.try_get_path_of_key(key) {
            Some(p) => p,
            None => {
                warn!("Failed to map key [{}] to a file path.", key);
                return None;
            }
        };
        let dir = dir_of(&path);
        let entry = {
            let entries = self.entries_per_dir.get(&dir)?.read().unwrap();
            match entries.get(key) {
                Some(e) => e.clone(),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        let _file_guard = entry.file_lock.read().unwrap();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to read cache entry at [{}]: {}", path, e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        // Freshen `mtime`; purge evicts oldest-mtime first. atime stays
        // untouched.
        if let Err(e) =
            ::filetime::set_file_mtime(&path, FileTime::from_system_time(SystemTime::now()))
        {
            warn!("Failed to update mtime of [{}]: {}", path, e);
        }
        *entry.last_accessed.lock().unwrap() = SystemTime::now();

        match format::verify_and_strip_header(&bytes) {
            Ok(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(payload.to_vec())
            }
            Err(_) => {
                // Keep the broken file around; the next Put overwrites it.
                warn!("Found corrupted cache entry at [{}].", path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `payload` (inner form; the integrity header is added here).
    /// Overwrites are expected and counted.
    pub fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
        let path = match self.try_get_path_of_key(key) {
            Some(p) => p,
            None => {
                warn!("Failed to map key [{}] to a file path.", key);
                bail!(ErrorKind::InvalidArgument(format!("unusable key [{}]", key)));
            }
        };
        let dir = dir_of(&path);
        let shard = self
            .entries_per_dir
            .get(&dir)
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("no shard for [{}]", dir)))?;

        let mut entries = shard.write().unwrap();
        if entries.contains_key(key) {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
        } else {
            entries.insert(
                key.to_owned(),
                Arc::new(EntryDesc::new(0, SystemTime::now())),
            );
        }
        let entry = entries[key].clone();
        let _file_guard = entry.file_lock.write().unwrap();

        let sealed = format::seal_entry(payload);
        let written = fs::File::create(&path).and_then(|mut f| f.write_all(&sealed));
        if let Err(e) = written {
            // Without the record we'd never get a chance to clean it up.
            warn!("Failed to write cache entry [{}]: {}", path, e);
            entries.remove(key);
            bail!(ErrorKind::Transport(format!("cache write failed: {}", e)));
        }
        entry
            .file_size
            .store(sealed.len() as u64, Ordering::Relaxed);
        *entry.last_accessed.lock().unwrap() = SystemTime::now();
        self.fills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Brings every shard back under `DISCARD_THRESHOLD` of its budget,
    /// oldest `mtime` first.
    pub fn purge(&self) {
        for i in 0..self.options.shards.len() {
            let (shard, limit) = self.options.shards[i].clone();
            if let Err(e) = self.purge_cache_at(&shard, limit) {
                warn!("Failed to purge shard [{}]: {}", shard, e);
            }
        }
    }

    fn purge_cache_at(&self, shard: &str, limit: u64) -> Result<Vec<String>> {
        let mut files = self.enumerate_entries(shard)?;
        files.sort_by_key(|f| f.last_used);
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        let threshold = (limit as f64 * DISCARD_THRESHOLD) as u64;

        let mut purged = Vec::new();
        for file in files {
            if total < threshold {
                break;
            }
            total -= file.size;
            let dir = dir_of(&file.path);
            if let Some(key) = key_from_path(&file.path) {
                if let Some(entries) = self.entries_per_dir.get(&dir) {
                    let mut entries = entries.write().unwrap();
                    if entries.remove(&key).is_some() {
                        fs::remove_file(&file.path)
                            .chain_err(|| format!("failed to remove [{}]", file.path))?;
                        purged.push(key);
                        continue;
                    }
                }
            } else {
                warn!("Unrecognized file name pattern: {}", file.path);
            }
            // No valid key decodes from the name; delete it blindly.
            fs::remove_file(&file.path)
                .chain_err(|| format!("failed to remove [{}]", file.path))?;
        }
        Ok(purged)
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let mut per_shard = serde_json::Map::new();
        let mut total_entries = 0usize;
        for &(ref shard, budget) in &self.options.shards {
            let mut entries_here = 0usize;
            let mut bytes_here = 0u64;
            for (dir, entries) in &self.entries_per_dir {
                if !dir.starts_with(shard.as_str()) {
                    continue;
                }
                let entries = entries.read().unwrap();
                entries_here += entries.len();
                bytes_here += entries
                    .values()
                    .map(|e| e.file_size.load(Ordering::Relaxed))
                    .sum::<u64>();
            }
            total_entries += entries_here;
            per_shard.insert(
                shard.clone(),
                json!({
                    "capacity_in_bytes": budget,
                    "entries": entries_here,
                    "used_in_bytes": bytes_here,
                }),
            );
        }
        json!({
            "statistics": {
                "hits": self.hits.load(Ordering::Relaxed),
                "misses": self.misses.load(Ordering::Relaxed),
                "fills": self.fills.load(Ordering::Relaxed),
                "overwrites": self.overwrites.load(Ordering::Relaxed),
            },
            "partitions": per_shard,
            "total_entries": total_entries,
        })
    }

    /// On-disk bytes of one shard; exposed for tests and the purge loop.
    pub fn shard_bytes_on_disk(&self, shard: &str) -> Result<u64> {
        Ok(self.enumerate_entries(shard)?.iter().map(|f| f.size).sum())
    }

    fn try_get_path_of_key(&self, key: &str) -> Option<String> {
        let marshalled = marshal_key(key);
        if marshalled.len() > MAX_MARSHALLED_KEY {
            warn!("Unexpected key [{}].", key);
            return None;
        }
        let mut hash = util::placement_hash(key.as_bytes());
        let shard = self.ring.get_node(hash).to_owned();
        let mut path = shard;
        for _ in 0..self.options.sub_dir_level {
            path = format!("{}/{}", path, hash % self.options.sub_dirs as u64);
            hash /= self.options.sub_dirs as u64;
        }
        Some(format!("{}/{}", path, marshalled))
    }

    // Walks one shard's tree, removing anything that does not belong
    // (files at non-leaf levels, directories at the leaf level), and returns
    // metadata of every entry file found.
    fn enumerate_entries(&self, shard: &str) -> Result<Vec<FileInfo>> {
        let leaf_level = self.options.sub_dir_level;
        let mut dirs = vec![shard.to_owned()];
        for level in 0..leaf_level {
            let mut next = Vec::new();
            for dir in &dirs {
                for item in fs::read_dir(dir)
                    .chain_err(|| format!("failed to enumerate [{}]", dir))?
                {
                    let item = item?;
                    let path = format!("{}/{}", dir, item.file_name().to_string_lossy());
                    if item.file_type()?.is_dir() {
                        next.push(path);
                    } else {
                        warn!("Non-directory found at [{}] unexpectedly, removing.", path);
                        fs::remove_file(&path)?;
                    }
                }
            }
            let _ = level;
            dirs = next;
        }

        let mut files = Vec::new();
        for dir in &dirs {
            for item in
                fs::read_dir(dir).chain_err(|| format!("failed to enumerate [{}]", dir))?
            {
                let item = item?;
                let path = format!("{}/{}", dir, item.file_name().to_string_lossy());
                if item.file_type()?.is_dir() {
                    warn!("Directory found at [{}] unexpectedly, removing.", path);
                    fs::remove_dir_all(&path)?;
                    continue;
                }
                let metadata = item.metadata()?;
                files.push(FileInfo {
                    path,
                    size: metadata.len(),
                    last_used: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
                });
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;
    use tempdir::TempDir;

    fn options_for(dir: &Path, budget: u64) -> Options {
        let mut o = Options::new(
            vec![(dir.to_string_lossy().into_owned(), budget)],
            MisplacedEntryAction::Delete,
        );
        // Keep test trees small.
        o.sub_dir_level = 2;
        o.sub_dirs = 4;
        o
    }

    fn entry_bytes(tag: &str, size: usize) -> Vec<u8> {
        let entry = format::CacheEntry {
            exit_code: 0,
            standard_output: tag.to_owned(),
            standard_error: String::new(),
            extra_info: Default::default(),
            files: vec![(".o".to_owned(), vec![b'x'; size])],
        };
        format::write_cache_entry(&entry).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let tmp = TempDir::new("disk-cache").unwrap();
        let cache = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
        let payload = entry_bytes("hello", 128);
        cache.put("some-key", &payload).unwrap();
        assert_eq!(cache.try_get("some-key").unwrap(), payload);
        assert!(cache.try_get("other-key").is_none());
        assert_eq!(cache.get_keys(), vec!["some-key".to_owned()]);
    }

    #[test]
    fn test_overwrite_is_counted_not_fatal() {
        let tmp = TempDir::new("disk-cache").unwrap();
        let cache = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
        cache.put("k", &entry_bytes("one", 16)).unwrap();
        cache.put("k", &entry_bytes("two", 16)).unwrap();
        let parsed = format::try_parse_cache_entry(&cache.try_get("k").unwrap()).unwrap();
        assert_eq!(parsed.standard_output, "two");
        assert_eq!(cache.dump_internals()["statistics"]["overwrites"], 1);
    }

    #[test]
    fn test_corrupted_entry_reads_as_miss() {
        let tmp = TempDir::new("disk-cache").unwrap();
        let cache = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
        cache.put("victim", &entry_bytes("x", 64)).unwrap();

        // Flip one payload byte of the single file under the shard.
        let mut flipped = false;
        for file in cache.enumerate_entries(&tmp.path().to_string_lossy()).unwrap() {
            let mut bytes = fs::read(&file.path).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
            fs::write(&file.path, &bytes).unwrap();
            flipped = true;
        }
        assert!(flipped);
        assert!(cache.try_get("victim").is_none());
        // A put overwrites the broken file and heals the entry.
        cache.put("victim", &entry_bytes("x", 64)).unwrap();
        assert!(cache.try_get("victim").is_some());
    }

    #[test]
    fn test_purge_respects_budget() {
        let tmp = TempDir::new("disk-cache").unwrap();
        const BUDGET: u64 = 64 * 1024;
        let cache = DiskCache::new(options_for(tmp.path(), BUDGET)).unwrap();
        for i in 0..64 {
            cache
                .put(&format!("key-{}", i), &entry_bytes("fill", 4096))
                .unwrap();
        }
        cache.purge();
        let used = cache
            .shard_bytes_on_disk(&tmp.path().to_string_lossy())
            .unwrap();
        assert!(used <= BUDGET, "still {} bytes on disk", used);
        assert!(!cache.get_keys().is_empty());
    }

    #[test]
    fn test_reconciliation_survives_restart() {
        let tmp = TempDir::new("disk-cache").unwrap();
        let payload = entry_bytes("persisted", 32);
        {
            let cache = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
            cache.put("durable-key", &payload).unwrap();
        }
        let cache = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
        assert_eq!(cache.get_keys(), vec!["durable-key".to_owned()]);
        assert_eq!(cache.try_get("durable-key").unwrap(), payload);
    }

    #[test]
    fn test_reconciliation_removes_stray_items() {
        let tmp = TempDir::new("disk-cache").unwrap();
        {
            let _ = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
        }
        // A stray file at a non-leaf level and a stray directory at the leaf.
        fs::write(tmp.path().join("0/stray-file"), b"junk").unwrap();
        fs::create_dir(tmp.path().join("0/0/stray-dir")).unwrap();
        let cache = DiskCache::new(options_for(tmp.path(), 1 << 20)).unwrap();
        assert!(!tmp.path().join("0/stray-file").exists());
        assert!(!tmp.path().join("0/0/stray-dir").exists());
        assert!(cache.get_keys().is_empty());
    }
}
