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

use blake3;
use libc;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use errors::*;

/// Incremental digest over multiple inputs. All content hashes in the system
/// (compiler binaries, preprocessed source, cache keys) go through this.
pub struct Digest {
    inner: blake3::Hasher,
}

impl Digest {
    pub fn new() -> Digest {
        Digest { inner: blake3::Hasher::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Finish and return the digest as lowercase hex.
    pub fn finish(self) -> String {
        self.inner.finalize().to_hex().to_string()
    }

    pub fn finish_raw(self) -> [u8; 32] {
        *self.inner.finalize().as_bytes()
    }

    /// Hex digest of a file's content.
    pub fn file<P: AsRef<Path>>(path: P) -> Result<String> {
        let mut f = File::open(path.as_ref())
            .chain_err(|| format!("failed to open {:?}", path.as_ref()))?;
        let mut digest = Digest::new();
        let mut buf = [0u8; 65536];
        loop {
            let count = f.read(&mut buf)?;
            if count == 0 {
                break;
            }
            digest.update(&buf[..count]);
        }
        Ok(digest.finish())
    }
}

/// One-shot raw blake3 of `bytes`.
pub fn blake3_of(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

pub fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// A cheap 64-bit hash for placement decisions (shard ring, subdirectory
/// fan-out). Derived from blake3 so one digest dependency covers everything.
pub fn placement_hash(bytes: &[u8]) -> u64 {
    let raw = blake3_of(bytes);
    let mut value = 0u64;
    for i in 0..8 {
        value |= (raw[i] as u64) << (i * 8);
    }
    value
}

/// Tests whether the given process still exists. Used both by the local task
/// monitor and the dispatcher's orphan sweep.
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 performs error checking only. EPERM still means "it exists".
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    ::std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// 1-minute load average, rounded to whole processors. Reported to the
/// scheduler so it can subtract foreign load from our capacity.
pub fn current_load() -> u64 {
    let mut contents = String::new();
    if File::open("/proc/loadavg")
        .and_then(|mut f| f.read_to_string(&mut contents))
        .is_err()
    {
        return 0;
    }
    contents
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|load| load.round() as u64)
        .unwrap_or(0)
}

/// `(total, available)` memory in bytes, from /proc/meminfo.
pub fn memory_stats() -> (u64, u64) {
    let mut contents = String::new();
    if File::open("/proc/meminfo")
        .and_then(|mut f| f.read_to_string(&mut contents))
        .is_err()
    {
        return (0, 0);
    }
    let mut total = 0;
    let mut available = 0;
    for line in contents.lines() {
        let field = match line.split(':').next() {
            Some(f) => f,
            None => continue,
        };
        let kib = line
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        match field {
            "MemTotal" => total = kib * 1024,
            "MemAvailable" => available = kib * 1024,
            _ => {}
        }
    }
    (total, available)
}

/// O(1) membership test over a fixed token list. Every RPC boundary checks
/// its caller against one of these.
pub struct TokenVerifier {
    recognized: HashSet<String>,
}

impl TokenVerifier {
    pub fn new(tokens: Vec<String>) -> TokenVerifier {
        let recognized: HashSet<String> = tokens.into_iter().collect();
        if recognized.contains("") {
            warn!(
                "POSSIBLE SECURITY BREACH. Empty token is allowed. This effectively disables \
                 token verification."
            );
        }
        if recognized.is_empty() {
            error!(
                "You should provide at least one recognized token, otherwise no one would be \
                 able to access this service."
            );
        }
        TokenVerifier { recognized }
    }

    pub fn verify(&self, token: &str) -> bool {
        self.recognized.contains(token)
    }
}

/// One-shot completion signal: waiters block until `count_down` fires.
pub struct Latch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Latch {
        Latch {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap()
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = ::std::time::Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();
        while !*done {
            let now = ::std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
        true
    }
}

/// A background thread invoking a callback on a fixed cadence, stoppable.
/// All periodic housekeeping (expiration GC, cache purge, keep-alives)
/// runs on these.
pub struct PeriodicTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn spawn<F>(name: &str, interval: Duration, mut callback: F) -> PeriodicTimer
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop2 = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let (ref lock, ref cv) = *stop2;
                loop {
                    {
                        let mut stopped = lock.lock().unwrap();
                        let mut remaining = interval;
                        // Re-arm the wait against spurious wakeups.
                        while !*stopped {
                            let start = ::std::time::Instant::now();
                            let (guard, timeout) = cv.wait_timeout(stopped, remaining).unwrap();
                            stopped = guard;
                            if timeout.timed_out() {
                                break;
                            }
                            let elapsed = start.elapsed();
                            if elapsed >= remaining {
                                break;
                            }
                            remaining -= elapsed;
                        }
                        if *stopped {
                            return;
                        }
                    }
                    callback();
                }
            })
            .expect("failed to spawn timer thread");
        PeriodicTimer { stop, handle: Some(handle) }
    }

    pub fn stop(&self) {
        let (ref lock, ref cv) = *self.stop;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Wall-clock timestamp for the debugging dumps.
pub fn format_time(t: SystemTime) -> String {
    let dt: ::chrono::DateTime<::chrono::Local> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digest_multi_update_matches_one_shot() {
        let mut d = Digest::new();
        d.update(b"hello ");
        d.update(b"world");
        assert_eq!(d.finish(), hex(&blake3_of(b"hello world")));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_placement_hash_is_stable() {
        assert_eq!(placement_hash(b"key"), placement_hash(b"key"));
        assert_ne!(placement_hash(b"key"), placement_hash(b"yek"));
    }

    #[test]
    fn test_token_verifier() {
        let verifier = TokenVerifier::new(vec!["a".to_owned(), "b".to_owned()]);
        assert!(verifier.verify("a"));
        assert!(verifier.verify("b"));
        assert!(!verifier.verify("c"));
        assert!(!verifier.verify(""));
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_process_alive(::std::process::id()));
        // PID numbers wrap well below 2^31; this one can't exist.
        assert!(!is_process_alive(0x7fff_fff0));
    }
}
