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

//! Keeps a small stock of task grants per environment so that a task rarely
//! has to wait a full scheduler round trip before firing. One fetcher
//! thread per environment tops the stock up and prefetches one spare.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use protocol::{EnvironmentDesc, FreeTaskRequest, WaitForStartingTaskRequest};
use rpc::SchedulerClient;

const MAX_WAIT: Duration = Duration::from_secs(5);
/// Subtracted from the server-side lease to absorb network delay; a grant
/// that looks live locally must still be live at the scheduler.
const NETWORK_DELAY_TOLERANCE: Duration = Duration::from_secs(5);
const GRANT_EXPIRES_IN: Duration = Duration::from_secs(15);
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct GrantDesc {
    pub expires_at: Instant,
    pub grant_id: u64,
    pub servant_location: String,
}

struct PerEnvState {
    remaining: VecDeque<GrantDesc>,
    waiters: i64,
}

struct PerEnvKeeper {
    env_desc: EnvironmentDesc,
    state: Mutex<PerEnvState>,
    need_more_cv: Condvar,
    available_cv: Condvar,
    fetcher: Mutex<Option<thread::JoinHandle<()>>>,
}

pub struct TaskGrantKeeper {
    scheduler: SchedulerClient,
    token: String,
    version: u32,
    keepers: Mutex<HashMap<String, Arc<PerEnvKeeper>>>,
    leaving: Arc<AtomicBool>,
}

impl TaskGrantKeeper {
    pub fn new(scheduler: SchedulerClient, token: String, version: u32) -> TaskGrantKeeper {
        TaskGrantKeeper {
            scheduler,
            token,
            version,
            keepers: Mutex::new(HashMap::new()),
            leaving: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hands out a grant for `desc`, waiting up to `timeout` for the
    /// fetcher to produce one. Locally-expired grants are discarded.
    pub fn get(&self, desc: &EnvironmentDesc, timeout: Duration) -> Option<GrantDesc> {
        let keeper = self.keeper_for(desc);
        let mut state = keeper.state.lock().unwrap();

        // Expiry was already compensated for network delay on arrival.
        let now = Instant::now();
        while state
            .remaining
            .front()
            .map(|g| g.expires_at < now)
            .unwrap_or(false)
        {
            state.remaining.pop_front();
        }
        if let Some(grant) = state.remaining.pop_front() {
            return Some(grant);
        }

        state.waiters += 1;
        keeper.need_more_cv.notify_all();
        let deadline = Instant::now() + timeout;
        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let (guard, _) = keeper
                .available_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if let Some(grant) = state.remaining.pop_front() {
                break Some(grant);
            }
        };
        state.waiters -= 1;
        debug_assert!(state.waiters >= 0);
        result
    }

    /// Returns a grant to the scheduler, asynchronously; failure is benign
    /// (the grant would expire anyway).
    pub fn free(&self, grant_id: u64) {
        let scheduler = self.scheduler.clone();
        let token = self.token.clone();
        thread::spawn(move || {
            let result = scheduler.free_task(
                FreeTaskRequest {
                    token,
                    task_grant_ids: vec![grant_id],
                },
                Duration::from_secs(5),
            );
            if result.is_err() {
                warn!("Failed to free task grant [{}]. Ignoring.", grant_id);
            }
        });
    }

    pub fn stop(&self) {
        self.leaving.store(true, Ordering::Relaxed);
        let keepers = self.keepers.lock().unwrap();
        for keeper in keepers.values() {
            keeper.need_more_cv.notify_all();
        }
    }

    pub fn join(&self) {
        // No new keepers can appear once `stop()` has run.
        let keepers = self.keepers.lock().unwrap();
        for keeper in keepers.values() {
            if let Some(handle) = keeper.fetcher.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    fn keeper_for(&self, desc: &EnvironmentDesc) -> Arc<PerEnvKeeper> {
        let mut keepers = self.keepers.lock().unwrap();
        if let Some(keeper) = keepers.get(&desc.compiler_digest) {
            return keeper.clone();
        }
        let keeper = Arc::new(PerEnvKeeper {
            env_desc: desc.clone(),
            state: Mutex::new(PerEnvState {
                remaining: VecDeque::new(),
                waiters: 0,
            }),
            need_more_cv: Condvar::new(),
            available_cv: Condvar::new(),
            fetcher: Mutex::new(None),
        });
        let fetcher = GrantFetcher {
            scheduler: self.scheduler.clone(),
            token: self.token.clone(),
            version: self.version,
            leaving: self.leaving.clone(),
            keeper: keeper.clone(),
        };
        let digest_prefix =
            &desc.compiler_digest[..::std::cmp::min(8, desc.compiler_digest.len())];
        *keeper.fetcher.lock().unwrap() = Some(
            thread::Builder::new()
                .name(format!("grant-fetcher-{}", digest_prefix))
                .spawn(move || fetcher.run())
                .expect("failed to spawn grant fetcher"),
        );
        keepers.insert(desc.compiler_digest.clone(), keeper.clone());
        keeper
    }
}

struct GrantFetcher {
    scheduler: SchedulerClient,
    token: String,
    version: u32,
    leaving: Arc<AtomicBool>,
    keeper: Arc<PerEnvKeeper>,
}

impl GrantFetcher {
    fn run(&self) {
        // A grant must survive the fetch RPC plus network slack, otherwise
        // it could be dead on arrival.
        debug_assert!(GRANT_EXPIRES_IN > MAX_WAIT + NETWORK_DELAY_TOLERANCE);

        while !self.leaving.load(Ordering::Relaxed) {
            let waiters;
            {
                let mut state = self.keeper.state.lock().unwrap();
                while !self.leaving.load(Ordering::Relaxed) && !state.remaining.is_empty() {
                    state = self.keeper.need_more_cv.wait(state).unwrap();
                }
                if self.leaving.load(Ordering::Relaxed) {
                    break;
                }
                waiters = state.waiters;
            }

            // Conservative: expiry counts from before the RPC went out.
            let before_rpc = Instant::now();
            let result = self.scheduler.wait_for_starting_task(
                WaitForStartingTaskRequest {
                    token: self.token.clone(),
                    env_desc: self.keeper.env_desc.clone(),
                    immediate_reqs: waiters as u32,
                    prefetch_reqs: 1,
                    next_keep_alive_in_ms: GRANT_EXPIRES_IN.as_secs() * 1000,
                    milliseconds_to_wait: MAX_WAIT.as_secs() * 1000,
                    min_version: self.version,
                },
                MAX_WAIT + Duration::from_secs(5),
            );
            match result {
                Ok(response) => {
                    // The scheduler may satisfy only part of our request;
                    // take whatever came.
                    let mut state = self.keeper.state.lock().unwrap();
                    for grant in response.grants {
                        state.remaining.push_back(GrantDesc {
                            expires_at: before_rpc + GRANT_EXPIRES_IN - NETWORK_DELAY_TOLERANCE,
                            grant_id: grant.task_grant_id,
                            servant_location: grant.servant_location,
                        });
                    }
                    self.keeper.available_cv.notify_all();
                }
                Err(e) => {
                    match *e.kind() {
                        ::errors::ErrorKind::NoQuotaAvailable if waiters == 0 => {
                            trace!(
                                "Unable to prefetch grant for possible new-coming task. \
                                 The cloud is busy."
                            );
                        }
                        _ => {
                            warn!("Failed to acquire grant for starting new task: {}", e);
                        }
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use protocol::*;
    use rpc::Server;
    use scheduler::service::{SchedulerService, SchedulerServiceOptions};
    use std::sync::Arc;

    fn scheduler_with_servant() -> (Server, Arc<SchedulerService>, SchedulerClient) {
        let service = Arc::new(SchedulerService::new(SchedulerServiceOptions {
            daemon_tokens: vec!["daemon-token".to_owned()],
            min_daemon_version: 0,
            token_rollout_interval: Duration::from_secs(3600),
            min_memory_for_new_task: 1 << 30,
        }));
        let server = Server::start("127.0.0.1:0", service.clone()).unwrap();
        let client = SchedulerClient::new(&server.location());
        client
            .heartbeat(
                HeartbeatRequest {
                    token: "daemon-token".to_owned(),
                    version: 2,
                    location: "127.0.0.1:8336".to_owned(),
                    env_descs: vec![EnvironmentDesc::new("env-a")],
                    num_processors: 8,
                    current_load: 0,
                    total_memory_in_bytes: 32 << 30,
                    memory_available_in_bytes: 32 << 30,
                    priority: ServantPriority::User,
                    capacity: 4,
                    not_accepting_task_reason: NotAcceptingTaskReason::None,
                    running_tasks: vec![],
                    next_heartbeat_in_ms: 10_000,
                },
                Duration::from_secs(5),
            )
            .unwrap();
        (server, service, client)
    }

    #[test]
    fn test_get_and_prefetch() {
        let (_server, _service, client) = scheduler_with_servant();
        let keeper = TaskGrantKeeper::new(client, "daemon-token".to_owned(), 2);

        let grant = keeper
            .get(&EnvironmentDesc::new("env-a"), Duration::from_secs(10))
            .expect("no grant");
        assert_eq!(grant.servant_location, "127.0.0.1:8336");
        assert!(grant.expires_at > Instant::now());

        // The fetcher asked for one prefetch grant on top; a second get
        // should be satisfied quickly from stock (or by another fetch).
        let again = keeper.get(&EnvironmentDesc::new("env-a"), Duration::from_secs(10));
        assert!(again.is_some());

        keeper.free(grant.grant_id);
        keeper.stop();
        keeper.join();
    }

    #[test]
    fn test_unknown_environment_times_out() {
        let (_server, _service, client) = scheduler_with_servant();
        let keeper = TaskGrantKeeper::new(client, "daemon-token".to_owned(), 2);
        let grant = keeper.get(&EnvironmentDesc::new("no-such-env"), Duration::from_millis(300));
        assert!(grant.is_none());
        keeper.stop();
        keeper.join();
    }
}
