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

//! Requestor-side delegate: accepts local tasks and sees them through the
//! cloud. Per task: probe the cache, piggyback on an identical in-flight
//! compile if there is one, otherwise acquire a grant, submit to the
//! granted servant and babysit the task until it completes.

pub mod cache_reader;
pub mod config_keeper;
pub mod file_digest;
pub mod grant_keeper;
pub mod http;
pub mod running_keeper;
pub mod task;
pub mod task_monitor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use self::cache_reader::DistributedCacheReader;
use self::config_keeper::ConfigKeeper;
use self::grant_keeper::TaskGrantKeeper;
use self::running_keeper::RunningTaskKeeper;
use self::task::{CacheControl, DistributedTask, DistributedTaskOutput};
use cache::format::{CxxCompilationExtraInfo, ExtraInfo};
use protocol::*;
use rpc::{CacheClient, DaemonClient, SchedulerClient};
use serde_json;
use util::{self, PeriodicTimer};

/// Exit codes for failures of ours, distinguishable from anything a
/// compiler would return.
const EXIT_NOT_DISPATCHED: i32 = -126;
const EXIT_SERVANT_LOST: i32 = -125;

/// Successive wait-RPC failures tolerated before giving the task up.
const WAIT_RPC_RETRIES: u32 = 4;
const WAIT_RPC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A task whose grant hasn't been acknowledged for this long is presumed
/// killed by the scheduler.
const KEEP_ALIVE_LOST_THRESHOLD: Duration = Duration::from_secs(60);
const KEEP_ALIVE_LEASE_MS: u64 = 10_000;

/// Completed tasks nobody claims are dropped after this.
const DONE_TASK_RETENTION: Duration = Duration::from_secs(60);

const TIMER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    ReadyToFire,
    Dispatched,
    Done,
}

struct TaskInner {
    state: TaskState,
    task: Option<Box<DistributedTask>>,
    started_at: SystemTime,
    completed_at: Option<Instant>,
    task_grant_id: u64,
    servant_location: String,
    servant_task_id: u64,
    last_keep_alive_at: Instant,
}

struct TaskDesc {
    task_id: u64,
    // Copied out of the task so timers never need the task lock.
    invoker_pid: u32,
    env_desc: EnvironmentDesc,
    cache_setting: CacheControl,
    cache_key: String,
    task_digest: String,
    start_deadline: Instant,
    aborted: AtomicBool,
    completion: util::Latch,
    inner: Mutex<TaskInner>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Timeout,
    NotFound,
}

pub struct DispatcherOptions {
    pub scheduler_location: String,
    pub cache_server_location: Option<String>,
    pub token: String,
    pub version: u32,
}

pub struct DistributedTaskDispatcher {
    scheduler: SchedulerClient,
    token: String,
    config_keeper: Arc<ConfigKeeper>,
    grant_keeper: Arc<TaskGrantKeeper>,
    running_keeper: Arc<RunningTaskKeeper>,
    cache_reader: Arc<DistributedCacheReader>,
    tasks: Mutex<HashMap<u64, Arc<TaskDesc>>>,
    next_task_id: AtomicU64,
    timers: Mutex<Vec<PeriodicTimer>>,
    hit_cache: AtomicU64,
    reused_existing_result: AtomicU64,
    actually_run: AtomicU64,
}

impl DistributedTaskDispatcher {
    pub fn new(options: DispatcherOptions) -> Arc<DistributedTaskDispatcher> {
        let scheduler = SchedulerClient::new(&options.scheduler_location);
        let cache_client = options
            .cache_server_location
            .as_ref()
            .map(|location| CacheClient::new(location));
        let dispatcher = Arc::new(DistributedTaskDispatcher {
            scheduler: scheduler.clone(),
            token: options.token.clone(),
            config_keeper: ConfigKeeper::new(scheduler.clone(), options.token.clone()),
            grant_keeper: Arc::new(TaskGrantKeeper::new(
                scheduler.clone(),
                options.token.clone(),
                options.version,
            )),
            running_keeper: RunningTaskKeeper::new(scheduler.clone(), options.token.clone()),
            cache_reader: DistributedCacheReader::new(cache_client, options.token),
            tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            timers: Mutex::new(Vec::new()),
            hit_cache: AtomicU64::new(0),
            reused_existing_result: AtomicU64::new(0),
            actually_run: AtomicU64::new(0),
        });

        let mut timers = dispatcher.timers.lock().unwrap();
        let d = dispatcher.clone();
        timers.push(PeriodicTimer::spawn("task-abort", TIMER_TICK, move || {
            d.on_abort_timer()
        }));
        let d = dispatcher.clone();
        timers.push(PeriodicTimer::spawn("task-keep-alive", TIMER_TICK, move || {
            d.on_keep_alive_timer()
        }));
        let d = dispatcher.clone();
        timers.push(PeriodicTimer::spawn("task-kill-orphan", TIMER_TICK, move || {
            d.on_kill_orphan_timer()
        }));
        let d = dispatcher.clone();
        timers.push(PeriodicTimer::spawn("task-cleanup", TIMER_TICK, move || {
            d.on_cleanup_timer()
        }));
        drop(timers);
        dispatcher
    }

    /// Queues `task` for remote execution. If it cannot be dispatched
    /// before `start_deadline` it is aborted and reported as failed.
    pub fn queue_task(
        dispatcher: &Arc<DistributedTaskDispatcher>,
        task: Box<DistributedTask>,
        start_deadline: Instant,
    ) -> u64 {
        let this = &**dispatcher;
        let task_id = this.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let desc = Arc::new(TaskDesc {
            task_id,
            invoker_pid: task.invoker_pid(),
            env_desc: task.environment_desc().clone(),
            cache_setting: task.cache_setting(),
            cache_key: task.cache_key(),
            task_digest: task.digest(),
            start_deadline,
            aborted: AtomicBool::new(false),
            completion: util::Latch::new(),
            inner: Mutex::new(TaskInner {
                state: TaskState::Pending,
                task: Some(task),
                started_at: SystemTime::now(),
                completed_at: None,
                task_grant_id: 0,
                servant_location: String::new(),
                servant_task_id: 0,
                last_keep_alive_at: Instant::now(),
            }),
        });
        this.tasks.lock().unwrap().insert(task_id, desc.clone());

        let me = dispatcher.clone();
        thread::Builder::new()
            .name(format!("task-worker-{}", task_id))
            .spawn(move || me.perform_one_task(desc))
            .expect("failed to spawn task worker");
        task_id
    }

    /// Waits for the task, claims it and hands it back, completed. The type
    /// must match what was queued.
    pub fn wait_for_task<T: DistributedTask>(
        &self,
        task_id: u64,
        timeout: Duration,
    ) -> ::std::result::Result<Box<T>, WaitStatus> {
        let desc = match self.tasks.lock().unwrap().get(&task_id) {
            Some(d) => d.clone(),
            None => return Err(WaitStatus::NotFound),
        };
        if !desc.completion.wait_for(timeout) {
            return Err(WaitStatus::Timeout);
        }
        let task = desc.inner.lock().unwrap().task.take();
        self.tasks.lock().unwrap().remove(&task_id);
        match task {
            // Unless something is buggy the runtime type matches `T`.
            Some(boxed) => boxed
                .into_any()
                .downcast::<T>()
                .map_err(|_| WaitStatus::NotFound),
            None => Err(WaitStatus::NotFound), // Claimed twice.
        }
    }

    pub fn stop(&self) {
        for timer in self.timers.lock().unwrap().iter() {
            timer.stop();
        }
        self.grant_keeper.stop();
        self.config_keeper.stop();
        self.running_keeper.stop();
        self.cache_reader.stop();
    }

    pub fn join(&self) {
        for timer in self.timers.lock().unwrap().iter_mut() {
            timer.join();
        }
        self.grant_keeper.join();
        self.config_keeper.join();
        self.running_keeper.join();
        self.cache_reader.join();
    }

    fn perform_one_task(&self, desc: Arc<TaskDesc>) {
        let output = self.run_task(&desc);

        let mut inner = desc.inner.lock().unwrap();
        if let Some(ref mut task) = inner.task {
            task.on_completion(output);
        }
        inner.state = TaskState::Done;
        inner.completed_at = Some(Instant::now());
        drop(inner);
        desc.completion.count_down();
        trace!("Task {} has completed.", desc.task_id);
    }

    fn run_task(&self, desc: &Arc<TaskDesc>) -> DistributedTaskOutput {
        // Perhaps the cache already knows the answer.
        if desc.cache_setting == CacheControl::Allow {
            if let Some(entry) = self.cache_reader.try_read(&desc.cache_key) {
                self.hit_cache.fetch_add(1, Ordering::Relaxed);
                return DistributedTaskOutput::from(entry);
            }
        }

        // Or someone else is compiling the very same unit right now.
        if let Some(output) = self.try_join_existing_task(desc) {
            self.reused_existing_result.fetch_add(1, Ordering::Relaxed);
            return output;
        }

        self.actually_run.fetch_add(1, Ordering::Relaxed);
        self.start_new_servant_task(desc)
    }

    // Piggybacks on an identical task running elsewhere, if the scheduler's
    // view knows of one and the servant accepts the reference.
    fn try_join_existing_task(&self, desc: &Arc<TaskDesc>) -> Option<DistributedTaskOutput> {
        let existing = self.running_keeper.try_find_task(&desc.task_digest)?;
        let client = DaemonClient::new(&existing.servant_location);
        let token = self.config_keeper.serving_daemon_token();
        let reference = client.reference_task(
            ReferenceTaskRequest {
                token,
                task_digest: desc.task_digest.clone(),
            },
            Duration::from_secs(5),
        );
        let servant_task_id = match reference {
            Ok(response) => response.task_id,
            Err(_) => return None, // It finished or vanished; compile it ourselves.
        };
        debug!(
            "Task {} references existing task {} on [{}].",
            desc.task_id, servant_task_id, existing.servant_location
        );
        {
            let mut inner = desc.inner.lock().unwrap();
            inner.state = TaskState::Dispatched;
            inner.servant_location = existing.servant_location.clone();
            inner.servant_task_id = servant_task_id;
            inner.last_keep_alive_at = Instant::now();
        }
        let output = self.wait_servant_with_retry(desc, &client, servant_task_id);
        self.free_servant_task(&client, servant_task_id);
        Some(output)
    }

    fn start_new_servant_task(&self, desc: &Arc<TaskDesc>) -> DistributedTaskOutput {
        // Acquire a grant and submit, over and over: a submission lost to a
        // dying servant costs us the grant, not the task.
        let (grant, client, servant_task_id) = loop {
            let grant = loop {
                if desc.aborted.load(Ordering::Relaxed) {
                    error!("Task {} cannot be started in time. Aborted.", desc.task_id);
                    return failure_output(EXIT_NOT_DISPATCHED, "aborted before dispatch");
                }
                if Instant::now() >= desc.start_deadline {
                    desc.aborted.store(true, Ordering::Relaxed);
                    error!("Task {} cannot be started in time. Aborted.", desc.task_id);
                    return failure_output(EXIT_NOT_DISPATCHED, "start deadline exceeded");
                }
                if let Some(grant) = self
                    .grant_keeper
                    .get(&desc.env_desc, Duration::from_secs(1))
                {
                    break grant;
                }
            };

            // Mark ready before submitting: submission can take long, and
            // the keep-alive timer must already be renewing the grant
            // meanwhile.
            {
                let mut inner = desc.inner.lock().unwrap();
                inner.state = TaskState::ReadyToFire;
                inner.task_grant_id = grant.grant_id;
                inner.servant_location = grant.servant_location.clone();
                inner.last_keep_alive_at = Instant::now();
            }

            let client = DaemonClient::new(&grant.servant_location);
            let token = self.config_keeper.serving_daemon_token();

            // The task is taken out of its slot during submission so that
            // the timers never block behind a long RPC.
            let mut task = desc
                .inner
                .lock()
                .unwrap()
                .task
                .take()
                .expect("task vanished before submission");
            let submitted = task.start_task(&token, grant.grant_id, &client);
            desc.inner.lock().unwrap().task = Some(task);

            match submitted {
                Ok(id) => break (grant, client, id),
                Err(ref e)
                    if ::rpc::is_transport_error(e)
                        || match *e.kind() {
                            ::errors::ErrorKind::EnvironmentNotAvailable => true,
                            _ => false,
                        } =>
                {
                    // The servant is unreachable or lost its toolchain since
                    // the scheduler placed us; try our luck elsewhere.
                    warn!(
                        "Failed to submit task {} to servant [{}]: {}. Re-acquiring a grant.",
                        desc.task_id, grant.servant_location, e
                    );
                    self.grant_keeper.free(grant.grant_id);
                    desc.inner.lock().unwrap().state = TaskState::Pending;
                }
                Err(e) => {
                    error!(
                        "Failed to submit task {} to servant [{}]: {}",
                        desc.task_id, grant.servant_location, e
                    );
                    self.grant_keeper.free(grant.grant_id);
                    return failure_output(EXIT_NOT_DISPATCHED, "submission failed");
                }
            }
        };
        {
            let mut inner = desc.inner.lock().unwrap();
            inner.state = TaskState::Dispatched;
            inner.servant_task_id = servant_task_id;
        }

        let output = self.wait_servant_with_retry(desc, &client, servant_task_id);
        self.free_servant_task(&client, servant_task_id);
        self.grant_keeper.free(grant.grant_id);
        output
    }

    fn wait_servant_with_retry(
        &self,
        desc: &Arc<TaskDesc>,
        client: &DaemonClient,
        servant_task_id: u64,
    ) -> DistributedTaskOutput {
        let mut retries_left = WAIT_RPC_RETRIES;
        loop {
            if desc.aborted.load(Ordering::Relaxed) {
                return failure_output(EXIT_NOT_DISPATCHED, "aborted while waiting");
            }
            let token = self.config_keeper.serving_daemon_token();
            let result = client.wait_for_compilation_output(
                WaitForCompilationOutputRequest {
                    token,
                    task_id: servant_task_id,
                    milliseconds_to_wait: 2000,
                    acceptable_compression_algorithms: vec![CompressionAlgorithm::Zstd],
                },
                Duration::from_secs(10),
            );
            match result {
                Ok(ref response) if response.status == TaskStatus::Running => {
                    // Not an error; any successful poll resets the budget.
                    retries_left = WAIT_RPC_RETRIES;
                }
                Ok(response) => {
                    if response.exit_code == 127 {
                        // 127 from the remote shell means the compiler
                        // itself could not be started there.
                        warn!(
                            "Failed to start compiler on servant: {}",
                            response.error
                        );
                    }
                    return output_of_response(response);
                }
                Err(ref e) if ::rpc::is_transport_error(e) => {
                    if retries_left == 0 {
                        error!(
                            "RPC failure in waiting for task {} running on servant. Bailing out.",
                            desc.task_id
                        );
                        return failure_output(EXIT_SERVANT_LOST, "lost contact with servant");
                    }
                    warn!(
                        "RPC failure in waiting for task {}. {} retries left.",
                        desc.task_id, retries_left
                    );
                    retries_left -= 1;
                    thread::sleep(WAIT_RPC_RETRY_DELAY);
                }
                Err(e) => {
                    error!(
                        "Failed to wait on task {} running on servant: {}",
                        desc.task_id, e
                    );
                    return failure_output(EXIT_SERVANT_LOST, "servant rejected the task");
                }
            }
        }
    }

    fn free_servant_task(&self, client: &DaemonClient, servant_task_id: u64) {
        // Best effort; the servant GCs unclaimed tasks on its own.
        let _ = client.free_task(
            FreeServantTaskRequest {
                token: self.config_keeper.serving_daemon_token(),
                task_id: servant_task_id,
            },
            Duration::from_secs(5),
        );
    }

    /// Aborts tasks that idled past their start deadline without being
    /// dispatched.
    fn on_abort_timer(&self) {
        let now = Instant::now();
        let mut aborted = 0usize;
        let tasks = self.tasks.lock().unwrap();
        for desc in tasks.values() {
            let state = desc.inner.lock().unwrap().state;
            if (state == TaskState::Pending || state == TaskState::ReadyToFire)
                && desc.start_deadline < now
                && !desc.aborted.swap(true, Ordering::Relaxed)
            {
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(
                "Aborted {} tasks; they've been pending without a chance for dispatching \
                 for too long.",
                aborted
            );
        }
    }

    /// Renews every live grant in one scheduler call.
    fn on_keep_alive_timer(&self) {
        let now = Instant::now();
        let mut grant_ids = Vec::new();
        let mut task_ids = Vec::new();
        {
            let tasks = self.tasks.lock().unwrap();
            for desc in tasks.values() {
                let inner = desc.inner.lock().unwrap();
                if inner.state != TaskState::ReadyToFire && inner.state != TaskState::Dispatched {
                    continue;
                }
                if desc.aborted.load(Ordering::Relaxed) || inner.task_grant_id == 0 {
                    continue;
                }
                let silence = now.duration_since(inner.last_keep_alive_at);
                if silence > KEEP_ALIVE_LOST_THRESHOLD {
                    // The scheduler has surely reclaimed the grant by now.
                    desc.aborted.store(true, Ordering::Relaxed);
                    warn!(
                        "Keep-alive of task {} has been failing for more than {:?}. Aborting.",
                        desc.task_id, KEEP_ALIVE_LOST_THRESHOLD
                    );
                    continue;
                }
                if silence > Duration::from_secs(5) {
                    warn!(
                        "Our keep-alive timer is delayed for {:?}. Overloaded?",
                        silence
                    );
                }
                grant_ids.push(inner.task_grant_id);
                task_ids.push(desc.task_id);
            }
        }
        if grant_ids.is_empty() {
            return;
        }

        let result = self.scheduler.keep_task_alive(
            KeepTaskAliveRequest {
                token: self.token.clone(),
                task_grant_ids: grant_ids.clone(),
                next_keep_alive_in_ms: KEEP_ALIVE_LEASE_MS,
            },
            Duration::from_secs(5),
        );
        let statuses = match result {
            Ok(ref response) if response.statuses.len() == grant_ids.len() => {
                response.statuses.clone()
            }
            _ => {
                warn!("Failed to send keep alive to the scheduler. We'll retry later.");
                return;
            }
        };

        let tasks = self.tasks.lock().unwrap();
        for (i, ok) in statuses.iter().enumerate() {
            if !*ok {
                warn!("Keep-alive request for task {} failed.", task_ids[i]);
                continue;
            }
            if let Some(desc) = tasks.get(&task_ids[i]) {
                desc.inner.lock().unwrap().last_keep_alive_at = now;
            }
            // Completed in the meantime otherwise; so be it.
        }
    }

    /// Aborts tasks whose submitter has gone.
    fn on_kill_orphan_timer(&self) {
        let mut aborted = 0usize;
        let tasks = self.tasks.lock().unwrap();
        for desc in tasks.values() {
            if !desc.aborted.load(Ordering::Relaxed) && !util::is_process_alive(desc.invoker_pid)
            {
                desc.aborted.store(true, Ordering::Relaxed);
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(
                "Killed {} orphan tasks. Submitters of these tasks have gone.",
                aborted
            );
        }
    }

    /// Drops completed tasks no one claimed in time.
    fn on_cleanup_timer(&self) {
        let now = Instant::now();
        let mut tasks = self.tasks.lock().unwrap();
        let expired: Vec<u64> = tasks
            .iter()
            .filter(|&(_, desc)| {
                let inner = desc.inner.lock().unwrap();
                inner.state == TaskState::Done
                    && inner
                        .completed_at
                        .map(|at| at + DONE_TASK_RETENTION < now)
                        .unwrap_or(false)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            warn!(
                "Task [{}] completed a while ago and no one seems interested in it. Dropping.",
                id
            );
            tasks.remove(&id);
        }
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let tasks = self.tasks.lock().unwrap();
        let mut by_state: HashMap<&'static str, Vec<serde_json::Value>> = HashMap::new();
        for desc in tasks.values() {
            let inner = desc.inner.lock().unwrap();
            let bucket = match inner.state {
                TaskState::Pending => "pending_tasks",
                TaskState::ReadyToFire => "ready_tasks",
                TaskState::Dispatched => "dispatched_tasks",
                TaskState::Done => "completed_tasks",
            };
            let mut entry = json!({
                "task_id": desc.task_id,
                "requestor_pid": desc.invoker_pid,
                "compiler_digest": desc.env_desc.compiler_digest,
                "task_grant_id": inner.task_grant_id,
                "servant_location": inner.servant_location,
                "servant_task_id": inner.servant_task_id,
                "started_at": util::format_time(inner.started_at),
                "aborted": desc.aborted.load(Ordering::Relaxed),
            });
            if let Some(ref task) = inner.task {
                entry["task"] = task.dump();
            }
            by_state.entry(bucket).or_insert_with(Vec::new).push(entry);
        }
        let mut result = json!({
            "statistics": {
                "hit_cache": self.hit_cache.load(Ordering::Relaxed),
                "reused_existing_result": self.reused_existing_result.load(Ordering::Relaxed),
                "actually_run": self.actually_run.load(Ordering::Relaxed),
            },
        });
        for (bucket, entries) in by_state {
            result[bucket] = serde_json::Value::Array(entries);
        }
        result
    }
}

fn failure_output(exit_code: i32, reason: &str) -> DistributedTaskOutput {
    DistributedTaskOutput {
        exit_code,
        standard_error: reason.to_owned(),
        ..Default::default()
    }
}

fn output_of_response(response: WaitForCompilationOutputResponse) -> DistributedTaskOutput {
    let mut patches = CxxCompilationExtraInfo::default();
    for (extension, locations) in response
        .file_extensions
        .iter()
        .zip(response.patches.into_iter())
    {
        patches.file_name_patches.insert(extension.clone(), locations);
    }
    DistributedTaskOutput {
        exit_code: response.exit_code,
        standard_output: response.output,
        standard_error: response.error,
        extra_info: ExtraInfo::pack_cxx(&patches).unwrap_or_default(),
        output_files: response
            .file_extensions
            .into_iter()
            .zip(response.files.into_iter())
            .collect(),
    }
}
