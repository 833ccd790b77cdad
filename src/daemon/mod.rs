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

//! The per-machine daemon: local dispatcher (wrapper-facing) on one side,
//! servant execution engine (cloud-facing) on the other, plus the heartbeat
//! loop that keeps the scheduler informed of both.

pub mod cloud;
pub mod local;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use self::cloud::compilers::CompilerRegistry;
use self::cloud::{ExecutionEngine, ExecutionEngineOptions};
use self::local::file_digest::FileDigestCache;
use self::local::http::{HttpServer, HttpService};
use self::local::task_monitor::LocalTaskMonitor;
use self::local::{DispatcherOptions, DistributedTaskDispatcher};
use errors::*;
use protocol::*;
use rpc::{self, CacheClient, SchedulerClient};
use util::{self, PeriodicTimer};

/// Bumped on protocol-visible changes; the scheduler may refuse daemons
/// that are too old.
pub const VERSION_FOR_UPGRADE: u32 = 2;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const HEARTBEAT_LEASE_MS: u64 = 10_000;

pub struct DaemonOptions {
    pub scheduler_location: String,
    pub cache_server_location: Option<String>,
    pub token: String,
    /// Port other daemons reach our execution engine at.
    pub serving_port: u16,
    /// Loopback port the compiler wrapper talks to.
    pub local_port: u16,
    /// IP to advertise to the scheduler. The scheduler trusts its own view
    /// of our address anyway; only the port part of this matters remotely.
    pub advertised_ip: String,
    pub priority: ServantPriority,
    /// Maximum concurrent remote compilations served here. Zero disables
    /// serving (the daemon stays a pure requestor).
    pub capacity: usize,
    pub max_local_tasks: usize,
    pub lightweight_overprovisioning_ratio: f64,
    pub extra_compiler_dirs: Vec<String>,
}

pub struct Daemon {
    scheduler: SchedulerClient,
    token: String,
    location: String,
    priority: ServantPriority,
    engine: Arc<ExecutionEngine>,
    dispatcher: Arc<DistributedTaskDispatcher>,
    monitor: Arc<LocalTaskMonitor>,
    rpc_server: Mutex<rpc::Server>,
    http_server: Mutex<HttpServer>,
    leaving: Arc<AtomicBool>,
    heartbeat_timer: Mutex<Option<PeriodicTimer>>,
}

impl Daemon {
    pub fn start(options: DaemonOptions) -> Result<Arc<Daemon>> {
        let scheduler = SchedulerClient::new(&options.scheduler_location);
        let cache_client = options
            .cache_server_location
            .as_ref()
            .map(|location| CacheClient::new(location));

        let registry = Arc::new(CompilerRegistry::discover(&options.extra_compiler_dirs));
        let engine = ExecutionEngine::new(
            registry,
            ExecutionEngineOptions {
                capacity: options.capacity,
                cache: cache_client,
                cache_token: options.token.clone(),
            },
        );
        let rpc_server = rpc::Server::start(
            &format!("0.0.0.0:{}", options.serving_port),
            engine.clone(),
        )?;
        // The port actually bound, in case the configured one was 0.
        let serving_port = rpc_server.local_addr().port();

        let dispatcher = DistributedTaskDispatcher::new(DispatcherOptions {
            scheduler_location: options.scheduler_location.clone(),
            cache_server_location: options.cache_server_location.clone(),
            token: options.token.clone(),
            version: VERSION_FOR_UPGRADE,
        });
        let monitor = LocalTaskMonitor::new(
            options.max_local_tasks,
            options.lightweight_overprovisioning_ratio,
        );
        let http_service = Arc::new(HttpService::new(
            dispatcher.clone(),
            monitor.clone(),
            Arc::new(FileDigestCache::new()),
            VERSION_FOR_UPGRADE,
        ));
        let leaving = http_service.leaving_flag();
        let http_server = HttpServer::start(
            &format!("127.0.0.1:{}", options.local_port),
            http_service,
        )?;

        let daemon = Arc::new(Daemon {
            scheduler,
            token: options.token,
            location: format!("{}:{}", options.advertised_ip, serving_port),
            priority: options.priority,
            engine,
            dispatcher,
            monitor,
            rpc_server: Mutex::new(rpc_server),
            http_server: Mutex::new(http_server),
            leaving,
            heartbeat_timer: Mutex::new(None),
        });

        // First heartbeat right away: no grants flow here until the
        // scheduler knows us, and no servant call succeeds until we learn
        // the acceptable tokens.
        daemon.send_heartbeat(HEARTBEAT_LEASE_MS);
        let d = daemon.clone();
        *daemon.heartbeat_timer.lock().unwrap() = Some(PeriodicTimer::spawn(
            "daemon-heartbeat",
            HEARTBEAT_INTERVAL,
            move || d.send_heartbeat(HEARTBEAT_LEASE_MS),
        ));
        Ok(daemon)
    }

    fn send_heartbeat(&self, lease_ms: u64) {
        let (total_memory, memory_available) = util::memory_stats();
        let request = HeartbeatRequest {
            token: self.token.clone(),
            version: VERSION_FOR_UPGRADE,
            location: self.location.clone(),
            env_descs: self.engine.environments(),
            num_processors: ::num_cpus::get() as u64,
            current_load: util::current_load(),
            total_memory_in_bytes: total_memory,
            memory_available_in_bytes: memory_available,
            priority: self.priority,
            capacity: self.engine.capacity() as u64,
            not_accepting_task_reason: if self.engine.capacity() == 0 {
                NotAcceptingTaskReason::NotAllowed
            } else {
                NotAcceptingTaskReason::None
            },
            running_tasks: self.engine.running_tasks_report(),
            next_heartbeat_in_ms: lease_ms,
        };
        match self.scheduler.heartbeat(request, Duration::from_secs(5)) {
            Ok(response) => {
                self.engine.update_acceptable_tokens(response.acceptable_tokens);
                if !response.expired_task_ids.is_empty() {
                    self.engine.kill_expired_tasks(&response.expired_task_ids);
                }
            }
            Err(e) => warn!("Failed to heartbeat the scheduler: {}", e),
        }
    }

    /// True once the wrapper asked us to leave.
    pub fn leaving(&self) -> bool {
        self.leaving.load(::std::sync::atomic::Ordering::Relaxed)
    }

    /// Where the wrapper-facing HTTP endpoint ended up listening.
    pub fn local_http_location(&self) -> String {
        self.http_server.lock().unwrap().location()
    }

    pub fn stop(&self) {
        if let Some(ref timer) = *self.heartbeat_timer.lock().unwrap() {
            timer.stop();
        }
        // Tell the scheduler we're going: a zero lease keeps the record but
        // stops new grants landing here.
        self.send_heartbeat(0);
        self.rpc_server.lock().unwrap().stop();
        self.http_server.lock().unwrap().stop();
        self.dispatcher.stop();
        self.engine.stop();
        self.monitor.stop();
    }

    pub fn join(&self) {
        if let Some(ref mut timer) = *self.heartbeat_timer.lock().unwrap() {
            timer.join();
        }
        self.rpc_server.lock().unwrap().join();
        self.http_server.lock().unwrap().join();
        self.dispatcher.join();
        self.engine.join();
        self.monitor.join();
    }

    pub fn dump_internals(&self) -> ::serde_json::Value {
        json!({
            "dispatcher": self.dispatcher.dump_internals(),
            "engine": self.engine.dump_internals(),
            "local_task_monitor": self.monitor.dump_internals(),
        })
    }
}
