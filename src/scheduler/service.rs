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

//! RPC surface of the scheduler. Translates wire requests into
//! `TaskDispatcher` calls, verifies tokens, and maintains the rolling window
//! of serving-daemon tokens that authenticate daemon-to-servant calls.

use rand::{self, Rng};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use errors::*;
use protocol::*;
use rpc;
use scheduler::{ServantPersonality, TaskDispatcher, TaskPersonality};
use util::{self, TokenVerifier};

/// Heartbeat leases and grant leases beyond this are considered nonsense.
const MAX_LEASE: Duration = Duration::from_secs(30);

/// Upper bound on the server-side wait in `WaitForStartingTask`.
const MAX_ALLOCATION_WAIT: Duration = Duration::from_secs(10);

pub struct SchedulerServiceOptions {
    pub daemon_tokens: Vec<String>,
    pub min_daemon_version: u32,
    pub token_rollout_interval: Duration,
    pub min_memory_for_new_task: u64,
}

struct ServingTokens {
    // Oldest, active, upcoming. The middle one is handed to requestors;
    // servants accept all three so rotation never races a request.
    window: VecDeque<String>,
    next_rollout: Instant,
}

pub struct SchedulerService {
    dispatcher: Arc<TaskDispatcher>,
    token_verifier: TokenVerifier,
    min_daemon_version: u32,
    rollout_interval: Duration,
    serving_tokens: Mutex<ServingTokens>,
}

fn next_serving_daemon_token() -> String {
    let bytes = rand::thread_rng().gen::<[u8; 16]>();
    util::hex(&bytes)
}

impl SchedulerService {
    pub fn new(options: SchedulerServiceOptions) -> SchedulerService {
        let window: VecDeque<String> =
            (0..3).map(|_| next_serving_daemon_token()).collect();
        SchedulerService {
            dispatcher: Arc::new(TaskDispatcher::new(options.min_memory_for_new_task)),
            token_verifier: TokenVerifier::new(options.daemon_tokens),
            min_daemon_version: options.min_daemon_version,
            rollout_interval: options.token_rollout_interval,
            serving_tokens: Mutex::new(ServingTokens {
                window,
                next_rollout: Instant::now() + options.token_rollout_interval,
            }),
        }
    }

    pub fn start(&self) {
        TaskDispatcher::start(&self.dispatcher);
    }

    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    pub fn join(&self) {
        self.dispatcher.join();
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    fn determine_active_serving_daemon_tokens(&self) -> Vec<String> {
        let mut tokens = self.serving_tokens.lock().unwrap();
        let now = Instant::now();
        if tokens.next_rollout < now {
            tokens.next_rollout = now + self.rollout_interval;
            tokens.window.pop_front();
            tokens.window.push_back(next_serving_daemon_token());
        }
        debug_assert_eq!(tokens.window.len(), 3);
        tokens.window.iter().cloned().collect()
    }

    fn heartbeat(&self, peer: SocketAddr, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        if !self.token_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        if request.version < self.min_daemon_version {
            bail!(ErrorKind::InvalidArgument("daemon version too old".into()));
        }

        // The address we observed is authoritative; only the port comes from
        // the servant's report.
        let reported: SocketAddr = match request.location.parse() {
            Ok(addr) => addr,
            Err(_) => {
                error!(
                    "Misbehaving daemon: Reporting invalid network location [{}].",
                    request.location
                );
                bail!(ErrorKind::InvalidArgument(format!(
                    "invalid location [{}]",
                    request.location
                )));
            }
        };
        let observed_location = format!("{}:{}", peer.ip(), reported.port());
        let reported_location = format!("{}", reported);

        let expires_in = Duration::from_millis(request.next_heartbeat_in_ms);
        if expires_in > MAX_LEASE {
            bail!(ErrorKind::InvalidArgument("heartbeat lease too long".into()));
        }

        let mut servant = ServantPersonality {
            version: request.version,
            observed_location: observed_location.clone(),
            reported_location,
            environments: request.env_descs,
            num_processors: request.num_processors,
            max_tasks: request.capacity,
            total_memory_in_bytes: request.total_memory_in_bytes,
            memory_available_in_bytes: request.memory_available_in_bytes,
            priority: request.priority,
            not_accepting_task_reason: request.not_accepting_task_reason,
            current_load: request.current_load,
        };
        if servant.num_processors == 0 {
            // Older daemons don't report processor count; fake one.
            servant.num_processors = request.capacity;
        }
        if servant.observed_location != servant.reported_location {
            // Without NAT traversal the servant is unreachable from outside,
            // so no tasks may land there.
            servant.max_tasks = 0;
            servant.not_accepting_task_reason = NotAcceptingTaskReason::BehindNat;
        }
        if expires_in == Duration::from_millis(0) {
            // A zero lease means "about to leave": keep the record (the
            // expiration GC removes it shortly) but stop placing tasks.
            servant.max_tasks = 0;
            servant.not_accepting_task_reason = NotAcceptingTaskReason::Leaving;
        }
        self.dispatcher.keep_servant_alive(servant, expires_in);

        // `expired_task_ids` is not always a sign of error: the task may
        // simply have finished after the heartbeat left the servant.
        let expired_task_ids = self
            .dispatcher
            .examine_running_tasks(&observed_location, &request.running_tasks);
        Ok(HeartbeatResponse {
            acceptable_tokens: self.determine_active_serving_daemon_tokens(),
            expired_task_ids,
        })
    }

    fn get_config(&self, request: GetConfigRequest) -> Result<GetConfigResponse> {
        if !self.token_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        Ok(GetConfigResponse {
            serving_daemon_token: self.determine_active_serving_daemon_tokens()[1].clone(),
        })
    }

    fn wait_for_starting_task(
        &self,
        peer: SocketAddr,
        request: WaitForStartingTaskRequest,
    ) -> Result<WaitForStartingTaskResponse> {
        if !self.token_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        let max_wait = Duration::from_millis(request.milliseconds_to_wait);
        let lease = Duration::from_millis(request.next_keep_alive_in_ms);
        if max_wait > MAX_ALLOCATION_WAIT || lease > MAX_LEASE {
            bail!(ErrorKind::InvalidArgument(
                "unacceptable wait or lease".into()
            ));
        }

        let task = TaskPersonality {
            requestor_ip: format!("{}", peer.ip()),
            env_desc: request.env_desc,
            min_servant_version: request.min_version,
        };
        let mut grants = Vec::new();
        for i in 0..request.immediate_reqs {
            // Only the very first request may wait. Were we to wait for the
            // rest too, earlier grants could expire before we even return.
            let wait = if i == 0 { max_wait } else { Duration::from_millis(0) };
            match self
                .dispatcher
                .wait_for_starting_new_task(&task, lease, wait, false)
            {
                Some(allocation) => grants.push(TaskGrant {
                    task_grant_id: allocation.task_id,
                    servant_location: allocation.servant_location,
                }),
                None => break,
            }
        }
        for _ in 0..request.prefetch_reqs {
            match self.dispatcher.wait_for_starting_new_task(
                &task,
                lease,
                Duration::from_millis(0),
                true,
            ) {
                Some(allocation) => grants.push(TaskGrant {
                    task_grant_id: allocation.task_id,
                    servant_location: allocation.servant_location,
                }),
                None => break,
            }
        }

        if grants.is_empty() {
            bail!(ErrorKind::NoQuotaAvailable);
        }
        Ok(WaitForStartingTaskResponse { grants })
    }

    fn keep_task_alive(&self, request: KeepTaskAliveRequest) -> Result<KeepTaskAliveResponse> {
        if !self.token_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        let lease = Duration::from_millis(request.next_keep_alive_in_ms);
        if lease > MAX_LEASE {
            bail!(ErrorKind::InvalidArgument("lease too long".into()));
        }
        Ok(KeepTaskAliveResponse {
            statuses: request
                .task_grant_ids
                .iter()
                .map(|&id| self.dispatcher.keep_task_alive(id, lease))
                .collect(),
        })
    }

    fn free_task(&self, request: FreeTaskRequest) -> Result<FreeTaskResponse> {
        if !self.token_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        for id in request.task_grant_ids {
            self.dispatcher.free_task(id);
        }
        Ok(FreeTaskResponse {})
    }

    fn get_running_tasks(&self, request: GetRunningTasksRequest) -> Result<GetRunningTasksResponse> {
        if !self.token_verifier.verify(&request.token) {
            bail!(ErrorKind::AccessDenied);
        }
        Ok(GetRunningTasksResponse {
            running_tasks: self.dispatcher.get_running_tasks(),
        })
    }
}

impl rpc::Service for SchedulerService {
    type Request = SchedulerRequest;
    type Response = SchedulerResponse;

    fn handle(&self, peer: SocketAddr, request: SchedulerRequest) -> Result<SchedulerResponse> {
        match request {
            SchedulerRequest::Heartbeat(r) => {
                Ok(SchedulerResponse::Heartbeat(self.heartbeat(peer, r)?))
            }
            SchedulerRequest::GetConfig(r) => {
                Ok(SchedulerResponse::GetConfig(self.get_config(r)?))
            }
            SchedulerRequest::WaitForStartingTask(r) => Ok(
                SchedulerResponse::WaitForStartingTask(self.wait_for_starting_task(peer, r)?),
            ),
            SchedulerRequest::KeepTaskAlive(r) => {
                Ok(SchedulerResponse::KeepTaskAlive(self.keep_task_alive(r)?))
            }
            SchedulerRequest::FreeTask(r) => {
                Ok(SchedulerResponse::FreeTask(self.free_task(r)?))
            }
            SchedulerRequest::GetRunningTasks(r) => Ok(SchedulerResponse::GetRunningTasks(
                self.get_running_tasks(r)?,
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rpc::{SchedulerClient, Server};

    pub fn test_options() -> SchedulerServiceOptions {
        SchedulerServiceOptions {
            daemon_tokens: vec!["daemon-token".to_owned()],
            min_daemon_version: 0,
            token_rollout_interval: Duration::from_secs(3600),
            min_memory_for_new_task: 1 << 30,
        }
    }

    pub fn heartbeat_for(location: &str, env: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            token: "daemon-token".to_owned(),
            version: 2,
            location: location.to_owned(),
            env_descs: vec![EnvironmentDesc::new(env)],
            num_processors: 8,
            current_load: 0,
            total_memory_in_bytes: 32 << 30,
            memory_available_in_bytes: 32 << 30,
            priority: ServantPriority::User,
            capacity: 4,
            not_accepting_task_reason: NotAcceptingTaskReason::None,
            running_tasks: vec![],
            next_heartbeat_in_ms: 10_000,
        }
    }

    fn start_scheduler() -> (Server, SchedulerClient, Arc<SchedulerService>) {
        let service = Arc::new(SchedulerService::new(test_options()));
        let server = Server::start("127.0.0.1:0", service.clone()).unwrap();
        let client = SchedulerClient::new(&server.location());
        (server, client, service)
    }

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn test_heartbeat_then_allocate() {
        let (_server, client, _service) = start_scheduler();
        let response = client
            .heartbeat(heartbeat_for("127.0.0.1:8336", "env-a"), TIMEOUT)
            .unwrap();
        assert_eq!(response.acceptable_tokens.len(), 3);
        assert!(response.expired_task_ids.is_empty());

        let grants = client
            .wait_for_starting_task(
                WaitForStartingTaskRequest {
                    token: "daemon-token".to_owned(),
                    env_desc: EnvironmentDesc::new("env-a"),
                    immediate_reqs: 1,
                    prefetch_reqs: 0,
                    next_keep_alive_in_ms: 10_000,
                    milliseconds_to_wait: 1000,
                    min_version: 0,
                },
                TIMEOUT,
            )
            .unwrap();
        assert_eq!(grants.grants.len(), 1);
        assert_eq!(grants.grants[0].servant_location, "127.0.0.1:8336");

        let statuses = client
            .keep_task_alive(
                KeepTaskAliveRequest {
                    token: "daemon-token".to_owned(),
                    task_grant_ids: vec![grants.grants[0].task_grant_id, 999_999],
                    next_keep_alive_in_ms: 10_000,
                },
                TIMEOUT,
            )
            .unwrap();
        assert_eq!(statuses.statuses, vec![true, false]);
    }

    #[test]
    fn test_bad_token_is_denied() {
        let (_server, client, _service) = start_scheduler();
        let mut request = heartbeat_for("127.0.0.1:8336", "env-a");
        request.token = "wrong".to_owned();
        match *client.heartbeat(request, TIMEOUT).unwrap_err().kind() {
            ErrorKind::AccessDenied => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_overlong_lease_is_invalid() {
        let (_server, client, _service) = start_scheduler();
        let mut request = heartbeat_for("127.0.0.1:8336", "env-a");
        request.next_heartbeat_in_ms = 60_000;
        match *client.heartbeat(request, TIMEOUT).unwrap_err().kind() {
            ErrorKind::InvalidArgument(_) => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_no_quota_when_cluster_is_empty() {
        let (_server, client, _service) = start_scheduler();
        let result = client.wait_for_starting_task(
            WaitForStartingTaskRequest {
                token: "daemon-token".to_owned(),
                env_desc: EnvironmentDesc::new("env-a"),
                immediate_reqs: 1,
                prefetch_reqs: 1,
                next_keep_alive_in_ms: 10_000,
                milliseconds_to_wait: 0,
                min_version: 0,
            },
            TIMEOUT,
        );
        match *result.unwrap_err().kind() {
            ErrorKind::NoQuotaAvailable => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_behind_nat_servant_gets_no_tasks() {
        let (_server, client, _service) = start_scheduler();
        // The peer is 127.0.0.1 but the servant claims a different address.
        client
            .heartbeat(heartbeat_for("10.1.2.3:8336", "env-a"), TIMEOUT)
            .unwrap();
        let result = client.wait_for_starting_task(
            WaitForStartingTaskRequest {
                token: "daemon-token".to_owned(),
                env_desc: EnvironmentDesc::new("env-a"),
                immediate_reqs: 1,
                prefetch_reqs: 0,
                next_keep_alive_in_ms: 10_000,
                milliseconds_to_wait: 0,
                min_version: 0,
            },
            TIMEOUT,
        );
        match *result.unwrap_err().kind() {
            ErrorKind::NoQuotaAvailable => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_get_config_returns_active_token() {
        let (_server, client, service) = start_scheduler();
        let config = client
            .get_config(
                GetConfigRequest {
                    token: "daemon-token".to_owned(),
                },
                TIMEOUT,
            )
            .unwrap();
        let all = service.determine_active_serving_daemon_tokens();
        assert_eq!(config.serving_daemon_token, all[1]);
    }

    #[test]
    fn test_prefetch_only_requests_get_grants_without_waiting() {
        let (_server, client, _service) = start_scheduler();
        client
            .heartbeat(heartbeat_for("127.0.0.1:8336", "env-a"), TIMEOUT)
            .unwrap();
        let grants = client
            .wait_for_starting_task(
                WaitForStartingTaskRequest {
                    token: "daemon-token".to_owned(),
                    env_desc: EnvironmentDesc::new("env-a"),
                    immediate_reqs: 0,
                    prefetch_reqs: 2,
                    next_keep_alive_in_ms: 10_000,
                    milliseconds_to_wait: 5000,
                    min_version: 0,
                },
                TIMEOUT,
            )
            .unwrap();
        assert_eq!(grants.grants.len(), 2);
    }

    #[test]
    fn test_invalid_location_is_rejected() {
        let (_server, client, _service) = start_scheduler();
        let mut request = heartbeat_for("not-an-address", "env-a");
        request.location = "not-an-address".to_owned();
        match *client.heartbeat(request, TIMEOUT).unwrap_err().kind() {
            ErrorKind::InvalidArgument(_) => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
    }
}
