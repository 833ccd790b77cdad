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

//! Grant allocation: which servant gets which task, for how long. All
//! registry state (servants and grants) lives behind one allocation lock;
//! waiters for capacity block on its condition variable.

pub mod service;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use protocol::{
    EnvironmentDesc, NotAcceptingTaskReason, RunningTask, RunningTaskReport, ServantPriority,
};
use serde_json;
use util::{self, PeriodicTimer};

const EXPIRATION_TICK: Duration = Duration::from_secs(1);

/// What we know about a task when deciding where to place it.
#[derive(Debug, Clone)]
pub struct TaskPersonality {
    pub requestor_ip: String,
    pub env_desc: EnvironmentDesc,
    /// Oldest servant daemon version the requestor is willing to talk to.
    pub min_servant_version: u32,
}

/// A successful allocation. The holder must renew it with `keep_task_alive`
/// before the lease runs out.
#[derive(Debug, Clone)]
pub struct TaskAllocation {
    pub task_id: u64,
    pub servant_location: String,
}

#[derive(Debug, Clone)]
pub struct ServantPersonality {
    pub version: u32,
    /// ip:port as observed by us; authoritative.
    pub observed_location: String,
    /// ip:port the servant reported. Differs when the servant sits behind
    /// NAT.
    pub reported_location: String,
    pub environments: Vec<EnvironmentDesc>,
    pub num_processors: u64,
    pub max_tasks: u64,
    pub total_memory_in_bytes: u64,
    pub memory_available_in_bytes: u64,
    pub priority: ServantPriority,
    pub not_accepting_task_reason: NotAcceptingTaskReason,
    pub current_load: u64,
}

struct ServantDesc {
    personality: ServantPersonality,
    discovered_at: SystemTime,
    expires_at: Instant,
    running_tasks: u64,
    ever_assigned_tasks: u64,
}

struct TaskDesc {
    task_id: u64,
    personality: TaskPersonality,
    servant_id: u64,
    started_at: SystemTime,
    expires_at: Instant,
    is_prefetch: bool,
    // An expired grant is not forgotten right away: it stays a zombie until
    // the owning servant's heartbeat confirms the task is gone. Forgetting
    // earlier would let us over-schedule onto a servant that hasn't noticed
    // the expiry yet.
    zombie: bool,
    // Filled in from heartbeat running-task reports; serves the dedup view.
    servant_task_id: u64,
    task_digest: String,
}

#[derive(Default)]
struct Registry {
    next_servant_id: u64,
    next_task_id: u64,
    servants: HashMap<u64, ServantDesc>,
    tasks: HashMap<u64, TaskDesc>,
}

pub struct TaskDispatcher {
    // Guards servants and grants alike; heartbeat processing, allocation and
    // expiration all serialize here.
    registry: Mutex<Registry>,
    allocation_cv: Condvar,
    min_memory_for_new_task: u64,
    gc_timer: Mutex<Option<PeriodicTimer>>,
}

impl TaskDispatcher {
    pub fn new(min_memory_for_new_task: u64) -> TaskDispatcher {
        TaskDispatcher {
            registry: Mutex::new(Registry::default()),
            allocation_cv: Condvar::new(),
            min_memory_for_new_task,
            gc_timer: Mutex::new(None),
        }
    }

    pub fn start(dispatcher: &Arc<TaskDispatcher>) {
        let d = dispatcher.clone();
        *dispatcher.gc_timer.lock().unwrap() = Some(PeriodicTimer::spawn(
            "scheduler-expiration",
            EXPIRATION_TICK,
            move || d.on_expiration_timer(),
        ));
    }

    pub fn stop(&self) {
        if let Some(ref timer) = *self.gc_timer.lock().unwrap() {
            timer.stop();
        }
    }

    pub fn join(&self) {
        if let Some(ref mut timer) = *self.gc_timer.lock().unwrap() {
            timer.join();
        }
    }

    /// Waits up to `timeout` for a servant able to run the task, and grants
    /// it for `expires_in`. The lease starts counting when the grant is
    /// made, not when the wait began.
    pub fn wait_for_starting_new_task(
        &self,
        personality: &TaskPersonality,
        expires_in: Duration,
        timeout: Duration,
        prefetching: bool,
    ) -> Option<TaskAllocation> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock().unwrap();
        loop {
            let eligibles = enumerate_eligible_servants(
                &registry,
                personality,
                self.min_memory_for_new_task,
            );
            if !eligibles.is_empty() {
                let picked = pick_servant_for(
                    &registry,
                    eligibles,
                    &personality.requestor_ip,
                    self.min_memory_for_new_task,
                );
                let servant = registry.servants.get_mut(&picked).unwrap();
                servant.running_tasks += 1;
                servant.ever_assigned_tasks += 1;
                let servant_location = servant.personality.observed_location.clone();

                registry.next_task_id += 1;
                let task_id = registry.next_task_id;
                registry.tasks.insert(
                    task_id,
                    TaskDesc {
                        task_id,
                        personality: personality.clone(),
                        servant_id: picked,
                        started_at: SystemTime::now(),
                        expires_at: Instant::now() + expires_in,
                        is_prefetch: prefetching,
                        zombie: false,
                        servant_task_id: 0,
                        task_digest: String::new(),
                    },
                );
                return Some(TaskAllocation { task_id, servant_location });
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .allocation_cv
                .wait_timeout(registry, deadline - now)
                .unwrap();
            registry = guard;
        }
    }

    /// Extends a grant. Refuses zombies and unknown ids.
    pub fn keep_task_alive(&self, task_id: u64, new_expires_in: Duration) -> bool {
        let mut registry = self.registry.lock().unwrap();
        let task = match registry.tasks.get_mut(&task_id) {
            Some(t) => t,
            None => {
                warn!("Unexpected: Renewing unknown task [{}].", task_id);
                return false;
            }
        };
        if task.zombie {
            warn!(
                "The client tries to keep zombie [{}] alive. It's too late.",
                task_id
            );
            return false;
        }
        task.expires_at = Instant::now() + new_expires_in;
        true
    }

    /// Best-effort release. Releasing is not required for correctness, the
    /// grant expires on its own; it just frees capacity sooner.
    pub fn free_task(&self, task_id: u64) {
        let mut registry = self.registry.lock().unwrap();
        self.free_tasks_locked(&mut registry, &[task_id], true);
    }

    fn free_tasks_locked(&self, registry: &mut Registry, task_ids: &[u64], warn_unknown: bool) {
        for &id in task_ids {
            let servant_id = match registry.tasks.remove(&id) {
                Some(task) => task.servant_id,
                None => {
                    if warn_unknown {
                        warn!("Unexpected: Freeing unknown task [{}].", id);
                    }
                    continue;
                }
            };
            if let Some(servant) = registry.servants.get_mut(&servant_id) {
                servant.running_tasks = servant.running_tasks.saturating_sub(1);
            }
        }
        // Wake every waiter; not all waiters are equal (environments differ).
        self.allocation_cv.notify_all();
    }

    /// Registers the servant or refreshes its expiry; heartbeats carry the
    /// whole personality, so whatever the servant reports wins.
    pub fn keep_servant_alive(&self, personality: ServantPersonality, expires_in: Duration) {
        let mut registry = self.registry.lock().unwrap();
        for servant in registry.servants.values_mut() {
            if servant.personality.observed_location == personality.observed_location {
                servant.personality = personality;
                servant.expires_at = Instant::now() + expires_in;
                self.allocation_cv.notify_all();
                return;
            }
        }

        if personality.observed_location != personality.reported_location {
            info!(
                "Discovered new servant at [{}]. The servant is reporting itself at [{}]. \
                 It's likely the servant is behind NAT.",
                personality.observed_location, personality.reported_location
            );
        } else {
            info!("Discovered new servant at [{}].", personality.observed_location);
        }
        registry.next_servant_id += 1;
        let id = registry.next_servant_id;
        registry.servants.insert(
            id,
            ServantDesc {
                personality,
                discovered_at: SystemTime::now(),
                expires_at: Instant::now() + expires_in,
                running_tasks: 0,
                ever_assigned_tasks: 0,
            },
        );
        self.allocation_cv.notify_all();
    }

    /// Reconciles the servant's reported running set with ours. Returns the
    /// reported tasks we do not recognize; the servant should kill those.
    /// Zombies the servant no longer reports are forgotten here.
    pub fn examine_running_tasks(
        &self,
        servant_location: &str,
        running_tasks: &[RunningTaskReport],
    ) -> Vec<u64> {
        let mut registry = self.registry.lock().unwrap();
        let servant_id = registry
            .servants
            .iter()
            .find(|&(_, s)| s.personality.observed_location == servant_location)
            .map(|(&id, _)| id);
        let servant_id = match servant_id {
            // The servant itself has expired; everything it runs is unknown.
            None => return running_tasks.iter().map(|r| r.task_grant_id).collect(),
            Some(id) => id,
        };

        let reported: HashSet<u64> = running_tasks.iter().map(|r| r.task_grant_id).collect();

        // Zombies the servant does not recognize (any more) are done for
        // good. Whether the zombie was made before or after this heartbeat
        // left the servant doesn't matter; so long as the servant doesn't
        // know the task, it can't be running there.
        let sweeping: Vec<u64> = registry
            .tasks
            .values()
            .filter(|t| t.servant_id == servant_id && t.zombie && !reported.contains(&t.task_id))
            .map(|t| t.task_id)
            .collect();
        let non_prefetch = registry
            .tasks
            .values()
            .filter(|t| sweeping.contains(&t.task_id) && !t.is_prefetch)
            .count();
        if non_prefetch > 0 {
            warn!("Sweeping {} (non-prefetched) zombie tasks.", non_prefetch);
        }
        self.free_tasks_locked(&mut registry, &sweeping, false);

        // Record servant-side ids and digests on grants we do recognize, and
        // report back whatever we don't.
        let mut unknown = Vec::new();
        for report in running_tasks {
            match registry.tasks.get_mut(&report.task_grant_id) {
                Some(task) if task.servant_id == servant_id && !task.zombie => {
                    task.servant_task_id = report.servant_task_id;
                    task.task_digest = report.task_digest.clone();
                }
                _ => {
                    trace!(
                        "Servant [{}] reported an unknown task [{}].",
                        servant_location,
                        report.task_grant_id
                    );
                    unknown.push(report.task_grant_id);
                }
            }
        }
        unknown
    }

    /// The cluster-wide running view, for in-flight dedup. Only grants whose
    /// servant has reported them (digest known) show up.
    pub fn get_running_tasks(&self) -> Vec<RunningTask> {
        let registry = self.registry.lock().unwrap();
        registry
            .tasks
            .values()
            .filter(|t| !t.zombie && !t.task_digest.is_empty())
            .filter_map(|t| {
                registry.servants.get(&t.servant_id).map(|s| RunningTask {
                    task_grant_id: t.task_id,
                    servant_task_id: t.servant_task_id,
                    servant_location: s.personality.observed_location.clone(),
                    task_digest: t.task_digest.clone(),
                })
            })
            .collect()
    }

    /// One GC tick: drop expired servants, immediately drop their grants,
    /// and turn expired grants into zombies.
    pub fn on_expiration_timer(&self) {
        let now = Instant::now();
        let mut registry = self.registry.lock().unwrap();

        let expired: Vec<u64> = registry
            .servants
            .iter()
            .filter(|&(_, s)| s.expires_at < now)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            let servant = registry.servants.remove(&id).unwrap();
            info!(
                "Removing expired servant [{}]. It served us for {} seconds.",
                servant.personality.observed_location,
                servant
                    .discovered_at
                    .elapsed()
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            );
        }

        // Grants whose servant has gone are dropped outright, not zombied.
        let orphans: Vec<u64> = {
            let servants = &registry.servants;
            registry
                .tasks
                .values()
                .filter(|t| !servants.contains_key(&t.servant_id))
                .map(|t| t.task_id)
                .collect()
        };
        if !orphans.is_empty() {
            warn!("Sweeping {} orphan tasks.", orphans.len());
            self.free_tasks_locked(&mut registry, &orphans, false);
        }

        for task in registry.tasks.values_mut() {
            if !task.zombie && task.expires_at < now {
                task.zombie = true;
                trace!(
                    "Task [{}] expired; keeping it as a zombie until its servant confirms.{}",
                    task.task_id,
                    if task.is_prefetch {
                        " The task was started because of a prefetch request."
                    } else {
                        ""
                    }
                );
            }
        }
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let registry = self.registry.lock().unwrap();
        let mut servants = Vec::new();
        let mut total_running = 0u64;
        let mut cluster_capacity = 0u64;
        for servant in registry.servants.values() {
            let p = &servant.personality;
            total_running += servant.running_tasks;
            cluster_capacity += p.max_tasks;
            servants.push(json!({
                "version": p.version,
                "location": p.observed_location,
                "reported_location": p.reported_location,
                "environments": p.environments.iter()
                    .map(|e| e.compiler_digest.clone()).collect::<Vec<_>>(),
                "priority": format!("{:?}", p.priority),
                "max_tasks": p.max_tasks,
                "not_accepting_task_reason": format!("{:?}", p.not_accepting_task_reason),
                "num_processors": p.num_processors,
                "current_load": p.current_load,
                "capacity_available":
                    capacity_available(servant, self.min_memory_for_new_task),
                "running_tasks": servant.running_tasks,
                "ever_assigned_tasks": servant.ever_assigned_tasks,
                "discovered_at": util::format_time(servant.discovered_at),
            }));
        }
        let mut tasks = serde_json::Map::new();
        for task in registry.tasks.values() {
            tasks.insert(
                task.task_id.to_string(),
                json!({
                    "requestor_ip": task.personality.requestor_ip,
                    "compiler_digest": task.personality.env_desc.compiler_digest,
                    "started_at": util::format_time(task.started_at),
                    "prefetched_task": task.is_prefetch,
                    "zombie": task.zombie,
                    "servant_location": registry.servants.get(&task.servant_id)
                        .map(|s| s.personality.observed_location.clone())
                        .unwrap_or_default(),
                }),
            );
        }
        json!({
            "servants": servants,
            "tasks": tasks,
            "servants_up": registry.servants.len(),
            "running_tasks": total_running,
            "capacity": cluster_capacity,
        })
    }

    #[cfg(test)]
    fn running_tasks_of(&self, location: &str) -> u64 {
        let registry = self.registry.lock().unwrap();
        registry
            .servants
            .values()
            .find(|s| s.personality.observed_location == location)
            .map(|s| s.running_tasks)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn live_grants(&self) -> usize {
        self.registry.lock().unwrap().tasks.len()
    }
}

/// Capacity usable by us: what the servant allows, minus processors eaten by
/// load we didn't cause. A servant low on memory effectively has capacity
/// equal to its current running count, so nothing new lands there.
fn capacity_available(servant: &ServantDesc, min_memory_for_new_task: u64) -> u64 {
    if servant.personality.memory_available_in_bytes < min_memory_for_new_task {
        return servant.running_tasks;
    }
    // `current_load` lags behind: a task that just finished still shows up
    // in it for a while. Subtracting `running_tasks` compensates for our own
    // share of the load, once, without double-counting.
    let foreign_load = servant
        .personality
        .current_load
        .saturating_sub(servant.running_tasks);
    let free_processors = servant.personality.num_processors.saturating_sub(foreign_load);
    ::std::cmp::min(servant.personality.max_tasks, free_processors)
}

fn enumerate_eligible_servants(
    registry: &Registry,
    task: &TaskPersonality,
    min_memory_for_new_task: u64,
) -> Vec<u64> {
    let mut env_recognized = false;
    let mut eligibles = Vec::new();
    for (&id, servant) in &registry.servants {
        if servant.personality.version < task.min_servant_version {
            continue;
        }
        if !servant
            .personality
            .environments
            .iter()
            .any(|e| e.compiler_digest == task.env_desc.compiler_digest)
        {
            continue;
        }
        env_recognized = true;
        // Running can exceed capacity if the servant shrank its limits after
        // we made allocations; such servants are simply not eligible.
        if servant.running_tasks >= capacity_available(servant, min_memory_for_new_task) {
            continue;
        }
        eligibles.push(id);
    }
    if !env_recognized && !registry.servants.is_empty() {
        debug!(
            "Unrecognized compilation environment [{}] requested by [{}].",
            task.env_desc.compiler_digest, task.requestor_ip
        );
    }
    eligibles
}

fn is_same_host(location: &str, ip: &str) -> bool {
    location.len() > ip.len()
        && location.as_bytes()[ip.len()] == b':'
        && location.starts_with(ip)
}

fn pick_servant_for(
    registry: &Registry,
    mut eligibles: Vec<u64>,
    requestor_ip: &str,
    min_memory_for_new_task: u64,
) -> u64 {
    // Prefer not to assign the requestor's task to itself; its own CPU is
    // better spent on preprocessing, which cannot be distributed.
    let mut self_id = None;
    if let Some(pos) = eligibles.iter().position(|id| {
        is_same_host(
            &registry.servants[id].personality.observed_location,
            requestor_ip,
        )
    }) {
        self_id = Some(eligibles.remove(pos));
    }

    // A dedicated servant under half load beats everything else.
    let dedicated: Vec<u64> = eligibles
        .iter()
        .cloned()
        .filter(|id| {
            let s = &registry.servants[id];
            s.personality.priority == ServantPriority::Dedicated
                && s.running_tasks * 2 < s.personality.num_processors
        })
        .collect();
    if let Some(id) = pick_least_utilized(registry, &dedicated, min_memory_for_new_task) {
        return id;
    }
    if let Some(id) = pick_least_utilized(registry, &eligibles, min_memory_for_new_task) {
        return id;
    }
    // Only the requestor itself qualifies, and its capacity allows.
    self_id.expect("no servant to pick from")
}

fn pick_least_utilized(
    registry: &Registry,
    candidates: &[u64],
    min_memory_for_new_task: u64,
) -> Option<u64> {
    let mut best: Option<(u64, f64)> = None;
    for &id in candidates {
        let servant = &registry.servants[&id];
        let capacity = capacity_available(servant, min_memory_for_new_task);
        debug_assert!(capacity > servant.running_tasks);
        let utilization = servant.running_tasks as f64 / capacity as f64;
        match best {
            Some((_, u)) if u <= utilization => {}
            _ => best = Some((id, utilization)),
        }
    }
    best.map(|(id, _)| id)
}

#[cfg(test)]
mod test {
    use super::*;

    fn personality(location: &str, env: &str) -> ServantPersonality {
        ServantPersonality {
            version: 2,
            observed_location: location.to_owned(),
            reported_location: location.to_owned(),
            environments: vec![EnvironmentDesc::new(env)],
            num_processors: 8,
            max_tasks: 4,
            total_memory_in_bytes: 32 << 30,
            memory_available_in_bytes: 32 << 30,
            priority: ServantPriority::User,
            not_accepting_task_reason: NotAcceptingTaskReason::None,
            current_load: 0,
        }
    }

    fn task_for(env: &str, requestor: &str) -> TaskPersonality {
        TaskPersonality {
            requestor_ip: requestor.to_owned(),
            env_desc: EnvironmentDesc::new(env),
            min_servant_version: 0,
        }
    }

    const LEASE: Duration = Duration::from_secs(10);
    const NO_WAIT: Duration = Duration::from_secs(0);

    #[test]
    fn test_allocation_within_capacity() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);

        for _ in 0..4 {
            let grant = dispatcher
                .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
                .unwrap();
            assert_eq!(grant.servant_location, "10.0.0.1:8336");
        }
        // max_tasks = 4; the fifth must not be granted.
        assert!(dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .is_none());
        assert_eq!(dispatcher.running_tasks_of("10.0.0.1:8336"), 4);

        // Freeing one makes room again.
        dispatcher.free_task(1);
        assert!(dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .is_some());
    }

    #[test]
    fn test_unknown_environment_is_not_allocatable() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        assert!(dispatcher
            .wait_for_starting_new_task(&task_for("other", "10.0.0.9"), LEASE, NO_WAIT, false)
            .is_none());
    }

    #[test]
    fn test_old_servants_are_skipped_when_a_minimum_version_is_demanded() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        let mut picky = task_for("env", "10.0.0.9");
        picky.min_servant_version = 99;
        assert!(dispatcher
            .wait_for_starting_new_task(&picky, LEASE, NO_WAIT, false)
            .is_none());
        picky.min_servant_version = 2;
        assert!(dispatcher
            .wait_for_starting_new_task(&picky, LEASE, NO_WAIT, false)
            .is_some());
    }

    #[test]
    fn test_memory_floor_blocks_new_tasks() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        let mut starving = personality("10.0.0.1:8336", "env");
        starving.memory_available_in_bytes = 1 << 30;
        dispatcher.keep_servant_alive(starving, LEASE);
        assert!(dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .is_none());
    }

    #[test]
    fn test_foreign_load_subtracts_capacity_once() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        let mut loaded = personality("10.0.0.1:8336", "env");
        // 8 processors, load of 7 with nothing of ours running: one slot.
        loaded.current_load = 7;
        loaded.max_tasks = 8;
        dispatcher.keep_servant_alive(loaded, LEASE);
        assert!(dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .is_some());
        assert!(dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .is_none());
    }

    #[test]
    fn test_requestor_is_picked_last() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        dispatcher.keep_servant_alive(personality("10.0.0.2:8336", "env"), LEASE);

        // 10.0.0.1 requests; the other machine must serve it even though
        // both are idle.
        for _ in 0..4 {
            let grant = dispatcher
                .wait_for_starting_new_task(&task_for("env", "10.0.0.1"), LEASE, NO_WAIT, false)
                .unwrap();
            assert_eq!(grant.servant_location, "10.0.0.2:8336");
        }
        // The peer is full now; self is the only one left.
        let grant = dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.1"), LEASE, NO_WAIT, false)
            .unwrap();
        assert_eq!(grant.servant_location, "10.0.0.1:8336");
    }

    #[test]
    fn test_idle_dedicated_servant_is_preferred() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        let mut dedicated = personality("10.0.0.2:8336", "env");
        dedicated.priority = ServantPriority::Dedicated;
        dedicated.max_tasks = 8;
        dispatcher.keep_servant_alive(dedicated, LEASE);

        // Up to half its processors, the dedicated node takes everything.
        for _ in 0..4 {
            let grant = dispatcher
                .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
                .unwrap();
            assert_eq!(grant.servant_location, "10.0.0.2:8336");
        }
        // Beyond 50% load the ordinary least-utilized rule applies; the idle
        // user node wins now.
        let grant = dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .unwrap();
        assert_eq!(grant.servant_location, "10.0.0.1:8336");
    }

    #[test]
    fn test_least_utilized_wins() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        dispatcher.keep_servant_alive(personality("10.0.0.2:8336", "env"), LEASE);

        // Grants alternate between the two idle machines.
        let mut counts = HashMap::new();
        for _ in 0..8 {
            let grant = dispatcher
                .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
                .unwrap();
            *counts.entry(grant.servant_location).or_insert(0) += 1;
        }
        assert_eq!(counts["10.0.0.1:8336"], 4);
        assert_eq!(counts["10.0.0.2:8336"], 4);
    }

    #[test]
    fn test_expired_grant_becomes_zombie_then_is_swept_by_heartbeat() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        let grant = dispatcher
            .wait_for_starting_new_task(
                &task_for("env", "10.0.0.9"),
                Duration::from_millis(50),
                NO_WAIT,
                false,
            )
            .unwrap();

        ::std::thread::sleep(Duration::from_millis(80));
        dispatcher.on_expiration_timer();

        // Zombie now: renewals are refused, but the grant still occupies the
        // servant so we don't over-schedule.
        assert!(!dispatcher.keep_task_alive(grant.task_id, LEASE));
        assert_eq!(dispatcher.running_tasks_of("10.0.0.1:8336"), 1);
        assert_eq!(dispatcher.live_grants(), 1);

        // The servant's next heartbeat doesn't mention the task: forget it.
        let unknown = dispatcher.examine_running_tasks("10.0.0.1:8336", &[]);
        assert!(unknown.is_empty());
        assert_eq!(dispatcher.live_grants(), 0);
        assert_eq!(dispatcher.running_tasks_of("10.0.0.1:8336"), 0);
        assert!(!dispatcher.keep_task_alive(grant.task_id, LEASE));
    }

    #[test]
    fn test_servant_loss_sweeps_grants_immediately() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(
            personality("10.0.0.1:8336", "env"),
            Duration::from_millis(50),
        );
        let grant = dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .unwrap();

        ::std::thread::sleep(Duration::from_millis(80));
        dispatcher.on_expiration_timer();

        // Servant gone: the grant goes with it, zombie state skipped.
        assert_eq!(dispatcher.live_grants(), 0);
        assert!(!dispatcher.keep_task_alive(grant.task_id, LEASE));
    }

    #[test]
    fn test_examine_running_tasks_reports_unknown_and_records_digests() {
        let dispatcher = TaskDispatcher::new(10 << 30);
        dispatcher.keep_servant_alive(personality("10.0.0.1:8336", "env"), LEASE);
        let grant = dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .unwrap();

        let unknown = dispatcher.examine_running_tasks(
            "10.0.0.1:8336",
            &[
                RunningTaskReport {
                    task_grant_id: grant.task_id,
                    servant_task_id: 77,
                    task_digest: "digest-a".to_owned(),
                },
                RunningTaskReport {
                    task_grant_id: 424242,
                    servant_task_id: 78,
                    task_digest: "digest-b".to_owned(),
                },
            ],
        );
        assert_eq!(unknown, vec![424242]);

        let running = dispatcher.get_running_tasks();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_grant_id, grant.task_id);
        assert_eq!(running[0].servant_task_id, 77);
        assert_eq!(running[0].task_digest, "digest-a");
        assert_eq!(running[0].servant_location, "10.0.0.1:8336");
    }

    #[test]
    fn test_grant_waits_for_capacity() {
        let dispatcher = Arc::new(TaskDispatcher::new(10 << 30));
        let mut one_slot = personality("10.0.0.1:8336", "env");
        one_slot.max_tasks = 1;
        dispatcher.keep_servant_alive(one_slot, LEASE);
        let grant = dispatcher
            .wait_for_starting_new_task(&task_for("env", "10.0.0.9"), LEASE, NO_WAIT, false)
            .unwrap();

        // A waiter blocks until the grant is freed from another thread.
        let d = dispatcher.clone();
        let freer = ::std::thread::spawn(move || {
            ::std::thread::sleep(Duration::from_millis(50));
            d.free_task(grant.task_id);
        });
        let granted = dispatcher.wait_for_starting_new_task(
            &task_for("env", "10.0.0.9"),
            LEASE,
            Duration::from_secs(5),
            false,
        );
        freer.join().unwrap();
        assert!(granted.is_some());
    }
}
