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

//! Caps how many local processes the wrapper may run concurrently,
//! independent of remote dispatch. Preprocessing is cheap compared to a
//! full compile, so lightweight tasks get a separate over-provision budget.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json;
use util::{self, PeriodicTimer};

const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct LocalTaskMonitor {
    max_tasks: usize,
    lightweight_overprovision: usize,
    // PIDs holding a quota right now.
    permissions: Mutex<HashSet<u32>>,
    permission_cv: Condvar,
    timer: Mutex<Option<PeriodicTimer>>,
}

impl LocalTaskMonitor {
    /// `max_tasks = 0` means "half the processors". Defaulting to all of
    /// them OOMs link-heavy workloads too easily.
    pub fn new(max_tasks: usize, lightweight_overprovision_ratio: f64) -> Arc<LocalTaskMonitor> {
        let max_tasks = if max_tasks != 0 {
            max_tasks
        } else {
            ::std::cmp::max(1, ::num_cpus::get() / 2)
        };
        let monitor = Arc::new(LocalTaskMonitor {
            max_tasks,
            lightweight_overprovision: (max_tasks as f64 * lightweight_overprovision_ratio)
                as usize,
            permissions: Mutex::new(HashSet::new()),
            permission_cv: Condvar::new(),
            timer: Mutex::new(None),
        });
        let m = monitor.clone();
        *monitor.timer.lock().unwrap() = Some(PeriodicTimer::spawn(
            "local-task-liveness",
            LIVENESS_CHECK_INTERVAL,
            move || m.on_alive_process_check(),
        ));
        monitor
    }

    /// Waits up to `timeout` for a free slot and records `pid` as holding
    /// it. Returns false on timeout.
    pub fn wait_for_running_new_task_permission(
        &self,
        pid: u32,
        lightweight: bool,
        timeout: Duration,
    ) -> bool {
        let limit = self.max_tasks
            + if lightweight {
                self.lightweight_overprovision
            } else {
                0
            };
        let deadline = Instant::now() + timeout;
        let mut permissions = self.permissions.lock().unwrap();
        while permissions.len() >= limit {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .permission_cv
                .wait_timeout(permissions, deadline - now)
                .unwrap();
            permissions = guard;
        }
        if !permissions.insert(pid) {
            // The quota stays single-counted; this request is a no-op.
            error!(
                "Unexpected: Duplicated process ID [{}]. Allowing this task blindly.",
                pid
            );
        }
        true
    }

    pub fn drop_task_permission(&self, pid: u32) {
        {
            let mut permissions = self.permissions.lock().unwrap();
            if !permissions.remove(&pid) {
                error!(
                    "Unexpected: Dropping permission of unknown task with process ID [{}].",
                    pid
                );
                return;
            }
        }
        // `notify_all`, not `notify_one`: waiters are not equal. Waking a
        // heavyweight waiter when only the over-provision budget freed up
        // would waste the slot a lightweight waiter could use.
        self.permission_cv.notify_all();
    }

    /// Releases quotas of processes that died without telling us.
    pub fn on_alive_process_check(&self) {
        {
            let mut permissions = self.permissions.lock().unwrap();
            let dead: Vec<u32> = permissions
                .iter()
                .cloned()
                .filter(|&pid| !util::is_process_alive(pid))
                .collect();
            for pid in dead {
                warn!("Process [{}] exited without notifying us. Crashed?", pid);
                permissions.remove(&pid);
            }
        }
        self.permission_cv.notify_all();
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let permissions = self.permissions.lock().unwrap();
        json!({
            "running_tasks": permissions.len(),
            "max_tasks": self.max_tasks,
            "lightweight_task_overprovisioning": self.lightweight_overprovision,
            "holders": permissions.iter().cloned().collect::<Vec<u32>>(),
        })
    }

    pub fn stop(&self) {
        if let Some(ref timer) = *self.timer.lock().unwrap() {
            timer.stop();
        }
    }

    pub fn join(&self) {
        if let Some(ref mut timer) = *self.timer.lock().unwrap() {
            timer.join();
        }
    }
}
