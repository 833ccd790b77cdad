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

//! Mirrors the scheduler's cluster-wide running-task view, keyed by task
//! digest. Lets the dispatcher piggyback on an identical compile that is
//! already running somewhere instead of starting a second one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use protocol::GetRunningTasksRequest;
use rpc::SchedulerClient;
use util::PeriodicTimer;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);
/// A view older than this (refresh failing) is worse than no view.
const STALENESS_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunningTaskDesc {
    pub servant_location: String,
    pub servant_task_id: u64,
}

struct View {
    tasks: HashMap<String, RunningTaskDesc>,
    last_update: Instant,
}

pub struct RunningTaskKeeper {
    scheduler: SchedulerClient,
    token: String,
    view: Mutex<View>,
    timer: Mutex<Option<PeriodicTimer>>,
}

impl RunningTaskKeeper {
    pub fn new(scheduler: SchedulerClient, token: String) -> Arc<RunningTaskKeeper> {
        let keeper = Arc::new(RunningTaskKeeper {
            scheduler,
            token,
            view: Mutex::new(View {
                tasks: HashMap::new(),
                last_update: Instant::now(),
            }),
            timer: Mutex::new(None),
        });
        let k = keeper.clone();
        *keeper.timer.lock().unwrap() = Some(PeriodicTimer::spawn(
            "running-task-keeper",
            REFRESH_INTERVAL,
            move || k.refresh(),
        ));
        keeper
    }

    pub fn refresh(&self) {
        let result = self.scheduler.get_running_tasks(
            GetRunningTasksRequest { token: self.token.clone() },
            Duration::from_secs(5),
        );
        let mut view = self.view.lock().unwrap();
        match result {
            Ok(response) => {
                view.tasks = response
                    .running_tasks
                    .into_iter()
                    .map(|t| {
                        (
                            t.task_digest,
                            RunningTaskDesc {
                                servant_location: t.servant_location,
                                servant_task_id: t.servant_task_id,
                            },
                        )
                    })
                    .collect();
                view.last_update = Instant::now();
            }
            Err(_) => {
                warn!("Failed to get running tasks from scheduler.");
                if view.last_update.elapsed() > STALENESS_LIMIT {
                    view.tasks.clear();
                }
            }
        }
    }

    pub fn try_find_task(&self, task_digest: &str) -> Option<RunningTaskDesc> {
        self.view.lock().unwrap().tasks.get(task_digest).cloned()
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
