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

//! Keeps the serving-daemon token fresh. Servants only accept calls
//! carrying a token the scheduler currently vouches for, and the scheduler
//! rotates them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::GetConfigRequest;
use rpc::SchedulerClient;
use util::PeriodicTimer;

const FETCH_INTERVAL: Duration = Duration::from_secs(10);

pub struct ConfigKeeper {
    scheduler: SchedulerClient,
    token: String,
    serving_daemon_token: Mutex<String>,
    timer: Mutex<Option<PeriodicTimer>>,
}

impl ConfigKeeper {
    pub fn new(scheduler: SchedulerClient, token: String) -> Arc<ConfigKeeper> {
        let keeper = Arc::new(ConfigKeeper {
            scheduler,
            token,
            serving_daemon_token: Mutex::new(String::new()),
            timer: Mutex::new(None),
        });
        keeper.fetch_config(); // Don't serve requests with an empty token.
        let k = keeper.clone();
        *keeper.timer.lock().unwrap() = Some(PeriodicTimer::spawn(
            "config-keeper",
            FETCH_INTERVAL,
            move || k.fetch_config(),
        ));
        keeper
    }

    pub fn fetch_config(&self) {
        let result = self.scheduler.get_config(
            GetConfigRequest { token: self.token.clone() },
            Duration::from_secs(5),
        );
        match result {
            Ok(response) => {
                *self.serving_daemon_token.lock().unwrap() = response.serving_daemon_token;
            }
            Err(_) => warn!("Failed to fetch config from scheduler."),
        }
    }

    pub fn serving_daemon_token(&self) -> String {
        self.serving_daemon_token.lock().unwrap().clone()
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

#[cfg(test)]
mod test {
    use super::*;
    use rpc::Server;
    use scheduler::service::{SchedulerService, SchedulerServiceOptions};

    #[test]
    fn test_fetches_serving_token() {
        let service = Arc::new(SchedulerService::new(SchedulerServiceOptions {
            daemon_tokens: vec!["daemon-token".to_owned()],
            min_daemon_version: 0,
            token_rollout_interval: Duration::from_secs(3600),
            min_memory_for_new_task: 1 << 30,
        }));
        let server = Server::start("127.0.0.1:0", service.clone()).unwrap();
        let keeper = ConfigKeeper::new(
            SchedulerClient::new(&server.location()),
            "daemon-token".to_owned(),
        );
        let token = keeper.serving_daemon_token();
        assert_eq!(token.len(), 32); // 16 random bytes, hex.
        keeper.stop();
        keeper.join();
    }
}
