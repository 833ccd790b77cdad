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

extern crate bincode;
extern crate blake3;
extern crate byteorder;
extern crate chrono;
extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate error_chain;
extern crate filetime;
extern crate futures;
extern crate futures_cpupool;
#[macro_use]
extern crate lazy_static;
extern crate libc;
#[macro_use]
extern crate log;
extern crate num_cpus;
extern crate percent_encoding;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate tempdir;
extern crate zstd;

mod bloom;
mod cache;
mod cmdline;
mod config;
mod consistent_hash;
mod daemon;
mod errors;
mod multi_chunk;
mod protocol;
mod rpc;
mod scheduler;
mod util;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cmdline::Command;
use errors::*;

fn main() {
    env_logger::init();
    let result = cmdline::parse_command_line().and_then(run);
    if let Err(e) = result {
        error!("yadcc: {}", e);
        for cause in e.iter().skip(1) {
            error!("caused by: {}", cause);
        }
        process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Scheduler { port, options } => {
            let service = Arc::new(scheduler::service::SchedulerService::new(options));
            service.start();
            let server = rpc::Server::start(&format!("0.0.0.0:{}", port), service.clone())?;
            info!("Scheduler serving on {}.", server.local_addr());
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
        Command::CacheServer { port, options } => {
            let service = Arc::new(cache::server::CacheService::new(options)?);
            cache::server::CacheService::start(&service);
            let server = rpc::Server::start(&format!("0.0.0.0:{}", port), service.clone())?;
            info!("Cache server serving on {}.", server.local_addr());
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
        Command::Daemon(options) => {
            let daemon = daemon::Daemon::start(options)?;
            info!("Daemon up.");
            while !daemon.leaving() {
                thread::sleep(Duration::from_millis(500));
            }
            info!("Shutting down.");
            daemon.stop();
            daemon.join();
            Ok(())
        }
    }
}
