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

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::time::Duration;

use cache::disk;
use cache::server::CacheServiceOptions;
use config;
use daemon::DaemonOptions;
use errors::*;
use protocol::ServantPriority;
use scheduler::service::SchedulerServiceOptions;

pub enum Command {
    Scheduler { port: u16, options: SchedulerServiceOptions },
    CacheServer { port: u16, options: CacheServiceOptions },
    Daemon(DaemonOptions),
}

/// Parses the process command line into one of the three server roles.
pub fn parse_command_line() -> Result<Command> {
    let matches = App::new("yadcc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed C/C++ compilation cloud")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("scheduler")
                .about("Cluster-wide admission controller")
                .arg(Arg::with_name("port").long("port").takes_value(true)
                     .default_value("8336"))
                .arg(Arg::with_name("daemon-tokens").long("daemon-tokens")
                     .takes_value(true).required(true)
                     .help("Comma-separated tokens daemons may authenticate with"))
                .arg(Arg::with_name("min-daemon-version").long("min-daemon-version")
                     .takes_value(true).default_value("0"))
                .arg(Arg::with_name("token-rollout-interval")
                     .long("token-rollout-interval").takes_value(true)
                     .default_value("3600")
                     .help("Seconds between serving-daemon token rotations"))
                .arg(Arg::with_name("servant-min-memory-for-new-task")
                     .long("servant-min-memory-for-new-task").takes_value(true)
                     .default_value("10G")
                     .help("Servants below this much free memory get no new tasks")),
        )
        .subcommand(
            SubCommand::with_name("cache-server")
                .about("Shared compilation-result cache")
                .arg(Arg::with_name("port").long("port").takes_value(true)
                     .default_value("8337"))
                .arg(Arg::with_name("cache-dirs").long("cache-dirs")
                     .takes_value(true).default_value("10G,./cache")
                     .help("size1,path1:size2,path2 shard configuration"))
                .arg(Arg::with_name("action-on-misplaced-cache-entry")
                     .long("action-on-misplaced-cache-entry").takes_value(true)
                     .default_value("delete")
                     .possible_values(&["delete", "move", "ignore"]))
                .arg(Arg::with_name("cache-engine").long("cache-engine")
                     .takes_value(true).default_value("disk"))
                .arg(Arg::with_name("max-in-memory-cache-size")
                     .long("max-in-memory-cache-size").takes_value(true)
                     .default_value("4G"))
                .arg(Arg::with_name("user-tokens").long("user-tokens")
                     .takes_value(true).required(true)
                     .help("Tokens that authorize reads and filter fetches"))
                .arg(Arg::with_name("servant-tokens").long("servant-tokens")
                     .takes_value(true).required(true)
                     .help("Tokens that authorize cache fills")),
        )
        .subcommand(
            SubCommand::with_name("daemon")
                .about("Per-machine daemon: requestor delegate + servant")
                .arg(Arg::with_name("scheduler").long("scheduler")
                     .takes_value(true).required(true)
                     .help("ip:port of the scheduler"))
                .arg(Arg::with_name("cache-server").long("cache-server")
                     .takes_value(true)
                     .help("ip:port of the cache server; omit to disable caching"))
                .arg(Arg::with_name("token").long("token")
                     .takes_value(true).required(true))
                .arg(Arg::with_name("serving-port").long("serving-port")
                     .takes_value(true).default_value("8338"))
                .arg(Arg::with_name("local-port").long("local-port")
                     .takes_value(true).default_value("8334"))
                .arg(Arg::with_name("advertised-ip").long("advertised-ip")
                     .takes_value(true).required(true)
                     .help("IP other daemons can reach us at"))
                .arg(Arg::with_name("priority").long("priority")
                     .takes_value(true).default_value("user")
                     .possible_values(&["user", "dedicated"]))
                .arg(Arg::with_name("capacity").long("capacity")
                     .takes_value(true).default_value("0")
                     .help("Concurrent remote compilations served; 0 = nproc"))
                .arg(Arg::with_name("max-local-tasks").long("max-local-tasks")
                     .takes_value(true).default_value("0")
                     .help("Concurrent local tasks allowed; 0 = nproc/2"))
                .arg(Arg::with_name("lightweight-overprovisioning-ratio")
                     .long("lightweight-overprovisioning-ratio")
                     .takes_value(true).default_value("1.0"))
                .arg(Arg::with_name("extra-compiler-dirs")
                     .long("extra-compiler-dirs").takes_value(true)
                     .default_value("")
                     .help("Colon-separated directories searched for compilers \
                            besides PATH")),
        )
        .get_matches();

    match matches.subcommand() {
        ("scheduler", Some(m)) => parse_scheduler(m),
        ("cache-server", Some(m)) => parse_cache_server(m),
        ("daemon", Some(m)) => parse_daemon(m),
        _ => unreachable!("clap enforces a subcommand"),
    }
}

fn parse_port(m: &ArgMatches, name: &str) -> Result<u16> {
    m.value_of(name)
        .unwrap()
        .parse()
        .chain_err(|| format!("invalid {}", name))
}

fn parse_scheduler(m: &ArgMatches) -> Result<Command> {
    Ok(Command::Scheduler {
        port: parse_port(m, "port")?,
        options: SchedulerServiceOptions {
            daemon_tokens: config::parse_token_list(m.value_of("daemon-tokens").unwrap()),
            min_daemon_version: m
                .value_of("min-daemon-version")
                .unwrap()
                .parse()
                .chain_err(|| "invalid min-daemon-version")?,
            token_rollout_interval: Duration::from_secs(
                m.value_of("token-rollout-interval")
                    .unwrap()
                    .parse()
                    .chain_err(|| "invalid token-rollout-interval")?,
            ),
            min_memory_for_new_task: config::parse_size(
                m.value_of("servant-min-memory-for-new-task").unwrap(),
            )?,
        },
    })
}

fn parse_cache_server(m: &ArgMatches) -> Result<Command> {
    Ok(Command::CacheServer {
        port: parse_port(m, "port")?,
        options: CacheServiceOptions {
            engine: m.value_of("cache-engine").unwrap().to_owned(),
            disk: disk::Options::new(
                config::parse_cache_dirs(m.value_of("cache-dirs").unwrap())?,
                config::parse_misplaced_entry_action(
                    m.value_of("action-on-misplaced-cache-entry").unwrap(),
                )?,
            ),
            max_in_memory_cache_size: config::parse_size(
                m.value_of("max-in-memory-cache-size").unwrap(),
            )?,
            user_tokens: config::parse_token_list(m.value_of("user-tokens").unwrap()),
            servant_tokens: config::parse_token_list(m.value_of("servant-tokens").unwrap()),
        },
    })
}

fn parse_daemon(m: &ArgMatches) -> Result<Command> {
    let capacity: usize = m
        .value_of("capacity")
        .unwrap()
        .parse()
        .chain_err(|| "invalid capacity")?;
    Ok(Command::Daemon(DaemonOptions {
        scheduler_location: m.value_of("scheduler").unwrap().to_owned(),
        cache_server_location: m.value_of("cache-server").map(|s| s.to_owned()),
        token: m.value_of("token").unwrap().to_owned(),
        serving_port: parse_port(m, "serving-port")?,
        local_port: parse_port(m, "local-port")?,
        advertised_ip: m.value_of("advertised-ip").unwrap().to_owned(),
        priority: if m.value_of("priority").unwrap() == "dedicated" {
            ServantPriority::Dedicated
        } else {
            ServantPriority::User
        },
        capacity: if capacity != 0 { capacity } else { ::num_cpus::get() },
        max_local_tasks: m
            .value_of("max-local-tasks")
            .unwrap()
            .parse()
            .chain_err(|| "invalid max-local-tasks")?,
        lightweight_overprovisioning_ratio: m
            .value_of("lightweight-overprovisioning-ratio")
            .unwrap()
            .parse()
            .chain_err(|| "invalid lightweight-overprovisioning-ratio")?,
        extra_compiler_dirs: m
            .value_of("extra-compiler-dirs")
            .unwrap()
            .split(':')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_owned())
            .collect(),
    }))
}
