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

//! Servant execution engine: runs compilations on behalf of remote
//! requestors, in sandbox workspaces, on a worker pool bounded by the
//! capacity we advertise to the scheduler.

pub mod cache_writer;
pub mod compilers;
pub mod workspace;

use futures_cpupool::CpuPool;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use zstd;

use self::cache_writer::DistributedCacheWriter;
use self::compilers::CompilerRegistry;
use self::workspace::Workspace;
use cache::format::{self, CacheEntry, CxxCompilationExtraInfo, ExtraInfo};
use errors::*;
use protocol::*;
use rpc::{self, CacheClient};
use serde_json;
use util::{self, Latch, PeriodicTimer};

/// Longest single long-poll we allow a waiter.
const MAX_OUTPUT_WAIT: Duration = Duration::from_secs(10);

/// Completed tasks whose owner never came back are reaped after this.
const ABANDONED_TASK_RETENTION: Duration = Duration::from_secs(300);
const CLEANUP_TICK: Duration = Duration::from_secs(10);

// Sources expanding these are not reproducible, hence not cacheable,
// unless every one of them is overridden on the command line.
const UNCACHEABLE_MACROS: [&str; 3] = ["__TIME__", "__DATE__", "__TIMESTAMP__"];

struct TaskResult {
    exit_code: i32,
    standard_output: String,
    standard_error: String,
    file_extensions: Vec<String>,
    patches: Vec<PatchLocations>,
    /// zstd-compressed, ready for the wire.
    files: Vec<Vec<u8>>,
}

struct ServantTask {
    task_id: u64,
    grant_id: u64,
    task_digest: String,
    // The submitter plus everyone who `ReferenceTask`ed it. The task's
    // output is retained until the last reference is freed.
    references: AtomicI64,
    child_pid: Mutex<Option<u32>>,
    completion: Latch,
    result: Mutex<Option<TaskResult>>,
    completed_at: Mutex<Option<Instant>>,
}

pub struct ExecutionEngineOptions {
    pub capacity: usize,
    pub cache: Option<CacheClient>,
    pub cache_token: String,
}

pub struct ExecutionEngine {
    registry: Arc<CompilerRegistry>,
    capacity: usize,
    pool: CpuPool,
    tasks: Mutex<HashMap<u64, Arc<ServantTask>>>,
    next_task_id: AtomicU64,
    // Tokens the scheduler currently vouches for; refreshed by heartbeats.
    // Empty until the first heartbeat response: serve no one that early.
    acceptable_tokens: Mutex<HashSet<String>>,
    cache_writer: Arc<DistributedCacheWriter>,
    cleanup_timer: Mutex<Option<PeriodicTimer>>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<CompilerRegistry>,
        options: ExecutionEngineOptions,
    ) -> Arc<ExecutionEngine> {
        let engine = Arc::new(ExecutionEngine {
            registry,
            capacity: options.capacity,
            pool: CpuPool::new(::std::cmp::max(1, options.capacity)),
            tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            acceptable_tokens: Mutex::new(HashSet::new()),
            cache_writer: Arc::new(DistributedCacheWriter::new(
                options.cache,
                options.cache_token,
            )),
            cleanup_timer: Mutex::new(None),
        });
        let e = engine.clone();
        *engine.cleanup_timer.lock().unwrap() = Some(PeriodicTimer::spawn(
            "servant-task-cleanup",
            CLEANUP_TICK,
            move || e.on_cleanup_timer(),
        ));
        engine
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn environments(&self) -> Vec<EnvironmentDesc> {
        self.registry.enumerate_environments()
    }

    /// Tasks currently running here, as reported in our heartbeats.
    pub fn running_tasks_report(&self) -> Vec<RunningTaskReport> {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .values()
            .filter(|t| !t.completion.is_done())
            .map(|t| RunningTaskReport {
                task_grant_id: t.grant_id,
                servant_task_id: t.task_id,
                task_digest: t.task_digest.clone(),
            })
            .collect()
    }

    /// Replaces the acceptable-token set with what the scheduler returned.
    pub fn update_acceptable_tokens(&self, tokens: Vec<String>) {
        *self.acceptable_tokens.lock().unwrap() = tokens.into_iter().collect();
    }

    /// Kills tasks the scheduler no longer recognizes (their grants have
    /// expired; whoever submitted them has presumably given up).
    pub fn kill_expired_tasks(&self, task_ids: &[u64]) {
        let tasks = self.tasks.lock().unwrap();
        for id in task_ids {
            if let Some(task) = tasks.get(id) {
                if !task.completion.is_done() {
                    warn!("Killing expired task [{}].", id);
                    kill_child_of(task);
                }
            }
        }
    }

    fn verify_token(&self, token: &str) -> Result<()> {
        if !self.acceptable_tokens.lock().unwrap().contains(token) {
            bail!(ErrorKind::AccessDenied);
        }
        Ok(())
    }

    fn queue_cxx_task(&self, request: QueueCxxTaskRequest) -> Result<QueueCxxTaskResponse> {
        self.verify_token(&request.token)?;
        if request.compression_algorithm != CompressionAlgorithm::Zstd {
            bail!(ErrorKind::InvalidArgument(
                "compression algorithm not supported".into()
            ));
        }
        let compiler = self
            .registry
            .try_get_compiler_path(&request.env_desc)
            .ok_or_else(|| Error::from(ErrorKind::EnvironmentNotAvailable))?;
        let source = zstd::decode_all(&request.compressed_source[..]).map_err(|_| {
            Error::from(ErrorKind::InvalidArgument(
                "failed to decompress source code".into(),
            ))
        })?;
        let source_digest = util::hex(&util::blake3_of(&source));
        let task_digest = format::get_cxx_task_digest(
            &request.env_desc,
            &request.invocation_arguments,
            &source_digest,
        );

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = Arc::new(ServantTask {
            task_id,
            grant_id: request.task_grant_id,
            task_digest,
            references: AtomicI64::new(1),
            child_pid: Mutex::new(None),
            completion: Latch::new(),
            result: Mutex::new(None),
            completed_at: Mutex::new(None),
        });
        self.tasks.lock().unwrap().insert(task_id, task.clone());

        let cache_key = if request.disallow_cache_fill {
            None
        } else {
            Some(format::get_cxx_cache_entry_key(
                &request.env_desc,
                &request.invocation_arguments,
                &source_digest,
            ))
        };
        let sink = CompletionSink {
            cache_key,
            invocation_arguments: request.invocation_arguments.clone(),
        };
        let job = CompileJob {
            compiler,
            invocation_arguments: request.invocation_arguments,
            source,
            source_digest,
        };
        let worker_task = task.clone();
        let cache_writer = self.cache_writer.clone();
        self.pool
            .spawn_fn(move || -> ::std::result::Result<(), ()> {
                run_compilation(&worker_task, job, sink, &cache_writer);
                Ok(())
            })
            .forget();

        Ok(QueueCxxTaskResponse {
            status: TaskStatus::Running,
            task_id,
        })
    }

    fn wait_for_compilation_output(
        &self,
        request: WaitForCompilationOutputRequest,
    ) -> Result<WaitForCompilationOutputResponse> {
        self.verify_token(&request.token)?;
        if !request
            .acceptable_compression_algorithms
            .contains(&CompressionAlgorithm::Zstd)
        {
            bail!(ErrorKind::InvalidArgument(
                "no acceptable compression algorithm".into()
            ));
        }
        let task = self
            .tasks
            .lock()
            .unwrap()
            .get(&request.task_id)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::NotFound))?;

        let wait = ::std::cmp::min(
            Duration::from_millis(request.milliseconds_to_wait),
            MAX_OUTPUT_WAIT,
        );
        if !task.completion.wait_for(wait) {
            return Ok(WaitForCompilationOutputResponse {
                status: TaskStatus::Running,
                exit_code: 0,
                output: String::new(),
                error: String::new(),
                file_extensions: vec![],
                patches: vec![],
                compression_algorithm: CompressionAlgorithm::Zstd,
                files: vec![],
            });
        }
        let result = task.result.lock().unwrap();
        let result = result.as_ref().expect("completed without a result");
        Ok(WaitForCompilationOutputResponse {
            status: TaskStatus::Done,
            exit_code: result.exit_code,
            output: result.standard_output.clone(),
            error: result.standard_error.clone(),
            file_extensions: result.file_extensions.clone(),
            patches: result.patches.clone(),
            compression_algorithm: CompressionAlgorithm::Zstd,
            files: result.files.clone(),
        })
    }

    fn free_task(&self, request: FreeServantTaskRequest) -> Result<FreeServantTaskResponse> {
        self.verify_token(&request.token)?;
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get(&request.task_id).cloned() {
            if task.references.fetch_sub(1, Ordering::AcqRel) <= 1 {
                tasks.remove(&request.task_id);
                if !task.completion.is_done() {
                    kill_child_of(&task);
                }
            }
        } // Unknown ids are ignored; freeing is best-effort anyway.
        Ok(FreeServantTaskResponse {})
    }

    fn reference_task(&self, request: ReferenceTaskRequest) -> Result<ReferenceTaskResponse> {
        self.verify_token(&request.token)?;
        let tasks = self.tasks.lock().unwrap();
        for task in tasks.values() {
            if task.task_digest == request.task_digest {
                task.references.fetch_add(1, Ordering::AcqRel);
                return Ok(ReferenceTaskResponse { task_id: task.task_id });
            }
        }
        bail!(ErrorKind::NotFound);
    }

    fn on_cleanup_timer(&self) {
        let now = Instant::now();
        let mut tasks = self.tasks.lock().unwrap();
        let abandoned: Vec<u64> = tasks
            .iter()
            .filter(|&(_, task)| {
                task.completed_at
                    .lock()
                    .unwrap()
                    .map(|at| at + ABANDONED_TASK_RETENTION < now)
                    .unwrap_or(false)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in abandoned {
            warn!("Dropping abandoned task [{}]; its owner never claimed it.", id);
            tasks.remove(&id);
        }
    }

    pub fn dump_internals(&self) -> serde_json::Value {
        let tasks = self.tasks.lock().unwrap();
        let running = tasks.values().filter(|t| !t.completion.is_done()).count();
        json!({
            "capacity": self.capacity,
            "tasks": tasks.len(),
            "running": running,
        })
    }

    pub fn stop(&self) {
        if let Some(ref timer) = *self.cleanup_timer.lock().unwrap() {
            timer.stop();
        }
    }

    pub fn join(&self) {
        if let Some(ref mut timer) = *self.cleanup_timer.lock().unwrap() {
            timer.join();
        }
        self.cache_writer.join();
    }
}

// What run_compilation needs from the request.
struct CompileJob {
    compiler: String,
    invocation_arguments: String,
    source: Vec<u8>,
    source_digest: String,
}

struct CompletionSink {
    cache_key: Option<String>,
    invocation_arguments: String,
}

fn kill_child_of(task: &ServantTask) {
    if let Some(pid) = *task.child_pid.lock().unwrap() {
        unsafe {
            ::libc::kill(pid as ::libc::pid_t, ::libc::SIGKILL);
        }
    }
}

/// True if caching the result can't betray the requestor: either none of
/// the volatile macros occur in the source, or all are pinned on the
/// command line.
fn is_cacheable(invocation_arguments: &str, source: &[u8]) -> bool {
    if UNCACHEABLE_MACROS
        .iter()
        .all(|m| invocation_arguments.contains(&format!("-D{}=", m)))
    {
        return true;
    }
    !UNCACHEABLE_MACROS.iter().any(|m| {
        source
            .windows(m.len())
            .any(|window| window == m.as_bytes())
    })
}

fn run_compilation(
    task: &Arc<ServantTask>,
    job: CompileJob,
    sink: CompletionSink,
    cache_writer: &DistributedCacheWriter,
) {
    let result = execute_compilation(task, &job);
    if let Ok(ref r) = result {
        // Successful, reproducible results feed the distributed cache.
        if r.exit_code == 0 && sink.cache_key.is_some()
            && is_cacheable(&sink.invocation_arguments, &job.source)
        {
            let entry = CacheEntry {
                exit_code: r.exit_code,
                standard_output: r.standard_output.clone(),
                standard_error: r.standard_error.clone(),
                extra_info: pack_patches(&r.file_extensions, &r.patches),
                files: r
                    .file_extensions
                    .iter()
                    .cloned()
                    .zip(r.files.iter().cloned())
                    .collect(),
            };
            cache_writer.write(sink.cache_key.clone().unwrap(), entry);
        }
    }
    let result = result.unwrap_or_else(|e| {
        warn!("Task [{}] failed locally: {}", task.task_id, e);
        TaskResult {
            exit_code: -1,
            standard_output: String::new(),
            standard_error: e.to_string(),
            file_extensions: vec![],
            patches: vec![],
            files: vec![],
        }
    });
    *task.result.lock().unwrap() = Some(result);
    *task.completed_at.lock().unwrap() = Some(Instant::now());
    task.completion.count_down();
}

fn execute_compilation(task: &Arc<ServantTask>, job: &CompileJob) -> Result<TaskResult> {
    let workspace = Workspace::new(&job.source_digest)?;
    let command_line = format!(
        "{} {} -o {}/output.o",
        job.compiler,
        job.invocation_arguments,
        workspace.output_dir()
    );
    trace!("Executing command: [{}]", command_line);

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command_line)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir("/")
        .spawn()
        .chain_err(|| "failed to spawn compiler")?;
    *task.child_pid.lock().unwrap() = Some(child.id());

    // Feed the preprocessed source from a separate thread so a chatty
    // compiler can't deadlock us on full pipes.
    let mut stdin = child.stdin.take().expect("stdin was piped");
    let source = job.source.clone();
    let feeder = thread::spawn(move || {
        let _ = stdin.write_all(&source);
    });
    let output = child
        .wait_with_output()
        .chain_err(|| "failed to wait for compiler")?;
    let _ = feeder.join();
    *task.child_pid.lock().unwrap() = None;

    // A killed compiler (expired task) surfaces as failure, not a signal.
    let exit_code = output.status.code().unwrap_or(-1);
    let mut result = TaskResult {
        exit_code,
        standard_output: String::from_utf8_lossy(&output.stdout).into_owned(),
        standard_error: String::from_utf8_lossy(&output.stderr).into_owned(),
        file_extensions: vec![],
        patches: vec![],
        files: vec![],
    };
    if exit_code != 0 {
        return Ok(result);
    }

    let prefix = workspace.output_prefix();
    for (extension, bytes) in workspace.read_outputs()? {
        result
            .patches
            .push(workspace::find_path_locations(&bytes, &prefix));
        result.files.push(
            zstd::encode_all(&bytes[..], 0).chain_err(|| "failed to compress output")?,
        );
        result.file_extensions.push(extension);
    }
    Ok(result)
}

fn pack_patches(extensions: &[String], patches: &[PatchLocations]) -> ExtraInfo {
    let mut info = CxxCompilationExtraInfo::default();
    for (extension, locations) in extensions.iter().zip(patches.iter()) {
        info.file_name_patches
            .insert(extension.clone(), locations.clone());
    }
    ExtraInfo::pack_cxx(&info).unwrap_or_default()
}

impl rpc::Service for ExecutionEngine {
    type Request = DaemonRequest;
    type Response = DaemonResponse;

    fn handle(&self, _peer: SocketAddr, request: DaemonRequest) -> Result<DaemonResponse> {
        match request {
            DaemonRequest::QueueCxxTask(r) => {
                Ok(DaemonResponse::QueueCxxTask(self.queue_cxx_task(r)?))
            }
            DaemonRequest::WaitForCompilationOutput(r) => Ok(
                DaemonResponse::WaitForCompilationOutput(self.wait_for_compilation_output(r)?),
            ),
            DaemonRequest::FreeTask(r) => Ok(DaemonResponse::FreeTask(self.free_task(r)?)),
            DaemonRequest::ReferenceTask(r) => {
                Ok(DaemonResponse::ReferenceTask(self.reference_task(r)?))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempdir::TempDir;

    // A stand-in compiler: copies stdin to whatever follows `-o`.
    fn fake_compiler(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fakecc");
        fs::write(
            &path,
            "#!/bin/sh\nout=\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; shift; fi\n  shift\ndone\ncat - > \"$out\"\n",
        )
        .unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).unwrap();
        path
    }

    fn make_engine(dir: &TempDir) -> (Arc<ExecutionEngine>, EnvironmentDesc) {
        let compiler = fake_compiler(dir);
        let registry = Arc::new(CompilerRegistry::with_compilers(&[compiler]));
        let env = registry.enumerate_environments()[0].clone();
        let engine = ExecutionEngine::new(
            registry,
            ExecutionEngineOptions {
                capacity: 2,
                cache: None,
                cache_token: String::new(),
            },
        );
        engine.update_acceptable_tokens(vec!["tok".to_owned()]);
        (engine, env)
    }

    fn queue_request(env: &EnvironmentDesc, source: &[u8]) -> QueueCxxTaskRequest {
        QueueCxxTaskRequest {
            token: "tok".to_owned(),
            task_grant_id: 7,
            env_desc: env.clone(),
            source_path: "/src/a.cc".to_owned(),
            invocation_arguments: "-c -x c++".to_owned(),
            compression_algorithm: CompressionAlgorithm::Zstd,
            disallow_cache_fill: false,
            compressed_source: zstd::encode_all(source, 0).unwrap(),
        }
    }

    fn wait_done(
        engine: &ExecutionEngine,
        task_id: u64,
    ) -> WaitForCompilationOutputResponse {
        for _ in 0..100 {
            let response = engine
                .wait_for_compilation_output(WaitForCompilationOutputRequest {
                    token: "tok".to_owned(),
                    task_id,
                    milliseconds_to_wait: 500,
                    acceptable_compression_algorithms: vec![CompressionAlgorithm::Zstd],
                })
                .unwrap();
            if response.status == TaskStatus::Done {
                return response;
            }
        }
        panic!("task never finished");
    }

    #[test]
    fn test_queue_and_wait_round_trip() {
        let tmp = TempDir::new("engine").unwrap();
        let (engine, env) = make_engine(&tmp);
        let source = b"int main() { return 0; }\n";
        let queued = engine.queue_cxx_task(queue_request(&env, source)).unwrap();
        assert_eq!(queued.status, TaskStatus::Running);

        let response = wait_done(&engine, queued.task_id);
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.file_extensions, vec![".o".to_owned()]);
        let object = zstd::decode_all(&response.files[0][..]).unwrap();
        assert_eq!(object, source.to_vec());

        engine
            .free_task(FreeServantTaskRequest {
                token: "tok".to_owned(),
                task_id: queued.task_id,
            })
            .unwrap();
        assert!(engine.tasks.lock().unwrap().is_empty());
        engine.stop();
        engine.join();
    }

    #[test]
    fn test_unknown_environment_is_refused() {
        let tmp = TempDir::new("engine").unwrap();
        let (engine, _env) = make_engine(&tmp);
        let result =
            engine.queue_cxx_task(queue_request(&EnvironmentDesc::new("bogus"), b"x"));
        match *result.unwrap_err().kind() {
            ErrorKind::EnvironmentNotAvailable => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
        engine.stop();
        engine.join();
    }

    #[test]
    fn test_wrong_token_is_denied() {
        let tmp = TempDir::new("engine").unwrap();
        let (engine, env) = make_engine(&tmp);
        let mut request = queue_request(&env, b"x");
        request.token = "invalid".to_owned();
        match *engine.queue_cxx_task(request).unwrap_err().kind() {
            ErrorKind::AccessDenied => {}
            ref e => panic!("unexpected error: {:?}", e),
        }
        engine.stop();
        engine.join();
    }

    #[test]
    fn test_reference_task_joins_running_compilation() {
        let tmp = TempDir::new("engine").unwrap();
        let (engine, env) = make_engine(&tmp);
        let source = b"int f();\n";
        let queued = engine.queue_cxx_task(queue_request(&env, source)).unwrap();

        let digest = engine.tasks.lock().unwrap()[&queued.task_id]
            .task_digest
            .clone();
        let referenced = engine
            .reference_task(ReferenceTaskRequest {
                token: "tok".to_owned(),
                task_digest: digest,
            })
            .unwrap();
        assert_eq!(referenced.task_id, queued.task_id);

        // Both holders observe the same completed output; the record only
        // goes away after the second free.
        let response = wait_done(&engine, queued.task_id);
        assert_eq!(response.exit_code, 0);
        engine
            .free_task(FreeServantTaskRequest {
                token: "tok".to_owned(),
                task_id: queued.task_id,
            })
            .unwrap();
        assert!(!engine.tasks.lock().unwrap().is_empty());
        let again = wait_done(&engine, queued.task_id);
        assert_eq!(again.exit_code, 0);
        engine
            .free_task(FreeServantTaskRequest {
                token: "tok".to_owned(),
                task_id: queued.task_id,
            })
            .unwrap();
        assert!(engine.tasks.lock().unwrap().is_empty());
        engine.stop();
        engine.join();
    }

    #[test]
    fn test_running_tasks_report_covers_inflight_tasks() {
        let tmp = TempDir::new("engine").unwrap();
        let (engine, env) = make_engine(&tmp);
        let queued = engine.queue_cxx_task(queue_request(&env, b"y")).unwrap();
        // Until the pool picks it up and finishes, the report includes it.
        let report = engine.running_tasks_report();
        if !report.is_empty() {
            assert_eq!(report[0].servant_task_id, queued.task_id);
            assert_eq!(report[0].task_grant_id, 7);
        }
        wait_done(&engine, queued.task_id);
        assert!(engine.running_tasks_report().is_empty());
        engine.stop();
        engine.join();
    }

    #[test]
    fn test_cacheability_scan() {
        assert!(is_cacheable("-c", b"int main() {}"));
        assert!(!is_cacheable("-c", b"char now[] = __TIMESTAMP__;"));
        assert!(!is_cacheable("-c", b"char t[] = __TIME__;"));
        // All volatile macros pinned: cacheable no matter the source.
        assert!(is_cacheable(
            "-c -D__TIME__=x -D__DATE__=y -D__TIMESTAMP__=z",
            b"char t[] = __TIME__;"
        ));
    }
}
