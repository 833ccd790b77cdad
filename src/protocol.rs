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

//! Wire messages spoken between the daemons, the scheduler and the cache
//! server. Everything here is bincode-encoded inside a length-prefixed frame
//! (see `rpc`). Large blobs (preprocessed source, result files, Bloom-filter
//! snapshots) travel as `Vec<u8>` fields, compressed where noted.

use errors::*;

/// Identifies a compiler toolchain. Two servants are interchangeable for a
/// task iff they advertise the same descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentDesc {
    /// Hex blake3 of the compiler binary's content.
    pub compiler_digest: String,
}

impl EnvironmentDesc {
    pub fn new(compiler_digest: &str) -> EnvironmentDesc {
        EnvironmentDesc { compiler_digest: compiler_digest.to_owned() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServantPriority {
    /// Someone's workstation. Use only what's idle.
    User,
    /// A server-class node whose only job is serving compilations.
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotAcceptingTaskReason {
    None,
    /// The daemon was configured not to serve others.
    NotAllowed,
    /// The servant is unreachable from outside its NAT.
    BehindNat,
    /// The servant is shutting down.
    Leaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Done,
}

/// RPC-level failure, carried back to the caller in place of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Status {
    AccessDenied,
    InvalidArgument(String),
    EnvironmentNotAvailable,
    NoQuotaAvailable,
    NotFound,
    Internal(String),
}

impl Status {
    pub fn into_error(self) -> Error {
        match self {
            Status::AccessDenied => ErrorKind::AccessDenied.into(),
            Status::InvalidArgument(s) => ErrorKind::InvalidArgument(s).into(),
            Status::EnvironmentNotAvailable => ErrorKind::EnvironmentNotAvailable.into(),
            Status::NoQuotaAvailable => ErrorKind::NoQuotaAvailable.into(),
            Status::NotFound => ErrorKind::NotFound.into(),
            Status::Internal(s) => s.into(),
        }
    }

    /// Best-effort mapping of a server-side error to what goes on the wire.
    pub fn of_error(e: &Error) -> Status {
        match *e.kind() {
            ErrorKind::AccessDenied => Status::AccessDenied,
            ErrorKind::InvalidArgument(ref s) => Status::InvalidArgument(s.clone()),
            ErrorKind::EnvironmentNotAvailable => Status::EnvironmentNotAvailable,
            ErrorKind::NoQuotaAvailable => Status::NoQuotaAvailable,
            ErrorKind::NotFound | ErrorKind::CorruptedEntry => Status::NotFound,
            _ => Status::Internal(e.to_string()),
        }
    }
}

///////////////////////
// Scheduler RPCs.   //
///////////////////////

/// One task currently running on the reporting servant. Reported in full
/// (not just the grant id) so that the scheduler can serve the dedup view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTaskReport {
    pub task_grant_id: u64,
    pub servant_task_id: u64,
    pub task_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub token: String,
    pub version: u32,
    /// "ip:port" the servant believes it is reachable at.
    pub location: String,
    pub env_descs: Vec<EnvironmentDesc>,
    pub num_processors: u64,
    pub current_load: u64,
    pub total_memory_in_bytes: u64,
    pub memory_available_in_bytes: u64,
    pub priority: ServantPriority,
    /// Maximum concurrent tasks the servant accepts. Zero means "none".
    pub capacity: u64,
    pub not_accepting_task_reason: NotAcceptingTaskReason,
    pub running_tasks: Vec<RunningTaskReport>,
    pub next_heartbeat_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Every serving-daemon token currently alive. Requests carrying any of
    /// these must be accepted during token rotation.
    pub acceptable_tokens: Vec<String>,
    /// Tasks the servant reported but the scheduler no longer recognizes.
    /// The servant is advised to kill them.
    pub expired_task_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigResponse {
    pub serving_daemon_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForStartingTaskRequest {
    pub token: String,
    pub env_desc: EnvironmentDesc,
    pub immediate_reqs: u32,
    pub prefetch_reqs: u32,
    pub next_keep_alive_in_ms: u64,
    pub milliseconds_to_wait: u64,
    pub min_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGrant {
    pub task_grant_id: u64,
    pub servant_location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForStartingTaskResponse {
    pub grants: Vec<TaskGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepTaskAliveRequest {
    pub token: String,
    pub task_grant_ids: Vec<u64>,
    pub next_keep_alive_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepTaskAliveResponse {
    /// One status per requested id, order preserved.
    pub statuses: Vec<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTaskRequest {
    pub token: String,
    pub task_grant_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTaskResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunningTasksRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_grant_id: u64,
    pub servant_task_id: u64,
    pub servant_location: String,
    pub task_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunningTasksResponse {
    pub running_tasks: Vec<RunningTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerRequest {
    Heartbeat(HeartbeatRequest),
    GetConfig(GetConfigRequest),
    WaitForStartingTask(WaitForStartingTaskRequest),
    KeepTaskAlive(KeepTaskAliveRequest),
    FreeTask(FreeTaskRequest),
    GetRunningTasks(GetRunningTasksRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerResponse {
    Heartbeat(HeartbeatResponse),
    GetConfig(GetConfigResponse),
    WaitForStartingTask(WaitForStartingTaskResponse),
    KeepTaskAlive(KeepTaskAliveResponse),
    FreeTask(FreeTaskResponse),
    GetRunningTasks(GetRunningTasksResponse),
}

///////////////////
// Cache RPCs.   //
///////////////////

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryGetEntryRequest {
    pub token: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryGetEntryResponse {
    /// The entry in its inner (unsealed) form, see `cache::format`.
    pub entry: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutEntryRequest {
    pub token: String,
    pub key: String,
    pub entry: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutEntryResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBloomFilterRequest {
    pub token: String,
    pub seconds_since_last_fetch: u64,
    pub seconds_since_last_full_fetch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchBloomFilterResponse {
    /// Keys populated since (slightly before) the client's last fetch.
    Incremental { newly_populated_keys: Vec<String> },
    /// The whole filter, zstd-compressed.
    Full { num_hashes: u32, compressed_filter: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheRequest {
    TryGetEntry(TryGetEntryRequest),
    PutEntry(PutEntryRequest),
    FetchBloomFilter(FetchBloomFilterRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheResponse {
    TryGetEntry(TryGetEntryResponse),
    PutEntry(PutEntryResponse),
    FetchBloomFilter(FetchBloomFilterResponse),
}

/////////////////////////////
// Servant (daemon) RPCs.  //
/////////////////////////////

/// Occurrences of the servant's workspace path inside one output file.
/// The wrapper rewrites these in place to fix up embedded debug-info paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchLocations {
    pub locations: Vec<PatchLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchLocation {
    /// Byte offset of the path occurrence.
    pub position: u64,
    /// Length of the whole null-terminated string found there.
    pub total_size: u64,
    /// Bytes after the workspace prefix that must be preserved.
    pub suffix_to_keep: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCxxTaskRequest {
    pub token: String,
    pub task_grant_id: u64,
    pub env_desc: EnvironmentDesc,
    pub source_path: String,
    pub invocation_arguments: String,
    pub compression_algorithm: CompressionAlgorithm,
    pub disallow_cache_fill: bool,
    /// zstd-compressed preprocessed source.
    pub compressed_source: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCxxTaskResponse {
    pub status: TaskStatus,
    pub task_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForCompilationOutputRequest {
    pub token: String,
    pub task_id: u64,
    pub milliseconds_to_wait: u64,
    pub acceptable_compression_algorithms: Vec<CompressionAlgorithm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForCompilationOutputResponse {
    pub status: TaskStatus,
    pub exit_code: i32,
    pub output: String,
    pub error: String,
    /// Extensions ("._o_" suffixes) of the returned files, parallel with
    /// `patches` and `files`.
    pub file_extensions: Vec<String>,
    pub patches: Vec<PatchLocations>,
    pub compression_algorithm: CompressionAlgorithm,
    pub files: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeServantTaskRequest {
    pub token: String,
    pub task_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeServantTaskResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceTaskRequest {
    pub token: String,
    pub task_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceTaskResponse {
    pub task_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    QueueCxxTask(QueueCxxTaskRequest),
    WaitForCompilationOutput(WaitForCompilationOutputRequest),
    FreeTask(FreeServantTaskRequest),
    ReferenceTask(ReferenceTaskRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    QueueCxxTask(QueueCxxTaskResponse),
    WaitForCompilationOutput(WaitForCompilationOutputResponse),
    FreeTask(FreeServantTaskResponse),
    ReferenceTask(ReferenceTaskResponse),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_error_round_trip() {
        let e = Status::NoQuotaAvailable.into_error();
        match Status::of_error(&e) {
            Status::NoQuotaAvailable => {}
            other => panic!("unexpected status: {:?}", other),
        }
        let e = Status::InvalidArgument("lease too long".into()).into_error();
        match Status::of_error(&e) {
            Status::InvalidArgument(ref s) if s == "lease too long" => {}
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_entry_degrades_to_not_found() {
        let e: Error = ErrorKind::CorruptedEntry.into();
        match Status::of_error(&e) {
            Status::NotFound => {}
            other => panic!("unexpected status: {:?}", other),
        }
    }
}
