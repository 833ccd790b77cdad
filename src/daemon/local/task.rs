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

//! The task variant seam: the dispatcher schedules `DistributedTask`s
//! without knowing their language. Only the C++ variant exists today.

use serde_json;
use std::any::Any;
use std::time::Duration;

use cache::format::{self, CacheEntry, ExtraInfo};
use errors::*;
use protocol::*;
use rpc::DaemonClient;

/// How a task may interact with the distributed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    /// Don't touch the cache at all.
    Disallow,
    /// Use an existing entry, or fill one on miss.
    Allow,
    /// Ignore the existing entry but (re)fill it on completion.
    Refill,
}

impl CacheControl {
    pub fn from_value(value: i64) -> Option<CacheControl> {
        match value {
            0 => Some(CacheControl::Disallow),
            1 => Some(CacheControl::Allow),
            2 => Some(CacheControl::Refill),
            _ => None,
        }
    }
}

/// What came back from the cloud. Negative exit codes are ours (RPC or
/// scheduling failures), not the compiler's.
#[derive(Debug, Clone, Default)]
pub struct DistributedTaskOutput {
    pub exit_code: i32,
    pub standard_output: String,
    pub standard_error: String,
    pub extra_info: ExtraInfo,
    /// Keyed by extension suffix. The bytes stay zstd-compressed from the
    /// servant all the way to the wrapper; patch offsets refer to the
    /// decompressed contents.
    pub output_files: Vec<(String, Vec<u8>)>,
}

/// A cache entry is a completion someone else computed earlier.
impl From<CacheEntry> for DistributedTaskOutput {
    fn from(entry: CacheEntry) -> DistributedTaskOutput {
        DistributedTaskOutput {
            exit_code: entry.exit_code,
            standard_output: entry.standard_output,
            standard_error: entry.standard_error,
            extra_info: entry.extra_info,
            output_files: entry.files,
        }
    }
}

/// A task the dispatcher can place in the cloud. Implementations carry
/// whatever language-specific payload they need.
pub trait DistributedTask: Send + 'static {
    /// Process ID of the local invoker; the task dies with it.
    fn invoker_pid(&self) -> u32;

    fn cache_setting(&self) -> CacheControl;

    fn cache_key(&self) -> String;

    /// Identifies identical in-flight tasks for dedup.
    fn digest(&self) -> String;

    fn environment_desc(&self) -> &EnvironmentDesc;

    /// Submits the task to `servant`; returns the servant-side task id.
    fn start_task(&mut self, token: &str, grant_id: u64, servant: &DaemonClient) -> Result<u64>;

    /// Called exactly once when the task reaches its final state.
    fn on_completion(&mut self, output: DistributedTaskOutput);

    fn dump(&self) -> serde_json::Value;

    /// Down-casting support for typed retrieval.
    fn into_any(self: Box<Self>) -> Box<Any + Send>;
}

/// A preprocessed C/C++ translation unit headed for the cloud.
#[derive(Debug)]
pub struct CxxCompilationTask {
    pub requestor_pid: u32,
    pub env_desc: EnvironmentDesc,
    pub source_path: String,
    pub source_digest: String,
    pub invocation_arguments: String,
    pub cache_control: CacheControl,
    /// zstd-compressed preprocessed source; dropped once submitted.
    pub compressed_source: Vec<u8>,
    output: Option<DistributedTaskOutput>,
}

impl CxxCompilationTask {
    pub fn new(
        requestor_pid: u32,
        env_desc: EnvironmentDesc,
        source_path: String,
        source_digest: String,
        invocation_arguments: String,
        cache_control: CacheControl,
        compressed_source: Vec<u8>,
    ) -> Result<CxxCompilationTask> {
        if requestor_pid <= 1
            || source_path.is_empty()
            || invocation_arguments.is_empty()
            || (cache_control != CacheControl::Disallow && source_digest.is_empty())
        {
            bail!(ErrorKind::InvalidArgument("invalid task arguments".into()));
        }
        Ok(CxxCompilationTask {
            requestor_pid,
            env_desc,
            source_path,
            source_digest,
            invocation_arguments,
            cache_control,
            compressed_source,
            output: None,
        })
    }

    pub fn output(&self) -> Option<&DistributedTaskOutput> {
        self.output.as_ref()
    }

    /// Renders the wrapper-facing response: the JSON part of the
    /// multi-chunk body plus the (still compressed) file parts.
    pub fn rebuild_output(&self) -> Result<(serde_json::Value, Vec<Vec<u8>>)> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::from("task has not completed"))?;

        let mut file_extensions = Vec::new();
        let mut patches = Vec::new();
        let mut buffers = Vec::new();
        if output.exit_code >= 0 {
            let patch_info = if output.exit_code == 0 {
                Some(output.extra_info.unpack_cxx().chain_err(|| {
                    "Unexpected: Malformed C++ compilation extra info."
                })?)
            } else {
                None
            };
            for &(ref extension, ref bytes) in &output.output_files {
                file_extensions.push(extension.clone());
                patches.push(
                    patch_info
                        .as_ref()
                        .and_then(|i| i.file_name_patches.get(extension).cloned())
                        .unwrap_or_default(),
                );
                buffers.push(bytes.clone());
            }
        }
        let json = json!({
            "exit_code": output.exit_code,
            "output": output.standard_output,
            "error": output.standard_error,
            "file_extensions": file_extensions,
            "patches": serde_json::to_value(&patches)?,
        });
        Ok((json, buffers))
    }
}

impl DistributedTask for CxxCompilationTask {
    fn invoker_pid(&self) -> u32 {
        self.requestor_pid
    }

    fn cache_setting(&self) -> CacheControl {
        self.cache_control
    }

    fn cache_key(&self) -> String {
        format::get_cxx_cache_entry_key(
            &self.env_desc,
            &self.invocation_arguments,
            &self.source_digest,
        )
    }

    fn digest(&self) -> String {
        format::get_cxx_task_digest(
            &self.env_desc,
            &self.invocation_arguments,
            &self.source_digest,
        )
    }

    fn environment_desc(&self) -> &EnvironmentDesc {
        &self.env_desc
    }

    fn start_task(&mut self, token: &str, grant_id: u64, servant: &DaemonClient) -> Result<u64> {
        let request = QueueCxxTaskRequest {
            token: token.to_owned(),
            task_grant_id: grant_id,
            env_desc: self.env_desc.clone(),
            source_path: self.source_path.clone(),
            invocation_arguments: self.invocation_arguments.clone(),
            compression_algorithm: CompressionAlgorithm::Zstd,
            disallow_cache_fill: self.cache_control == CacheControl::Disallow,
            // The source can be large; hand it over rather than copy. It's
            // of no further use locally.
            compressed_source: ::std::mem::replace(&mut self.compressed_source, Vec::new()),
        };
        // Submission can take a while if the servant sits in a distant DC.
        let response = servant.queue_cxx_task(request, Duration::from_secs(30))?;
        if response.status != TaskStatus::Running {
            bail!(ErrorKind::Transport(format!(
                "unexpected task status [{:?}] from servant",
                response.status
            )));
        }
        Ok(response.task_id)
    }

    fn on_completion(&mut self, output: DistributedTaskOutput) {
        self.output = Some(output);
    }

    fn dump(&self) -> serde_json::Value {
        json!({
            "requestor_pid": self.requestor_pid,
            "cache_control": format!("{:?}", self.cache_control),
            "source_digest": self.source_digest,
            "compiler_digest": self.env_desc.compiler_digest,
            "source_path": self.source_path,
            "invocation_arguments": self.invocation_arguments,
            "preprocessed_source_size": self.compressed_source.len(),
        })
    }

    fn into_any(self: Box<Self>) -> Box<Any + Send> {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_task() -> CxxCompilationTask {
        CxxCompilationTask::new(
            4242,
            EnvironmentDesc::new("compiler-digest"),
            "/src/hello.cc".to_owned(),
            "source-digest".to_owned(),
            "-O2 -g".to_owned(),
            CacheControl::Allow,
            b"compressed".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_validation() {
        assert!(CxxCompilationTask::new(
            0,
            EnvironmentDesc::new("d"),
            "/s.cc".to_owned(),
            "sd".to_owned(),
            "-O2".to_owned(),
            CacheControl::Allow,
            vec![],
        )
        .is_err());
        // Missing source digest is fine only when the cache is off-limits.
        assert!(CxxCompilationTask::new(
            100,
            EnvironmentDesc::new("d"),
            "/s.cc".to_owned(),
            String::new(),
            "-O2".to_owned(),
            CacheControl::Allow,
            vec![],
        )
        .is_err());
        assert!(CxxCompilationTask::new(
            100,
            EnvironmentDesc::new("d"),
            "/s.cc".to_owned(),
            String::new(),
            "-O2".to_owned(),
            CacheControl::Disallow,
            vec![],
        )
        .is_ok());
    }

    #[test]
    fn test_keys_are_stable() {
        let a = make_task();
        let b = make_task();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.cache_key(), a.digest());
    }

    #[test]
    fn test_rebuild_output_success_path() {
        let mut task = make_task();
        let mut info = format::CxxCompilationExtraInfo::default();
        info.file_name_patches
            .insert(".o".to_owned(), Default::default());
        task.on_completion(DistributedTaskOutput {
            exit_code: 0,
            standard_output: "out".to_owned(),
            standard_error: "err".to_owned(),
            extra_info: ExtraInfo::pack_cxx(&info).unwrap(),
            output_files: vec![(".o".to_owned(), b"OBJ".to_vec())],
        });
        let (json, buffers) = task.rebuild_output().unwrap();
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["file_extensions"][0], ".o");
        assert_eq!(buffers, vec![b"OBJ".to_vec()]);
    }

    #[test]
    fn test_rebuild_output_rpc_failure_carries_no_files() {
        let mut task = make_task();
        task.on_completion(DistributedTaskOutput {
            exit_code: -125,
            standard_error: "lost the servant".to_owned(),
            ..Default::default()
        });
        let (json, buffers) = task.rebuild_output().unwrap();
        assert_eq!(json["exit_code"], -125);
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_down_cast_round_trip() {
        let task: Box<DistributedTask> = Box::new(make_task());
        let any = task.into_any();
        assert!(any.downcast::<CxxCompilationTask>().is_ok());
    }
}
