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

//! The wrapper-facing endpoint on loopback. Small fixed HTTP/1.1 surface;
//! request bodies are JSON, the submit/wait bodies additionally use the
//! multi-chunk framing for their binary parts.

use serde_json::{self, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::file_digest::FileDigestCache;
use super::task::{CacheControl, CxxCompilationTask};
use super::task_monitor::LocalTaskMonitor;
use super::{DistributedTaskDispatcher, WaitStatus};
use errors::*;
use multi_chunk;
use protocol::EnvironmentDesc;

const MAX_WAITABLE: Duration = Duration::from_secs(10);
/// A task that can't be dispatched within this is hopeless; the wrapper
/// falls back to compiling locally far earlier anyway.
const START_DEADLINE: Duration = Duration::from_secs(300);

const MAX_BODY: usize = 256 * 1024 * 1024;

pub struct HttpService {
    dispatcher: Arc<DistributedTaskDispatcher>,
    monitor: Arc<LocalTaskMonitor>,
    file_digests: Arc<FileDigestCache>,
    version: u32,
    leaving: Arc<AtomicBool>,
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct Response {
    status: u32,
    body: Vec<u8>,
}

impl Response {
    fn ok(body: Vec<u8>) -> Response {
        Response { status: 200, body }
    }

    fn status_only(status: u32) -> Response {
        Response { status, body: Vec::new() }
    }

    fn bad_request() -> Response {
        Response {
            status: 400,
            body: b"Invalid arguments.".to_vec(),
        }
    }
}

impl HttpService {
    pub fn new(
        dispatcher: Arc<DistributedTaskDispatcher>,
        monitor: Arc<LocalTaskMonitor>,
        file_digests: Arc<FileDigestCache>,
        version: u32,
    ) -> HttpService {
        HttpService {
            dispatcher,
            monitor,
            file_digests,
            version,
            leaving: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the wrapper posts `/local/ask_to_leave`; the daemon's main
    /// loop watches it.
    pub fn leaving_flag(&self) -> Arc<AtomicBool> {
        self.leaving.clone()
    }

    fn dispatch(&self, request: Request) -> Response {
        match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/local/acquire_quota") => self.acquire_quota(&request.body),
            ("POST", "/local/release_quota") => self.release_quota(&request.body),
            ("POST", "/local/submit_cxx_task") => self.submit_cxx_task(&request.body),
            ("POST", "/local/wait_for_cxx_task") => self.wait_for_cxx_task(&request.body),
            ("POST", "/local/set_file_digest") => self.set_file_digest(&request.body),
            ("POST", "/local/ask_to_leave") => {
                info!("Someone asked us to leave. Shutting down.");
                self.leaving.store(true, Ordering::Relaxed);
                Response::status_only(200)
            }
            ("GET", "/local/get_version") => Response::ok(
                json!({ "version_for_upgrade": self.version })
                    .to_string()
                    .into_bytes(),
            ),
            _ => Response::status_only(404),
        }
    }

    fn acquire_quota(&self, body: &[u8]) -> Response {
        let args: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return Response::bad_request(),
        };
        let (wait_ms, lightweight, pid) = match (
            args["milliseconds_to_wait"].as_u64(),
            args["lightweight_task"].as_bool(),
            args["requestor_pid"].as_u64(),
        ) {
            (Some(w), Some(l), Some(p)) => (w, l, p as u32),
            _ => return Response::bad_request(),
        };
        let wait = ::std::cmp::min(Duration::from_millis(wait_ms), MAX_WAITABLE);
        // Faking the arguments only hurts the requestor itself.
        if self
            .monitor
            .wait_for_running_new_task_permission(pid, lightweight, wait)
        {
            Response::status_only(200)
        } else {
            Response::status_only(503)
        }
    }

    fn release_quota(&self, body: &[u8]) -> Response {
        let args: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return Response::bad_request(),
        };
        match args["requestor_pid"].as_u64() {
            Some(pid) => {
                self.monitor.drop_task_permission(pid as u32);
                Response::status_only(200)
            }
            None => Response::bad_request(),
        }
    }

    fn submit_cxx_task(&self, body: &[u8]) -> Response {
        let parts = match multi_chunk::try_parse_multi_chunk(body) {
            Some(ref parts) if parts.len() == 2 => {
                (parts[0].to_vec(), parts[1].to_vec())
            }
            _ => return Response::bad_request(),
        };
        let (json_part, compressed_source) = parts;
        let args: Value = match serde_json::from_slice(&json_part) {
            Ok(v) => v,
            Err(_) => return Response::bad_request(),
        };

        let compiler = &args["compiler"];
        let digest = match (
            compiler["path"].as_str(),
            compiler["size"].as_u64(),
            compiler["timestamp"].as_u64(),
        ) {
            (Some(path), Some(size), Some(timestamp)) if path.starts_with('/') => {
                self.file_digests.try_get(path, size, timestamp)
            }
            _ => None,
        };
        let digest = match digest {
            Some(d) => d,
            // Unknown compiler: the wrapper teaches us the digest via
            // `set_file_digest` and retries.
            None => return Response::bad_request(),
        };

        let cache_control = match args["cache_control"]
            .as_i64()
            .and_then(CacheControl::from_value)
        {
            Some(c) => c,
            None => return Response::bad_request(),
        };
        let task = CxxCompilationTask::new(
            args["requestor_process_id"].as_u64().unwrap_or(0) as u32,
            EnvironmentDesc::new(&digest),
            args["source_path"].as_str().unwrap_or("").to_owned(),
            args["source_digest"].as_str().unwrap_or("").to_owned(),
            args["compiler_invocation_arguments"]
                .as_str()
                .unwrap_or("")
                .to_owned(),
            cache_control,
            compressed_source,
        );
        let task = match task {
            Ok(t) => t,
            Err(_) => return Response::bad_request(),
        };
        let task_id = DistributedTaskDispatcher::queue_task(
            &self.dispatcher,
            Box::new(task),
            Instant::now() + START_DEADLINE,
        );
        Response::ok(
            json!({ "task_id": task_id.to_string() })
                .to_string()
                .into_bytes(),
        )
    }

    fn wait_for_cxx_task(&self, body: &[u8]) -> Response {
        let args: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return Response::bad_request(),
        };
        let task_id = match args["task_id"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(id) => id,
            None => return Response::bad_request(),
        };
        let wait_ms = match args["milliseconds_to_wait"].as_u64() {
            Some(w) if Duration::from_millis(w) <= MAX_WAITABLE => w,
            _ => return Response::bad_request(),
        };

        let task = match self
            .dispatcher
            .wait_for_task::<CxxCompilationTask>(task_id, Duration::from_millis(wait_ms))
        {
            Ok(task) => task,
            Err(WaitStatus::Timeout) => return Response::status_only(503),
            Err(WaitStatus::NotFound) => {
                warn!("Received a request for a non-existing task ID [{}].", task_id);
                return Response::status_only(404);
            }
        };
        let (json, files) = match task.rebuild_output() {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to render task output: {}", e);
                return Response::status_only(500);
            }
        };
        let json_bytes = json.to_string().into_bytes();
        let mut parts: Vec<&[u8]> = vec![&json_bytes];
        for file in &files {
            parts.push(file);
        }
        Response::ok(multi_chunk::make_multi_chunk(&parts))
    }

    fn set_file_digest(&self, body: &[u8]) -> Response {
        let args: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return Response::bad_request(),
        };
        match (
            args["path"].as_str(),
            args["size"].as_u64(),
            args["timestamp"].as_u64(),
            args["digest"].as_str(),
        ) {
            (Some(path), Some(size), Some(timestamp), Some(digest))
                if !path.is_empty() && !digest.is_empty() =>
            {
                self.file_digests
                    .set(path.to_owned(), size, timestamp, digest.to_owned());
                Response::status_only(200)
            }
            _ => Response::bad_request(),
        }
    }
}

pub struct HttpServer {
    local_addr: ::std::net::SocketAddr,
    stopping: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl HttpServer {
    pub fn start(bind: &str, service: Arc<HttpService>) -> Result<HttpServer> {
        let listener =
            TcpListener::bind(bind).chain_err(|| format!("failed to bind [{}]", bind))?;
        let local_addr = listener.local_addr()?;
        let stopping = Arc::new(AtomicBool::new(false));
        let stopping2 = stopping.clone();
        let accept_thread = thread::Builder::new()
            .name("local-http".to_owned())
            .spawn(move || {
                for conn in listener.incoming() {
                    if stopping2.load(Ordering::Relaxed) {
                        break;
                    }
                    let stream = match conn {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("Failed to accept local connection: {}", e);
                            continue;
                        }
                    };
                    let service = service.clone();
                    thread::spawn(move || serve_connection(stream, service));
                }
            })?;
        Ok(HttpServer {
            local_addr,
            stopping,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn location(&self) -> String {
        format!("{}", self.local_addr)
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(self.local_addr);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn serve_connection(stream: TcpStream, service: Arc<HttpService>) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });
    let mut stream = stream;
    loop {
        let request = match read_request(&mut reader) {
            Ok(Some(r)) => r,
            _ => return,
        };
        let response = service.dispatch(request);
        if write_response(&mut stream, &response).is_err() {
            return;
        }
    }
}

fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<Request>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None); // Clean EOF between requests.
    }
    let mut pieces = line.split_whitespace();
    let (method, path) = match (pieces.next(), pieces.next(), pieces.next()) {
        (Some(m), Some(p), Some(proto)) if proto.starts_with("HTTP/1.") => {
            (m.to_owned(), p.to_owned())
        }
        _ => bail!(ErrorKind::InvalidArgument("malformed request line".into())),
    };

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            bail!(ErrorKind::InvalidArgument("truncated headers".into()));
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        let mut kv = header.splitn(2, ':');
        let key = kv.next().unwrap_or("").trim().to_ascii_lowercase();
        let value = kv.next().unwrap_or("").trim();
        if key == "content-length" {
            content_length = value
                .parse()
                .map_err(|_| ErrorKind::InvalidArgument("bad content-length".into()))?;
        }
    }
    if content_length > MAX_BODY {
        bail!(ErrorKind::InvalidArgument("body too large".into()));
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(Some(Request { method, path, body }))
}

fn write_response<W: Write>(w: &mut W, response: &Response) -> Result<()> {
    let reason = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    write!(
        w,
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        response.status,
        reason,
        response.body.len()
    )?;
    w.write_all(&response.body)?;
    w.flush()?;
    Ok(())
}
