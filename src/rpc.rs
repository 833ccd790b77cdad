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

//! Blocking RPC plumbing: bincode messages in `u32`-length-prefixed frames
//! straight over TCP, one thread per connection on the server side, one
//! connection per call on the client side.

use bincode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use errors::*;
use protocol::*;

/// Result files can be tens of megabytes; preprocessed sources too. Anything
/// beyond this is a protocol violation.
const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_FRAME_SIZE as usize {
        bail!(ErrorKind::InvalidArgument(format!(
            "frame of {} bytes exceeds the frame cap",
            bytes.len()
        )));
    }
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let len = r.read_u32::<LittleEndian>()?;
    if len > MAX_FRAME_SIZE {
        bail!(ErrorKind::InvalidArgument(format!(
            "frame of {} bytes exceeds the frame cap",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(bincode::deserialize(&buf)?)
}

/// A request handler bound to one listening port.
pub trait Service: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    fn handle(&self, peer: SocketAddr, request: Self::Request) -> Result<Self::Response>;
}

pub struct Server {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Binds `bind` and starts accepting. Each connection gets its own
    /// thread; requests on one connection are served in order.
    pub fn start<S: Service>(bind: &str, service: Arc<S>) -> Result<Server> {
        let listener = TcpListener::bind(bind)
            .chain_err(|| format!("failed to bind [{}]", bind))?;
        let local_addr = listener.local_addr()?;
        let stopping = Arc::new(AtomicBool::new(false));
        let stopping2 = stopping.clone();
        let accept_thread = thread::Builder::new()
            .name(format!("rpc-accept-{}", local_addr.port()))
            .spawn(move || {
                for conn in listener.incoming() {
                    if stopping2.load(Ordering::Relaxed) {
                        break;
                    }
                    let stream = match conn {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let service = service.clone();
                    thread::spawn(move || serve_connection(stream, service));
                }
            })?;
        Ok(Server {
            local_addr,
            stopping,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn location(&self) -> String {
        format!("{}", self.local_addr)
    }

    /// Stops accepting new connections. In-flight connections drain on their
    /// own as peers disconnect.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.local_addr);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn serve_connection<S: Service>(mut stream: TcpStream, service: Arc<S>) {
    let peer = match stream.peer_addr() {
        Ok(p) => p,
        Err(_) => return,
    };
    let _ = stream.set_nodelay(true);
    loop {
        let request: S::Request = match read_frame(&mut stream) {
            Ok(r) => r,
            Err(_) => return, // EOF, or the peer misbehaved. Either way we're done.
        };
        let reply: ::std::result::Result<S::Response, Status> =
            service.handle(peer, request).map_err(|e| {
                let status = Status::of_error(&e);
                if let Status::Internal(_) = status {
                    warn!("Request from [{}] failed: {}", peer, e);
                }
                status
            });
        if write_frame(&mut stream, &reply).is_err() {
            return;
        }
    }
}

fn resolve(location: &str) -> Result<SocketAddr> {
    location
        .to_socket_addrs()
        .map_err(|e| Error::from(ErrorKind::Transport(format!("resolve [{}]: {}", location, e))))?
        .next()
        .ok_or_else(|| ErrorKind::Transport(format!("resolve [{}]: no address", location)).into())
}

/// One-shot call: connect, send, await the reply. `timeout` bounds the wait
/// for the response and must exceed any server-side long-poll.
pub fn call<Req: Serialize, Resp: DeserializeOwned>(
    location: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp> {
    let addr = resolve(location)?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| Error::from(ErrorKind::Transport(format!("connect [{}]: {}", location, e))))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .and_then(|_| stream.set_nodelay(true))
        .map_err(|e| Error::from(ErrorKind::Transport(e.to_string())))?;
    write_frame(&mut stream, request)
        .map_err(|e| Error::from(ErrorKind::Transport(format!("send [{}]: {}", location, e))))?;
    let reply: ::std::result::Result<Resp, Status> = read_frame(&mut stream)
        .map_err(|e| Error::from(ErrorKind::Transport(format!("recv [{}]: {}", location, e))))?;
    reply.map_err(Status::into_error)
}

/// True if the error came from the transport rather than the remote service.
pub fn is_transport_error(e: &Error) -> bool {
    match *e.kind() {
        ErrorKind::Transport(_) => true,
        _ => false,
    }
}

macro_rules! rpc_method {
    ($name:ident, $reqty:ty, $respty:ty, $reqvariant:path, $respvariant:path,
     $request_enum:ty, $response_enum:ty) => {
        pub fn $name(&self, request: $reqty, timeout: Duration) -> Result<$respty> {
            let reply: $response_enum =
                call(&self.location, &$reqvariant(request), timeout)?;
            match reply {
                $respvariant(r) => Ok(r),
                _ => bail!(ErrorKind::Transport("mismatched response variant".into())),
            }
        }
    };
}

/// Client half of the scheduler service.
#[derive(Clone)]
pub struct SchedulerClient {
    location: String,
}

impl SchedulerClient {
    pub fn new(location: &str) -> SchedulerClient {
        SchedulerClient { location: location.to_owned() }
    }

    rpc_method!(heartbeat, HeartbeatRequest, HeartbeatResponse,
                SchedulerRequest::Heartbeat, SchedulerResponse::Heartbeat,
                SchedulerRequest, SchedulerResponse);
    rpc_method!(get_config, GetConfigRequest, GetConfigResponse,
                SchedulerRequest::GetConfig, SchedulerResponse::GetConfig,
                SchedulerRequest, SchedulerResponse);
    rpc_method!(wait_for_starting_task, WaitForStartingTaskRequest, WaitForStartingTaskResponse,
                SchedulerRequest::WaitForStartingTask, SchedulerResponse::WaitForStartingTask,
                SchedulerRequest, SchedulerResponse);
    rpc_method!(keep_task_alive, KeepTaskAliveRequest, KeepTaskAliveResponse,
                SchedulerRequest::KeepTaskAlive, SchedulerResponse::KeepTaskAlive,
                SchedulerRequest, SchedulerResponse);
    rpc_method!(free_task, FreeTaskRequest, FreeTaskResponse,
                SchedulerRequest::FreeTask, SchedulerResponse::FreeTask,
                SchedulerRequest, SchedulerResponse);
    rpc_method!(get_running_tasks, GetRunningTasksRequest, GetRunningTasksResponse,
                SchedulerRequest::GetRunningTasks, SchedulerResponse::GetRunningTasks,
                SchedulerRequest, SchedulerResponse);
}

/// Client half of the cache service.
#[derive(Clone)]
pub struct CacheClient {
    location: String,
}

impl CacheClient {
    pub fn new(location: &str) -> CacheClient {
        CacheClient { location: location.to_owned() }
    }

    rpc_method!(try_get_entry, TryGetEntryRequest, TryGetEntryResponse,
                CacheRequest::TryGetEntry, CacheResponse::TryGetEntry,
                CacheRequest, CacheResponse);
    rpc_method!(put_entry, PutEntryRequest, PutEntryResponse,
                CacheRequest::PutEntry, CacheResponse::PutEntry,
                CacheRequest, CacheResponse);
    rpc_method!(fetch_bloom_filter, FetchBloomFilterRequest, FetchBloomFilterResponse,
                CacheRequest::FetchBloomFilter, CacheResponse::FetchBloomFilter,
                CacheRequest, CacheResponse);
}

/// Client half of a servant daemon.
#[derive(Clone)]
pub struct DaemonClient {
    location: String,
}

impl DaemonClient {
    pub fn new(location: &str) -> DaemonClient {
        DaemonClient { location: location.to_owned() }
    }

    rpc_method!(queue_cxx_task, QueueCxxTaskRequest, QueueCxxTaskResponse,
                DaemonRequest::QueueCxxTask, DaemonResponse::QueueCxxTask,
                DaemonRequest, DaemonResponse);
    rpc_method!(wait_for_compilation_output, WaitForCompilationOutputRequest,
                WaitForCompilationOutputResponse,
                DaemonRequest::WaitForCompilationOutput, DaemonResponse::WaitForCompilationOutput,
                DaemonRequest, DaemonResponse);
    rpc_method!(free_task, FreeServantTaskRequest, FreeServantTaskResponse,
                DaemonRequest::FreeTask, DaemonResponse::FreeTask,
                DaemonRequest, DaemonResponse);
    rpc_method!(reference_task, ReferenceTaskRequest, ReferenceTaskResponse,
                DaemonRequest::ReferenceTask, DaemonResponse::ReferenceTask,
                DaemonRequest, DaemonResponse);
}

#[cfg(test)]
mod test {
    use super::*;

    struct EchoService;

    impl Service for EchoService {
        type Request = String;
        type Response = String;

        fn handle(&self, _peer: SocketAddr, request: String) -> Result<String> {
            if request == "fail" {
                bail!(ErrorKind::NotFound);
            }
            Ok(format!("echo: {}", request))
        }
    }

    #[test]
    fn test_call_round_trip() {
        let server = Server::start("127.0.0.1:0", Arc::new(EchoService)).unwrap();
        let reply: String = call(
            &server.location(),
            &"hello".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(reply, "echo: hello");
    }

    #[test]
    fn test_remote_error_is_not_transport_error() {
        let server = Server::start("127.0.0.1:0", Arc::new(EchoService)).unwrap();
        let reply: Result<String> = call(
            &server.location(),
            &"fail".to_string(),
            Duration::from_secs(5),
        );
        let err = reply.unwrap_err();
        assert!(!is_transport_error(&err));
        match *err.kind() {
            ErrorKind::NotFound => {}
            ref other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unreachable_peer_is_transport_error() {
        // Port 1 is virtually never listening.
        let reply: Result<String> =
            call("127.0.0.1:1", &"hello".to_string(), Duration::from_secs(1));
        assert!(is_transport_error(&reply.unwrap_err()));
    }
}
