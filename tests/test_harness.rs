//! Test harness for agent integration tests.
//!
//! Boots an in-process agent gRPC server on a loopback port and provides
//! client helpers shared by the integration test files. Executor-spawning
//! tests point the agent at the crate's own binary so the real child
//! contract is exercised.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Status;

use flowlet::config::AgentConfig;
use flowlet::grpc::{AgentService, GrpcServer};
use flowlet::proto::flowlet_agent_client::FlowletAgentClient;
use flowlet::proto::{
    ExecutionRequest, ExecutionResponse, FileResourceRequest, FileResourceResponse, Instruction,
    InstructionSet, MergeTo,
};
use flowlet::resource::{AllocationLedger, ComputeResource};
use flowlet::storage::{ChannelRegistry, DatasetStore};

/// A running in-process agent bound to a loopback port.
pub struct TestAgent {
    pub addr: SocketAddr,
    pub base_dir: PathBuf,
    pub ledger: Arc<AllocationLedger>,
    pub store: Arc<DatasetStore>,
    pub channels: Arc<ChannelRegistry>,
    workspace: TempDir,
    shutdown: CancellationToken,
    server_handle: JoinHandle<()>,
}

impl TestAgent {
    /// Starts an agent on `port` with a temporary base directory and the
    /// crate's own binary as the executor.
    pub async fn start(port: u16) -> Self {
        Self::start_with_keepalive(port, Duration::from_secs(60)).await
    }

    pub async fn start_with_keepalive(port: u16, keepalive_interval: Duration) -> Self {
        let workspace = tempfile::tempdir().expect("failed to create temp dir");
        let base_dir = workspace.path().to_path_buf();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let config = AgentConfig {
            base_dir: base_dir.clone(),
            listen_addr: addr,
            capacity: ComputeResource::new(16, 32 * 1024, 4),
            keepalive_interval,
            executor_bin: Some(PathBuf::from(env!("CARGO_BIN_EXE_flowlet"))),
        };

        let ledger = Arc::new(AllocationLedger::new(config.capacity));
        let store = Arc::new(DatasetStore::new(&config.base_dir));
        let channels = Arc::new(ChannelRegistry::new());
        let service = AgentService::new(
            config.clone(),
            ledger.clone(),
            store.clone(),
            channels.clone(),
        );

        let shutdown = CancellationToken::new();
        let server = GrpcServer::new(addr, service, shutdown.clone());
        let server_handle = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                eprintln!("test agent server failed: {e}");
            }
        });

        wait_for_server(addr).await;

        Self {
            addr,
            base_dir,
            ledger,
            store,
            channels,
            workspace,
            shutdown,
            server_handle,
        }
    }

    pub async fn client(&self) -> FlowletAgentClient<Channel> {
        FlowletAgentClient::connect(format!("http://{}", self.addr))
            .await
            .expect("failed to connect to test agent")
    }

    /// The working directory an execution or upload with this flow hash and
    /// relative dir resolves to.
    pub fn work_dir(&self, flow_hash_code: u32, rel_dir: &str) -> PathBuf {
        self.base_dir.join(flow_hash_code.to_string()).join(rel_dir)
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server_handle.await;
    }
}

async fn wait_for_server(addr: SocketAddr) {
    for _ in 0..100 {
        if FlowletAgentClient::connect(format!("http://{addr}")).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("test agent did not become reachable on {addr}");
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn assert_eventually<F, Fut>(mut condition: F, timeout: Duration, message: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{message}");
}

/// Uploads `content` as a file resource, chunking it into `chunk_size`
/// content messages after the metadata message. Returns the acknowledgement
/// once the server has finished the call.
pub async fn upload_file_chunked(
    client: &mut FlowletAgentClient<Channel>,
    flow_hash_code: u32,
    dir: &str,
    name: &str,
    content: &[u8],
    chunk_size: usize,
) -> Result<FileResourceResponse, Status> {
    let hash = flowlet::workdir::content_sha256(content);
    let (tx, rx) = mpsc::channel(4);
    tx.send(FileResourceRequest {
        name: name.to_string(),
        dir: dir.to_string(),
        flow_hash_code,
        hash,
        content: Vec::new(),
    })
    .await
    .unwrap();

    let mut inbound = client
        .send_file_resource(ReceiverStream::new(rx))
        .await?
        .into_inner();
    let ack = inbound
        .message()
        .await?
        .expect("upload acknowledgement missing");

    if !ack.already_present {
        for chunk in content.chunks(chunk_size) {
            tx.send(FileResourceRequest {
                content: chunk.to_vec(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
    }
    drop(tx);

    // The server closes its stream once the whole upload is durable.
    while inbound.message().await?.is_some() {}
    Ok(ack)
}

pub async fn upload_file(
    client: &mut FlowletAgentClient<Channel>,
    flow_hash_code: u32,
    dir: &str,
    name: &str,
    content: &[u8],
) -> Result<FileResourceResponse, Status> {
    upload_file_chunked(client, flow_hash_code, dir, name, content, 1024).await
}

/// An execution request wrapping a single MergeTo instruction.
pub fn merge_request(
    name: &str,
    flow_hash_code: u32,
    dir: &str,
    inputs: &[&str],
    resource: ComputeResource,
) -> ExecutionRequest {
    ExecutionRequest {
        name: name.to_string(),
        dir: dir.to_string(),
        instructions: Some(InstructionSet {
            instructions: vec![Instruction {
                name: "MergeTo".to_string(),
                merge_to: Some(MergeTo {
                    input_files: inputs.iter().map(|s| s.to_string()).collect(),
                }),
            }],
            flow_hash_code,
            name: name.to_string(),
        }),
        resource: Some(resource.into()),
    }
}

/// Runs an execution to completion and collects every response message.
pub async fn collect_execution(
    client: &mut FlowletAgentClient<Channel>,
    request: ExecutionRequest,
) -> Result<Vec<ExecutionResponse>, Status> {
    let mut stream = client.execute(request).await?.into_inner();
    let mut responses = Vec::new();
    while let Some(response) = stream.message().await? {
        responses.push(response);
    }
    Ok(responses)
}

/// Length-prefixed row encoding matching the executor's wire format.
pub fn encode_rows(rows: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    for row in rows {
        buf.extend_from_slice(&(row.len() as u32).to_le_bytes());
        buf.extend_from_slice(row);
    }
    buf
}

/// Creates a FIFO the executor child will block reading, letting tests hold
/// an execution open for as long as they need.
pub fn mkfifo(path: &Path) {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    assert_eq!(rc, 0, "mkfifo({}) failed", path.display());
}
