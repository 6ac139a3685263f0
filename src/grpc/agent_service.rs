use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::config::AgentConfig;
use crate::executor::Supervisor;
use crate::proto::flowlet_agent_server::FlowletAgent;
use crate::proto::{
    DeleteDatasetShardRequest, DeleteDatasetShardResponse, ExecutionRequest, ExecutionResponse,
    FileResourceRequest, FileResourceResponse, ResourceStatusRequest, ResourceStatusResponse,
};
use crate::resource::{AllocationLedger, ComputeResource};
use crate::storage::{ChannelRegistry, DatasetStore};
use crate::workdir;

/// The agent's RPC surface: file staging, fragment execution, shard
/// deletion, and the resource-status query.
pub struct AgentService {
    config: AgentConfig,
    ledger: Arc<AllocationLedger>,
    store: Arc<DatasetStore>,
    channels: Arc<ChannelRegistry>,
    /// Serializes uploads. They are not a throughput path, and one writer at
    /// a time rules out double-write races on the same target.
    upload_lock: Arc<Mutex<()>>,
}

impl AgentService {
    pub fn new(
        config: AgentConfig,
        ledger: Arc<AllocationLedger>,
        store: Arc<DatasetStore>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            channels,
            upload_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[tonic::async_trait]
impl FlowletAgent for AgentService {
    type SendFileResourceStream = ReceiverStream<Result<FileResourceResponse, Status>>;
    type ExecuteStream = ReceiverStream<Result<ExecutionResponse, Status>>;

    async fn send_file_resource(
        &self,
        request: Request<Streaming<FileResourceRequest>>,
    ) -> Result<Response<Self::SendFileResourceStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        let base_dir = self.config.base_dir.clone();
        let lock = self.upload_lock.clone();
        tokio::spawn(async move {
            let _serialized = lock.lock().await;
            if let Err(status) = receive_file(&base_dir, &mut inbound, &tx).await {
                tracing::error!(error = %status, "File resource upload failed");
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn execute(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();

        let instructions = req
            .instructions
            .as_ref()
            .filter(|set| !set.instructions.is_empty())
            .ok_or_else(|| Status::invalid_argument("Instruction set cannot be empty"))?;

        let allocation = req
            .resource
            .clone()
            .map(ComputeResource::from)
            .unwrap_or_default();
        if !allocation.is_non_negative() {
            return Err(Status::invalid_argument(
                "Resource allocation must be non-negative on every axis",
            ));
        }

        let work_dir = workdir::resolve(&self.config.base_dir, instructions.flow_hash_code, &req.dir)
            .await
            .map_err(|e| {
                Status::internal(format!("failed to create working directory: {e}"))
            })?;

        let supervisor = Supervisor::new(
            self.ledger.clone(),
            self.config.executor_bin.clone(),
            self.config.keepalive_interval,
        );
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            supervisor.run(req, work_dir, tx).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn delete_dataset_shard(
        &self,
        request: Request<DeleteDatasetShardRequest>,
    ) -> Result<Response<DeleteDatasetShardResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(name = %req.name, "Deleting dataset shard");

        if let Err(e) = self.store.delete(&req.name).await {
            tracing::warn!(name = %req.name, error = %e, "Shard delete reported a miss");
        }
        if !self.channels.cleanup(&req.name).await {
            tracing::debug!(name = %req.name, "No in-memory channel registered for shard");
        }

        Ok(Response::new(DeleteDatasetShardResponse {}))
    }

    async fn resource_status(
        &self,
        _request: Request<ResourceStatusRequest>,
    ) -> Result<Response<ResourceStatusResponse>, Status> {
        Ok(Response::new(ResourceStatusResponse {
            capacity: Some(self.ledger.capacity().into()),
            allocated: Some(self.ledger.allocated().into()),
        }))
    }
}

/// Ingests one file upload: a metadata message, then content chunks until
/// the client half-closes. Sends exactly one acknowledgement, and consumes
/// no chunks when the target already carries the expected hash.
async fn receive_file(
    base_dir: &Path,
    inbound: &mut Streaming<FileResourceRequest>,
    tx: &mpsc::Sender<Result<FileResourceResponse, Status>>,
) -> Result<(), Status> {
    let meta = inbound
        .message()
        .await?
        .ok_or_else(|| Status::invalid_argument("Upload closed before the metadata message"))?;

    let dir = workdir::resolve(base_dir, meta.flow_hash_code, &meta.dir)
        .await
        .map_err(|e| Status::internal(format!("failed to create working directory: {e}")))?;
    let target = dir.join(&meta.name);

    let already_present = match workdir::file_sha256(&target).await {
        Ok(hash) => hash == meta.hash,
        Err(_) => false,
    };

    tx.send(Ok(FileResourceResponse {
        already_present,
        ok: true,
    }))
    .await
    .map_err(|_| Status::cancelled("caller closed the response stream"))?;

    if already_present {
        tracing::debug!(name = %meta.name, "File resource already present, skipping content");
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o755)
        .open(&target)
        .await
        .map_err(|e| Status::internal(format!("failed to open {}: {e}", target.display())))?;
    // The open mode is subject to the umask; the contract is a literal 0755.
    tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| Status::internal(format!("failed to chmod {}: {e}", target.display())))?;

    while let Some(chunk) = inbound.message().await? {
        file.write_all(&chunk.content)
            .await
            .map_err(|e| Status::internal(format!("failed to write {}: {e}", target.display())))?;
    }
    file.flush()
        .await
        .map_err(|e| Status::internal(format!("failed to flush {}: {e}", target.display())))?;

    tracing::info!(name = %meta.name, target = %target.display(), "File resource staged");
    Ok(())
}
