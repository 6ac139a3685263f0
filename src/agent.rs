use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::grpc::{AgentService, GrpcServer};
use crate::resource::AllocationLedger;
use crate::storage::{ChannelRegistry, DatasetStore};

/// The agent node: wires the allocation ledger, shard storage, and the
/// transport server together.
pub struct Agent {
    pub config: AgentConfig,
    pub ledger: Arc<AllocationLedger>,
    pub store: Arc<DatasetStore>,
    pub channels: Arc<ChannelRegistry>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let ledger = Arc::new(AllocationLedger::new(config.capacity));
        let store = Arc::new(DatasetStore::new(&config.base_dir));
        let channels = Arc::new(ChannelRegistry::new());

        Self {
            config,
            ledger,
            store,
            channels,
        }
    }

    /// Runs the agent until the shutdown token fires or the transport
    /// server fails. Blocks on the gRPC server; every request runs on its
    /// own task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.base_dir).await?;

        let service = AgentService::new(
            self.config.clone(),
            self.ledger.clone(),
            self.store.clone(),
            self.channels.clone(),
        );
        let server = GrpcServer::new(self.config.listen_addr, service, shutdown);
        server.run().await?;
        Ok(())
    }
}
