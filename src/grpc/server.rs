use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::agent_service::AgentService;
use crate::proto::flowlet_agent_server::FlowletAgentServer;

pub struct GrpcServer {
    addr: SocketAddr,
    service: AgentService,
    shutdown: CancellationToken,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, service: AgentService, shutdown: CancellationToken) -> Self {
        Self {
            addr,
            service,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(FlowletAgentServer::new(self.service))
            .serve_with_shutdown(self.addr, self.shutdown.cancelled_owned())
            .await
    }
}
