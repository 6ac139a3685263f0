use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::resource::ComputeResource;

/// Agent configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base working directory; per-flow directories and dataset shards live
    /// underneath it.
    pub base_dir: PathBuf,
    pub listen_addr: SocketAddr,
    /// Declared compute capacity of this host. The control plane is the
    /// admission gate; the agent only reports allocation against it.
    pub capacity: ComputeResource,
    /// Interval between empty keepalive responses on a silent execution.
    pub keepalive_interval: Duration,
    /// Executable spawned to run a fragment. `None` means the agent's own
    /// binary.
    pub executor_bin: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/flowlet"),
            listen_addr: "127.0.0.1:45326".parse().unwrap(),
            capacity: ComputeResource::new(16, 32 * 1024, 0),
            keepalive_interval: Duration::from_secs(60),
            executor_bin: None,
        }
    }
}

impl AgentConfig {
    pub fn new(base_dir: PathBuf, listen_addr: SocketAddr) -> Self {
        Self {
            base_dir,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: ComputeResource) -> Self {
        self.capacity = capacity;
        self
    }
}
