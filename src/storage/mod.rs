//! Local dataset-shard storage and the in-memory channel registry.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, RwLock};

/// Materialized dataset shards as files under `<base_dir>/shards`.
#[derive(Debug)]
pub struct DatasetStore {
    dir: PathBuf,
}

impl DatasetStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            dir: base_dir.join("shards"),
        }
    }

    fn shard_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.dat"))
    }

    pub async fn write(&self, name: &str, content: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.shard_path(name), content).await
    }

    pub async fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.shard_path(name)).await
    }

    pub async fn contains(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.shard_path(name))
            .await
            .unwrap_or(false)
    }

    pub async fn delete(&self, name: &str) -> io::Result<()> {
        tokio::fs::remove_file(self.shard_path(name)).await
    }
}

/// Named in-memory byte channels connecting local shard producers to their
/// consumers.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel under `name` and hands back its receiving end.
    /// An existing channel under the same name is replaced; its consumers
    /// observe a drain.
    pub async fn create(&self, name: &str, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity);
        self.channels.write().await.insert(name.to_string(), tx);
        rx
    }

    pub async fn sender(&self, name: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Drops the sending end so consumers drain. Returns whether a channel
    /// was registered under `name`.
    pub async fn cleanup(&self, name: &str) -> bool {
        self.channels.write().await.remove(name).is_some()
    }
}
