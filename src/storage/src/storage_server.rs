use async_trait::async_trait;
use dfs_lib::{
    list_local_tree, CommandHandler, CommandServerHandler, DfsError, DfsPath, DfsResult,
    RegistrationClient, RpcServer, StorageHandler, StorageRef, StorageServerHandler,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

use crate::local_store::LocalStore;

#[async_trait]
impl StorageHandler for LocalStore {
    async fn handle_size(&self, path: DfsPath) -> DfsResult<u64> {
        self.size(&path).await
    }

    async fn handle_read(&self, path: DfsPath, offset: i64, length: i64) -> DfsResult<Vec<u8>> {
        self.read(&path, offset, length).await
    }

    async fn handle_write(&self, path: DfsPath, offset: i64, data: Vec<u8>) -> DfsResult<()> {
        self.write(&path, offset, &data).await
    }
}

#[async_trait]
impl CommandHandler for LocalStore {
    async fn handle_create(&self, path: DfsPath) -> DfsResult<bool> {
        self.create(&path).await
    }

    async fn handle_delete(&self, path: DfsPath) -> DfsResult<bool> {
        self.delete(&path).await
    }

    async fn handle_copy(&self, path: DfsPath, source: StorageRef) -> DfsResult<bool> {
        self.copy(&path, &source).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageServerConfig {
    /// Host directory whose subtree is exported.
    pub root: PathBuf,
    /// Address of the naming server's registration interface.
    pub naming_addr: String,
    /// Externally-routable hostname advertised in the registered addresses.
    pub hostname: String,
    /// Port for the client (read) interface; 0 picks an ephemeral port.
    #[serde(default)]
    pub client_port: u16,
    /// Port for the command interface; 0 picks an ephemeral port.
    #[serde(default)]
    pub command_port: u16,
}

/// One storage server process: a [`LocalStore`] exposed over the client and
/// command RPC interfaces, registered with the naming server at startup.
pub struct StorageServer {
    store: Arc<LocalStore>,
    config: StorageServerConfig,
    read_server: Option<RpcServer>,
    command_server: Option<RpcServer>,
    local_ref: Option<StorageRef>,
}

impl StorageServer {
    pub fn new(config: StorageServerConfig) -> DfsResult<Self> {
        let store = Arc::new(LocalStore::new(config.root.clone())?);
        Ok(Self {
            store,
            config,
            read_server: None,
            command_server: None,
            local_ref: None,
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Addresses this server registered under, once started.
    pub fn local_ref(&self) -> Option<&StorageRef> {
        self.local_ref.as_ref()
    }

    /// Binds both interfaces, lists the root, registers with the naming
    /// server, and prunes the duplicate paths it returns.
    pub async fn start(&mut self) -> DfsResult<StorageRef> {
        if self.local_ref.is_some() {
            return Err(DfsError::InvalidState(
                "storage server already started".to_string(),
            ));
        }

        let read_server = RpcServer::bind(
            &format!("0.0.0.0:{}", self.config.client_port),
            Arc::new(StorageServerHandler::new(self.store.clone())),
        )
        .await?;
        let command_server = RpcServer::bind(
            &format!("0.0.0.0:{}", self.config.command_port),
            Arc::new(CommandServerHandler::new(self.store.clone())),
        )
        .await?;

        let local_ref = StorageRef {
            read_addr: format!("{}:{}", self.config.hostname, read_server.local_addr().port()),
            command_addr: format!(
                "{}:{}",
                self.config.hostname,
                command_server.local_addr().port()
            ),
        };

        let files = list_local_tree(self.store.root())?;
        info!(
            "registering {} files with naming server at {}",
            files.len(),
            self.config.naming_addr
        );
        let naming = RegistrationClient::new(&self.config.naming_addr);
        let duplicates = naming.register(&local_ref, &files).await?;
        if !duplicates.is_empty() {
            info!("pruning {} duplicate files", duplicates.len());
            self.prune_duplicates(&duplicates).await;
        }

        self.read_server = Some(read_server);
        self.command_server = Some(command_server);
        self.local_ref = Some(local_ref.clone());
        Ok(local_ref)
    }

    pub fn stop(&self) {
        if let Some(server) = &self.read_server {
            server.stop();
        }
        if let Some(server) = &self.command_server {
            server.stop();
        }
    }

    /// Deletes each duplicate locally, then removes now-empty ancestor
    /// directories bottom-up, stopping at the first non-empty one and never
    /// touching the root itself.
    async fn prune_duplicates(&self, duplicates: &[DfsPath]) {
        for path in duplicates {
            let host = self.store.host_path(path);
            if let Err(e) = fs::remove_file(&host).await {
                warn!("dedup: remove {} failed! {}", path, e);
                continue;
            }
            let mut ancestor = path.parent();
            while let Some(dir) = ancestor {
                if dir.is_root() {
                    break;
                }
                if !self.remove_if_empty(&dir).await {
                    break;
                }
                ancestor = dir.parent();
            }
        }
    }

    async fn remove_if_empty(&self, dir: &DfsPath) -> bool {
        let host = self.store.host_path(dir);
        let mut entries = match fs::read_dir(&host).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        match entries.next_entry().await {
            Ok(None) => fs::remove_dir(&host).await.is_ok(),
            _ => false,
        }
    }
}
