use async_trait::async_trait;
use dfs_lib::{
    CommandClient, DfsError, DfsPath, DfsResult, RegistrationHandler, RegistrationServerHandler,
    RpcServer, ServiceHandler, ServiceServerHandler, StorageRef, REGISTRATION_PORT, SERVICE_PORT,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::dir_tree::DirTree;
use crate::path_lock::PathLockManager;

/// Shared acquisitions on a file node before an extra replica is made.
pub const DEFAULT_REPLICATION_THRESHOLD: u64 = 20;

fn default_service_port() -> u16 {
    SERVICE_PORT
}

fn default_registration_port() -> u16 {
    REGISTRATION_PORT
}

fn default_replication_threshold() -> u64 {
    DEFAULT_REPLICATION_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingServerConfig {
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_registration_port")]
    pub registration_port: u16,
    #[serde(default = "default_replication_threshold")]
    pub replication_threshold: u64,
}

impl Default for NamingServerConfig {
    fn default() -> Self {
        Self {
            service_port: SERVICE_PORT,
            registration_port: REGISTRATION_PORT,
            replication_threshold: DEFAULT_REPLICATION_THRESHOLD,
        }
    }
}

struct Registry {
    servers: Vec<StorageRef>,
    commands: HashMap<String, Arc<CommandClient>>,
}

struct NamingInner {
    tree: Mutex<DirTree>,
    locks: PathLockManager,
    registry: Mutex<Registry>,
    replication_threshold: u64,
}

/// The naming server core: directory tree, path locks, storage registry,
/// and the replication policy tied to lock accounting.
///
/// Every operation takes its path locks through the lock manager before
/// touching the tree; the tree's own mutex only guards map structure during
/// one mutation. Outbound storage commands run while the path locks are
/// held, so storage command handlers must never call back in.
#[derive(Clone)]
pub struct NamingService(Arc<NamingInner>);

impl NamingService {
    pub fn new(replication_threshold: u64) -> Self {
        Self(Arc::new(NamingInner {
            tree: Mutex::new(DirTree::new()),
            locks: PathLockManager::new(),
            registry: Mutex::new(Registry {
                servers: Vec::new(),
                commands: HashMap::new(),
            }),
            replication_threshold,
        }))
    }

    /// Replica set of a file, for introspection and tests.
    pub fn replicas_of(&self, path: &DfsPath) -> DfsResult<Vec<StorageRef>> {
        self.0.tree.lock().unwrap().replicas_of(path)
    }

    pub async fn is_directory_op(&self, path: &DfsPath) -> DfsResult<bool> {
        let _guard = self.0.locks.lock_chain(path, false).await;
        self.0.tree.lock().unwrap().is_directory(path)
    }

    pub async fn list_op(&self, path: &DfsPath) -> DfsResult<Vec<String>> {
        let _guard = self.0.locks.lock_chain(path, false).await;
        self.0.tree.lock().unwrap().children(path)
    }

    /// Creates an empty file on a randomly chosen storage server, then
    /// records it in the tree. The tree is only touched after the storage
    /// server reports success, so a failed command leaves no trace.
    pub async fn create_file_op(&self, path: &DfsPath) -> DfsResult<bool> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Ok(false),
        };
        let _guard = self.0.locks.lock_chain(&parent, true).await;
        {
            let tree = self.0.tree.lock().unwrap();
            if !tree.is_directory(&parent)? {
                return Err(DfsError::NotFound(format!(
                    "parent is not a directory: {}",
                    parent
                )));
            }
        }
        let server = self.pick_server()?;
        if self.0.tree.lock().unwrap().exists(path) {
            return Ok(false);
        }
        let command = self.command_client(&server);
        let created = command.create(path).await?;
        if !created {
            warn!("storage server {} refused create of {}", server.command_addr, path);
            return Ok(false);
        }
        self.0.tree.lock().unwrap().insert_file(path, server)?;
        Ok(true)
    }

    pub async fn create_directory_op(&self, path: &DfsPath) -> DfsResult<bool> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Ok(false),
        };
        let _guard = self.0.locks.lock_chain(&parent, true).await;
        let mut tree = self.0.tree.lock().unwrap();
        if !tree.is_directory(&parent)? {
            return Err(DfsError::NotFound(format!(
                "parent is not a directory: {}",
                parent
            )));
        }
        if tree.exists(path) {
            return Ok(false);
        }
        tree.insert_directory(path)?;
        Ok(true)
    }

    /// Deletes a file or directory subtree. Every replica of every file in
    /// the subtree receives a delete command first; the tree is mutated only
    /// once all of them succeeded, so the operation is all-or-nothing from
    /// the client's view.
    pub async fn delete_op(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Err(DfsError::InvalidArgument(
                "cannot delete the root directory".to_string(),
            ));
        }
        let _guard = self.0.locks.lock_chain(path, true).await;
        let (victims, is_dir) = {
            let tree = self.0.tree.lock().unwrap();
            if !tree.exists(path) {
                return Err(DfsError::NotFound(path.to_string()));
            }
            (tree.files_under(path), tree.is_directory(path)?)
        };
        for (file, replicas) in &victims {
            for replica in replicas {
                let command = self.command_client(replica);
                let deleted = command.delete(file).await.map_err(|e| {
                    warn!("delete of {} on {} failed: {}", file, replica.command_addr, e);
                    e
                })?;
                if !deleted {
                    warn!(
                        "storage server {} could not delete {}",
                        replica.command_addr, file
                    );
                    return Ok(false);
                }
            }
        }
        if is_dir {
            // clear the emptied host directories on every involved server
            let servers: std::collections::HashSet<StorageRef> = victims
                .iter()
                .flat_map(|(_, replicas)| replicas.iter().cloned())
                .collect();
            for server in servers {
                let command = self.command_client(&server);
                match command.delete(path).await {
                    Ok(_) => {}
                    Err(e) => warn!(
                        "directory cleanup of {} on {} failed: {}",
                        path, server.command_addr, e
                    ),
                }
            }
        }
        self.0.tree.lock().unwrap().remove(path)?;
        Ok(true)
    }

    pub async fn get_storage_op(&self, path: &DfsPath) -> DfsResult<StorageRef> {
        let _guard = self.0.locks.lock_chain(path, false).await;
        let replica = {
            let tree = self.0.tree.lock().unwrap();
            tree.pick_replica(path)?
        };
        self.note_shared_access(path);
        Ok(replica)
    }

    /// Client-visible lock. The caller stays "on" the path until it calls
    /// unlock with the same mode; shared file locks feed the replication
    /// counter, an exclusive file lock invalidates all but one replica.
    pub async fn lock_op(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        let ancestors = path.ancestors();
        for ancestor in &ancestors {
            self.0.locks.acquire(ancestor, false).await;
        }
        self.0.locks.acquire(path, exclusive).await;

        let kind = {
            let tree = self.0.tree.lock().unwrap();
            if tree.exists(path) {
                Some(tree.is_directory(path)?)
            } else {
                None
            }
        };
        let is_dir = match kind {
            Some(is_dir) => is_dir,
            None => {
                self.0.locks.release(path, exclusive);
                for ancestor in ancestors.iter().rev() {
                    self.0.locks.release(ancestor, false);
                }
                return Err(DfsError::NotFound(path.to_string()));
            }
        };
        if !is_dir {
            if exclusive {
                self.invalidate_replicas(path).await;
            } else {
                self.note_shared_access(path);
            }
        }
        Ok(())
    }

    pub async fn unlock_op(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        self.0.locks.release(path, exclusive);
        for ancestor in path.ancestors().iter().rev() {
            self.0.locks.release(ancestor, false);
        }
        Ok(())
    }

    /// Merges a storage server's advertised file list into the tree and
    /// returns the paths it must delete locally. The first registrant of a
    /// path wins; later servers are not added as replicas.
    pub async fn register_op(
        &self,
        server: StorageRef,
        paths: Vec<DfsPath>,
    ) -> DfsResult<Vec<DfsPath>> {
        {
            let mut registry = self.0.registry.lock().unwrap();
            let clash = registry
                .servers
                .iter()
                .any(|s| s.read_addr == server.read_addr || s.command_addr == server.command_addr);
            if clash {
                return Err(DfsError::AlreadyRegistered(server.command_addr.clone()));
            }
            registry.servers.push(server.clone());
            registry.commands.insert(
                server.command_addr.clone(),
                Arc::new(CommandClient::new(&server.command_addr)),
            );
        }
        info!(
            "registered storage server read {} command {} advertising {} paths",
            server.read_addr,
            server.command_addr,
            paths.len()
        );

        let mut duplicates = Vec::new();
        for path in paths {
            if path.is_root() {
                continue;
            }
            let _guard = self.0.locks.lock_chain(&path, true).await;
            let mut tree = self.0.tree.lock().unwrap();
            if tree.exists(&path) {
                duplicates.push(path.clone());
                continue;
            }
            let mut blocked = false;
            for ancestor in path.ancestors() {
                if !tree.exists(&ancestor) {
                    tree.insert_directory(&ancestor)?;
                } else if !tree.is_directory(&ancestor)? {
                    blocked = true;
                    break;
                }
            }
            if blocked {
                // an already-registered file occupies an ancestor; the
                // advertised path cannot enter the tree
                warn!("registered path {} conflicts with an existing file", path);
                duplicates.push(path);
                continue;
            }
            tree.insert_file(&path, server.clone())?;
        }
        Ok(duplicates)
    }

    fn pick_server(&self) -> DfsResult<StorageRef> {
        let registry = self.0.registry.lock().unwrap();
        if registry.servers.is_empty() {
            return Err(DfsError::InvalidState(
                "no storage servers registered".to_string(),
            ));
        }
        let index = rand::thread_rng().gen_range(0..registry.servers.len());
        Ok(registry.servers[index].clone())
    }

    fn command_client(&self, server: &StorageRef) -> Arc<CommandClient> {
        let mut registry = self.0.registry.lock().unwrap();
        registry
            .commands
            .entry(server.command_addr.clone())
            .or_insert_with(|| Arc::new(CommandClient::new(&server.command_addr)))
            .clone()
    }

    /// Counts one shared access; past the threshold, kicks off an
    /// asynchronous copy to one more storage server.
    fn note_shared_access(&self, path: &DfsPath) {
        let crossed = self
            .0
            .tree
            .lock()
            .unwrap()
            .note_read(path, self.0.replication_threshold);
        if crossed {
            info!("scheduling replication of {}", path);
            let service = self.clone();
            let path = path.clone();
            tokio::spawn(async move {
                service.replicate(path).await;
            });
        }
    }

    async fn replicate(&self, path: DfsPath) {
        let _guard = self.0.locks.lock_chain(&path, false).await;
        let picked = {
            let tree = self.0.tree.lock().unwrap();
            let replicas = match tree.replicas_of(&path) {
                Ok(replicas) => replicas,
                // deleted while the task was queued
                Err(_) => return,
            };
            let registry = self.0.registry.lock().unwrap();
            let candidates: Vec<StorageRef> = registry
                .servers
                .iter()
                .filter(|s| !replicas.contains(s))
                .cloned()
                .collect();
            if candidates.is_empty() {
                debug!("no further storage server available to replicate {}", path);
                None
            } else {
                let mut rng = rand::thread_rng();
                let source = replicas[rng.gen_range(0..replicas.len())].clone();
                let target = candidates[rng.gen_range(0..candidates.len())].clone();
                Some((source, target))
            }
        };
        let (source, target) = match picked {
            Some(picked) => picked,
            None => return,
        };
        let command = self.command_client(&target);
        match command.copy(&path, &source).await {
            Ok(true) => {
                let mut tree = self.0.tree.lock().unwrap();
                match tree.add_replica(&path, target.clone()) {
                    Ok(()) => info!("replicated {} to {}", path, target.command_addr),
                    Err(e) => warn!("replica of {} made but not recorded: {}", path, e),
                }
            }
            Ok(false) => warn!("replication of {} to {} refused", path, target.command_addr),
            Err(e) => warn!("replication of {} to {} failed: {}", path, target.command_addr, e),
        }
    }

    /// An exclusive file lock leaves a single replica behind; the rest are
    /// deleted from their servers and forgotten.
    async fn invalidate_replicas(&self, path: &DfsPath) {
        let dropped = {
            let mut tree = self.0.tree.lock().unwrap();
            match tree.retain_one_replica(path) {
                Ok(dropped) => dropped,
                Err(_) => return,
            }
        };
        for replica in dropped {
            let command = self.command_client(&replica);
            match command.delete(path).await {
                Ok(true) => info!("invalidated replica of {} on {}", path, replica.command_addr),
                Ok(false) => warn!(
                    "stale replica of {} on {} was already gone",
                    path, replica.command_addr
                ),
                Err(e) => warn!(
                    "invalidating replica of {} on {} failed: {}",
                    path, replica.command_addr, e
                ),
            }
        }
    }
}

#[async_trait]
impl ServiceHandler for NamingService {
    async fn handle_is_directory(&self, path: DfsPath) -> DfsResult<bool> {
        self.is_directory_op(&path).await
    }

    async fn handle_list(&self, path: DfsPath) -> DfsResult<Vec<String>> {
        self.list_op(&path).await
    }

    async fn handle_create_file(&self, path: DfsPath) -> DfsResult<bool> {
        self.create_file_op(&path).await
    }

    async fn handle_create_directory(&self, path: DfsPath) -> DfsResult<bool> {
        self.create_directory_op(&path).await
    }

    async fn handle_delete(&self, path: DfsPath) -> DfsResult<bool> {
        self.delete_op(&path).await
    }

    async fn handle_get_storage(&self, path: DfsPath) -> DfsResult<StorageRef> {
        self.get_storage_op(&path).await
    }

    async fn handle_lock(&self, path: DfsPath, exclusive: bool) -> DfsResult<()> {
        self.lock_op(&path, exclusive).await
    }

    async fn handle_unlock(&self, path: DfsPath, exclusive: bool) -> DfsResult<()> {
        self.unlock_op(&path, exclusive).await
    }
}

#[async_trait]
impl RegistrationHandler for NamingService {
    async fn handle_register(
        &self,
        server: StorageRef,
        paths: Vec<DfsPath>,
    ) -> DfsResult<Vec<DfsPath>> {
        self.register_op(server, paths).await
    }
}

/// One naming server process: the service core behind its two RPC
/// interfaces on the well-known ports.
pub struct NamingServer {
    config: NamingServerConfig,
    service: NamingService,
    service_rpc: Option<RpcServer>,
    registration_rpc: Option<RpcServer>,
}

impl NamingServer {
    pub fn new(config: NamingServerConfig) -> Self {
        let service = NamingService::new(config.replication_threshold);
        Self {
            config,
            service,
            service_rpc: None,
            registration_rpc: None,
        }
    }

    pub fn service(&self) -> &NamingService {
        &self.service
    }

    /// Binds the service and registration interfaces. Failing to bind
    /// either is fatal; the server must not be started twice.
    pub async fn start(&mut self) -> DfsResult<()> {
        if self.service_rpc.is_some() {
            return Err(DfsError::InvalidState(
                "naming server already started".to_string(),
            ));
        }
        let service_rpc = RpcServer::bind(
            &format!("0.0.0.0:{}", self.config.service_port),
            Arc::new(ServiceServerHandler::new(Arc::new(self.service.clone()))),
        )
        .await?;
        let registration_rpc = RpcServer::bind(
            &format!("0.0.0.0:{}", self.config.registration_port),
            Arc::new(RegistrationServerHandler::new(Arc::new(
                self.service.clone(),
            ))),
        )
        .await?;
        info!(
            "naming server up: service {} registration {}",
            service_rpc.local_addr(),
            registration_rpc.local_addr()
        );
        self.service_rpc = Some(service_rpc);
        self.registration_rpc = Some(registration_rpc);
        Ok(())
    }

    pub fn service_addr(&self) -> Option<SocketAddr> {
        self.service_rpc.as_ref().map(|s| s.local_addr())
    }

    pub fn registration_addr(&self) -> Option<SocketAddr> {
        self.registration_rpc.as_ref().map(|s| s.local_addr())
    }

    pub fn stop(&self) {
        if let Some(server) = &self.service_rpc {
            server.stop();
        }
        if let Some(server) = &self.registration_rpc {
            server.stop();
        }
    }
}
