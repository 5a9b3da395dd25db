use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

use crate::path::DfsPath;
use crate::rpc::{RpcClient, RpcHandler, RpcRequest};
use crate::storage_api::{decode, StorageRef};
use crate::{DfsError, DfsResult};

/// ------------------------------
/// Naming service + registration protocol
/// ------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceIsDirectoryReq {
    pub path: DfsPath,
}

impl ServiceIsDirectoryReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceIsDirectoryReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceListReq {
    pub path: DfsPath,
}

impl ServiceListReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceListReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCreateFileReq {
    pub path: DfsPath,
}

impl ServiceCreateFileReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceCreateFileReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCreateDirectoryReq {
    pub path: DfsPath,
}

impl ServiceCreateDirectoryReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!(
                "failed to parse ServiceCreateDirectoryReq: {}",
                e
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDeleteReq {
    pub path: DfsPath,
}

impl ServiceDeleteReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceDeleteReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGetStorageReq {
    pub path: DfsPath,
}

impl ServiceGetStorageReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceGetStorageReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLockReq {
    pub path: DfsPath,
    pub exclusive: bool,
}

impl ServiceLockReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceLockReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUnlockReq {
    pub path: DfsPath,
    pub exclusive: bool,
}

impl ServiceUnlockReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse ServiceUnlockReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReq {
    pub read_addr: Option<String>,
    pub command_addr: Option<String>,
    pub paths: Option<Vec<DfsPath>>,
}

impl RegisterReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| DfsError::InvalidArgument(format!("failed to parse RegisterReq: {}", e)))
    }
}

/// Client-facing operations of the naming server.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle_is_directory(&self, path: DfsPath) -> DfsResult<bool>;
    async fn handle_list(&self, path: DfsPath) -> DfsResult<Vec<String>>;
    async fn handle_create_file(&self, path: DfsPath) -> DfsResult<bool>;
    async fn handle_create_directory(&self, path: DfsPath) -> DfsResult<bool>;
    async fn handle_delete(&self, path: DfsPath) -> DfsResult<bool>;
    async fn handle_get_storage(&self, path: DfsPath) -> DfsResult<StorageRef>;
    async fn handle_lock(&self, path: DfsPath, exclusive: bool) -> DfsResult<()>;
    async fn handle_unlock(&self, path: DfsPath, exclusive: bool) -> DfsResult<()>;
}

/// Registration interface of the naming server, called by storage servers
/// once at startup.
#[async_trait]
pub trait RegistrationHandler: Send + Sync {
    async fn handle_register(
        &self,
        server: StorageRef,
        paths: Vec<DfsPath>,
    ) -> DfsResult<Vec<DfsPath>>;
}

pub struct ServiceServerHandler<T: ServiceHandler> {
    handler: Arc<T>,
}

impl<T: ServiceHandler> ServiceServerHandler<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<T: ServiceHandler + 'static> RpcHandler for ServiceServerHandler<T> {
    async fn handle_rpc_call(&self, req: RpcRequest, _ip_from: IpAddr) -> DfsResult<Value> {
        match req.method.as_str() {
            "is_directory" => {
                let req = ServiceIsDirectoryReq::from_json(req.params)?;
                let result = self.handler.handle_is_directory(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "list" => {
                let req = ServiceListReq::from_json(req.params)?;
                let result = self.handler.handle_list(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "create_file" => {
                let req = ServiceCreateFileReq::from_json(req.params)?;
                let result = self.handler.handle_create_file(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "create_directory" => {
                let req = ServiceCreateDirectoryReq::from_json(req.params)?;
                let result = self.handler.handle_create_directory(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "delete" => {
                let req = ServiceDeleteReq::from_json(req.params)?;
                let result = self.handler.handle_delete(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "get_storage" => {
                let req = ServiceGetStorageReq::from_json(req.params)?;
                let result = self.handler.handle_get_storage(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "lock" => {
                let req = ServiceLockReq::from_json(req.params)?;
                let result = self.handler.handle_lock(req.path, req.exclusive).await?;
                Ok(serde_json::json!(result))
            }
            "unlock" => {
                let req = ServiceUnlockReq::from_json(req.params)?;
                let result = self.handler.handle_unlock(req.path, req.exclusive).await?;
                Ok(serde_json::json!(result))
            }
            other => Err(DfsError::InvalidArgument(format!(
                "unknown service method: {}",
                other
            ))),
        }
    }
}

pub struct RegistrationServerHandler<T: RegistrationHandler> {
    handler: Arc<T>,
}

impl<T: RegistrationHandler> RegistrationServerHandler<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<T: RegistrationHandler + 'static> RpcHandler for RegistrationServerHandler<T> {
    async fn handle_rpc_call(&self, req: RpcRequest, _ip_from: IpAddr) -> DfsResult<Value> {
        match req.method.as_str() {
            "register" => {
                let req = RegisterReq::from_json(req.params)?;
                let read_addr = req
                    .read_addr
                    .ok_or_else(|| DfsError::MissingArgument("read_addr".to_string()))?;
                let command_addr = req
                    .command_addr
                    .ok_or_else(|| DfsError::MissingArgument("command_addr".to_string()))?;
                let paths = req
                    .paths
                    .ok_or_else(|| DfsError::MissingArgument("paths".to_string()))?;
                let server = StorageRef {
                    read_addr,
                    command_addr,
                };
                let result = self.handler.handle_register(server, paths).await?;
                Ok(serde_json::json!(result))
            }
            other => Err(DfsError::InvalidArgument(format!(
                "unknown registration method: {}",
                other
            ))),
        }
    }
}

/// Client for the naming server's service interface.
pub struct ServiceClient {
    rpc: RpcClient,
}

impl ServiceClient {
    pub fn new(addr: &str) -> Self {
        Self {
            rpc: RpcClient::new(addr),
        }
    }

    pub async fn is_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        let req = ServiceIsDirectoryReq { path: path.clone() };
        let value = self
            .rpc
            .call("is_directory", serde_json::to_value(req)?)
            .await?;
        decode("is_directory", value)
    }

    pub async fn list(&self, path: &DfsPath) -> DfsResult<Vec<String>> {
        let req = ServiceListReq { path: path.clone() };
        let value = self.rpc.call("list", serde_json::to_value(req)?).await?;
        decode("list", value)
    }

    pub async fn create_file(&self, path: &DfsPath) -> DfsResult<bool> {
        let req = ServiceCreateFileReq { path: path.clone() };
        let value = self
            .rpc
            .call("create_file", serde_json::to_value(req)?)
            .await?;
        decode("create_file", value)
    }

    pub async fn create_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        let req = ServiceCreateDirectoryReq { path: path.clone() };
        let value = self
            .rpc
            .call("create_directory", serde_json::to_value(req)?)
            .await?;
        decode("create_directory", value)
    }

    pub async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        let req = ServiceDeleteReq { path: path.clone() };
        let value = self.rpc.call("delete", serde_json::to_value(req)?).await?;
        decode("delete", value)
    }

    pub async fn get_storage(&self, path: &DfsPath) -> DfsResult<StorageRef> {
        let req = ServiceGetStorageReq { path: path.clone() };
        let value = self
            .rpc
            .call("get_storage", serde_json::to_value(req)?)
            .await?;
        decode("get_storage", value)
    }

    pub async fn lock(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        let req = ServiceLockReq {
            path: path.clone(),
            exclusive,
        };
        let value = self.rpc.call("lock", serde_json::to_value(req)?).await?;
        decode("lock", value)
    }

    pub async fn unlock(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        let req = ServiceUnlockReq {
            path: path.clone(),
            exclusive,
        };
        let value = self.rpc.call("unlock", serde_json::to_value(req)?).await?;
        decode("unlock", value)
    }
}

/// Client for the naming server's registration interface.
pub struct RegistrationClient {
    rpc: RpcClient,
}

impl RegistrationClient {
    pub fn new(addr: &str) -> Self {
        Self {
            rpc: RpcClient::new(addr),
        }
    }

    pub async fn register(
        &self,
        server: &StorageRef,
        paths: &[DfsPath],
    ) -> DfsResult<Vec<DfsPath>> {
        let req = RegisterReq {
            read_addr: Some(server.read_addr.clone()),
            command_addr: Some(server.command_addr.clone()),
            paths: Some(paths.to_vec()),
        };
        let value = self.rpc.call("register", serde_json::to_value(req)?).await?;
        decode("register", value)
    }
}
