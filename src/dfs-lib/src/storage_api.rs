use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

use crate::path::DfsPath;
use crate::rpc::{RpcClient, RpcHandler, RpcRequest};
use crate::{DfsError, DfsResult};

/// Handle to one storage server: the advertised addresses of its client
/// (read) and command interfaces. This is the replica reference the naming
/// server hands out and stores per file node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageRef {
    pub read_addr: String,
    pub command_addr: String,
}

/// ------------------------------
/// Storage (client interface) protocol
/// ------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSizeReq {
    pub path: DfsPath,
}

impl StorageSizeReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse StorageSizeReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReadReq {
    pub path: DfsPath,
    pub offset: i64,
    pub length: i64,
}

impl StorageReadReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse StorageReadReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageWriteReq {
    pub path: DfsPath,
    pub offset: i64,
    pub data: Option<Vec<u8>>,
}

impl StorageWriteReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse StorageWriteReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCreateReq {
    pub path: DfsPath,
}

impl CommandCreateReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse CommandCreateReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDeleteReq {
    pub path: DfsPath,
}

impl CommandDeleteReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse CommandDeleteReq: {}", e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCopyReq {
    pub path: DfsPath,
    pub source: Option<StorageRef>,
}

impl CommandCopyReq {
    pub fn from_json(value: Value) -> DfsResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            DfsError::InvalidArgument(format!("failed to parse CommandCopyReq: {}", e))
        })
    }
}

/// Client-facing byte operations of a storage server.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    async fn handle_size(&self, path: DfsPath) -> DfsResult<u64>;
    async fn handle_read(&self, path: DfsPath, offset: i64, length: i64) -> DfsResult<Vec<u8>>;
    async fn handle_write(&self, path: DfsPath, offset: i64, data: Vec<u8>) -> DfsResult<()>;
}

/// Naming-facing file commands of a storage server. Handlers must never
/// call back into the naming server; the caller holds path locks while
/// these run.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_create(&self, path: DfsPath) -> DfsResult<bool>;
    async fn handle_delete(&self, path: DfsPath) -> DfsResult<bool>;
    async fn handle_copy(&self, path: DfsPath, source: StorageRef) -> DfsResult<bool>;
}

pub struct StorageServerHandler<T: StorageHandler> {
    handler: Arc<T>,
}

impl<T: StorageHandler> StorageServerHandler<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<T: StorageHandler + 'static> RpcHandler for StorageServerHandler<T> {
    async fn handle_rpc_call(&self, req: RpcRequest, _ip_from: IpAddr) -> DfsResult<Value> {
        match req.method.as_str() {
            "size" => {
                let req = StorageSizeReq::from_json(req.params)?;
                let result = self.handler.handle_size(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "read" => {
                let req = StorageReadReq::from_json(req.params)?;
                let result = self
                    .handler
                    .handle_read(req.path, req.offset, req.length)
                    .await?;
                Ok(serde_json::json!(result))
            }
            "write" => {
                let req = StorageWriteReq::from_json(req.params)?;
                let data = req
                    .data
                    .ok_or_else(|| DfsError::MissingArgument("write data".to_string()))?;
                let result = self.handler.handle_write(req.path, req.offset, data).await?;
                Ok(serde_json::json!(result))
            }
            other => Err(DfsError::InvalidArgument(format!(
                "unknown storage method: {}",
                other
            ))),
        }
    }
}

pub struct CommandServerHandler<T: CommandHandler> {
    handler: Arc<T>,
}

impl<T: CommandHandler> CommandServerHandler<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<T: CommandHandler + 'static> RpcHandler for CommandServerHandler<T> {
    async fn handle_rpc_call(&self, req: RpcRequest, _ip_from: IpAddr) -> DfsResult<Value> {
        match req.method.as_str() {
            "create" => {
                let req = CommandCreateReq::from_json(req.params)?;
                let result = self.handler.handle_create(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "delete" => {
                let req = CommandDeleteReq::from_json(req.params)?;
                let result = self.handler.handle_delete(req.path).await?;
                Ok(serde_json::json!(result))
            }
            "copy" => {
                let req = CommandCopyReq::from_json(req.params)?;
                let source = req
                    .source
                    .ok_or_else(|| DfsError::MissingArgument("copy source".to_string()))?;
                let result = self.handler.handle_copy(req.path, source).await?;
                Ok(serde_json::json!(result))
            }
            other => Err(DfsError::InvalidArgument(format!(
                "unknown command method: {}",
                other
            ))),
        }
    }
}

/// Client for the byte interface of one storage server.
pub struct StorageClient {
    rpc: RpcClient,
}

impl StorageClient {
    pub fn new(addr: &str) -> Self {
        Self {
            rpc: RpcClient::new(addr),
        }
    }

    pub fn addr(&self) -> &str {
        self.rpc.addr()
    }

    pub async fn size(&self, path: &DfsPath) -> DfsResult<u64> {
        let req = StorageSizeReq { path: path.clone() };
        let value = self.rpc.call("size", serde_json::to_value(req)?).await?;
        decode("size", value)
    }

    pub async fn read(&self, path: &DfsPath, offset: i64, length: i64) -> DfsResult<Vec<u8>> {
        let req = StorageReadReq {
            path: path.clone(),
            offset,
            length,
        };
        let value = self.rpc.call("read", serde_json::to_value(req)?).await?;
        decode("read", value)
    }

    pub async fn write(&self, path: &DfsPath, offset: i64, data: &[u8]) -> DfsResult<()> {
        let req = StorageWriteReq {
            path: path.clone(),
            offset,
            data: Some(data.to_vec()),
        };
        let value = self.rpc.call("write", serde_json::to_value(req)?).await?;
        decode("write", value)
    }
}

/// Client for the command interface of one storage server.
pub struct CommandClient {
    rpc: RpcClient,
}

impl CommandClient {
    pub fn new(addr: &str) -> Self {
        Self {
            rpc: RpcClient::new(addr),
        }
    }

    pub fn addr(&self) -> &str {
        self.rpc.addr()
    }

    pub async fn create(&self, path: &DfsPath) -> DfsResult<bool> {
        let req = CommandCreateReq { path: path.clone() };
        let value = self.rpc.call("create", serde_json::to_value(req)?).await?;
        decode("create", value)
    }

    pub async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        let req = CommandDeleteReq { path: path.clone() };
        let value = self.rpc.call("delete", serde_json::to_value(req)?).await?;
        decode("delete", value)
    }

    pub async fn copy(&self, path: &DfsPath, source: &StorageRef) -> DfsResult<bool> {
        let req = CommandCopyReq {
            path: path.clone(),
            source: Some(source.clone()),
        };
        let value = self.rpc.call("copy", serde_json::to_value(req)?).await?;
        decode("copy", value)
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> DfsResult<T> {
    serde_json::from_value(value)
        .map_err(|e| DfsError::Transport(format!("decode {} response failed: {}", method, e)))
}
