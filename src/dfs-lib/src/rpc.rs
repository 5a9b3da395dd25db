use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::{DfsError, DfsResult};

/// One request frame: a single line of JSON on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub seq: u64,
    #[serde(default)]
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RpcResult {
    Ok { value: Value },
    Err { kind: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub seq: u64,
    #[serde(default)]
    pub trace_id: String,
    pub result: RpcResult,
}

impl RpcResponse {
    pub fn ok(seq: u64, trace_id: String, value: Value) -> Self {
        Self {
            seq,
            trace_id,
            result: RpcResult::Ok { value },
        }
    }

    pub fn err(seq: u64, trace_id: String, err: &DfsError) -> Self {
        Self {
            seq,
            trace_id,
            result: RpcResult::Err {
                kind: err.kind().to_string(),
                message: err.message().to_string(),
            },
        }
    }

    pub fn into_result(self) -> DfsResult<Value> {
        match self.result {
            RpcResult::Ok { value } => Ok(value),
            RpcResult::Err { kind, message } => Err(DfsError::from_kind(&kind, message)),
        }
    }
}

/// Server-side dispatch for one interface. Implementations match on the
/// method name, decode the typed request, and return the result value.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_rpc_call(&self, req: RpcRequest, ip_from: IpAddr) -> DfsResult<Value>;
}

/// Accept loop serving one `RpcHandler` on a TCP listener. Each connection
/// is served on its own task; requests on a connection are answered in
/// arrival order.
pub struct RpcServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    pub async fn bind(addr: &str, handler: Arc<dyn RpcHandler>) -> DfsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DfsError::Transport(format!("bind {} failed: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DfsError::Transport(format!("local_addr failed: {}", e)))?;
        debug!("rpc server listening on {}", local_addr);
        let accept_task = tokio::spawn(Self::accept_loop(listener, handler));
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Already-accepted connections finish
    /// on their own tasks.
    pub fn stop(&self) {
        self.accept_task.abort();
    }

    async fn accept_loop(listener: TcpListener, handler: Arc<dyn RpcHandler>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        Self::serve_connection(stream, peer, handler).await;
                    });
                }
                Err(e) => {
                    warn!("rpc accept failed: {}", e);
                }
            }
        }
    }

    async fn serve_connection(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn RpcHandler>) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!("rpc connection from {} dropped: {}", peer, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RpcRequest>(&line) {
                Ok(req) => {
                    let seq = req.seq;
                    let trace_id = req.trace_id.clone();
                    match handler.handle_rpc_call(req, peer.ip()).await {
                        Ok(value) => RpcResponse::ok(seq, trace_id, value),
                        Err(e) => RpcResponse::err(seq, trace_id, &e),
                    }
                }
                Err(e) => RpcResponse::err(
                    0,
                    String::new(),
                    &DfsError::InvalidArgument(format!("malformed request: {}", e)),
                ),
            };
            let mut frame = match serde_json::to_string(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("rpc response encode failed: {}", e);
                    break;
                }
            };
            frame.push('\n');
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

type ClientConn = (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf);

/// Client for one remote interface. Connects lazily and keeps the
/// connection for subsequent calls; a transport failure drops it so the
/// next call reconnects. Calls are serialized per client.
pub struct RpcClient {
    addr: String,
    seq: AtomicU64,
    conn: tokio::sync::Mutex<Option<ClientConn>>,
}

impl RpcClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            seq: AtomicU64::new(0),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn call(&self, method: &str, params: Value) -> DfsResult<Value> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let req = RpcRequest {
            method: method.to_string(),
            params,
            seq,
            trace_id: format!("{}-{}", method, seq),
        };
        let mut frame = serde_json::to_string(&req)
            .map_err(|e| DfsError::Internal(format!("request encode failed: {}", e)))?;
        frame.push('\n');

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                DfsError::Transport(format!("connect {} failed: {}", self.addr, e))
            })?;
            let (read_half, write_half) = stream.into_split();
            *guard = Some((BufReader::new(read_half).lines(), write_half));
        }
        let (lines, write_half) = guard.as_mut().unwrap();

        if let Err(e) = write_half.write_all(frame.as_bytes()).await {
            *guard = None;
            return Err(DfsError::Transport(format!(
                "send to {} failed: {}",
                self.addr, e
            )));
        }
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                *guard = None;
                return Err(DfsError::Transport(format!(
                    "connection to {} closed",
                    self.addr
                )));
            }
            Err(e) => {
                *guard = None;
                return Err(DfsError::Transport(format!(
                    "receive from {} failed: {}",
                    self.addr, e
                )));
            }
        };
        let response: RpcResponse = serde_json::from_str(&line)
            .map_err(|e| DfsError::Transport(format!("malformed response: {}", e)))?;
        if response.seq != seq {
            *guard = None;
            return Err(DfsError::Transport(format!(
                "response seq mismatch: sent {} got {}",
                seq, response.seq
            )));
        }
        response.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle_rpc_call(&self, req: RpcRequest, _ip_from: IpAddr) -> DfsResult<Value> {
            match req.method.as_str() {
                "echo" => Ok(req.params),
                "fail" => Err(DfsError::NotFound("no such thing".to_string())),
                other => Err(DfsError::InvalidArgument(format!(
                    "unknown method: {}",
                    other
                ))),
            }
        }
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap();
        let client = RpcClient::new(&server.local_addr().to_string());

        let value = client.call("echo", json!({"x": 7})).await.unwrap();
        assert_eq!(value, json!({"x": 7}));

        // Same connection carries further calls.
        let value = client.call("echo", json!([1, 2, 3])).await.unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn error_kind_crosses_the_wire() {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap();
        let client = RpcClient::new(&server.local_addr().to_string());

        let err = client.call("fail", Value::Null).await.unwrap_err();
        assert_eq!(err, DfsError::NotFound("no such thing".to_string()));
        let err = client.call("bogus", Value::Null).await.unwrap_err();
        assert!(matches!(err, DfsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn connect_to_dead_server_is_transport_error() {
        let client = RpcClient::new("127.0.0.1:1");
        let err = client.call("echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, DfsError::Transport(_)));
    }
}
