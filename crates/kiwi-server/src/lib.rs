// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-server
#![deny(unsafe_code)]

pub mod rpc;

pub use rpc::{RpcError, RpcRequest, RpcResponse};

use kiwi_ops::{ExecuteRequest, HelpRequest, LoadRequest, Operations, SearchRequest, SignRequest};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// MCP protocol revision this shell speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Grace period for in-flight operations after the transport closes.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The server shell: routes JSON-RPC methods onto the meta-operations.
pub struct Server {
    ops: Arc<Operations>,
}

impl Server {
    /// Wrap an operations layer.
    pub fn new(ops: Arc<Operations>) -> Self {
        Self { ops }
    }

    /// The five advertised MCP tools with their JSON schemas.
    pub fn tool_descriptors() -> Value {
        fn schema_of<T: schemars::JsonSchema>() -> Value {
            serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({}))
        }
        json!([
            {
                "name": "search",
                "description": "Find directives, tools, and knowledge by keyword or hybrid relevance.",
                "inputSchema": schema_of::<SearchRequest>(),
            },
            {
                "name": "load",
                "description": "Fetch an item's manifest, content, and verified signature; optionally copy it into a layer.",
                "inputSchema": schema_of::<LoadRequest>(),
            },
            {
                "name": "execute",
                "description": "Run a tool through its executor chain, return a directive's process spec, read knowledge, or manage items.",
                "inputSchema": schema_of::<ExecuteRequest>(),
            },
            {
                "name": "sign",
                "description": "Canonicalize an item and re-emit its first-line signature marker.",
                "inputSchema": schema_of::<SignRequest>(),
            },
            {
                "name": "help",
                "description": "Topic documentation plus control signals: stuck, escalate, checkpoint.",
                "inputSchema": schema_of::<HelpRequest>(),
            },
        ])
    }

    /// Handle one decoded request; `None` for notifications.
    pub async fn handle(&self, req: RpcRequest) -> Option<RpcResponse> {
        if req.is_notification() {
            debug!(target: "kiwi.server", method = %req.method, "notification");
            return None;
        }
        let id = req.id.clone().unwrap_or(Value::Null);

        let response = match req.method.as_str() {
            "initialize" => RpcResponse::ok(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": "kiwi-mcp",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => RpcResponse::ok(id, json!({})),
            "tools/list" => RpcResponse::ok(id, json!({"tools": Self::tool_descriptors()})),
            "tools/call" => self.tool_call(id, req.params).await,
            other => RpcResponse::fail(
                id,
                rpc::METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
                None,
            ),
        };
        Some(response)
    }

    /// Route a `tools/call` onto a meta-operation.
    ///
    /// Kernel failures are in-band tool results (`isError: true`), never
    /// JSON-RPC errors — the client must always be able to read the code.
    async fn tool_call(&self, id: Value, params: Option<Value>) -> RpcResponse {
        let Some(params) = params else {
            return RpcResponse::fail(id, rpc::INVALID_PARAMS, "missing params", None);
        };
        let Some(name) = params.get("name").and_then(Value::as_str).map(String::from) else {
            return RpcResponse::fail(id, rpc::INVALID_PARAMS, "missing tool name", None);
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let outcome = match name.as_str() {
            "search" => match serde_json::from_value::<SearchRequest>(arguments) {
                Ok(req) => self.ops.search(req).await,
                Err(e) => return invalid_args(id, &name, &e),
            },
            "load" => match serde_json::from_value::<LoadRequest>(arguments) {
                Ok(req) => self.ops.load(req).await,
                Err(e) => return invalid_args(id, &name, &e),
            },
            "execute" => match serde_json::from_value::<ExecuteRequest>(arguments) {
                Ok(req) => self.ops.execute(req).await,
                Err(e) => return invalid_args(id, &name, &e),
            },
            "sign" => match serde_json::from_value::<SignRequest>(arguments) {
                Ok(req) => self.ops.sign(req).await,
                Err(e) => return invalid_args(id, &name, &e),
            },
            "help" => match serde_json::from_value::<HelpRequest>(arguments) {
                Ok(req) => self.ops.help(req).await,
                Err(e) => return invalid_args(id, &name, &e),
            },
            other => {
                return RpcResponse::fail(
                    id,
                    rpc::INVALID_PARAMS,
                    format!("unknown tool '{other}'"),
                    None,
                );
            }
        };

        let result = match outcome {
            Ok(value) => json!({
                "content": [{"type": "text", "text": value.to_string()}],
                "structuredContent": value,
                "isError": false,
            }),
            Err(kernel_error) => {
                let wire = kernel_error.to_json();
                json!({
                    "content": [{"type": "text", "text": wire.to_string()}],
                    "structuredContent": wire,
                    "isError": true,
                })
            }
        };
        RpcResponse::ok(id, result)
    }

    /// Serve newline-delimited JSON-RPC until `reader` closes.
    ///
    /// Each request runs as its own task; one writer task serializes output
    /// lines. Returns the process exit code.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> i32
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(64);

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    return 2;
                }
                if writer.flush().await.is_err() {
                    return 2;
                }
            }
            0
        });

        let mut lines = BufReader::new(reader).lines();
        let mut inflight = Vec::new();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let server = self.clone();
                    let tx = tx.clone();
                    inflight.push(tokio::spawn(async move {
                        let response = match serde_json::from_str::<RpcRequest>(&line) {
                            Ok(req) => server.handle(req).await,
                            Err(e) => Some(RpcResponse::fail(
                                Value::Null,
                                rpc::PARSE_ERROR,
                                format!("invalid JSON-RPC: {e}"),
                                None,
                            )),
                        };
                        if let Some(response) = response {
                            let _ = tx.send(response.encode()).await;
                        }
                    }));
                    inflight.retain(|t| !t.is_finished());
                }
                Ok(None) => break,
                Err(e) => {
                    error!(target: "kiwi.server", error = %e, "stdio read failed");
                    drop(tx);
                    let _ = writer_task.await;
                    return 2;
                }
            }
        }

        // Transport closed: let in-flight operations finish within the
        // grace period, then abort them (subprocesses die via kill_on_drop).
        info!(target: "kiwi.server", inflight = inflight.len(), "stdin closed, draining");
        let aborts: Vec<_> = inflight.iter().map(|t| t.abort_handle()).collect();
        let drain = async {
            for task in inflight {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(target: "kiwi.server", "grace period expired; aborting in-flight operations");
            for handle in aborts {
                handle.abort();
            }
        }

        drop(tx);
        writer_task.await.unwrap_or(0)
    }
}

fn invalid_args(id: Value, tool: &str, e: &serde_json::Error) -> RpcResponse {
    RpcResponse::fail(
        id,
        rpc::INVALID_PARAMS,
        format!("invalid arguments for '{tool}': {e}"),
        None,
    )
}
