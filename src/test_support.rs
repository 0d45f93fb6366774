//! Helpers shared by the in-crate tests.

use async_trait::async_trait;
use axum::Router;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use crate::client::{NodeConnector, NodeRpc, RpcResult};
use crate::error::ClientError;
use crate::protocol::{
    HardwareCapabilities, MemoryOperation, MemoryRequest, NodeRegistration, NodeType,
    ReasoningRequest, ToolExecutionRequest,
};
use crate::types::NodeId;

/// Serve `router` on an ephemeral localhost port for the rest of the test.
pub(crate) async fn spawn_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// An address nothing is listening on.
pub(crate) async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

pub(crate) fn registration(id: &str, node_type: NodeType, load: f64) -> NodeRegistration {
    NodeRegistration {
        node_id: NodeId::new(id),
        node_type,
        address: "127.0.0.1:9".to_string(),
        capabilities: HardwareCapabilities {
            cpu_cores: 4,
            ram_gb: 8.0,
            current_load: load,
            ..Default::default()
        },
        specializations: Default::default(),
        metadata: Default::default(),
    }
}

/// Connector backed by a closure.
pub(crate) struct FnConnector<F>(pub F);

impl<F> NodeConnector for FnConnector<F>
where
    F: Fn(&NodeRegistration) -> Arc<dyn NodeRpc> + Send + Sync,
{
    fn connect(&self, registration: &NodeRegistration) -> Arc<dyn NodeRpc> {
        (self.0)(registration)
    }
}

/// In-memory node that records what it was asked to do.
pub(crate) struct FakeNode {
    pub healthy: AtomicBool,
    pub fail_reasoning: AtomicBool,
    pub fail_tools: AtomicBool,
    pub memories: Mutex<Vec<Value>>,
    pub calls: Mutex<Vec<(&'static str, Value)>>,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            fail_reasoning: AtomicBool::new(false),
            fail_tools: AtomicBool::new(false),
            memories: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeNode {
    pub fn calls(&self) -> Vec<(&'static str, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }

    fn record(&self, name: &'static str, body: Value) {
        self.calls.lock().unwrap().push((name, body));
    }
}

#[async_trait]
impl NodeRpc for FakeNode {
    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn reason(&self, req: &ReasoningRequest) -> RpcResult {
        self.record("reason", serde_json::to_value(req).unwrap());
        if self.fail_reasoning.load(Ordering::SeqCst) {
            return RpcResult::failed("model unavailable");
        }
        RpcResult::completed(json!(format!("answer: {}", req.prompt)))
    }

    async fn execute_tool(&self, req: &ToolExecutionRequest) -> Result<Value, ClientError> {
        self.record("execute", serde_json::to_value(req).unwrap());
        if self.fail_tools.load(Ordering::SeqCst) {
            return Err(ClientError::Remote {
                status: 500,
                message: "tool crashed".into(),
            });
        }
        Ok(json!({"tool": req.tool_name, "ok": true}))
    }

    async fn memory_operation(&self, req: &MemoryRequest) -> RpcResult {
        let name = match req.operation {
            MemoryOperation::Store | MemoryOperation::Update => "memory_write",
            MemoryOperation::Retrieve | MemoryOperation::Query => "memory_read",
        };
        self.record(name, serde_json::to_value(req).unwrap());

        match req.operation {
            MemoryOperation::Store | MemoryOperation::Update => {
                let value = req.value.clone().unwrap_or(Value::Null);
                self.memories.lock().unwrap().push(value);
                RpcResult::completed(json!({"status": "stored", "key": "k"}))
            }
            MemoryOperation::Retrieve | MemoryOperation::Query => {
                let stored = self.memories.lock().unwrap().clone();
                RpcResult::completed(Value::Array(stored))
            }
        }
    }
}
