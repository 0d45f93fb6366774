//! Typed HTTP clients for talking to worker nodes and to the orchestrator.
//!
//! Every RPC has its own timeout (see [`RpcTimeouts`]). The error contract
//! differs per call:
//! - health/registration collapse to a boolean and never fail,
//! - reasoning/memory return an [`RpcResult`] carrying `status`/`error`,
//! - tool execution returns `Err` so the scheduler can fold it into the step.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::RpcTimeouts;
use crate::error::ClientError;
use crate::protocol::{
    CapabilitiesDocument, Heartbeat, MemoryRequest, MemoryResponse, NodeList, NodeRegistration,
    PROTOCOL_HEADER, PROTOCOL_VERSION, ReasoningRequest, ReasoningResponse, TaskResult,
    TaskStatus, TaskSubmission, TaskSubmissionResponse, ToolExecutionRequest,
    ToolExecutionResponse, normalize_address, validate_address,
};
use crate::types::{NodeId, TaskId};

/// Outcome of a reasoning or memory RPC. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResult {
    pub fn completed(result: Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// The calls the scheduler makes against a worker node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn health_check(&self) -> bool;

    async fn reason(&self, req: &ReasoningRequest) -> RpcResult;

    async fn execute_tool(&self, req: &ToolExecutionRequest) -> Result<Value, ClientError>;

    async fn memory_operation(&self, req: &MemoryRequest) -> RpcResult;
}

/// Builds the client handle the registry keeps for each registered node.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, registration: &NodeRegistration) -> Arc<dyn NodeRpc>;
}

/// Connector producing [`NodeClient`]s that share one connection pool.
#[derive(Clone)]
pub struct HttpConnector {
    http: Client,
    timeouts: RpcTimeouts,
}

impl HttpConnector {
    pub fn new(timeouts: RpcTimeouts) -> Self {
        Self {
            http: Client::new(),
            timeouts,
        }
    }
}

impl NodeConnector for HttpConnector {
    fn connect(&self, registration: &NodeRegistration) -> Arc<dyn NodeRpc> {
        Arc::new(NodeClient::with_client(
            self.http.clone(),
            registration.normalized_address(),
            self.timeouts,
        ))
    }
}

/// Shared request plumbing for one base URL.
#[derive(Clone)]
struct Endpoint {
    base_url: String,
    http: Client,
}

impl Endpoint {
    fn new(http: Client, address: &str) -> Self {
        Self {
            base_url: format!("http://{}", normalize_address(address)),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<R: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<R, ClientError> {
        let response = self
            .http
            .get(self.url(path))
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
            .timeout(timeout)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, ClientError> {
        let response = self
            .http
            .post(self.url(path))
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn delete(&self, path: &str, timeout: Duration) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(path))
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
            .timeout(timeout)
            .send()
            .await?;
        decode_response::<Value>(response).await.map(|_| ())
    }
}

async fn decode_response<R: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<R, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<R>().await?);
    }

    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| {
            body.get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Unknown error".to_string());

    Err(ClientError::Remote {
        status: status.as_u16(),
        message,
    })
}

/// Client for one worker node's HTTP endpoints.
#[derive(Clone)]
pub struct NodeClient {
    address: String,
    endpoint: Endpoint,
    timeouts: RpcTimeouts,
}

impl NodeClient {
    pub fn new(address: &str) -> Self {
        Self::with_client(Client::new(), address, RpcTimeouts::default())
    }

    /// Like [`NodeClient::new`] but rejects malformed addresses up front.
    pub fn connect(address: &str, timeouts: RpcTimeouts) -> Result<Self, ClientError> {
        validate_address(address).map_err(ClientError::InvalidAddress)?;
        Ok(Self::with_client(Client::new(), address, timeouts))
    }

    pub fn with_client(http: Client, address: &str, timeouts: RpcTimeouts) -> Self {
        Self {
            address: normalize_address(address).to_string(),
            endpoint: Endpoint::new(http, address),
            timeouts,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `GET /health`. Any failure, including a timeout, reads as "down".
    pub async fn health_check(&self) -> bool {
        let response = self
            .endpoint
            .http
            .get(self.endpoint.url("/health"))
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
            .timeout(self.timeouts.health())
            .send()
            .await;

        match response {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("Health check for {} failed: {}", self.address, e);
                false
            }
        }
    }

    /// `POST /register` on the remote. Returns whether it accepted.
    pub async fn register(&self, registration: &NodeRegistration) -> bool {
        match self
            .endpoint
            .post_json::<_, Value>("/register", registration, self.timeouts.registration())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!("Registration with {} failed: {}", self.address, e);
                false
            }
        }
    }

    pub async fn capabilities(&self) -> Result<CapabilitiesDocument, ClientError> {
        self.endpoint
            .get_json("/capabilities", self.timeouts.health())
            .await
    }

    /// `POST /reason`. Errors are synthesized into a failed [`RpcResult`].
    pub async fn reason(&self, req: &ReasoningRequest) -> RpcResult {
        match self
            .endpoint
            .post_json::<_, ReasoningResponse>("/reason", req, self.timeouts.reasoning())
            .await
        {
            Ok(resp) => {
                debug!("Reasoning on {} answered with model {}", self.address, resp.model);
                RpcResult::completed(Value::String(resp.response))
            }
            Err(e) => {
                error!("Reasoning request to {} failed: {}", self.address, e);
                RpcResult::failed(e.to_string())
            }
        }
    }

    /// `POST /execute`. Failures are returned to the caller.
    pub async fn execute_tool(&self, req: &ToolExecutionRequest) -> Result<Value, ClientError> {
        let resp: ToolExecutionResponse = self
            .endpoint
            .post_json("/execute", req, self.timeouts.tool())
            .await
            .inspect_err(|e| error!("Tool execution on {} failed: {}", self.address, e))?;
        Ok(resp.result)
    }

    /// `POST /memory`. Errors are synthesized into a failed [`RpcResult`].
    pub async fn memory_operation(&self, req: &MemoryRequest) -> RpcResult {
        match self
            .endpoint
            .post_json::<_, MemoryResponse>("/memory", req, self.timeouts.memory())
            .await
        {
            Ok(resp) => RpcResult::completed(resp.result),
            Err(e) => {
                error!(
                    "Memory operation '{}' on {} failed: {}",
                    req.operation.as_str(),
                    self.address,
                    e
                );
                RpcResult::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl NodeRpc for NodeClient {
    async fn health_check(&self) -> bool {
        NodeClient::health_check(self).await
    }

    async fn reason(&self, req: &ReasoningRequest) -> RpcResult {
        NodeClient::reason(self, req).await
    }

    async fn execute_tool(&self, req: &ToolExecutionRequest) -> Result<Value, ClientError> {
        NodeClient::execute_tool(self, req).await
    }

    async fn memory_operation(&self, req: &MemoryRequest) -> RpcResult {
        NodeClient::memory_operation(self, req).await
    }
}

/// Client for the orchestrator's own API, used by nodes and the CLI.
#[derive(Clone)]
pub struct OrchestratorClient {
    node: NodeClient,
}

impl OrchestratorClient {
    pub fn new(address: &str, timeouts: RpcTimeouts) -> Self {
        Self {
            node: NodeClient::with_client(Client::new(), address, timeouts),
        }
    }

    pub fn address(&self) -> &str {
        self.node.address()
    }

    pub async fn health_check(&self) -> bool {
        self.node.health_check().await
    }

    pub async fn register(&self, registration: &NodeRegistration) -> bool {
        self.node.register(registration).await
    }

    pub async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), ClientError> {
        self.node
            .endpoint
            .post_json::<_, Value>("/heartbeat", heartbeat, self.node.timeouts.registration())
            .await
            .map(|_| ())
    }

    pub async fn deregister(&self, node_id: &NodeId) -> Result<(), ClientError> {
        self.node
            .endpoint
            .delete(
                &format!("/nodes/{}", node_id),
                self.node.timeouts.registration(),
            )
            .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRegistration>, ClientError> {
        let list: NodeList = self
            .node
            .endpoint
            .get_json("/nodes", self.node.timeouts.registration())
            .await?;
        Ok(list.nodes)
    }

    /// Submit a task and wait for the orchestrator to finish it.
    pub async fn submit_task(
        &self,
        submission: &TaskSubmission,
    ) -> Result<TaskSubmissionResponse, ClientError> {
        self.node
            .endpoint
            .post_json("/task", submission, self.node.timeouts.reasoning())
            .await
    }

    pub async fn task_status(&self, task_id: &TaskId) -> Result<TaskResult, ClientError> {
        self.node
            .endpoint
            .get_json(
                &format!("/task/{}", task_id),
                self.node.timeouts.registration(),
            )
            .await
    }
}
