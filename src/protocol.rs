//! Wire contracts shared by the orchestrator and every worker node.
//!
//! All payloads are JSON documents. Enum values travel as stable snake_case
//! strings, never as positions, so older and newer nodes can keep talking
//! as long as `PROTOCOL_VERSION` matches.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::ProtocolError;
use crate::types::{NodeId, StepId, TaskId};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Header carrying the protocol version on every outbound request.
pub const PROTOCOL_HEADER: &str = "x-taskmesh-protocol";

/// Free-form JSON object used for payloads and metadata.
pub type JsonObject = Map<String, Value>;

/// Explicit encode/decode pair for wire messages.
pub trait WireMessage: Serialize + DeserializeOwned {
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Check a peer's advertised protocol version header value.
pub fn check_version(header: Option<&str>) -> Result<(), ProtocolError> {
    match header {
        None => Ok(()),
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(PROTOCOL_VERSION) => Ok(()),
            _ => Err(ProtocolError::UnsupportedVersion(raw.to_string())),
        },
    }
}

/// Role a process plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Orchestrator,
    #[serde(alias = "llm_node")]
    Reasoning,
    #[serde(alias = "tool_node")]
    Tool,
    #[serde(alias = "memory_node")]
    Memory,
    #[serde(alias = "ui_node")]
    Ui,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Orchestrator => "orchestrator",
            NodeType::Reasoning => "reasoning",
            NodeType::Tool => "tool",
            NodeType::Memory => "memory",
            NodeType::Ui => "ui",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a task or a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// True once the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Kind of work a plan step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Reasoning,
    ToolExecution,
    MemoryRead,
    MemoryWrite,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Reasoning => "reasoning",
            StepKind::ToolExecution => "tool_execution",
            StepKind::MemoryRead => "memory_read",
            StepKind::MemoryWrite => "memory_write",
        }
    }

    /// Node type that serves this kind of step.
    pub fn node_type(&self) -> NodeType {
        match self {
            StepKind::Reasoning => NodeType::Reasoning,
            StepKind::ToolExecution => NodeType::Tool,
            StepKind::MemoryRead | StepKind::MemoryWrite => NodeType::Memory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorType {
    #[default]
    Cpu,
    Cuda,
    Mps,
    Other,
}

fn default_true() -> bool {
    true
}

/// Hardware a node advertises. Refreshed on registration and heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    #[serde(default)]
    pub vram_gb: Option<f64>,
    #[serde(default)]
    pub accelerator_type: AcceleratorType,
    /// 0.0 (idle) to 1.0 (saturated).
    #[serde(default)]
    pub current_load: f64,
    #[serde(default = "default_true")]
    pub available: bool,
}

impl HardwareCapabilities {
    pub fn validate(&self) -> Result<(), String> {
        if !self.current_load.is_finite() || !(0.0..=1.0).contains(&self.current_load) {
            return Err(format!(
                "current_load must be within [0, 1], got {}",
                self.current_load
            ));
        }
        if !self.ram_gb.is_finite() || self.ram_gb < 0.0 {
            return Err(format!("ram_gb must be non-negative, got {}", self.ram_gb));
        }
        if let Some(vram) = self.vram_gb {
            if !vram.is_finite() || vram < 0.0 {
                return Err(format!("vram_gb must be non-negative, got {}", vram));
            }
        }
        Ok(())
    }
}

impl Default for HardwareCapabilities {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            ram_gb: 0.0,
            vram_gb: None,
            accelerator_type: AcceleratorType::Cpu,
            current_load: 0.0,
            available: true,
        }
    }
}

/// A worker node's announcement to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub node_type: NodeType,
    /// `host:port` of the node's HTTP server.
    pub address: String,
    pub capabilities: HardwareCapabilities,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub metadata: JsonObject,
}

impl NodeRegistration {
    /// Address with any `http://` prefix and trailing slash removed.
    pub fn normalized_address(&self) -> &str {
        normalize_address(&self.address)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_blank() {
            return Err("node_id must not be empty".to_string());
        }
        validate_address(&self.address)?;
        self.capabilities.validate()
    }
}

pub(crate) fn normalize_address(address: &str) -> &str {
    let trimmed = address.trim();
    let trimmed = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    trimmed.trim_end_matches('/')
}

/// Accepts `host:port`, optionally prefixed with `http://`.
pub fn validate_address(address: &str) -> Result<(), String> {
    let normalized = normalize_address(address);
    if normalized.is_empty() {
        return Err("address must not be empty".to_string());
    }

    let parsed = url::Url::parse(&format!("http://{}", normalized))
        .map_err(|e| format!("invalid address `{}`: {}", address, e))?;

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(format!("address `{}` has no host", address));
    }
    // `Url::port` hides default ports such as 80, so read the port from the raw text.
    let has_port = normalized
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if !has_port {
        return Err(format!("address `{}` must include a port", address));
    }
    if parsed.path() != "/" || parsed.query().is_some() {
        return Err(format!("address `{}` must be host:port only", address));
    }
    Ok(())
}

/// One remembered interaction, used as reasoning context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
}

/// Generic task envelope exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub task_type: StepKind,
    #[serde(default)]
    pub payload: JsonObject,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub priority: i32,
}

/// Record of a task's progress. Stored by the orchestrator and served on
/// `GET /task/{task_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: JsonObject,
}

/// Same shape as [`TaskResult`]; the name used for node-to-node replies.
pub type TaskResponse = TaskResult;

impl TaskResult {
    pub fn in_progress(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::InProgress,
            result: None,
            error: None,
            metadata: JsonObject::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct SubmissionPayload {
    #[serde(default)]
    user_input: String,
    #[serde(default)]
    context: Vec<ContextEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RawSubmission {
    #[serde(default)]
    task_id: Option<TaskId>,
    #[serde(default)]
    user_input: Option<String>,
    #[serde(default)]
    context: Option<Vec<ContextEntry>>,
    #[serde(default)]
    payload: Option<SubmissionPayload>,
}

/// Body of `POST /task`.
///
/// Also accepts the wrapped form `{"task_id": .., "payload": {"user_input": .., "context": [..]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSubmission")]
pub struct TaskSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub user_input: String,
    #[serde(default)]
    pub context: Vec<ContextEntry>,
}

impl From<RawSubmission> for TaskSubmission {
    fn from(raw: RawSubmission) -> Self {
        match raw.payload {
            Some(payload) => Self {
                task_id: raw.task_id,
                user_input: payload.user_input,
                context: payload.context,
            },
            None => Self {
                task_id: raw.task_id,
                user_input: raw.user_input.unwrap_or_default(),
                context: raw.context.unwrap_or_default(),
            },
        }
    }
}

/// Reply to `POST /task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmissionResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f64 {
    0.7
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<ContextEntry>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub model_preference: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl ReasoningRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: Vec::new(),
            max_tokens: default_max_tokens(),
            model_preference: None,
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    pub response: String,
    pub model: String,
    #[serde(default)]
    pub specializations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRequest {
    pub tool_name: String,
    pub action: String,
    #[serde(default)]
    pub parameters: JsonObject,
    #[serde(default = "default_true")]
    pub validation_required: bool,
    #[serde(default = "default_true")]
    pub sandboxed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResponse {
    pub result: Value,
    pub tool: String,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Store,
    Retrieve,
    Query,
    Update,
}

impl MemoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryOperation::Store => "store",
            MemoryOperation::Retrieve => "retrieve",
            MemoryOperation::Query => "query",
            MemoryOperation::Update => "update",
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRequest {
    pub operation: MemoryOperation,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl MemoryRequest {
    pub fn retrieve(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            operation: MemoryOperation::Retrieve,
            key: None,
            value: None,
            query: Some(query.into()),
            top_k,
        }
    }

    pub fn store(key: Option<String>, value: Value) -> Self {
        Self {
            operation: MemoryOperation::Store,
            key,
            value: Some(value),
            query: None,
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryResponse {
    pub result: Value,
    pub operation: MemoryOperation,
}

/// Capability refresh sent periodically by a registered node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub capabilities: HardwareCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub status: String,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeList {
    pub nodes: Vec<NodeRegistration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub protocol_version: Option<u32>,
}

impl HealthResponse {
    pub fn healthy(node_type: NodeType) -> Self {
        Self {
            status: "healthy".to_string(),
            node_type,
            protocol_version: Some(PROTOCOL_VERSION),
        }
    }
}

/// Body of `GET /capabilities`. Node-specific fields are flattened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesDocument {
    pub node_type: NodeType,
    pub capabilities: HardwareCapabilities,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl WireMessage for NodeRegistration {}
impl WireMessage for HardwareCapabilities {}
impl WireMessage for TaskRequest {}
impl WireMessage for TaskResult {}
impl WireMessage for TaskSubmission {}
impl WireMessage for TaskSubmissionResponse {}
impl WireMessage for ReasoningRequest {}
impl WireMessage for ReasoningResponse {}
impl WireMessage for ToolExecutionRequest {}
impl WireMessage for ToolExecutionResponse {}
impl WireMessage for MemoryRequest {}
impl WireMessage for MemoryResponse {}
impl WireMessage for Heartbeat {}
impl WireMessage for RegisterAck {}
impl WireMessage for NodeList {}
impl WireMessage for HealthResponse {}
impl WireMessage for CapabilitiesDocument {}
