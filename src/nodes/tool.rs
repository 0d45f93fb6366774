//! Tool node: validated, sandboxed execution of registered tool handlers.

use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use super::toolbox::{AutomationTool, CodeTool};
use super::{NodeProfile, shared_routes, with_layers};
use crate::api::ApiJson;
use crate::error::{ApiError, ToolError};
use crate::protocol::{JsonObject, ToolExecutionRequest, ToolExecutionResponse};

const MAX_FILENAME_LEN: usize = 100;

/// Context passed to tool handlers during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory file-touching tools are confined to.
    pub sandbox_dir: PathBuf,
    pub sandboxed: bool,
}

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// A tool a node can run on request.
pub trait ToolHandler: Send + Sync {
    /// Name used in `ToolExecutionRequest.tool_name`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Actions this tool understands.
    fn actions(&self) -> &[&'static str];

    fn execute<'a>(
        &'a self,
        action: &'a str,
        params: JsonObject,
        ctx: &'a ToolContext,
    ) -> ToolFuture<'a>;
}

/// Registry for managing tool handlers.
#[derive(Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Built-in tools: `file_ops`, `code_tools`, `automation` and `echo`.
    pub fn builtin() -> Self {
        Self::new()
            .register_handler(FileOpsTool)
            .register_handler(CodeTool)
            .register_handler(AutomationTool::new())
            .register_handler(EchoTool)
    }

    pub fn register(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn register_handler<T: ToolHandler + 'static>(mut self, handler: T) -> Self {
        self.handlers.insert(handler.name().to_string(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn call_tool(
        &self,
        name: &str,
        action: &str,
        params: JsonObject,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let handler = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let supported = handler
            .actions()
            .iter()
            .any(|a| *a == "*" || *a == action);
        if !supported {
            return Err(ToolError::UnknownAction {
                tool: name.to_string(),
                action: action.to_string(),
            });
        }
        handler.execute(action, params, ctx).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip traversal sequences and anything outside `[\w\s\-.]`.
pub fn sanitize_filename(filename: &str) -> Result<String, ToolError> {
    if filename.is_empty() {
        return Err(ToolError::InvalidParameters(
            "Filename cannot be empty".to_string(),
        ));
    }

    let without_traversal = filename.replace("../", "").replace("..\\", "");
    let cleaned: String = without_traversal
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace() || *c == '-' || *c == '.')
        .collect();

    if cleaned.chars().count() > MAX_FILENAME_LEN {
        return Err(ToolError::InvalidParameters("Filename too long".to_string()));
    }
    if cleaned.trim().is_empty() || cleaned == "." || cleaned == ".." {
        return Err(ToolError::InvalidParameters(format!(
            "Filename `{}` is not usable",
            filename
        )));
    }
    Ok(cleaned)
}

/// Resolve `filename` inside `base`, refusing anything that escapes it.
pub fn safe_path(base: &Path, filename: &str) -> Result<PathBuf, ToolError> {
    let name = sanitize_filename(filename)?;
    let full = base.join(&name);
    if full.parent() != Some(base) {
        return Err(ToolError::InvalidParameters(
            "Path traversal attempt detected".to_string(),
        ));
    }
    Ok(full)
}

pub(crate) fn str_param<'a>(params: &'a JsonObject, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParameters(format!("`{}` is required", key)))
}

/// Read, write, list and delete files in the sandbox directory.
pub struct FileOpsTool;

impl FileOpsTool {
    async fn run(action: &str, params: JsonObject, ctx: &ToolContext) -> Result<Value, ToolError> {
        let root = ctx.sandbox_dir.as_path();
        match action {
            "read" | "read_file" => {
                let path = safe_path(root, str_param(&params, "filename")?)?;
                let content = tokio::fs::read_to_string(&path).await?;
                Ok(json!({ "filename": file_name(&path), "content": content }))
            }
            "write" | "save_file" => {
                let path = safe_path(root, str_param(&params, "filename")?)?;
                let content = str_param(&params, "content")?;
                tokio::fs::create_dir_all(root).await?;
                tokio::fs::write(&path, content).await?;
                info!("Saved file: {}", path.display());
                Ok(json!({ "filename": file_name(&path), "bytes": content.len() }))
            }
            "list" | "list_dir" => {
                let mut files = Vec::new();
                if tokio::fs::try_exists(root).await? {
                    let mut entries = tokio::fs::read_dir(root).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        files.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                files.sort();
                Ok(json!({ "files": files }))
            }
            "delete" => {
                let path = safe_path(root, str_param(&params, "filename")?)?;
                tokio::fs::remove_file(&path).await?;
                Ok(json!({ "filename": file_name(&path), "deleted": true }))
            }
            other => Err(ToolError::UnknownAction {
                tool: "file_ops".to_string(),
                action: other.to_string(),
            }),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl ToolHandler for FileOpsTool {
    fn name(&self) -> &str {
        "file_ops"
    }

    fn description(&self) -> &str {
        "Read, write, list and delete files inside the node's sandbox directory"
    }

    fn actions(&self) -> &[&'static str] {
        &["read", "read_file", "write", "save_file", "list", "list_dir", "delete"]
    }

    fn execute<'a>(
        &'a self,
        action: &'a str,
        params: JsonObject,
        ctx: &'a ToolContext,
    ) -> ToolFuture<'a> {
        Box::pin(Self::run(action, params, ctx))
    }
}

/// Returns its input. Accepts any action.
pub struct EchoTool;

impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the action and parameters back"
    }

    fn actions(&self) -> &[&'static str] {
        &["*"]
    }

    fn execute<'a>(
        &'a self,
        action: &'a str,
        params: JsonObject,
        _ctx: &'a ToolContext,
    ) -> ToolFuture<'a> {
        Box::pin(async move { Ok(json!({ "action": action, "parameters": params })) })
    }
}

/// Settings for a tool node.
#[derive(Debug, Clone)]
pub struct ToolNodeConfig {
    /// Tools this node advertises. Validated requests must name one of them.
    pub available_tools: BTreeSet<String>,
    pub sandbox_dir: PathBuf,
}

#[derive(Clone)]
struct ToolState {
    registry: Arc<ToolRegistry>,
    config: Arc<ToolNodeConfig>,
}

pub fn tool_router(
    profile: Arc<NodeProfile>,
    registry: ToolRegistry,
    config: ToolNodeConfig,
) -> Router {
    let mut extra = JsonObject::new();
    extra.insert("available_tools".into(), json!(config.available_tools));

    let routes = Router::new()
        .route("/execute", post(execute))
        .route("/tools", get(list_tools))
        .with_state(ToolState {
            registry: Arc::new(registry),
            config: Arc::new(config),
        });

    with_layers(routes.merge(shared_routes(profile, extra)))
}

async fn execute(
    State(state): State<ToolState>,
    ApiJson(req): ApiJson<ToolExecutionRequest>,
) -> Result<Json<ToolExecutionResponse>, ApiError> {
    if req.validation_required && !state.config.available_tools.contains(&req.tool_name) {
        return Err(ToolError::NotAdvertised(req.tool_name).into());
    }

    let ctx = ToolContext {
        sandbox_dir: state.config.sandbox_dir.clone(),
        sandboxed: req.sandboxed,
    };
    if ctx.sandboxed {
        info!("Sandboxed execution: {}.{}", req.tool_name, req.action);
    }

    let result = state
        .registry
        .call_tool(&req.tool_name, &req.action, req.parameters, &ctx)
        .await?;

    info!("Executed {}.{}", req.tool_name, req.action);
    Ok(Json(ToolExecutionResponse {
        result,
        tool: req.tool_name,
        action: req.action,
    }))
}

async fn list_tools(State(state): State<ToolState>) -> Json<Value> {
    Json(json!({
        "available_tools": state.config.available_tools,
        "tools": state.registry.list_names(),
    }))
}
