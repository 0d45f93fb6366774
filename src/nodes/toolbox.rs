//! The `code_tools` and `automation` tools.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::tool::{ToolContext, ToolFuture, ToolHandler, safe_path, str_param};
use crate::error::ToolError;
use crate::hardware;
use crate::protocol::JsonObject;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs scripts from the sandbox and formats code produced upstream.
///
/// `execute` (what plans send) runs `filename` when given, otherwise formats
/// `code` or the reasoning output passed in as `input`.
pub struct CodeTool;

impl CodeTool {
    async fn run(action: &str, params: JsonObject, ctx: &ToolContext) -> Result<Value, ToolError> {
        match action {
            "execute_script" => {
                execute_script(&ctx.sandbox_dir, str_param(&params, "filename")?).await
            }
            "execute" if params.contains_key("filename") => {
                execute_script(&ctx.sandbox_dir, str_param(&params, "filename")?).await
            }
            "show_code" | "format_code" => format_code(&params),
            "execute" => format_code(&params),
            other => Err(ToolError::UnknownAction {
                tool: "code_tools".to_string(),
                action: other.to_string(),
            }),
        }
    }
}

impl ToolHandler for CodeTool {
    fn name(&self) -> &str {
        "code_tools"
    }

    fn description(&self) -> &str {
        "Run Python or shell scripts from the sandbox and format code"
    }

    fn actions(&self) -> &[&'static str] {
        &["execute", "execute_script", "show_code", "format_code"]
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

fn interpreter(path: &Path) -> Result<&'static str, ToolError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Ok("python3"),
        Some("sh") => Ok("sh"),
        _ => Err(ToolError::InvalidParameters(
            "Only .py and .sh scripts can be executed".to_string(),
        )),
    }
}

async fn execute_script(sandbox: &Path, filename: &str) -> Result<Value, ToolError> {
    let path = safe_path(sandbox, filename)?;
    let program = interpreter(&path)?;
    if !tokio::fs::try_exists(&path).await? {
        return Err(ToolError::InvalidParameters(format!(
            "Script `{}` does not exist",
            filename
        )));
    }

    let child = Command::new(program)
        .arg(&path)
        .current_dir(sandbox)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(SCRIPT_TIMEOUT, child).await {
        Ok(output) => output?,
        Err(_) => {
            warn!("Script {} timed out", path.display());
            return Err(ToolError::Failed(format!(
                "Script timed out after {}s",
                SCRIPT_TIMEOUT.as_secs()
            )));
        }
    };

    info!("Executed script: {}", path.display());
    Ok(json!({
        "filename": filename,
        "exit_code": output.status.code(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    }))
}

fn format_code(params: &JsonObject) -> Result<Value, ToolError> {
    let code = match params.get("code").or_else(|| params.get("input")) {
        Some(Value::String(code)) => code.clone(),
        Some(other) => other.to_string(),
        None => {
            return Err(ToolError::InvalidParameters(
                "`code` is required".to_string(),
            ));
        }
    };
    let language = params
        .get("language")
        .and_then(Value::as_str)
        .unwrap_or("python");

    Ok(json!(format!("```{}\n{}\n```", language, code.trim_end())))
}

/// Named workflows plus a host status report. `execute` reports status.
pub struct AutomationTool {
    workflows: RwLock<BTreeMap<String, Vec<Value>>>,
}

impl AutomationTool {
    pub fn new() -> Self {
        let optimize = vec![
            json!({"action": "Clean temporary files"}),
            json!({"action": "Adjust process priorities"}),
        ];
        Self {
            workflows: RwLock::new(BTreeMap::from([("optimize_system".to_string(), optimize)])),
        }
    }

    async fn run(&self, action: &str, params: JsonObject) -> Result<Value, ToolError> {
        match action {
            "execute" | "system_status" | "get_system_status" => {
                Ok(json!(hardware::usage().await))
            }
            "create_workflow" => {
                let name = str_param(&params, "name")?.to_string();
                let steps = params
                    .get("steps")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| {
                        ToolError::InvalidParameters("`steps` must be an array".to_string())
                    })?;
                info!("Created workflow: {} with {} steps", name, steps.len());
                let count = steps.len();
                self.workflows.write().await.insert(name.clone(), steps);
                Ok(json!({ "status": "created", "workflow": name, "steps": count }))
            }
            "run_workflow" => {
                let name = str_param(&params, "name")?;
                let workflows = self.workflows.read().await;
                let Some(steps) = workflows.get(name) else {
                    return Ok(json!({ "status": "not_found", "workflow": name }));
                };
                info!("Running workflow: {}", name);
                Ok(json!({
                    "status": "completed",
                    "workflow": name,
                    "steps_run": steps.len(),
                }))
            }
            "list_workflows" => {
                let names: Vec<String> = self.workflows.read().await.keys().cloned().collect();
                Ok(json!({ "workflows": names }))
            }
            other => Err(ToolError::UnknownAction {
                tool: "automation".to_string(),
                action: other.to_string(),
            }),
        }
    }
}

impl Default for AutomationTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolHandler for AutomationTool {
    fn name(&self) -> &str {
        "automation"
    }

    fn description(&self) -> &str {
        "Define and run named workflows and report host CPU and memory usage"
    }

    fn actions(&self) -> &[&'static str] {
        &[
            "execute",
            "system_status",
            "get_system_status",
            "create_workflow",
            "run_workflow",
            "list_workflows",
        ]
    }

    fn execute<'a>(
        &'a self,
        action: &'a str,
        params: JsonObject,
        _ctx: &'a ToolContext,
    ) -> ToolFuture<'a> {
        Box::pin(self.run(action, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::ToolRegistry;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext {
            sandbox_dir: dir.to_path_buf(),
            sandboxed: true,
        }
    }

    fn params(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_execute_script_runs_inside_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.sh"), "echo hi\necho done > out.txt\n").unwrap();
        let registry = ToolRegistry::builtin();

        let out = registry
            .call_tool(
                "code_tools",
                "execute_script",
                params(json!({"filename": "hello.sh"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();

        assert_eq!(out["exit_code"], json!(0));
        assert_eq!(out["stdout"], json!("hi\n"));
        // Relative paths resolve against the sandbox.
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_execute_script_rejects_bad_targets() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());

        let missing = CodeTool
            .execute("execute_script", params(json!({"filename": "nope.sh"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(missing, ToolError::InvalidParameters(_)));

        std::fs::write(dir.path().join("data.txt"), "x").unwrap();
        let not_script = CodeTool
            .execute("execute_script", params(json!({"filename": "data.txt"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(not_script, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_plan_execute_formats_reasoning_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = CodeTool
            .execute(
                "execute",
                params(json!({"input": "def f():\n    return 1\n"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(out, json!("```python\ndef f():\n    return 1\n```"));

        let err = CodeTool
            .execute("execute", JsonObject::new(), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let tool = AutomationTool::new();

        let created = tool
            .execute(
                "create_workflow",
                params(json!({"name": "backup", "steps": [{"action": "copy"}]})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(created["status"], json!("created"));

        let ran = tool
            .execute("run_workflow", params(json!({"name": "backup"})), &ctx)
            .await
            .unwrap();
        assert_eq!(ran["steps_run"], json!(1));

        let missing = tool
            .execute("run_workflow", params(json!({"name": "ghost"})), &ctx)
            .await
            .unwrap();
        assert_eq!(missing["status"], json!("not_found"));

        let listed = tool
            .execute("list_workflows", JsonObject::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(listed["workflows"], json!(["backup", "optimize_system"]));
    }

    #[tokio::test]
    async fn test_plan_execute_reports_system_status() {
        let dir = tempfile::tempdir().unwrap();
        let status = AutomationTool::new()
            .execute("execute", params(json!({"input": "train a model"})), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(status["memory_percent"].is_number());
        assert!(status["cpu_percent"].is_number());
    }
}
