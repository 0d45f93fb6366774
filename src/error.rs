//! Error types for the coordinator and the worker nodes.
//!
//! Each concern gets its own enum. `ApiError` is the only one that reaches
//! HTTP callers; it renders as `{"error": "..."}` with a matching status code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::types::{NodeId, StepId};

/// Errors raised while registering or updating worker nodes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// The registration payload failed validation.
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// Heartbeat or removal for a node that was never registered.
    #[error("Node not found: {0}")]
    UnknownNode(NodeId),
}

/// Structural problems in a plan. Detected when the plan is built, so a
/// plan that exists is always a DAG.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Dependency cycle through step {0}")]
    Cycle(StepId),
}

/// Encoding problems on the wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

/// Failures of an outbound RPC to a node or to the orchestrator.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote answered with a non-2xx status.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Invalid node address: {0}")]
    InvalidAddress(String),
}

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures inside a tool node.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool '{0}' not available")]
    UnknownTool(String),

    /// Validation rejected a tool this node does not advertise.
    #[error("Tool '{0}' not available on this node")]
    NotAdvertised(String),

    #[error("Unknown action '{action}' for tool '{tool}'")]
    UnknownAction { tool: String, action: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The tool ran but could not finish, e.g. a script timed out.
    #[error("Tool execution failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP-facing error for every server in the crate.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed body or unknown operation.
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidRegistration(_) => ApiError::BadRequest(err.to_string()),
            RegistryError::UnknownNode(_) => ApiError::NotFound(err.to_string()),
        }
    }
}

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Io(_) | ToolError::Failed(_) => ApiError::Internal(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RegistryError::UnknownNode(NodeId::new("n1")).to_string(),
            "Node not found: n1"
        );
        assert_eq!(
            PlanError::UnknownDependency {
                step: StepId::new("reasoning"),
                dependency: StepId::new("ghost"),
            }
            .to_string(),
            "Step reasoning depends on unknown step ghost"
        );
        assert_eq!(ApiError::NotFound("Task not found".into()).to_string(), "Task not found");
    }

    #[test]
    fn test_registry_error_status_mapping() {
        let bad: ApiError = RegistryError::InvalidRegistration("empty node_id".into()).into();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing: ApiError = RegistryError::UnknownNode(NodeId::new("x")).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_tool_error_status_mapping() {
        let unknown: ApiError = ToolError::UnknownTool("web_tools".into()).into();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
        assert_eq!(unknown.to_string(), "Tool 'web_tools' not available");

        let io: ApiError = ToolError::Io(std::io::Error::other("disk full")).into();
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_api_error_body_shape() {
        let response = ApiError::NotFound("Task not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "error": "Task not found" }));
    }
}
