// Core modules
pub mod config;
pub mod error;
pub mod hardware;
pub mod protocol;
pub mod types;

// Coordinator
pub mod api;
pub mod client;
pub mod decomposer;
pub mod registry;
pub mod scheduler;

// Worker nodes
pub mod nodes;

#[cfg(test)]
mod test_support;

// Re-export key types and functions
pub use api::{OrchestratorService, create_router};
pub use client::{HttpConnector, NodeClient, NodeConnector, NodeRpc, OrchestratorClient, RpcResult};
pub use config::{RpcTimeouts, TaskmeshConfig};
pub use decomposer::{Classifier, Intent, KeywordClassifier, Plan, TaskDecomposer, TaskStep};
pub use error::{ApiError, ClientError, ConfigError, PlanError, RegistryError, ToolError};
pub use protocol::{NodeRegistration, NodeType, PROTOCOL_VERSION, TaskStatus, WireMessage};
pub use registry::{HealthMonitor, NodeRegistry};
pub use scheduler::{ExecutionReport, Scheduler, StepOutcome};
pub use types::{NodeId, StepId, TaskId};

use std::sync::Arc;

/// Convenience function to create an orchestrator that reaches its nodes
/// over HTTP.
pub fn create_orchestrator(config: &TaskmeshConfig) -> Arc<OrchestratorService> {
    let connector = Arc::new(HttpConnector::new(config.timeouts));
    Arc::new(OrchestratorService::new(config, connector))
}
