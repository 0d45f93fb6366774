//! Worker node servers: reasoning, tool and memory.
//!
//! Every node serves the shared `/health`, `/capabilities` and `/register`
//! endpoints next to its own RPC route.

pub mod announce;
pub mod memory;
pub mod reasoning;
pub mod tool;
pub mod toolbox;

pub use announce::NodeAnnouncer;
pub use memory::{MemoryStore, memory_router};
pub use reasoning::{EchoBackend, OllamaBackend, ReasoningBackend, reasoning_router};
pub use tool::{ToolHandler, ToolRegistry, tool_router};
pub use toolbox::{AutomationTool, CodeTool};

use axum::{Router, extract::State, response::Json, routing::get, routing::post};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ApiJson;
use crate::hardware;
use crate::protocol::{
    AcceleratorType, CapabilitiesDocument, HardwareCapabilities, HealthResponse, JsonObject,
    NodeRegistration, NodeType, RegisterAck,
};
use crate::types::NodeId;

/// Identity and hardware a worker node advertises.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub node_id: NodeId,
    pub node_type: NodeType,
    /// Address the orchestrator should use to reach this node.
    pub address: String,
    pub capabilities: HardwareCapabilities,
    pub specializations: BTreeSet<String>,
    pub metadata: JsonObject,
}

impl NodeProfile {
    pub fn new(
        node_id: impl Into<NodeId>,
        node_type: NodeType,
        address: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            address: address.into(),
            capabilities: hardware::detect(AcceleratorType::Cpu, None),
            specializations: BTreeSet::new(),
            metadata: JsonObject::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: HardwareCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_specializations<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specializations = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Capabilities with the load re-sampled from the host.
    pub fn current_capabilities(&self) -> HardwareCapabilities {
        HardwareCapabilities {
            current_load: hardware::current_load(self.capabilities.cpu_cores),
            ..self.capabilities.clone()
        }
    }

    pub fn registration(&self) -> NodeRegistration {
        NodeRegistration {
            node_id: self.node_id.clone(),
            node_type: self.node_type,
            address: self.address.clone(),
            capabilities: self.current_capabilities(),
            specializations: self.specializations.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Clone)]
struct SharedState {
    profile: Arc<NodeProfile>,
    /// Node-specific fields merged into `/capabilities`.
    extra: Arc<JsonObject>,
}

/// `/health`, `/capabilities` and `/register` for any node type.
pub(crate) fn shared_routes(profile: Arc<NodeProfile>, extra: JsonObject) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/capabilities", get(capabilities))
        .route("/register", post(acknowledge_registration))
        .with_state(SharedState {
            profile,
            extra: Arc::new(extra),
        })
}

/// Apply the same tracing and CORS layers as the orchestrator router.
pub(crate) fn with_layers(router: Router) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.profile.node_type))
}

async fn capabilities(State(state): State<SharedState>) -> Json<CapabilitiesDocument> {
    Json(CapabilitiesDocument {
        node_type: state.profile.node_type,
        capabilities: state.profile.current_capabilities(),
        specializations: state.profile.specializations.iter().cloned().collect(),
        extra: state.extra.as_ref().clone(),
    })
}

/// Nodes accept peer announcements but keep no registry of their own.
async fn acknowledge_registration(
    State(state): State<SharedState>,
    ApiJson(registration): ApiJson<NodeRegistration>,
) -> Json<RegisterAck> {
    tracing::debug!(
        "Node {} received announcement from {}",
        state.profile.node_id,
        registration.node_id
    );
    Json(RegisterAck {
        status: "acknowledged".to_string(),
        node_id: Some(registration.node_id),
    })
}
