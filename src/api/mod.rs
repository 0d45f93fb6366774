// REST API endpoints for the orchestrator

mod extract;
mod service;

pub use extract::ApiJson;
pub use service::OrchestratorService;

use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::protocol::{
    CapabilitiesDocument, HealthResponse, Heartbeat, NodeList, NodeRegistration, NodeType,
    RegisterAck, TaskResult, TaskSubmission, TaskSubmissionResponse,
};
use crate::types::{NodeId, TaskId};

pub type AppState = Arc<OrchestratorService>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/capabilities", get(capabilities))
        .route("/task", post(submit_task))
        .route("/task/{task_id}", get(task_status))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{node_id}", delete(remove_node))
        .route("/register", post(register_node))
        .route("/heartbeat", post(heartbeat))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::healthy(NodeType::Orchestrator))
}

async fn capabilities(State(state): State<AppState>) -> Json<CapabilitiesDocument> {
    Json(state.capabilities().await)
}

async fn submit_task(
    State(state): State<AppState>,
    ApiJson(submission): ApiJson<TaskSubmission>,
) -> Result<Json<TaskSubmissionResponse>, ApiError> {
    state.submit(submission).await.map(Json)
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<TaskResult>, ApiError> {
    state
        .task(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))
}

async fn list_nodes(State(state): State<AppState>) -> Json<NodeList> {
    Json(NodeList {
        nodes: state.registry().list().await,
    })
}

async fn register_node(
    State(state): State<AppState>,
    ApiJson(registration): ApiJson<NodeRegistration>,
) -> Result<Json<RegisterAck>, ApiError> {
    let node_id = registration.node_id.clone();
    state.registry().register(registration).await?;
    Ok(Json(RegisterAck {
        status: "registered".to_string(),
        node_id: Some(node_id),
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    ApiJson(beat): ApiJson<Heartbeat>,
) -> Result<Json<RegisterAck>, ApiError> {
    state
        .registry()
        .heartbeat(&beat.node_id, beat.capabilities)
        .await?;
    Ok(Json(RegisterAck {
        status: "acknowledged".to_string(),
        node_id: Some(beat.node_id),
    }))
}

async fn remove_node(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<RegisterAck>, ApiError> {
    state.registry().remove(&node_id).await?;
    Ok(Json(RegisterAck {
        status: "removed".to_string(),
        node_id: Some(node_id),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpConnector, NodeRpc, OrchestratorClient};
    use crate::config::TaskmeshConfig;
    use crate::protocol::{PROTOCOL_HEADER, TaskStatus};
    use crate::test_support::{FakeNode, FnConnector, registration, spawn_router};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app() -> Router {
        let connector = Arc::new(FnConnector(|_: &NodeRegistration| {
            Arc::new(FakeNode::default()) as Arc<dyn NodeRpc>
        }));
        create_router(Arc::new(OrchestratorService::new(
            &TaskmeshConfig::default(),
            connector,
        )))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register_all(app: &Router) {
        for (id, node_type) in [
            ("llm-1", NodeType::Reasoning),
            ("tool-1", NodeType::Tool),
            ("mem-1", NodeType::Memory),
        ] {
            let body = serde_json::to_value(registration(id, node_type, 0.1)).unwrap();
            let (status, ack) = call(app, "POST", "/register", Some(body)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(ack, json!({"status": "registered", "node_id": id}));
        }
    }

    #[tokio::test]
    async fn test_health_and_capabilities() {
        let app = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["node_type"], json!("orchestrator"));

        let (status, body) = call(&app, "GET", "/capabilities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"]["task_decomposition"], json!(true));
        assert!(body["capabilities"]["cpu_cores"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_register_and_list_nodes() {
        let app = app();
        register_all(&app).await;

        let (status, body) = call(&app, "GET", "/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["node_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["llm-1", "mem-1", "tool-1"]);
    }

    #[tokio::test]
    async fn test_malformed_registration_is_400() {
        let app = app();
        let (status, body) = call(&app, "POST", "/register", Some(json!({"node_id": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let mut bad = serde_json::to_value(registration("x", NodeType::Tool, 0.1)).unwrap();
        bad["address"] = json!("nowhere");
        let (status, _) = call(&app, "POST", "/register", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_protocol_version_mismatch_is_400() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/task")
            .header("content-type", "application/json")
            .header(PROTOCOL_HEADER, "99")
            .body(Body::from(json!({"user_input": "hi"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_and_query_task() {
        let app = app();
        register_all(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/task",
            Some(json!({
                "task_id": "t-42",
                "user_input": "What is quantum computing?",
                "context": []
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task_id"], json!("t-42"));
        assert_eq!(body["status"], json!("completed"));
        assert_eq!(body["result"], json!("answer: What is quantum computing?"));

        let (status, stored) = call(&app, "GET", "/task/t-42", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["status"], json!("completed"));
        assert_eq!(stored["metadata"]["intent"], json!("research"));
        assert_eq!(
            stored["metadata"]["step_results"]["memory_write"]["status"],
            json!("completed")
        );
    }

    #[tokio::test]
    async fn test_wrapped_submission_form() {
        let app = app();
        register_all(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/task",
            Some(json!({"payload": {"user_input": "hello", "context": []}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["task_id"].as_str().unwrap().is_empty());
        assert_eq!(body["result"], json!("answer: hello"));
    }

    #[tokio::test]
    async fn test_task_without_reasoning_node_fails() {
        let app = app();
        let submission = json!({
            "user_input": "hello",
            "context": [{"input": "a", "output": "b"}]
        });
        let (status, body) = call(&app, "POST", "/task", Some(submission)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("failed"));
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("No available reasoning node")
        );
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let app = app();
        let (status, body) = call(&app, "GET", "/task/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Task not found"}));
    }

    #[tokio::test]
    async fn test_heartbeat_and_remove() {
        let app = app();
        register_all(&app).await;

        let beat = json!({
            "node_id": "llm-1",
            "capabilities": {"cpu_cores": 4, "ram_gb": 8.0, "current_load": 0.6}
        });
        let (status, body) = call(&app, "POST", "/heartbeat", Some(beat)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("acknowledged"));

        let ghost = json!({"node_id": "ghost", "capabilities": {"cpu_cores": 1, "ram_gb": 1.0}});
        let (status, _) = call(&app, "POST", "/heartbeat", Some(ghost)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "DELETE", "/nodes/tool-1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", "/nodes/tool-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, "GET", "/nodes", None).await;
        assert_eq!(body["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_orchestrator_client_round_trip() {
        let service = Arc::new(OrchestratorService::new(
            &TaskmeshConfig::default(),
            Arc::new(HttpConnector::new(Default::default())),
        ));
        let addr = spawn_router(create_router(service)).await;
        let client = OrchestratorClient::new(&addr.to_string(), Default::default());

        assert!(client.health_check().await);
        assert!(client.register(&registration("n1", NodeType::Memory, 0.0)).await);
        assert_eq!(client.list_nodes().await.unwrap().len(), 1);
        client.deregister(&NodeId::new("n1")).await.unwrap();
        assert!(client.list_nodes().await.unwrap().is_empty());

        // No worker nodes: the task finishes as failed, but is still recorded.
        let response = client
            .submit_task(&TaskSubmission {
                task_id: Some(TaskId::new("remote-1")),
                user_input: "hi".into(),
                context: vec![],
            })
            .await
            .unwrap();
        assert_eq!(response.status, TaskStatus::Failed);
        let stored = client.task_status(&TaskId::new("remote-1")).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }
}
