//! The orchestrator's state: registry, decomposer, scheduler and task book.

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::client::NodeConnector;
use crate::config::TaskmeshConfig;
use crate::decomposer::TaskDecomposer;
use crate::error::ApiError;
use crate::hardware;
use crate::protocol::{
    AcceleratorType, CapabilitiesDocument, JsonObject, NodeType, TaskResult, TaskStatus,
    TaskSubmission, TaskSubmissionResponse,
};
use crate::registry::{HealthMonitor, NodeRegistry};
use crate::scheduler::Scheduler;
use crate::types::TaskId;

/// Task records keyed by id, shared with in-flight runs.
type TaskBook = Arc<RwLock<HashMap<TaskId, TaskResult>>>;

pub struct OrchestratorService {
    registry: Arc<NodeRegistry>,
    decomposer: Arc<TaskDecomposer>,
    scheduler: Arc<Scheduler>,
    tasks: TaskBook,
    health_interval: Duration,
}

impl OrchestratorService {
    pub fn new(config: &TaskmeshConfig, connector: Arc<dyn NodeConnector>) -> Self {
        let registry = Arc::new(NodeRegistry::new(connector));
        let scheduler = Scheduler::new(registry.clone(), config.orchestrator.max_concurrent_rpcs);
        Self::from_parts(
            registry,
            TaskDecomposer::new(config.decomposer.clone()),
            scheduler,
            Duration::from_secs(config.orchestrator.health_interval_secs),
        )
    }

    pub fn from_parts(
        registry: Arc<NodeRegistry>,
        decomposer: TaskDecomposer,
        scheduler: Scheduler,
        health_interval: Duration,
    ) -> Self {
        Self {
            registry,
            decomposer: Arc::new(decomposer),
            scheduler: Arc::new(scheduler),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            health_interval,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Background health sweep, or `None` when the interval is zero.
    pub fn health_monitor(&self) -> Option<HealthMonitor> {
        (!self.health_interval.is_zero())
            .then(|| HealthMonitor::new(self.registry.clone(), self.health_interval))
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Decompose, execute and record one submission.
    ///
    /// The run happens on its own tokio task, so the record is finalized even
    /// when the caller stops waiting (for example a dropped HTTP request).
    pub async fn submit(
        &self,
        submission: TaskSubmission,
    ) -> Result<TaskSubmissionResponse, ApiError> {
        if submission.user_input.trim().is_empty() {
            return Err(ApiError::BadRequest("user_input must not be empty".to_string()));
        }

        let task_id = submission.task_id.clone().unwrap_or_else(TaskId::generate);
        self.begin(&task_id).await?;
        info!("Task {} started", task_id);

        let run = tokio::spawn(run_task(
            self.decomposer.clone(),
            self.scheduler.clone(),
            self.tasks.clone(),
            task_id.clone(),
            submission,
        ));

        match run.await {
            Ok(response) => response,
            Err(e) => {
                let message = format!("Task execution aborted: {}", e);
                warn!("Task {}: {}", task_id, message);
                finish(
                    &self.tasks,
                    &task_id,
                    TaskStatus::Failed,
                    None,
                    Some(message.clone()),
                    JsonObject::new(),
                )
                .await;
                Err(ApiError::Internal(message))
            }
        }
    }

    /// Create the in-progress record. A finished task id may be reused; one
    /// still running may not.
    async fn begin(&self, task_id: &TaskId) -> Result<(), ApiError> {
        let mut tasks = self.tasks.write().await;
        if tasks.get(task_id).is_some_and(|t| !t.status.is_terminal()) {
            return Err(ApiError::Conflict(format!(
                "Task {} is already in progress",
                task_id
            )));
        }

        let mut record = TaskResult::in_progress(task_id.clone());
        record
            .metadata
            .insert("created_at".into(), json!(Utc::now().to_rfc3339()));
        tasks.insert(task_id.clone(), record);
        Ok(())
    }

    /// Capability document served on `GET /capabilities`.
    pub async fn capabilities(&self) -> CapabilitiesDocument {
        let mut extra = JsonObject::new();
        extra.insert(
            "features".into(),
            json!({
                "task_decomposition": true,
                "routing": true,
                "scheduling": true,
                "hardware_aware": true
            }),
        );
        extra.insert("registered_nodes".into(), json!(self.registry.len().await));

        CapabilitiesDocument {
            node_type: NodeType::Orchestrator,
            capabilities: hardware::detect(AcceleratorType::Cpu, None),
            specializations: Vec::new(),
            extra,
        }
    }
}

async fn run_task(
    decomposer: Arc<TaskDecomposer>,
    scheduler: Arc<Scheduler>,
    tasks: TaskBook,
    task_id: TaskId,
    submission: TaskSubmission,
) -> Result<TaskSubmissionResponse, ApiError> {
    let plan = match decomposer.decompose(&submission.user_input, &submission.context) {
        Ok(plan) => plan,
        Err(e) => {
            warn!("Task {} could not be planned: {}", task_id, e);
            let error = Some(e.to_string());
            finish(&tasks, &task_id, TaskStatus::Failed, None, error, JsonObject::new()).await;
            return Err(e.into());
        }
    };

    let report = scheduler.execute(&plan).await;
    let status = report.status();
    let error = report.failure_reason();

    let mut metadata = JsonObject::new();
    metadata.insert("intent".into(), json!(plan.intent()));
    metadata.insert(
        "required_capabilities".into(),
        json!(plan.required_capabilities()),
    );
    metadata.insert("steps".into(), json!(plan.steps()));
    metadata.insert("steps_completed".into(), json!(report.steps_completed));
    metadata.insert("rounds".into(), json!(report.rounds));
    metadata.insert("step_results".into(), json!(report.step_results));

    let result = Some(report.response.clone());
    finish(&tasks, &task_id, status, result, error.clone(), metadata).await;

    match status {
        TaskStatus::Completed => info!("Task {} completed", task_id),
        _ => warn!(
            "Task {} {}: {}",
            task_id,
            status.as_str(),
            error.as_deref().unwrap_or("no error recorded")
        ),
    }

    Ok(TaskSubmissionResponse {
        task_id,
        status,
        result: Some(report.response),
        error,
    })
}

/// Finalize a record. Only an in-progress record is touched, so each task is
/// finalized once.
async fn finish(
    tasks: &TaskBook,
    task_id: &TaskId,
    status: TaskStatus,
    result: Option<Value>,
    error: Option<String>,
    metadata: JsonObject,
) {
    let mut tasks = tasks.write().await;
    let Some(record) = tasks.get_mut(task_id) else {
        return;
    };
    if record.status.is_terminal() {
        return;
    }

    record.status = status;
    record.result = result;
    record.error = error;
    record.metadata.extend(metadata);
    record
        .metadata
        .insert("completed_at".into(), json!(Utc::now().to_rfc3339()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{NodeRpc, RpcResult};
    use crate::error::ClientError;
    use crate::protocol::{MemoryRequest, NodeRegistration, ReasoningRequest, ToolExecutionRequest};
    use crate::test_support::{FakeNode, FnConnector, registration};
    use async_trait::async_trait;

    async fn service() -> OrchestratorService {
        let fake = Arc::new(FakeNode::default());
        let connector = Arc::new(FnConnector(move |_: &NodeRegistration| {
            fake.clone() as Arc<dyn NodeRpc>
        }));
        let service = OrchestratorService::new(&TaskmeshConfig::default(), connector);
        for (id, node_type) in [
            ("llm", NodeType::Reasoning),
            ("tools", NodeType::Tool),
            ("mem", NodeType::Memory),
        ] {
            service
                .registry()
                .register(registration(id, node_type, 0.2))
                .await
                .unwrap();
        }
        service
    }

    fn submission(task_id: Option<&str>, text: &str) -> TaskSubmission {
        TaskSubmission {
            task_id: task_id.map(TaskId::new),
            user_input: text.to_string(),
            context: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_records_finalized_task() {
        let service = service().await;
        let response = service
            .submit(submission(Some("t-1"), "What is quantum computing?"))
            .await
            .unwrap();

        assert_eq!(response.task_id, TaskId::new("t-1"));
        assert_eq!(response.status, TaskStatus::Completed);
        assert_eq!(
            response.result,
            Some(json!("answer: What is quantum computing?"))
        );

        let stored = service.task(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.metadata["intent"], json!("research"));
        assert_eq!(stored.metadata["rounds"], json!(3));
        assert!(stored.metadata.contains_key("created_at"));
        assert!(stored.metadata.contains_key("completed_at"));
    }

    #[tokio::test]
    async fn test_submit_generates_task_id() {
        let service = service().await;
        let a = service.submit(submission(None, "hello")).await.unwrap();
        let b = service.submit(submission(None, "hello")).await.unwrap();
        assert_ne!(a.task_id, b.task_id);
        assert_eq!(service.task_count().await, 2);
    }

    #[tokio::test]
    async fn test_in_progress_task_id_conflicts() {
        let service = service().await;
        service.begin(&TaskId::new("busy")).await.unwrap();

        let err = service
            .submit(submission(Some("busy"), "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_finish_only_applies_once() {
        let service = service().await;
        let id = TaskId::new("once");
        service.begin(&id).await.unwrap();
        let first = Some(json!("first"));
        finish(&service.tasks, &id, TaskStatus::Completed, first, None, JsonObject::new()).await;
        let second = Some(json!("second"));
        finish(&service.tasks, &id, TaskStatus::Failed, second, None, JsonObject::new()).await;

        let stored = service.task(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(json!("first")));
    }

    /// Reasoning node that takes a while to answer.
    struct SlowReasoner;

    #[async_trait]
    impl NodeRpc for SlowReasoner {
        async fn health_check(&self) -> bool {
            true
        }

        async fn reason(&self, _: &ReasoningRequest) -> RpcResult {
            tokio::time::sleep(Duration::from_millis(300)).await;
            RpcResult::completed(json!("slow answer"))
        }

        async fn execute_tool(&self, _: &ToolExecutionRequest) -> Result<Value, ClientError> {
            Ok(Value::Null)
        }

        async fn memory_operation(&self, _: &MemoryRequest) -> RpcResult {
            RpcResult::completed(json!([]))
        }
    }

    #[tokio::test]
    async fn test_dropped_submission_still_finalizes() {
        let connector = Arc::new(FnConnector(|_: &NodeRegistration| {
            Arc::new(SlowReasoner) as Arc<dyn NodeRpc>
        }));
        let service = OrchestratorService::new(&TaskmeshConfig::default(), connector);
        service
            .registry()
            .register(registration("llm", NodeType::Reasoning, 0.0))
            .await
            .unwrap();

        let id = TaskId::new("t1");
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            service.submit(submission(Some("t1"), "hello")),
        )
        .await;
        assert!(waited.is_err());

        let mut stored = None;
        for _ in 0..100 {
            stored = service.task(&id).await.filter(|t| t.status.is_terminal());
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stored = stored.expect("task was never finalized");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(json!("slow answer")));

        // The id is free again once the first run has finished.
        let retry = service.submit(submission(Some("t1"), "hello")).await.unwrap();
        assert_eq!(retry.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_blank_input_is_rejected() {
        let service = service().await;
        let err = service.submit(submission(None, "   ")).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(service.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_capabilities_document() {
        let service = service().await;
        let doc = service.capabilities().await;
        assert_eq!(doc.node_type, NodeType::Orchestrator);
        assert_eq!(doc.extra["registered_nodes"], json!(3));
        assert_eq!(doc.extra["features"]["routing"], json!(true));
    }

    #[test]
    fn test_zero_interval_disables_monitor() {
        let mut config = TaskmeshConfig::default();
        config.orchestrator.health_interval_secs = 0;
        let connector = Arc::new(FnConnector(|_: &NodeRegistration| {
            Arc::new(FakeNode::default()) as Arc<dyn NodeRpc>
        }));
        let service = OrchestratorService::new(&config, connector);
        assert!(service.health_monitor().is_none());
    }
}
