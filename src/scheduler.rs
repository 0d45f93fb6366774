//! Round-based executor for a [`Plan`].
//!
//! Each round computes the ready set (steps whose dependencies have all been
//! finalized), dispatches it concurrently and waits for every call before the
//! next round starts. A step's RPC is therefore never issued before the
//! results of its dependencies are recorded.

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::client::{NodeRpc, RpcResult};
use crate::decomposer::{Plan, TaskStep};
use crate::protocol::{
    ContextEntry, MemoryRequest, ReasoningRequest, StepKind, TaskStatus, ToolExecutionRequest,
};
use crate::registry::NodeRegistry;
use crate::types::{NodeId, StepId};

/// Marker returned when no step produced a usable result.
pub const COMPLETION_MARKER: &str = "Task completed";

/// Final state of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl StepOutcome {
    fn from_rpc(kind: StepKind, node_id: NodeId, rpc: RpcResult, started: Instant) -> Self {
        Self {
            kind,
            node_id: Some(node_id),
            status: if rpc.is_success() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            result: rpc.result,
            error: rpc.error,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(
        kind: StepKind,
        node_id: Option<NodeId>,
        error: impl Into<String>,
        started: Instant,
    ) -> Self {
        Self {
            kind,
            node_id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn cancelled(kind: StepKind, error: String) -> Self {
        Self {
            kind,
            node_id: None,
            status: TaskStatus::Cancelled,
            result: None,
            error: Some(error),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// The result, unless it is null or an empty string.
    fn usable_result(&self) -> Option<&Value> {
        self.result.as_ref().filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
    }
}

/// Aggregate outcome of one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub response: Value,
    pub steps_completed: usize,
    pub rounds: usize,
    pub step_results: BTreeMap<StepId, StepOutcome>,
    /// Plan-level failure, such as a dependency that can never be satisfied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionReport {
    /// `failed` on a dependency error or when the reasoning step did not
    /// complete; step-local failures elsewhere still count as `completed`.
    pub fn status(&self) -> TaskStatus {
        if self.error.is_some() {
            return TaskStatus::Failed;
        }
        let reasoning_failed = self
            .step_results
            .values()
            .any(|o| o.kind == StepKind::Reasoning && !o.is_success());
        if reasoning_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        }
    }

    /// First error worth surfacing to the submitter.
    pub fn failure_reason(&self) -> Option<String> {
        self.error.clone().or_else(|| {
            self.step_results
                .iter()
                .find(|(_, o)| o.kind == StepKind::Reasoning && !o.is_success())
                .map(|(id, o)| {
                    format!(
                        "Step {} failed: {}",
                        id,
                        o.error.as_deref().unwrap_or("unknown error")
                    )
                })
        })
    }
}

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    /// `max_concurrent_rpcs` bounds outbound calls across every run sharing
    /// this scheduler.
    pub fn new(registry: Arc<NodeRegistry>, max_concurrent_rpcs: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent_rpcs.max(1))),
        }
    }

    pub async fn execute(&self, plan: &Plan) -> ExecutionReport {
        let total = plan.len();
        let mut finalized: HashSet<StepId> = HashSet::with_capacity(total);
        let mut results: BTreeMap<StepId, StepOutcome> = BTreeMap::new();
        let mut rounds = 0;
        let mut error = None;

        info!("Executing {} plan with {} steps", plan.intent(), total);

        while finalized.len() < total {
            let ready: Vec<&TaskStep> = plan
                .steps()
                .iter()
                .filter(|s| !finalized.contains(&s.step_id))
                .filter(|s| s.depends_on.iter().all(|d| finalized.contains(d)))
                .collect();

            if ready.is_empty() {
                let stuck: Vec<&str> = plan
                    .steps()
                    .iter()
                    .filter(|s| !finalized.contains(&s.step_id))
                    .map(|s| s.step_id.as_str())
                    .collect();
                let message = format!(
                    "Dependency error: steps [{}] can never become ready",
                    stuck.join(", ")
                );
                warn!("{}", message);
                error = Some(message);
                break;
            }

            rounds += 1;
            debug!("Round {}: dispatching {} ready steps", rounds, ready.len());

            let outcomes = join_all(ready.iter().map(|step| self.run_step(step, &results))).await;

            for (step, outcome) in ready.iter().zip(outcomes) {
                finalized.insert(step.step_id.clone());
                results.insert(step.step_id.clone(), outcome);
            }
        }

        let response = final_response(plan, &results);
        let steps_completed = results.values().filter(|o| o.is_success()).count();

        info!(
            "Plan finished after {} rounds: {}/{} steps completed",
            rounds, steps_completed, total
        );

        ExecutionReport {
            response,
            steps_completed,
            rounds,
            step_results: results,
            error,
        }
    }

    async fn run_step(
        &self,
        step: &TaskStep,
        results: &BTreeMap<StepId, StepOutcome>,
    ) -> StepOutcome {
        // Failed memory or tool dependencies only lose their data. A failed
        // reasoning step leaves nothing for its dependents to act on.
        let failed_reasoning = step.depends_on.iter().find(|d| {
            results
                .get(*d)
                .is_some_and(|o| o.kind == StepKind::Reasoning && !o.is_success())
        });
        if let Some(dep) = failed_reasoning {
            debug!("Skipping step {}: dependency {} did not complete", step.step_id, dep);
            return StepOutcome::cancelled(
                step.kind,
                format!("Dependency {} did not complete", dep),
            );
        }

        let started = Instant::now();
        let Some((node_id, client)) = self
            .registry
            .route(step.target_node_type, step.specialization.as_deref())
            .await
        else {
            let message = match &step.specialization {
                Some(tag) => format!(
                    "No available {} node with specialization {}",
                    step.target_node_type, tag
                ),
                None => format!("No available {} node", step.target_node_type),
            };
            warn!("Step {}: {}", step.step_id, message);
            return StepOutcome::failed(step.kind, None, message, started);
        };

        let Ok(_permit) = self.permits.acquire().await else {
            let message = "Scheduler is shutting down";
            return StepOutcome::failed(step.kind, Some(node_id), message, started);
        };

        debug!("Step {} ({}) -> node {}", step.step_id, step.kind.as_str(), node_id);
        let outcome = dispatch(step, results, node_id, client.as_ref(), started).await;
        if let Some(err) = &outcome.error {
            warn!("Step {} failed: {}", step.step_id, err);
        }
        outcome
    }
}

async fn dispatch(
    step: &TaskStep,
    results: &BTreeMap<StepId, StepOutcome>,
    node_id: NodeId,
    client: &dyn NodeRpc,
    started: Instant,
) -> StepOutcome {
    match step.kind {
        StepKind::Reasoning => {
            let mut req: ReasoningRequest =
                match serde_json::from_value(Value::Object(step.payload.clone())) {
                    Ok(req) => req,
                    Err(e) => {
                        let message = format!("Invalid reasoning payload: {}", e);
                        return StepOutcome::failed(step.kind, Some(node_id), message, started);
                    }
                };
            if req.context.is_empty() {
                if let Some(memories) = dependency_result(step, results, StepKind::MemoryRead) {
                    req.context = context_from_memories(memories);
                }
            }
            let rpc = client.reason(&req).await;
            StepOutcome::from_rpc(step.kind, node_id, rpc, started)
        }
        StepKind::ToolExecution => {
            let mut req: ToolExecutionRequest =
                match serde_json::from_value(Value::Object(step.payload.clone())) {
                    Ok(req) => req,
                    Err(e) => {
                        let message = format!("Invalid tool payload: {}", e);
                        return StepOutcome::failed(step.kind, Some(node_id), message, started);
                    }
                };
            if let Some(output) = dependency_result(step, results, StepKind::Reasoning) {
                req.parameters.insert("input".to_string(), output.clone());
            }
            match client.execute_tool(&req).await {
                Ok(result) => StepOutcome::from_rpc(
                    step.kind,
                    node_id,
                    RpcResult::completed(result),
                    started,
                ),
                Err(e) => StepOutcome::failed(step.kind, Some(node_id), e.to_string(), started),
            }
        }
        StepKind::MemoryRead => {
            let query = step
                .payload
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let top_k = step
                .payload
                .get("top_k")
                .and_then(Value::as_u64)
                .unwrap_or(5) as usize;
            let rpc = client
                .memory_operation(&MemoryRequest::retrieve(query, top_k))
                .await;
            StepOutcome::from_rpc(step.kind, node_id, rpc, started)
        }
        StepKind::MemoryWrite => {
            let input = step.payload.get("input").cloned().unwrap_or(Value::Null);
            let output = dependency_result(step, results, StepKind::Reasoning)
                .cloned()
                .unwrap_or(Value::Null);
            let req = MemoryRequest::store(None, json!({ "input": input, "output": output }));
            let rpc = client.memory_operation(&req).await;
            StepOutcome::from_rpc(step.kind, node_id, rpc, started)
        }
    }
}

/// Result of the first successful dependency of the given kind.
fn dependency_result<'a>(
    step: &TaskStep,
    results: &'a BTreeMap<StepId, StepOutcome>,
    kind: StepKind,
) -> Option<&'a Value> {
    step.depends_on
        .iter()
        .filter_map(|d| results.get(d))
        .find(|o| o.kind == kind && o.is_success())
        .and_then(|o| o.result.as_ref())
}

/// Memory records come back either as `{input, output}` or wrapped in a
/// `{key, value, ..}` record.
fn context_from_memories(memories: &Value) -> Vec<ContextEntry> {
    let Some(items) = memories.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| item.get("value").unwrap_or(item))
        .filter_map(|v| serde_json::from_value::<ContextEntry>(v.clone()).ok())
        .filter(|entry| !entry.input.is_empty() || !entry.output.is_empty())
        .collect()
}

/// The `reasoning` result when usable, else the first usable result in
/// emission order, else [`COMPLETION_MARKER`].
fn final_response(plan: &Plan, results: &BTreeMap<StepId, StepOutcome>) -> Value {
    let reasoning = StepId::new(StepKind::Reasoning.as_str());
    if let Some(v) = results.get(&reasoning).and_then(StepOutcome::usable_result) {
        return v.clone();
    }
    plan.steps()
        .iter()
        .find_map(|s| results.get(&s.step_id).and_then(StepOutcome::usable_result))
        .cloned()
        .unwrap_or_else(|| Value::String(COMPLETION_MARKER.to_string()))
}
