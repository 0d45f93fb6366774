//! Turns a raw request into an intent tag and a DAG of typed steps.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::DecomposerConfig;
use crate::error::PlanError;
use crate::protocol::{ContextEntry, JsonObject, NodeType, StepKind};
use crate::types::StepId;

/// Coarse category of a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Coding,
    Research,
    FileOperation,
    MlTraining,
    Automation,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Coding => "coding",
            Intent::Research => "research",
            Intent::FileOperation => "file_operation",
            Intent::MlTraining => "ml_training",
            Intent::Automation => "automation",
            Intent::General => "general",
        }
    }

    /// Capability tags a plan for this intent asks for.
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        let tags: &[&str] = match self {
            Intent::MlTraining => &["gpu", "high_memory"],
            Intent::Coding => &["cpu", "medium_memory"],
            Intent::Research => &["cpu", "network"],
            _ => &[],
        };
        tags.iter().map(|t| t.to_string()).collect()
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps request text to an intent.
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> Intent;
}

/// Lower-cased substring matching against an ordered rule table. The first
/// rule with a matching keyword wins.
pub struct KeywordClassifier {
    rules: Vec<(Intent, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<(Intent, Vec<String>)>) -> Self {
        Self { rules }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let table: [(Intent, &[&str]); 4] = [
            (
                Intent::Coding,
                &["code", "write", "create", "build", "script", "function"],
            ),
            (
                Intent::Research,
                &["search", "find", "research", "look up", "what is"],
            ),
            (
                Intent::FileOperation,
                &["file", "read", "write", "delete", "list"],
            ),
            (
                Intent::MlTraining,
                &["train", "model", "ml", "machine learning"],
            ),
        ];

        Self::new(
            table
                .iter()
                .map(|(intent, words)| (*intent, words.iter().map(|w| w.to_string()).collect()))
                .collect(),
        )
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intent {
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .find(|(_, words)| words.iter().any(|w| lowered.contains(w.as_str())))
            .map(|(intent, _)| *intent)
            .unwrap_or(Intent::General)
    }
}

/// One unit of work routed to a single node type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStep {
    pub step_id: StepId,
    pub kind: StepKind,
    pub target_node_type: NodeType,
    pub payload: JsonObject,
    pub depends_on: BTreeSet<StepId>,
    /// Restricts routing to nodes carrying this tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
}

impl TaskStep {
    pub fn new(step_id: impl Into<StepId>, kind: StepKind, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => JsonObject::new(),
        };
        Self {
            step_id: step_id.into(),
            kind,
            target_node_type: kind.node_type(),
            payload,
            depends_on: BTreeSet::new(),
            specialization: None,
        }
    }

    pub fn depends_on(mut self, step_id: &StepId) -> Self {
        self.depends_on.insert(step_id.clone());
        self
    }

    pub fn with_specialization(mut self, tag: impl Into<String>) -> Self {
        self.specialization = Some(tag.into());
        self
    }
}

/// Validated step DAG for one request. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    intent: Intent,
    steps: Vec<TaskStep>,
    required_capabilities: BTreeSet<String>,
}

impl Plan {
    /// Build a plan, rejecting duplicate ids, dangling dependencies and cycles.
    pub fn new(
        intent: Intent,
        steps: Vec<TaskStep>,
        required_capabilities: BTreeSet<String>,
    ) -> Result<Self, PlanError> {
        let mut graph: DiGraph<StepId, ()> = DiGraph::new();
        let mut index: HashMap<&StepId, NodeIndex> = HashMap::new();

        for step in &steps {
            if index.contains_key(&step.step_id) {
                return Err(PlanError::DuplicateStep(step.step_id.clone()));
            }
            index.insert(&step.step_id, graph.add_node(step.step_id.clone()));
        }

        for step in &steps {
            let to = index[&step.step_id];
            for dep in &step.depends_on {
                let from = index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    step: step.step_id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| PlanError::Cycle(graph[cycle.node_id()].clone()))?;

        Ok(Self {
            intent,
            steps,
            required_capabilities,
        })
    }

    /// Skip validation. Lets scheduler tests feed it a broken graph.
    #[cfg(test)]
    pub(crate) fn unchecked(intent: Intent, steps: Vec<TaskStep>) -> Self {
        Self {
            intent,
            steps,
            required_capabilities: BTreeSet::new(),
        }
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Steps in emission order.
    pub fn steps(&self) -> &[TaskStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.step_id.as_str() == step_id)
    }

    pub fn required_capabilities(&self) -> &BTreeSet<String> {
        &self.required_capabilities
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct TaskDecomposer {
    config: DecomposerConfig,
    classifier: Box<dyn Classifier>,
}

impl TaskDecomposer {
    pub fn new(config: DecomposerConfig) -> Self {
        Self::with_classifier(config, Box::new(KeywordClassifier::default()))
    }

    pub fn with_classifier(config: DecomposerConfig, classifier: Box<dyn Classifier>) -> Self {
        Self { config, classifier }
    }

    pub fn classify(&self, text: &str) -> Intent {
        self.classifier.classify(text)
    }

    /// Steps are emitted as memory_read, reasoning, tool_execution,
    /// memory_write, and each one only depends on steps emitted before it.
    pub fn decompose(&self, text: &str, context: &[ContextEntry]) -> Result<Plan, PlanError> {
        let intent = self.classify(text);
        let mut steps = Vec::with_capacity(4);

        let memory_read = StepId::new(StepKind::MemoryRead.as_str());
        if context.is_empty() {
            steps.push(TaskStep::new(
                memory_read.clone(),
                StepKind::MemoryRead,
                json!({ "query": text, "top_k": self.config.memory_top_k }),
            ));
        }

        let reasoning = StepId::new(StepKind::Reasoning.as_str());
        let mut reasoning_step = TaskStep::new(
            reasoning.clone(),
            StepKind::Reasoning,
            json!({ "prompt": text, "context": context }),
        );
        if context.is_empty() {
            reasoning_step = reasoning_step.depends_on(&memory_read);
        }
        steps.push(reasoning_step);

        if self.config.requires_tools.contains(&intent) {
            let tool_name = self
                .config
                .tool_for_intent
                .get(&intent)
                .cloned()
                .unwrap_or_else(|| intent.as_str().to_string());
            steps.push(
                TaskStep::new(
                    StepKind::ToolExecution.as_str(),
                    StepKind::ToolExecution,
                    json!({
                        "intent": intent,
                        "tool_name": tool_name,
                        "action": "execute",
                        "parameters": {}
                    }),
                )
                .depends_on(&reasoning),
            );
        }

        steps.push(
            TaskStep::new(
                StepKind::MemoryWrite.as_str(),
                StepKind::MemoryWrite,
                json!({ "input": text }),
            )
            .depends_on(&reasoning),
        );

        debug!("Decomposed request as {} into {} steps", intent, steps.len());
        Plan::new(intent, steps, intent.required_capabilities())
    }
}
