//! Stateless reasoning node: builds a prompt from the request and its
//! context, then hands it to a [`ReasoningBackend`].

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{Router, extract::State, response::Json, routing::post};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{NodeProfile, shared_routes, with_layers};
use crate::api::ApiJson;
use crate::error::ApiError;
use crate::protocol::{ContextEntry, JsonObject, ReasoningRequest, ReasoningResponse};

/// Prompts longer than this are cut down to their head and tail.
pub const MAX_PROMPT_CHARS: usize = 4000;
const PROMPT_KEEP_CHARS: usize = 2000;

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Model name reported back to callers.
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str, request: &ReasoningRequest) -> Result<String>;
}

/// Deterministic backend for tests and offline runs.
pub struct EchoBackend;

#[async_trait]
impl ReasoningBackend for EchoBackend {
    fn model(&self) -> &str {
        "echo"
    }

    async fn generate(&self, _prompt: &str, request: &ReasoningRequest) -> Result<String> {
        Ok(format!("echo: {}", request.prompt))
    }
}

/// Backend calling an Ollama server's `/api/generate`.
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReasoningBackend for OllamaBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, request: &ReasoningRequest) -> Result<String> {
        let model = request.model_preference.as_deref().unwrap_or(&self.model);
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens
            }
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("Failed to reach Ollama")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama returned {}: {}", status, text));
        }

        let value: Value = response.json().await.context("Invalid Ollama response")?;
        value
            .get("response")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow!("Ollama response has no `response` field"))
    }
}

/// Fold remembered interactions in front of the request.
pub fn build_prompt(prompt: &str, context: &[ContextEntry]) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }

    let context_str = context
        .iter()
        .map(|c| format!("Input: {}\nOutput: {}", c.input, c.output))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Context from memory:\n{}\n\nUser request:\n{}\n\nPlease provide a helpful response based on the context and request above.",
        context_str, prompt
    )
}

/// Keep the first and last 2000 characters of prompts over the limit.
pub fn truncate_prompt(prompt: &str) -> String {
    let total = prompt.chars().count();
    if total <= MAX_PROMPT_CHARS {
        return prompt.to_string();
    }

    let head: String = prompt.chars().take(PROMPT_KEEP_CHARS).collect();
    let tail: String = prompt.chars().skip(total - PROMPT_KEEP_CHARS).collect();
    format!("{} [...] {}", head, tail)
}

#[derive(Clone)]
struct ReasoningState {
    profile: Arc<NodeProfile>,
    backend: Arc<dyn ReasoningBackend>,
}

pub fn reasoning_router(profile: Arc<NodeProfile>, backend: Arc<dyn ReasoningBackend>) -> Router {
    let mut extra = JsonObject::new();
    extra.insert("model".into(), json!(backend.model()));

    let routes = Router::new()
        .route("/reason", post(reason))
        .with_state(ReasoningState {
            profile: profile.clone(),
            backend,
        });

    with_layers(routes.merge(shared_routes(profile, extra)))
}

async fn reason(
    State(state): State<ReasoningState>,
    ApiJson(req): ApiJson<ReasoningRequest>,
) -> Result<Json<ReasoningResponse>, ApiError> {
    let prompt = build_prompt(&req.prompt, &req.context);
    let prompt = truncate_prompt(&prompt);
    debug!("Reasoning over {} chars of prompt", prompt.chars().count());

    let response = state
        .backend
        .generate(&prompt, &req)
        .await
        .map_err(|e| {
            error!("Reasoning error: {:#}", e);
            ApiError::Internal(format!("{:#}", e))
        })?;

    info!(
        "Generated response for prompt: {}",
        req.prompt.chars().take(50).collect::<String>()
    );

    Ok(Json(ReasoningResponse {
        response,
        model: req
            .model_preference
            .clone()
            .unwrap_or_else(|| state.backend.model().to_string()),
        specializations: state.profile.specializations.iter().cloned().collect(),
    }))
}
