//! Memory node: a bounded in-process store of past interactions, ranked by
//! term overlap with the query.

use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{NodeProfile, shared_routes, with_layers};
use crate::api::ApiJson;
use crate::error::ApiError;
use crate::protocol::{JsonObject, MemoryOperation, MemoryRequest, MemoryResponse};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    #[serde(skip)]
    terms: HashSet<String>,
}

/// One retrieval hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub key: String,
    pub value: Value,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    pub memory_items: usize,
    pub capacity: usize,
    pub total_stored: u64,
    pub evicted: u64,
}

#[derive(Default)]
struct Inner {
    records: VecDeque<MemoryRecord>,
    total_stored: u64,
    evicted: u64,
}

/// Oldest records are evicted once `capacity` is reached.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Store `value` under `key` (generated when absent). Returns the key.
    pub async fn store(&self, key: Option<String>, value: Value) -> String {
        let key = key.unwrap_or_else(|| format!("mem-{}", uuid::Uuid::new_v4()));
        let record = MemoryRecord {
            key: key.clone(),
            terms: terms(&searchable_text(&value)),
            value,
            stored_at: Utc::now(),
        };

        let mut inner = self.inner.write().await;
        while inner.records.len() >= self.capacity {
            inner.records.pop_front();
            inner.evicted += 1;
        }
        inner.records.push_back(record);
        inner.total_stored += 1;
        key
    }

    /// Replace the newest record with `key`. Returns false when none exists.
    pub async fn update(&self, key: &str, value: Value) -> bool {
        let mut inner = self.inner.write().await;
        match inner.records.iter_mut().rev().find(|r| r.key == key) {
            Some(record) => {
                record.terms = terms(&searchable_text(&value));
                record.value = value;
                record.stored_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Up to `top_k` records sharing terms with `query`, best first. Newer
    /// records win ties.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Vec<ScoredMemory> {
        let wanted = terms(query);
        if wanted.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let inner = self.inner.read().await;
        let mut hits: Vec<(usize, f64)> = inner
            .records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                let overlap = wanted.intersection(&r.terms).count();
                (overlap > 0).then(|| (i, overlap as f64 / wanted.len() as f64))
            })
            .collect();

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        hits.truncate(top_k);

        hits.into_iter()
            .map(|(i, score)| {
                let record = &inner.records[i];
                ScoredMemory {
                    key: record.key.clone(),
                    value: record.value.clone(),
                    score,
                }
            })
            .collect()
    }

    pub async fn stats(&self) -> MemoryStats {
        let inner = self.inner.read().await;
        MemoryStats {
            memory_items: inner.records.len(),
            capacity: self.capacity,
            total_stored: inner.total_stored,
            evicted: inner.evicted,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Interactions are indexed by their input and output; anything else by
/// its JSON text.
fn searchable_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) if map.contains_key("input") || map.contains_key("output") => {
            ["input", "output"]
                .iter()
                .filter_map(|k| map.get(*k))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        }
        other => other.to_string(),
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn memory_router(profile: Arc<NodeProfile>, store: Arc<MemoryStore>) -> Router {
    let mut extra = JsonObject::new();
    extra.insert("memory_types".into(), json!(["episodic"]));
    extra.insert("capacity".into(), json!(store.capacity));

    let routes = Router::new()
        .route("/memory", post(memory_operation))
        .route("/memory/stats", get(stats))
        .with_state(store);

    with_layers(routes.merge(shared_routes(profile, extra)))
}

fn require_query(req: &MemoryRequest) -> Result<&str, ApiError> {
    req.query
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "Query required for {} operation",
                req.operation.as_str()
            ))
        })
}

async fn memory_operation(
    State(store): State<Arc<MemoryStore>>,
    ApiJson(req): ApiJson<MemoryRequest>,
) -> Result<Json<MemoryResponse>, ApiError> {
    let result = match req.operation {
        MemoryOperation::Store => {
            let value = req.value.clone().unwrap_or(Value::Null);
            let key = store.store(req.key.clone(), value).await;
            json!({ "status": "stored", "key": key })
        }
        MemoryOperation::Retrieve | MemoryOperation::Query => {
            let query = require_query(&req)?;
            let hits = store.retrieve(query, req.top_k).await;
            debug!("{} memories matched", hits.len());
            json!(hits)
        }
        MemoryOperation::Update => {
            let key = req.key.clone().ok_or_else(|| {
                ApiError::BadRequest("Key required for update operation".to_string())
            })?;
            let value = req.value.clone().unwrap_or(Value::Null);
            let status = if store.update(&key, value).await {
                "updated"
            } else {
                "not_found"
            };
            json!({ "status": status, "key": key })
        }
    };

    info!("Memory operation '{}' completed", req.operation.as_str());
    Ok(Json(MemoryResponse {
        result,
        operation: req.operation,
    }))
}

async fn stats(State(store): State<Arc<MemoryStore>>) -> Json<MemoryStats> {
    Json(store.stats().await)
}
