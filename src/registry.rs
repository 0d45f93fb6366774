//! Bookkeeping of registered worker nodes and the routing policy.
//!
//! The registry owns one client handle per node. All state sits behind a
//! single `RwLock`, so concurrent scheduler rounds see a consistent view.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{NodeConnector, NodeRpc};
use crate::error::RegistryError;
use crate::protocol::{HardwareCapabilities, NodeRegistration, NodeType};
use crate::types::NodeId;

struct RegisteredNode {
    registration: NodeRegistration,
    client: Arc<dyn NodeRpc>,
    /// Result of the last health check. Unreachable nodes are never selected.
    reachable: bool,
    registered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl RegisteredNode {
    fn is_candidate(&self, node_type: NodeType, specialization: Option<&str>) -> bool {
        self.registration.node_type == node_type
            && self.registration.capabilities.available
            && self.reachable
            && specialization.is_none_or(|s| self.registration.specializations.contains(s))
    }
}

/// Read-only view of one node's bookkeeping.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub registration: NodeRegistration,
    pub reachable: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Summary of one health sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSweep {
    pub healthy: Vec<NodeId>,
    pub unreachable: Vec<NodeId>,
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, RegisteredNode>>,
    connector: Arc<dyn NodeConnector>,
}

impl NodeRegistry {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            connector,
        }
    }

    /// Add or replace a node. The last registration for a node_id wins and
    /// gets a fresh client handle.
    pub async fn register(&self, registration: NodeRegistration) -> Result<(), RegistryError> {
        registration
            .validate()
            .map_err(RegistryError::InvalidRegistration)?;

        let client = self.connector.connect(&registration);
        let now = Utc::now();
        let node_id = registration.node_id.clone();

        let mut nodes = self.nodes.write().await;
        let registered_at = nodes
            .get(&node_id)
            .map(|existing| existing.registered_at)
            .unwrap_or(now);

        info!(
            "Registered {} node: {} at {}",
            registration.node_type, node_id, registration.address
        );

        nodes.insert(
            node_id,
            RegisteredNode {
                registration,
                client,
                reachable: true,
                registered_at,
                last_seen: now,
            },
        );
        Ok(())
    }

    /// Refresh a node's advertised capabilities.
    pub async fn heartbeat(
        &self,
        node_id: &NodeId,
        capabilities: HardwareCapabilities,
    ) -> Result<(), RegistryError> {
        capabilities
            .validate()
            .map_err(RegistryError::InvalidRegistration)?;

        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.clone()))?;

        debug!(
            "Heartbeat from {}: load {:.2}, available {}",
            node_id, capabilities.current_load, capabilities.available
        );
        node.registration.capabilities = capabilities;
        node.reachable = true;
        node.last_seen = Utc::now();
        Ok(())
    }

    pub async fn remove(&self, node_id: &NodeId) -> Result<NodeRegistration, RegistryError> {
        let removed = self
            .nodes
            .write()
            .await
            .remove(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.clone()))?;
        info!("Deregistered node {}", node_id);
        Ok(removed.registration)
    }

    /// Snapshot of every registration, ordered by node_id.
    pub async fn list(&self) -> Vec<NodeRegistration> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<NodeRegistration> =
            nodes.values().map(|n| n.registration.clone()).collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub async fn status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).map(|n| NodeStatus {
            registration: n.registration.clone(),
            reachable: n.reachable,
            registered_at: n.registered_at,
            last_seen: n.last_seen,
        })
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Pick the least-loaded available node of `node_type`, optionally
    /// restricted to nodes carrying `specialization`. Ties go to the
    /// lexicographically smallest node_id.
    pub async fn select(
        &self,
        node_type: NodeType,
        specialization: Option<&str>,
    ) -> Option<NodeId> {
        self.route(node_type, specialization)
            .await
            .map(|(node_id, _)| node_id)
    }

    /// Like [`NodeRegistry::select`] but also hands back the client handle,
    /// read under the same lock.
    pub async fn route(
        &self,
        node_type: NodeType,
        specialization: Option<&str>,
    ) -> Option<(NodeId, Arc<dyn NodeRpc>)> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.is_candidate(node_type, specialization))
            .min_by(|a, b| {
                let (ra, rb) = (&a.registration, &b.registration);
                ra.capabilities
                    .current_load
                    .total_cmp(&rb.capabilities.current_load)
                    .then_with(|| ra.node_id.cmp(&rb.node_id))
            })
            .map(|n| (n.registration.node_id.clone(), n.client.clone()))
    }

    pub async fn client(&self, node_id: &NodeId) -> Option<Arc<dyn NodeRpc>> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .map(|n| n.client.clone())
    }

    /// Health-check every node concurrently and record reachability.
    pub async fn check_health(&self) -> HealthSweep {
        let targets: Vec<(NodeId, Arc<dyn NodeRpc>)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .map(|n| (n.registration.node_id.clone(), n.client.clone()))
                .collect()
        };

        let checks = targets.into_iter().map(|(node_id, client)| async move {
            let alive = client.health_check().await;
            (node_id, client, alive)
        });
        let results = join_all(checks).await;

        let mut sweep = HealthSweep::default();
        let mut nodes = self.nodes.write().await;
        for (node_id, client, alive) in results {
            // Skip nodes that were removed or re-registered mid-sweep.
            let Some(node) = nodes.get_mut(&node_id) else {
                continue;
            };
            if !Arc::ptr_eq(&node.client, &client) {
                continue;
            }

            if alive {
                if !node.reachable {
                    info!("Node {} is reachable again", node_id);
                }
                node.reachable = true;
                node.last_seen = Utc::now();
                sweep.healthy.push(node_id);
            } else {
                if node.reachable {
                    warn!("Node {} is unreachable, excluding it from routing", node_id);
                }
                node.reachable = false;
                sweep.unreachable.push(node_id);
            }
        }

        sweep.healthy.sort();
        sweep.unreachable.sort();
        sweep
    }
}

/// Periodic health sweep over a registry, stopped through a cancellation token.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<NodeRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sweep = self.registry.check_health().await;
                        debug!(
                            "Health sweep: {} healthy, {} unreachable",
                            sweep.healthy.len(),
                            sweep.unreachable.len()
                        );
                    }
                }
            }
        })
    }
}
