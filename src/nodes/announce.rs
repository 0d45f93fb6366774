use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::NodeProfile;
use crate::client::OrchestratorClient;
use crate::error::ClientError;
use crate::protocol::Heartbeat;

/// Keeps a node registered with the orchestrator: registers, then
/// heartbeats with a fresh load sample every `interval`. Re-registers when
/// the orchestrator no longer knows the node.
pub struct NodeAnnouncer {
    client: OrchestratorClient,
    profile: Arc<NodeProfile>,
    interval: Duration,
}

impl NodeAnnouncer {
    pub fn new(client: OrchestratorClient, profile: Arc<NodeProfile>, interval: Duration) -> Self {
        Self {
            client,
            profile,
            interval,
        }
    }

    /// Run until `cancel` fires, then deregister.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut registered = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registered = self.tick(registered).await;
                    }
                }
            }

            if registered {
                if let Err(e) = self.client.deregister(&self.profile.node_id).await {
                    debug!("Deregistration of {} failed: {}", self.profile.node_id, e);
                }
            }
            debug!("Announcer for {} stopped", self.profile.node_id);
        })
    }

    /// One register-or-heartbeat attempt. Returns whether the node is
    /// registered afterwards.
    async fn tick(&self, registered: bool) -> bool {
        if !registered {
            let ok = self.client.register(&self.profile.registration()).await;
            if ok {
                info!(
                    "Registered {} node {} with orchestrator at {}",
                    self.profile.node_type,
                    self.profile.node_id,
                    self.client.address()
                );
            }
            return ok;
        }

        let beat = Heartbeat {
            node_id: self.profile.node_id.clone(),
            capabilities: self.profile.current_capabilities(),
        };
        match self.client.heartbeat(&beat).await {
            Ok(()) => true,
            Err(ClientError::Remote { status: 404, .. }) => {
                warn!(
                    "Orchestrator forgot node {}, registering again",
                    self.profile.node_id
                );
                false
            }
            Err(e) => {
                warn!("Heartbeat for {} failed: {}", self.profile.node_id, e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrchestratorService, create_router};
    use crate::client::NodeRpc;
    use crate::config::TaskmeshConfig;
    use crate::protocol::{NodeRegistration, NodeType};
    use crate::test_support::{FakeNode, FnConnector, spawn_router};
    use crate::types::NodeId;

    #[tokio::test]
    async fn test_announcer_registers_reregisters_and_deregisters() {
        let connector = Arc::new(FnConnector(|_: &NodeRegistration| {
            Arc::new(FakeNode::default()) as Arc<dyn NodeRpc>
        }));
        let service = Arc::new(OrchestratorService::new(&TaskmeshConfig::default(), connector));
        let addr = spawn_router(create_router(service.clone())).await;

        let profile = Arc::new(NodeProfile::new("mem-9", NodeType::Memory, "127.0.0.1:8003"));
        let client = OrchestratorClient::new(&addr.to_string(), Default::default());
        let cancel = CancellationToken::new();
        let handle = NodeAnnouncer::new(client, profile, Duration::from_millis(20))
            .spawn(cancel.clone());

        let id = NodeId::new("mem-9");
        wait_until_registered(&service, &id).await;

        // Dropped by the orchestrator: the next heartbeat gets a 404 and the
        // node registers again.
        service.registry().remove(&id).await.unwrap();
        wait_until_registered(&service, &id).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("announcer did not stop")
            .unwrap();
        assert!(service.registry().status(&id).await.is_none());
    }

    async fn wait_until_registered(service: &OrchestratorService, id: &NodeId) {
        for _ in 0..100 {
            if service.registry().status(id).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {} never registered", id);
    }
}
