//! Which channel reaches which networking node.
//!
//! Two tables: the registry (node id -> live channel) and the static route
//! table (destination -> hub). A lookup rewrites the destination through the
//! route table once and then consults the registry; there is no recursive
//! path resolution.

use crate::channel::Channel;
use chrono::{DateTime, Utc};
use ocpp_protocol::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("networking hub '{0}' has no live channel")]
    HubUnreachable(NodeId),
}

struct Registration {
    channel: Weak<dyn Channel>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct NetworkingNodes {
    registry: RwLock<HashMap<NodeId, Registration>>,
    routes: RwLock<HashMap<NodeId, NodeId>>,
}

impl NetworkingNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last writer wins: a reconnect replaces whatever was registered before.
    pub async fn register_connection(
        &self,
        node_id: NodeId,
        channel: &Arc<dyn Channel>,
        connected_at: DateTime<Utc>,
    ) {
        debug!(node_id = %node_id, channel = channel.id(), "registering networking node");
        self.registry.write().await.insert(
            node_id,
            Registration {
                channel: Arc::downgrade(channel),
                connected_at,
            },
        );
    }

    pub async fn clear_all(&self) {
        self.routes.write().await.clear();
        self.registry.write().await.clear();
    }

    /// Routes `destination` through `hub`. The hub must be live; otherwise
    /// nothing changes.
    pub async fn add_static_route(
        &self,
        destination: NodeId,
        hub: NodeId,
    ) -> Result<(), RoutingError> {
        let channel = self
            .live_channel(&hub)
            .await
            .ok_or_else(|| RoutingError::HubUnreachable(hub.clone()))?;
        self.routes
            .write()
            .await
            .insert(destination.clone(), hub.clone());
        channel.add_static_route(&destination, &hub).await;
        info!(destination = %destination, hub = %hub, "static route added");
        Ok(())
    }

    pub async fn remove_static_route(
        &self,
        destination: &NodeId,
        hub: &NodeId,
    ) -> Result<(), RoutingError> {
        let channel = self
            .live_channel(hub)
            .await
            .ok_or_else(|| RoutingError::HubUnreachable(hub.clone()))?;
        {
            let mut routes = self.routes.write().await;
            if routes.get(destination) == Some(hub) {
                routes.remove(destination);
            }
        }
        channel.remove_static_route(destination, hub).await;
        info!(destination = %destination, hub = %hub, "static route removed");
        Ok(())
    }

    /// Resolves a node id to the channel that can reach it.
    pub async fn lookup(&self, node_id: &NodeId) -> Option<Arc<dyn Channel>> {
        let target = self
            .routes
            .read()
            .await
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| node_id.clone());
        self.live_channel(&target).await
    }

    pub async fn static_route(&self, destination: &NodeId) -> Option<NodeId> {
        self.routes.read().await.get(destination).cloned()
    }

    pub async fn connected_at(&self, node_id: &NodeId) -> Option<DateTime<Utc>> {
        self.registry
            .read()
            .await
            .get(node_id)
            .map(|r| r.connected_at)
    }

    pub async fn registered_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.registry.read().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Every distinct live channel, once each.
    pub async fn channels(&self) -> Vec<Arc<dyn Channel>> {
        let registry = self.registry.read().await;
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
        for channel in registry.values().filter_map(|r| r.channel.upgrade()) {
            if !channels.iter().any(|c| c.id() == channel.id()) {
                channels.push(channel);
            }
        }
        channels
    }

    async fn live_channel(&self, node_id: &NodeId) -> Option<Arc<dyn Channel>> {
        self.registry
            .read()
            .await
            .get(node_id)
            .and_then(|r| r.channel.upgrade())
    }
}
