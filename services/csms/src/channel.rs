//! Seams between the routing core and the transport.
//!
//! A [`Channel`] is one live transport endpoint that can reach one or more
//! networking nodes. A [`CallHandler`] is what the transport hands inbound
//! calls and connection lifecycle to.

use crate::error::CallError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocpp_protocol::{NodeId, RequestId};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Where a station connection came from.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Unique per connection; changes on every reconnect.
    pub connection_id: String,
    pub channel_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

/// A signed CSMS-initiated call ready for the wire.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    pub destination: NodeId,
    pub request_id: RequestId,
    pub action: &'static str,
    pub payload: Value,
    pub timeout: Duration,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    /// Sends a call and waits for the correlated CALLRESULT payload.
    ///
    /// Correlation and timeout enforcement belong to the channel. A
    /// CALLERROR answer is returned as [`CallError::Remote`].
    async fn send_call(&self, call: OutgoingCall) -> Result<Value, CallError>;

    /// Nodes with a live connection on this channel.
    async fn connected_node_ids(&self) -> Vec<NodeId>;

    async fn add_static_route(&self, destination: &NodeId, hub: &NodeId);

    async fn remove_static_route(&self, destination: &NodeId, hub: &NodeId);

    /// Returns `false` if the channel has no HTTP Basic Auth gate.
    async fn add_or_update_http_basic_auth(&self, _node_id: &NodeId, _password: &str) -> bool {
        false
    }

    /// Returns `false` if the channel has no HTTP Basic Auth gate or the
    /// node had no entry.
    async fn remove_http_basic_auth(&self, _node_id: &NodeId) -> bool {
        false
    }

    /// Closes every connection, optionally telling peers why, and waits up
    /// to `wait` for sessions to finish.
    async fn shutdown(&self, message: Option<&str>, wait: Duration);
}

/// Per-call metadata for an inbound call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub timestamp: DateTime<Utc>,
    /// The node that originated the call, which is not necessarily the
    /// node whose connection delivered it.
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub request_id: RequestId,
}

#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Computes the (already signed) response payload for an inbound call.
    async fn handle_call(
        &self,
        ctx: CallContext,
        action: &str,
        payload: Value,
    ) -> Result<Value, CallError>;

    async fn connection_opened(
        &self,
        node_id: NodeId,
        channel: Arc<dyn Channel>,
        connection: ConnectionInfo,
    );

    async fn connection_closed(&self, node_id: NodeId, connection: ConnectionInfo, reason: String);
}
