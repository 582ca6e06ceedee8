//! The routing core: one value per CSMS instance owning every registry.

use crate::certificates::CertificateSigner;
use crate::channel::{CallContext, CallHandler, Channel, ConnectionInfo, OutgoingCall};
use crate::config::{ConfigError, CsmsConfig};
use crate::error::{CallError, result_code_of};
use crate::events::{
    ConnectionClosed, ConnectionOpened, CsmsEvents, RequestReceived, RequestSent,
    ResponseReceived, ResponseSent, elapsed,
};
use crate::inbound::{self, InboundHandler};
use crate::request_id::RequestIdGenerator;
use crate::routing::{NetworkingNodes, RoutingError};
use crate::signing::{SignaturePolicies, SignaturePolicy};
use crate::stations::ChargingStations;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use ocpp_protocol::{CsmsOperation, NodeId, RequestId};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const MODULE: &str = "csms";

/// An outbound call addressed to a networking node.
#[derive(Debug, Clone)]
pub struct Request<T> {
    pub destination: NodeId,
    pub payload: T,
    /// Overrides the configured default request timeout.
    pub timeout: Option<Duration>,
}

impl<T> Request<T> {
    pub fn new(destination: impl Into<NodeId>, payload: T) -> Self {
        Self {
            destination: destination.into(),
            payload,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct CsmsBuilder {
    config: CsmsConfig,
    policy: Option<Arc<dyn SignaturePolicy>>,
    certificate_signer: Option<Arc<dyn CertificateSigner>>,
}

impl CsmsBuilder {
    /// Replaces the policy built from `[signing]`.
    #[must_use]
    pub fn signature_policy(mut self, policy: Arc<dyn SignaturePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn certificate_signer(mut self, signer: Arc<dyn CertificateSigner>) -> Self {
        self.certificate_signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<Arc<Csms>, ConfigError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => Arc::new(self.config.signing.build_policy()?),
        };
        let config = self.config;
        Ok(Arc::new_cyclic(|me| Csms {
            id: NodeId::from(config.csms_id.as_str()),
            nodes: NetworkingNodes::new(),
            signatures: SignaturePolicies::new(policy),
            request_ids: RequestIdGenerator::new(),
            events: CsmsEvents::default(),
            stations: ChargingStations::new(config.protocol.station_lock_timeout),
            certificate_signer: self.certificate_signer,
            config,
            me: me.clone(),
        }))
    }
}

pub struct Csms {
    id: NodeId,
    config: CsmsConfig,
    nodes: NetworkingNodes,
    signatures: SignaturePolicies,
    request_ids: RequestIdGenerator,
    events: CsmsEvents,
    stations: ChargingStations,
    certificate_signer: Option<Arc<dyn CertificateSigner>>,
    me: Weak<Csms>,
}

impl Csms {
    pub fn builder(config: CsmsConfig) -> CsmsBuilder {
        CsmsBuilder {
            config,
            policy: None,
            certificate_signer: None,
        }
    }

    pub fn new(config: CsmsConfig) -> Result<Arc<Self>, ConfigError> {
        Self::builder(config).build()
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &CsmsConfig {
        &self.config
    }

    pub fn events(&self) -> &CsmsEvents {
        &self.events
    }

    pub fn stations(&self) -> &ChargingStations {
        &self.stations
    }

    pub fn signature_policies(&self) -> &SignaturePolicies {
        &self.signatures
    }

    pub fn networking_nodes(&self) -> &NetworkingNodes {
        &self.nodes
    }

    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next_request_id()
    }

    pub(crate) fn certificate_signer(&self) -> Option<&Arc<dyn CertificateSigner>> {
        self.certificate_signer.as_ref()
    }

    /// Strong handle to this instance, for work that outlives a call.
    pub(crate) fn handle(&self) -> Option<Arc<Csms>> {
        self.me.upgrade()
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    pub async fn register_connection(&self, node_id: NodeId, channel: &Arc<dyn Channel>) {
        self.nodes
            .register_connection(node_id, channel, Utc::now())
            .await;
    }

    pub async fn clear_all(&self) {
        self.nodes.clear_all().await;
    }

    pub async fn add_static_route(
        &self,
        destination: impl Into<NodeId>,
        hub: impl Into<NodeId>,
    ) -> Result<(), RoutingError> {
        self.nodes
            .add_static_route(destination.into(), hub.into())
            .await
    }

    pub async fn remove_static_route(
        &self,
        destination: &NodeId,
        hub: &NodeId,
    ) -> Result<(), RoutingError> {
        self.nodes.remove_static_route(destination, hub).await
    }

    pub async fn lookup_networking_node(&self, node_id: &NodeId) -> Option<Arc<dyn Channel>> {
        self.nodes.lookup(node_id).await
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Sends a CSMS-initiated call and waits for its typed response.
    ///
    /// Routing and signing failures come back as `Err` without anything
    /// being transmitted. Both event points fire on every path.
    pub async fn call<Op: CsmsOperation>(
        &self,
        request: Request<Op>,
    ) -> Result<Op::Response, CallError> {
        let request_id = self.request_ids.next_request_id();
        let sent_at = Utc::now();
        let encoded = serde_json::to_value(&request.payload)
            .map_err(|e| CallError::FormatViolation(e.to_string()));

        self.events
            .request_sent
            .notify(
                MODULE,
                Op::ACTION,
                &RequestSent {
                    timestamp: sent_at,
                    destination: request.destination.clone(),
                    request_id: request_id.clone(),
                    action: Op::ACTION,
                    payload: encoded.as_ref().cloned().unwrap_or(Value::Null),
                },
            )
            .await;

        let timeout = request
            .timeout
            .unwrap_or(self.config.protocol.default_request_timeout);
        let result = match encoded {
            Ok(payload) => {
                self.route_call(
                    Op::ACTION,
                    &request.destination,
                    request_id.clone(),
                    payload,
                    timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };
        let result = result.and_then(|payload| {
            serde_json::from_value::<Op::Response>(payload.clone())
                .map(|typed| (payload, typed))
                .map_err(|e| CallError::FormatViolation(e.to_string()))
        });

        let received_at = Utc::now();
        self.events
            .response_received
            .notify(
                MODULE,
                Op::ACTION,
                &ResponseReceived {
                    timestamp: received_at,
                    destination: request.destination.clone(),
                    request_id: request_id.clone(),
                    action: Op::ACTION,
                    result: result_code_of(&result),
                    runtime: elapsed(sent_at, received_at),
                    payload: result.as_ref().ok().map(|(payload, _)| payload.clone()),
                },
            )
            .await;

        match result {
            Ok((_, typed)) => Ok(typed),
            Err(e) => {
                warn!(
                    node_id = %request.destination,
                    action = Op::ACTION,
                    request_id = %request_id,
                    error = %e,
                    "outbound call failed"
                );
                Err(e)
            }
        }
    }

    async fn route_call(
        &self,
        action: &'static str,
        destination: &NodeId,
        request_id: RequestId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let channel = self
            .nodes
            .lookup(destination)
            .await
            .ok_or_else(|| CallError::UnknownOrUnreachable(destination.clone()))?;
        let payload = self.signatures.sign_request(action, payload)?;
        let response = channel
            .send_call(OutgoingCall {
                destination: destination.clone(),
                request_id,
                action,
                payload,
                timeout,
            })
            .await?;
        Ok(self.signatures.verify_response(action, response)?)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Runs one station-initiated call through verify, handle and sign.
    pub(crate) async fn process<Op: InboundHandler>(
        &self,
        ctx: CallContext,
        payload: Value,
    ) -> Result<Value, CallError> {
        self.events
            .request_received
            .notify(
                MODULE,
                Op::ACTION,
                &RequestReceived {
                    timestamp: ctx.timestamp,
                    sender: ctx.sender.clone(),
                    connection: ctx.connection.clone(),
                    request_id: ctx.request_id.clone(),
                    action: Op::ACTION,
                    payload: payload.clone(),
                },
            )
            .await;

        let result = self.respond::<Op>(&ctx, payload).await;
        if let Err(e) = &result {
            warn!(
                node_id = %ctx.sender,
                action = Op::ACTION,
                request_id = %ctx.request_id,
                error = %e,
                "inbound call rejected"
            );
        }

        let sent_at = Utc::now();
        self.events
            .response_sent
            .notify(
                MODULE,
                Op::ACTION,
                &ResponseSent {
                    timestamp: sent_at,
                    sender: ctx.sender.clone(),
                    request_id: ctx.request_id.clone(),
                    action: Op::ACTION,
                    result: result_code_of(&result),
                    runtime: elapsed(ctx.timestamp, sent_at),
                    payload: result.as_ref().ok().cloned(),
                },
            )
            .await;
        result
    }

    async fn respond<Op: InboundHandler>(
        &self,
        ctx: &CallContext,
        payload: Value,
    ) -> Result<Value, CallError> {
        let body = self.signatures.verify_request(Op::ACTION, payload)?;
        let request: Op = serde_json::from_value(body)
            .map_err(|e| CallError::FormatViolation(e.to_string()))?;
        let response = request.handle(self, ctx).await?;
        let encoded =
            serde_json::to_value(&response).map_err(|e| CallError::Generic(e.to_string()))?;
        Ok(self.signatures.sign_response(Op::ACTION, encoded)?)
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Returns how many channels accepted the entry.
    pub async fn add_or_update_http_basic_auth(&self, node_id: &NodeId, password: &str) -> usize {
        let channels = self.nodes.channels().await;
        let accepted = join_all(
            channels
                .iter()
                .map(|c| c.add_or_update_http_basic_auth(node_id, password)),
        )
        .await;
        accepted.into_iter().filter(|ok| *ok).count()
    }

    /// Returns how many channels removed an entry.
    pub async fn remove_http_basic_auth(&self, node_id: &NodeId) -> usize {
        let channels = self.nodes.channels().await;
        let removed = join_all(channels.iter().map(|c| c.remove_http_basic_auth(node_id))).await;
        removed.into_iter().filter(|ok| *ok).count()
    }

    pub async fn shutdown(&self, message: Option<&str>, wait: Duration) {
        let channels = self.nodes.channels().await;
        info!(channels = channels.len(), "shutting down station channels");
        join_all(channels.iter().map(|c| c.shutdown(message, wait))).await;
    }
}

#[async_trait]
impl CallHandler for Csms {
    async fn handle_call(
        &self,
        ctx: CallContext,
        action: &str,
        payload: Value,
    ) -> Result<Value, CallError> {
        inbound::dispatch(self, ctx, action, payload).await
    }

    async fn connection_opened(
        &self,
        node_id: NodeId,
        channel: Arc<dyn Channel>,
        connection: ConnectionInfo,
    ) {
        self.nodes
            .register_connection(node_id.clone(), &channel, connection.connected_at)
            .await;
        info!(node_id = %node_id, connection_id = %connection.connection_id, "networking node connected");
        self.events
            .connection_opened
            .notify(
                MODULE,
                "connection_opened",
                &ConnectionOpened {
                    timestamp: connection.connected_at,
                    node_id,
                    channel_id: channel.id().to_owned(),
                    connection,
                },
            )
            .await;
    }

    async fn connection_closed(&self, node_id: NodeId, connection: ConnectionInfo, reason: String) {
        debug!(node_id = %node_id, connection_id = %connection.connection_id, reason = %reason, "networking node disconnected");
        self.events
            .connection_closed
            .notify(
                MODULE,
                "connection_closed",
                &ConnectionClosed {
                    timestamp: Utc::now(),
                    node_id,
                    channel_id: connection.channel_id,
                    reason,
                },
            )
            .await;
    }
}
