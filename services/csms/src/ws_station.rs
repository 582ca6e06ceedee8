//! WebSocket endpoint for charging stations and networking hubs.
//!
//! One [`StationServer`] is one [`Channel`]: every station session connected
//! to it is reachable through it. Each session runs a select loop over socket
//! reads, outbound commands and replies produced by spawned handler tasks.

use crate::auth::{BasicAuthTable, extract_basic};
use crate::channel::{CallContext, CallHandler, Channel, ConnectionInfo, OutgoingCall};
use crate::error::CallError;
use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use ocpp_protocol::{
    CallErrorFrame, CallFrame, CallResultFrame, Frame, FrameError, NodeId, RequestId, Routing,
    error_codes,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const OCPP_SUBPROTOCOLS: [&str; 2] = ["ocpp2.1", "ocpp2.0.1"];
const COMMAND_QUEUE: usize = 32;
const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;

type PendingReply = oneshot::Sender<Result<Value, CallError>>;

enum SessionCommand {
    Call { frame: CallFrame, reply: PendingReply },
    Forget(RequestId),
    Close { code: u16, reason: String },
}

struct SessionHandle {
    connection_id: String,
    commands: mpsc::Sender<SessionCommand>,
}

pub struct StationServerOptions {
    pub id: String,
    pub require_basic_auth: bool,
    pub session_timeout: Duration,
}

impl Default for StationServerOptions {
    fn default() -> Self {
        Self {
            id: "stations".to_owned(),
            require_basic_auth: false,
            session_timeout: Duration::from_secs(600),
        }
    }
}

pub struct StationServer {
    id: String,
    handler: Arc<dyn CallHandler>,
    sessions: RwLock<HashMap<NodeId, SessionHandle>>,
    /// destination -> hub, mirrored from the core's route table.
    routes: RwLock<HashMap<NodeId, NodeId>>,
    auth: BasicAuthTable,
    require_basic_auth: bool,
    session_timeout: Duration,
    shutting_down: AtomicBool,
    session_ended: Notify,
}

impl StationServer {
    pub fn new(handler: Arc<dyn CallHandler>, options: StationServerOptions) -> Arc<Self> {
        Arc::new(Self {
            id: options.id,
            handler,
            sessions: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            auth: BasicAuthTable::new(),
            require_basic_auth: options.require_basic_auth,
            session_timeout: options.session_timeout,
            shutting_down: AtomicBool::new(false),
            session_ended: Notify::new(),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ocpp/{node_id}", get(ws_station_handler))
            .route("/healthz", get(healthz))
            .with_state(Arc::clone(self))
    }

    /// Serves the router until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn authorize(&self, node_id: &NodeId, headers: &HeaderMap) -> bool {
        if !self.require_basic_auth {
            return true;
        }
        let Some((user, password)) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_basic)
        else {
            return false;
        };
        user == node_id.as_str() && self.auth.verify(node_id, &password).await
    }

    /// Returns the session for `node_id`, following the mirrored route table
    /// once. The second element is the routing element to attach.
    async fn session_for(&self, destination: &NodeId) -> Option<(mpsc::Sender<SessionCommand>, Option<Routing>)> {
        let hub = self.routes.read().await.get(destination).cloned();
        let (target, routing) = match hub {
            Some(hub) if hub != *destination => (
                hub,
                Some(Routing {
                    source: None,
                    destination: Some(destination.clone()),
                }),
            ),
            _ => (destination.clone(), None),
        };
        let sessions = self.sessions.read().await;
        sessions
            .get(&target)
            .map(|session| (session.commands.clone(), routing))
    }

    async fn run_session(
        self: Arc<Self>,
        mut socket: WebSocket,
        node_id: NodeId,
        remote_addr: SocketAddr,
    ) {
        let connection = ConnectionInfo {
            connection_id: Uuid::new_v4().to_string(),
            channel_id: self.id.clone(),
            remote_addr: Some(remote_addr),
            connected_at: Utc::now(),
        };
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(COMMAND_QUEUE);
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(COMMAND_QUEUE);

        let replaced = self.sessions.write().await.insert(
            node_id.clone(),
            SessionHandle {
                connection_id: connection.connection_id.clone(),
                commands: cmd_tx,
            },
        );
        if let Some(old) = replaced {
            info!(node_id = %node_id, old_connection = %old.connection_id, "replacing existing session");
            let _ = old
                .commands
                .send(SessionCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "replaced by a new connection".to_owned(),
                })
                .await;
        }

        let channel: Arc<dyn Channel> = Arc::clone(&self) as Arc<dyn Channel>;
        self.handler
            .connection_opened(node_id.clone(), channel, connection.clone())
            .await;

        let mut pending: HashMap<RequestId, PendingReply> = HashMap::new();
        let mut last_received = Instant::now();
        let reason = loop {
            tokio::select! {
                msg = socket.recv() => {
                    if matches!(msg, Some(Ok(_))) {
                        last_received = Instant::now();
                    }
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Some(answer) = self.on_text(
                                text.as_str(),
                                &node_id,
                                &connection,
                                &reply_tx,
                                &mut pending,
                            ) else {
                                continue;
                            };
                            if socket.send(Message::Text(answer.into())).await.is_err() {
                                break "send failed".to_owned();
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!(node_id = %node_id, "binary frame ignored");
                        }
                        // Pongs are queued by the websocket layer.
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break "closed by peer".to_owned(),
                        Some(Err(e)) => break format!("websocket error: {e}"),
                    }
                }
                () = tokio::time::sleep_until(last_received + self.session_timeout) => {
                    break "session timeout".to_owned();
                }
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        SessionCommand::Call { frame, reply } => {
                            let message_id = frame.message_id.clone();
                            let text = Frame::Call(frame).to_text();
                            if socket.send(Message::Text(text.into())).await.is_err() {
                                let _ = reply.send(Err(CallError::UnknownOrUnreachable(node_id.clone())));
                                break "send failed".to_owned();
                            }
                            pending.insert(message_id, reply);
                        }
                        SessionCommand::Forget(message_id) => {
                            pending.remove(&message_id);
                        }
                        SessionCommand::Close { code, reason } => {
                            let _ = socket
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.clone().into(),
                                })))
                                .await;
                            break reason;
                        }
                    }
                }
                Some(text) = reply_rx.recv() => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break "send failed".to_owned();
                    }
                }
            }
        };

        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(CallError::Generic(format!(
                "connection to '{node_id}' closed before a response arrived"
            ))));
        }
        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(&node_id)
                .is_some_and(|s| s.connection_id == connection.connection_id)
            {
                sessions.remove(&node_id);
            }
        }
        info!(node_id = %node_id, connection_id = %connection.connection_id, reason = %reason, "station session ended");
        self.handler
            .connection_closed(node_id, connection, reason)
            .await;
        self.session_ended.notify_waiters();
    }

    /// Handles one text frame. Calls are answered from a spawned task through
    /// `replies`; a CALLERROR for a malformed frame is returned for the
    /// session loop to send.
    fn on_text(
        self: &Arc<Self>,
        text: &str,
        node_id: &NodeId,
        connection: &ConnectionInfo,
        replies: &mpsc::Sender<String>,
        pending: &mut HashMap<RequestId, PendingReply>,
    ) -> Option<String> {
        match Frame::parse(text) {
            Ok(Frame::Call(call)) => {
                let server = Arc::clone(self);
                let node_id = node_id.clone();
                let connection = connection.clone();
                let replies = replies.clone();
                tokio::spawn(async move {
                    let message_id = call.message_id.clone();
                    let result = match server.sender_of(&node_id, call.routing.as_ref()).await {
                        Ok(sender) => {
                            let ctx = CallContext {
                                timestamp: Utc::now(),
                                sender,
                                connection,
                                request_id: call.message_id,
                            };
                            server.handler.handle_call(ctx, &call.action, call.payload).await
                        }
                        Err(e) => Err(e),
                    };
                    let frame = match result {
                        Ok(payload) => Frame::CallResult(CallResultFrame { message_id, payload }),
                        Err(e) => Frame::CallError(CallErrorFrame {
                            message_id,
                            code: e.error_code().to_owned(),
                            description: e.to_string(),
                            details: json!({}),
                        }),
                    };
                    if replies.send(frame.to_text()).await.is_err() {
                        debug!(node_id = %node_id, "session ended before reply was sent");
                    }
                });
                None
            }
            Ok(Frame::CallResult(result)) => {
                match pending.remove(&result.message_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(result.payload));
                    }
                    None => {
                        debug!(node_id = %node_id, message_id = %result.message_id, "response for unknown or expired call");
                    }
                }
                None
            }
            Ok(Frame::CallError(error)) => {
                match pending.remove(&error.message_id) {
                    Some(reply) => {
                        let _ = reply.send(Err(CallError::Remote {
                            code: error.code,
                            description: error.description,
                        }));
                    }
                    None => {
                        debug!(node_id = %node_id, message_id = %error.message_id, "error for unknown or expired call");
                    }
                }
                None
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "malformed frame");
                let message_id = message_id_of(text)?;
                let code = match &e {
                    FrameError::UnsupportedMessageType(_) => error_codes::MESSAGE_TYPE_NOT_SUPPORTED,
                    _ => error_codes::FORMAT_VIOLATION,
                };
                let frame = Frame::CallError(CallErrorFrame {
                    message_id,
                    code: code.to_owned(),
                    description: e.to_string(),
                    details: json!({}),
                });
                Some(frame.to_text())
            }
        }
    }

    /// The node a call was sent by. A `source` routing element is honoured
    /// only when that node is routed through the connection it arrived on.
    async fn sender_of(&self, node_id: &NodeId, routing: Option<&Routing>) -> Result<NodeId, CallError> {
        let Some(source) = routing.and_then(|r| r.source.as_ref()) else {
            return Ok(node_id.clone());
        };
        if source == node_id {
            return Ok(node_id.clone());
        }
        if self.routes.read().await.get(source) == Some(node_id) {
            Ok(source.clone())
        } else {
            warn!(node_id = %node_id, source = %source, "call with unrouted source rejected");
            Err(CallError::Security(format!(
                "'{source}' is not routed through '{node_id}'"
            )))
        }
    }
}

/// Best-effort message id of a frame that failed to parse.
fn message_id_of(text: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get(1)?.as_str().map(RequestId::from)
}

#[async_trait]
impl Channel for StationServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_call(&self, call: OutgoingCall) -> Result<Value, CallError> {
        let (commands, routing) = self
            .session_for(&call.destination)
            .await
            .ok_or_else(|| CallError::UnknownOrUnreachable(call.destination.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = CallFrame {
            message_id: call.request_id.clone(),
            action: call.action.to_owned(),
            payload: call.payload,
            routing,
        };
        commands
            .send(SessionCommand::Call {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CallError::UnknownOrUnreachable(call.destination.clone()))?;

        match tokio::time::timeout(call.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Generic(format!(
                "session for '{}' ended without a response",
                call.destination
            ))),
            Err(_) => {
                // Fails only once the session is gone, taking `pending` with it.
                let _ = commands.send(SessionCommand::Forget(call.request_id)).await;
                Err(CallError::Timeout(call.timeout))
            }
        }
    }

    async fn connected_node_ids(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.sessions.read().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    async fn add_static_route(&self, destination: &NodeId, hub: &NodeId) {
        self.routes
            .write()
            .await
            .insert(destination.clone(), hub.clone());
    }

    async fn remove_static_route(&self, destination: &NodeId, hub: &NodeId) {
        let mut routes = self.routes.write().await;
        if routes.get(destination) == Some(hub) {
            routes.remove(destination);
        }
    }

    async fn add_or_update_http_basic_auth(&self, node_id: &NodeId, password: &str) -> bool {
        self.auth.set(node_id, password).await;
        true
    }

    async fn remove_http_basic_auth(&self, node_id: &NodeId) -> bool {
        self.auth.remove(node_id).await
    }

    async fn shutdown(&self, message: Option<&str>, wait: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let reason = message.unwrap_or("server shutting down").to_owned();
        let commands: Vec<mpsc::Sender<SessionCommand>> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.commands.clone())
            .collect();
        for command in commands {
            let _ = command
                .send(SessionCommand::Close {
                    code: GOING_AWAY,
                    reason: reason.clone(),
                })
                .await;
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let ended = self.session_ended.notified();
            if self.sessions.read().await.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, ended).await.is_err() {
                let remaining = self.session_count().await;
                warn!(remaining, "shutdown wait elapsed");
                break;
            }
        }
    }
}

async fn ws_station_handler(
    ws: WebSocketUpgrade,
    Path(node_id): Path<String>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(server): State<Arc<StationServer>>,
    headers: HeaderMap,
) -> Response {
    let node_id = NodeId::from(node_id);
    if server.shutting_down.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if !server.authorize(&node_id, &headers).await {
        warn!(node_id = %node_id, "basic auth rejected");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"ocpp\"")],
        )
            .into_response();
    }
    ws.protocols(OCPP_SUBPROTOCOLS)
        .on_upgrade(move |socket| server.run_session(socket, node_id, remote_addr))
}

async fn healthz() -> &'static str {
    "ok"
}
