//! Shared fixtures for the CSMS integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use csms::config::CsmsConfig;
use csms::events::{Notifier, ObserverError};
use csms::{CallContext, CallError, Channel, ConnectionInfo, Csms, OutgoingCall};
use ocpp_protocol::{NodeId, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn Fn(&OutgoingCall) -> Result<Value, CallError> + Send + Sync>;

/// In-memory channel that records every call and answers from a closure.
pub struct FakeChannel {
    id: String,
    responder: Responder,
    calls: Mutex<Vec<OutgoingCall>>,
    routes: Mutex<HashMap<NodeId, NodeId>>,
    passwords: Mutex<HashMap<NodeId, String>>,
    shutdowns: AtomicUsize,
}

impl FakeChannel {
    pub fn new<F>(id: &str, responder: F) -> Arc<Self>
    where
        F: Fn(&OutgoingCall) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: id.to_owned(),
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
            passwords: Mutex::new(HashMap::new()),
            shutdowns: AtomicUsize::new(0),
        })
    }

    /// Answers every call with the same payload.
    pub fn answering(id: &str, payload: Value) -> Arc<Self> {
        Self::new(id, move |_| Ok(payload.clone()))
    }

    pub fn calls(&self) -> Vec<OutgoingCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn route_for(&self, destination: &str) -> Option<NodeId> {
        self.routes
            .lock()
            .unwrap()
            .get(&NodeId::from(destination))
            .cloned()
    }

    pub fn password_for(&self, node_id: &str) -> Option<String> {
        self.passwords
            .lock()
            .unwrap()
            .get(&NodeId::from(node_id))
            .cloned()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_call(&self, call: OutgoingCall) -> Result<Value, CallError> {
        let result = (self.responder)(&call);
        self.calls.lock().unwrap().push(call);
        result
    }

    async fn connected_node_ids(&self) -> Vec<NodeId> {
        Vec::new()
    }

    async fn add_static_route(&self, destination: &NodeId, hub: &NodeId) {
        self.routes
            .lock()
            .unwrap()
            .insert(destination.clone(), hub.clone());
    }

    async fn remove_static_route(&self, destination: &NodeId, _hub: &NodeId) {
        self.routes.lock().unwrap().remove(destination);
    }

    async fn add_or_update_http_basic_auth(&self, node_id: &NodeId, password: &str) -> bool {
        self.passwords
            .lock()
            .unwrap()
            .insert(node_id.clone(), password.to_owned());
        true
    }

    async fn remove_http_basic_auth(&self, node_id: &NodeId) -> bool {
        self.passwords.lock().unwrap().remove(node_id).is_some()
    }

    async fn shutdown(&self, _message: Option<&str>, _wait: Duration) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn as_channel(channel: &Arc<FakeChannel>) -> Arc<dyn Channel> {
    Arc::clone(channel) as Arc<dyn Channel>
}

pub fn test_csms() -> Arc<Csms> {
    Csms::new(CsmsConfig::default()).unwrap()
}

/// Registers `node` as reachable through `channel`.
pub async fn connect(csms: &Csms, node: &str, channel: &Arc<FakeChannel>) {
    csms.register_connection(NodeId::from(node), &as_channel(channel))
        .await;
}

pub fn context(sender: &str, request_id: &str) -> CallContext {
    CallContext {
        timestamp: Utc::now(),
        sender: NodeId::from(sender),
        connection: ConnectionInfo {
            connection_id: format!("conn-{sender}"),
            channel_id: "fake".to_owned(),
            remote_addr: None,
            connected_at: Utc::now(),
        },
        request_id: RequestId::from(request_id),
    }
}

/// Collects every event a notifier delivers.
pub fn record<E: Clone + Send + Sync + 'static>(notifier: &Notifier<E>) -> Arc<Mutex<Vec<E>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    notifier.subscribe_fn(move |event: E| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok::<(), ObserverError>(())
        }
    });
    seen
}
