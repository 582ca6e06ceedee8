//! Observer fan-out around every request and response.
//!
//! Observers run concurrently. A failing or panicking observer is logged
//! and skipped; it never aborts the other observers or the call it watches.

use crate::channel::ConnectionInfo;
use crate::error::ResultCode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::join_all;
use ocpp_protocol::{NodeId, RequestId};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::warn;

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait Observer<E>: Send + Sync {
    async fn notify(&self, event: &E) -> Result<(), ObserverError>;
}

struct FnObserver<F>(F);

#[async_trait]
impl<E, F, Fut> Observer<E> for FnObserver<F>
where
    E: Clone + Send + Sync + 'static,
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ObserverError>> + Send,
{
    async fn notify(&self, event: &E) -> Result<(), ObserverError> {
        (self.0)(event.clone()).await
    }
}

/// A list of observers for one kind of event.
pub struct Notifier<E> {
    observers: RwLock<Vec<Arc<dyn Observer<E>>>>,
}

impl<E: Send + Sync + 'static> Notifier<E> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer<E>>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Subscribe a closure that receives its own copy of each event.
    pub fn subscribe_fn<F, Fut>(&self, f: F)
    where
        E: Clone,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ObserverError>> + Send + 'static,
    {
        self.subscribe(Arc::new(FnObserver(f)));
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer and wait for all of them.
    ///
    /// Returns the number of observers that failed. `module` and `caller`
    /// only label the log line of a failure.
    pub async fn notify(&self, module: &str, caller: &str, event: &E) -> usize {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if observers.is_empty() {
            return 0;
        }

        let results = join_all(
            observers
                .iter()
                .map(|observer| AssertUnwindSafe(observer.notify(event)).catch_unwind()),
        )
        .await;

        let mut failures = 0;
        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    handle_errors(module, caller, &e.to_string());
                }
                Err(panic) => {
                    failures += 1;
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "observer panicked".to_owned());
                    handle_errors(module, caller, &message);
                }
            }
        }
        failures
    }
}

impl<E: Send + Sync + 'static> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_errors(module: &str, caller: &str, error: &str) {
    warn!(module, caller, error, "event observer failed");
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// A CSMS-initiated call is about to be routed.
#[derive(Debug, Clone)]
pub struct RequestSent {
    pub timestamp: DateTime<Utc>,
    pub destination: NodeId,
    pub request_id: RequestId,
    pub action: &'static str,
    pub payload: Value,
}

/// A CSMS-initiated call finished, successfully or not.
#[derive(Debug, Clone)]
pub struct ResponseReceived {
    pub timestamp: DateTime<Utc>,
    pub destination: NodeId,
    pub request_id: RequestId,
    pub action: &'static str,
    pub result: ResultCode,
    pub runtime: Duration,
    pub payload: Option<Value>,
}

/// A station-initiated call arrived.
#[derive(Debug, Clone)]
pub struct RequestReceived {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionInfo,
    pub request_id: RequestId,
    pub action: &'static str,
    pub payload: Value,
}

/// The answer to a station-initiated call is handed back to the channel.
#[derive(Debug, Clone)]
pub struct ResponseSent {
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub request_id: RequestId,
    pub action: &'static str,
    pub result: ResultCode,
    pub runtime: Duration,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ConnectionOpened {
    pub timestamp: DateTime<Utc>,
    pub node_id: NodeId,
    pub channel_id: String,
    pub connection: ConnectionInfo,
}

#[derive(Debug, Clone)]
pub struct ConnectionClosed {
    pub timestamp: DateTime<Utc>,
    pub node_id: NodeId,
    pub channel_id: String,
    pub reason: String,
}

/// All observable points of the CSMS.
#[derive(Default)]
pub struct CsmsEvents {
    pub request_sent: Notifier<RequestSent>,
    pub response_received: Notifier<ResponseReceived>,
    pub request_received: Notifier<RequestReceived>,
    pub response_sent: Notifier<ResponseSent>,
    pub connection_opened: Notifier<ConnectionOpened>,
    pub connection_closed: Notifier<ConnectionClosed>,
}

/// Wall-clock time between two timestamps, zero if the clock went backwards.
pub fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}
