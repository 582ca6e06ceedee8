//! End-to-end tests of the station WebSocket endpoint.
mod common;

use common::record;
use csms::channel::Channel;
use csms::config::{BasicAuthEntry, CsmsConfig};
use csms::{CallError, Csms, Request, StationServer, build_station_server};
use ocpp_protocol::*;
use ocpp_test_utils::{MockStation, rejection_status};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Harness {
    csms: Arc<Csms>,
    server: Arc<StationServer>,
    addr: SocketAddr,
}

async fn start(config: CsmsConfig) -> Harness {
    let csms = Csms::new(config.clone()).unwrap();
    let server = build_station_server(&csms, &config).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));
    Harness { csms, server, addr }
}

/// The handshake completes before the session registers; wait for it.
async fn wait_registered(csms: &Csms, node: &str) {
    let node = NodeId::from(node);
    tokio::time::timeout(Duration::from_secs(5), async {
        while csms.networking_nodes().connected_at(&node).await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("node should register");
}

async fn wait_sessions(server: &StationServer, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.session_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count should settle");
}

fn reset() -> ResetRequest {
    ResetRequest {
        kind: ResetType::OnIdle,
        evse_id: None,
    }
}

#[tokio::test]
async fn boot_notification_over_websocket() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();

    let id = station
        .send_call(
            "BootNotification",
            json!({
                "chargingStation": {"model": "M1", "vendorName": "Acme"},
                "reason": "PowerUp"
            }),
        )
        .await
        .unwrap();

    match station.recv_frame().await.unwrap() {
        Frame::CallResult(result) => {
            assert_eq!(result.message_id, id);
            assert_eq!(result.payload["status"], "Accepted");
            assert_eq!(result.payload["interval"], 300);
        }
        other => panic!("expected CallResult, got {other:?}"),
    }
    assert!(h.csms.stations().get(&NodeId::from("cs-1")).await.is_some());
}

#[tokio::test]
async fn outbound_call_reaches_connected_station() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;

    let csms = Arc::clone(&h.csms);
    let call = tokio::spawn(async move { csms.reset(Request::new("cs-1", reset())).await });

    let incoming = station.expect_call().await.unwrap();
    assert_eq!(incoming.action, "Reset");
    assert_eq!(incoming.message_id.as_str(), "900001");
    assert_eq!(incoming.payload, json!({"type": "OnIdle"}));
    assert_eq!(incoming.routing, None);
    station
        .send_result(&incoming.message_id, json!({"status": "Accepted"}))
        .await
        .unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status, ResetStatus::Accepted);
}

#[tokio::test]
async fn station_call_error_is_returned_to_caller() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;

    let csms = Arc::clone(&h.csms);
    let call = tokio::spawn(async move { csms.reset(Request::new("cs-1", reset())).await });

    let incoming = station.expect_call().await.unwrap();
    station
        .send_error(&incoming.message_id, "NotSupported", "no resets today")
        .await
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        CallError::Remote {
            code: "NotSupported".to_owned(),
            description: "no resets today".to_owned(),
        }
    );
}

#[tokio::test]
async fn unanswered_call_times_out_and_late_answer_is_dropped() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;

    let csms = Arc::clone(&h.csms);
    let call = tokio::spawn(async move {
        csms.reset(Request::new("cs-1", reset()).with_timeout(Duration::from_millis(200)))
            .await
    });
    let incoming = station.expect_call().await.unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_millis(200)));

    // The session survives the late answer.
    station
        .send_result(&incoming.message_id, json!({"status": "Accepted"}))
        .await
        .unwrap();
    let id = station.send_call("Heartbeat", json!({})).await.unwrap();
    assert_eq!(station.recv_frame().await.unwrap().message_id(), &id);
}

#[tokio::test]
async fn call_to_node_without_session_is_unreachable() {
    let h = start(CsmsConfig::default()).await;
    let closed = record(&h.csms.events().connection_closed);
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;

    station.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while closed.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should end");
    assert_eq!(h.server.session_count().await, 0);

    let err = h
        .csms
        .reset(Request::new("cs-1", reset()))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::UnknownOrUnreachable(NodeId::from("cs-1")));
    assert_eq!(closed.lock().unwrap()[0].node_id, NodeId::from("cs-1"));
}

#[tokio::test]
async fn calls_for_routed_node_go_through_the_hub() {
    let h = start(CsmsConfig::default()).await;
    let mut hub = MockStation::connect(h.addr, "hub-1").await.unwrap();
    wait_registered(&h.csms, "hub-1").await;
    h.csms.add_static_route("cs-behind", "hub-1").await.unwrap();

    let csms = Arc::clone(&h.csms);
    let call = tokio::spawn(async move { csms.reset(Request::new("cs-behind", reset())).await });

    let incoming = hub.expect_call().await.unwrap();
    assert_eq!(
        incoming.routing,
        Some(Routing {
            source: None,
            destination: Some(NodeId::from("cs-behind")),
        })
    );
    hub.send_result(&incoming.message_id, json!({"status": "Scheduled"}))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().unwrap().status, ResetStatus::Scheduled);
}

#[tokio::test]
async fn hub_relayed_call_is_attributed_to_its_source() {
    let h = start(CsmsConfig::default()).await;
    let received = record(&h.csms.events().request_received);
    let mut hub = MockStation::connect(h.addr, "hub-1").await.unwrap();
    wait_registered(&h.csms, "hub-1").await;
    h.csms.add_static_route("cs-behind", "hub-1").await.unwrap();

    let id = hub
        .send_routed_call(
            "cs-behind",
            "BootNotification",
            json!({
                "chargingStation": {"model": "M1", "vendorName": "Acme"},
                "reason": "PowerUp"
            }),
        )
        .await
        .unwrap();
    assert!(matches!(hub.recv_frame().await.unwrap(), Frame::CallResult(r) if r.message_id == id));

    assert!(h.csms.stations().get(&NodeId::from("cs-behind")).await.is_some());
    assert!(h.csms.stations().get(&NodeId::from("hub-1")).await.is_none());
    assert_eq!(received.lock().unwrap()[0].sender, NodeId::from("cs-behind"));
}

#[tokio::test]
async fn source_not_routed_through_the_connection_is_rejected() {
    let mut config = CsmsConfig::default();
    config.server.require_basic_auth = true;
    config.basic_auth.push(BasicAuthEntry {
        node_id: NodeId::from("cs-1"),
        password: "pw".to_owned(),
    });
    let h = start(config).await;
    let received = record(&h.csms.events().request_received);
    let mut station = MockStation::connect_with_basic_auth(h.addr, "cs-1", "pw")
        .await
        .unwrap();

    let id = station
        .send_routed_call(
            "victim",
            "BootNotification",
            json!({
                "chargingStation": {"model": "Evil", "vendorName": "Mallory"},
                "reason": "PowerUp"
            }),
        )
        .await
        .unwrap();
    match station.recv_frame().await.unwrap() {
        Frame::CallError(error) => {
            assert_eq!(error.message_id, id);
            assert_eq!(error.code, error_codes::SECURITY_ERROR);
        }
        other => panic!("expected CallError, got {other:?}"),
    }
    assert!(h.csms.stations().get(&NodeId::from("victim")).await.is_none());
    assert!(received.lock().unwrap().is_empty());

    // Naming itself as the source is the same as no routing element.
    station
        .send_routed_call("cs-1", "Heartbeat", json!({}))
        .await
        .unwrap();
    assert!(matches!(station.recv_frame().await.unwrap(), Frame::CallResult(_)));
}

#[tokio::test]
async fn silent_station_times_out_while_being_called() {
    let mut config = CsmsConfig::default();
    config.server.session_timeout = Duration::from_millis(500);
    let h = start(config).await;
    let closed = record(&h.csms.events().connection_closed);
    let _station = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;

    // Outbound traffic keeps flowing; the station never answers.
    let csms = Arc::clone(&h.csms);
    let caller = tokio::spawn(async move {
        loop {
            let request = Request::new("cs-1", reset()).with_timeout(Duration::from_millis(100));
            let _ = csms.reset(request).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while closed.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle session should be closed");
    caller.abort();

    assert_eq!(closed.lock().unwrap()[0].reason, "session timeout");
    assert_eq!(h.server.session_count().await, 0);
}

#[tokio::test]
async fn reconnect_replaces_the_old_session() {
    let h = start(CsmsConfig::default()).await;
    let opened = record(&h.csms.events().connection_opened);
    let mut first = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;
    let mut second = MockStation::connect(h.addr, "cs-1").await.unwrap();

    assert_eq!(first.expect_close().await.unwrap(), Some(1000));
    wait_sessions(&h.server, 1).await;

    let csms = Arc::clone(&h.csms);
    let call = tokio::spawn(async move { csms.reset(Request::new("cs-1", reset())).await });
    let incoming = second.expect_call().await.unwrap();
    second
        .send_result(&incoming.message_id, json!({"status": "Accepted"}))
        .await
        .unwrap();
    assert!(call.await.unwrap().is_ok());

    let opened = opened.lock().unwrap();
    assert_eq!(opened.len(), 2);
    assert_ne!(
        opened[0].connection.connection_id,
        opened[1].connection.connection_id
    );
    assert_eq!(opened[1].channel_id, "stations");
}

#[tokio::test]
async fn unknown_action_gets_not_implemented() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();

    let id = station.send_call("Teleport", json!({})).await.unwrap();
    match station.recv_frame().await.unwrap() {
        Frame::CallError(error) => {
            assert_eq!(error.message_id, id);
            assert_eq!(error.code, error_codes::NOT_IMPLEMENTED);
        }
        other => panic!("expected CallError, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frames_are_answered_when_possible() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();

    station.send_text(r#"[2, "m-1", "Heartbeat"]"#).await.unwrap();
    match station.recv_frame().await.unwrap() {
        Frame::CallError(error) => {
            assert_eq!(error.message_id, RequestId::from("m-1"));
            assert_eq!(error.code, error_codes::FORMAT_VIOLATION);
        }
        other => panic!("expected CallError, got {other:?}"),
    }

    station.send_text(r#"[7, "m-2", {}]"#).await.unwrap();
    match station.recv_frame().await.unwrap() {
        Frame::CallError(error) => {
            assert_eq!(error.message_id, RequestId::from("m-2"));
            assert_eq!(error.code, error_codes::MESSAGE_TYPE_NOT_SUPPORTED);
        }
        other => panic!("expected CallError, got {other:?}"),
    }

    // Nothing to correlate with; the session just carries on.
    station.send_text("not json").await.unwrap();
    let id = station.send_call("Heartbeat", json!({})).await.unwrap();
    assert_eq!(station.recv_frame().await.unwrap().message_id(), &id);
}

#[tokio::test]
async fn basic_auth_gate() {
    let mut config = CsmsConfig::default();
    config.server.require_basic_auth = true;
    config.basic_auth.push(BasicAuthEntry {
        node_id: NodeId::from("cs-1"),
        password: "s3cret".to_owned(),
    });
    let h = start(config).await;

    let err = MockStation::connect(h.addr, "cs-1").await.err().unwrap();
    assert_eq!(rejection_status(&err), Some(401));
    let err = MockStation::connect_with_basic_auth(h.addr, "cs-1", "wrong")
        .await
        .err()
        .unwrap();
    assert_eq!(rejection_status(&err), Some(401));

    MockStation::connect_with_basic_auth(h.addr, "cs-1", "s3cret")
        .await
        .unwrap();

    // Entries can be changed at runtime.
    h.server
        .add_or_update_http_basic_auth(&NodeId::from("cs-2"), "other")
        .await;
    MockStation::connect_with_basic_auth(h.addr, "cs-2", "other")
        .await
        .unwrap();
    assert!(h.server.remove_http_basic_auth(&NodeId::from("cs-2")).await);
    let err = MockStation::connect_with_basic_auth(h.addr, "cs-2", "other")
        .await
        .err()
        .unwrap();
    assert_eq!(rejection_status(&err), Some(401));
}

#[tokio::test]
async fn shutdown_closes_sessions_and_refuses_new_ones() {
    let h = start(CsmsConfig::default()).await;
    let mut station = MockStation::connect(h.addr, "cs-1").await.unwrap();
    wait_registered(&h.csms, "cs-1").await;

    let csms = Arc::clone(&h.csms);
    let shutdown = tokio::spawn(async move {
        csms.shutdown(Some("maintenance"), Duration::from_secs(5))
            .await;
    });
    assert_eq!(station.expect_close().await.unwrap(), Some(1001));
    shutdown.await.unwrap();
    assert_eq!(h.server.session_count().await, 0);

    let err = MockStation::connect(h.addr, "cs-2").await.err().unwrap();
    assert_eq!(rejection_status(&err), Some(503));
}

#[tokio::test]
async fn healthz_answers_ok() {
    let h = start(CsmsConfig::default()).await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));
}
