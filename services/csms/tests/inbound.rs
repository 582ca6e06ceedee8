//! Station-initiated calls through the dispatch table.
mod common;

use async_trait::async_trait;
use common::{FakeChannel, connect, context, record, test_csms};
use csms::certificates::{CertificateError, CertificateSigner};
use csms::config::{CsmsConfig, load_config_from_str};
use csms::signing::Ed25519Policy;
use csms::{CallError, CallHandler, Csms, ResultCode};
use ed25519_dalek::SigningKey;
use ocpp_protocol::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

fn boot_payload(reason: &str) -> Value {
    json!({
        "chargingStation": {
            "model": "Wallbox X",
            "vendorName": "Acme",
            "serialNumber": "SN-1"
        },
        "reason": reason
    })
}

#[tokio::test]
async fn boot_notification_registers_station() {
    let csms = test_csms();

    let response = csms
        .handle_call(context("cs-1", "m-1"), "BootNotification", boot_payload("PowerUp"))
        .await
        .unwrap();
    let response: BootNotificationResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.status, RegistrationStatus::Accepted);
    assert_eq!(response.interval, 300);

    let station = csms.stations().get(&NodeId::from("cs-1")).await.unwrap();
    assert_eq!(station.vendor_name, "Acme");
    assert_eq!(station.model, "Wallbox X");
    assert_eq!(station.serial_number.as_deref(), Some("SN-1"));
    assert_eq!(station.last_boot_reason, Some(BootReason::PowerUp));
}

#[tokio::test]
async fn repeated_boot_updates_in_place() {
    let csms = test_csms();
    csms.handle_call(context("cs-1", "m-1"), "BootNotification", boot_payload("PowerUp"))
        .await
        .unwrap();
    csms.handle_call(context("cs-1", "m-2"), "BootNotification", boot_payload("RemoteReset"))
        .await
        .unwrap();

    assert_eq!(csms.stations().len().await, 1);
    let station = csms.stations().get(&NodeId::from("cs-1")).await.unwrap();
    assert_eq!(station.last_boot_reason, Some(BootReason::RemoteReset));
}

#[tokio::test]
async fn boot_answer_follows_configuration() {
    let config = load_config_from_str(
        r#"
schema_version = 1

[protocol]
heartbeat_interval_secs = 60
boot_registration_status = "Pending"
"#,
    )
    .unwrap();
    let csms = Csms::new(config).unwrap();

    let response = csms
        .handle_call(context("cs-1", "m-1"), "BootNotification", boot_payload("PowerUp"))
        .await
        .unwrap();
    assert_eq!(response["status"], "Pending");
    assert_eq!(response["interval"], 60);
}

#[tokio::test]
async fn heartbeat_returns_current_time() {
    let csms = test_csms();
    let before = chrono::Utc::now();

    let response = csms
        .handle_call(context("cs-1", "m-1"), "Heartbeat", json!({}))
        .await
        .unwrap();
    let response: HeartbeatResponse = serde_json::from_value(response).unwrap();
    assert!(response.current_time >= before - chrono::Duration::seconds(1));
}

#[tokio::test]
async fn unknown_action_is_not_implemented() {
    let csms = test_csms();
    let received = record(&csms.events().request_received);

    let err = csms
        .handle_call(context("cs-1", "m-1"), "FlyToTheMoon", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::NotImplemented("FlyToTheMoon".to_owned()));
    assert_eq!(err.error_code(), "NotImplemented");
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_payload_is_a_format_violation() {
    let csms = test_csms();
    let sent = record(&csms.events().response_sent);

    let err = csms
        .handle_call(context("cs-1", "m-1"), "BootNotification", json!({"reason": 42}))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::FormatViolation(_)));
    assert_eq!(err.error_code(), "FormatViolation");

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].result, ResultCode::GenericError(_)));
    assert!(sent[0].payload.is_none());
}

#[tokio::test]
async fn every_inbound_call_emits_one_event_pair() {
    let csms = test_csms();
    let received = record(&csms.events().request_received);
    let sent = record(&csms.events().response_sent);

    csms.handle_call(context("cs-1", "m-42"), "Heartbeat", json!({}))
        .await
        .unwrap();

    let received = received.lock().unwrap();
    let sent = sent.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(sent.len(), 1);
    assert_eq!(received[0].request_id, RequestId::from("m-42"));
    assert_eq!(sent[0].request_id, RequestId::from("m-42"));
    assert_eq!(received[0].action, "Heartbeat");
    assert_eq!(received[0].sender, NodeId::from("cs-1"));
    assert_eq!(sent[0].result, ResultCode::Success);
    assert!(received[0].timestamp <= sent[0].timestamp);
    assert!(sent[0].payload.as_ref().unwrap().get("currentTime").is_some());
}

#[tokio::test]
async fn routed_sender_is_the_originating_station() {
    let csms = test_csms();

    csms.handle_call(context("cs-behind-hub", "m-1"), "BootNotification", boot_payload("PowerUp"))
        .await
        .unwrap();
    assert!(csms.stations().get(&NodeId::from("cs-behind-hub")).await.is_some());
}

#[tokio::test]
async fn unsigned_request_rejected_when_signatures_required() {
    let csms = Csms::builder(CsmsConfig::default())
        .signature_policy(Arc::new(Ed25519Policy::new().require_signatures(true)))
        .build()
        .unwrap();
    let sent = record(&csms.events().response_sent);

    let err = csms
        .handle_call(context("cs-1", "m-1"), "Heartbeat", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Signature(_)));
    assert_eq!(err.error_code(), "SecurityError");
    assert!(matches!(
        sent.lock().unwrap()[0].result,
        ResultCode::SignatureError(_)
    ));
}

#[tokio::test]
async fn responses_are_signed_with_the_csms_key() {
    let csms = Csms::builder(CsmsConfig::default())
        .signature_policy(Arc::new(
            Ed25519Policy::new().with_signing_key("csms-key", SigningKey::from_bytes(&[9; 32])),
        ))
        .build()
        .unwrap();

    let response = csms
        .handle_call(context("cs-1", "m-1"), "Heartbeat", json!({}))
        .await
        .unwrap();
    assert_eq!(response["signatures"][0]["keyId"], "csms-key");
    assert_eq!(response["signatures"][0]["signingMethod"], "Ed25519");
}

#[tokio::test]
async fn data_transfer_reverses_data_for_known_vendor() {
    let csms = test_csms();

    let accepted = csms
        .handle_call(
            context("cs-1", "m-1"),
            "DataTransfer",
            json!({"vendorId": "ocpp-csms", "data": "hello"}),
        )
        .await
        .unwrap();
    assert_eq!(accepted, json!({"status": "Accepted", "data": "olleh"}));

    let rejected = csms
        .handle_call(
            context("cs-1", "m-2"),
            "DataTransfer",
            json!({"vendorId": "someone-else", "data": "hello"}),
        )
        .await
        .unwrap();
    assert_eq!(rejected, json!({"status": "Rejected"}));
}

#[tokio::test]
async fn binary_data_transfer_reverses_bytes() {
    let csms = test_csms();

    // [1, 2, 3] -> [3, 2, 1]
    let response = csms
        .handle_call(
            context("cs-1", "m-1"),
            "BinaryDataTransfer",
            json!({"vendorId": "ocpp-csms", "data": "AQID"}),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"status": "Accepted", "data": "AwIB"}));
}

#[tokio::test]
async fn notifications_are_acknowledged() {
    let csms = test_csms();

    let response = csms
        .handle_call(
            context("cs-1", "m-1"),
            "SecurityEventNotification",
            json!({"type": "FirmwareUpdated", "timestamp": "2026-01-01T00:00:00Z"}),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({}));
}

// ---------------------------------------------------------------------------
// SignCertificate
// ---------------------------------------------------------------------------

fn station_csr(node: &str) -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![node.to_owned()]).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, node);
    params.serialize_request(&key).unwrap().pem().unwrap()
}

struct FixedChainSigner;

#[async_trait]
impl CertificateSigner for FixedChainSigner {
    async fn sign(
        &self,
        _csr_pem: &str,
        _usage: Option<CertificateSigningUse>,
    ) -> Result<String, CertificateError> {
        Ok("-----BEGIN CERTIFICATE-----\nLEAF\n-----END CERTIFICATE-----\n".to_owned())
    }
}

fn csms_with_signer() -> Arc<Csms> {
    let mut config = CsmsConfig::default();
    config.certificates.sign_delay = Duration::ZERO;
    Csms::builder(config)
        .certificate_signer(Arc::new(FixedChainSigner))
        .build()
        .unwrap()
}

#[tokio::test]
async fn invalid_csr_is_rejected() {
    let csms = csms_with_signer();

    let response = csms
        .handle_call(context("cs-1", "m-1"), "SignCertificate", json!({"csr": "garbage"}))
        .await
        .unwrap();
    assert_eq!(response["status"], "Rejected");
    assert_eq!(response["statusInfo"]["reasonCode"], "InvalidCSR");
}

#[tokio::test]
async fn sign_certificate_without_ca_is_rejected() {
    let csms = test_csms();

    let response = csms
        .handle_call(
            context("cs-1", "m-1"),
            "SignCertificate",
            json!({"csr": station_csr("cs-1")}),
        )
        .await
        .unwrap();
    assert_eq!(response["status"], "Rejected");
    assert_eq!(response["statusInfo"]["reasonCode"], "NoSigner");
}

#[tokio::test]
async fn signed_chain_is_delivered_in_the_background() {
    let csms = csms_with_signer();
    let station = FakeChannel::answering("ws", json!({"status": "Accepted"}));
    connect(&csms, "cs-1", &station).await;

    let response = csms
        .handle_call(
            context("cs-1", "m-1"),
            "SignCertificate",
            json!({
                "csr": station_csr("cs-1"),
                "certificateType": "ChargingStationCertificate"
            }),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"status": "Accepted"}));

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(call) = station.calls().into_iter().next() {
                return call;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("CertificateSigned should follow");
    assert_eq!(delivered.action, "CertificateSigned");
    assert_eq!(delivered.destination, NodeId::from("cs-1"));
    assert!(delivered.payload["certificateChain"]
        .as_str()
        .unwrap()
        .contains("LEAF"));
    assert_eq!(
        delivered.payload["certificateType"],
        "ChargingStationCertificate"
    );
}

/// Holds every signature until the test releases it.
#[derive(Default)]
struct GatedSigner {
    release: Notify,
    finished: AtomicBool,
}

#[async_trait]
impl CertificateSigner for GatedSigner {
    async fn sign(
        &self,
        csr_pem: &str,
        usage: Option<CertificateSigningUse>,
    ) -> Result<String, CertificateError> {
        self.release.notified().await;
        let chain = FixedChainSigner.sign(csr_pem, usage).await;
        self.finished.store(true, Ordering::SeqCst);
        chain
    }
}

#[tokio::test]
async fn sign_certificate_answers_before_signing_finishes() {
    let signer = Arc::new(GatedSigner::default());
    let mut config = CsmsConfig::default();
    config.certificates.sign_delay = Duration::from_millis(50);
    let csms = Csms::builder(config)
        .certificate_signer(Arc::clone(&signer) as Arc<dyn CertificateSigner>)
        .build()
        .unwrap();
    let station = FakeChannel::answering("ws", json!({"status": "Accepted"}));
    connect(&csms, "cs-1", &station).await;

    let response = tokio::time::timeout(
        Duration::from_secs(1),
        csms.handle_call(
            context("cs-1", "m-1"),
            "SignCertificate",
            json!({"csr": station_csr("cs-1")}),
        ),
    )
    .await
    .expect("answer must not wait for the signer")
    .unwrap();
    assert_eq!(response, json!({"status": "Accepted"}));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!signer.finished.load(Ordering::SeqCst));
    assert!(station.calls().is_empty());

    signer.release.notify_one();
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(call) = station.calls().into_iter().next() {
                return call;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("CertificateSigned should follow the release");
    assert!(signer.finished.load(Ordering::SeqCst));
    assert_eq!(delivered.action, "CertificateSigned");
    assert_eq!(delivered.destination, NodeId::from("cs-1"));
}
