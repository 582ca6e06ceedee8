use super::InboundHandler;
use crate::certificates::{parse_csr_pem, spawn_certificate_signing};
use crate::channel::CallContext;
use crate::csms::Csms;
use crate::error::CallError;
use crate::stations::ChargingStation;
use async_trait::async_trait;
use chrono::Utc;
use ocpp_protocol::*;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

#[async_trait]
impl InboundHandler for BootNotificationRequest {
    async fn handle(self, csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        let protocol = &csms.config().protocol;
        let now = Utc::now();
        let station = ChargingStation::from_boot(
            ctx.sender.clone(),
            &self.charging_station,
            self.reason,
            protocol.boot_registration_status,
            now,
        );
        match csms.stations().add_or_update(station).await {
            Ok(created) => info!(
                node_id = %ctx.sender,
                vendor = %self.charging_station.vendor_name,
                model = %self.charging_station.model,
                reason = ?self.reason,
                created,
                "boot notification"
            ),
            // The registry is bookkeeping; the station still gets its answer.
            Err(e) => warn!(node_id = %ctx.sender, error = %e, "station registry not updated"),
        }
        Ok(BootNotificationResponse {
            current_time: now,
            interval: protocol.heartbeat_interval_secs,
            status: protocol.boot_registration_status,
            status_info: None,
        })
    }
}

#[async_trait]
impl InboundHandler for HeartbeatRequest {
    async fn handle(self, _csms: &Csms, _ctx: &CallContext) -> Result<Self::Response, CallError> {
        Ok(HeartbeatResponse {
            current_time: Utc::now(),
        })
    }
}

#[async_trait]
impl InboundHandler for StatusNotificationRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        debug!(
            node_id = %ctx.sender,
            evse_id = self.evse_id,
            connector_id = self.connector_id,
            status = ?self.connector_status,
            "connector status"
        );
        Ok(EmptyResponse {})
    }
}

// ---------------------------------------------------------------------------
// Authorization and transactions
// ---------------------------------------------------------------------------

#[async_trait]
impl InboundHandler for AuthorizeRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        debug!(node_id = %ctx.sender, id_token = %self.id_token.id_token, "authorize");
        Ok(AuthorizeResponse {
            id_token_info: IdTokenInfo::accepted(),
        })
    }
}

#[async_trait]
impl InboundHandler for TransactionEventRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        debug!(
            node_id = %ctx.sender,
            transaction_id = %self.transaction_info.transaction_id,
            event_type = ?self.event_type,
            seq_no = self.seq_no,
            "transaction event"
        );
        Ok(TransactionEventResponse {
            id_token_info: self.id_token.map(|_| IdTokenInfo::accepted()),
            ..TransactionEventResponse::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Notifications answered with an empty body
// ---------------------------------------------------------------------------

macro_rules! acknowledge {
    ($($request:ty),+ $(,)?) => {
        $(
            #[async_trait]
            impl InboundHandler for $request {
                async fn handle(
                    self,
                    _csms: &Csms,
                    ctx: &CallContext,
                ) -> Result<Self::Response, CallError> {
                    debug!(node_id = %ctx.sender, action = Self::ACTION, "notification received");
                    Ok(EmptyResponse {})
                }
            }
        )+
    };
}

acknowledge!(
    MeterValuesRequest,
    ReservationStatusUpdateRequest,
    NotifyReportRequest,
    NotifyEventRequest,
    NotifyMonitoringReportRequest,
    NotifyCustomerInformationRequest,
    NotifyDisplayMessagesRequest,
    LogStatusNotificationRequest,
    PublishFirmwareStatusNotificationRequest,
    NotifyChargingLimitRequest,
    ClearedChargingLimitRequest,
    ReportChargingProfilesRequest,
    NotifyPriorityChargingRequest,
);

#[async_trait]
impl InboundHandler for FirmwareStatusNotificationRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        info!(node_id = %ctx.sender, status = %self.status, request_id = ?self.request_id, "firmware status");
        Ok(EmptyResponse {})
    }
}

#[async_trait]
impl InboundHandler for SecurityEventNotificationRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        warn!(
            node_id = %ctx.sender,
            event = %self.kind,
            tech_info = self.tech_info.as_deref().unwrap_or(""),
            "security event"
        );
        Ok(EmptyResponse {})
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

#[async_trait]
impl InboundHandler for SignCertificateRequest {
    async fn handle(self, csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        let rejected = |reason: &str, info: String| SignCertificateResponse {
            status: GenericStatus::Rejected,
            status_info: Some(StatusInfo::new(reason).with_info(info)),
        };

        if let Err(e) = parse_csr_pem(&self.csr) {
            return Ok(rejected("InvalidCSR", e.to_string()));
        }
        let Some(signer) = csms.certificate_signer() else {
            return Ok(rejected(
                "NoSigner",
                "no certificate authority configured".to_owned(),
            ));
        };
        let Some(handle) = csms.handle() else {
            return Ok(rejected("ShuttingDown", "CSMS is shutting down".to_owned()));
        };

        spawn_certificate_signing(
            handle,
            Arc::clone(signer),
            ctx.sender.clone(),
            self.csr,
            self.certificate_type,
            csms.config().certificates.sign_delay,
        );
        info!(node_id = %ctx.sender, "certificate signing queued");
        Ok(SignCertificateResponse {
            status: GenericStatus::Accepted,
            status_info: None,
        })
    }
}

#[async_trait]
impl InboundHandler for Get15118EVCertificateRequest {
    async fn handle(self, _csms: &Csms, _ctx: &CallContext) -> Result<Self::Response, CallError> {
        Ok(Get15118EVCertificateResponse {
            status: Iso15118EVCertificateStatus::Failed,
            exi_response: String::new(),
            status_info: Some(StatusInfo::new("NoBackend")),
        })
    }
}

#[async_trait]
impl InboundHandler for GetCertificateStatusRequest {
    async fn handle(self, _csms: &Csms, _ctx: &CallContext) -> Result<Self::Response, CallError> {
        Ok(GetCertificateStatusResponse {
            status: GetCertificateStatus::Failed,
            ocsp_result: None,
            status_info: Some(StatusInfo::new("NoBackend")),
        })
    }
}

// ---------------------------------------------------------------------------
// Smart charging
// ---------------------------------------------------------------------------

#[async_trait]
impl InboundHandler for NotifyEVChargingNeedsRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        debug!(node_id = %ctx.sender, evse_id = self.evse_id, "EV charging needs");
        Ok(NotifyEVChargingNeedsResponse {
            status: NotifyEVChargingNeedsStatus::Accepted,
            status_info: None,
        })
    }
}

#[async_trait]
impl InboundHandler for NotifyEVChargingScheduleRequest {
    async fn handle(self, _csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        debug!(node_id = %ctx.sender, evse_id = self.evse_id, "EV charging schedule");
        Ok(NotifyEVChargingScheduleResponse {
            status: GenericStatus::Accepted,
            status_info: None,
        })
    }
}

#[async_trait]
impl InboundHandler for PullDynamicScheduleUpdateRequest {
    async fn handle(self, _csms: &Csms, _ctx: &CallContext) -> Result<Self::Response, CallError> {
        Ok(PullDynamicScheduleUpdateResponse {
            status: ChargingProfileStatus::Accepted,
            schedule_update: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Data transfer
// ---------------------------------------------------------------------------

#[async_trait]
impl InboundHandler for DataTransferRequest {
    async fn handle(self, csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        if self.vendor_id != csms.config().protocol.accepted_vendor_id {
            debug!(node_id = %ctx.sender, vendor_id = %self.vendor_id, "data transfer from unknown vendor");
            return Ok(DataTransferResponse {
                status: DataTransferStatus::Rejected,
                data: None,
                status_info: None,
            });
        }
        Ok(DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: self.data.as_ref().map(reverse_data),
            status_info: None,
        })
    }
}

#[async_trait]
impl InboundHandler for BinaryDataTransferRequest {
    async fn handle(self, csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError> {
        if self.vendor_id != csms.config().protocol.accepted_vendor_id {
            debug!(node_id = %ctx.sender, vendor_id = %self.vendor_id, "binary data transfer from unknown vendor");
            return Ok(BinaryDataTransferResponse {
                status: DataTransferStatus::Rejected,
                data: None,
            });
        }
        let mut data = self.data;
        data.reverse();
        Ok(BinaryDataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: Some(data),
        })
    }
}

/// Strings are reversed character-wise; anything else on its compact JSON text.
fn reverse_data(data: &Value) -> Value {
    let text = match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Value::String(text.chars().rev().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reverse_string_data() {
        assert_eq!(reverse_data(&json!("hello")), json!("olleh"));
        assert_eq!(reverse_data(&json!("")), json!(""));
    }

    #[test]
    fn reverse_structured_data_uses_compact_json() {
        assert_eq!(reverse_data(&json!([1, 2])), json!("]2,1["));
        assert_eq!(reverse_data(&json!({"a": 1})), json!("}1:\"a\"{"));
    }
}
