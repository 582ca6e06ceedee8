//! Station-initiated calls.
//!
//! [`dispatch`] is the closed table from action name to request type. Every
//! entry runs the same pipeline ([`Csms::process`]); only the
//! [`InboundHandler`] impl differs per message.

mod handlers;

use crate::channel::CallContext;
use crate::csms::Csms;
use crate::error::CallError;
use async_trait::async_trait;
use ocpp_protocol::*;
use serde_json::Value;

/// Domain logic for one station-initiated request type.
#[async_trait]
pub(crate) trait InboundHandler: StationOperation {
    async fn handle(self, csms: &Csms, ctx: &CallContext) -> Result<Self::Response, CallError>;
}

pub(crate) async fn dispatch(
    csms: &Csms,
    ctx: CallContext,
    action: &str,
    payload: Value,
) -> Result<Value, CallError> {
    match action {
        "BootNotification" => csms.process::<BootNotificationRequest>(ctx, payload).await,
        "Heartbeat" => csms.process::<HeartbeatRequest>(ctx, payload).await,
        "StatusNotification" => csms.process::<StatusNotificationRequest>(ctx, payload).await,
        "Authorize" => csms.process::<AuthorizeRequest>(ctx, payload).await,
        "TransactionEvent" => csms.process::<TransactionEventRequest>(ctx, payload).await,
        "MeterValues" => csms.process::<MeterValuesRequest>(ctx, payload).await,
        "ReservationStatusUpdate" => {
            csms.process::<ReservationStatusUpdateRequest>(ctx, payload)
                .await
        }
        "NotifyReport" => csms.process::<NotifyReportRequest>(ctx, payload).await,
        "NotifyEvent" => csms.process::<NotifyEventRequest>(ctx, payload).await,
        "NotifyMonitoringReport" => {
            csms.process::<NotifyMonitoringReportRequest>(ctx, payload)
                .await
        }
        "NotifyCustomerInformation" => {
            csms.process::<NotifyCustomerInformationRequest>(ctx, payload)
                .await
        }
        "NotifyDisplayMessages" => {
            csms.process::<NotifyDisplayMessagesRequest>(ctx, payload)
                .await
        }
        "LogStatusNotification" => {
            csms.process::<LogStatusNotificationRequest>(ctx, payload)
                .await
        }
        "FirmwareStatusNotification" => {
            csms.process::<FirmwareStatusNotificationRequest>(ctx, payload)
                .await
        }
        "PublishFirmwareStatusNotification" => {
            csms.process::<PublishFirmwareStatusNotificationRequest>(ctx, payload)
                .await
        }
        "SecurityEventNotification" => {
            csms.process::<SecurityEventNotificationRequest>(ctx, payload)
                .await
        }
        "SignCertificate" => csms.process::<SignCertificateRequest>(ctx, payload).await,
        "Get15118EVCertificate" => {
            csms.process::<Get15118EVCertificateRequest>(ctx, payload)
                .await
        }
        "GetCertificateStatus" => {
            csms.process::<GetCertificateStatusRequest>(ctx, payload)
                .await
        }
        "NotifyChargingLimit" => csms.process::<NotifyChargingLimitRequest>(ctx, payload).await,
        "ClearedChargingLimit" => {
            csms.process::<ClearedChargingLimitRequest>(ctx, payload)
                .await
        }
        "ReportChargingProfiles" => {
            csms.process::<ReportChargingProfilesRequest>(ctx, payload)
                .await
        }
        "NotifyEVChargingNeeds" => {
            csms.process::<NotifyEVChargingNeedsRequest>(ctx, payload)
                .await
        }
        "NotifyEVChargingSchedule" => {
            csms.process::<NotifyEVChargingScheduleRequest>(ctx, payload)
                .await
        }
        "PullDynamicScheduleUpdate" => {
            csms.process::<PullDynamicScheduleUpdateRequest>(ctx, payload)
                .await
        }
        "NotifyPriorityCharging" => {
            csms.process::<NotifyPriorityChargingRequest>(ctx, payload)
                .await
        }
        "DataTransfer" => csms.process::<DataTransferRequest>(ctx, payload).await,
        "BinaryDataTransfer" => csms.process::<BinaryDataTransferRequest>(ctx, payload).await,
        other => Err(CallError::NotImplemented(other.to_owned())),
    }
}
