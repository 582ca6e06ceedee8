//! One method per CSMS-initiated operation, all delegating to [`Csms::call`].

use crate::csms::{Csms, Request};
use crate::error::CallError;
use ocpp_protocol::*;

macro_rules! outbound_operations {
    ($($(#[$doc:meta])* $method:ident($request:ty);)+) => {
        impl Csms {
            $(
                $(#[$doc])*
                pub async fn $method(
                    &self,
                    request: Request<$request>,
                ) -> Result<<$request as Operation>::Response, CallError> {
                    self.call(request).await
                }
            )+
        }
    };
}

outbound_operations! {
    // Provisioning
    reset(ResetRequest);
    get_base_report(GetBaseReportRequest);
    get_report(GetReportRequest);
    set_variables(SetVariablesRequest);
    get_variables(GetVariablesRequest);
    set_network_profile(SetNetworkProfileRequest);
    change_availability(ChangeAvailabilityRequest);
    trigger_message(TriggerMessageRequest);

    // Firmware and diagnostics
    update_firmware(UpdateFirmwareRequest);
    /// Asks a local controller to serve a firmware image to its stations.
    publish_firmware(PublishFirmwareRequest);
    unpublish_firmware(UnpublishFirmwareRequest);
    get_log(GetLogRequest);
    customer_information(CustomerInformationRequest);
    clear_variable_monitoring(ClearVariableMonitoringRequest);

    // Data transfer
    data_transfer(DataTransferRequest);
    binary_data_transfer(BinaryDataTransferRequest);

    // Certificates
    /// Delivers a chain produced for an earlier SignCertificate request.
    certificate_signed(CertificateSignedRequest);
    install_certificate(InstallCertificateRequest);
    get_installed_certificate_ids(GetInstalledCertificateIdsRequest);
    delete_certificate(DeleteCertificateRequest);

    // Authorization
    get_local_list_version(GetLocalListVersionRequest);
    send_local_list(SendLocalListRequest);
    clear_cache(ClearCacheRequest);

    // Reservations and transactions
    reserve_now(ReserveNowRequest);
    cancel_reservation(CancelReservationRequest);
    request_start_transaction(RequestStartTransactionRequest);
    request_stop_transaction(RequestStopTransactionRequest);
    get_transaction_status(GetTransactionStatusRequest);

    // Smart charging
    set_charging_profile(SetChargingProfileRequest);
    get_charging_profiles(GetChargingProfilesRequest);
    clear_charging_profile(ClearChargingProfileRequest);
    get_composite_schedule(GetCompositeScheduleRequest);
    unlock_connector(UnlockConnectorRequest);

    // Display messages
    set_display_message(SetDisplayMessageRequest);
    get_display_messages(GetDisplayMessagesRequest);
    clear_display_message(ClearDisplayMessageRequest);
}
