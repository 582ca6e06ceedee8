pub mod auth;
pub mod certificates;
pub mod channel;
pub mod config;
pub mod csms;
pub mod error;
pub mod events;
mod inbound;
pub mod outbound;
pub mod request_id;
pub mod routing;
pub mod signing;
pub mod stations;
pub mod ws_station;

pub use crate::csms::{Csms, CsmsBuilder, Request};
pub use channel::{CallContext, CallHandler, Channel, ConnectionInfo, OutgoingCall};
pub use error::{CallError, ResultCode};
pub use ws_station::{StationServer, StationServerOptions};

use config::CsmsConfig;
use std::sync::Arc;

/// Builds the station endpoint for `csms` and seeds its Basic Auth table
/// from `[[basic_auth]]`.
pub async fn build_station_server(csms: &Arc<Csms>, config: &CsmsConfig) -> Arc<StationServer> {
    let handler: Arc<dyn CallHandler> = Arc::clone(csms) as Arc<dyn CallHandler>;
    let server = StationServer::new(
        handler,
        StationServerOptions {
            id: "stations".to_owned(),
            require_basic_auth: config.server.require_basic_auth,
            session_timeout: config.server.session_timeout,
        },
    );
    for entry in &config.basic_auth {
        server
            .add_or_update_http_basic_auth(&entry.node_id, &entry.password)
            .await;
    }
    server
}
