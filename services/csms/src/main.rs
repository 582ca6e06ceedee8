use csms::{Csms, build_station_server};
use csms::certificates::CertificateSigner;
use csms::channel::Channel;
use csms::config::load_config;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let mut builder = Csms::builder(config.clone());
    match config.certificates.build_signer() {
        Ok(Some(signer)) => {
            info!("certificate authority loaded");
            builder = builder.certificate_signer(Arc::new(signer) as Arc<dyn CertificateSigner>);
        }
        Ok(None) => info!("no certificate authority configured; SignCertificate will be rejected"),
        Err(e) => {
            error!(error = %e, "failed to load certificate authority");
            std::process::exit(1);
        }
    }
    let csms = match builder.build() {
        Ok(csms) => csms,
        Err(e) => {
            error!(error = %e, "failed to build CSMS");
            std::process::exit(1);
        }
    };

    let server = build_station_server(&csms, &config).await;
    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.server.bind, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %config.server.bind, csms_id = %csms.id(), "CSMS listening");

    tokio::select! {
        result = Arc::clone(&server).serve(listener) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            server.shutdown(Some("CSMS shutting down"), SHUTDOWN_WAIT).await;
        }
    }
    info!("CSMS stopped");
}
