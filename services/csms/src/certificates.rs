//! Certificate signing for SignCertificate requests.
//!
//! The immediate SignCertificate answer only says whether the CSR was
//! well-formed and queued. The chain is produced later by a detached task
//! and pushed to the station with a CertificateSigned call.

use crate::csms::{Csms, Request};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ocpp_protocol::{CertificateSignedRequest, CertificateSigningUse, NodeId};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

const CSR_BEGIN: &str = "-----BEGIN CERTIFICATE REQUEST-----";
const CSR_END: &str = "-----END CERTIFICATE REQUEST-----";
/// ASN.1 SEQUENCE, the outer tag of every DER encoded PKCS#10 request.
const DER_SEQUENCE: u8 = 0x30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    #[error("CSR is not a PEM CERTIFICATE REQUEST block")]
    NotPem,
    #[error("CSR body is empty")]
    Empty,
    #[error("CSR body is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("CSR body is not a DER sequence")]
    NotDer,
    #[error("signer failed: {0}")]
    Signer(String),
}

/// Produces a PEM certificate chain (leaf first) for a CSR.
#[async_trait]
pub trait CertificateSigner: Send + Sync {
    async fn sign(
        &self,
        csr_pem: &str,
        usage: Option<CertificateSigningUse>,
    ) -> Result<String, CertificateError>;
}

/// Checks the PEM envelope and returns the DER body.
pub fn parse_csr_pem(pem: &str) -> Result<Vec<u8>, CertificateError> {
    let body = pem
        .trim()
        .strip_prefix(CSR_BEGIN)
        .and_then(|rest| rest.strip_suffix(CSR_END))
        .ok_or(CertificateError::NotPem)?;
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(CertificateError::Empty);
    }
    let der = STANDARD
        .decode(compact)
        .map_err(|e| CertificateError::InvalidBase64(e.to_string()))?;
    if der.first() != Some(&DER_SEQUENCE) {
        return Err(CertificateError::NotDer);
    }
    Ok(der)
}

/// Waits `delay`, asks `signer` for a chain and sends it to `destination`.
///
/// The task owns everything it needs; failures end up in the log only.
pub(crate) fn spawn_certificate_signing(
    csms: Arc<Csms>,
    signer: Arc<dyn CertificateSigner>,
    destination: NodeId,
    csr_pem: String,
    usage: Option<CertificateSigningUse>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let chain = match signer.sign(&csr_pem, usage).await {
            Ok(chain) => chain,
            Err(e) => {
                error!(node_id = %destination, error = %e, "certificate signing failed");
                return;
            }
        };

        let request = Request::new(
            destination.clone(),
            CertificateSignedRequest {
                certificate_chain: chain,
                certificate_type: usage,
            },
        );
        match csms.certificate_signed(request).await {
            Ok(response) => {
                info!(node_id = %destination, status = ?response.status, "signed certificate delivered");
            }
            Err(e) => {
                error!(node_id = %destination, error = %e, "delivering signed certificate failed");
            }
        }
    })
}

// ---------------------------------------------------------------------------
// CA signer
// ---------------------------------------------------------------------------

/// Signs CSRs with a local certificate authority.
pub struct CaSigner {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl CaSigner {
    /// Loads an existing CA from PEM certificate and private key.
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, CertificateError> {
        let ca_key = KeyPair::from_pem(ca_key_pem).map_err(signer_error)?;
        let params = CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(signer_error)?;
        let ca_cert = params.self_signed(&ca_key).map_err(signer_error)?;
        Ok(Self { ca_cert, ca_key })
    }

    /// Creates a fresh self-signed CA with the given common name.
    pub fn generate(common_name: &str) -> Result<Self, CertificateError> {
        let ca_key = KeyPair::generate().map_err(signer_error)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(signer_error)?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, common_name);
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).map_err(signer_error)?;
        Ok(Self { ca_cert, ca_key })
    }

    pub fn ca_certificate_pem(&self) -> String {
        self.ca_cert.pem()
    }
}

#[async_trait]
impl CertificateSigner for CaSigner {
    async fn sign(
        &self,
        csr_pem: &str,
        _usage: Option<CertificateSigningUse>,
    ) -> Result<String, CertificateError> {
        let csr = CertificateSigningRequestParams::from_pem(csr_pem).map_err(signer_error)?;
        let leaf = csr
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(signer_error)?;
        Ok(format!("{}{}", leaf.pem(), self.ca_cert.pem()))
    }
}

fn signer_error(e: rcgen::Error) -> CertificateError {
    CertificateError::Signer(e.to_string())
}
