//! CSMS configuration loading.
//!
//! TOML is the config source. The binary reads the path from `CSMS_CONFIG`,
//! falling back to `/etc/ocpp-csms/csms.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! # Signing key file format
//! A 32-byte Ed25519 seed as hex on a single line; trimmed on read.

use crate::certificates::CaSigner;
use crate::signing::Ed25519Policy;
use ed25519_dalek::VerifyingKey;
use ocpp_protocol::{NodeId, RegistrationStatus};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ocpp-csms/csms.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CsmsConfig {
    pub schema_version: u32,
    pub csms_id: String,
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub signing: SigningConfig,
    pub certificates: CertificatesConfig,
    pub basic_auth: Vec<BasicAuthEntry>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub require_basic_auth: bool,
    /// Idle time after which a station session is dropped.
    pub session_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub default_request_timeout: Duration,
    pub heartbeat_interval_secs: i32,
    pub boot_registration_status: RegistrationStatus,
    /// Only this vendor id gets `Accepted` on (binary) data transfers.
    pub accepted_vendor_id: String,
    pub station_lock_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
    pub key_file: Option<String>,
    pub key_id: Option<String>,
    pub require_signatures: bool,
    pub trusted_keys: Vec<TrustedKey>,
}

#[derive(Debug, Clone)]
pub struct TrustedKey {
    pub key_id: String,
    /// Hex-encoded 32-byte Ed25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone)]
pub struct CertificatesConfig {
    pub sign_delay: Duration,
    /// PEM CA certificate and key used to answer SignCertificate. Without
    /// them SignCertificate is rejected.
    pub ca_cert_file: Option<String>,
    pub ca_key_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BasicAuthEntry {
    pub node_id: NodeId,
    pub password: String,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            csms_id: "CSMS".to_owned(),
            server: ServerConfig::default(),
            protocol: ProtocolConfig::default(),
            signing: SigningConfig::default(),
            certificates: CertificatesConfig::default(),
            basic_auth: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9000".to_owned(),
            require_basic_auth: false,
            session_timeout: Duration::from_secs(600),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: Duration::from_secs(30),
            heartbeat_interval_secs: 300,
            boot_registration_status: RegistrationStatus::Accepted,
            accepted_vendor_id: "ocpp-csms".to_owned(),
            station_lock_timeout: Duration::from_millis(5000),
        }
    }
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            sign_delay: Duration::from_secs(2),
            ca_cert_file: None,
            ca_key_file: None,
        }
    }
}

impl SigningConfig {
    /// Builds the default signature policy: loads the key file if one is
    /// configured and trusts the listed public keys.
    pub fn build_policy(&self) -> Result<Ed25519Policy, ConfigError> {
        let mut policy = Ed25519Policy::new().require_signatures(self.require_signatures);
        if let Some(path) = &self.key_file {
            let seed = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(format!("reading key file '{path}': {e}")))?;
            policy = policy
                .with_seed_hex(self.key_id.as_deref().unwrap_or(""), &seed)
                .map_err(|e| ConfigError::InvalidValue(format!("signing.key_file: {e}")))?;
        }
        for (i, trusted) in self.trusted_keys.iter().enumerate() {
            let key = parse_public_key(&trusted.public_key).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "signing.trusted_keys[{i}].public_key is not a 32-byte hex Ed25519 key"
                ))
            })?;
            policy = policy.trust(trusted.key_id.clone(), key);
        }
        Ok(policy)
    }
}

impl CertificatesConfig {
    /// Loads the configured CA, if any.
    pub fn build_signer(&self) -> Result<Option<CaSigner>, ConfigError> {
        let (Some(cert_path), Some(key_path)) = (&self.ca_cert_file, &self.ca_key_file) else {
            return Ok(None);
        };
        let cert = std::fs::read_to_string(cert_path)
            .map_err(|e| ConfigError::Io(format!("reading CA certificate '{cert_path}': {e}")))?;
        let key = std::fs::read_to_string(key_path)
            .map_err(|e| ConfigError::Io(format!("reading CA key '{key_path}': {e}")))?;
        CaSigner::from_pem(&cert, &key)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("certificates CA: {e}")))
    }
}

fn parse_public_key(hex_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim()).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    csms_id: Option<String>,
    server: Option<RawServerConfig>,
    protocol: Option<RawProtocolConfig>,
    signing: Option<RawSigningConfig>,
    certificates: Option<RawCertificatesConfig>,
    basic_auth: Option<Vec<RawBasicAuthEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
    require_basic_auth: Option<bool>,
    session_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawProtocolConfig {
    default_request_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<i32>,
    boot_registration_status: Option<String>,
    accepted_vendor_id: Option<String>,
    station_lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSigningConfig {
    key_file: Option<String>,
    key_id: Option<String>,
    require_signatures: Option<bool>,
    trusted_keys: Option<Vec<RawTrustedKey>>,
}

#[derive(Debug, Deserialize)]
struct RawTrustedKey {
    key_id: Option<String>,
    public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCertificatesConfig {
    sign_delay_secs: Option<u64>,
    ca_cert_file: Option<String>,
    ca_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBasicAuthEntry {
    node_id: Option<String>,
    password: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<CsmsConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Loads from `CSMS_CONFIG`, or the default path if it is unset.
pub fn load_config() -> Result<CsmsConfig, ConfigError> {
    let path = std::env::var("CSMS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    load_config_from_path(Path::new(&path))
}

pub fn load_config_from_str(toml_str: &str) -> Result<CsmsConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = CsmsConfig::default();

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let server = match raw.server {
        Some(s) => ServerConfig {
            bind: s.bind.unwrap_or(defaults.server.bind),
            require_basic_auth: s
                .require_basic_auth
                .unwrap_or(defaults.server.require_basic_auth),
            session_timeout: s
                .session_timeout_secs
                .map_or(defaults.server.session_timeout, Duration::from_secs),
        },
        None => defaults.server,
    };

    let protocol = match raw.protocol {
        Some(p) => {
            let boot_registration_status = match p.boot_registration_status.as_deref() {
                None => defaults.protocol.boot_registration_status,
                Some("Accepted") => RegistrationStatus::Accepted,
                Some("Pending") => RegistrationStatus::Pending,
                Some("Rejected") => RegistrationStatus::Rejected,
                Some(other) => {
                    return Err(ConfigError::InvalidValue(format!(
                        "protocol.boot_registration_status must be Accepted, Pending or Rejected, got '{other}'"
                    )));
                }
            };
            let heartbeat_interval_secs = p
                .heartbeat_interval_secs
                .unwrap_or(defaults.protocol.heartbeat_interval_secs);
            if heartbeat_interval_secs <= 0 {
                return Err(ConfigError::InvalidValue(
                    "protocol.heartbeat_interval_secs must be positive".to_owned(),
                ));
            }
            ProtocolConfig {
                default_request_timeout: p
                    .default_request_timeout_secs
                    .map_or(defaults.protocol.default_request_timeout, Duration::from_secs),
                heartbeat_interval_secs,
                boot_registration_status,
                accepted_vendor_id: p
                    .accepted_vendor_id
                    .unwrap_or(defaults.protocol.accepted_vendor_id),
                station_lock_timeout: p
                    .station_lock_timeout_ms
                    .map_or(defaults.protocol.station_lock_timeout, Duration::from_millis),
            }
        }
        None => defaults.protocol,
    };

    let signing = match raw.signing {
        Some(s) => {
            let mut trusted_keys = Vec::new();
            for (i, k) in s.trusted_keys.unwrap_or_default().into_iter().enumerate() {
                trusted_keys.push(TrustedKey {
                    key_id: k.key_id.ok_or_else(|| {
                        ConfigError::MissingField(format!("signing.trusted_keys[{i}].key_id"))
                    })?,
                    public_key: k.public_key.ok_or_else(|| {
                        ConfigError::MissingField(format!("signing.trusted_keys[{i}].public_key"))
                    })?,
                });
            }
            SigningConfig {
                key_file: s.key_file,
                key_id: s.key_id,
                require_signatures: s.require_signatures.unwrap_or(false),
                trusted_keys,
            }
        }
        None => defaults.signing,
    };

    let certificates = match raw.certificates {
        Some(c) => {
            if c.ca_cert_file.is_some() != c.ca_key_file.is_some() {
                return Err(ConfigError::InvalidValue(
                    "certificates.ca_cert_file and certificates.ca_key_file must be set together"
                        .to_owned(),
                ));
            }
            CertificatesConfig {
                sign_delay: c
                    .sign_delay_secs
                    .map_or(defaults.certificates.sign_delay, Duration::from_secs),
                ca_cert_file: c.ca_cert_file,
                ca_key_file: c.ca_key_file,
            }
        }
        None => defaults.certificates,
    };

    let mut basic_auth = Vec::new();
    for (i, entry) in raw.basic_auth.unwrap_or_default().into_iter().enumerate() {
        let node_id = entry
            .node_id
            .ok_or_else(|| ConfigError::MissingField(format!("basic_auth[{i}].node_id")))?;
        let password = entry
            .password
            .ok_or_else(|| ConfigError::MissingField(format!("basic_auth[{i}].password")))?;
        basic_auth.push(BasicAuthEntry {
            node_id: NodeId::from(node_id),
            password,
        });
    }
    if server.require_basic_auth && basic_auth.is_empty() {
        return Err(ConfigError::InvalidValue(
            "server.require_basic_auth is set but no [[basic_auth]] entries are configured"
                .to_owned(),
        ));
    }

    Ok(CsmsConfig {
        schema_version,
        csms_id: raw.csms_id.unwrap_or(defaults.csms_id),
        server,
        protocol,
        signing,
        certificates,
        basic_auth,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = load_config_from_str("schema_version = 1\n").unwrap();
        assert_eq!(cfg.csms_id, "CSMS");
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert!(!cfg.server.require_basic_auth);
        assert_eq!(cfg.server.session_timeout, Duration::from_secs(600));
        assert_eq!(cfg.protocol.default_request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.protocol.heartbeat_interval_secs, 300);
        assert_eq!(cfg.protocol.boot_registration_status, RegistrationStatus::Accepted);
        assert_eq!(cfg.protocol.accepted_vendor_id, "ocpp-csms");
        assert_eq!(cfg.protocol.station_lock_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.certificates.sign_delay, Duration::from_secs(2));
        assert!(cfg.basic_auth.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let cfg = load_config_from_str(
            r#"
schema_version = 1
csms_id = "csms-eu-1"

[server]
bind = "127.0.0.1:9100"
require_basic_auth = true
session_timeout_secs = 60

[protocol]
default_request_timeout_secs = 5
heartbeat_interval_secs = 120
boot_registration_status = "Pending"
accepted_vendor_id = "acme"
station_lock_timeout_ms = 250

[signing]
key_id = "csms-key"
require_signatures = true

[[signing.trusted_keys]]
key_id = "station-key"
public_key = "0000000000000000000000000000000000000000000000000000000000000000"

[certificates]
sign_delay_secs = 0
ca_cert_file = "/etc/ocpp-csms/ca.pem"
ca_key_file = "/etc/ocpp-csms/ca.key"

[[basic_auth]]
node_id = "cs-1"
password = "secret"
"#,
        )
        .unwrap();
        assert_eq!(cfg.csms_id, "csms-eu-1");
        assert_eq!(cfg.server.bind, "127.0.0.1:9100");
        assert!(cfg.server.require_basic_auth);
        assert_eq!(cfg.protocol.default_request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.protocol.boot_registration_status, RegistrationStatus::Pending);
        assert_eq!(cfg.protocol.accepted_vendor_id, "acme");
        assert_eq!(cfg.protocol.station_lock_timeout, Duration::from_millis(250));
        assert!(cfg.signing.require_signatures);
        assert_eq!(cfg.signing.trusted_keys[0].key_id, "station-key");
        assert_eq!(cfg.certificates.sign_delay, Duration::ZERO);
        assert_eq!(cfg.certificates.ca_key_file.as_deref(), Some("/etc/ocpp-csms/ca.key"));
        assert_eq!(cfg.basic_auth[0].node_id, NodeId::from("cs-1"));
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        assert!(matches!(
            load_config_from_str("csms_id = \"x\"\n"),
            Err(ConfigError::MissingField(f)) if f == "schema_version"
        ));
    }

    #[test]
    fn bad_registration_status_is_rejected() {
        let err = load_config_from_str(
            "schema_version = 1\n[protocol]\nboot_registration_status = \"Maybe\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn basic_auth_required_without_entries_is_rejected() {
        let err = load_config_from_str("schema_version = 1\n[server]\nrequire_basic_auth = true\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn half_configured_ca_is_rejected() {
        let err = load_config_from_str(
            "schema_version = 1\n[certificates]\nca_cert_file = \"/tmp/ca.pem\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
        assert!(CertificatesConfig::default().build_signer().unwrap().is_none());
    }

    #[test]
    fn signing_key_file_is_loaded() {
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(key_file, "{}", hex::encode([3u8; 32])).unwrap();

        let signing = SigningConfig {
            key_file: Some(key_file.path().display().to_string()),
            key_id: Some("csms-key".to_owned()),
            ..SigningConfig::default()
        };
        let policy = signing.build_policy().unwrap();
        assert_eq!(policy.key_id(), Some("csms-key"));
    }

    #[test]
    fn load_from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "schema_version = 1\ncsms_id = \"from-file\"\n").unwrap();
        let cfg = load_config_from_path(file.path()).unwrap();
        assert_eq!(cfg.csms_id, "from-file");
    }
}
