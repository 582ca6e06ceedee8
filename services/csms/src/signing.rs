//! Message signing and verification.
//!
//! Signatures travel inside the JSON payload as a `signatures` array. The
//! signed bytes are the payload without that member, serialized compactly
//! with object keys in sorted order.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use ocpp_protocol::{SIGNATURES_FIELD, Signature};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub const ED25519_METHOD: &str = "Ed25519";
pub const BASE64_ENCODING: &str = "base64";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed signatures member: {0}")]
    Malformed(String),
    #[error("message carries no signature")]
    Missing,
    #[error("unknown signing key '{0}'")]
    UnknownKey(String),
    #[error("unsupported signature method '{0}'")]
    UnsupportedMethod(String),
    #[error("signature of key '{0}' does not match the message")]
    Invalid(String),
    #[error("invalid key material: {0}")]
    Key(String),
}

// ---------------------------------------------------------------------------
// Signed message
// ---------------------------------------------------------------------------

/// A payload split into its signable body and the signatures attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedMessage {
    pub action: String,
    pub payload: Value,
    pub signatures: Vec<Signature>,
}

impl SignedMessage {
    /// Splits the `signatures` member off a payload object.
    pub fn from_payload(action: &str, payload: Value) -> Result<Self, SignatureError> {
        let Value::Object(mut members) = payload else {
            return Err(SignatureError::NotAnObject);
        };
        let signatures = match members.remove(SIGNATURES_FIELD) {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw)
                .map_err(|e| SignatureError::Malformed(e.to_string()))?,
        };
        Ok(Self {
            action: action.to_owned(),
            payload: Value::Object(members),
            signatures,
        })
    }

    /// Bytes covered by a signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_json(&self.payload).to_string().into_bytes()
    }

    /// Payload with the signatures merged back in, if there are any.
    pub fn into_payload(self) -> Value {
        let mut payload = self.payload;
        if self.signatures.is_empty() {
            return payload;
        }
        if let (Value::Object(members), Ok(signatures)) =
            (&mut payload, serde_json::to_value(&self.signatures))
        {
            members.insert(SIGNATURES_FIELD.to_owned(), signatures);
        }
        payload
    }
}

/// Rebuilds every object with its keys in sorted order.
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(members) => {
            let mut keys: Vec<&String> = members.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&members[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

pub trait SignaturePolicy: Send + Sync {
    fn sign_request(&self, message: &mut SignedMessage) -> Result<(), SignatureError>;
    fn sign_response(&self, message: &mut SignedMessage) -> Result<(), SignatureError>;
    fn verify_request(&self, message: &SignedMessage) -> Result<(), SignatureError>;
    fn verify_response(&self, message: &SignedMessage) -> Result<(), SignatureError>;
}

/// Ordered, never-empty set of policies. The first one is active.
pub struct SignaturePolicies {
    policies: RwLock<Vec<Arc<dyn SignaturePolicy>>>,
}

impl SignaturePolicies {
    pub fn new(default: Arc<dyn SignaturePolicy>) -> Self {
        Self {
            policies: RwLock::new(vec![default]),
        }
    }

    pub fn push(&self, policy: Arc<dyn SignaturePolicy>) {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(policy);
    }

    pub fn len(&self) -> usize {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn active(&self) -> Arc<dyn SignaturePolicy> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&policies[0])
    }

    pub fn sign_request(&self, action: &str, payload: Value) -> Result<Value, SignatureError> {
        let mut message = SignedMessage::from_payload(action, payload)?;
        self.active().sign_request(&mut message)?;
        Ok(message.into_payload())
    }

    pub fn sign_response(&self, action: &str, payload: Value) -> Result<Value, SignatureError> {
        let mut message = SignedMessage::from_payload(action, payload)?;
        self.active().sign_response(&mut message)?;
        Ok(message.into_payload())
    }

    /// Verifies an inbound request and returns its payload without signatures.
    pub fn verify_request(&self, action: &str, payload: Value) -> Result<Value, SignatureError> {
        let message = SignedMessage::from_payload(action, payload)?;
        self.active().verify_request(&message)?;
        Ok(message.payload)
    }

    /// Verifies the response to an outbound call and returns its payload
    /// without signatures.
    pub fn verify_response(&self, action: &str, payload: Value) -> Result<Value, SignatureError> {
        let message = SignedMessage::from_payload(action, payload)?;
        self.active().verify_response(&message)?;
        Ok(message.payload)
    }
}

// ---------------------------------------------------------------------------
// Ed25519
// ---------------------------------------------------------------------------

/// Signs with an optional Ed25519 key and verifies against a set of trusted
/// public keys. Without a key and without `require_signatures` it passes
/// messages through untouched.
pub struct Ed25519Policy {
    signing: Option<(String, SigningKey)>,
    trusted: HashMap<String, VerifyingKey>,
    require_signatures: bool,
}

impl Ed25519Policy {
    pub fn new() -> Self {
        Self {
            signing: None,
            trusted: HashMap::new(),
            require_signatures: false,
        }
    }

    /// Signs outgoing messages with `key`; its public half is trusted too.
    pub fn with_signing_key(mut self, key_id: impl Into<String>, key: SigningKey) -> Self {
        let key_id = key_id.into();
        self.trusted.insert(key_id.clone(), key.verifying_key());
        self.signing = Some((key_id, key));
        self
    }

    /// Loads a 32-byte seed given as hex. An empty `key_id` is replaced by
    /// the key fingerprint.
    pub fn with_seed_hex(self, key_id: &str, seed_hex: &str) -> Result<Self, SignatureError> {
        let seed = hex::decode(seed_hex.trim()).map_err(|e| SignatureError::Key(e.to_string()))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| SignatureError::Key("seed must be 32 bytes".to_owned()))?;
        let key = SigningKey::from_bytes(&seed);
        let key_id = if key_id.is_empty() {
            key_fingerprint(&key.verifying_key())
        } else {
            key_id.to_owned()
        };
        Ok(self.with_signing_key(key_id, key))
    }

    pub fn trust(mut self, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.trusted.insert(key_id.into(), key);
        self
    }

    pub fn require_signatures(mut self, require: bool) -> Self {
        self.require_signatures = require;
        self
    }

    pub fn key_id(&self) -> Option<&str> {
        self.signing.as_ref().map(|(id, _)| id.as_str())
    }

    fn sign(&self, message: &mut SignedMessage) {
        let Some((key_id, key)) = &self.signing else {
            return;
        };
        let signature = key.sign(&message.canonical_bytes());
        message.signatures.push(Signature {
            key_id: key_id.clone(),
            value: STANDARD.encode(signature.to_bytes()),
            signing_method: ED25519_METHOD.to_owned(),
            encoding_method: BASE64_ENCODING.to_owned(),
        });
    }

    fn verify(&self, message: &SignedMessage) -> Result<(), SignatureError> {
        if message.signatures.is_empty() {
            return if self.require_signatures {
                Err(SignatureError::Missing)
            } else {
                Ok(())
            };
        }

        let bytes = message.canonical_bytes();
        for signature in &message.signatures {
            if signature.signing_method != ED25519_METHOD {
                return Err(SignatureError::UnsupportedMethod(
                    signature.signing_method.clone(),
                ));
            }
            if signature.encoding_method != BASE64_ENCODING {
                return Err(SignatureError::UnsupportedMethod(
                    signature.encoding_method.clone(),
                ));
            }
            let key = self
                .trusted
                .get(&signature.key_id)
                .ok_or_else(|| SignatureError::UnknownKey(signature.key_id.clone()))?;
            let raw = STANDARD
                .decode(&signature.value)
                .map_err(|e| SignatureError::Malformed(e.to_string()))?;
            let parsed = ed25519_dalek::Signature::from_slice(&raw)
                .map_err(|e| SignatureError::Malformed(e.to_string()))?;
            key.verify(&bytes, &parsed)
                .map_err(|_| SignatureError::Invalid(signature.key_id.clone()))?;
        }
        Ok(())
    }
}

impl Default for Ed25519Policy {
    fn default() -> Self {
        Self::new()
    }
}

impl SignaturePolicy for Ed25519Policy {
    fn sign_request(&self, message: &mut SignedMessage) -> Result<(), SignatureError> {
        self.sign(message);
        Ok(())
    }

    fn sign_response(&self, message: &mut SignedMessage) -> Result<(), SignatureError> {
        self.sign(message);
        Ok(())
    }

    fn verify_request(&self, message: &SignedMessage) -> Result<(), SignatureError> {
        self.verify(message)
    }

    fn verify_response(&self, message: &SignedMessage) -> Result<(), SignatureError> {
        self.verify(message)
    }
}

/// First 8 bytes of the SHA-256 of the public key, hex encoded.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}
