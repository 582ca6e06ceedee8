// ocpp-protocol: OCPP 2.1 wire vocabulary shared by the CSMS and its test tools.
//
// Frames follow OCPP-J (JSON arrays tagged by message type id). Payloads are
// plain serde structs with camelCase field names; the action name and the
// response type of every call are attached through the `Operation` trait.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod frame;
pub mod messages;

pub use frame::{CallErrorFrame, CallFrame, CallResultFrame, Frame, FrameError, Routing};
pub use messages::*;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a networking node: a charging station, a hub, or the CSMS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// OCPP-J message id used to correlate a CALL with its CALLRESULT/CALLERROR.
///
/// Ids generated by the CSMS are decimal counters; ids chosen by stations are
/// arbitrary strings of at most 36 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Message signatures
// ---------------------------------------------------------------------------

/// JSON member carrying message signatures inside a payload object.
pub const SIGNATURES_FIELD: &str = "signatures";

/// One signature attached to a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// Identifies the key the verifier should use.
    pub key_id: String,
    /// Encoded signature bytes.
    pub value: String,
    /// E.g. "Ed25519".
    pub signing_method: String,
    /// E.g. "base64".
    pub encoding_method: String,
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// OCPP-J CALLERROR codes.
pub mod error_codes {
    pub const FORMAT_VIOLATION: &str = "FormatViolation";
    pub const GENERIC_ERROR: &str = "GenericError";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const MESSAGE_TYPE_NOT_SUPPORTED: &str = "MessageTypeNotSupported";
    pub const NOT_IMPLEMENTED: &str = "NotImplemented";
    pub const NOT_SUPPORTED: &str = "NotSupported";
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
    pub const RPC_FRAMEWORK_ERROR: &str = "RpcFrameworkError";
    pub const SECURITY_ERROR: &str = "SecurityError";
}
