use ocpp_protocol::{NodeId, error_codes};
use std::time::Duration;

/// Outcome class attached to every response and every response event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    SignatureError(String),
    UnknownOrUnreachable(NodeId),
    GenericError(String),
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// Why a call did not produce a regular response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("signature error: {0}")]
    Signature(String),
    #[error("unknown or unreachable networking node '{0}'")]
    UnknownOrUnreachable(NodeId),
    #[error("{0}")]
    Generic(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("{code}: {description}")]
    Remote { code: String, description: String },
    #[error("action '{0}' is not implemented")]
    NotImplemented(String),
    #[error("format violation: {0}")]
    FormatViolation(String),
    #[error("security error: {0}")]
    Security(String),
}

impl CallError {
    /// Folds the variant into the four-way result taxonomy.
    pub fn result_code(&self) -> ResultCode {
        match self {
            CallError::Signature(detail) => ResultCode::SignatureError(detail.clone()),
            CallError::UnknownOrUnreachable(node) => ResultCode::UnknownOrUnreachable(node.clone()),
            CallError::Remote { code, .. } if code == error_codes::SECURITY_ERROR => {
                ResultCode::SignatureError(self.to_string())
            }
            other => ResultCode::GenericError(other.to_string()),
        }
    }

    /// OCPP-J error code used when this error answers an inbound call.
    pub fn error_code(&self) -> &str {
        match self {
            CallError::Signature(_) | CallError::Security(_) => error_codes::SECURITY_ERROR,
            CallError::NotImplemented(_) => error_codes::NOT_IMPLEMENTED,
            CallError::FormatViolation(_) => error_codes::FORMAT_VIOLATION,
            CallError::Remote { code, .. } => code,
            CallError::UnknownOrUnreachable(_)
            | CallError::Generic(_)
            | CallError::Timeout(_) => error_codes::GENERIC_ERROR,
        }
    }
}

impl From<crate::signing::SignatureError> for CallError {
    fn from(e: crate::signing::SignatureError) -> Self {
        CallError::Signature(e.to_string())
    }
}

/// Result code for a finished call.
pub fn result_code_of<T>(result: &Result<T, CallError>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Success,
        Err(e) => e.result_code(),
    }
}
