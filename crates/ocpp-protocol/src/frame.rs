//! OCPP-J framing.
//!
//! ```text
//! [2, "<messageId>", "<action>", {payload}]            CALL
//! [2, "<messageId>", "<action>", {payload}, {routing}] CALL relayed through a hub
//! [3, "<messageId>", {payload}]                        CALLRESULT
//! [4, "<messageId>", "<code>", "<description>", {..}]  CALLERROR
//! ```
//!
//! The optional trailing routing object on a CALL names the final
//! destination (CSMS to hub) or the originating node (hub to CSMS).

use crate::{NodeId, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const CALL: u64 = 2;
pub const CALL_RESULT: u64 = 3;
pub const CALL_ERROR: u64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("unsupported message type id {0}")]
    UnsupportedMessageType(u64),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Addressing information for calls relayed through a networking hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub message_id: RequestId,
    pub action: String,
    pub payload: Value,
    pub routing: Option<Routing>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallResultFrame {
    pub message_id: RequestId,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorFrame {
    pub message_id: RequestId,
    pub code: String,
    pub description: String,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(CallFrame),
    CallResult(CallResultFrame),
    CallError(CallErrorFrame),
}

impl Frame {
    pub fn message_id(&self) -> &RequestId {
        match self {
            Frame::Call(f) => &f.message_id,
            Frame::CallResult(f) => &f.message_id,
            Frame::CallError(f) => &f.message_id,
        }
    }

    /// Parse a text WebSocket message into a frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut items) = value else {
            return Err(FrameError::NotAnArray);
        };
        if items.len() < 3 {
            return Err(FrameError::Malformed("too few elements"));
        }
        let type_id = items[0]
            .as_u64()
            .ok_or(FrameError::Malformed("message type id must be a number"))?;
        let message_id = match &items[1] {
            Value::String(s) => RequestId::new(s.clone()),
            _ => return Err(FrameError::Malformed("message id must be a string")),
        };

        match type_id {
            CALL => {
                if items.len() != 4 && items.len() != 5 {
                    return Err(FrameError::Malformed("CALL must have 4 or 5 elements"));
                }
                let routing = if items.len() == 5 {
                    Some(serde_json::from_value(items.remove(4))?)
                } else {
                    None
                };
                let payload = items.remove(3);
                let action = items[2]
                    .as_str()
                    .ok_or(FrameError::Malformed("action must be a string"))?
                    .to_owned();
                Ok(Frame::Call(CallFrame {
                    message_id,
                    action,
                    payload,
                    routing,
                }))
            }
            CALL_RESULT => {
                if items.len() != 3 {
                    return Err(FrameError::Malformed("CALLRESULT must have 3 elements"));
                }
                Ok(Frame::CallResult(CallResultFrame {
                    message_id,
                    payload: items.remove(2),
                }))
            }
            CALL_ERROR => {
                if items.len() < 4 {
                    return Err(FrameError::Malformed("CALLERROR must have 5 elements"));
                }
                let details = if items.len() > 4 {
                    items.remove(4)
                } else {
                    json!({})
                };
                let code = items[2]
                    .as_str()
                    .ok_or(FrameError::Malformed("error code must be a string"))?
                    .to_owned();
                let description = items[3].as_str().unwrap_or_default().to_owned();
                Ok(Frame::CallError(CallErrorFrame {
                    message_id,
                    code,
                    description,
                    details,
                }))
            }
            other => Err(FrameError::UnsupportedMessageType(other)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Frame::Call(f) => match &f.routing {
                Some(routing) => json!([
                    CALL,
                    f.message_id,
                    f.action,
                    f.payload,
                    serde_json::to_value(routing).unwrap_or(Value::Null)
                ]),
                None => json!([CALL, f.message_id, f.action, f.payload]),
            },
            Frame::CallResult(f) => json!([CALL_RESULT, f.message_id, f.payload]),
            Frame::CallError(f) => {
                json!([CALL_ERROR, f.message_id, f.code, f.description, f.details])
            }
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_call() {
        let frame = Frame::parse(r#"[2,"19223201","Heartbeat",{}]"#).unwrap();
        match frame {
            Frame::Call(call) => {
                assert_eq!(call.message_id.as_str(), "19223201");
                assert_eq!(call.action, "Heartbeat");
                assert_eq!(call.payload, json!({}));
                assert!(call.routing.is_none());
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn parses_relayed_call_with_source() {
        let text = r#"[2,"7","Heartbeat",{},{"source":"cs-behind-hub"}]"#;
        let Frame::Call(call) = Frame::parse(text).unwrap() else {
            panic!("expected Call");
        };
        assert_eq!(
            call.routing.unwrap().source,
            Some(NodeId::from("cs-behind-hub"))
        );
    }

    #[test]
    fn call_error_without_details_gets_empty_object() {
        let Frame::CallError(err) =
            Frame::parse(r#"[4,"1","NotImplemented","no handler"]"#).unwrap()
        else {
            panic!("expected CallError");
        };
        assert_eq!(err.code, "NotImplemented");
        assert_eq!(err.description, "no handler");
        assert_eq!(err.details, json!({}));
    }

    #[test]
    fn rejects_unknown_type_and_non_arrays() {
        assert!(matches!(
            Frame::parse(r#"[9,"1",{}]"#),
            Err(FrameError::UnsupportedMessageType(9))
        ));
        assert!(matches!(
            Frame::parse(r#"{"kind":"call"}"#),
            Err(FrameError::NotAnArray)
        ));
        assert!(matches!(
            Frame::parse(r#"[2,1,"Heartbeat",{}]"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn relayed_call_encodes_trailing_routing_element() {
        let frame = Frame::Call(CallFrame {
            message_id: RequestId::from(900_001),
            action: "Reset".to_owned(),
            payload: json!({"type": "Immediate"}),
            routing: Some(Routing {
                source: None,
                destination: Some(NodeId::from("cs-2")),
            }),
        });
        assert_eq!(
            frame.to_value(),
            json!([2, "900001", "Reset", {"type": "Immediate"}, {"destination": "cs-2"}])
        );
        assert_eq!(Frame::parse(&frame.to_text()).unwrap(), frame);
    }
}
