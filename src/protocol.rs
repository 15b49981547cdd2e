//! Request/response/notification envelope protocol (C4).
//!
//! An [`Envelope`] is the unit the [`crate::channel::Channel`] sends and receives; framing
//! and serialization below it are concerned only with bytes, never with envelope shape.

use crate::ids::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wire protocol version negotiated during `__handshake__`.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Notification,
}

/// A well-formed error payload on a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request / response / notification envelope.
///
/// A response carries exactly one of `result` or `error`; requests and notifications
/// carry `method` (+ optional `params`); only requests and responses carry `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub protocol_version: u32,
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

pub fn create_request(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Envelope {
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        kind: EnvelopeKind::Request,
        id: Some(id),
        method: Some(method.into()),
        params,
        result: None,
        error: None,
    }
}

pub fn create_response(id: RequestId, result: Value) -> Envelope {
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        kind: EnvelopeKind::Response,
        id: Some(id),
        method: None,
        params: None,
        result: Some(result),
        error: None,
    }
}

pub fn create_error_response(id: RequestId, error: ErrorObject) -> Envelope {
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        kind: EnvelopeKind::Response,
        id: Some(id),
        method: None,
        params: None,
        result: None,
        error: Some(error),
    }
}

pub fn create_notification(method: impl Into<String>, params: Option<Value>) -> Envelope {
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        kind: EnvelopeKind::Notification,
        id: None,
        method: Some(method.into()),
        params,
        result: None,
        error: None,
    }
}

/// Outcome of classifying a raw decoded value as an envelope.
///
/// `Invalid` never raises — the caller (the channel) decides how to react, e.g. by
/// returning a protocol-error response when the raw value carried an id.
pub enum Parsed {
    Request(Envelope),
    Response(Envelope),
    Notification(Envelope),
    Invalid { raw: Value, reason: String },
}

pub fn parse(raw: Value) -> Parsed {
    let envelope: Envelope = match serde_json::from_value(raw.clone()) {
        Ok(e) => e,
        Err(e) => {
            return Parsed::Invalid {
                raw,
                reason: e.to_string(),
            }
        }
    };

    match envelope.kind {
        EnvelopeKind::Request => {
            if envelope.method.as_deref().unwrap_or("").is_empty() || envelope.id.is_none() {
                Parsed::Invalid {
                    raw,
                    reason: "request envelope missing method or id".into(),
                }
            } else {
                Parsed::Request(envelope)
            }
        }
        EnvelopeKind::Notification => {
            if envelope.method.as_deref().unwrap_or("").is_empty() {
                Parsed::Invalid {
                    raw,
                    reason: "notification envelope missing method".into(),
                }
            } else {
                Parsed::Notification(envelope)
            }
        }
        EnvelopeKind::Response => {
            let has_result = envelope.result.is_some();
            let has_error = envelope.error.is_some();
            if envelope.id.is_none() || has_result == has_error {
                Parsed::Invalid {
                    raw,
                    reason: "response envelope must carry exactly one of result/error".into(),
                }
            } else {
                Parsed::Response(envelope)
            }
        }
    }
}

/// Methods matching `^__.*__$` are reserved for this core's own wire protocol
/// (handshake, heartbeat, data-channel signalling, shutdown) and may never be
/// registered by user code.
pub fn is_reserved_method(method: &str) -> bool {
    method.len() >= 4 && method.starts_with("__") && method.ends_with("__")
}

pub fn validate_user_method(method: &str) -> crate::error::Result<()> {
    if method.is_empty() {
        return Err(crate::error::CoreError::Protocol(
            "method must be non-empty".into(),
        ));
    }
    if is_reserved_method(method) {
        return Err(crate::error::CoreError::ReservedMethod(method.to_string()));
    }
    Ok(())
}

/// Reserved method names used by the control-channel wire protocol (§6).
pub mod reserved {
    pub const HANDSHAKE: &str = "__handshake__";
    pub const HEARTBEAT_PING: &str = "__heartbeat_ping__";
    pub const HEARTBEAT_PONG: &str = "__heartbeat_pong__";
    pub const DATA_CHANNEL_READY: &str = "__data_channel_ready__";
    pub const DATA_CHANNEL_ERROR: &str = "__data_channel_error__";
    pub const SHUTDOWN: &str = "__shutdown__";
    pub const SHUTDOWN_COMPLETE: &str = "__shutdown_complete__";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_method_pattern() {
        assert!(is_reserved_method("__handshake__"));
        assert!(is_reserved_method("__anything__"));
        assert!(!is_reserved_method("echo"));
        assert!(!is_reserved_method("__half_open"));
    }

    #[test]
    fn validate_user_method_rejects_reserved_and_empty() {
        assert!(validate_user_method("echo").is_ok());
        assert!(validate_user_method("").is_err());
        assert!(validate_user_method("__heartbeat_ping__").is_err());
    }

    #[test]
    fn response_requires_exactly_one_of_result_or_error() {
        let bad = json!({
            "protocolVersion": 1,
            "kind": "response",
            "id": 1,
        });
        match parse(bad) {
            Parsed::Invalid { .. } => {}
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn round_trips_request_envelope() {
        let env = create_request("echo", Some(json!({"msg": "hi"})), 7);
        let raw = serde_json::to_value(&env).unwrap();
        match parse(raw) {
            Parsed::Request(e) => {
                assert_eq!(e.id, Some(7));
                assert_eq!(e.method.as_deref(), Some("echo"));
            }
            _ => panic!("expected request"),
        }
    }
}
