//! Wire envelope and the inbound validation pipeline.
//!
//! Every inbound message is checked in order: source handle, declared origin,
//! payload decoding, legacy unwrapping, embedded-origin cross-check.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::ExpectedOrigin;
use crate::ports::{BridgeError, InboundMessage, WindowId};

/// Type tags that complete a handshake. `connected` is what older peers send.
pub const READY_KINDS: [&str; 2] = ["ready", "connected"];
/// Boxes the real envelope one level deeper in `data`.
pub const LEGACY_WRAPPER_KIND: &str = "wallet-channel:envelope";

pub const KIND_REQUEST: &str = "request";
pub const KIND_RESPONSE: &str = "response";
pub const KIND_EVENT: &str = "event";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginContext {
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        rename = "originContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_context: Option<OriginContext>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            origin_context: None,
            extra: Map::new(),
        }
    }

    pub fn ready() -> Self {
        Self::new(READY_KINDS[0])
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin_context = Some(OriginContext {
            origin: origin.into(),
        });
        self
    }

    pub fn is_ready(&self) -> bool {
        READY_KINDS.contains(&self.kind.as_str())
    }

    /// `data` when present, otherwise a top-level `payload` field.
    pub fn payload(&self) -> Option<&Value> {
        self.data.as_ref().or_else(|| self.extra.get("payload"))
    }

    pub fn request(request: &RpcRequest) -> Result<Self, BridgeError> {
        let data = serde_json::to_value(request)
            .map_err(|e| BridgeError::MessageFailed(format!("encode request failed: {e}")))?;
        Ok(Self::new(KIND_REQUEST).with_data(data))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn into_result(self) -> Result<Value, BridgeError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(BridgeError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Chain family the event concerns; unset means every provider on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRejection {
    ForeignSource { source: Option<WindowId> },
    OriginMismatch { expected: String, actual: String },
    Malformed(String),
    OriginValidationFailed { claimed: String, actual: String },
}

impl From<InboundRejection> for BridgeError {
    fn from(rejection: InboundRejection) -> Self {
        match rejection {
            InboundRejection::OriginValidationFailed { claimed, actual } => {
                Self::OriginValidationFailed { claimed, actual }
            }
            InboundRejection::Malformed(reason) => Self::MessageFailed(reason),
            InboundRejection::ForeignSource { source } => {
                Self::MessageFailed(format!("message from foreign source {source:?}"))
            }
            InboundRejection::OriginMismatch { expected, actual } => Self::MessageFailed(format!(
                "origin mismatch: expected {expected}, got {actual}"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    pub origin: String,
    pub envelope: Envelope,
}

pub fn validate_inbound(
    message: &InboundMessage,
    expected_source: WindowId,
    expected_origin: &ExpectedOrigin,
) -> Result<ValidatedMessage, InboundRejection> {
    if message.source != Some(expected_source) {
        return Err(InboundRejection::ForeignSource {
            source: message.source,
        });
    }
    if !expected_origin.accepts(&message.origin) {
        return Err(InboundRejection::OriginMismatch {
            expected: expected_origin.to_string(),
            actual: message.origin.clone(),
        });
    }

    let mut payload = decode_payload(&message.data)?;
    if payload.get("type").and_then(Value::as_str) == Some(LEGACY_WRAPPER_KIND) {
        let inner = payload
            .get("data")
            .ok_or_else(|| InboundRejection::Malformed("legacy wrapper without data".to_owned()))?;
        payload = decode_payload(inner)?;
    }

    let envelope: Envelope = serde_json::from_value(payload)
        .map_err(|e| InboundRejection::Malformed(format!("not an envelope: {e}")))?;

    if let Some(ctx) = &envelope.origin_context {
        if ctx.origin != message.origin {
            return Err(InboundRejection::OriginValidationFailed {
                claimed: ctx.origin.clone(),
                actual: message.origin.clone(),
            });
        }
    }

    Ok(ValidatedMessage {
        origin: message.origin.clone(),
        envelope,
    })
}

fn decode_payload(raw: &Value) -> Result<Value, InboundRejection> {
    let value = match raw {
        Value::Object(_) => raw.clone(),
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| InboundRejection::Malformed(format!("payload is not json: {e}")))?,
        other => {
            return Err(InboundRejection::Malformed(format!(
                "unsupported payload shape: {other}"
            )))
        }
    };
    if !value.is_object() {
        return Err(InboundRejection::Malformed(
            "payload must decode to an object".to_owned(),
        ));
    }
    Ok(value)
}

/// What a validated message means for a channel in a given handshake phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    HandshakeComplete,
    DuplicateReady,
    Message(Envelope),
}

pub fn classify(envelope: Envelope, handshake_done: bool) -> Inbound {
    match (envelope.is_ready(), handshake_done) {
        (true, false) => Inbound::HandshakeComplete,
        (true, true) => Inbound::DuplicateReady,
        (false, _) => Inbound::Message(envelope),
    }
}
