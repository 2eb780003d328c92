//! JSON-RPC frames exchanged with the relay
//!
//! Outbound: `{jsonrpc, id, method, params: {channel, message?}}`.
//! Inbound: answers `{id, result}` / `{id, error: {code, description}}` and
//! broadcasts `{method: "message", params: {channel, message}}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use lao_core::{Channel, RequestError};

use crate::{WireError, WireMessage, WireResult};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used by the relay
pub mod error_code {
    pub const INVALID_ACTION: i64 = -1;
    pub const INVALID_RESOURCE: i64 = -2;
    pub const RESOURCE_ALREADY_EXISTS: i64 = -3;
    pub const INVALID_MESSAGE_DATA: i64 = -4;
    pub const ACCESS_DENIED: i64 = -5;
    pub const INTERNAL_SERVER_ERROR: i64 = -6;

    /// Human-readable name of a known code
    pub fn name(code: i64) -> Option<&'static str> {
        match code {
            INVALID_ACTION => Some("invalid action"),
            INVALID_RESOURCE => Some("invalid resource"),
            RESOURCE_ALREADY_EXISTS => Some("resource already exists"),
            INVALID_MESSAGE_DATA => Some("invalid message data"),
            ACCESS_DENIED => Some("access denied"),
            INTERNAL_SERVER_ERROR => Some("internal server error"),
            _ => None,
        }
    }
}

/// JSON-RPC method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Subscribe,
    Unsubscribe,
    Publish,
    Catchup,
    /// Relay-initiated broadcast
    #[serde(rename = "message")]
    Broadcast,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Publish => "publish",
            Method::Catchup => "catchup",
            Method::Broadcast => "message",
        }
    }
}

/// Client request kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
    Catchup,
}

impl RequestKind {
    pub fn method(self) -> Method {
        match self {
            RequestKind::Subscribe => Method::Subscribe,
            RequestKind::Unsubscribe => Method::Unsubscribe,
            RequestKind::Publish => Method::Publish,
            RequestKind::Catchup => Method::Catchup,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<WireMessage>,
}

/// Outbound request frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: Method,
    pub params: Params,
}

impl Request {
    pub fn new(id: u64, kind: RequestKind, channel: Channel, message: Option<WireMessage>) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: kind.method(),
            params: Params { channel, message },
        }
    }

    pub fn encode(&self) -> WireResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a request frame, as the relay side does
    pub fn decode(frame: &str) -> WireResult<Self> {
        let request: Request = serde_json::from_str(frame)?;
        if request.method == Method::Broadcast {
            return Err(WireError::InvalidFrame("broadcast is not a request".into()));
        }
        Ok(request)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnswerBody {
    Result(Value),
    Error(ErrorBody),
}

/// Answer to a request, correlated by id
#[derive(Clone, Debug, PartialEq)]
pub struct Answer {
    pub id: u64,
    pub body: AnswerBody,
}

impl Answer {
    pub fn result(id: u64, result: Value) -> Self {
        Answer {
            id,
            body: AnswerBody::Result(result),
        }
    }

    pub fn error(id: u64, code: i64, description: impl Into<String>) -> Self {
        Answer {
            id,
            body: AnswerBody::Error(ErrorBody {
                code,
                description: description.into(),
            }),
        }
    }

    pub fn encode(&self) -> WireResult<String> {
        let frame = match &self.body {
            AnswerBody::Result(result) => serde_json::json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": self.id,
                "result": result,
            }),
            AnswerBody::Error(error) => serde_json::json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": self.id,
                "error": error,
            }),
        };
        Ok(serde_json::to_string(&frame)?)
    }

    /// Result payload, or the server error it carries
    pub fn into_result(self) -> Result<Value, RequestError> {
        match self.body {
            AnswerBody::Result(value) => Ok(value),
            AnswerBody::Error(ErrorBody { code, description }) => {
                Err(RequestError::ServerError { code, description })
            }
        }
    }
}

/// Relay broadcast of a message on a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broadcast {
    pub channel: Channel,
    pub message: WireMessage,
}

impl Broadcast {
    pub fn encode(&self) -> WireResult<String> {
        let params = Params {
            channel: self.channel.clone(),
            message: Some(self.message.clone()),
        };
        let frame = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": Method::Broadcast,
            "params": params,
        });
        Ok(serde_json::to_string(&frame)?)
    }
}

/// Decoded inbound frame
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Answer(Answer),
    Broadcast(Broadcast),
}

/// Keeps an explicit `null` distinct from an absent field
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<Method>,
    #[serde(default)]
    params: Option<Params>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

/// Classify an inbound frame
pub fn decode_frame(frame: &str) -> WireResult<Incoming> {
    let raw: RawFrame = serde_json::from_str(frame)?;

    if raw.method == Some(Method::Broadcast) {
        let params = raw
            .params
            .ok_or_else(|| WireError::InvalidFrame("broadcast without params".into()))?;
        let message = params
            .message
            .ok_or_else(|| WireError::InvalidFrame("broadcast without message".into()))?;
        return Ok(Incoming::Broadcast(Broadcast {
            channel: params.channel,
            message,
        }));
    }

    if let Some(method) = raw.method {
        return Err(WireError::InvalidFrame(format!(
            "unexpected request {} from relay",
            method.as_str()
        )));
    }

    let id = raw
        .id
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| WireError::InvalidFrame("answer without numeric id".into()))?;

    let body = match (raw.result, raw.error) {
        (_, Some(error)) => AnswerBody::Error(error),
        (Some(result), None) => AnswerBody::Result(result),
        (None, None) => {
            return Err(WireError::InvalidFrame(
                "answer without result or error".into(),
            ))
        }
    };

    Ok(Incoming::Answer(Answer { id, body }))
}

/// Type-check a catch-up result: an array of wire messages
pub fn catchup_messages(result: Value) -> Result<Vec<WireMessage>, RequestError> {
    if !result.is_array() {
        return Err(RequestError::UnexpectedResult(format!(
            "catchup expects an array, got {result}"
        )));
    }
    serde_json::from_value(result)
        .map_err(|e| RequestError::UnexpectedResult(format!("catchup entry: {e}")))
}

/// Type-check an acknowledgement result: `0` or `null`
pub fn expect_ack(result: &Value) -> Result<(), RequestError> {
    match result {
        Value::Null => Ok(()),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(()),
        other => Err(RequestError::UnexpectedResult(other.to_string())),
    }
}
