use serde::Serialize;
use serde_json::{Map, Value};

use skyguide_core::events::round;

// JSON-RPC error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// The engine accepted the call but could not carry it out.
pub const HANDLER_FAILED: i64 = 1;

/// A well-formed request.
///
/// `id` keeps the difference between an absent id (notification) and an
/// explicit `null` id, which still gets a response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A frame or batch element that is valid JSON but not a request.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRequest {
    pub id: Option<Value>,
    pub reason: String,
}

pub type RequestItem = Result<RpcRequest, InvalidRequest>;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Single(RequestItem),
    Batch(Vec<RequestItem>),
}

/// Decode a frame. Fails only when the text is not JSON at all.
pub fn parse_frame(frame: &[u8]) -> Result<Incoming, serde_json::Error> {
    let value: Value = serde_json::from_slice(frame)?;
    Ok(match value {
        Value::Array(items) if items.is_empty() => Incoming::Single(Err(InvalidRequest {
            id: None,
            reason: "invalid request - empty batch".into(),
        })),
        Value::Array(items) => Incoming::Batch(items.into_iter().map(parse_request).collect()),
        other => Incoming::Single(parse_request(other)),
    })
}

/// Interpret one JSON value as a request.
pub fn parse_request(value: Value) -> RequestItem {
    let Value::Object(mut obj) = value else {
        return Err(InvalidRequest {
            id: None,
            reason: "invalid request - expected an object".into(),
        });
    };

    let id = obj.remove("id");
    let method = match obj.remove("method") {
        Some(Value::String(method)) => method,
        Some(_) => {
            return Err(InvalidRequest {
                id,
                reason: "invalid request - method must be a string".into(),
            })
        }
        None => {
            return Err(InvalidRequest {
                id,
                reason: "invalid request - missing method".into(),
            })
        }
    };
    let params = obj
        .remove("params")
        .unwrap_or_else(|| Value::Object(Map::new()));

    Ok(RpcRequest { method, params, id })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response wire format: `{"result":..,"id":..}` or `{"error":{..},"id":..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn method_not_found(id: Value) -> Self {
        Self::error(id, METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_request(id: Value, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_REQUEST, msg)
    }

    pub fn invalid_params(id: Value, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn internal_error(id: Value, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg)
    }

    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    /// Sent when a client line exceeds the frame limit.
    pub fn too_big() -> Self {
        Self::internal_error(Value::Null, "too big")
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// What gets written back for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RpcReply {
    Single(RpcResponse),
    Batch(Vec<RpcResponse>),
}

/// Identity stamped on every event this server emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub host: String,
    pub instance: u32,
}

/// Build an event object: `Event`, `Timestamp`, `Host`, `Inst`, then the
/// event's own fields in their given order.
///
/// `timestamp` is unix seconds; it is written with millisecond precision.
/// Event fields that collide with a header name are dropped.
pub fn build_event_envelope(
    name: &str,
    fields: Map<String, Value>,
    header: &EnvelopeHeader,
    timestamp: f64,
) -> Value {
    let mut obj = Map::with_capacity(fields.len() + 4);
    obj.insert("Event".into(), Value::from(name));
    obj.insert("Timestamp".into(), round(timestamp, 3));
    obj.insert("Host".into(), Value::from(header.host.as_str()));
    obj.insert("Inst".into(), Value::from(header.instance));
    for (key, value) in fields {
        if !obj.contains_key(&key) {
            obj.insert(key, value);
        }
    }
    Value::Object(obj)
}

/// Current wall-clock time as unix seconds.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
