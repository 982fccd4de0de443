//! Socket.IO text packets over an Engine.IO v4 websocket.
//!
//! Only the default namespace is spoken. Binary attachments are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorInfo, MAX_FRAME_BYTES};

/// Path the Engine.IO server is mounted on.
pub const ENGINE_IO_PATH: &str = "/socket.io/";
const ENGINE_IO_QUERY: &str = "EIO=4&transport=websocket";

/// Body of the Engine.IO `open` packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO session opened (`0{...}`).
    Open(EngineHandshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect. Client side carries the auth object, server side
    /// the namespace session id.
    Connect(Value),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        data: Value,
    },
    Ack {
        id: u64,
        data: Value,
    },
    ConnectError(String),
}

impl Packet {
    pub fn connect(token: &str) -> Self {
        Packet::Connect(serde_json::json!({ "token": token }))
    }

    pub fn event(name: &str, data: Value, id: Option<u64>) -> Self {
        Packet::Event {
            id,
            name: name.to_string(),
            data,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Open(_) => "open",
            Packet::Close => "close",
            Packet::Ping => "ping",
            Packet::Pong => "pong",
            Packet::Noop => "noop",
            Packet::Connect(_) => "connect",
            Packet::Disconnect => "disconnect",
            Packet::Event { .. } => "event",
            Packet::Ack { .. } => "ack",
            Packet::ConnectError(_) => "connect_error",
        }
    }

    pub fn encode(&self) -> Result<String, ErrorInfo> {
        let text = match self {
            Packet::Open(handshake) => format!("0{}", to_json(handshake)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect(Value::Null) => "40".to_string(),
            Packet::Connect(auth) => format!("40{}", to_json(auth)?),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { id, name, data } => format!(
                "42{}{}",
                id.map(|id| id.to_string()).unwrap_or_default(),
                to_json(&Value::Array(vec![Value::String(name.clone()), data.clone()]))?
            ),
            Packet::Ack { id, data } => {
                format!("43{}{}", id, to_json(&Value::Array(vec![data.clone()]))?)
            }
            Packet::ConnectError(message) => {
                format!("44{}", to_json(&serde_json::json!({ "message": message }))?)
            }
        };
        Ok(text)
    }
}

pub fn decode_packet(text: &str) -> Result<Packet, ErrorInfo> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ErrorInfo::new(
            "frame_too_large",
            format!("frame exceeds {} bytes", MAX_FRAME_BYTES),
        ));
    }
    let mut chars = text.chars();
    let engine_type = chars
        .next()
        .ok_or_else(|| invalid("empty packet"))?;
    let rest = chars.as_str();

    match engine_type {
        '0' => serde_json::from_str(rest)
            .map(Packet::Open)
            .map_err(|err| invalid(format!("bad open packet: {}", err))),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket_packet(rest),
        '6' => Ok(Packet::Noop),
        other => Err(invalid(format!("unsupported engine packet type '{}'", other))),
    }
}

fn decode_socket_packet(text: &str) -> Result<Packet, ErrorInfo> {
    let mut chars = text.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| invalid("empty message packet"))?;
    let mut rest = chars.as_str();
    if matches!(socket_type, '5' | '6') {
        return Err(ErrorInfo::new(
            "binary_unsupported",
            "binary socket packets are not supported",
        ));
    }

    if rest.starts_with('/') {
        let (namespace, after) = rest.split_once(',').unwrap_or((rest, ""));
        if namespace != "/" {
            return Err(ErrorInfo::new(
                "foreign_namespace",
                format!("packet for namespace {}", namespace),
            ));
        }
        rest = after;
    }

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let (id, payload) = rest.split_at(digits);
    let id = if id.is_empty() {
        None
    } else {
        Some(
            id.parse::<u64>()
                .map_err(|_| invalid(format!("packet id out of range: {}", id)))?,
        )
    };
    let payload = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload)
            .map_err(|err| invalid(format!("bad packet payload: {}", err)))?
    };

    match socket_type {
        '0' => Ok(Packet::Connect(payload)),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let Value::Array(mut args) = payload else {
                return Err(invalid("event payload is not an array"));
            };
            if args.is_empty() {
                return Err(invalid("event payload has no name"));
            }
            let data = if args.len() > 1 {
                args.swap_remove(1)
            } else {
                Value::Null
            };
            let Value::String(name) = args.swap_remove(0) else {
                return Err(invalid("event name is not a string"));
            };
            Ok(Packet::Event { id, name, data })
        }
        '3' => {
            let id = id.ok_or_else(|| invalid("ack without id"))?;
            let data = match payload {
                Value::Array(mut args) if !args.is_empty() => args.swap_remove(0),
                Value::Array(_) | Value::Null => Value::Null,
                _ => return Err(invalid("ack payload is not an array")),
            };
            Ok(Packet::Ack { id, data })
        }
        '4' => {
            let message = match payload {
                Value::String(message) => message,
                Value::Object(ref body) => body
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string()),
                Value::Null => "connection refused".to_string(),
                other => other.to_string(),
            };
            Ok(Packet::ConnectError(message))
        }
        other => Err(invalid(format!("unsupported socket packet type '{}'", other))),
    }
}

/// Websocket endpoint for a Socket.IO server base URL. URLs that already
/// name the Engine.IO path are kept as they are.
pub fn engine_io_url(base: &str) -> String {
    let base = base.trim();
    if base.contains(ENGINE_IO_PATH) {
        return base.to_string();
    }
    format!(
        "{}{}?{}",
        base.trim_end_matches('/'),
        ENGINE_IO_PATH,
        ENGINE_IO_QUERY
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ErrorInfo> {
    serde_json::to_string(value)
        .map_err(|err| ErrorInfo::new("encode_failed", format!("failed to encode packet: {}", err)))
}

fn invalid(message: impl Into<String>) -> ErrorInfo {
    ErrorInfo::new("invalid_frame", message)
}
