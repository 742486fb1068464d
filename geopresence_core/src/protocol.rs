//! Hub wire protocol: JSON records, version 1.
//!
//! Every record is a JSON object terminated by U+001E (record separator).
//! A WebSocket frame may carry several records.
//!
//! ```text
//! client -> {"protocol":"json","version":1}␞
//! hub    -> {}␞
//! hub    -> {"type":1,"target":"ReceiveLatLon","arguments":[40.7128,-74.006,"alice"]}␞
//! client -> {"type":1,"invocationId":"1","target":"SendLatLon","arguments":[51.5,-0.12,"bob"]}␞
//! hub    -> {"type":3,"invocationId":"1"}␞
//! ```

use serde_json::{json, Value};
use thiserror::Error;

/// Record terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol name announced in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Inbound event: `(latitude: number, longitude: number, identity: string)`.
pub const RECEIVE_LAT_LON: &str = "ReceiveLatLon";

/// Outbound invocation: `(latitude: number, longitude: number, identity: string)`.
pub const SEND_LAT_LON: &str = "SendLatLon";

/// Errors decoding hub records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Unsupported message type {0}")]
    UnsupportedType(u64),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Incomplete record (missing terminator)")]
    Incomplete,
}

/// One decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Type 1: call a method on the other side
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },

    /// Type 2: item of a streaming result
    StreamItem { invocation_id: String, item: Value },

    /// Type 3: result of an invocation
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Type 6: keep-alive
    Ping,

    /// Type 7: the hub is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    /// Numeric record type.
    pub fn type_code(&self) -> u64 {
        match self {
            HubMessage::Invocation { .. } => 1,
            HubMessage::StreamItem { .. } => 2,
            HubMessage::Completion { .. } => 3,
            HubMessage::Ping => 6,
            HubMessage::Close { .. } => 7,
        }
    }
}

/// The handshake record sent right after the socket opens.
pub fn handshake_request() -> String {
    let body = json!({ "protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION });
    format!("{body}{RECORD_SEPARATOR}")
}

/// Parses the hub's handshake response.
///
/// Returns whatever followed the handshake record in the same frame; those
/// bytes are ordinary hub records.
pub fn parse_handshake_response(frame: &str) -> Result<&str, ProtocolError> {
    let end = frame.find(RECORD_SEPARATOR).ok_or(ProtocolError::Incomplete)?;
    let record = &frame[..end];
    let rest = &frame[end + RECORD_SEPARATOR.len_utf8()..];

    let value: Value =
        serde_json::from_str(record).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ProtocolError::HandshakeRejected(error.to_string()));
    }
    Ok(rest)
}

/// Encodes one record, terminator included.
pub fn encode(message: &HubMessage) -> String {
    let mut value = json!({ "type": message.type_code() });
    match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => {
            if let Some(id) = invocation_id {
                value["invocationId"] = json!(id);
            }
            value["target"] = json!(target);
            value["arguments"] = Value::Array(arguments.clone());
        }
        HubMessage::StreamItem {
            invocation_id,
            item,
        } => {
            value["invocationId"] = json!(invocation_id);
            value["item"] = item.clone();
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => {
            value["invocationId"] = json!(invocation_id);
            if let Some(result) = result {
                value["result"] = result.clone();
            }
            if let Some(error) = error {
                value["error"] = json!(error);
            }
        }
        HubMessage::Ping => {}
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            if let Some(error) = error {
                value["error"] = json!(error);
            }
            if *allow_reconnect {
                value["allowReconnect"] = json!(true);
            }
        }
    }
    format!("{value}{RECORD_SEPARATOR}")
}

/// Decodes every record in a frame.
///
/// A bad record yields an `Err` entry without affecting its neighbours.
pub fn decode(frame: &str) -> Vec<Result<HubMessage, ProtocolError>> {
    let mut messages = Vec::new();
    let mut rest = frame;

    while !rest.is_empty() {
        match rest.find(RECORD_SEPARATOR) {
            Some(end) => {
                messages.push(decode_record(&rest[..end]));
                rest = &rest[end + RECORD_SEPARATOR.len_utf8()..];
            }
            None => {
                messages.push(Err(ProtocolError::Incomplete));
                break;
            }
        }
    }

    messages
}

fn decode_record(record: &str) -> Result<HubMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(record).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("type"))?;

    match kind {
        1 => Ok(HubMessage::Invocation {
            invocation_id: optional_str(&value, "invocationId"),
            target: required_str(&value, "target")?,
            arguments: value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .ok_or(ProtocolError::MissingField("arguments"))?,
        }),
        2 => Ok(HubMessage::StreamItem {
            invocation_id: required_str(&value, "invocationId")?,
            item: value.get("item").cloned().unwrap_or(Value::Null),
        }),
        3 => Ok(HubMessage::Completion {
            invocation_id: required_str(&value, "invocationId")?,
            result: value.get("result").cloned(),
            error: optional_str(&value, "error"),
        }),
        6 => Ok(HubMessage::Ping),
        7 => Ok(HubMessage::Close {
            error: optional_str(&value, "error"),
            allow_reconnect: value
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        other => Err(ProtocolError::UnsupportedType(other)),
    }
}

fn required_str(value: &Value, field: &'static str) -> Result<String, ProtocolError> {
    optional_str(value, field).ok_or(ProtocolError::MissingField(field))
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_request_bytes() {
        assert_eq!(handshake_request(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
    }

    #[test]
    fn test_handshake_response() {
        assert_eq!(parse_handshake_response("{}\u{1e}"), Ok(""));

        let trailing = "{}\u{1e}{\"type\":6}\u{1e}";
        assert_eq!(parse_handshake_response(trailing), Ok("{\"type\":6}\u{1e}"));

        assert_eq!(
            parse_handshake_response("{\"error\":\"Requested protocol 'json' is not available.\"}\u{1e}"),
            Err(ProtocolError::HandshakeRejected(
                "Requested protocol 'json' is not available.".to_string()
            ))
        );
        assert_eq!(parse_handshake_response("{}"), Err(ProtocolError::Incomplete));
    }

    #[test]
    fn test_decode_receive_lat_lon() {
        let frame = "{\"type\":1,\"target\":\"ReceiveLatLon\",\"arguments\":[40.7128,-74.006,\"alice\"]}\u{1e}";
        let messages = decode(frame);

        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            Ok(HubMessage::Invocation {
                invocation_id: None,
                target: RECEIVE_LAT_LON.to_string(),
                arguments: vec![json!(40.7128), json!(-74.006), json!("alice")],
            })
        );
    }

    #[test]
    fn test_decode_batch_isolates_bad_records() {
        let frame = "{\"type\":6}\u{1e}not json\u{1e}{\"type\":3,\"invocationId\":\"4\",\"error\":\"boom\"}\u{1e}{\"type\":9}\u{1e}";
        let messages = decode(frame);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Ok(HubMessage::Ping));
        assert!(matches!(messages[1], Err(ProtocolError::InvalidJson(_))));
        assert_eq!(
            messages[2],
            Ok(HubMessage::Completion {
                invocation_id: "4".to_string(),
                result: None,
                error: Some("boom".to_string()),
            })
        );
        assert_eq!(messages[3], Err(ProtocolError::UnsupportedType(9)));
    }

    #[test]
    fn test_decode_missing_terminator() {
        let messages = decode("{\"type\":6}\u{1e}{\"type\":6}");
        assert_eq!(messages, vec![Ok(HubMessage::Ping), Err(ProtocolError::Incomplete)]);
    }

    #[test]
    fn test_decode_close() {
        let messages = decode("{\"type\":7,\"error\":\"Server shutting down\",\"allowReconnect\":true}\u{1e}");
        assert_eq!(
            messages[0],
            Ok(HubMessage::Close {
                error: Some("Server shutting down".to_string()),
                allow_reconnect: true,
            })
        );
    }

    #[test]
    fn test_encode_send_lat_lon_keeps_argument_order() {
        let message = HubMessage::Invocation {
            invocation_id: Some("1".to_string()),
            target: SEND_LAT_LON.to_string(),
            arguments: vec![json!(51.5074), json!(-0.1278), json!("bob")],
        };
        let encoded = encode(&message);

        assert!(encoded.ends_with(RECORD_SEPARATOR));
        assert!(encoded.contains("\"arguments\":[51.5074,-0.1278,\"bob\"]"));
        assert!(encoded.contains("\"target\":\"SendLatLon\""));
        assert_eq!(decode(&encoded), vec![Ok(message)]);
    }
}
