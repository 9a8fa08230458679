//! Handshake codec.
//!
//! The handshake is a single request/response exchange that must complete
//! before any hub traffic is processed: the client announces the protocol
//! name and version, the server answers with an empty object or an error.
//! Both directions are JSON terminated by the record separator, regardless
//! of the hub protocol's transfer format.

use serde::{Deserialize, Serialize};

use crate::{Payload, ProtocolError, RECORD_SEPARATOR};

/// Client half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: i32,
}

/// Server half of the handshake. An empty object means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serialize a handshake request as a record-separated JSON text frame.
pub fn write_handshake_request(request: &HandshakeRequest) -> Result<Payload, ProtocolError> {
    let mut text =
        serde_json::to_string(request).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    text.push(RECORD_SEPARATOR as char);
    Ok(Payload::Text(text))
}

/// Parse the handshake response off the front of an inbound frame.
///
/// The server may coalesce the response with the first hub messages, so any
/// bytes past the separator are handed back for normal message parsing.
pub fn parse_handshake_response(
    data: &Payload,
) -> Result<(HandshakeResponse, Option<Payload>), ProtocolError> {
    match data {
        Payload::Text(text) => {
            let sep = text
                .find(RECORD_SEPARATOR as char)
                .ok_or(ProtocolError::Incomplete)?;
            let response = parse_response_json(text[..sep].as_bytes())?;
            let rest = &text[sep + 1..];
            let remaining = if rest.is_empty() {
                None
            } else {
                Some(Payload::Text(rest.to_string()))
            };
            Ok((response, remaining))
        }
        Payload::Binary(bytes) => {
            let sep = bytes
                .iter()
                .position(|&b| b == RECORD_SEPARATOR)
                .ok_or(ProtocolError::Incomplete)?;
            let response = parse_response_json(&bytes[..sep])?;
            let rest = &bytes[sep + 1..];
            let remaining = if rest.is_empty() {
                None
            } else {
                Some(Payload::Binary(rest.to_vec()))
            };
            Ok((response, remaining))
        }
    }
}

fn parse_response_json(bytes: &[u8]) -> Result<HandshakeResponse, ProtocolError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ProtocolError::Malformed(format!("handshake response: {e}")))
}
