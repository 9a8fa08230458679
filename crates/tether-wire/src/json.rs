//! Record-separated JSON hub protocol.
//!
//! Each frame is one JSON object terminated by the record separator; the
//! numeric `type` field selects the message. A single transport frame may
//! carry several records.

use serde_json::{Map, Value};

use crate::{
    AckMessage, CancelInvocationMessage, CloseMessage, CompletionMessage, HubMessage, HubProtocol,
    InvocationMessage, Payload, ProtocolError, SequenceMessage, StreamInvocationMessage,
    StreamItemMessage, TransferFormat, RECORD_SEPARATOR,
};

const TYPE_INVOCATION: u64 = 1;
const TYPE_STREAM_ITEM: u64 = 2;
const TYPE_COMPLETION: u64 = 3;
const TYPE_STREAM_INVOCATION: u64 = 4;
const TYPE_CANCEL_INVOCATION: u64 = 5;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;
const TYPE_ACK: u64 = 8;
const TYPE_SEQUENCE: u64 = 9;

/// The default text-based hub protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> i32 {
        2
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> Result<Payload, ProtocolError> {
        let (ty, body) = match message {
            HubMessage::Invocation(m) => (TYPE_INVOCATION, to_object(m)?),
            HubMessage::StreamItem(m) => (TYPE_STREAM_ITEM, to_object(m)?),
            HubMessage::Completion(m) => (TYPE_COMPLETION, to_object(m)?),
            HubMessage::StreamInvocation(m) => (TYPE_STREAM_INVOCATION, to_object(m)?),
            HubMessage::CancelInvocation(m) => (TYPE_CANCEL_INVOCATION, to_object(m)?),
            HubMessage::Ping => (TYPE_PING, Map::new()),
            HubMessage::Close(m) => (TYPE_CLOSE, to_object(m)?),
            HubMessage::Ack(m) => (TYPE_ACK, to_object(m)?),
            HubMessage::Sequence(m) => (TYPE_SEQUENCE, to_object(m)?),
        };

        let mut object = Map::with_capacity(body.len() + 1);
        object.insert("type".to_string(), Value::from(ty));
        object.extend(body);

        let mut text = serde_json::to_string(&Value::Object(object))
            .map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        text.push(RECORD_SEPARATOR as char);
        Ok(Payload::Text(text))
    }

    fn parse_messages(&self, data: Payload) -> Result<Vec<HubMessage>, ProtocolError> {
        let text = match data {
            Payload::Text(text) => text,
            Payload::Binary(_) => return Err(ProtocolError::WrongTransferFormat),
        };

        if !text.ends_with(RECORD_SEPARATOR as char) {
            return Err(ProtocolError::Incomplete);
        }

        let mut messages = Vec::new();
        for record in text.split(RECORD_SEPARATOR as char) {
            if record.is_empty() {
                continue;
            }
            if let Some(message) = parse_record(record)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

fn parse_record(record: &str) -> Result<Option<HubMessage>, ProtocolError> {
    let value: Value = serde_json::from_str(record)
        .map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {e}")))?;
    let ty = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Malformed("missing message type".into()))?;

    let message = match ty {
        TYPE_INVOCATION => HubMessage::Invocation(from_value::<InvocationMessage>(value)?),
        TYPE_STREAM_ITEM => HubMessage::StreamItem(from_value::<StreamItemMessage>(value)?),
        TYPE_COMPLETION => HubMessage::Completion(from_value::<CompletionMessage>(value)?),
        TYPE_STREAM_INVOCATION => {
            HubMessage::StreamInvocation(from_value::<StreamInvocationMessage>(value)?)
        }
        TYPE_CANCEL_INVOCATION => {
            HubMessage::CancelInvocation(from_value::<CancelInvocationMessage>(value)?)
        }
        TYPE_PING => HubMessage::Ping,
        TYPE_CLOSE => HubMessage::Close(from_value::<CloseMessage>(value)?),
        TYPE_ACK => HubMessage::Ack(from_value::<AckMessage>(value)?),
        TYPE_SEQUENCE => HubMessage::Sequence(from_value::<SequenceMessage>(value)?),
        // Unknown message types are skipped so newer servers stay compatible.
        _ => return Ok(None),
    };
    Ok(Some(message))
}

fn to_object<T: serde::Serialize>(message: &T) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(message) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtocolError::Serialize("message is not an object".into())),
        Err(e) => Err(ProtocolError::Serialize(e.to_string())),
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
