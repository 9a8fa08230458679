#![deny(unsafe_code)]

//! Wire-level hub message types and protocol contracts.
//!
//! This crate defines the messages exchanged with a hub server, the
//! [`HubProtocol`] codec contract, and the handshake codec used before any
//! hub traffic flows. The default record-separated JSON codec lives in
//! [`json`].

use serde::{Deserialize, Serialize};

pub use serde_json::Value;

pub mod handshake;
pub mod json;

/// The record separator terminating every handshake and JSON-protocol frame.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Transfer format negotiated between a protocol and a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    /// Messages are UTF-8 text frames.
    Text,
    /// Messages are binary frames.
    Binary,
}

/// A serialized frame, text or binary per the protocol's transfer format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Byte length of the serialized frame.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(b)
    }
}

// ============================================================================
// Hub messages
// ============================================================================

/// A non-blocking invocation of a hub method.
///
/// `invocation_id` is present only when the caller expects a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Ids of client-to-server streams feeding this invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_ids: Vec<String>,
}

/// An invocation whose results arrive as a stream of [`StreamItemMessage`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInvocationMessage {
    pub invocation_id: String,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_ids: Vec<String>,
}

/// A single item produced by a stream, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItemMessage {
    pub invocation_id: String,
    pub item: Value,
}

/// Terminates an invocation or stream, with a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Asks the server to stop producing items for a stream invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvocationMessage {
    pub invocation_id: String,
}

/// Server-initiated close of the logical connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub allow_reconnect: bool,
}

/// Acknowledges receipt of every invocation-family message with a local
/// sequence number at or below `sequence_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub sequence_id: u64,
}

/// Announces the sequence number of the next invocation-family message,
/// sent after a stateful reconnect before any replayed traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceMessage {
    pub sequence_id: u64,
}

/// A parsed hub message.
///
/// Only the invocation family (Invocation, StreamItem, Completion,
/// StreamInvocation, CancelInvocation) participates in sequence numbering
/// and buffering; the rest are control messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    StreamInvocation(StreamInvocationMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
    Ack(AckMessage),
    Sequence(SequenceMessage),
}

impl HubMessage {
    /// Whether this message participates in sequence numbering and buffering.
    pub fn is_invocation_family(&self) -> bool {
        matches!(
            self,
            HubMessage::Invocation(_)
                | HubMessage::StreamItem(_)
                | HubMessage::Completion(_)
                | HubMessage::StreamInvocation(_)
                | HubMessage::CancelInvocation(_)
        )
    }

    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Invocation(_) => "Invocation",
            HubMessage::StreamItem(_) => "StreamItem",
            HubMessage::Completion(_) => "Completion",
            HubMessage::StreamInvocation(_) => "StreamInvocation",
            HubMessage::CancelInvocation(_) => "CancelInvocation",
            HubMessage::Ping => "Ping",
            HubMessage::Close(_) => "Close",
            HubMessage::Ack(_) => "Ack",
            HubMessage::Sequence(_) => "Sequence",
        }
    }
}

// ============================================================================
// Protocol contracts
// ============================================================================

/// Error from encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame was not terminated by the record separator.
    Incomplete,
    /// A frame could not be parsed.
    Malformed(String),
    /// The payload kind does not match the protocol's transfer format.
    WrongTransferFormat,
    /// A message could not be serialized.
    Serialize(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Incomplete => write!(f, "message is incomplete"),
            ProtocolError::Malformed(msg) => write!(f, "malformed message: {msg}"),
            ProtocolError::WrongTransferFormat => {
                write!(f, "payload does not match the protocol's transfer format")
            }
            ProtocolError::Serialize(msg) => write!(f, "serialize error: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Codec contract for a hub protocol (JSON, MessagePack, ...).
///
/// Implementations are stateless; the connection calls `parse_messages`
/// once per inbound transport frame and `write_message` once per outbound
/// message.
pub trait HubProtocol: Send + Sync + 'static {
    /// Protocol name announced during the handshake.
    fn name(&self) -> &'static str;

    /// Native protocol version announced during the handshake.
    fn version(&self) -> i32;

    /// The transfer format this protocol requires from the transport.
    fn transfer_format(&self) -> TransferFormat;

    /// Serialize one message into a transport frame.
    fn write_message(&self, message: &HubMessage) -> Result<Payload, ProtocolError>;

    /// Parse every complete message out of one transport frame.
    fn parse_messages(&self, data: Payload) -> Result<Vec<HubMessage>, ProtocolError>;
}
