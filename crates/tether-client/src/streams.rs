//! Streaming argument and result plumbing.
//!
//! [`client_stream`] creates the pair used to feed a client-to-server
//! streaming argument, in the spirit of an mpsc channel: keep the
//! [`StreamTx`], pass the [`ClientStream`] as an argument. [`HubStream`]
//! is the consumer side of a server-to-client stream invocation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::mpsc;

use tether_wire::{ProtocolError, Value};

use crate::{HubError, CHANNEL_SIZE};

/// One argument of a hub invocation: a plain value or a client stream.
pub enum Arg {
    Value(Value),
    Stream(ClientStream),
}

impl Arg {
    /// Serialize any value into an argument.
    pub fn value<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::to_value(value)
            .map(Arg::Value)
            .map_err(|e| ProtocolError::Serialize(e.to_string()))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<ClientStream> for Arg {
    fn from(stream: ClientStream) -> Self {
        Arg::Stream(stream)
    }
}

/// Items produced by a client stream.
#[derive(Debug, Clone)]
pub enum ClientStreamEvent {
    Item(Value),
    /// The producer failed; the server sees a Completion with this error.
    Error(String),
}

/// Create a client-to-server stream pair.
///
/// Send items through the [`StreamTx`]; dropping it completes the stream.
pub fn client_stream() -> (StreamTx, ClientStream) {
    let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
    (StreamTx { tx }, ClientStream { rx })
}

/// Producer half of a client-to-server stream.
#[derive(Clone)]
pub struct StreamTx {
    tx: mpsc::Sender<ClientStreamEvent>,
}

impl StreamTx {
    /// Send one item. Fails once the connection or stream is gone.
    pub async fn send<T: Serialize>(&self, item: &T) -> Result<(), HubError> {
        let value = serde_json::to_value(item)
            .map_err(|e| HubError::Protocol(ProtocolError::Serialize(e.to_string())))?;
        self.tx
            .send(ClientStreamEvent::Item(value))
            .await
            .map_err(|_| HubError::Aborted("client stream is no longer being consumed".into()))
    }

    /// Fail the stream: the server receives a Completion carrying `error`.
    pub async fn fail(self, error: impl Into<String>) {
        let _ = self.tx.send(ClientStreamEvent::Error(error.into())).await;
    }
}

/// Consumer half handed to the connection as an invocation argument.
pub struct ClientStream {
    rx: mpsc::Receiver<ClientStreamEvent>,
}

impl futures_util::Stream for ClientStream {
    type Item = ClientStreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub(crate) type Canceler = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Consumer side of a server-to-client stream invocation.
///
/// Items arrive in order; the stream ends after the server's Completion
/// (with a final `Err` item when the Completion carried an error).
/// [`cancel`](Self::cancel) tells the server to stop producing; items
/// already in flight are discarded.
pub struct HubStream {
    rx: mpsc::Receiver<Result<Value, HubError>>,
    canceler: Option<Canceler>,
}

impl HubStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Value, HubError>>, canceler: Canceler) -> Self {
        Self {
            rx,
            canceler: Some(canceler),
        }
    }

    /// Next item, or `None` once the stream completed.
    pub async fn next(&mut self) -> Option<Result<Value, HubError>> {
        self.rx.recv().await
    }

    /// Cancel the stream invocation: removes the local subscription and
    /// sends one CancelInvocation to the server.
    pub async fn cancel(mut self) {
        if let Some(canceler) = self.canceler.take() {
            canceler().await;
        }
    }
}

impl futures_util::Stream for HubStream {
    type Item = Result<Value, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
