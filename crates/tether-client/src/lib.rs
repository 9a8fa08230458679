#![deny(unsafe_code)]

//! Client-side core of a persistent RPC channel to a hub server.
//!
//! [`HubConnection`] composes three tightly coupled mechanisms: the
//! handshake and lifecycle state machine of a long-lived logical
//! connection, retry-policy-driven automatic reconnection, and a
//! stateful-reconnect message buffer that preserves at-most-once, in-order
//! delivery of invocation messages across underlying transport
//! disconnects.
//!
//! The transport and the hub protocol are collaborators supplied by the
//! caller: see [`Transport`] and [`tether_wire::HubProtocol`].
//!
//! # Example
//!
//! ```ignore
//! use tether_client::{HubConnection, HubConnectionOptions, DefaultRetryPolicy};
//! use tether_wire::json::JsonHubProtocol;
//!
//! let connection = HubConnection::new(
//!     transport,
//!     JsonHubProtocol,
//!     HubConnectionOptions {
//!         retry_policy: Some(Box::new(DefaultRetryPolicy::default())),
//!         ..Default::default()
//!     },
//! );
//! connection.start().await?;
//! let answer = connection.invoke("Echo", vec![Arg::value(&"hi")?]).await?;
//! ```

mod buffer;
mod connection;
mod errors;
mod registry;
mod retry;
mod streams;
pub mod transport;

pub use connection::{HubConnection, HubConnectionOptions, HubConnectionState};
pub use errors::HubError;
pub use registry::MethodHandler;
pub use retry::{DefaultRetryPolicy, RetryContext, RetryPolicy};
pub use streams::{client_stream, Arg, ClientStream, ClientStreamEvent, HubStream, StreamTx};
pub use transport::{
    DisconnectedHook, ResendHook, Transport, TransportEvent, TransportEvents, TransportFeatures,
};

pub(crate) const CHANNEL_SIZE: usize = 1024;
