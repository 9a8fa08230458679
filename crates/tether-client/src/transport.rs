//! Transport abstraction.
//!
//! This module defines the [`Transport`] trait that abstracts over the
//! mechanisms carrying hub frames (WebSocket, long polling, in-memory test
//! pairs). Transports are message-oriented: framing, URL handling and HTTP
//! negotiation are entirely their business.
//!
//! Inbound traffic is delivered through the event receiver returned by
//! [`Transport::start`]: one `Frame` per complete transport frame, then a
//! single `Closed` when the underlying connection is gone. The connection
//! is the only subscriber.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use tether_wire::{Payload, TransferFormat};

use crate::HubError;

/// Events emitted by a started transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound frame.
    Frame(Payload),
    /// The underlying connection is gone. No further events follow.
    Closed(Option<HubError>),
}

/// Receiver for a started transport's events.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Hook invoked by a stateful-reconnect transport when the underlying
/// connection is lost.
pub type DisconnectedHook = Arc<dyn Fn() + Send + Sync>;

/// Hook invoked by a stateful-reconnect transport after the underlying
/// connection has been re-established and the handshake replayed.
pub type ResendHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> + Send + Sync>;

/// Capabilities advertised by a transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportFeatures {
    /// The transport generates its own keep-alive traffic, so the
    /// server-silence timeout must be suppressed.
    pub inherent_keep_alive: bool,
    /// The transport can resume the same logical session over a new
    /// underlying connection (stateful reconnect).
    pub reconnect: bool,
}

/// Contract for transports carrying hub frames.
///
/// When [`TransportFeatures::reconnect`] is advertised, the transport
/// invokes the hooks installed via [`Transport::set_reconnect_hooks`]: the
/// disconnected hook on loss of the underlying connection, the resend hook
/// once a replacement connection is ready for replayed traffic.
pub trait Transport: Send + 'static {
    /// Open the underlying connection.
    ///
    /// Resolves once the transport is ready to send, with the receiver for
    /// inbound events. May be called again after the previous connection
    /// closed.
    fn start(
        &mut self,
        format: TransferFormat,
    ) -> impl Future<Output = io::Result<TransportEvents>> + Send;

    /// Send one frame.
    fn send(&mut self, payload: Payload) -> impl Future<Output = io::Result<()>> + Send;

    /// Close the underlying connection.
    ///
    /// The optional error is echoed in the final [`TransportEvent::Closed`].
    /// Resolves after that event has been emitted.
    fn stop(&mut self, error: Option<HubError>) -> impl Future<Output = io::Result<()>> + Send;

    /// Capabilities of this transport.
    fn features(&self) -> TransportFeatures;

    /// Install the stateful-reconnect hooks.
    ///
    /// Only called when [`TransportFeatures::reconnect`] is advertised.
    fn set_reconnect_hooks(&mut self, disconnected: DisconnectedHook, resend: ResendHook);

    /// Enable or disable the transport's own reconnect behavior.
    ///
    /// The connection disables it on `stop()` so no further reconnect
    /// attempts are initiated during teardown.
    fn set_reconnect_enabled(&mut self, enabled: bool);

    /// Identifier of the current underlying connection, if one is known.
    fn connection_id(&self) -> Option<String> {
        None
    }

    /// Forward a changed base URL, used by the next `start`.
    fn set_url(&mut self, url: &str) {
        let _ = url;
    }
}
