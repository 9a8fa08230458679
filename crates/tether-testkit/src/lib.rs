#![deny(unsafe_code)]

//! In-memory transport and scripted hub peer for tests.
//!
//! [`memory_pair`] returns a [`MemoryTransport`] to hand to a
//! `HubConnection` and a [`HubPeer`] playing the server side of the wire:
//! the peer reads what the client sent, answers the handshake, pushes
//! frames, and can drop the link. A drop is either fatal (hub-level
//! reconnect) or transient (stateful reconnect, driving the transport's
//! disconnected/resend hooks).

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use tether_client::transport::{
    DisconnectedHook, ResendHook, Transport, TransportEvent, TransportEvents, TransportFeatures,
};
use tether_client::HubError;
use tether_wire::handshake::HandshakeRequest;
use tether_wire::json::JsonHubProtocol;
use tether_wire::{HubMessage, HubProtocol, Payload, TransferFormat, RECORD_SEPARATOR};

const EVENT_CAPACITY: usize = 256;

struct Shared {
    to_peer: mpsc::UnboundedSender<Payload>,
    starts: mpsc::UnboundedSender<u32>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    advertised: TransportFeatures,
    features: Mutex<TransportFeatures>,
    hooks: Mutex<Option<(DisconnectedHook, ResendHook)>>,
    url: Mutex<Option<String>>,
    epoch: AtomicU32,
    fail_sends: AtomicBool,
}

impl Shared {
    fn lock_events(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<TransportEvent>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a connected transport/peer pair with the given features.
pub fn memory_pair(features: TransportFeatures) -> (MemoryTransport, HubPeer) {
    let (to_peer, from_client) = mpsc::unbounded_channel();
    let (starts_tx, starts_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        to_peer,
        starts: starts_tx,
        events: Mutex::new(None),
        advertised: features,
        features: Mutex::new(features),
        hooks: Mutex::new(None),
        url: Mutex::new(None),
        epoch: AtomicU32::new(0),
        fail_sends: AtomicBool::new(false),
    });
    (
        MemoryTransport {
            shared: shared.clone(),
        },
        HubPeer {
            shared,
            from_client,
            starts: starts_rx,
            pending: VecDeque::new(),
        },
    )
}

/// Message-framed transport whose far end is a [`HubPeer`].
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Transport for MemoryTransport {
    async fn start(&mut self, _format: TransferFormat) -> io::Result<TransportEvents> {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        *self.shared.lock_events() = Some(tx);
        // A fresh underlying connection re-advertises what the transport
        // can do, even if a previous teardown disabled reconnect.
        *self.shared.features.lock().unwrap_or_else(|e| e.into_inner()) = self.shared.advertised;
        self.shared.fail_sends.store(false, Ordering::SeqCst);
        let _ = self.shared.starts.send(epoch);
        Ok(rx)
    }

    async fn send(&mut self, payload: Payload) -> io::Result<()> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link is down"));
        }
        self.shared
            .to_peer
            .send(payload)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer is gone"))
    }

    async fn stop(&mut self, error: Option<HubError>) -> io::Result<()> {
        let sender = self.shared.lock_events().take();
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Closed(error)).await;
        }
        Ok(())
    }

    fn features(&self) -> TransportFeatures {
        *self.shared.features.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_reconnect_hooks(&mut self, disconnected: DisconnectedHook, resend: ResendHook) {
        *self.shared.hooks.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((disconnected, resend));
    }

    fn set_reconnect_enabled(&mut self, enabled: bool) {
        self.shared
            .features
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reconnect = enabled;
    }

    fn connection_id(&self) -> Option<String> {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        (epoch > 0).then(|| format!("test-connection-{epoch}"))
    }

    fn set_url(&mut self, url: &str) {
        *self.shared.url.lock().unwrap_or_else(|e| e.into_inner()) = Some(url.to_string());
    }
}

/// Scripted server side of a [`MemoryTransport`].
///
/// Receive helpers panic on an unexpected wire state so test failures
/// point at the first wrong frame.
pub struct HubPeer {
    shared: Arc<Shared>,
    from_client: mpsc::UnboundedReceiver<Payload>,
    starts: mpsc::UnboundedReceiver<u32>,
    pending: VecDeque<HubMessage>,
}

impl HubPeer {
    /// Wait for the client to start (or restart) the transport. Returns
    /// the 1-based start count.
    pub async fn wait_start(&mut self) -> u32 {
        self.starts.recv().await.expect("transport was dropped")
    }

    /// Next raw payload sent by the client.
    pub async fn recv_payload(&mut self) -> Payload {
        self.from_client
            .recv()
            .await
            .expect("client side was dropped")
    }

    /// Next raw payload as text.
    pub async fn recv_text(&mut self) -> String {
        match self.recv_payload().await {
            Payload::Text(text) => text,
            Payload::Binary(_) => panic!("expected a text frame"),
        }
    }

    /// Next hub message sent by the client, parsing frames as needed.
    pub async fn recv_message(&mut self) -> HubMessage {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return message;
            }
            let payload = self.recv_payload().await;
            let messages = JsonHubProtocol
                .parse_messages(payload)
                .expect("client sent an unparseable frame");
            self.pending.extend(messages);
        }
    }

    /// Read the client's handshake request without answering it.
    pub async fn recv_handshake(&mut self) -> HandshakeRequest {
        let text = self.recv_text().await;
        let body = text
            .strip_suffix(RECORD_SEPARATOR as char)
            .expect("handshake frame is record-separated");
        serde_json::from_str(body).expect("client sent a malformed handshake request")
    }

    /// Read the handshake request and accept it.
    pub async fn complete_handshake(&mut self) -> HandshakeRequest {
        let request = self.recv_handshake().await;
        self.send_raw("{}\u{1e}").await;
        request
    }

    /// Read the handshake request and reject it with an error.
    pub async fn reject_handshake(&mut self, error: &str) {
        let _ = self.recv_handshake().await;
        self.send_raw(&format!("{{\"error\":\"{error}\"}}\u{1e}"))
            .await;
    }

    /// Push one hub message to the client.
    pub async fn send_frame(&self, message: &HubMessage) {
        let payload = JsonHubProtocol
            .write_message(message)
            .expect("message serializes");
        self.send_payload(payload).await;
    }

    /// Push raw text to the client.
    pub async fn send_raw(&self, text: &str) {
        self.send_payload(Payload::Text(text.to_string())).await;
    }

    async fn send_payload(&self, payload: Payload) {
        let sender = self.shared.lock_events().clone();
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Frame(payload)).await;
        }
    }

    /// Close the underlying connection, as seen by the client.
    pub async fn close(&self, error: Option<HubError>) {
        let sender = self.shared.lock_events().take();
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Closed(error)).await;
        }
    }

    /// Drop the link without closing the logical connection: sends start
    /// failing and the transport's disconnected hook runs, as a
    /// stateful-reconnect transport would on connection loss.
    pub fn break_link(&self) {
        self.shared.fail_sends.store(true, Ordering::SeqCst);
        let hooks = self.shared.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let (disconnected, _) = hooks
            .as_ref()
            .expect("stateful reconnect hooks were never installed");
        disconnected();
    }

    /// Re-establish a broken link and drive the transport's resend hook.
    pub async fn resume_link(&self) -> io::Result<()> {
        self.shared.fail_sends.store(false, Ordering::SeqCst);
        let resend = {
            let hooks = self.shared.hooks.lock().unwrap_or_else(|e| e.into_inner());
            let (_, resend) = hooks
                .as_ref()
                .expect("stateful reconnect hooks were never installed");
            resend.clone()
        };
        resend().await
    }

    /// Make transport sends fail (or succeed again) without touching the
    /// reconnect hooks.
    pub fn set_fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Whether the reconnect hooks have been installed by the client.
    pub fn hooks_installed(&self) -> bool {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The base URL the client forwarded before its last start, if any.
    pub fn url(&self) -> Option<String> {
        self.shared
            .url
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
