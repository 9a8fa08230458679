//! The hub connection coordinator.
//!
//! [`HubConnection`] owns the transport, the message buffer, the pending
//! invocation registry and every timer, and drives the lifecycle state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Reconnecting <-> Connecting)
//!                                   |                \
//!                                   v                 v
//!                             Disconnecting ----> Disconnected
//! ```
//!
//! Outbound ordering is enforced by the transport mutex: every frame is
//! written while holding it, and the buffer's bookkeeping happens inside
//! the same critical section, so registration order equals wire order.
//! Lifecycle state lives behind a plain mutex that is never held across an
//! await; longer waits (handshake, backpressure, reconnect delays) are
//! futures completed by other entrypoints.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use tether_wire::handshake::{self, HandshakeRequest};
use tether_wire::{
    AckMessage, CancelInvocationMessage, CompletionMessage, HubMessage, HubProtocol,
    InvocationMessage, Payload, SequenceMessage, StreamInvocationMessage, StreamItemMessage, Value,
};

use crate::buffer::{MessageBuffer, ACK_RATE};
use crate::registry::{Handlers, InvocationRegistry, MethodHandler, PendingInvocation};
use crate::streams::{Arg, Canceler, ClientStream, ClientStreamEvent, HubStream};
use crate::transport::{DisconnectedHook, ResendHook, Transport, TransportEvent, TransportEvents};
use crate::{HubError, RetryContext, RetryPolicy, CHANNEL_SIZE};

/// Lifecycle state of a hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl std::fmt::Display for HubConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HubConnectionState::Disconnected => "Disconnected",
            HubConnectionState::Connecting => "Connecting",
            HubConnectionState::Connected => "Connected",
            HubConnectionState::Disconnecting => "Disconnecting",
            HubConnectionState::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Configuration for a [`HubConnection`].
pub struct HubConnectionOptions {
    /// Base URL forwarded to the transport before each start.
    pub url: Option<String>,
    /// Interval between keep-alive pings while connected.
    pub keep_alive_interval: Duration,
    /// How long the server may stay silent before the connection is
    /// considered lost.
    pub server_timeout: Duration,
    /// Byte budget of the stateful-reconnect buffer; senders block once it
    /// is reached.
    pub stateful_reconnect_buffer_size: usize,
    /// Reconnect policy. `None` disables automatic reconnection.
    pub retry_policy: Option<Box<dyn RetryPolicy>>,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            url: None,
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            stateful_reconnect_buffer_size: 100_000,
            retry_policy: None,
        }
    }
}

type ClosedCallback = Arc<dyn Fn(Option<&HubError>) + Send + Sync>;
type ReconnectedCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    closed: Vec<ClosedCallback>,
    reconnecting: Vec<ClosedCallback>,
    reconnected: Vec<ReconnectedCallback>,
}

struct Lifecycle {
    state: HubConnectionState,
    /// True after the first Connecting -> Connected of a start() call;
    /// decides whether close callbacks fire.
    connection_started: bool,
    /// Error injected by a concurrent stop(); start() re-raises it even
    /// when the handshake eventually completes.
    stop_during_start_error: Option<HubError>,
    /// Completed by the handshake response or by connection loss.
    handshake_waiter: Option<oneshot::Sender<Result<(), HubError>>>,
    ping_task: Option<JoinHandle<()>>,
    timeout_task: Option<JoinHandle<()>>,
    /// Armed while the reconnect loop sleeps; fired by stop().
    reconnect_delay_abort: Option<oneshot::Sender<()>>,
}

struct Core<T, P> {
    protocol: P,
    keep_alive_interval: Duration,
    server_timeout: Duration,
    buffer_size: usize,
    retry: Option<Box<dyn RetryPolicy>>,
    transport: tokio::sync::Mutex<T>,
    buffer: Mutex<Option<Arc<MessageBuffer>>>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<HubConnectionState>,
    invocations: InvocationRegistry,
    handlers: Handlers,
    callbacks: Mutex<Callbacks>,
    next_id: AtomicU64,
    /// Bumped on every transport start; close events from superseded
    /// transports are ignored.
    transport_generation: AtomicU64,
    ping_frame: OnceLock<Payload>,
    last_inbound: Mutex<Instant>,
    last_outbound: Mutex<Instant>,
    base_url: Mutex<Option<String>>,
}

/// A persistent RPC channel to a hub server.
///
/// Cheap to clone; all clones share the same logical connection.
pub struct HubConnection<T, P> {
    core: Arc<Core<T, P>>,
}

impl<T, P> Clone for HubConnection<T, P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T, P> HubConnection<T, P>
where
    T: Transport,
    P: HubProtocol,
{
    /// Create a connection over the given transport and protocol.
    ///
    /// Nothing happens until [`start`](Self::start) is called.
    pub fn new(transport: T, protocol: P, options: HubConnectionOptions) -> Self {
        let (state_tx, _state_rx) = watch::channel(HubConnectionState::Disconnected);
        Self {
            core: Arc::new(Core {
                protocol,
                keep_alive_interval: options.keep_alive_interval,
                server_timeout: options.server_timeout,
                buffer_size: options.stateful_reconnect_buffer_size,
                retry: options.retry_policy,
                transport: tokio::sync::Mutex::new(transport),
                buffer: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle {
                    state: HubConnectionState::Disconnected,
                    connection_started: false,
                    stop_during_start_error: None,
                    handshake_waiter: None,
                    ping_task: None,
                    timeout_task: None,
                    reconnect_delay_abort: None,
                }),
                state_tx,
                invocations: InvocationRegistry::default(),
                handlers: Handlers::default(),
                callbacks: Mutex::new(Callbacks::default()),
                next_id: AtomicU64::new(0),
                transport_generation: AtomicU64::new(0),
                ping_frame: OnceLock::new(),
                last_inbound: Mutex::new(Instant::now()),
                last_outbound: Mutex::new(Instant::now()),
                base_url: Mutex::new(options.url),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HubConnectionState {
        self.core.lifecycle().state
    }

    /// Broadcast stream of lifecycle state changes.
    pub fn state_stream(&self) -> watch::Receiver<HubConnectionState> {
        self.core.state_tx.subscribe()
    }

    /// Identifier of the current underlying connection, if one is known.
    pub async fn connection_id(&self) -> Option<String> {
        self.core.transport.lock().await.connection_id()
    }

    /// The base URL the transport will use on its next start.
    pub fn base_url(&self) -> Option<String> {
        self.core.locked(&self.core.base_url).clone()
    }

    /// Change the base URL.
    ///
    /// Allowed only while Disconnected or Reconnecting; the new URL takes
    /// effect on the next (re)connect attempt.
    pub fn set_base_url(&self, url: impl Into<String>) -> Result<(), HubError> {
        let state = self.core.lifecycle().state;
        if state != HubConnectionState::Disconnected && state != HubConnectionState::Reconnecting {
            return Err(HubError::InvalidState(
                "The HubConnection must be in the Disconnected or Reconnecting state to change the url."
                    .into(),
            ));
        }
        *self.core.locked(&self.core.base_url) = Some(url.into());
        Ok(())
    }

    /// Open the connection and perform the hub handshake.
    ///
    /// Fails unless the connection is Disconnected.
    pub async fn start(&self) -> Result<(), HubError> {
        {
            let mut lc = self.core.lifecycle();
            if lc.state != HubConnectionState::Disconnected {
                return Err(HubError::InvalidState(
                    "Cannot start a HubConnection that is not in the Disconnected state.".into(),
                ));
            }
            self.core.set_state(&mut lc, HubConnectionState::Connecting);
        }
        match self.core.clone().start_internal().await {
            Ok(()) => {
                let mut lc = self.core.lifecycle();
                self.core.set_state(&mut lc, HubConnectionState::Connected);
                lc.connection_started = true;
                debug!("hub connection started");
                Ok(())
            }
            Err(e) => {
                let mut lc = self.core.lifecycle();
                self.core.set_state(&mut lc, HubConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the connection and await full teardown. Idempotent.
    pub async fn stop(&self) -> Result<(), HubError> {
        let mut state_rx = self.core.state_tx.subscribe();
        // No further transport-level reconnect attempts during teardown.
        self.core
            .transport
            .lock()
            .await
            .set_reconnect_enabled(false);
        self.core.stop_internal(None).await;
        while *state_rx.borrow_and_update() != HubConnectionState::Disconnected {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Invoke a hub method without waiting for a result.
    ///
    /// Resolves once the frame has been enqueued for send.
    pub async fn send(&self, target: &str, args: Vec<Arg>) -> Result<(), HubError> {
        self.core.ensure_connected()?;
        let (arguments, streams) = self.core.extract_streams(args);
        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: None,
            target: target.to_string(),
            arguments,
            stream_ids: streams.iter().map(|(id, _)| id.clone()).collect(),
        });
        self.core.send_hub_message(&message).await?;
        self.core.launch_client_streams(streams);
        Ok(())
    }

    /// Invoke a hub method and await its completion.
    pub async fn invoke(&self, target: &str, args: Vec<Arg>) -> Result<Value, HubError> {
        self.core.ensure_connected()?;
        let (arguments, streams) = self.core.extract_streams(args);
        let invocation_id = self.core.next_invocation_id();
        let (tx, rx) = oneshot::channel();
        self.core
            .invocations
            .register(invocation_id.clone(), PendingInvocation::Invoke(tx));
        let message = HubMessage::Invocation(InvocationMessage {
            invocation_id: Some(invocation_id.clone()),
            target: target.to_string(),
            arguments,
            stream_ids: streams.iter().map(|(id, _)| id.clone()).collect(),
        });
        if let Err(e) = self.core.send_hub_message(&message).await {
            self.core.invocations.remove(&invocation_id);
            return Err(e);
        }
        self.core.launch_client_streams(streams);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HubError::InvocationCanceled(
                "the connection closed before the invocation completed".into(),
            )),
        }
    }

    /// Invoke a streaming hub method.
    ///
    /// Resolves with the item sink once the stream invocation has been
    /// handed to the transport, so a subsequent
    /// [`cancel`](HubStream::cancel) cannot overtake it on the wire.
    pub async fn stream(&self, target: &str, args: Vec<Arg>) -> Result<HubStream, HubError> {
        self.core.ensure_connected()?;
        let (arguments, streams) = self.core.extract_streams(args);
        let invocation_id = self.core.next_invocation_id();
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        self.core
            .invocations
            .register(invocation_id.clone(), PendingInvocation::Stream(tx));
        let message = HubMessage::StreamInvocation(StreamInvocationMessage {
            invocation_id: invocation_id.clone(),
            target: target.to_string(),
            arguments,
            stream_ids: streams.iter().map(|(id, _)| id.clone()).collect(),
        });
        if let Err(e) = self.core.send_hub_message(&message).await {
            self.core.invocations.remove(&invocation_id);
            return Err(e);
        }
        self.core.launch_client_streams(streams);

        let core = self.core.clone();
        let canceler: Canceler = Box::new(move || {
            Box::pin(async move {
                core.cancel_stream(invocation_id).await;
            })
        });
        Ok(HubStream::new(rx, canceler))
    }

    /// Register a handler for server-to-client invocations of `method`.
    ///
    /// Matching is case-insensitive; registering the same handler instance
    /// twice is a no-op.
    pub fn on(&self, method: &str, handler: MethodHandler) {
        self.core.handlers.on(method, handler);
    }

    /// Remove a handler, or every handler of `method` when none is given.
    pub fn off(&self, method: &str, handler: Option<&MethodHandler>) {
        self.core.handlers.off(method, handler);
    }

    /// Observe terminal closes.
    pub fn on_close(&self, callback: impl Fn(Option<&HubError>) + Send + Sync + 'static) {
        self.core.locked(&self.core.callbacks).closed.push(Arc::new(callback));
    }

    /// Observe the start of each reconnect round.
    pub fn on_reconnecting(&self, callback: impl Fn(Option<&HubError>) + Send + Sync + 'static) {
        self.core
            .locked(&self.core.callbacks)
            .reconnecting
            .push(Arc::new(callback));
    }

    /// Observe successful reconnects; receives the new connection id.
    pub fn on_reconnected(&self, callback: impl Fn(Option<&str>) + Send + Sync + 'static) {
        self.core
            .locked(&self.core.callbacks)
            .reconnected
            .push(Arc::new(callback));
    }
}

impl<T, P> Core<T, P>
where
    T: Transport,
    P: HubProtocol,
{
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn locked<'a, V>(&self, mutex: &'a Mutex<V>) -> MutexGuard<'a, V> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self) -> Option<Arc<MessageBuffer>> {
        self.locked(&self.buffer).clone()
    }

    fn set_state(&self, lc: &mut Lifecycle, next: HubConnectionState) {
        if lc.state != next {
            debug!(from = %lc.state, to = %next, "connection state changed");
            lc.state = next;
            self.state_tx.send_replace(next);
        }
    }

    fn ensure_connected(&self) -> Result<(), HubError> {
        if self.lifecycle().state == HubConnectionState::Connected {
            Ok(())
        } else {
            Err(HubError::InvalidState(
                "Cannot send data if the connection is not in the 'Connected' State.".into(),
            ))
        }
    }

    fn next_invocation_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn mark_outbound(&self) {
        *self.locked(&self.last_outbound) = Instant::now();
    }

    // ------------------------------------------------------------------
    // Start / handshake
    // ------------------------------------------------------------------

    async fn start_internal(self: Arc<Self>) -> Result<(), HubError> {
        self.lifecycle().stop_during_start_error = None;
        let result = self.clone().do_start().await;
        if let Err(e) = &result {
            debug!(error = %e, "start attempt failed, tearing down transport");
            self.cleanup_timers();
            self.lifecycle().handshake_waiter = None;
            let _ = self.transport.lock().await.stop(None).await;
        }
        result
    }

    fn do_start(
        self: Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), HubError>> + Send>> {
        Box::pin(async move { self.do_start_inner().await })
    }

    async fn do_start_inner(self: Arc<Self>) -> Result<(), HubError> {
        let (handshake_rx, features) = {
            let mut transport = self.transport.lock().await;
            let url = self.locked(&self.base_url).clone();
            if let Some(url) = &url {
                transport.set_url(url);
            }
            let events = transport.start(self.protocol.transfer_format()).await?;
            let features = transport.features();

            // Without stateful reconnect the server must not number our
            // messages, so fall back to protocol version 1. Re-evaluated on
            // every attempt since the feature can change between them.
            let version = if features.reconnect {
                self.protocol.version()
            } else {
                1
            };
            let request = handshake::write_handshake_request(&HandshakeRequest {
                protocol: self.protocol.name().to_string(),
                version,
            })?;

            let (tx, rx) = oneshot::channel();
            self.lifecycle().handshake_waiter = Some(tx);
            *self.locked(&self.last_inbound) = Instant::now();
            let generation = self.transport_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let recv_fut: Pin<Box<dyn Future<Output = ()> + Send>> =
                Box::pin(self.clone().recv_loop(events, generation));
            tokio::spawn(recv_fut);

            debug!(protocol = self.protocol.name(), version, "sending handshake request");
            transport.send(request).await?;
            self.mark_outbound();
            (rx, features)
        };

        self.arm_keep_alive(features.inherent_keep_alive);

        match handshake_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(HubError::Aborted(
                    "the connection closed before the handshake completed".into(),
                ))
            }
        }

        // A concurrent stop() wins even though the handshake completed.
        if let Some(e) = self.lifecycle().stop_during_start_error.clone() {
            return Err(e);
        }

        if features.reconnect {
            self.wire_stateful_reconnect().await;
        }
        Ok(())
    }

    /// Instantiate the message buffer (once per logical connection, so its
    /// contents survive hub-level reconnects) and hand the transport its
    /// disconnected/resend hooks.
    async fn wire_stateful_reconnect(self: &Arc<Self>) {
        let buffer = {
            let mut slot = self.locked(&self.buffer);
            slot.get_or_insert_with(|| Arc::new(MessageBuffer::new(self.buffer_size)))
                .clone()
        };
        let disconnected: DisconnectedHook = {
            let buffer = buffer.clone();
            Arc::new(move || buffer.disconnected())
        };
        let resend: ResendHook = {
            let core = Arc::downgrade(self);
            Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    match core.upgrade() {
                        Some(core) => core.resend().await,
                        None => Ok(()),
                    }
                })
            })
        };
        self.transport
            .lock()
            .await
            .set_reconnect_hooks(disconnected, resend);
    }

    /// Replay everything the server has not acknowledged, on a freshly
    /// re-established underlying connection. Invoked by the transport.
    async fn resend(self: Arc<Self>) -> std::io::Result<()> {
        let Some(buffer) = self.buffer() else {
            return Ok(());
        };
        let mut transport = self.transport.lock().await;
        let (base, payloads) = buffer.resend_snapshot();
        debug!(base, count = payloads.len(), "replaying buffered messages");
        let sequence = self
            .protocol
            .write_message(&HubMessage::Sequence(SequenceMessage { sequence_id: base }))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        transport.send(sequence).await?;
        for payload in payloads {
            transport.send(payload).await?;
        }
        buffer.finish_resend();
        drop(transport);
        self.mark_outbound();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stop / close
    // ------------------------------------------------------------------

    async fn stop_internal(self: &Arc<Self>, error: Option<HubError>) {
        enum Plan {
            Nothing,
            CompleteClose,
            StopTransport,
        }

        let plan = {
            let mut lc = self.lifecycle();
            match lc.state {
                HubConnectionState::Disconnected => {
                    debug!("stop() ignored: already Disconnected");
                    Plan::Nothing
                }
                // A stop is already in flight; callers await its completion.
                HubConnectionState::Disconnecting => Plan::Nothing,
                prior => {
                    self.set_state(&mut lc, HubConnectionState::Disconnecting);
                    let delay_abort = (prior == HubConnectionState::Reconnecting)
                        .then(|| lc.reconnect_delay_abort.take())
                        .flatten();
                    if let Some(abort) = delay_abort {
                        // The reconnect loop is only sleeping: no transport
                        // or timers are live, so the close completes here.
                        let _ = abort.send(());
                        Plan::CompleteClose
                    } else {
                        if lc.stop_during_start_error.is_none() {
                            lc.stop_during_start_error = Some(error.clone().unwrap_or_else(|| {
                                HubError::Aborted(
                                    "The connection was stopped before the hub handshake could complete."
                                        .into(),
                                )
                            }));
                        }
                        Plan::StopTransport
                    }
                }
            }
        };

        match plan {
            Plan::Nothing => {}
            Plan::CompleteClose => self.complete_close(error).await,
            Plan::StopTransport => {
                self.cleanup_timers();
                let _ = self.transport.lock().await.stop(error).await;
            }
        }
    }

    /// Entry point from the transport: the underlying connection is gone.
    async fn connection_closed(self: &Arc<Self>, error: Option<HubError>, generation: u64) {
        if generation != self.transport_generation.load(Ordering::SeqCst) {
            debug!(generation, "ignoring close from a superseded transport");
            return;
        }
        let (waiter, prior_state, start_error) = {
            let mut lc = self.lifecycle();
            let start_error = match &lc.stop_during_start_error {
                Some(e) => e.clone(),
                None => {
                    let e = error.clone().unwrap_or_else(|| {
                        HubError::Aborted(
                            "The underlying connection was closed before the hub handshake could complete."
                                .into(),
                        )
                    });
                    lc.stop_during_start_error = Some(e.clone());
                    e
                }
            };
            (lc.handshake_waiter.take(), lc.state, start_error)
        };

        match &error {
            Some(e) => debug!(state = %prior_state, error = %e, "underlying connection closed"),
            None => debug!(state = %prior_state, "underlying connection closed"),
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(start_error));
        }

        let reason = match &error {
            Some(e) => format!("the underlying connection was closed: {e}"),
            None => "the underlying connection was closed".to_string(),
        };
        self.invocations
            .fail_all(&HubError::InvocationCanceled(reason))
            .await;

        self.cleanup_timers();

        match prior_state {
            HubConnectionState::Disconnecting => self.complete_close(error).await,
            HubConnectionState::Connected => {
                let core = self.clone();
                let fut: Pin<Box<dyn Future<Output = ()> + Send>> =
                    Box::pin(async move { core.reconnect_loop(error).await });
                tokio::spawn(fut);
            }
            // Connecting / Reconnecting: the start path observes
            // stop_during_start_error and unwinds on its own.
            _ => {}
        }
    }

    /// Terminal close: final state transition, buffer disposal, callbacks.
    async fn complete_close(self: &Arc<Self>, error: Option<HubError>) {
        let fire = {
            let mut lc = self.lifecycle();
            let fire = lc.connection_started;
            lc.connection_started = false;
            self.set_state(&mut lc, HubConnectionState::Disconnected);
            fire
        };
        self.cleanup_timers();
        let buffer = self.locked(&self.buffer).take();
        if let Some(buffer) = buffer {
            buffer.dispose(
                &error
                    .clone()
                    .unwrap_or_else(|| HubError::Aborted("the connection was closed".into())),
            );
        }
        if fire {
            match &error {
                Some(e) => debug!(error = %e, "connection closed"),
                None => debug!("connection closed"),
            }
            self.fire_closed(error.as_ref());
        }
    }

    // ------------------------------------------------------------------
    // Reconnect loop
    // ------------------------------------------------------------------

    async fn reconnect_loop(self: Arc<Self>, error: Option<HubError>) {
        let Some(policy) = &self.retry else {
            debug!("connection lost and no retry policy is configured");
            self.complete_close(error).await;
            return;
        };

        let started_at = Instant::now();
        let mut previous_attempts = 0u32;
        let mut retry_reason = error
            .clone()
            .unwrap_or_else(|| HubError::Aborted("the underlying connection was lost".into()));

        let mut next_delay = policy.next_retry_delay(&RetryContext {
            previous_retry_count: 0,
            elapsed: Duration::ZERO,
            retry_reason: retry_reason.clone(),
        });
        if next_delay.is_none() {
            debug!("retry policy declined to reconnect");
            self.complete_close(error).await;
            return;
        }

        {
            let mut lc = self.lifecycle();
            self.set_state(&mut lc, HubConnectionState::Reconnecting);
        }
        match &error {
            Some(e) => warn!(error = %e, "connection lost, reconnecting"),
            None => warn!("connection lost, reconnecting"),
        }
        self.fire_reconnecting(error.as_ref());
        if self.lifecycle().state != HubConnectionState::Reconnecting {
            debug!("a reconnecting callback stopped the connection");
            return;
        }

        while let Some(delay) = next_delay {
            debug!(
                attempt = previous_attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect attempt"
            );
            let (abort_tx, abort_rx) = oneshot::channel::<()>();
            self.lifecycle().reconnect_delay_abort = Some(abort_tx);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // stop() fired the abort and completes the close itself.
                _ = abort_rx => return,
            }
            {
                let mut lc = self.lifecycle();
                lc.reconnect_delay_abort = None;
                if lc.state != HubConnectionState::Reconnecting {
                    return;
                }
            }

            match self.clone().start_internal().await {
                Ok(()) => {
                    {
                        let mut lc = self.lifecycle();
                        if lc.state != HubConnectionState::Reconnecting {
                            return;
                        }
                        self.set_state(&mut lc, HubConnectionState::Connected);
                    }
                    let connection_id = self.transport.lock().await.connection_id();
                    debug!(connection_id = connection_id.as_deref(), "reconnected");
                    self.fire_reconnected(connection_id.as_deref());
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt = previous_attempts + 1, "reconnect attempt failed");
                    previous_attempts += 1;
                    retry_reason = e;
                    let should_stop = {
                        let lc = self.lifecycle();
                        if lc.state != HubConnectionState::Reconnecting {
                            Some(lc.state == HubConnectionState::Disconnecting)
                        } else {
                            None
                        }
                    };
                    if let Some(disconnecting) = should_stop {
                        if disconnecting {
                            self.complete_close(None).await;
                        }
                        return;
                    }
                    next_delay = policy.next_retry_delay(&RetryContext {
                        previous_retry_count: previous_attempts,
                        elapsed: started_at.elapsed(),
                        retry_reason: retry_reason.clone(),
                    });
                }
            }
        }

        warn!(
            attempts = previous_attempts,
            "reconnect retries exhausted, closing"
        );
        self.complete_close(Some(HubError::RetryExhausted {
            attempts: previous_attempts,
        }))
        .await;
    }

    // ------------------------------------------------------------------
    // Keep-alive & timeout
    // ------------------------------------------------------------------

    fn arm_keep_alive(self: &Arc<Self>, inherent_keep_alive: bool) {
        self.cleanup_timers();
        let mut lc = self.lifecycle();
        lc.ping_task = Some(tokio::spawn(ping_loop(
            Arc::downgrade(self),
            self.keep_alive_interval,
        )));
        if !inherent_keep_alive {
            lc.timeout_task = Some(tokio::spawn(timeout_loop(
                Arc::downgrade(self),
                self.server_timeout,
            )));
        }
    }

    fn cleanup_timers(&self) {
        let (ping, timeout) = {
            let mut lc = self.lifecycle();
            (lc.ping_task.take(), lc.timeout_task.take())
        };
        if let Some(task) = ping {
            task.abort();
        }
        if let Some(task) = timeout {
            task.abort();
        }
    }

    fn ping_frame(&self) -> Result<Payload, HubError> {
        if let Some(frame) = self.ping_frame.get() {
            return Ok(frame.clone());
        }
        let frame = self.protocol.write_message(&HubMessage::Ping)?;
        let _ = self.ping_frame.set(frame.clone());
        Ok(frame)
    }

    async fn send_ping(&self) {
        let frame = match self.ping_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode ping frame");
                return;
            }
        };
        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.send(frame).await {
            debug!(error = %e, "keep-alive ping failed");
        }
        drop(transport);
        self.mark_outbound();
    }

    async fn server_timeout_elapsed(&self) {
        warn!("server timeout elapsed without receiving a message");
        let _ = self
            .transport
            .lock()
            .await
            .stop(Some(HubError::Timeout))
            .await;
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn recv_loop(self: Arc<Self>, mut events: TransportEvents, generation: u64) {
        loop {
            match events.recv().await {
                Some(TransportEvent::Frame(payload)) => {
                    if generation != self.transport_generation.load(Ordering::SeqCst) {
                        debug!(generation, "discarding frame from a superseded transport");
                        continue;
                    }
                    *self.locked(&self.last_inbound) = Instant::now();
                    self.process_incoming(payload).await;
                }
                Some(TransportEvent::Closed(error)) => {
                    self.connection_closed(error, generation).await;
                    return;
                }
                None => {
                    self.connection_closed(None, generation).await;
                    return;
                }
            }
        }
    }

    async fn process_incoming(self: &Arc<Self>, payload: Payload) {
        let payload = if self.lifecycle().handshake_waiter.is_some() {
            match self.take_handshake(payload) {
                Some(rest) => rest,
                None => return,
            }
        } else {
            payload
        };

        let messages = match self.protocol.parse_messages(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "discarding unparseable frame");
                return;
            }
        };
        for message in messages {
            self.dispatch_message(message).await;
        }
    }

    /// Consume the handshake response off the front of the first frame,
    /// handing back any coalesced hub messages.
    fn take_handshake(&self, payload: Payload) -> Option<Payload> {
        let result = handshake::parse_handshake_response(&payload);
        let Some(waiter) = self.lifecycle().handshake_waiter.take() else {
            return Some(payload);
        };
        match result {
            Ok((response, remaining)) => {
                if let Some(server_error) = response.error {
                    let _ = waiter.send(Err(HubError::Handshake(format!(
                        "server returned handshake error: {server_error}"
                    ))));
                    None
                } else {
                    debug!("server handshake complete");
                    let _ = waiter.send(Ok(()));
                    remaining
                }
            }
            Err(e) => {
                let _ = waiter.send(Err(HubError::Handshake(e.to_string())));
                None
            }
        }
    }

    async fn dispatch_message(self: &Arc<Self>, message: HubMessage) {
        let buffer = self.buffer();
        if let Some(buffer) = &buffer {
            let gate = buffer.should_process(&message);
            if gate.arm_ack_timer {
                self.spawn_ack_timer();
            }
            if !gate.process {
                debug!(kind = message.kind(), "dropping duplicate or out-of-band message");
                return;
            }
        }

        match message {
            HubMessage::Invocation(invocation) => self.dispatch_invocation(invocation).await,
            HubMessage::StreamItem(item) => {
                let known = self
                    .invocations
                    .route_stream_item(&item.invocation_id, item.item)
                    .await;
                if !known {
                    warn!(invocation_id = %item.invocation_id, "no pending invocation for stream item");
                }
            }
            HubMessage::Completion(completion) => {
                let invocation_id = completion.invocation_id.clone();
                if !self.invocations.complete(completion).await {
                    warn!(invocation_id = %invocation_id, "no pending invocation for completion");
                }
            }
            // The timeout reset already happened, unconditionally.
            HubMessage::Ping => {}
            HubMessage::Close(close) => {
                debug!(allow_reconnect = close.allow_reconnect, "server sent close");
                let error = close.error.map(HubError::ServerClose);
                if close.allow_reconnect {
                    // Stopping only the transport routes this through the
                    // reconnect path.
                    let _ = self.transport.lock().await.stop(error).await;
                } else {
                    self.stop_internal(error).await;
                }
            }
            HubMessage::StreamInvocation(invocation) => {
                error!(target = %invocation.target, "server sent a stream invocation; closing");
                self.stop_internal(Some(HubError::ServerExpectsResponse(invocation.target)))
                    .await;
            }
            HubMessage::CancelInvocation(cancel) => {
                debug!(invocation_id = %cancel.invocation_id, "ignoring CancelInvocation from server");
            }
            HubMessage::Ack(ack) => {
                if let Some(buffer) = &buffer {
                    buffer.ack(ack.sequence_id);
                }
            }
            HubMessage::Sequence(sequence) => match &buffer {
                Some(buffer) => {
                    if let Err(e) = buffer.reset_sequence(sequence.sequence_id) {
                        error!(sequence_id = sequence.sequence_id, "sequence violation, closing");
                        self.stop_internal(Some(e)).await;
                    }
                }
                None => warn!("received Sequence message without stateful reconnect"),
            },
        }
    }

    async fn dispatch_invocation(self: &Arc<Self>, invocation: InvocationMessage) {
        let handlers = self.handlers.get(&invocation.target);
        if handlers.is_empty() {
            warn!(target = %invocation.target, "no client method registered");
        }
        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler(&invocation.arguments)
            }));
            if result.is_err() {
                error!(target = %invocation.target, "client method handler panicked");
            }
        }
        // Server-to-client invocations expecting a response are not
        // supported.
        let expects_response = invocation
            .invocation_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        if expects_response {
            error!(target = %invocation.target, "server requested a response; closing");
            self.stop_internal(Some(HubError::ServerExpectsResponse(invocation.target)))
                .await;
        }
    }

    fn spawn_ack_timer(self: &Arc<Self>) {
        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(ACK_RATE).await;
            let Some(core) = core.upgrade() else { return };
            let Some(buffer) = core.buffer() else { return };
            let Some(sequence_id) = buffer.on_ack_fire() else {
                return;
            };
            let frame = match core
                .protocol
                .write_message(&HubMessage::Ack(AckMessage { sequence_id }))
            {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode Ack frame");
                    return;
                }
            };
            let mut transport = core.transport.lock().await;
            if let Err(e) = transport.send(frame).await {
                debug!(error = %e, "failed to send Ack frame");
            }
            drop(transport);
            core.mark_outbound();
        });
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Serialize and send one message, through the buffer when stateful
    /// reconnect is active. The transport lock spans buffer registration
    /// and the write, so wire order equals call order.
    async fn send_hub_message(&self, message: &HubMessage) -> Result<(), HubError> {
        let payload = self.protocol.write_message(message)?;
        let buffer = self.buffer();
        let backpressure = {
            let mut transport = self.transport.lock().await;
            match &buffer {
                Some(buffer) => {
                    let ticket = buffer.prepare_send(&payload, message.is_invocation_family());
                    if ticket.forward {
                        if let Err(e) = transport.send(payload).await {
                            // Swallowed: the reconnect machinery replays the
                            // buffered frame.
                            debug!(error = %e, "transport send failed; holding for resend");
                            buffer.disconnected();
                        }
                    }
                    ticket.backpressure
                }
                None => {
                    transport.send(payload).await?;
                    None
                }
            }
        };
        self.mark_outbound();
        if let Some(backpressure) = backpressure {
            match backpressure.await {
                Ok(released) => released?,
                Err(_) => {
                    return Err(HubError::Aborted(
                        "the connection was closed while waiting for buffer capacity".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn extract_streams(&self, args: Vec<Arg>) -> (Vec<Value>, Vec<(String, ClientStream)>) {
        let mut arguments = Vec::with_capacity(args.len());
        let mut streams = Vec::new();
        for arg in args {
            match arg {
                Arg::Value(value) => arguments.push(value),
                Arg::Stream(stream) => {
                    streams.push((self.next_invocation_id(), stream));
                }
            }
        }
        (arguments, streams)
    }

    /// Pump every client stream of one invocation through a single task,
    /// so emissions are sequenced per invocation.
    fn launch_client_streams(self: &Arc<Self>, streams: Vec<(String, ClientStream)>) {
        if streams.is_empty() {
            return;
        }
        let core = self.clone();
        tokio::spawn(async move {
            use futures_util::StreamExt;

            enum Event {
                Item(Value),
                Error(String),
                End,
            }

            let tagged = streams.into_iter().map(|(id, stream)| {
                let end_id = id.clone();
                stream
                    .map(move |event| {
                        let event = match event {
                            ClientStreamEvent::Item(value) => Event::Item(value),
                            ClientStreamEvent::Error(error) => Event::Error(error),
                        };
                        (id.clone(), event)
                    })
                    .chain(futures_util::stream::iter(std::iter::once((
                        end_id,
                        Event::End,
                    ))))
            });
            let mut merged = futures_util::stream::select_all(tagged);

            let mut completed: HashSet<String> = HashSet::new();
            while let Some((id, event)) = merged.next().await {
                if completed.contains(&id) {
                    continue;
                }
                let message = match event {
                    Event::Item(item) => HubMessage::StreamItem(StreamItemMessage {
                        invocation_id: id.clone(),
                        item,
                    }),
                    Event::Error(error) => {
                        completed.insert(id.clone());
                        HubMessage::Completion(CompletionMessage {
                            invocation_id: id.clone(),
                            result: None,
                            error: Some(error),
                        })
                    }
                    Event::End => {
                        completed.insert(id.clone());
                        HubMessage::Completion(CompletionMessage {
                            invocation_id: id.clone(),
                            result: None,
                            error: None,
                        })
                    }
                };
                if let Err(e) = core.send_hub_message(&message).await {
                    debug!(error = %e, "client stream send failed; stopping pump");
                    return;
                }
            }
        });
    }

    async fn cancel_stream(self: &Arc<Self>, invocation_id: String) {
        // Remove the entry first: items already in flight are discarded.
        if self.invocations.remove(&invocation_id).is_none() {
            return;
        }
        debug!(invocation_id = %invocation_id, "canceling stream invocation");
        let message = HubMessage::CancelInvocation(CancelInvocationMessage { invocation_id });
        if let Err(e) = self.send_hub_message(&message).await {
            debug!(error = %e, "failed to send CancelInvocation");
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle observers
    // ------------------------------------------------------------------

    fn fire_closed(&self, error: Option<&HubError>) {
        let callbacks = self.locked(&self.callbacks).closed.clone();
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                error!("onclose callback panicked");
            }
        }
    }

    fn fire_reconnecting(&self, error: Option<&HubError>) {
        let callbacks = self.locked(&self.callbacks).reconnecting.clone();
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                error!("onreconnecting callback panicked");
            }
        }
    }

    fn fire_reconnected(&self, connection_id: Option<&str>) {
        let callbacks = self.locked(&self.callbacks).reconnected.clone();
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(connection_id))).is_err() {
                error!("onreconnected callback panicked");
            }
        }
    }
}

async fn ping_loop<T, P>(core: Weak<Core<T, P>>, interval: Duration)
where
    T: Transport,
    P: HubProtocol,
{
    loop {
        let deadline = {
            let Some(core) = core.upgrade() else { return };
            let last_outbound = *core.locked(&core.last_outbound);
            last_outbound + interval
        };
        match deadline.checked_duration_since(Instant::now()) {
            Some(wait) => tokio::time::sleep(wait).await,
            None => {
                let Some(core) = core.upgrade() else { return };
                if core.lifecycle().state == HubConnectionState::Connected {
                    core.send_ping().await;
                } else {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

async fn timeout_loop<T, P>(core: Weak<Core<T, P>>, timeout: Duration)
where
    T: Transport,
    P: HubProtocol,
{
    loop {
        let deadline = {
            let Some(core) = core.upgrade() else { return };
            let last_inbound = *core.locked(&core.last_inbound);
            last_inbound + timeout
        };
        match deadline.checked_duration_since(Instant::now()) {
            Some(wait) => tokio::time::sleep(wait).await,
            None => {
                let Some(core) = core.upgrade() else { return };
                core.server_timeout_elapsed().await;
                return;
            }
        }
    }
}
