//! Pending invocations and method handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use tether_wire::{CompletionMessage, ProtocolError, Value};

use crate::HubError;

/// Continuation for one pending invocation id.
pub(crate) enum PendingInvocation {
    /// Single-shot: resolved by the matching Completion.
    Invoke(oneshot::Sender<Result<Value, HubError>>),
    /// Multi-shot: fed by StreamItems until a Completion closes it.
    Stream(mpsc::Sender<Result<Value, HubError>>),
}

/// Maps pending invocation ids to their continuations.
///
/// Every entry is consumed exactly once: by its Completion, by stream
/// cancellation, by a send failure, or by [`fail_all`](Self::fail_all) on
/// connection close.
#[derive(Default)]
pub(crate) struct InvocationRegistry {
    pending: Mutex<HashMap<String, PendingInvocation>>,
}

impl InvocationRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingInvocation>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, invocation_id: String, pending: PendingInvocation) {
        self.lock().insert(invocation_id, pending);
    }

    pub(crate) fn remove(&self, invocation_id: &str) -> Option<PendingInvocation> {
        self.lock().remove(invocation_id)
    }

    /// Route one inbound StreamItem. Returns false when the id is unknown.
    pub(crate) async fn route_stream_item(&self, invocation_id: &str, item: Value) -> bool {
        enum Route {
            Push(mpsc::Sender<Result<Value, HubError>>),
            FailInvoke(oneshot::Sender<Result<Value, HubError>>),
            Unknown,
        }

        let route = {
            let mut pending = self.lock();
            match pending.get(invocation_id) {
                Some(PendingInvocation::Stream(tx)) => Route::Push(tx.clone()),
                Some(PendingInvocation::Invoke(_)) => match pending.remove(invocation_id) {
                    Some(PendingInvocation::Invoke(tx)) => Route::FailInvoke(tx),
                    _ => Route::Unknown,
                },
                None => Route::Unknown,
            }
        };

        match route {
            Route::Push(tx) => {
                let _ = tx.send(Ok(item)).await;
                true
            }
            Route::FailInvoke(tx) => {
                let _ = tx.send(Err(HubError::Protocol(ProtocolError::Malformed(
                    "received a StreamItem for a non-streaming invocation".into(),
                ))));
                true
            }
            Route::Unknown => false,
        }
    }

    /// Route one inbound Completion, removing the entry. Returns false when
    /// the id is unknown.
    pub(crate) async fn complete(&self, completion: CompletionMessage) -> bool {
        let Some(pending) = self.remove(&completion.invocation_id) else {
            return false;
        };
        match pending {
            PendingInvocation::Invoke(tx) => {
                let result = match completion.error {
                    Some(error) => Err(HubError::Server(error)),
                    None => Ok(completion.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            }
            PendingInvocation::Stream(tx) => {
                if let Some(error) = completion.error {
                    let _ = tx.send(Err(HubError::Server(error))).await;
                }
                // Dropping the sender closes the sink.
            }
        }
        true
    }

    /// Error every pending continuation exactly once and clear the map.
    pub(crate) async fn fail_all(&self, error: &HubError) {
        let drained: Vec<PendingInvocation> = {
            let mut pending = self.lock();
            pending.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            match pending {
                PendingInvocation::Invoke(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                PendingInvocation::Stream(tx) => {
                    let _ = tx.send(Err(error.clone())).await;
                }
            }
        }
    }
}

/// Handler invoked for server-to-client invocations of one method.
pub type MethodHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Case-insensitive method handler table.
///
/// Registering the same handler instance twice is a no-op; identity is the
/// `Arc` allocation, compared by pointer.
#[derive(Default)]
pub(crate) struct Handlers {
    map: Mutex<HashMap<String, Vec<MethodHandler>>>,
}

impl Handlers {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<MethodHandler>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn on(&self, method: &str, handler: MethodHandler) {
        let mut map = self.lock();
        let handlers = map.entry(method.to_ascii_lowercase()).or_default();
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return;
        }
        handlers.push(handler);
    }

    pub(crate) fn off(&self, method: &str, handler: Option<&MethodHandler>) {
        let mut map = self.lock();
        let key = method.to_ascii_lowercase();
        match handler {
            None => {
                map.remove(&key);
            }
            Some(handler) => {
                if let Some(handlers) = map.get_mut(&key) {
                    handlers.retain(|h| !Arc::ptr_eq(h, handler));
                    if handlers.is_empty() {
                        map.remove(&key);
                    }
                }
            }
        }
    }

    pub(crate) fn get(&self, method: &str) -> Vec<MethodHandler> {
        self.lock()
            .get(&method.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn completion_resolves_a_pending_invoke() {
        let registry = InvocationRegistry::default();
        let (tx, rx) = oneshot::channel();
        registry.register("0".into(), PendingInvocation::Invoke(tx));

        assert!(
            registry
                .complete(CompletionMessage {
                    invocation_id: "0".into(),
                    result: Some(Value::from("x")),
                    error: None,
                })
                .await
        );
        assert_eq!(rx.await.unwrap().unwrap(), Value::from("x"));
    }

    #[tokio::test]
    async fn completion_error_fails_the_continuation() {
        let registry = InvocationRegistry::default();
        let (tx, rx) = oneshot::channel();
        registry.register("0".into(), PendingInvocation::Invoke(tx));

        registry
            .complete(CompletionMessage {
                invocation_id: "0".into(),
                result: None,
                error: Some("kaboom".into()),
            })
            .await;
        assert!(matches!(rx.await.unwrap(), Err(HubError::Server(e)) if e == "kaboom"));
    }

    #[tokio::test]
    async fn stream_item_for_an_invoke_fails_it() {
        let registry = InvocationRegistry::default();
        let (tx, rx) = oneshot::channel();
        registry.register("0".into(), PendingInvocation::Invoke(tx));

        assert!(registry.route_stream_item("0", Value::Null).await);
        assert!(matches!(rx.await.unwrap(), Err(HubError::Protocol(_))));
        // The entry was consumed.
        assert!(!registry.route_stream_item("0", Value::Null).await);
    }

    #[tokio::test]
    async fn fail_all_errors_every_continuation_once() {
        let registry = InvocationRegistry::default();
        let (invoke_tx, invoke_rx) = oneshot::channel();
        let (stream_tx, mut stream_rx) = mpsc::channel(4);
        registry.register("0".into(), PendingInvocation::Invoke(invoke_tx));
        registry.register("1".into(), PendingInvocation::Stream(stream_tx));

        registry
            .fail_all(&HubError::InvocationCanceled("closed".into()))
            .await;

        assert!(matches!(
            invoke_rx.await.unwrap(),
            Err(HubError::InvocationCanceled(_))
        ));
        assert!(matches!(
            stream_rx.recv().await,
            Some(Err(HubError::InvocationCanceled(_)))
        ));
        assert!(stream_rx.recv().await.is_none());
        assert!(registry.remove("0").is_none());
    }

    #[test]
    fn duplicate_handler_instances_are_ignored() {
        let handlers = Handlers::default();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let handler: MethodHandler = Arc::new(move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handlers.on("Echo", handler.clone());
        handlers.on("echo", handler.clone());
        handlers.on("ECHO", handler.clone());

        for h in handlers.get("eChO") {
            h(&[]);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_then_on_restores_the_handler_exactly_once() {
        let handlers = Handlers::default();
        let handler: MethodHandler = Arc::new(|_args| {});
        let other: MethodHandler = Arc::new(|_args| {});

        handlers.on("m", handler.clone());
        handlers.on("m", other.clone());
        handlers.off("m", Some(&handler));
        handlers.on("m", handler.clone());
        handlers.on("m", handler.clone());

        assert_eq!(handlers.get("m").len(), 2);

        // Omitting the handler removes all.
        handlers.off("m", None);
        assert!(handlers.get("m").is_empty());
    }
}
