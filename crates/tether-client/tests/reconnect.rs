//! Reconnect loop tests: retry policies, lifecycle observers, stop
//! interaction.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tether_client::transport::TransportFeatures;
use tether_client::{
    Arg, HubConnection, HubConnectionOptions, HubConnectionState, HubError, RetryContext,
};
use tether_testkit::{memory_pair, HubPeer, MemoryTransport};
use tether_wire::json::JsonHubProtocol;
use tether_wire::{CloseMessage, CompletionMessage, HubMessage};

type TestConnection = HubConnection<MemoryTransport, JsonHubProtocol>;

async fn connect(options: HubConnectionOptions) -> (TestConnection, HubPeer) {
    let (transport, mut peer) = memory_pair(TransportFeatures::default());
    let connection = HubConnection::new(transport, JsonHubProtocol, options);
    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    peer.wait_start().await;
    peer.complete_handshake().await;
    starting.await.unwrap().unwrap();
    (connection, peer)
}

async fn wait_for_state(connection: &TestConnection, state: HubConnectionState) {
    let mut rx = connection.state_stream();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != state {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("connection never reached {state}"));
}

fn quick_retry() -> Option<Box<dyn tether_client::RetryPolicy>> {
    Some(Box::new(|_ctx: &RetryContext| {
        Some(Duration::from_millis(10))
    }))
}

#[tokio::test]
async fn server_close_with_allow_reconnect_reconnects() {
    let (connection, mut peer) = connect(HubConnectionOptions {
        retry_policy: quick_retry(),
        ..Default::default()
    })
    .await;

    let reconnecting_errors: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let reconnected_ids: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let reconnecting_errors = reconnecting_errors.clone();
        connection.on_reconnecting(move |error| {
            reconnecting_errors
                .lock()
                .unwrap()
                .push(error.map(|e| e.to_string()));
        });
    }
    {
        let reconnected_ids = reconnected_ids.clone();
        connection.on_reconnected(move |id| {
            reconnected_ids.lock().unwrap().push(id.map(str::to_string));
        });
    }

    peer.send_frame(&HubMessage::Close(CloseMessage {
        error: Some("boom".into()),
        allow_reconnect: true,
    }))
    .await;

    // The reconnect loop starts the transport again and redoes the
    // handshake.
    assert_eq!(peer.wait_start().await, 2);
    peer.complete_handshake().await;
    wait_for_state(&connection, HubConnectionState::Connected).await;

    let errors = reconnecting_errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].as_deref().unwrap().contains("boom"));
    assert_eq!(
        reconnected_ids.lock().unwrap().clone(),
        vec![Some("test-connection-2".to_string())]
    );

    // The revived connection carries traffic.
    let invoking = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Echo", vec![Arg::Value(json!(1))]).await })
    };
    let _ = peer.recv_message().await;
    peer.send_frame(&HubMessage::Completion(CompletionMessage {
        invocation_id: "0".into(),
        result: Some(json!(1)),
        error: None,
    }))
    .await;
    assert_eq!(invoking.await.unwrap().unwrap(), json!(1));
}

#[tokio::test]
async fn no_retry_policy_means_no_reconnect() {
    let (connection, peer) = connect(HubConnectionOptions::default()).await;

    let reconnecting = Arc::new(AtomicU32::new(0));
    let closes = Arc::new(AtomicU32::new(0));
    {
        let reconnecting = reconnecting.clone();
        connection.on_reconnecting(move |_| {
            reconnecting.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let closes = closes.clone();
        connection.on_close(move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }

    peer.close(None).await;
    wait_for_state(&connection, HubConnectionState::Disconnected).await;
    assert_eq!(reconnecting.load(Ordering::SeqCst), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn policy_declining_the_first_attempt_closes_without_reconnecting() {
    let (connection, peer) = connect(HubConnectionOptions {
        retry_policy: Some(Box::new(|_ctx: &RetryContext| None)),
        ..Default::default()
    })
    .await;

    let reconnecting = Arc::new(AtomicU32::new(0));
    {
        let reconnecting = reconnecting.clone();
        connection.on_reconnecting(move |_| {
            reconnecting.fetch_add(1, Ordering::SeqCst);
        });
    }

    peer.close(None).await;
    wait_for_state(&connection, HubConnectionState::Disconnected).await;
    assert_eq!(reconnecting.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_policy_closes_with_retry_exhausted() {
    // Two attempts, both rejected by the server, then give up.
    let contexts: Arc<Mutex<Vec<(u32, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
    let policy = {
        let contexts = contexts.clone();
        move |ctx: &RetryContext| {
            contexts
                .lock()
                .unwrap()
                .push((ctx.previous_retry_count, ctx.elapsed));
            if ctx.previous_retry_count < 2 {
                Some(Duration::from_millis(10))
            } else {
                None
            }
        }
    };
    let (connection, mut peer) = connect(HubConnectionOptions {
        retry_policy: Some(Box::new(policy)),
        ..Default::default()
    })
    .await;

    let close_error: Arc<Mutex<Option<HubError>>> = Arc::new(Mutex::new(None));
    {
        let close_error = close_error.clone();
        connection.on_close(move |error| {
            *close_error.lock().unwrap() = error.cloned();
        });
    }

    peer.close(Some(HubError::ServerClose("gone".into()))).await;

    for attempt in [2u32, 3] {
        assert_eq!(peer.wait_start().await, attempt);
        peer.reject_handshake("still gone").await;
    }

    wait_for_state(&connection, HubConnectionState::Disconnected).await;
    assert!(matches!(
        close_error.lock().unwrap().clone(),
        Some(HubError::RetryExhausted { attempts: 2 })
    ));

    // The policy saw strictly increasing retry counts and non-decreasing
    // elapsed times.
    let seen = contexts.lock().unwrap().clone();
    assert_eq!(
        seen.iter().map(|(count, _)| *count).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(seen.windows(2).all(|pair| pair[0].1 <= pair[1].1));
}

#[tokio::test]
async fn stop_during_the_reconnect_delay_completes_the_close() {
    let (connection, peer) = connect(HubConnectionOptions {
        retry_policy: Some(Box::new(|_ctx: &RetryContext| {
            Some(Duration::from_secs(3600))
        })),
        ..Default::default()
    })
    .await;

    let closes = Arc::new(AtomicU32::new(0));
    {
        let closes = closes.clone();
        connection.on_close(move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }

    peer.close(None).await;
    wait_for_state(&connection, HubConnectionState::Reconnecting).await;

    // stop() cancels the armed delay timer and completes the close
    // without waiting the hour out.
    tokio::time::timeout(Duration::from_secs(5), connection.stop())
        .await
        .expect("stop returns promptly")
        .unwrap();
    assert_eq!(connection.state(), HubConnectionState::Disconnected);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_failures_report_the_latest_error_to_the_policy() {
    let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let policy = {
        let reasons = reasons.clone();
        move |ctx: &RetryContext| {
            reasons.lock().unwrap().push(ctx.retry_reason.to_string());
            if ctx.previous_retry_count < 1 {
                Some(Duration::from_millis(10))
            } else {
                None
            }
        }
    };
    let (connection, mut peer) = connect(HubConnectionOptions {
        retry_policy: Some(Box::new(policy)),
        ..Default::default()
    })
    .await;

    peer.close(Some(HubError::ServerClose("first".into()))).await;
    assert_eq!(peer.wait_start().await, 2);
    peer.reject_handshake("second").await;
    wait_for_state(&connection, HubConnectionState::Disconnected).await;

    let seen = reasons.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains("first"));
    assert!(seen[1].contains("second"));
}
