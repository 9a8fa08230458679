//! Lifecycle tests: start, handshake, invoke, stop, keep-alive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tether_client::transport::TransportFeatures;
use tether_client::{Arg, HubConnection, HubConnectionOptions, HubConnectionState, HubError};
use tether_testkit::{memory_pair, HubPeer, MemoryTransport};
use tether_wire::json::JsonHubProtocol;
use tether_wire::{CompletionMessage, HubMessage, InvocationMessage};

type TestConnection = HubConnection<MemoryTransport, JsonHubProtocol>;

fn new_connection(
    features: TransportFeatures,
    options: HubConnectionOptions,
) -> (TestConnection, HubPeer) {
    let (transport, peer) = memory_pair(features);
    (
        HubConnection::new(transport, JsonHubProtocol, options),
        peer,
    )
}

/// Start a connection and complete the server handshake.
async fn connect(
    features: TransportFeatures,
    options: HubConnectionOptions,
) -> (TestConnection, HubPeer) {
    let (connection, mut peer) = new_connection(features, options);
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

#[tokio::test]
async fn start_completes_handshake_and_connects() {
    let (connection, mut peer) = new_connection(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    );
    assert_eq!(connection.state(), HubConnectionState::Disconnected);

    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    peer.wait_start().await;
    let request = peer.complete_handshake().await;
    // Without stateful reconnect the protocol downgrades to version 1.
    assert_eq!(request.protocol, "json");
    assert_eq!(request.version, 1);

    starting.await.unwrap().unwrap();
    assert_eq!(connection.state(), HubConnectionState::Connected);
    assert_eq!(
        connection.connection_id().await.as_deref(),
        Some("test-connection-1")
    );
}

#[tokio::test]
async fn invoke_resolves_with_the_completion_result() {
    let (connection, mut peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    let invoking = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Echo", vec![Arg::Value(json!("x"))]).await })
    };

    match peer.recv_message().await {
        HubMessage::Invocation(invocation) => {
            assert_eq!(invocation.invocation_id.as_deref(), Some("0"));
            assert_eq!(invocation.target, "Echo");
            assert_eq!(invocation.arguments, vec![json!("x")]);
            assert!(invocation.stream_ids.is_empty());
        }
        other => panic!("expected an invocation, got {other:?}"),
    }

    peer.send_frame(&HubMessage::Completion(CompletionMessage {
        invocation_id: "0".into(),
        result: Some(json!("x")),
        error: None,
    }))
    .await;

    assert_eq!(invoking.await.unwrap().unwrap(), json!("x"));
}

#[tokio::test]
async fn invoke_fails_with_the_completion_error() {
    let (connection, mut peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    let invoking = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Explode", vec![]).await })
    };
    let _ = peer.recv_message().await;
    peer.send_frame(&HubMessage::Completion(CompletionMessage {
        invocation_id: "0".into(),
        result: None,
        error: Some("kaboom".into()),
    }))
    .await;

    match invoking.await.unwrap() {
        Err(HubError::Server(e)) => assert_eq!(e, "kaboom"),
        other => panic!("expected a server error, got {other:?}"),
    }
}

#[tokio::test]
async fn starting_twice_is_an_invalid_state() {
    let (connection, _peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;
    match connection.start().await {
        Err(HubError::InvalidState(_)) => {}
        other => panic!("expected an invalid state error, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_error_rejects_start() {
    let (connection, mut peer) = new_connection(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    );
    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    peer.wait_start().await;
    peer.reject_handshake("unsupported protocol").await;

    match starting.await.unwrap() {
        Err(HubError::Handshake(message)) => assert!(message.contains("unsupported protocol")),
        other => panic!("expected a handshake error, got {other:?}"),
    }
    wait_for_state(&connection, HubConnectionState::Disconnected).await;
}

#[tokio::test]
async fn handshake_times_out_when_the_server_stays_silent() {
    let (connection, mut peer) = new_connection(
        TransportFeatures::default(),
        HubConnectionOptions {
            server_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    peer.wait_start().await;
    let _request = peer.recv_handshake().await;
    // Never answer.

    match starting.await.unwrap() {
        Err(HubError::Timeout) => {}
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(connection.state(), HubConnectionState::Disconnected);
}

#[tokio::test]
async fn stop_is_idempotent_and_fires_onclose_once() {
    let (connection, _peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    let closes = Arc::new(AtomicU32::new(0));
    {
        let closes = closes.clone();
        connection.on_close(move |_error| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let first = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.stop().await })
    };
    let second = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.stop().await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(connection.state(), HubConnectionState::Disconnected);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // A third stop after full teardown is a no-op.
    connection.stop().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pending_invocations_fail_when_the_connection_closes() {
    let (connection, mut peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    let invoking = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Slow", vec![]).await })
    };
    let _ = peer.recv_message().await;
    peer.close(None).await;

    match invoking.await.unwrap() {
        Err(HubError::InvocationCanceled(_)) => {}
        other => panic!("expected a canceled invocation, got {other:?}"),
    }
    wait_for_state(&connection, HubConnectionState::Disconnected).await;
}

#[tokio::test]
async fn server_close_without_reconnect_tears_down() {
    let (connection, peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    let close_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    {
        let close_error = close_error.clone();
        connection.on_close(move |error| {
            *close_error.lock().unwrap() = error.map(|e| e.to_string());
        });
    }

    peer.send_frame(&HubMessage::Close(tether_wire::CloseMessage {
        error: Some("boom".into()),
        allow_reconnect: false,
    }))
    .await;

    wait_for_state(&connection, HubConnectionState::Disconnected).await;
    let recorded = close_error.lock().unwrap().clone().expect("onclose fired");
    assert!(recorded.contains("boom"));
}

#[tokio::test]
async fn handlers_are_case_insensitive_and_deduplicated() {
    let (connection, peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    let calls = Arc::new(AtomicU32::new(0));
    let handler: tether_client::MethodHandler = {
        let calls = calls.clone();
        Arc::new(move |args: &[serde_json::Value]| {
            assert_eq!(args, [json!(7)]);
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    connection.on("Notify", handler.clone());
    connection.on("notify", handler.clone());

    peer.send_frame(&HubMessage::Invocation(InvocationMessage {
        invocation_id: None,
        target: "NOTIFY".into(),
        arguments: vec![json!(7)],
        stream_ids: vec![],
    }))
    .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // off + on restores the handler exactly once.
    connection.off("notify", Some(&handler));
    connection.on("Notify", handler.clone());
    connection.on("Notify", handler.clone());
    peer.send_frame(&HubMessage::Invocation(InvocationMessage {
        invocation_id: None,
        target: "notify".into(),
        arguments: vec![json!(7)],
        stream_ids: vec![],
    }))
    .await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn server_invocation_expecting_a_response_closes_the_connection() {
    let (connection, peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    )
    .await;

    peer.send_frame(&HubMessage::Invocation(InvocationMessage {
        invocation_id: Some("5".into()),
        target: "CallMeBack".into(),
        arguments: vec![],
        stream_ids: vec![],
    }))
    .await;

    wait_for_state(&connection, HubConnectionState::Disconnected).await;
}

#[tokio::test]
async fn keep_alive_pings_flow_while_connected() {
    let (_connection, mut peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions {
            keep_alive_interval: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .await;

    let ping = tokio::time::timeout(Duration::from_secs(2), peer.recv_message())
        .await
        .expect("a ping within the keep-alive interval");
    assert_eq!(ping, HubMessage::Ping);
}

#[tokio::test]
async fn server_silence_times_out_the_connection() {
    let (connection, _peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions {
            server_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .await;

    let close_error: Arc<Mutex<Option<HubError>>> = Arc::new(Mutex::new(None));
    {
        let close_error = close_error.clone();
        connection.on_close(move |error| {
            *close_error.lock().unwrap() = error.cloned();
        });
    }

    wait_for_state(&connection, HubConnectionState::Disconnected).await;
    assert!(matches!(
        close_error.lock().unwrap().clone(),
        Some(HubError::Timeout)
    ));
}

#[tokio::test]
async fn inherent_keep_alive_suppresses_the_timeout() {
    let (connection, _peer) = connect(
        TransportFeatures {
            inherent_keep_alive: true,
            ..Default::default()
        },
        HubConnectionOptions {
            server_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(connection.state(), HubConnectionState::Connected);
}

#[tokio::test]
async fn inbound_traffic_resets_the_server_timeout() {
    let (connection, peer) = connect(
        TransportFeatures::default(),
        HubConnectionOptions {
            server_timeout: Duration::from_millis(300),
            ..Default::default()
        },
    )
    .await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.send_frame(&HubMessage::Ping).await;
    }
    assert_eq!(connection.state(), HubConnectionState::Connected);
}

#[tokio::test]
async fn base_url_changes_only_while_disconnected_or_reconnecting() {
    let (connection, mut peer) = new_connection(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    );
    connection.set_base_url("http://example.test/hub").unwrap();

    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    peer.wait_start().await;
    peer.complete_handshake().await;
    starting.await.unwrap().unwrap();

    assert_eq!(peer.url().as_deref(), Some("http://example.test/hub"));
    match connection.set_base_url("http://elsewhere.test/hub") {
        Err(HubError::InvalidState(_)) => {}
        other => panic!("expected an invalid state error, got {other:?}"),
    }
    assert_eq!(
        connection.base_url().as_deref(),
        Some("http://example.test/hub")
    );
}

#[tokio::test]
async fn send_requires_a_connected_state() {
    let (connection, _peer) = new_connection(
        TransportFeatures::default(),
        HubConnectionOptions::default(),
    );
    match connection.send("Anything", vec![]).await {
        Err(HubError::InvalidState(_)) => {}
        other => panic!("expected an invalid state error, got {other:?}"),
    }
}
