//! End-to-end call through a WebSocket voice gateway with the post-call
//! redirect resolved against a backend.
//!
//! Both the gateway and the backend are small in-process fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use futures::{SinkExt, StreamExt};
use levelup_client::{AuthTokens, BackendClient};
use levelup_session::{
    CallStatus, EngineService, GatewayEngine, Redirector, SessionConfig, SessionController,
    SessionEvent, StartParams,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tungstenite::Message;

/// Starts a backend whose interview list counts its hits.
async fn spawn_backend() -> (String, Arc<AtomicUsize>) {
    async fn list(State(hits): State<Arc<AtomicUsize>>) -> Json<serde_json::Value> {
        hits.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!([
            { "id": 11, "role": "Backend Engineer", "created_at": "2025-06-01T10:00:00" },
            { "id": 12, "role": "Rust Developer", "created_at": "2025-06-02T10:00:00" },
            { "id": 10, "role": "SRE", "created_at": "2025-05-30T10:00:00" }
        ]))
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/interviews/", get(list))
        .with_state(hits.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let url = format!("http://{}", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("backend failed");
    });
    (url, hits)
}

/// Starts a gateway that reports every command and plays a scripted call
/// once it receives `start`.
async fn spawn_gateway(script: Vec<&'static str>) -> (String, mpsc::Receiver<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let url = format!("ws://{}/call", listener.local_addr().expect("addr"));
    let (commands_tx, commands_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("handshake");

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let command: serde_json::Value = serde_json::from_str(&text).expect("command json");
            let is_start = command["command"] == "start";
            let _ = commands_tx.send(command).await;

            if is_start {
                for frame in &script {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ws.send(Message::Text((*frame).to_string()))
                        .await
                        .expect("send frame");
                }
            }
        }
    });

    (url, commands_rx)
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timeout waiting for session event")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_signalled_call_redirects_to_newest_interview() {
    let (backend_url, hits) = spawn_backend().await;
    let (gateway_url, mut commands) = spawn_gateway(vec![
        r#"{"type":"call-start"}"#,
        r#"{"type":"message","message":{"type":"transcript","transcript":"Hello"}}"#,
        r#"{"type":"message","message":{"type":"api-endpoint-called"}}"#,
        r#"{"type":"call-end"}"#,
        r#"{"type":"error","message":{"message":"Meeting has ended"}}"#,
    ])
    .await;

    let backend = BackendClient::new(backend_url, AuthTokens::bearer("token"));
    let controller = SessionController::new(
        EngineService::new(move || Arc::new(GatewayEngine::new(gateway_url.clone(), "pk"))),
        SessionConfig::default(),
        Some(Redirector::new(Arc::new(backend), "api-endpoint-called")),
    );
    let mut events = controller.subscribe();

    controller
        .start_session("asst-mock", StartParams::mock(Some("alice"), "token"))
        .await
        .expect("start");

    let start = timeout(Duration::from_secs(5), commands.recv())
        .await
        .expect("Timeout waiting for start command")
        .expect("gateway gone");
    assert_eq!(start["command"], "start");
    assert_eq!(start["assistantId"], "asst-mock");
    assert_eq!(start["publicKey"], "pk");
    assert_eq!(start["params"]["variableValues"]["username"], "alice");

    let navigation = loop {
        if let SessionEvent::Navigate(navigation) = next_event(&mut events).await {
            break navigation;
        }
    };
    assert_eq!(navigation.interview_id, 12);
    assert_eq!(navigation.path, "/interviews/12");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Idle);
    assert!(snapshot.last_error.is_none());
    assert_eq!(snapshot.navigation, Some(navigation));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_unsignalled_call_does_not_redirect() {
    let (backend_url, hits) = spawn_backend().await;
    let (gateway_url, _commands) =
        spawn_gateway(vec![r#"{"type":"call-start"}"#, r#"{"type":"call-end"}"#]).await;

    let backend = BackendClient::new(backend_url, AuthTokens::bearer("token"));
    let controller = SessionController::new(
        EngineService::new(move || Arc::new(GatewayEngine::new(gateway_url.clone(), "pk"))),
        SessionConfig::default(),
        Some(Redirector::new(Arc::new(backend), "api-endpoint-called")),
    );
    let mut events = controller.subscribe();

    let questions = vec!["What is a lifetime?".to_string()];
    controller
        .start_session("asst-interview", StartParams::interview(&questions).expect("params"))
        .await
        .expect("start");

    loop {
        if let SessionEvent::StatusChanged(change) = next_event(&mut events).await {
            if change.to == CallStatus::Idle {
                break;
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(controller.snapshot().await.navigation.is_none());
}

#[tokio::test]
async fn test_unreachable_gateway_surfaces_start_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let gateway_url = format!("ws://{}/call", listener.local_addr().expect("addr"));
    drop(listener);

    let controller = SessionController::new(
        EngineService::new(move || Arc::new(GatewayEngine::new(gateway_url.clone(), "pk"))),
        SessionConfig::default(),
        None,
    );

    let err = controller
        .start_session("asst", StartParams::default())
        .await
        .expect_err("start should fail");
    assert_eq!(err.user_message(), levelup_session::START_FAILED_MESSAGE);

    let session = controller.session().await;
    assert_eq!(session.status, CallStatus::Error);
    assert_eq!(
        session.last_error.as_deref(),
        Some(levelup_session::START_FAILED_MESSAGE)
    );
}

#[tokio::test]
async fn test_cancel_during_slow_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let gateway_url = format!("ws://{}/call", listener.local_addr().expect("addr"));
    // Accept TCP, never complete the WebSocket handshake.
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let controller = SessionController::new(
        EngineService::new(move || Arc::new(GatewayEngine::new(gateway_url.clone(), "pk"))),
        SessionConfig::default(),
        None,
    );

    let starter = controller.clone();
    let start = tokio::spawn(async move {
        starter
            .start_session("asst", StartParams::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.session().await.status, CallStatus::Connecting);

    timeout(Duration::from_secs(2), controller.end_session())
        .await
        .expect("cancel waited for the start bound")
        .expect("end");
    let session = controller.session().await;
    assert_eq!(session.status, CallStatus::Idle);
    assert!(session.last_error.is_none());

    let result = timeout(Duration::from_secs(2), start)
        .await
        .expect("start still pending after cancel")
        .expect("start task");
    assert!(result.is_err());

    // The cancelled start must not push the session into an error.
    let session = controller.session().await;
    assert_eq!(session.status, CallStatus::Idle);
    assert!(session.last_error.is_none());
}
