//! Integration tests for the session HTTP API and its WebSocket event stream.
//!
//! A loopback engine stands in for the voice engine; engine events are
//! injected by hand while real HTTP and WebSocket clients observe.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use levelup_session::{
    create_router, AppState, CallStatus, Config, EngineEvent, EngineService, LoopbackEngine,
    SessionController, SessionEvent, SessionSnapshot, StartParams, StartResponse,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

struct TestServer {
    base_url: String,
    ws_url: String,
    engine: Arc<LoopbackEngine>,
    controller: SessionController,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_test_server() -> TestServer {
    let engine = Arc::new(LoopbackEngine::new());
    let config = Config::default();
    let controller = SessionController::new(
        EngineService::from_engine(engine.clone()),
        config.session.clone(),
        None,
    );
    let state = AppState::new(
        config,
        controller.clone(),
        "asst-interview",
        StartParams::interview(&["Tell me about ownership".to_string()])
            .expect("params"),
    );

    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");
    let router = create_router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        engine,
        controller,
        handle,
    }
}

async fn connect_client(url: &str) -> WsClient {
    let (ws_stream, _) = connect_async(url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next session event, answering pings on the way.
async fn receive_event(client: &mut WsClient) -> SessionEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            other => panic!("Unexpected message: {other:?}"),
        }
    }
}

/// Skips events until a status change to `status` arrives.
async fn wait_for_status(client: &mut WsClient, status: CallStatus) {
    loop {
        if let SessionEvent::StatusChanged(change) = receive_event(client).await {
            if change.to == status {
                return;
            }
        }
    }
}

async fn post(url: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .send()
        .await
        .expect("Request failed")
}

#[tokio::test]
async fn test_client_receives_snapshot_on_connect() {
    let server = spawn_test_server().await;
    let mut client = connect_client(&server.ws_url).await;

    let SessionEvent::Connected(payload) = receive_event(&mut client).await else {
        panic!("expected connected event");
    };
    assert_eq!(payload.session.status, CallStatus::Idle);
    assert_eq!(payload.session.formatted_duration, "0:00");
    assert_eq!(payload.session.button_label, "Start Practice Interview");
}

#[tokio::test]
async fn test_full_call_over_http_and_ws() {
    let server = spawn_test_server().await;
    let mut client = connect_client(&server.ws_url).await;
    receive_event(&mut client).await;

    let response = post(&format!("{}/api/session/start", server.base_url)).await;
    assert_eq!(response.status(), 200);
    let started: StartResponse = response.json().await.expect("start body");
    assert_eq!(started.attempt, 1);
    wait_for_status(&mut client, CallStatus::Connecting).await;

    server.engine.emit(EngineEvent::CallStart);
    wait_for_status(&mut client, CallStatus::Active).await;

    let tick = loop {
        if let SessionEvent::Tick(tick) = receive_event(&mut client).await {
            break tick;
        }
    };
    assert_eq!(tick.duration_seconds, 1);
    assert_eq!(tick.formatted, "0:01");

    let snapshot: SessionSnapshot = reqwest::get(format!("{}/api/session", server.base_url))
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("snapshot body");
    assert_eq!(snapshot.status, CallStatus::Active);
    assert_eq!(snapshot.button_label, "End Interview");

    let response = post(&format!("{}/api/session/end", server.base_url)).await;
    assert_eq!(response.status(), 200);
    wait_for_status(&mut client, CallStatus::Idle).await;

    let session = server.controller.session().await;
    assert_eq!(session.status, CallStatus::Idle);
    assert_eq!(session.duration_seconds, 0);
    assert!(session.last_error.is_none());
}

#[tokio::test]
async fn test_second_start_conflicts() {
    let server = spawn_test_server().await;

    let first = post(&format!("{}/api/session/start", server.base_url)).await;
    assert_eq!(first.status(), 200);

    let second = post(&format!("{}/api/session/start", server.base_url)).await;
    assert_eq!(second.status(), 409);
    let body: serde_json::Value = second.json().await.expect("error body");
    assert!(body["error"].as_str().unwrap_or_default().contains("busy"));
}

#[tokio::test]
async fn test_engine_error_reaches_all_clients() {
    let server = spawn_test_server().await;
    let mut first = connect_client(&server.ws_url).await;
    let mut second = connect_client(&server.ws_url).await;
    receive_event(&mut first).await;
    receive_event(&mut second).await;

    post(&format!("{}/api/session/start", server.base_url)).await;
    server.engine.emit(EngineEvent::CallStart);
    server.engine.emit(EngineEvent::error("network lost"));

    for client in [&mut first, &mut second] {
        let message = loop {
            if let SessionEvent::Error(payload) = receive_event(client).await {
                break payload.message;
            }
        };
        assert_eq!(message, "An error occurred: network lost");
    }

    let response = post(&format!("{}/api/session/dismiss", server.base_url)).await;
    let snapshot: SessionSnapshot = response.json().await.expect("snapshot body");
    assert_eq!(snapshot.status, CallStatus::Idle);
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    let server = spawn_test_server().await;
    server
        .engine
        .set_stop_behavior(levelup_session::StopBehavior::Accept);

    post(&format!("{}/api/session/start", server.base_url)).await;
    let response = post(&format!("{}/api/session/end", server.base_url)).await;
    assert_eq!(response.status(), 200);
    let snapshot: SessionSnapshot = response.json().await.expect("snapshot body");
    assert_eq!(snapshot.status, CallStatus::Idle);
    assert!(snapshot.last_error.is_none());
    assert!(!server.controller.has_pending_timeout().await);
}
