//! Voice engine reached over a WebSocket gateway.
//!
//! The gateway speaks JSON. Commands go out as
//! `{"command":"start","version":1,"publicKey":..,"assistantId":..,"params":..}`
//! and `{"command":"stop","version":1}`; events come back in the
//! [`EngineEvent`] wire format. The connection is opened lazily by the first
//! start and reused afterwards.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, EngineEventBus, StartParams, VoiceEngine, ENGINE_EVENT_VERSION};
use crate::error::{Result, SessionError};

type GatewayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands sent to the gateway.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
enum GatewayCommand<'a> {
    #[serde(rename_all = "camelCase")]
    Start {
        version: u32,
        public_key: &'a str,
        assistant_id: &'a str,
        params: &'a StartParams,
    },
    Stop {
        version: u32,
    },
}

struct Connection {
    sink: SplitSink<GatewayStream, Message>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn connect(url: String, bus: EngineEventBus) -> Result<Connection> {
    debug!(url = %url, "Connecting to voice gateway");
    let (stream, _) = connect_async(url.as_str()).await.map_err(|e| {
        SessionError::start_failed(format!("cannot reach voice gateway at {url}: {e}"))
    })?;
    info!(url = %url, "Connected to voice gateway");

    let (sink, source) = stream.split();
    let reader = tokio::spawn(read_events(source, bus));
    Ok(Connection { sink, reader })
}

/// [`VoiceEngine`] backed by a WebSocket gateway.
pub struct GatewayEngine {
    url: String,
    public_key: String,
    bus: EngineEventBus,
    connection: Mutex<Option<Connection>>,
    pending: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for GatewayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayEngine")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl GatewayEngine {
    /// Creates an engine for the gateway at `url`. Nothing is connected yet.
    pub fn new(url: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            public_key: public_key.into(),
            bus: EngineEventBus::default(),
            connection: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Gateway URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens the connection in its own task so that `stop` can abort it.
    ///
    /// The task is also aborted if this future is dropped, for instance by
    /// the caller's start timeout.
    async fn connect_cancellable(&self) -> Result<Connection> {
        let task = {
            let mut pending = self.pending.lock().await;
            let task = tokio::spawn(connect(self.url.clone(), self.bus.clone()));
            *pending = Some(task.abort_handle());
            task
        };
        let _abort_on_drop = AbortOnDrop(task.abort_handle());

        let joined = task.await;
        // A stop took the handle meanwhile, even if the connect finished first.
        let cancelled = self.pending.lock().await.take().is_none();
        match joined {
            _ if cancelled => Err(SessionError::start_failed("start cancelled by stop")),
            Ok(result) => result,
            Err(e) => Err(SessionError::start_failed(format!(
                "gateway connect task failed: {e}"
            ))),
        }
    }

    async fn send(connection: &mut Connection, command: &GatewayCommand<'_>) -> Result<()> {
        let json = serde_json::to_string(command)?;
        connection
            .sink
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::engine(format!("gateway write failed: {e}")))
    }
}

#[async_trait]
impl VoiceEngine for GatewayEngine {
    async fn start(&self, assistant_id: &str, params: &StartParams) -> Result<()> {
        let open = self
            .connection
            .lock()
            .await
            .as_ref()
            .is_some_and(Connection::is_open);
        if !open {
            let connection = self.connect_cancellable().await?;
            *self.connection.lock().await = Some(connection);
        }

        let mut guard = self.connection.lock().await;
        let Some(connection) = guard.as_mut() else {
            return Err(SessionError::start_failed("no gateway connection"));
        };

        let command = GatewayCommand::Start {
            version: ENGINE_EVENT_VERSION,
            public_key: &self.public_key,
            assistant_id,
            params,
        };
        if let Err(e) = Self::send(connection, &command).await {
            *guard = None;
            return Err(SessionError::start_failed(e.to_string()));
        }
        debug!(assistant_id, "Start command sent");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(pending) = self.pending.lock().await.take() {
            pending.abort();
            info!(url = %self.url, "Gateway connect aborted");
            return Ok(());
        }

        let mut guard = self.connection.lock().await;
        let Some(connection) = guard.as_mut().filter(|c| c.is_open()) else {
            debug!("Stop without an open gateway connection");
            return Ok(());
        };

        let command = GatewayCommand::Stop {
            version: ENGINE_EVENT_VERSION,
        };
        if let Err(e) = Self::send(connection, &command).await {
            *guard = None;
            return Err(SessionError::stop_failed(e.to_string()));
        }
        debug!("Stop command sent");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }
}

async fn read_events(mut source: SplitStream<GatewayStream>, bus: EngineEventBus) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_event(&text) {
                Some(event) => {
                    debug!(event = event.name(), "Gateway event");
                    bus.publish(event);
                }
                None => debug!(text = %text, "Ignoring unrecognized gateway message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Gateway connection failed");
                bus.publish(EngineEvent::error(format!("voice gateway connection lost: {e}")));
                return;
            }
        }
    }
    info!("Voice gateway closed the connection");
    bus.publish(EngineEvent::error("voice gateway closed the connection"));
}

/// Parses one gateway frame into an event.
///
/// Error frames are accepted with any `message` shape: a nested object
/// contributes its own `message` field, anything else its JSON text.
pub fn parse_event(text: &str) -> Option<EngineEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(Value::as_str) == Some("error") {
        let message = match value.get("message") {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Object(inner)) => inner
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| Value::Object(inner.clone()).to_string(), str::to_string),
            Some(other) => other.to_string(),
            None => "unknown engine error".to_string(),
        };
        return Some(EngineEvent::Error { message });
    }
    serde_json::from_value(value).ok()
}
