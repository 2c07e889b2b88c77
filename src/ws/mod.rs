//! WebSocket transport for chat replies.
//!
//! A session runs as a background task:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!              ^          |
//!              |          v
//!              +--- Reconnecting (linear backoff) --> Closed
//! ```
//!
//! The serialized request is sent as the first frame of every connection and
//! replayed unchanged on reconnect. Opening a socket resets the reconnect
//! counter. A `done` frame ends the session; an explicit `disconnect`/`abort`
//! closes the socket and fires no further callbacks.

pub mod connector;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::AuthStore;
use crate::config::ClientConfig;
use crate::errors::{ChatError, Result};
use crate::models::WsChatRequest;

pub use connector::{TungsteniteConnector, WsConnection, WsConnector};

pub const WS_CHAT_PATH: &str = "/api/v1/chat/ws/chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Closed,
}

/// How a session ended, as reported by [`WsSession::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The backend sent `done`.
    Done,
    /// Every reconnect attempt failed.
    GaveUp,
    /// Closed through `disconnect`/`abort` or dropped handle.
    Disconnected,
}

/// Caller hooks for a WebSocket session. `on_close` fires at most once: when
/// the backend sends `done` or reconnect attempts run out.
pub struct WsCallbacks {
    on_message: Box<dyn FnMut(String) + Send>,
    on_error: Box<dyn FnMut(ChatError) + Send>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl WsCallbacks {
    pub fn new(
        on_message: impl FnMut(String) + Send + 'static,
        on_error: impl FnMut(ChatError) + Send + 'static,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            on_message: Box::new(on_message),
            on_error: Box::new(on_error),
            on_close: Some(Box::new(on_close)),
        }
    }

    fn error(&mut self, err: ChatError) {
        warn!("WebSocket error: {err}");
        (self.on_error)(err);
    }

    fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Chunk(String),
    Done,
    Ignored,
}

/// JSON frames are `{"type":"chunk","content":..}` or `{"type":"done"}`.
/// Anything that is not JSON is forwarded as plain text.
fn parse_inbound(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Inbound::Chunk(text.to_string());
    };
    match value.get("type").and_then(Value::as_str) {
        Some("chunk") => match value.get("content").and_then(Value::as_str) {
            Some(content) => Inbound::Chunk(content.to_string()),
            None => Inbound::Ignored,
        },
        Some("done") => Inbound::Done,
        _ => Inbound::Ignored,
    }
}

/// Opens WebSocket chat sessions.
#[derive(Clone)]
pub struct WsChatClient {
    config: ClientConfig,
    store: Arc<dyn AuthStore>,
    connector: Arc<dyn WsConnector>,
}

impl WsChatClient {
    pub fn new(config: ClientConfig, store: Arc<dyn AuthStore>) -> Self {
        Self::with_connector(config, store, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(config: ClientConfig, store: Arc<dyn AuthStore>, connector: Arc<dyn WsConnector>) -> Self {
        Self { config, store, connector }
    }

    /// `ws[s]://<base>/api/v1/chat/ws/chat?conversation_id=<id>`
    pub fn chat_url(&self, conversation_id: i64) -> Result<Url> {
        let mut url = self.config.ws_endpoint(WS_CHAT_PATH)?;
        url.query_pairs_mut()
            .append_pair("conversation_id", &conversation_id.to_string());
        Ok(url)
    }

    /// Starts a session in the background. Must be called inside a Tokio runtime.
    pub fn connect(&self, conversation_id: i64, request: &WsChatRequest, callbacks: WsCallbacks) -> Result<WsSession> {
        let url = self.chat_url(conversation_id)?;
        let payload = serde_json::to_string(request).map_err(ChatError::Serialize)?;
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let task = SessionTask {
            url,
            payload,
            store: Arc::clone(&self.store),
            connector: Arc::clone(&self.connector),
            max_attempts: self.config.max_reconnect_attempts,
            base_delay: self.config.reconnect_base_delay,
            cancel: cancel.clone(),
            state: state_tx,
            callbacks,
        };
        info!(conversation_id, "Opening WebSocket chat session");
        let handle = tokio::spawn(task.run());

        Ok(WsSession {
            cancel,
            state: state_rx,
            task: Some(handle),
            end: None,
        })
    }
}

/// Handle to a running session. Dropping it closes the session.
pub struct WsSession {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<SessionEnd>>,
    end: Option<SessionEnd>,
}

impl WsSession {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Closes the live socket. No reconnect follows and no callback fires.
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            info!("Disconnecting WebSocket chat session");
            self.cancel.cancel();
        }
    }

    pub fn abort(&self) {
        self.disconnect();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits until the session has reached [`SessionState::Closed`].
    ///
    /// Cancel safe: if the returned future is dropped the session keeps its
    /// task handle and a later call waits again.
    pub async fn wait(&mut self) -> SessionEnd {
        if let Some(task) = self.task.as_mut() {
            let end = match task.await {
                Ok(end) => end,
                Err(err) => {
                    error!("WebSocket session task failed: {err}");
                    SessionEnd::Disconnected
                }
            };
            self.task = None;
            self.end = Some(end);
        }
        self.end.unwrap_or(SessionEnd::Disconnected)
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    /// Backend sent `done`.
    Finished,
    /// Explicit disconnect.
    Cancelled,
    /// Socket closed or failed to open.
    Dropped,
}

enum Step {
    Cancelled,
    Frame(Option<Result<String>>),
}

struct SessionTask {
    url: Url,
    payload: String,
    store: Arc<dyn AuthStore>,
    connector: Arc<dyn WsConnector>,
    max_attempts: u32,
    base_delay: std::time::Duration,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    callbacks: WsCallbacks,
}

impl SessionTask {
    async fn run(mut self) -> SessionEnd {
        let mut attempts: u32 = 0;
        let end = loop {
            match self.connect_once(&mut attempts).await {
                Outcome::Finished => {
                    self.callbacks.close();
                    break SessionEnd::Done;
                }
                Outcome::Cancelled => break SessionEnd::Disconnected,
                Outcome::Dropped => {}
            }

            if attempts >= self.max_attempts {
                info!(attempts, "WebSocket reconnect attempts exhausted");
                self.callbacks.close();
                break SessionEnd::GaveUp;
            }
            attempts += 1;
            let delay = self.base_delay * attempts;
            self.state.send_replace(SessionState::Reconnecting);
            info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Scheduling WebSocket reconnect");

            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Disconnected,
                _ = tokio::time::sleep(delay) => {}
            }
        };
        self.state.send_replace(SessionState::Closed);
        debug!(?end, "WebSocket chat session closed");
        end
    }

    async fn connect_once(&mut self, attempts: &mut u32) -> Outcome {
        self.state.send_replace(SessionState::Connecting);
        let cancel = self.cancel.clone();
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            connected = self.connector.connect(&self.url, self.store.access_token()) => connected,
        };

        let mut conn = match connected {
            Ok(conn) => conn,
            Err(err) => {
                self.callbacks.error(err);
                return Outcome::Dropped;
            }
        };

        self.state.send_replace(SessionState::Open);
        *attempts = 0;
        if let Err(err) = conn.send_text(self.payload.clone()).await {
            self.callbacks.error(err);
        }
        self.drive(&mut conn).await
    }

    async fn drive(&mut self, conn: &mut Box<dyn WsConnection>) -> Outcome {
        let cancel = self.cancel.clone();
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                frame = conn.next_message() => Step::Frame(frame),
            };

            match step {
                Step::Cancelled => {
                    self.state.send_replace(SessionState::Closing);
                    if let Err(err) = conn.close().await {
                        debug!("Error while closing WebSocket: {err}");
                    }
                    return Outcome::Cancelled;
                }
                Step::Frame(None) => {
                    debug!("WebSocket closed by peer");
                    return Outcome::Dropped;
                }
                Step::Frame(Some(Err(err))) => self.callbacks.error(err),
                Step::Frame(Some(Ok(text))) => match parse_inbound(&text) {
                    Inbound::Chunk(content) => (self.callbacks.on_message)(content),
                    Inbound::Done => {
                        self.state.send_replace(SessionState::Closing);
                        if let Err(err) = conn.close().await {
                            debug!("Error while closing WebSocket: {err}");
                        }
                        return Outcome::Finished;
                    }
                    Inbound::Ignored => debug!(frame = %text, "Ignoring WebSocket frame"),
                },
            }
        }
    }
}
