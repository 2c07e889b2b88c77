use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthStore, TokenGuard};
use crate::config::ClientConfig;
use crate::errors::{ChatError, Result};
use crate::http::{ChatApi, HttpChatClient, ImageUpload, StreamCallbacks};
use crate::models::{ContentPart, Message, MessageContent, MessageRole, SendRequest};
use crate::ws::{SessionEnd, WsCallbacks, WsChatClient};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub streaming_text: Option<String>,
    pub is_streaming: bool,
    pub error: Option<String>,
}

/// Transcript and in-progress reply of one conversation, shared between the
/// caller and transport callbacks.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    inner: Arc<Mutex<ChatSnapshot>>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChatSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.lock().clone()
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        self.lock().messages = messages;
    }

    pub fn push_message(&self, message: Message) {
        self.lock().messages.push(message);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Starts an empty assistant reply and clears any previous error.
    pub fn begin_assistant(&self) {
        let mut state = self.lock();
        state.streaming_text = Some(String::new());
        state.is_streaming = true;
        state.error = None;
    }

    pub fn append_chunk(&self, chunk: &str) {
        if let Some(text) = self.lock().streaming_text.as_mut() {
            text.push_str(chunk);
        }
    }

    /// Backend id for the most recent user message.
    pub fn set_user_message_id(&self, id: i64) {
        let mut state = self.lock();
        if let Some(msg) = state.messages.iter_mut().rev().find(|m| m.role == MessageRole::User) {
            msg.id = Some(id);
        }
    }

    /// Moves the streamed text into the transcript as an assistant message.
    pub fn finish_assistant(&self, id: Option<i64>) -> Option<Message> {
        let mut state = self.lock();
        state.is_streaming = false;
        let text = state.streaming_text.take()?;
        let mut message = Message::assistant(text);
        message.id = id;
        state.messages.push(message.clone());
        Some(message)
    }

    /// Drops the in-progress reply, e.g. after a cancelled send.
    pub fn abandon_assistant(&self) {
        let mut state = self.lock();
        state.streaming_text = None;
        state.is_streaming = false;
    }

    /// Ends the reply without keeping partial text and raises the error flag.
    pub fn fail(&self, err: &ChatError) {
        let mut state = self.lock();
        state.streaming_text = None;
        state.is_streaming = false;
        state.error = Some(err.to_string());
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.lock().error = Some(message.into());
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    WebSocket,
}

impl FromStr for Transport {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Transport::Http),
            "ws" | "websocket" => Ok(Transport::WebSocket),
            other => Err(format!("Unknown transport: {other}")),
        }
    }
}

/// Model endpoint settings forwarded with every send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSettings {
    pub base_url: String,
    pub model_name: Option<String>,
    pub credential: Option<String>,
    pub params: Option<Value>,
}

/// Drives one conversation: history, uploads, and streaming over either transport.
pub struct ChatController {
    conversation_id: i64,
    state: ChatState,
    http: HttpChatClient,
    ws: WsChatClient,
    api: ChatApi,
}

impl ChatController {
    pub fn new(conversation_id: i64, config: ClientConfig, store: Arc<dyn AuthStore>) -> Result<Self> {
        let http_client = config.http_client()?;
        let guard = TokenGuard::new(http_client.clone(), &config, Arc::clone(&store))?;
        Ok(Self {
            conversation_id,
            state: ChatState::new(),
            http: HttpChatClient::with_guard(http_client.clone(), guard.clone(), &config)?,
            ws: WsChatClient::new(config.clone(), store),
            api: ChatApi::new(http_client, guard, config),
        })
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub async fn load_history(&self) -> Result<()> {
        match self.api.fetch_messages(self.conversation_id).await {
            Ok(messages) => {
                self.state.set_messages(messages);
                Ok(())
            }
            Err(err) => {
                error!("Failed to fetch messages: {err}");
                self.state.set_error(err.to_string());
                Err(err)
            }
        }
    }

    /// Appends a user turn, streams the reply and returns the finished
    /// assistant message. `Ok(None)` means the send was cancelled.
    pub async fn send_message(
        &self,
        text: String,
        images: Vec<ImageUpload>,
        settings: &ModelSettings,
        transport: Transport,
        cancel: CancellationToken,
        on_chunk: impl FnMut(&str) + Send + 'static,
    ) -> Result<Option<Message>> {
        let image_parts = match self.api.upload_images(self.conversation_id, images).await {
            Ok(parts) => parts,
            Err(err) => {
                self.state.fail(&err);
                return Err(err);
            }
        };
        let content = if image_parts.is_empty() {
            MessageContent::Text(text)
        } else {
            let mut parts = vec![ContentPart::text(text)];
            parts.extend(image_parts);
            MessageContent::Parts(parts)
        };
        self.state.push_message(Message::user(content));
        self.state.begin_assistant();

        let request = SendRequest {
            conversation_id: self.conversation_id,
            messages: self.state.messages(),
            base_url: settings.base_url.clone(),
            model_name: settings.model_name.clone(),
            credential: settings.credential.clone(),
            params: settings.params.clone(),
        };

        match transport {
            Transport::Http => self.stream_http(&request, cancel, on_chunk).await,
            Transport::WebSocket => self.stream_ws(&request, cancel, on_chunk).await,
        }
    }

    async fn stream_http(
        &self,
        request: &SendRequest,
        cancel: CancellationToken,
        mut on_chunk: impl FnMut(&str) + Send + 'static,
    ) -> Result<Option<Message>> {
        let (done_tx, mut done_rx) = oneshot::channel::<Result<Option<i64>>>();
        let done_err = Arc::new(Mutex::new(Some(done_tx)));
        let done_ok = Arc::clone(&done_err);

        let chunk_state = self.state.clone();
        let id_state = self.state.clone();
        let callbacks = StreamCallbacks::new(
            move |chunk| {
                chunk_state.append_chunk(&chunk);
                on_chunk(&chunk);
            },
            move |id| {
                if let Some(tx) = done_ok.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(Ok(id));
                }
            },
            move |err| {
                if let Some(tx) = done_err.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(Err(err));
                }
            },
        )
        .on_user_message_id(move |id| id_state.set_user_message_id(id));

        self.http.send(request, callbacks, cancel).await;

        match done_rx.try_recv() {
            Ok(Ok(id)) => Ok(self.state.finish_assistant(id)),
            Ok(Err(err)) => {
                self.state.fail(&err);
                Err(err)
            }
            Err(_) => {
                info!("Send cancelled, discarding partial reply");
                self.state.abandon_assistant();
                Ok(None)
            }
        }
    }

    async fn stream_ws(
        &self,
        request: &SendRequest,
        cancel: CancellationToken,
        mut on_chunk: impl FnMut(&str) + Send + 'static,
    ) -> Result<Option<Message>> {
        let chunk_state = self.state.clone();
        let error_state = self.state.clone();
        let callbacks = WsCallbacks::new(
            move |chunk| {
                chunk_state.append_chunk(&chunk);
                on_chunk(&chunk);
            },
            move |err| error_state.set_error(err.to_string()),
            || debug!("WebSocket reply closed"),
        );

        let mut session = match self.ws.connect(self.conversation_id, &request.ws_request(), callbacks) {
            Ok(session) => session,
            Err(err) => {
                self.state.fail(&err);
                return Err(err);
            }
        };

        let ended = tokio::select! {
            _ = cancel.cancelled() => None,
            end = session.wait() => Some(end),
        };
        let end = match ended {
            Some(end) => end,
            None => {
                session.abort();
                session.wait().await
            }
        };

        match end {
            SessionEnd::Done => Ok(self.state.finish_assistant(None)),
            SessionEnd::GaveUp => {
                let err = ChatError::websocket("reconnect attempts exhausted");
                self.state.fail(&err);
                Err(err)
            }
            SessionEnd::Disconnected => {
                warn!("WebSocket session aborted before completion");
                self.state.abandon_assistant();
                Ok(None)
            }
        }
    }
}
