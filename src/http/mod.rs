pub mod api;

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::auth::{AuthStore, TokenGuard};
use crate::config::ClientConfig;
use crate::decoder::FrameDecoder;
use crate::errors::{ChatError, Result};
use crate::models::{SendRequest, StreamEvent};

pub use api::{ChatApi, ImageUpload};

pub const SEND_PATH: &str = "/api/v1/chat/send";

type ChunkFn = Box<dyn FnMut(String) + Send>;
type CompleteFn = Box<dyn FnOnce(Option<i64>) + Send>;
type ErrorFn = Box<dyn FnOnce(ChatError) + Send>;
type IdFn = Box<dyn FnMut(i64) + Send>;

/// Caller hooks for one streamed reply.
///
/// `on_chunk` fires once per assistant fragment, in order. Exactly one of
/// `on_complete` / `on_error` fires, unless the stream is cancelled, in which
/// case neither does.
pub struct StreamCallbacks {
    on_chunk: ChunkFn,
    on_complete: CompleteFn,
    on_error: ErrorFn,
    on_user_message_id: Option<IdFn>,
}

enum Flow {
    Continue,
    Done(Option<i64>),
}

impl StreamCallbacks {
    pub fn new(
        on_chunk: impl FnMut(String) + Send + 'static,
        on_complete: impl FnOnce(Option<i64>) + Send + 'static,
        on_error: impl FnOnce(ChatError) + Send + 'static,
    ) -> Self {
        Self {
            on_chunk: Box::new(on_chunk),
            on_complete: Box::new(on_complete),
            on_error: Box::new(on_error),
            on_user_message_id: None,
        }
    }

    /// Called when the backend reports the id it stored the user message under.
    pub fn on_user_message_id(mut self, f: impl FnMut(i64) + Send + 'static) -> Self {
        self.on_user_message_id = Some(Box::new(f));
        self
    }

    fn handle(&mut self, event: StreamEvent) -> Flow {
        match event {
            StreamEvent::Chunk { text } => {
                (self.on_chunk)(text);
                Flow::Continue
            }
            StreamEvent::UserMessageAssigned { id } => {
                debug!(user_message_id = id, "Backend stored user message");
                if let Some(f) = self.on_user_message_id.as_mut() {
                    f(id);
                }
                Flow::Continue
            }
            StreamEvent::Completed { assistant_message_id } => Flow::Done(assistant_message_id),
        }
    }

    fn complete(self, assistant_message_id: Option<i64>) {
        (self.on_complete)(assistant_message_id);
    }

    fn fail(self, err: ChatError) {
        error!("Chat stream failed: {err}");
        (self.on_error)(err);
    }
}

/// Streams assistant replies from `POST /api/v1/chat/send`.
#[derive(Clone)]
pub struct HttpChatClient {
    http: reqwest::Client,
    guard: TokenGuard,
    send_url: Url,
}

impl HttpChatClient {
    pub fn new(config: &ClientConfig, store: Arc<dyn AuthStore>) -> Result<Self> {
        let http = config.http_client()?;
        let guard = TokenGuard::new(http.clone(), config, store)?;
        Self::with_guard(http, guard, config)
    }

    pub fn with_guard(http: reqwest::Client, guard: TokenGuard, config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            http,
            guard,
            send_url: config.endpoint(SEND_PATH)?,
        })
    }

    /// Sends `request` and feeds the streamed reply into `callbacks` until
    /// the backend completes, the body ends, an error occurs or `cancel` fires.
    pub async fn send(&self, request: &SendRequest, callbacks: StreamCallbacks, cancel: CancellationToken) {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Send cancelled before the response arrived");
                return;
            }
            opened = self.open(request) => opened,
        };

        match opened {
            Ok(response) => read_stream(response, callbacks, cancel).await,
            Err(err) => {
                if !cancel.is_cancelled() {
                    callbacks.fail(err);
                }
            }
        }
    }

    async fn open(&self, request: &SendRequest) -> Result<Response> {
        let body = serde_json::to_vec(&request.http_body()).map_err(ChatError::Serialize)?;
        debug!(
            conversation_id = request.conversation_id,
            messages = request.messages.len(),
            "Sending chat request"
        );

        let response = self
            .guard
            .execute(|| {
                self.http
                    .post(self.send_url.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

async fn read_stream(response: Response, mut callbacks: StreamCallbacks, cancel: CancellationToken) {
    let body = response.bytes_stream();
    tokio::pin!(body);
    let mut decoder = FrameDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Chat stream cancelled");
                return;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                for event in decoder.push(&bytes) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if let Flow::Done(id) = callbacks.handle(event) {
                        debug!(assistant_message_id = ?id, "Chat stream completed");
                        callbacks.complete(id);
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                callbacks.fail(err.into());
                return;
            }
            None => break,
        }
    }

    if let Some(event) = decoder.finish() {
        if let Flow::Done(id) = callbacks.handle(event) {
            callbacks.complete(id);
            return;
        }
    }
    debug!("Chat stream ended without a complete record");
    callbacks.complete(None);
}
