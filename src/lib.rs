//! Streaming transport for a chat client.
//!
//! Assistant replies arrive either as newline-delimited JSON over a chunked
//! HTTP response ([`http::HttpChatClient`]) or as frames on a WebSocket
//! ([`ws::WsChatClient`]). Both run under bearer auth with a single
//! refresh-and-retry cycle ([`auth::TokenGuard`]).

pub mod auth;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod http;
pub mod models;
pub mod state;
pub mod ws;

pub use auth::{AuthStore, InMemoryAuthStore, TokenGuard};
pub use config::ClientConfig;
pub use decoder::FrameDecoder;
pub use errors::{AuthFailure, ChatError, Result};
pub use http::{ChatApi, HttpChatClient, StreamCallbacks};
pub use models::{ContentPart, Message, MessageContent, MessageRole, SendRequest, StreamEvent};
pub use state::{ChatController, ChatState, ModelSettings, Transport};
pub use ws::{SessionEnd, SessionState, WsCallbacks, WsChatClient, WsSession};
