use thiserror::Error;

/// Why a request could not be authenticated after the refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("token refresh failed")]
    RefreshFailed,
}

/// Top-level transport error.
/// Request and connection level variants reach the caller exactly once via its
/// error callback; record level variants are only ever logged.
#[derive(Debug, Error)]
pub enum ChatError {
    // ── Request / connection errors ──────────────────────────────────────────
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Server returned HTTP {status}")]
    Status { status: u16 },

    #[error("Authentication failed: {0}")]
    Auth(AuthFailure),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ── Record errors ────────────────────────────────────────────────────────
    #[error("Failed to decode record: {message}")]
    Decode { message: String },

    #[error("Unexpected record shape: {message}")]
    Protocol { message: String },

    // ── Local errors ─────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl ChatError {
    pub fn websocket(message: impl std::fmt::Display) -> Self {
        ChatError::WebSocket(message.to_string())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }

    /// Record level errors are skipped by the decoder and never surface.
    pub fn is_record_level(&self) -> bool {
        matches!(self, ChatError::Decode { .. } | ChatError::Protocol { .. })
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Network(err)
    }
}

impl From<AuthFailure> for ChatError {
    fn from(failure: AuthFailure) -> Self {
        ChatError::Auth(failure)
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
