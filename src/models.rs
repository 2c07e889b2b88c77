use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// One piece of a mixed text/image message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WirePart", into = "WirePart")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageRef { url: url.into() }
    }
}

// Wire shape: `{"type":"text","text":..}` or `{"type":"image_url","image_url":..}`
// where `image_url` is either a bare string or `{"url":..}`.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireImageUrl {
    Object { url: String },
    Bare(String),
}

impl From<WirePart> for ContentPart {
    fn from(part: WirePart) -> Self {
        match part {
            WirePart::Text { text } => ContentPart::Text { text },
            WirePart::ImageUrl { image_url: WireImageUrl::Object { url } }
            | WirePart::ImageUrl { image_url: WireImageUrl::Bare(url) } => {
                ContentPart::ImageRef { url }
            }
        }
    }
}

impl From<ContentPart> for WirePart {
    fn from(part: ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => WirePart::Text { text },
            ContentPart::ImageRef { url } => WirePart::ImageUrl {
                image_url: WireImageUrl::Object { url },
            },
        }
    }
}

/// Message body: plain text, or an ordered list of parts when images are mixed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// All text in the message, parts joined in order.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageRef { .. } => None,
                })
                .collect(),
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageRef { url } => Some(url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Decoded semantic event of one streamed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    UserMessageAssigned { id: i64 },
    Chunk { text: String },
    Completed { assistant_message_id: Option<i64> },
}

/// A single send call. Built per call and not retained by the HTTP client.
///
/// `credential` is the plaintext model API key for the HTTP transport and the
/// encrypted key for the WebSocket transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub conversation_id: i64,
    pub messages: Vec<Message>,
    pub base_url: String,
    pub model_name: Option<String>,
    pub credential: Option<String>,
    pub params: Option<Value>,
}

impl SendRequest {
    pub fn new(conversation_id: i64, messages: Vec<Message>, base_url: impl Into<String>) -> Self {
        Self {
            conversation_id,
            messages,
            base_url: base_url.into(),
            model_name: None,
            credential: None,
            params: None,
        }
    }

    pub fn http_body(&self) -> SendMessageBody<'_> {
        SendMessageBody {
            conversation_id: self.conversation_id,
            messages: &self.messages,
            base_url: &self.base_url,
            model_name: self.model_name.as_deref(),
            api_key: self.credential.as_deref(),
            params: self.params.as_ref(),
        }
    }

    pub fn ws_request(&self) -> WsChatRequest {
        WsChatRequest {
            kind: WS_REQUEST_TYPE.to_string(),
            messages: self.messages.clone(),
            base_url: self.base_url.clone(),
            model_name: self.model_name.clone(),
            encrypted_api_key: self.credential.clone(),
            params: self.params.clone(),
        }
    }
}

/// Body of `POST /api/v1/chat/send`.
#[derive(Debug, Serialize)]
pub struct SendMessageBody<'a> {
    pub conversation_id: i64,
    pub messages: &'a [Message],
    pub base_url: &'a str,
    pub model_name: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub params: Option<&'a Value>,
}

const WS_REQUEST_TYPE: &str = "chat";

/// First frame sent after a WebSocket opens. Replayed verbatim on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsChatRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub messages: Vec<Message>,
    pub base_url: String,
    pub model_name: Option<String>,
    pub encrypted_api_key: Option<String>,
    pub params: Option<Value>,
}

/// Body of `POST /api/v1/user/refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadUrlRequest<'a> {
    pub conversation_id: i64,
    pub suffixes: &'a [String],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadUrlResponse {
    pub urls: Vec<String>,
}
