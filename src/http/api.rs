use std::path::Path;

use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use tracing::{debug, info};

use crate::auth::TokenGuard;
use crate::config::ClientConfig;
use crate::errors::{ChatError, Result};
use crate::models::{ContentPart, Message, MessageListResponse, UploadUrlRequest, UploadUrlResponse};

pub const HISTORY_PATH: &str = "/api/v1/chat";
pub const UPLOAD_URL_PATH: &str = "/api/v1/chat/get_upload_presigned_url";

/// An image ready to be uploaded through a presigned URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub suffix: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub async fn from_path(path: &Path) -> Result<Self> {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| ChatError::Config(format!("{} has no file extension", path.display())))?;
        let content_type = content_type_for(&suffix)
            .ok_or_else(|| ChatError::Config(format!("unsupported image type '.{suffix}'")))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::Config(format!("failed to read {}: {e}", path.display())))?;
        Ok(Self { suffix, content_type, bytes })
    }
}

fn content_type_for(suffix: &str) -> Option<&'static str> {
    match suffix {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Request/response calls beside the streaming send: history and image upload.
#[derive(Clone)]
pub struct ChatApi {
    http: reqwest::Client,
    guard: TokenGuard,
    config: ClientConfig,
}

impl ChatApi {
    pub fn new(http: reqwest::Client, guard: TokenGuard, config: ClientConfig) -> Self {
        Self { http, guard, config }
    }

    /// `GET /api/v1/chat/{conversation_id}`
    pub async fn fetch_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let url = self.config.endpoint(&format!("{HISTORY_PATH}/{conversation_id}"))?;
        let response = self.guard.execute(|| self.http.get(url.clone())).await?;
        let body: MessageListResponse = ensure_success(response)?.json().await?;
        debug!(conversation_id, count = body.messages.len(), "Fetched message history");
        Ok(body.messages)
    }

    /// `POST /api/v1/chat/get_upload_presigned_url`, one URL per suffix.
    pub async fn presigned_upload_urls(&self, conversation_id: i64, suffixes: &[String]) -> Result<Vec<String>> {
        let url = self.config.endpoint(UPLOAD_URL_PATH)?;
        let body = UploadUrlRequest { conversation_id, suffixes };
        let response = self
            .guard
            .execute(|| self.http.post(url.clone()).json(&body))
            .await?;
        let body: UploadUrlResponse = ensure_success(response)?.json().await?;
        if body.urls.len() != suffixes.len() {
            return Err(ChatError::Protocol {
                message: format!("asked for {} upload URLs, got {}", suffixes.len(), body.urls.len()),
            });
        }
        Ok(body.urls)
    }

    /// Direct `PUT` to a presigned URL. No bearer token: the URL carries its own signature.
    pub async fn upload_image(&self, url: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        ensure_success(response)?;
        Ok(())
    }

    /// Uploads every image and returns image parts pointing at them, in input order.
    pub async fn upload_images(&self, conversation_id: i64, images: Vec<ImageUpload>) -> Result<Vec<ContentPart>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let suffixes: Vec<String> = images.iter().map(|i| i.suffix.clone()).collect();
        let urls = self.presigned_upload_urls(conversation_id, &suffixes).await?;

        let mut parts = Vec::with_capacity(images.len());
        for (image, url) in images.into_iter().zip(urls) {
            self.upload_image(&url, image.bytes, &image.content_type).await?;
            parts.push(ContentPart::image(url));
        }
        info!(conversation_id, count = parts.len(), "Uploaded images");
        Ok(parts)
    }
}

fn ensure_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ChatError::Status {
            status: response.status().as_u16(),
        })
    }
}
