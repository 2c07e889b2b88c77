use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chat_stream::http::ImageUpload;
use chat_stream::{AuthStore, ChatController, ClientConfig, InMemoryAuthStore, ModelSettings, Transport};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Send one prompt to a conversation and stream the reply to stdout.
#[derive(Debug, Parser)]
#[command(name = "chat-stream", version)]
struct Cli {
    /// Conversation to post into.
    #[arg(long, short = 'c', env = "CHAT_CONVERSATION_ID")]
    conversation: i64,

    /// `http` (chunked streaming) or `ws` (WebSocket).
    #[arg(long, short = 't', default_value = "http")]
    transport: Transport,

    /// OpenAI compatible model endpoint the backend should call.
    #[arg(long, env = "CHAT_MODEL_BASE_URL")]
    base_url: String,

    #[arg(long, env = "CHAT_MODEL_NAME")]
    model: Option<String>,

    /// Model API key; already encrypted when using the WebSocket transport.
    #[arg(long, env = "CHAT_MODEL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Extra model parameters as a JSON object.
    #[arg(long)]
    params: Option<String>,

    #[arg(long, env = "CHAT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(long, env = "CHAT_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// Image to attach; repeat for several.
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Print the conversation history before sending.
    #[arg(long)]
    history: bool,

    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_stream=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let prompt = cli.prompt.join(" ");
    anyhow::ensure!(!prompt.trim().is_empty(), "prompt must not be empty");

    let params = cli
        .params
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--params is not valid JSON")?;

    // ── Auth & clients ────────────────────────────────────────────────────────
    let config = ClientConfig::from_env()?;
    let store = Arc::new(InMemoryAuthStore::new());
    if let Some(access) = cli.access_token.clone() {
        store.set_tokens(access, cli.refresh_token.clone().unwrap_or_default());
    }
    let controller = ChatController::new(cli.conversation, config, store.clone())?;

    // ── History ───────────────────────────────────────────────────────────────
    controller.load_history().await?;
    if cli.history {
        for message in controller.state().messages() {
            println!("[{}] {}", message.role, message.content.text());
        }
    }

    let mut images = Vec::with_capacity(cli.images.len());
    for path in &cli.images {
        images.push(ImageUpload::from_path(path).await?);
    }

    // ── Send ──────────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let settings = ModelSettings {
        base_url: cli.base_url,
        model_name: cli.model,
        credential: cli.api_key,
        params,
    };
    info!(conversation_id = cli.conversation, transport = ?cli.transport, "Sending prompt");

    let sink = chunk_sink(std::io::stdout(), cancel.clone());
    let reply = controller
        .send_message(prompt, images, &settings, cli.transport, cancel, sink)
        .await;
    println!();

    if !store.is_logged_in() {
        warn!("Session expired; log in again to continue");
    }
    match reply? {
        Some(message) => info!(assistant_message_id = ?message.id, "Reply complete"),
        None => warn!("Reply cancelled"),
    }
    Ok(())
}

/// Writes each streamed chunk to `out`. The first failed write cancels the send.
fn chunk_sink<W>(mut out: W, cancel: CancellationToken) -> impl FnMut(&str) + Send + 'static
where
    W: Write + Send + 'static,
{
    move |chunk| {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(err) = out.write_all(chunk.as_bytes()).and_then(|()| out.flush()) {
            error!("Failed to write reply: {err}");
            cancel.cancel();
        }
    }
}
