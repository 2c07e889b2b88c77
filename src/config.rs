use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::errors::{ChatError, Result};

const DEFAULT_API_BASE: &str = "http://localhost:8000";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RECONNECTS: u32 = 3;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Endpoints and transport tuning shared by every client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base: Url,
    pub ws_base: Url,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl ClientConfig {
    /// Config with defaults for everything but the API base. The WebSocket
    /// base is derived from it (`http` → `ws`, `https` → `wss`).
    pub fn new(api_base: &str) -> Result<Self> {
        let api_base = parse_url("api base", api_base)?;
        let ws_base = derive_ws_base(&api_base)?;
        Ok(Self {
            api_base,
            ws_base,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        })
    }

    /// Reads `CHAT_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_base = lookup("CHAT_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let mut config = Self::new(&api_base)?;

        if let Some(ws_base) = lookup("CHAT_WS_BASE_URL") {
            config.ws_base = parse_url("CHAT_WS_BASE_URL", &ws_base)?;
        }
        config.connect_timeout = Duration::from_secs(parse_var(
            &lookup,
            "CHAT_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?);
        config.max_reconnect_attempts =
            parse_var(&lookup, "CHAT_WS_MAX_RECONNECTS", DEFAULT_MAX_RECONNECTS)?;
        config.reconnect_base_delay = Duration::from_millis(parse_var(
            &lookup,
            "CHAT_WS_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        )?);
        Ok(config)
    }

    /// Resolves an API path against the base, keeping any base path prefix.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        join(&self.api_base, path)
    }

    pub fn ws_endpoint(&self, path: &str) -> Result<Url> {
        join(&self.ws_base, path)
    }

    /// HTTP client for all REST and streaming calls. Only the connect phase
    /// has a timeout; streamed bodies may stay open as long as the model runs.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build HTTP client: {e}")))
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| ChatError::Config(format!("{name} '{raw}' is not a valid URL: {e}")))
}

fn derive_ws_base(api_base: &Url) -> Result<Url> {
    let scheme = match api_base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ChatError::Config(format!(
                "cannot derive a WebSocket URL from scheme '{other}'"
            )))
        }
    };
    let mut ws_base = api_base.clone();
    ws_base
        .set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot switch '{api_base}' to {scheme}")))?;
    Ok(ws_base)
}

fn join(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| ChatError::Config(format!("invalid endpoint path '{path}': {e}")))
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ChatError::Config(format!("{name}='{raw}': {e}"))),
    }
}
