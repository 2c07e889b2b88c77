use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::errors::{ChatError, Result};

/// One live socket, reduced to what a chat session needs.
#[async_trait]
pub trait WsConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound text payload. `None` once the socket is closed; after an
    /// `Err` the connection is expected to report `None` next.
    async fn next_message(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens sockets for a session; the session owns reconnect policy.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &Url, access_token: Option<String>) -> Result<Box<dyn WsConnection>>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url, access_token: Option<String>) -> Result<Box<dyn WsConnection>> {
        let mut request = url.as_str().into_client_request().map_err(ChatError::websocket)?;
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(ChatError::websocket)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request).await.map_err(ChatError::websocket)?;
        debug!(status = %response.status(), "WebSocket handshake completed");
        Ok(Box::new(TungsteniteConnection { stream, ended: false }))
    }
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ended: bool,
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(ChatError::websocket)
    }

    async fn next_message(&mut self) -> Option<Result<String>> {
        if self.ended {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed the WebSocket");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(err)) => {
                    self.ended = true;
                    return Some(Err(ChatError::websocket(err)));
                }
                None => {
                    self.ended = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.stream.close(None).await.map_err(ChatError::websocket)
    }
}
