#![allow(dead_code)]

use axum::Router;
use chat_stream::ClientConfig;

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Base URL of a local port with nothing listening on it.
pub async fn dead_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub fn config(base: &str) -> ClientConfig {
    ClientConfig::new(base).unwrap()
}

pub fn ndjson(records: &[&str]) -> String {
    records.iter().map(|r| format!("{r}\n")).collect()
}
