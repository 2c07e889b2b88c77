mod common;

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chat_stream::http::ImageUpload;
use chat_stream::models::ContentPart;
use chat_stream::{
    AuthFailure, AuthStore, ChatApi, ChatError, ChatController, HttpChatClient, InMemoryAuthStore,
    Message, ModelSettings, SendRequest, StreamCallbacks, TokenGuard, Transport,
};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Mock backend ──────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Backend {
    valid_token: Arc<Mutex<String>>,
    refresh_grants: Option<(String, String)>,
    body: Vec<String>,
    hang_after_body: bool,
    send_status: StatusCode,
    send_calls: Arc<AtomicUsize>,
    refresh_calls: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    uploads: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
}

impl Backend {
    fn new(valid_token: &str, body: Vec<String>) -> Self {
        Self {
            valid_token: Arc::new(Mutex::new(valid_token.to_string())),
            refresh_grants: None,
            body,
            hang_after_body: false,
            send_status: StatusCode::OK,
            send_calls: Arc::default(),
            refresh_calls: Arc::default(),
            received: Arc::default(),
            uploads: Arc::default(),
        }
    }

    fn refreshing_to(mut self, access: &str, refresh: &str) -> Self {
        self.refresh_grants = Some((access.to_string(), refresh.to_string()));
        self
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }

    fn router(self) -> Router {
        Router::new()
            .route("/api/v1/chat/send", post(send_handler))
            .route("/api/v1/user/refresh", post(refresh_handler))
            .route("/api/v1/chat/get_upload_presigned_url", post(upload_url_handler))
            .route("/api/v1/chat/{id}", get(history_handler))
            .route("/upload/{name}", put(upload_handler))
            .with_state(self)
    }
}

async fn send_handler(State(backend): State<Backend>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    backend.send_calls.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    backend.received.lock().unwrap().push(body);
    if backend.send_status != StatusCode::OK {
        return backend.send_status.into_response();
    }

    let pieces = stream::iter(backend.body.clone()).then(|piece| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, Infallible>(Bytes::from(piece))
    });
    let body = if backend.hang_after_body {
        Body::from_stream(pieces.chain(stream::pending()))
    } else {
        Body::from_stream(pieces)
    };
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn refresh_handler(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    match &backend.refresh_grants {
        Some((access, refresh)) if cookie == "refresh_token=R1" => {
            Json(json!({"access_token": access, "refresh_token": refresh})).into_response()
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn history_handler(State(backend): State<Backend>, headers: HeaderMap, Path(id): Path<i64>) -> Response {
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"messages": [
        {"message_id": 1, "role": "user", "content": format!("hello #{id}"), "timestamp": "2024-05-01T10:00:00"},
        {"message_id": 2, "role": "assistant", "content": [{"type": "text", "text": "hi there"}]}
    ]}))
    .into_response()
}

async fn upload_url_handler(State(backend): State<Backend>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
    let urls: Vec<String> = body["suffixes"]
        .as_array()
        .unwrap()
        .iter()
        .enumerate()
        .map(|(i, s)| format!("http://{host}/upload/img{i}.{}", s.as_str().unwrap()))
        .collect();
    Json(json!({ "urls": urls })).into_response()
}

async fn upload_handler(State(backend): State<Backend>, Path(name): Path<String>, headers: HeaderMap, bytes: Bytes) -> StatusCode {
    if headers.contains_key(header::AUTHORIZATION) {
        return StatusCode::BAD_REQUEST;
    }
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    backend.uploads.lock().unwrap().push((name, content_type.to_string(), bytes.to_vec()));
    StatusCode::OK
}

// ── Callback recording ────────────────────────────────────────────────────────

#[derive(Default)]
struct Seen {
    chunks: Vec<String>,
    completed: Option<Option<i64>>,
    errors: Vec<ChatError>,
    user_ids: Vec<i64>,
}

fn recording(chunk_signal: Option<mpsc::UnboundedSender<()>>) -> (Arc<Mutex<Seen>>, StreamCallbacks) {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let (s1, s2, s3, s4) = (seen.clone(), seen.clone(), seen.clone(), seen.clone());
    let callbacks = StreamCallbacks::new(
        move |chunk| {
            s1.lock().unwrap().chunks.push(chunk);
            if let Some(tx) = &chunk_signal {
                let _ = tx.send(());
            }
        },
        move |id| s2.lock().unwrap().completed = Some(id),
        move |err| s3.lock().unwrap().errors.push(err),
    )
    .on_user_message_id(move |id| s4.lock().unwrap().user_ids.push(id));
    (seen, callbacks)
}

fn request() -> SendRequest {
    let mut request = SendRequest::new(7, vec![Message::user("hi")], "https://llm.example/v1");
    request.model_name = Some("gpt-test".into());
    request.credential = Some("sk-plain".into());
    request
}

async fn run(base: &str, store: Arc<InMemoryAuthStore>, callbacks: StreamCallbacks) {
    let client = HttpChatClient::new(&common::config(base), store).unwrap();
    client.send(&request(), callbacks, CancellationToken::new()).await;
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fragmented_records_stream_in_order() {
    let backend = Backend::new(
        "A1",
        vec![
            "{\"type\":\"user_message_id\",\"user_message_id\":11}\n{\"type\":\"ai_ch".into(),
            "unk\",\"content\":\"Hel\"}\n{\"type\":\"ai_chunk\",\"con".into(),
            "tent\":\"lo ✓\"}\n{\"type\":\"complete\",\"ai_message_id\":12}\n".into(),
            "{\"type\":\"ai_chunk\",\"content\":\"after complete\"}\n".into(),
        ],
    );
    let received = backend.received.clone();
    let base = common::serve(backend.router()).await;
    let (seen, callbacks) = recording(None);

    run(&base, Arc::new(InMemoryAuthStore::with_tokens("A1", "R1")), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.chunks, vec!["Hel".to_string(), "lo ✓".to_string()]);
    assert_eq!(seen.completed, Some(Some(12)));
    assert_eq!(seen.user_ids, vec![11]);
    assert!(seen.errors.is_empty());

    let body = received.lock().unwrap()[0].clone();
    assert_eq!(body["conversation_id"], json!(7));
    assert_eq!(body["api_key"], json!("sk-plain"));
    assert_eq!(body["model_name"], json!("gpt-test"));
    assert_eq!(body["messages"][0]["role"], json!("user"));
}

#[tokio::test]
async fn body_end_without_complete_counts_as_completion() {
    let body = common::ndjson(&[
        r#"{"type":"ai_chunk","content":"one"}"#,
        "not json at all",
        r#"{"type":"ai_chunk","content":"two"}"#,
    ]);
    let base = common::serve(Backend::new("A1", vec![body]).router()).await;
    let (seen, callbacks) = recording(None);

    run(&base, Arc::new(InMemoryAuthStore::with_tokens("A1", "R1")), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.chunks, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(seen.completed, Some(None));
    assert!(seen.errors.is_empty());
}

#[tokio::test]
async fn server_error_is_reported_once() {
    let mut backend = Backend::new("A1", vec![]);
    backend.send_status = StatusCode::INTERNAL_SERVER_ERROR;
    let base = common::serve(backend.router()).await;
    let (seen, callbacks) = recording(None);

    run(&base, Arc::new(InMemoryAuthStore::with_tokens("A1", "R1")), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.errors.len(), 1);
    assert!(matches!(seen.errors[0], ChatError::Status { status: 500 }));
    assert_eq!(seen.completed, None);
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let base = common::dead_base_url().await;
    let (seen, callbacks) = recording(None);

    run(&base, Arc::new(InMemoryAuthStore::with_tokens("A1", "R1")), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.errors.len(), 1);
    assert!(matches!(seen.errors[0], ChatError::Network(_)));
    assert_eq!(seen.completed, None);
}

#[tokio::test]
async fn cancellation_stops_an_in_flight_read() {
    let mut backend = Backend::new("A1", vec![common::ndjson(&[r#"{"type":"ai_chunk","content":"first"}"#])]);
    backend.hang_after_body = true;
    let base = common::serve(backend.router()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (seen, callbacks) = recording(Some(tx));
    let client = HttpChatClient::new(&common::config(&base), Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"))).unwrap();
    let cancel = CancellationToken::new();

    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { client.send(&request(), callbacks, cancel).await })
    };
    rx.recv().await.unwrap();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.chunks, vec!["first".to_string()]);
    assert_eq!(seen.completed, None);
    assert!(seen.errors.is_empty());
}

// ── Auth refresh ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_token_is_refreshed_and_request_retried() {
    let backend = Backend::new("A2", vec![common::ndjson(&[
        r#"{"type":"ai_chunk","content":"ok"}"#,
        r#"{"type":"complete"}"#,
    ])])
    .refreshing_to("A2", "R2");
    let (send_calls, refresh_calls) = (backend.send_calls.clone(), backend.refresh_calls.clone());
    let base = common::serve(backend.router()).await;
    let store = Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"));
    let (seen, callbacks) = recording(None);

    run(&base, store.clone(), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.chunks, vec!["ok".to_string()]);
    assert_eq!(seen.completed, Some(None));
    assert!(seen.errors.is_empty());
    assert_eq!(store.access_token().as_deref(), Some("A2"));
    assert_eq!(store.refresh_token().as_deref(), Some("R2"));
    assert_eq!(send_calls.load(Ordering::SeqCst), 2);
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_refresh_token_logs_out() {
    let backend = Backend::new("A2", vec![]).refreshing_to("A2", "R2");
    let refresh_calls = backend.refresh_calls.clone();
    let base = common::serve(backend.router()).await;
    let store = Arc::new(InMemoryAuthStore::with_tokens("A1", ""));
    let (seen, callbacks) = recording(None);

    run(&base, store.clone(), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.errors.len(), 1);
    assert!(matches!(seen.errors[0], ChatError::Auth(AuthFailure::NoRefreshToken)));
    assert_eq!(seen.completed, None);
    assert!(!store.is_logged_in());
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_refresh_logs_out() {
    let backend = Backend::new("A2", vec![]);
    let send_calls = backend.send_calls.clone();
    let base = common::serve(backend.router()).await;
    let store = Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"));
    let (seen, callbacks) = recording(None);

    run(&base, store.clone(), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.errors.len(), 1);
    assert!(matches!(seen.errors[0], ChatError::Auth(AuthFailure::RefreshFailed)));
    assert!(!store.is_logged_in());
    assert_eq!(send_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_rejection_is_terminal() {
    // refresh succeeds but the new token is still not accepted
    let backend = Backend::new("A3", vec![]).refreshing_to("A2", "R2");
    let (send_calls, refresh_calls) = (backend.send_calls.clone(), backend.refresh_calls.clone());
    let base = common::serve(backend.router()).await;
    let store = Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"));
    let (seen, callbacks) = recording(None);

    run(&base, store.clone(), callbacks).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.errors.len(), 1);
    assert!(seen.errors[0].is_auth());
    assert!(!store.is_logged_in());
    assert_eq!(send_calls.load(Ordering::SeqCst), 2);
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
}

// ── History & upload ──────────────────────────────────────────────────────────

fn api(base: &str, store: Arc<InMemoryAuthStore>) -> ChatApi {
    let config = common::config(base);
    let http = config.http_client().unwrap();
    let guard = TokenGuard::new(http.clone(), &config, store).unwrap();
    ChatApi::new(http, guard, config)
}

#[tokio::test]
async fn history_is_fetched_under_refresh() {
    let base = common::serve(Backend::new("A2", vec![]).refreshing_to("A2", "R2").router()).await;
    let store = Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"));

    let messages = api(&base, store.clone()).fetch_messages(5).await.unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content.text(), "hello #5");
    assert_eq!(messages[1].id, Some(2));
    assert_eq!(messages[1].content.text(), "hi there");
    assert_eq!(store.access_token().as_deref(), Some("A2"));
}

#[tokio::test]
async fn images_upload_through_presigned_urls() {
    let backend = Backend::new("A1", vec![]);
    let uploads = backend.uploads.clone();
    let base = common::serve(backend.router()).await;

    let images = vec![
        ImageUpload { suffix: "png".into(), content_type: "image/png".into(), bytes: vec![1, 2, 3] },
        ImageUpload { suffix: "jpg".into(), content_type: "image/jpeg".into(), bytes: vec![4] },
    ];
    let parts = api(&base, Arc::new(InMemoryAuthStore::with_tokens("A1", "R1")))
        .upload_images(5, images)
        .await
        .unwrap();

    assert_eq!(parts.len(), 2);
    assert!(matches!(&parts[0], ContentPart::ImageRef { url } if url.ends_with("/upload/img0.png")));
    let uploads = uploads.lock().unwrap();
    assert_eq!(uploads[0], ("img0.png".to_string(), "image/png".to_string(), vec![1, 2, 3]));
    assert_eq!(uploads[1], ("img1.jpg".to_string(), "image/jpeg".to_string(), vec![4]));
}

// ── Controller ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn controller_appends_user_and_assistant_messages() {
    let backend = Backend::new("A1", vec![common::ndjson(&[
        r#"{"type":"user_message_id","user_message_id":30}"#,
        r#"{"type":"ai_chunk","content":"Sure"}"#,
        r#"{"type":"ai_chunk","content":", done."}"#,
        r#"{"type":"complete","ai_message_id":31}"#,
    ])]);
    let received = backend.received.clone();
    let base = common::serve(backend.router()).await;
    let store = Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"));
    let controller = ChatController::new(5, common::config(&base), store).unwrap();

    controller.load_history().await.unwrap();
    let streamed = Arc::new(Mutex::new(String::new()));
    let sink = streamed.clone();
    let settings = ModelSettings { base_url: "https://llm.example/v1".into(), ..ModelSettings::default() };
    let reply = controller
        .send_message("and now?".into(), vec![], &settings, Transport::Http, CancellationToken::new(), move |c| {
            sink.lock().unwrap().push_str(c)
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.id, Some(31));
    assert_eq!(*streamed.lock().unwrap(), "Sure, done.");

    let snapshot = controller.state().snapshot();
    assert_eq!(snapshot.messages.len(), 4);
    assert_eq!(snapshot.messages[2].id, Some(30));
    assert_eq!(snapshot.messages[3].content.text(), "Sure, done.");
    assert!(!snapshot.is_streaming);
    assert_eq!(snapshot.error, None);

    // whole transcript, history included, is sent with the new turn
    let body = received.lock().unwrap()[0].clone();
    assert_eq!(body["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn controller_flags_error_on_failed_send() {
    let mut backend = Backend::new("A1", vec![]);
    backend.send_status = StatusCode::BAD_GATEWAY;
    let base = common::serve(backend.router()).await;
    let controller = ChatController::new(5, common::config(&base), Arc::new(InMemoryAuthStore::with_tokens("A1", "R1"))).unwrap();

    let settings = ModelSettings { base_url: "https://llm.example/v1".into(), ..ModelSettings::default() };
    let err = controller
        .send_message("hi".into(), vec![], &settings, Transport::Http, CancellationToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Status { status: 502 }));
    let snapshot = controller.state().snapshot();
    assert_eq!(snapshot.error.as_deref(), Some("Server returned HTTP 502"));
    assert!(!snapshot.is_streaming);
}
