//! Integration tests for the transport, upload and stream clients.
//!
//! Each test spins up an Axum server on a random port standing in for the
//! assistant server, then exercises the real HTTP contract through the
//! privileged process and through the direct fallback path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, serve};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use assist_bridge::background::{BackgroundService, ServerTokenRefresher};
use assist_bridge::bridge::{Bridge, channel_bridge};
use assist_bridge::client::{
    RequestDescriptor, StreamClient, StreamDescriptor, TransportClient, UploadClient,
    UploadDescriptor,
};
use assist_bridge::config::{ConfigStore, MemoryConfigStore, Settings};
use assist_bridge::error::{AbortedError, ConfigError, Error, HttpError};
use assist_bridge::queue::{MessageDispatcher, QueuedMessage, SendQueue};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct AppState {
    hits: Arc<AtomicUsize>,
    refreshes: Arc<AtomicUsize>,
    notes: Arc<Mutex<Vec<String>>>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Value {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or(Value::Null, |v| json!(v))
}

async fn health(State(state): State<AppState>) -> &'static str {
    state.hits.fetch_add(1, Ordering::SeqCst);
    "ok"
}

async fn chat(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if header_value(&headers, "authorization") == json!("Bearer stale") {
        return expired();
    }
    if body["fail"] == json!(true) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "model overloaded" })),
        )
            .into_response();
    }
    if body["stream"] == json!(true) {
        assert_eq!(header_value(&headers, "accept"), json!("text/event-stream"));
        let sse = concat!(
            "event: delta\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"after\":\"done\"}\n\n",
        );
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }
    Json(json!({
        "apiKey": header_value(&headers, "x-api-key"),
        "authorization": header_value(&headers, "authorization"),
        "echo": body,
    }))
    .into_response()
}

fn expired() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "token expired" })),
    )
        .into_response()
}

/// Accepts only the token handed out by [`refresh`].
async fn providers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if header_value(&headers, "authorization") != json!("Bearer fresh") {
        return expired();
    }
    Json(json!({ "providers": ["openai"] })).into_response()
}

async fn refresh(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    state.refreshes.fetch_add(1, Ordering::SeqCst);
    // Slow enough that concurrent 401s overlap with it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    if body["refresh_token"] != json!("refresh-1") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "refresh token revoked" })),
        )
            .into_response();
    }
    Json(json!({ "access_token": "fresh", "token_type": "bearer" })).into_response()
}

async fn hanging_stream(State(state): State<AppState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let first = futures::stream::once(async {
        Ok::<_, std::convert::Infallible>("data: {\"partial\":true}\n\n")
    });
    let body = Body::from_stream(first.chain(futures::stream::pending()));
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn note(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "detail": format!("Note {id} not found") })),
    )
        .into_response()
}

async fn create_note(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let content = body["content"].as_str().unwrap_or_default().to_string();
    state.notes.lock().unwrap().push(content);
    Json(json!({ "id": state.notes.lock().unwrap().len() }))
}

async fn slow_models(State(state): State<AppState>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "models": [] }))
}

async fn transcribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut fields = serde_json::Map::new();
    let mut file = Value::Null;
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.unwrap();
            file = json!({ "name": file_name, "type": content_type, "len": bytes.len() });
        } else {
            fields.insert(name, json!(field.text().await.unwrap()));
        }
    }
    Json(json!({
        "apiKey": header_value(&headers, "x-api-key"),
        "fields": fields,
        "file": file,
    }))
}

/// Start an Axum server on a random port, return (port, state).
async fn start_server() -> (u16, AppState) {
    let state = AppState::default();
    let app = Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/chat/completions", post(chat))
        .route("/api/v1/rag/search/stream", post(hanging_stream))
        .route("/api/v1/notes/", post(create_note))
        .route("/api/v1/notes/{id}", get(note))
        .route("/api/v1/llm/models", get(slow_models))
        .route("/api/v1/llm/providers", get(providers))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/audio/transcriptions", post(transcribe))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, state)
}

fn config(port: u16, extra: Value) -> Arc<MemoryConfigStore> {
    let mut raw = json!({ "serverUrl": format!("http://127.0.0.1:{port}") });
    if let (Some(raw), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
        raw.extend(extra.clone());
    }
    let settings = Settings::from_json(&raw.to_string()).unwrap();
    Arc::new(MemoryConfigStore::new(settings))
}

/// A bridge served by a running privileged process.
fn live_bridge(config: Arc<MemoryConfigStore>) -> Arc<dyn Bridge> {
    let (bridge, endpoints) = channel_bridge(8);
    Arc::new(BackgroundService::new(config)).spawn(endpoints);
    Arc::new(bridge)
}

/// A live bridge whose privileged process refreshes expired tokens.
fn refreshing_bridge(config: Arc<MemoryConfigStore>) -> Arc<dyn Bridge> {
    let (bridge, endpoints) = channel_bridge(8);
    let refresher = Arc::new(ServerTokenRefresher::new(config.clone()));
    Arc::new(BackgroundService::new(config).with_token_refresher(refresher)).spawn(endpoints);
    Arc::new(bridge)
}

/// A bridge whose privileged process is gone.
fn dead_bridge() -> Arc<dyn Bridge> {
    let (bridge, endpoints) = channel_bridge(1);
    drop(endpoints);
    Arc::new(bridge)
}

// ── Transport ────────────────────────────────────────────────────────

#[tokio::test]
async fn bridge_and_fallback_paths_agree() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));

        let descriptor = RequestDescriptor::post("/api/v1/chat/completions")
            .with_header("X-API-KEY", "spoofed")
            .with_body(json!({ "messages": [] }));

        let via_bridge = TransportClient::new(Some(live_bridge(config.clone())), config.clone())
            .send(descriptor.clone())
            .await
            .unwrap();
        let via_fallback = TransportClient::new(Some(dead_bridge()), config.clone())
            .send(descriptor.clone())
            .await
            .unwrap();
        let without_bridge = TransportClient::new(None, config)
            .send(descriptor)
            .await
            .unwrap();

        assert_eq!(via_bridge["apiKey"], "test-key");
        assert_eq!(via_bridge["echo"], json!({ "messages": [] }));
        assert_eq!(via_bridge, via_fallback);
        assert_eq!(via_bridge, without_bridge);
        assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn multi_user_sends_bearer_token() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(
            port,
            json!({ "authMode": "multi-user", "accessToken": "tok-123", "apiKey": "unused" }),
        );

        let data = TransportClient::new(Some(dead_bridge()), config)
            .send(RequestDescriptor::post("/api/v1/chat/completions").with_body(json!({})))
            .await
            .unwrap();

        assert_eq!(data["authorization"], "Bearer tok-123");
        assert_eq!(data["apiKey"], Value::Null);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn error_detail_surfaces_on_both_paths() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));

        for bridge in [live_bridge(config.clone()), dead_bridge()] {
            let err = TransportClient::new(Some(bridge), config.clone())
                .send(RequestDescriptor::get("/api/v1/notes/42"))
                .await
                .unwrap_err();
            assert_eq!(err.status(), Some(404));
            assert!(err.to_string().contains("Note 42 not found"), "{err}");
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn text_response_without_auth() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        // No credentials at all; the health check opts out of auth.
        let config = config(port, json!({}));

        let data = TransportClient::new(Some(live_bridge(config.clone())), config)
            .send(RequestDescriptor::get("/api/v1/health").without_auth())
            .await
            .unwrap();
        assert_eq!(data, json!("ok"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_key_fails_before_any_network_call() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = config(port, json!({}));

        let direct = TransportClient::new(None, config.clone())
            .send(RequestDescriptor::get("/api/v1/llm/models"))
            .await
            .unwrap_err();
        assert!(matches!(direct, Error::Config(ConfigError::MissingApiKey)));
        assert!(direct.user_message().starts_with("Add or update your API key"));

        let bridged = TransportClient::new(Some(live_bridge(config.clone())), config)
            .send(RequestDescriptor::get("/api/v1/llm/models"))
            .await
            .unwrap_err();
        assert_eq!(bridged.status(), Some(401));
        assert!(bridged.to_string().contains("Add or update your API key"));

        assert_eq!(state.hits.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abort_signal_cancels_in_flight_request() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));
        let client = TransportClient::new(Some(live_bridge(config.clone())), config);

        let signal = CancellationToken::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = client
            .send(RequestDescriptor::get("/api/v1/llm/models").with_abort_signal(signal))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(AbortedError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abort_signal_cancels_direct_http_call() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));
        let client = TransportClient::new(None, config);

        let signal = CancellationToken::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = client
            .send(RequestDescriptor::get("/api/v1/llm/models").with_abort_signal(signal))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(AbortedError::Cancelled)));
        // The handler sleeps for two seconds; the call must not wait for it.
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn configured_timeout_applies_on_both_paths() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key", "requestTimeoutMs": 100 }));

        let direct = TransportClient::new(None, config.clone())
            .send(RequestDescriptor::get("/api/v1/llm/models"))
            .await
            .unwrap_err();
        assert!(matches!(direct, Error::Aborted(AbortedError::TimedOut { .. })));

        // The privileged process reports its own timeout as a failed envelope.
        let bridged = TransportClient::new(Some(live_bridge(config.clone())), config)
            .send(RequestDescriptor::get("/api/v1/llm/models"))
            .await
            .unwrap_err();
        assert_eq!(bridged.status(), Some(0));
        assert!(bridged.to_string().contains("timed out"), "{bridged}");
    })
    .await
    .expect("test timed out");
}

// ── Token refresh ────────────────────────────────────────────────────

fn expired_session(port: u16, refresh_token: &str) -> Arc<MemoryConfigStore> {
    config(
        port,
        json!({
            "authMode": "multi-user",
            "accessToken": "stale",
            "refreshToken": refresh_token,
        }),
    )
}

#[tokio::test]
async fn concurrent_401s_share_one_token_refresh() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = expired_session(port, "refresh-1");
        let client = TransportClient::new(Some(refreshing_bridge(config.clone())), config.clone());

        let results = futures::future::join_all(
            (0..3).map(|_| client.send(RequestDescriptor::get("/api/v1/llm/providers"))),
        )
        .await;

        for result in results {
            assert_eq!(result.unwrap(), json!({ "providers": ["openai"] }));
        }
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
        // Three rejected calls, three retries.
        assert_eq!(state.hits.load(Ordering::SeqCst), 6);

        let stored = config.load().unwrap().auth.access_token.unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&stored), "fresh");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_reopens_after_token_refresh() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = expired_session(port, "refresh-1");

        let chunks: Vec<_> = StreamClient::new(Some(refreshing_bridge(config)))
            .stream(
                StreamDescriptor::new("/api/v1/chat/completions")
                    .with_body(json!({ "stream": true })),
            )
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(Result::is_ok));
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_refresh_returns_original_401() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = expired_session(port, "revoked");

        let err = TransportClient::new(Some(refreshing_bridge(config.clone())), config)
            .send(RequestDescriptor::get("/api/v1/llm/providers"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert!(err.to_string().contains("token expired"), "{err}");
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn single_user_401_is_not_refreshed() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key", "refreshToken": "refresh-1" }));

        let err = TransportClient::new(Some(refreshing_bridge(config.clone())), config)
            .send(RequestDescriptor::get("/api/v1/llm/providers"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

// ── Upload ───────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_builds_multipart_form() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));

        let data = UploadClient::new(Some(live_bridge(config)))
            .upload(
                UploadDescriptor::new("/api/v1/audio/transcriptions")
                    .with_field("model", "whisper-1")
                    .with_field("options", json!({ "lang": "en" }))
                    .with_file("clip.wav", "audio/wav", vec![7u8; 64]),
            )
            .await
            .unwrap();

        assert_eq!(data["apiKey"], "test-key");
        assert_eq!(data["fields"]["model"], "whisper-1");
        assert_eq!(data["fields"]["options"], r#"{"lang":"en"}"#);
        assert_eq!(
            data["file"],
            json!({ "name": "clip.wav", "type": "audio/wav", "len": 64 })
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn upload_without_privileged_process_is_fatal() {
    timeout(TEST_TIMEOUT, async {
        let (_port, state) = start_server().await;
        let err = UploadClient::new(Some(dead_bridge()))
            .upload(UploadDescriptor::new("/api/v1/audio/transcriptions"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Channel(e) if e.is_unavailable()));
        assert_eq!(state.hits.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

// ── Stream ───────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_yields_sse_payloads_until_done() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));

        let chunks: Vec<String> = StreamClient::new(Some(live_bridge(config)))
            .stream(
                StreamDescriptor::new("/api/v1/chat/completions")
                    .with_body(json!({ "stream": true })),
            )
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        let deltas: Vec<String> = chunks
            .iter()
            .map(|raw| {
                let v: Value = serde_json::from_str(raw).unwrap();
                v["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_upstream_error_is_one_error_item() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));

        let items: Vec<_> = StreamClient::new(Some(live_bridge(config)))
            .stream(
                StreamDescriptor::new("/api/v1/chat/completions")
                    .with_body(json!({ "stream": true, "fail": true })),
            )
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(Error::Http(HttpError::Stream(message))) => {
                assert!(message.contains("model overloaded"), "{message}")
            }
            other => panic!("expected a stream error, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_idle_timeout_fails_quiet_stream() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key", "streamIdleTimeoutMs": 150 }));

        let mut stream = StreamClient::new(Some(live_bridge(config)))
            .stream(StreamDescriptor::new("/api/v1/rag/search/stream"))
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), r#"{"partial":true}"#);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Stream timeout: no updates received"));
        assert!(stream.next().await.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_auth_failure_is_an_error_frame() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = config(port, json!({ "apiKey": "your-api-key" }));

        let text = StreamClient::new(Some(live_bridge(config)))
            .stream(StreamDescriptor::new("/api/v1/chat/completions"))
            .unwrap()
            .collect_text()
            .await;

        assert!(text.is_err());
        assert_eq!(state.hits.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

// ── Send queue over the transport ────────────────────────────────────

struct NoteDispatcher {
    transport: TransportClient,
}

#[async_trait]
impl MessageDispatcher for NoteDispatcher {
    async fn send_message(&self, message: &QueuedMessage) -> Result<(), Error> {
        self.transport
            .send(
                RequestDescriptor::post("/api/v1/notes/")
                    .with_body(json!({ "content": message.text })),
            )
            .await
            .map(|_| ())
    }

    fn stop_streaming(&self) {}
}

#[tokio::test]
async fn queued_messages_reach_server_in_order() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        let config = config(port, json!({ "apiKey": "test-key" }));
        let transport = TransportClient::new(Some(live_bridge(config.clone())), config);
        let queue = SendQueue::new(Arc::new(NoteDispatcher { transport }));

        queue.set_streaming(true);
        for text in ["first", "second", "third"] {
            queue.enqueue(text, Vec::new());
        }
        queue.set_streaming(false);

        while state.notes.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*state.notes.lock().unwrap(), vec!["first", "second", "third"]);
    })
    .await
    .expect("test timed out");
}
