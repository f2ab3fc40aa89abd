use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use assist_bridge::background::{BackgroundService, ServerTokenRefresher};
use assist_bridge::bridge::{Bridge, channel_bridge};
use assist_bridge::client::{
    RequestDescriptor, StreamAbortHandle, StreamClient, StreamDescriptor, TransportClient,
};
use assist_bridge::config::{ConfigStore, FileConfigStore, MemoryConfigStore, Settings};
use assist_bridge::error::Error;
use assist_bridge::queue::{MessageDispatcher, QueuedMessage, SendQueue};

const CHAT_PATH: &str = "/api/v1/chat/completions";

/// Streams each queued line to the chat endpoint and prints the reply.
struct ChatDispatcher {
    streams: StreamClient,
    model: Option<String>,
    history: Mutex<Vec<Value>>,
    active: Mutex<Option<StreamAbortHandle>>,
}

impl ChatDispatcher {
    /// Request body for the committed history plus `message`. History is only
    /// extended once the reply has streamed, so a retried send adds nothing.
    fn request_body(&self, message: &QueuedMessage) -> Value {
        let mut messages = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        messages.push(json!({ "role": "user", "content": message.text }));
        let mut body = json!({ "messages": messages, "stream": true });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        body
    }
}

#[async_trait]
impl MessageDispatcher for ChatDispatcher {
    async fn send_message(&self, message: &QueuedMessage) -> Result<(), Error> {
        let body = self.request_body(message);
        let mut stream = self
            .streams
            .stream(StreamDescriptor::new(CHAT_PATH).with_body(body))?;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream.abort_handle());

        let mut reply = String::new();
        let mut outcome = Ok(());
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(raw) => {
                    let delta = serde_json::from_str::<Value>(&raw)
                        .ok()
                        .and_then(|v| v["choices"][0]["delta"]["content"].as_str().map(String::from))
                        .unwrap_or_default();
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                    reply.push_str(&delta);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        let stopped = stream.abort_handle().is_aborted();
        self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        println!("{}", if stopped { " [stopped]" } else { "" });

        if outcome.is_ok() {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push(json!({ "role": "user", "content": message.text }));
            if !reply.is_empty() {
                history.push(json!({ "role": "assistant", "content": reply }));
            }
        }
        outcome
    }

    fn stop_streaming(&self) {
        if let Some(handle) = self.active.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            handle.abort();
        }
    }
}

/// Queue a chat line. Returns the number waiting when it lands behind a reply
/// that is already in flight.
fn submit(queue: &SendQueue, text: &str) -> Option<usize> {
    let busy = queue.is_dispatching();
    queue.enqueue(text, Vec::new())?;
    busy.then(|| queue.len())
}

/// Settings source, plus the in-memory store when refreshed tokens can be
/// written back.
fn load_config() -> anyhow::Result<(Arc<dyn ConfigStore>, Option<Arc<MemoryConfigStore>>)> {
    if let Ok(path) = std::env::var("ASSIST_CONFIG") {
        let store = FileConfigStore::new(&path);
        store
            .load()
            .with_context(|| format!("failed to read settings from {path}"))?;
        let shared: Arc<dyn ConfigStore> = Arc::new(store);
        return Ok((shared, None));
    }
    let settings = Settings::from_env().context("no ASSIST_CONFIG file and no usable environment")?;
    let store = Arc::new(MemoryConfigStore::new(settings));
    let shared: Arc<dyn ConfigStore> = store.clone();
    Ok((shared, Some(store)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let (config, writable) = load_config()?;

    // ── Privileged process ───────────────────────────────────────────────
    let (bridge, endpoints) = channel_bridge(64);
    let mut service = BackgroundService::new(Arc::clone(&config));
    if let Some(store) = writable {
        service = service.with_token_refresher(Arc::new(ServerTokenRefresher::new(store)));
    }
    let service = Arc::new(service);
    let _service_handle = Arc::clone(&service).spawn(endpoints);

    tokio::spawn(async move {
        match service.check_api_drift().await {
            Ok(missing) if missing.is_empty() => info!("Server API matches the endpoint registry"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "OpenAPI drift check skipped"),
        }
    });

    // ── UI side ──────────────────────────────────────────────────────────
    let bridge: Arc<dyn Bridge> = Arc::new(bridge);
    let transport = TransportClient::new(Some(Arc::clone(&bridge)), Arc::clone(&config));
    match transport
        .send(RequestDescriptor::get("/api/v1/health").without_auth())
        .await
    {
        Ok(_) => info!("Server reachable"),
        Err(e) => warn!(error = %e.user_message(), "Health check failed"),
    }

    let dispatcher = Arc::new(ChatDispatcher {
        streams: StreamClient::new(Some(bridge)),
        model: std::env::var("ASSIST_MODEL").ok(),
        history: Mutex::new(Vec::new()),
        active: Mutex::new(None),
    });
    let queue = SendQueue::new(dispatcher.clone());

    eprintln!("Assist bridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Type a message and press Enter. /stop ends a reply, /quit exits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/stop" => dispatcher.stop_streaming(),
            text => {
                if let Some(waiting) = submit(&queue, text) {
                    eprintln!("(queued, {waiting} waiting)");
                }
            }
        }
    }

    queue.set_enabled(false);
    info!("Shutting down");
    Ok(())
}
