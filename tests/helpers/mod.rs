#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use flate2::read::GzDecoder;
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

/// One POST as the collector saw it.
#[derive(Clone, Debug, Default)]
pub struct ReceivedRequest {
    pub authorization: Option<String>,
    pub content_encoding: Option<String>,
    pub tenant: Option<String>,
    pub records: Vec<Value>,
}

#[derive(Clone)]
struct CollectorState {
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    status: StatusCode,
}

pub struct MockCollector {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockCollector {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }

    pub async fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().await.clone()
    }

    /// All received records in arrival order.
    pub async fn records(&self) -> Vec<Value> {
        self.requests
            .lock()
            .await
            .iter()
            .flat_map(|r| r.records.clone())
            .collect()
    }
}

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Spawn a collector answering every ingest with `status`; returns the logs endpoint URL.
pub async fn spawn_mock_collector(port: u16, status: StatusCode) -> (MockCollector, String) {
    let state = CollectorState {
        requests: Arc::new(Mutex::new(Vec::new())),
        status,
    };
    let requests = state.requests.clone();

    let app = Router::new()
        .route("/v1/logs", post(ingest))
        .route("/health", get(health))
        .with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind mock collector listener");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock collector server error: {}", err);
        }
    });

    (
        MockCollector {
            shutdown_tx,
            handle,
            requests,
        },
        format!("http://127.0.0.1:{}", port),
    )
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn ingest(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let content_encoding = header(&headers, "content-encoding");
    let text = if content_encoding.as_deref() == Some("gzip") {
        let mut out = String::new();
        GzDecoder::new(body.as_ref())
            .read_to_string(&mut out)
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        out
    } else {
        String::from_utf8_lossy(&body).to_string()
    };

    let mut records = Vec::new();
    for line in text.split('\n').filter(|l| !l.is_empty()) {
        let parsed: Value = serde_json::from_str(line).map_err(|_| StatusCode::BAD_REQUEST)?;
        records.push(parsed);
    }

    state.requests.lock().await.push(ReceivedRequest {
        authorization: header(&headers, "authorization"),
        content_encoding,
        tenant: header(&headers, "x-tenant"),
        records,
    });

    if !state.status.is_success() {
        return Err(state.status);
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
