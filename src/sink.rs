//! Telemetry sinks receiving one batch per call.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::convert::TelemetryRecord;

pub type Batch = Vec<TelemetryRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink went away; the exporter stops without reporting.
    Closed,
    Failed(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Closed => write!(f, "sink closed"),
            SinkError::Failed(msg) => write!(f, "export failed: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn export(&self, batch: Batch) -> Result<(), SinkError>;
}

fn default_timeout_secs() -> u64 {
    5
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpSinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            headers: BTreeMap::new(),
            gzip: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// POSTs each batch as NDJSON, one record per line.
pub struct HttpSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SinkError::Failed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl Sink for HttpSink {
    #[tracing::instrument(
        name = "sink_export",
        skip(self, batch),
        fields(endpoint = %self.config.endpoint, record_count = batch.len())
    )]
    async fn export(&self, batch: Batch) -> Result<(), SinkError> {
        let mut body = encode_ndjson(&batch)?;
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/x-ndjson");

        if self.config.gzip {
            let raw_len = body.len();
            body = gzip(&body)?;
            debug!(raw_len, compressed_len = body.len(), "compressed batch");
            request = request.header("Content-Encoding", "gzip");
        }
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Failed("request timed out".to_string())
            } else {
                SinkError::Failed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let resp_body = response
                .text()
                .await
                .unwrap_or_else(|_| "(failed to read body)".to_string());
            error!(status, response_body = %resp_body, "collector returned error status");
            return Err(SinkError::Failed(format!(
                "HTTP {} from {}",
                status, self.config.endpoint
            )));
        }

        debug!(status, "batch exported");
        Ok(())
    }
}

fn encode_ndjson(batch: &[TelemetryRecord]) -> Result<Bytes, SinkError> {
    let mut buf = BytesMut::new();
    for (idx, record) in batch.iter().enumerate() {
        if idx > 0 {
            buf.put_slice(b"\n");
        }
        let json = serde_json::to_vec(&record.to_json())
            .map_err(|e| SinkError::Failed(format!("record {}: {}", idx, e)))?;
        buf.extend_from_slice(&json);
    }
    Ok(buf.freeze())
}

fn gzip(body: &[u8]) -> Result<Bytes, SinkError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| SinkError::Failed(format!("gzip: {}", e)))
}

/// Forwards batches to an in-process receiver.
pub struct ChannelSink {
    tx: mpsc::Sender<Batch>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Batch>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn export(&self, batch: Batch) -> Result<(), SinkError> {
        self.tx.send(batch).await.map_err(|_| SinkError::Closed)
    }
}

/// Accepts and drops every batch.
#[derive(Debug, Default)]
pub struct NullSink {
    accepted: AtomicU64,
}

impl NullSink {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for NullSink {
    async fn export(&self, batch: Batch) -> Result<(), SinkError> {
        self.accepted.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
