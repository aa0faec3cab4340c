use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::convert::TelemetryRecord;
use crate::error::PipelineError;
use crate::sink::{Batch, Sink, SinkError};

/// What to do with a partially assembled batch once the queue is closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialBatchPolicy {
    /// Export the short batch before stopping.
    #[default]
    Flush,
    /// Drop it, logging how many records were lost.
    Discard,
}

enum Fill {
    Full(Batch),
    Closed(Batch),
    Cancelled(Batch),
}

async fn fill_batch(
    queue: &mut mpsc::Receiver<TelemetryRecord>,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Fill {
    let mut batch = Vec::with_capacity(buffer_size);
    while batch.len() < buffer_size {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Fill::Cancelled(batch),
            item = queue.recv() => match item {
                Some(record) => batch.push(record),
                None => return Fill::Closed(batch),
            },
        }
    }
    Fill::Full(batch)
}

/// Assemble batches of exactly `buffer_size` records and hand them to `sink`.
///
/// Returns the number of records the sink accepted.
pub async fn run_exporter(
    sink: Arc<dyn Sink>,
    mut queue: mpsc::Receiver<TelemetryRecord>,
    buffer_size: usize,
    policy: PartialBatchPolicy,
    errs: mpsc::UnboundedSender<PipelineError>,
    cancel: CancellationToken,
) -> u64 {
    let mut exported = 0u64;
    info!(buffer_size, ?policy, "exporter started");

    loop {
        let (batch, last) = match fill_batch(&mut queue, buffer_size, &cancel).await {
            Fill::Full(batch) => (batch, false),
            Fill::Closed(batch) if batch.is_empty() => break,
            Fill::Closed(batch) => match policy {
                PartialBatchPolicy::Flush => (batch, true),
                PartialBatchPolicy::Discard => {
                    warn!(pending = batch.len(), "queue closed, discarding partial batch");
                    break;
                }
            },
            Fill::Cancelled(batch) => {
                if !batch.is_empty() {
                    warn!(pending = batch.len(), "cancelled, dropping partial batch");
                }
                break;
            }
        };

        let count = batch.len();
        debug!(count, "exporting batch");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(pending = count, "cancelled during export, batch dropped");
                break;
            }
            result = sink.export(batch) => result,
        };

        match result {
            Ok(()) => exported += count as u64,
            Err(SinkError::Closed) => {
                debug!("sink closed");
                break;
            }
            Err(e) => {
                let _ = errs.send(e.into());
                break;
            }
        }

        if last {
            break;
        }
    }

    info!(exported, "exporter stopped");
    exported
}
