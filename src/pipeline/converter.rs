use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::convert::{Converter, TelemetryRecord};
use crate::error::PipelineError;
use crate::record::Record;
use crate::source::{EventSource, SourceError, SourceEvent};

/// Pull records from `source`, convert them and push them onto `queue`.
///
/// Stops on end of stream, cancellation, a closed queue, a transport error
/// or the first record that fails to convert. Lost-event notices are
/// reported and the loop keeps going. Returns the number of queued records.
pub async fn run_converter<S>(
    mut source: S,
    converter: Arc<dyn Converter>,
    queue: mpsc::Sender<TelemetryRecord>,
    errs: mpsc::UnboundedSender<PipelineError>,
    cancel: CancellationToken,
) -> u64
where
    S: EventSource,
{
    let mut converted = 0u64;

    let subscription = converter.subscription();
    if let Err(e) = source.subscribe(&subscription).await {
        if e != SourceError::Cancelled {
            let _ = errs.send(e.into());
        }
        return converted;
    }
    info!(filters = subscription.filters.len(), "converter started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("converter cancelled");
                break;
            }
            event = source.recv() => event,
        };

        let record = match event {
            Ok(SourceEvent::Record(record)) => record,
            Ok(SourceEvent::Empty) => continue,
            Ok(SourceEvent::LostEvents(0)) => continue,
            Ok(SourceEvent::LostEvents(count)) => {
                let _ = errs.send(PipelineError::LostEvents(count));
                continue;
            }
            Ok(SourceEvent::EndOfStream) | Err(SourceError::Cancelled) => {
                debug!("event stream ended");
                break;
            }
            Err(e) => {
                let _ = errs.send(e.into());
                break;
            }
        };

        if record.is_empty() {
            continue;
        }

        let out = match converter.convert(&record) {
            Ok(out) => out,
            Err(e) => {
                let _ = errs.send(e.into());
                break;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("converter cancelled while queue was full");
                break;
            }
            sent = queue.send(out) => {
                if sent.is_err() {
                    debug!("exporter queue closed");
                    break;
                }
                converted += 1;
            }
        }
    }

    info!(converted, "converter stopped");
    converted
}
