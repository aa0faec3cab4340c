//! Converter and exporter tasks joined by one bounded queue.
//!
//! ```text
//! source -> [converter] -> queue(buffer_size) -> [exporter] -> sink
//!                 \                                  /
//!                  +------> error channel <---------+
//!                               |
//!                          coordinator
//! ```
//!
//! Both tasks share one cancellation token and stop for good on their first
//! fatal error; nothing is restarted. Once the exporter is gone the
//! coordinator cancels the token, so a converter parked on an idle source
//! stops too.

mod converter;
mod exporter;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::convert::Converter;
use crate::error::{PipelineError, ValidationError};
use crate::sink::Sink;
use crate::source::EventSource;

pub use converter::run_converter;
pub use exporter::{run_exporter, PartialBatchPolicy};

/// What a finished pipeline reported.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PipelineReport {
    /// Every error received, soft notices included, in arrival order.
    pub errors: Vec<PipelineError>,
    pub converted: u64,
    pub exported: u64,
}

impl PipelineReport {
    pub fn fatal_errors(&self) -> impl Iterator<Item = &PipelineError> {
        self.errors.iter().filter(|e| e.is_fatal())
    }

    pub fn is_clean(&self) -> bool {
        self.fatal_errors().next().is_none()
    }
}

/// A validated, not yet running pipeline for one stream.
pub struct Pipeline<S> {
    source: S,
    converter: Arc<dyn Converter>,
    sink: Arc<dyn Sink>,
    buffer_size: usize,
    policy: PartialBatchPolicy,
}

impl<S> Pipeline<S>
where
    S: EventSource + 'static,
{
    pub fn new(
        source: S,
        converter: Arc<dyn Converter>,
        sink: Arc<dyn Sink>,
        buffer_size: usize,
    ) -> Result<Self, ValidationError> {
        if buffer_size == 0 {
            return Err(ValidationError::new("buffer_size must be greater than zero"));
        }
        Ok(Self {
            source,
            converter,
            sink,
            buffer_size,
            policy: PartialBatchPolicy::default(),
        })
    }

    pub fn with_partial_batch_policy(mut self, policy: PartialBatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn spawn(self) -> PipelineHandle {
        self.spawn_with_token(CancellationToken::new())
    }

    /// Spawn under a child of `parent`; cancelling `parent` stops this pipeline.
    pub fn spawn_with_token(self, parent: CancellationToken) -> PipelineHandle {
        let cancel = parent.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(self.buffer_size);
        let (errs_tx, errs_rx) = mpsc::unbounded_channel();

        let converter = tokio::spawn(run_converter(
            self.source,
            self.converter,
            queue_tx,
            errs_tx.clone(),
            cancel.clone(),
        ));
        let exporter = tokio::spawn(run_exporter(
            self.sink,
            queue_rx,
            self.buffer_size,
            self.policy,
            errs_tx,
            cancel.clone(),
        ));

        info!(buffer_size = self.buffer_size, "pipeline started");
        let coordinator = tokio::spawn(coordinate(errs_rx, converter, exporter, cancel.clone()));
        PipelineHandle {
            cancel,
            coordinator,
        }
    }
}

/// Owner of a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    coordinator: JoinHandle<PipelineReport>,
}

impl PipelineHandle {
    /// Ask both tasks to stop at their next blocking point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.coordinator.is_finished()
    }

    /// Wait for both tasks to stop and collect what they reported.
    pub async fn join(self) -> PipelineReport {
        match self.coordinator.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "pipeline coordinator failed");
                PipelineReport::default()
            }
        }
    }
}

async fn coordinate(
    mut errs: mpsc::UnboundedReceiver<PipelineError>,
    converter: JoinHandle<u64>,
    mut exporter: JoinHandle<u64>,
    cancel: CancellationToken,
) -> PipelineReport {
    let mut report = PipelineReport::default();
    let mut exported = None;

    // closes once both tasks have dropped their senders
    loop {
        tokio::select! {
            err = errs.recv() => {
                let Some(err) = err else { break };
                if err.is_fatal() {
                    error!(error = %err, "pipeline task stopped");
                } else {
                    warn!(error = %err, "pipeline notice");
                }
                report.errors.push(err);
            }
            joined = &mut exporter, if exported.is_none() => {
                exported = Some(task_count("exporter", joined));
                // nothing drains the queue any more
                cancel.cancel();
            }
        }
    }

    report.converted = task_count("converter", converter.await);
    report.exported = match exported {
        Some(count) => count,
        None => task_count("exporter", exporter.await),
    };
    info!(
        converted = report.converted,
        exported = report.exported,
        errors = report.errors.len(),
        "pipeline stopped"
    );
    report
}

fn task_count(task: &'static str, joined: Result<u64, JoinError>) -> u64 {
    match joined {
        Ok(count) => count,
        Err(e) => {
            error!(task, error = %e, "pipeline task panicked");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{LogsConverter, TelemetryRecord};
    use crate::encoder::{EncodingOptions, FlowEncoder, SchemaTags};
    use crate::filter::{IncludeTypes, TypeRegistry};
    use crate::record::JsonRecord;
    use crate::sink::{Batch, ChannelSink, SinkError};
    use crate::source::{ChannelSource, JsonLinesSource, SourceError, SourceEvent};
    use crate::value::AnyValue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn converter(include: &[&str]) -> Arc<dyn Converter> {
        Arc::new(
            LogsConverter::new(
                FlowEncoder::new(EncodingOptions::default(), SchemaTags::default()),
                &IncludeTypes::new(include.iter().copied()),
                &TypeRegistry::default(),
                "test",
            )
            .unwrap(),
        )
    }

    fn flow(n: i64) -> JsonRecord {
        JsonRecord::from_value("flow", json!({"event_type": "l7", "n": n})).unwrap()
    }

    fn n_of(record: &TelemetryRecord) -> Option<AnyValue> {
        record
            .attribute("hubble.event.object")
            .and_then(|o| o.get("n"))
            .cloned()
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn export(&self, _batch: Batch) -> Result<(), SinkError> {
            Err(SinkError::Failed("HTTP 503".into()))
        }
    }

    #[tokio::test]
    async fn exactly_buffer_size_records_make_one_ordered_batch() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, mut batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&["*"]), Arc::new(sink), 3)
            .unwrap()
            .spawn();

        for n in 0..3 {
            tx.send(Ok(SourceEvent::Record(flow(n)))).await.unwrap();
        }

        let batch = batches.recv().await.unwrap();
        let ns: Vec<_> = batch.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![AnyValue::Int(0), AnyValue::Int(1), AnyValue::Int(2)]);

        drop(tx);
        let report = handle.join().await;
        assert!(report.errors.is_empty());
        assert_eq!(report.exported, 3);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn filtered_stream_flushes_one_batch_then_waits_for_cancel() {
        let input = concat!(
            "{\"event_type\":\"l7\",\"n\":1}\n",
            "{\"event_type\":\"trace\",\"n\":2}\n",
            "{\"event_type\":\"l7\",\"n\":3}\n",
        );
        // keep the stream open after the three lines
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut server, input.as_bytes())
            .await
            .unwrap();
        let source = JsonLinesSource::new(tokio::io::BufReader::new(client), "flow", "event_type");

        let (sink, mut batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&["l7"]), Arc::new(sink), 2)
            .unwrap()
            .spawn();

        let batch = batches.recv().await.unwrap();
        let ns: Vec<_> = batch.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![AnyValue::Int(1), AnyValue::Int(3)]);

        let second = tokio::time::timeout(Duration::from_millis(100), batches.recv()).await;
        assert!(second.is_err(), "no second batch before cancellation");
        assert!(!handle.is_finished());

        handle.cancel();
        let report = handle.join().await;
        assert!(report.errors.is_empty());
        assert_eq!(report.converted, 2);
        assert_eq!(report.exported, 2);
        drop(server);
    }

    #[tokio::test]
    async fn lost_events_do_not_stop_the_stream() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, mut batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 1)
            .unwrap()
            .spawn();

        tx.send(Ok(SourceEvent::LostEvents(5))).await.unwrap();
        tx.send(Ok(SourceEvent::Empty)).await.unwrap();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();
        assert_eq!(batches.recv().await.unwrap().len(), 1);

        drop(tx);
        let report = handle.join().await;
        assert_eq!(report.errors, vec![PipelineError::LostEvents(5)]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn conversion_error_stops_the_converter() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, _batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 10)
            .unwrap()
            .spawn();

        let bad = JsonRecord::from_value(
            "flow",
            json!({"l7": {"http": {"headers": [{"value": "no key"}]}}}),
        )
        .unwrap();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();
        tx.send(Ok(SourceEvent::Record(bad))).await.unwrap();

        let report = handle.join().await;
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], PipelineError::Conversion(_)));
        assert_eq!(report.converted, 1);
        // the queue closed with one pending record, flushed by default
        assert_eq!(report.exported, 1);
    }

    #[tokio::test]
    async fn discard_policy_drops_partial_batch() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, mut batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 10)
            .unwrap()
            .with_partial_batch_policy(PartialBatchPolicy::Discard)
            .spawn();

        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();
        drop(tx);

        let report = handle.join().await;
        assert_eq!(report.converted, 1);
        assert_eq!(report.exported, 0);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let (tx, source) = ChannelSource::<JsonRecord>::channel(8);
        let (sink, _batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 2)
            .unwrap()
            .spawn();

        tx.send(Err(SourceError::Transport("connection reset".into())))
            .await
            .unwrap();

        let report = handle.join().await;
        assert_eq!(
            report.errors,
            vec![PipelineError::Transport("transport error: connection reset".into())]
        );
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn sink_failure_is_reported_and_closed_sink_is_not() {
        let (tx, source) = ChannelSource::channel(8);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(FailingSink), 1)
            .unwrap()
            .spawn();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();
        drop(tx);
        let report = handle.join().await;
        assert!(matches!(report.errors.as_slice(), [PipelineError::Sink(_)]));

        let (tx, source) = ChannelSource::channel(8);
        let (sink, batches) = ChannelSink::channel(1);
        drop(batches);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 1)
            .unwrap()
            .spawn();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();
        drop(tx);
        let report = handle.join().await;
        assert!(report.errors.is_empty());
        assert_eq!(report.exported, 0);
    }

    #[tokio::test]
    async fn sink_failure_stops_an_idle_source() {
        let (tx, source) = ChannelSource::channel(8);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(FailingSink), 1)
            .unwrap()
            .spawn();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();

        // the sender stays open, so only cancellation can end the converter
        let report = tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("pipeline should stop after the sink fails");
        assert!(matches!(report.errors.as_slice(), [PipelineError::Sink(_)]));
        assert_eq!(report.converted, 1);
        assert_eq!(report.exported, 0);
        drop(tx);
    }

    #[tokio::test]
    async fn closed_sink_stops_an_idle_source() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, batches) = ChannelSink::channel(1);
        drop(batches);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 1)
            .unwrap()
            .spawn();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("pipeline should stop after the sink closes");
        assert!(report.errors.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn parent_token_cancels_the_pipeline() {
        let parent = CancellationToken::new();
        let (_tx, source) = ChannelSource::<JsonRecord>::channel(1);
        let (sink, _batches) = ChannelSink::channel(1);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 4)
            .unwrap()
            .spawn_with_token(parent.clone());

        parent.cancel();
        let report = handle.join().await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn malformed_record_is_reported_not_skipped() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, _batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 4)
            .unwrap()
            .spawn();

        let bad = JsonRecord::from_value("flow", json!({"verdict": "X", "bad": [{"a": 1}, 2]}))
            .unwrap();
        tx.send(Ok(SourceEvent::Record(bad))).await.unwrap();
        drop(tx);

        let report = handle.join().await;
        assert!(matches!(report.errors.as_slice(), [PipelineError::Conversion(_)]));
        assert_eq!(report.converted, 0);
        assert_eq!(report.exported, 0);
    }

    #[tokio::test]
    async fn encoding_error_emits_no_partial_record() {
        let (tx, source) = ChannelSource::channel(8);
        let (sink, mut batches) = ChannelSink::channel(4);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 4)
            .unwrap()
            .spawn();

        // a header merged into a plain field of the same name
        let clash = JsonRecord::from_value(
            "flow",
            json!({"l7": {"http": {
                "headers.X-Id": "plain",
                "headers": [{"key": "X-Id", "value": "1"}]
            }}}),
        )
        .unwrap();
        tx.send(Ok(SourceEvent::Record(flow(1)))).await.unwrap();
        tx.send(Ok(SourceEvent::Record(clash))).await.unwrap();
        tx.send(Ok(SourceEvent::Record(flow(2)))).await.unwrap();
        drop(tx);

        let report = handle.join().await;
        assert!(matches!(report.errors.as_slice(), [PipelineError::Encoding(_)]));
        assert_eq!(report.converted, 1);

        let batch = batches.recv().await.unwrap();
        let ns: Vec<_> = batch.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![AnyValue::Int(1)]);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_before_any_input_stops_cleanly() {
        let (_tx, source) = ChannelSource::<JsonRecord>::channel(1);
        let (sink, _batches) = ChannelSink::channel(1);
        let handle = Pipeline::new(source, converter(&[]), Arc::new(sink), 4)
            .unwrap()
            .spawn();

        handle.cancel();
        let report = handle.join().await;
        assert_eq!(report, PipelineReport::default());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let (_tx, source) = ChannelSource::<JsonRecord>::channel(1);
        let (sink, _batches) = ChannelSink::channel(1);
        assert!(Pipeline::new(source, converter(&[]), Arc::new(sink), 0).is_err());
    }
}
