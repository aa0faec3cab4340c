//! Flattens nested flow event records into OpenTelemetry-style attributes
//! and streams them to a telemetry sink in fixed-size batches.

pub mod cli;
pub mod config;
pub mod convert;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod native;
pub mod pipeline;
pub mod record;
pub mod semconv;
pub mod sink;
pub mod source;
pub mod value;

// Re-export tracing for use in other modules
pub use tracing;

pub use config::{load_config_from_path, Config, Signal, StreamConfig};
pub use convert::{Converter, LogsConverter, SpanContext, TelemetryRecord, TracesConverter};
pub use encoder::{EncodeError, Encoding, EncodingOptions, FlowEncoder, SchemaTags};
pub use error::{PipelineError, ValidationError};
pub use filter::{IncludeTypes, Subscription, TypeRegistry};
pub use pipeline::{PartialBatchPolicy, Pipeline, PipelineHandle, PipelineReport};
pub use record::{JsonRecord, Record};
pub use sink::{Batch, ChannelSink, HttpSink, HttpSinkConfig, NullSink, Sink, SinkError};
pub use source::{ChannelSource, EventSource, JsonLinesSource, SourceError, SourceEvent};
pub use value::{AnyValue, KeyValue};
