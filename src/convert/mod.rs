//! Record conversion into log- and span-shaped telemetry records.

mod logs;
mod traces;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};

use crate::encoder::{EncodeError, FlowEncoder};
use crate::filter::Subscription;
use crate::record::{lookup_str, Record};
use crate::semconv;
use crate::value::{attributes_to_json, AnyValue, AttributeList, KeyValue};

pub use logs::LogsConverter;
pub use traces::{parse_traceparent, TracesConverter};

pub const KEY_EVENT_KIND_VERSION: &str = "hubble.event.kind.version";
pub const KEY_EVENT_ENCODING: &str = "hubble.event.encoding";
pub const KEY_EVENT_ENCODING_OPTIONS: &str = "hubble.event.encoding_options";
pub const KEY_EVENT_OBJECT: &str = "hubble.event.object";

pub const FLOW_V1ALPHA1: &str = "flow/v1alpha1";

/// Identity of a span; ids are lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
}

/// One converted event, ready for a sink. `span` is set for span-shaped
/// records only.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryRecord {
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub resource: Vec<KeyValue>,
    pub attributes: Vec<KeyValue>,
    pub body: Option<AnyValue>,
    pub span: Option<SpanContext>,
}

impl TelemetryRecord {
    pub fn attribute(&self, key: &str) -> Option<&AnyValue> {
        self.attributes
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }

    /// JSON object written by the HTTP sink, one per NDJSON line.
    pub fn to_json(&self) -> JsonValue {
        let mut out = json!({
            "time_unix_nano": self.time_unix_nano,
            "observed_time_unix_nano": self.observed_time_unix_nano,
            "resource": attributes_to_json(&self.resource),
            "attributes": attributes_to_json(&self.attributes),
            "body": self.body.as_ref().map(AnyValue::to_json),
        });
        if let (Some(span), Some(object)) = (&self.span, out.as_object_mut()) {
            object.insert("trace_id".into(), span.trace_id.clone().into());
            object.insert("span_id".into(), span.span_id.clone().into());
            object.insert(
                "parent_span_id".into(),
                span.parent_span_id.clone().map_or(JsonValue::Null, JsonValue::from),
            );
            object.insert("name".into(), span.name.clone().into());
        }
        out
    }
}

/// Turns source records into telemetry records.
pub trait Converter: Send + Sync {
    fn convert(&self, record: &dyn Record) -> Result<TelemetryRecord, EncodeError>;

    /// Stream request matching this converter's inclusion filter.
    fn subscription(&self) -> Subscription;
}

/// Encoded payload plus the attributes every signal starts with: the
/// envelope, then the derived HTTP attributes.
///
/// The payload is encoded first so a malformed record fails before any
/// attribute is derived from it.
fn flow_attributes(
    encoder: &FlowEncoder,
    record: &dyn Record,
) -> Result<(AttributeList, AnyValue), EncodeError> {
    let payload = encoder.to_value(record)?;

    let mut attributes = AttributeList::new();
    for (key, value) in [
        (KEY_EVENT_KIND_VERSION, FLOW_V1ALPHA1.to_string()),
        (KEY_EVENT_ENCODING, encoder.encoding_format().to_string()),
        (KEY_EVENT_ENCODING_OPTIONS, encoder.options().to_string()),
    ] {
        attributes.push(key, AnyValue::String(value))?;
    }
    for kv in semconv::http_attributes(record) {
        attributes.push(kv.key, kv.value)?;
    }
    Ok((attributes, payload))
}

/// Attach the payload as one object attribute, or spread its top-level keys.
fn attach_payload(
    attributes: &mut AttributeList,
    payload: AnyValue,
    top_level_keys: bool,
) -> Result<(), EncodeError> {
    match payload {
        AnyValue::Map(entries) if top_level_keys => {
            for kv in entries {
                attributes.push(kv.key, kv.value)?;
            }
            Ok(())
        }
        other => attributes.push(KEY_EVENT_OBJECT, other),
    }
}

fn now_unix_nano() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default()
}

/// Event time from the record's top-level `time` field.
fn event_time_unix_nano(record: &dyn Record) -> Option<u64> {
    let time = lookup_str(record, "time")?;
    match DateTime::parse_from_rfc3339(&time) {
        Ok(ts) => ts
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok()),
        Err(e) => {
            tracing::debug!(time = %time, error = %e, "ignoring unparsable event time");
            None
        }
    }
}
