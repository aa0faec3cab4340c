use std::fmt::Write as _;

use rand::Rng;

use super::{
    attach_payload, event_time_unix_nano, flow_attributes, now_unix_nano, Converter, SpanContext,
    TelemetryRecord,
};
use crate::encoder::{EncodeError, FlowEncoder};
use crate::error::ValidationError;
use crate::filter::{IncludeTypes, Subscription, TypeRegistry};
use crate::record::{lookup_str, Record};
use crate::semconv;

const TRACEPARENT: &str = "traceparent";
const DEFAULT_SPAN_NAME: &str = "flow";

/// One span per flow.
///
/// The trace id comes from the flow's trace context, then from a
/// `traceparent` header when header parsing is on, then from the flow uuid.
/// Span ids come from the uuid. Flows without a uuid get random ids.
pub struct TracesConverter {
    encoder: FlowEncoder,
    subscription: Subscription,
    fallback_prefix: String,
    parse_trace_headers: bool,
}

impl TracesConverter {
    pub fn new(
        encoder: FlowEncoder,
        include: &IncludeTypes,
        registry: &TypeRegistry,
        fallback_prefix: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        encoder.options().validate_for_traces()?;
        include.validate(registry)?;
        Ok(Self {
            encoder,
            subscription: Subscription::new(include.make_filters(registry)),
            fallback_prefix: fallback_prefix.into(),
            parse_trace_headers: false,
        })
    }

    pub fn with_trace_headers(mut self, parse: bool) -> Self {
        self.parse_trace_headers = parse;
        self
    }

    fn span_context(&self, record: &dyn Record) -> SpanContext {
        let uuid = lookup_str(record, "uuid").and_then(|u| hex_id(&u, 32));

        let mut parent_span_id = None;
        let mut trace_id =
            lookup_str(record, "trace_context.parent.trace_id").and_then(|t| hex_id(&t, 32));
        if trace_id.is_none() && self.parse_trace_headers {
            let header = semconv::http_headers(record)
                .into_iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(TRACEPARENT));
            if let Some((trace, parent)) = header.and_then(|(_, value)| parse_traceparent(&value)) {
                trace_id = Some(trace);
                parent_span_id = Some(parent);
            }
        }

        let span_id = match &uuid {
            Some(hex) => hex[16..].to_string(),
            None => random_hex::<8>(),
        };
        let trace_id = trace_id
            .or(uuid)
            .unwrap_or_else(random_hex::<16>);
        let name = lookup_str(record, "Summary")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SPAN_NAME.to_string());

        SpanContext {
            trace_id,
            span_id,
            parent_span_id,
            name,
        }
    }
}

impl Converter for TracesConverter {
    fn convert(&self, record: &dyn Record) -> Result<TelemetryRecord, EncodeError> {
        let (mut attributes, payload) = flow_attributes(&self.encoder, record)?;
        attach_payload(&mut attributes, payload, self.encoder.with_top_level_keys())?;

        let observed = now_unix_nano();
        Ok(TelemetryRecord {
            time_unix_nano: event_time_unix_nano(record).unwrap_or(observed),
            observed_time_unix_nano: observed,
            resource: semconv::resource_attributes(record, &self.fallback_prefix),
            attributes: attributes.into_entries(),
            body: None,
            span: Some(self.span_context(record)),
        })
    }

    fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }
}

/// Trace id and parent span id of a W3C `traceparent` value.
pub fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = hex_id(parts.next()?, 32)?;
    let parent_id = hex_id(parts.next()?, 16)?;
    let flags = parts.next()?;
    if version.len() != 2 || version == "ff" || flags.len() != 2 {
        return None;
    }
    if !version.bytes().chain(flags.bytes()).all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((trace_id, parent_id))
}

/// Lowercase hex id of exactly `len` digits, dashes ignored; all-zero ids are invalid.
fn hex_id(raw: &str, len: usize) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let valid = hex.len() == len
        && hex.bytes().all(|b| b.is_ascii_hexdigit())
        && hex.bytes().any(|b| b != b'0');
    valid.then_some(hex)
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill(&mut bytes[..]);
    let mut out = String::with_capacity(N * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
