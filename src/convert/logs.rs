use super::{
    attach_payload, event_time_unix_nano, flow_attributes, now_unix_nano, Converter,
    TelemetryRecord,
};
use crate::encoder::{EncodeError, FlowEncoder};
use crate::error::ValidationError;
use crate::filter::{IncludeTypes, Subscription, TypeRegistry};
use crate::record::Record;
use crate::semconv;

pub struct LogsConverter {
    encoder: FlowEncoder,
    subscription: Subscription,
    fallback_prefix: String,
}

impl LogsConverter {
    /// Validates the encoding options and the inclusion filter up front.
    pub fn new(
        encoder: FlowEncoder,
        include: &IncludeTypes,
        registry: &TypeRegistry,
        fallback_prefix: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        encoder.options().validate_for_logs()?;
        include.validate(registry)?;
        Ok(Self {
            encoder,
            subscription: Subscription::new(include.make_filters(registry)),
            fallback_prefix: fallback_prefix.into(),
        })
    }
}

impl Converter for LogsConverter {
    fn convert(&self, record: &dyn Record) -> Result<TelemetryRecord, EncodeError> {
        let (mut attributes, payload) = flow_attributes(&self.encoder, record)?;

        let body = if self.encoder.with_payload_as_body() {
            Some(payload)
        } else {
            attach_payload(&mut attributes, payload, self.encoder.with_top_level_keys())?;
            None
        };

        let observed = now_unix_nano();
        Ok(TelemetryRecord {
            time_unix_nano: event_time_unix_nano(record).unwrap_or(observed),
            observed_time_unix_nano: observed,
            resource: semconv::resource_attributes(record, &self.fallback_prefix),
            attributes: attributes.into_entries(),
            body,
            span: None,
        })
    }

    fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }
}
