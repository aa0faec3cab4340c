//! Event sources feeding the converter.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::debug;

use crate::filter::{Subscription, TypeRegistry};
use crate::record::{JsonRecord, Record};

/// What one receive from a source produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent<R> {
    Record(R),
    /// A response without a record, skipped by the converter.
    Empty,
    /// The source dropped this many events.
    LostEvents(u64),
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Cancelled,
    Transport(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Cancelled => write!(f, "stream cancelled"),
            SourceError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

#[async_trait]
pub trait EventSource: Send {
    type Record: Record + 'static;

    /// Start the stream; called once before the first `recv`.
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), SourceError>;

    async fn recv(&mut self) -> Result<SourceEvent<Self::Record>, SourceError>;
}

/// Newline-delimited JSON events, one object per line.
///
/// `{"lost_events": N}` lines are loss notices. The event type is read from
/// the dotted `type_field` path, either as a numeric code or as a registry name.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: u64,
    root_type: String,
    type_field: String,
    registry: TypeRegistry,
    subscription: Subscription,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, root_type: impl Into<String>, type_field: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            root_type: root_type.into(),
            type_field: type_field.into(),
            registry: TypeRegistry::default(),
            subscription: Subscription::new(Vec::new()),
        }
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn event_code(&self, object: &serde_json::Map<String, JsonValue>) -> Option<i32> {
        let mut path = self.type_field.split('.');
        let mut value = object.get(path.next()?)?;
        for segment in path {
            value = value.get(segment)?;
        }
        match value {
            JsonValue::Number(n) => n.as_i64().and_then(|c| i32::try_from(c).ok()),
            JsonValue::String(s) => self.registry.code(s).or_else(|| s.parse().ok()),
            _ => None,
        }
    }

    fn accepts(&self, object: &serde_json::Map<String, JsonValue>) -> bool {
        if self.subscription.is_unfiltered() {
            return true;
        }
        self.event_code(object)
            .map(|code| self.subscription.matches(code))
            .unwrap_or(false)
    }
}

fn lost_events(object: &serde_json::Map<String, JsonValue>) -> Option<u64> {
    if object.len() != 1 {
        return None;
    }
    object.get("lost_events")?.as_u64()
}

#[async_trait]
impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    type Record = JsonRecord;

    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), SourceError> {
        debug!(
            follow = subscription.follow,
            filters = subscription.filters.len(),
            "subscribing to event lines"
        );
        self.subscription = subscription.clone();
        Ok(())
    }

    async fn recv(&mut self) -> Result<SourceEvent<JsonRecord>, SourceError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(SourceEvent::EndOfStream),
                Err(e) => return Err(SourceError::Transport(e.to_string())),
            };
            self.line_no += 1;

            if line.trim().is_empty() {
                return Ok(SourceEvent::Empty);
            }

            let object = match serde_json::from_str::<JsonValue>(&line) {
                Ok(JsonValue::Object(object)) => object,
                Ok(other) => {
                    return Err(SourceError::Transport(format!(
                        "line {}: expected a JSON object, got {}",
                        self.line_no,
                        json_kind(&other)
                    )))
                }
                Err(e) => {
                    return Err(SourceError::Transport(format!("line {}: {}", self.line_no, e)))
                }
            };

            if let Some(count) = lost_events(&object) {
                return Ok(SourceEvent::LostEvents(count));
            }
            if !self.accepts(&object) {
                continue;
            }
            return Ok(SourceEvent::Record(JsonRecord::new(
                self.root_type.clone(),
                object,
            )));
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// In-process source fed through an mpsc channel; a closed channel ends the stream.
pub struct ChannelSource<R> {
    rx: mpsc::Receiver<Result<SourceEvent<R>, SourceError>>,
    subscription: Option<Subscription>,
}

impl<R> ChannelSource<R> {
    pub fn new(rx: mpsc::Receiver<Result<SourceEvent<R>, SourceError>>) -> Self {
        Self {
            rx,
            subscription: None,
        }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<SourceEvent<R>, SourceError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }
}

#[async_trait]
impl<R> EventSource for ChannelSource<R>
where
    R: Record + 'static,
{
    type Record = R;

    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), SourceError> {
        self.subscription = Some(subscription.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<SourceEvent<R>, SourceError> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Ok(SourceEvent::EndOfStream),
        }
    }
}
