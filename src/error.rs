use std::fmt;

use crate::encoder::EncodeError;
use crate::sink::SinkError;
use crate::source::SourceError;

/// Bad filter or configuration, reported before streaming starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Everything a running pipeline reports on its error channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Event source connectivity.
    Transport(String),
    /// A malformed record field.
    Conversion(String),
    /// Flattening broke the key uniqueness invariant.
    Encoding(String),
    /// The source dropped events; informational only.
    LostEvents(u64),
    /// The sink rejected a batch.
    Sink(String),
}

impl PipelineError {
    /// Whether the reporting task stopped because of this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::LostEvents(_))
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Transport(msg) => write!(f, "unexpected response from event source: {}", msg),
            PipelineError::Conversion(msg) => write!(f, "converter failed: {}", msg),
            PipelineError::Encoding(msg) => write!(f, "converter failed: {}", msg),
            PipelineError::LostEvents(count) => write!(f, "observed lost events: {}", count),
            PipelineError::Sink(msg) => write!(f, "sink failed: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<EncodeError> for PipelineError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Conversion(_) => PipelineError::Conversion(e.to_string()),
            EncodeError::Encoding(_) => PipelineError::Encoding(e.to_string()),
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        PipelineError::Transport(e.to_string())
    }
}

impl From<SinkError> for PipelineError {
    fn from(e: SinkError) -> Self {
        PipelineError::Sink(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lost_events_are_soft() {
        assert!(!PipelineError::LostEvents(3).is_fatal());
        assert!(PipelineError::Transport("reset".into()).is_fatal());
        assert!(PipelineError::Sink("503".into()).is_fatal());
        assert!(PipelineError::Conversion("bad".into()).is_fatal());
        assert!(PipelineError::Encoding("dup".into()).is_fatal());
    }

    #[test]
    fn encode_errors_keep_their_class() {
        let conv: PipelineError = EncodeError::Conversion("no key".into()).into();
        let enc: PipelineError = EncodeError::Encoding("dup".into()).into();
        assert!(matches!(conv, PipelineError::Conversion(_)));
        assert!(matches!(enc, PipelineError::Encoding(_)));
        assert_eq!(enc.to_string(), "converter failed: encoding error: dup");
    }

    #[test]
    fn lost_events_message_carries_count() {
        assert_eq!(
            PipelineError::LostEvents(42).to_string(),
            "observed lost events: 42"
        );
    }
}
