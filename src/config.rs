use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::convert::{Converter, LogsConverter, TracesConverter};
use crate::encoder::{EncodingOptions, FlowEncoder, SchemaTags};
use crate::error::ValidationError;
use crate::filter::{IncludeTypes, TypeRegistry};
use crate::pipeline::PartialBatchPolicy;
use crate::semconv::DEFAULT_SERVICE_NAME_PREFIX;
use crate::sink::HttpSinkConfig;

pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Which stream a run converts flows into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    #[default]
    Logs,
    Traces,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Logs => write!(f, "logs"),
            Signal::Traces => write!(f, "traces"),
        }
    }
}

/// Per-signal inclusion filter and encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub include_types: IncludeTypes,
    pub encoding: EncodingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Type name of the top-level record; prefixes every type tag.
    pub root_type: String,
    /// Field carrying the event type code or name.
    pub type_field: String,
    pub tags: SchemaTags,
    /// Replaces the built-in event type registry when set.
    pub types: Option<BTreeMap<String, i32>>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            root_type: "flow".to_string(),
            type_field: "event_type.type".to_string(),
            tags: SchemaTags::default(),
            types: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue capacity and batch size.
    pub buffer_size: usize,
    pub fallback_service_name_prefix: String,
    pub signal: Signal,
    /// Take trace ids from `traceparent` request headers.
    pub parse_trace_headers: bool,
    pub partial_batch: PartialBatchPolicy,
    pub logs: StreamConfig,
    pub traces: StreamConfig,
    pub schema: SchemaConfig,
    pub sink: Option<HttpSinkConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            fallback_service_name_prefix: DEFAULT_SERVICE_NAME_PREFIX.to_string(),
            signal: Signal::default(),
            parse_trace_headers: false,
            partial_batch: PartialBatchPolicy::default(),
            logs: StreamConfig::default(),
            traces: StreamConfig::default(),
            schema: SchemaConfig::default(),
            sink: None,
        }
    }
}

impl Config {
    pub fn registry(&self) -> TypeRegistry {
        match &self.schema.types {
            Some(types) => TypeRegistry::from_pairs(types.iter().map(|(k, v)| (k.clone(), *v))),
            None => TypeRegistry::default(),
        }
    }

    pub fn stream(&self, signal: Signal) -> &StreamConfig {
        match signal {
            Signal::Logs => &self.logs,
            Signal::Traces => &self.traces,
        }
    }

    /// Checks both streams, whichever one runs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.buffer_size == 0 {
            return Err(ValidationError::new("buffer_size must be greater than zero"));
        }
        if self.fallback_service_name_prefix.is_empty() {
            return Err(ValidationError::new(
                "fallback_service_name_prefix cannot be empty",
            ));
        }
        if self.schema.root_type.is_empty() {
            return Err(ValidationError::new("schema.root_type cannot be empty"));
        }
        let registry = self.registry();
        self.traces.encoding.validate_for_traces()?;
        self.logs.encoding.validate_for_logs()?;
        self.traces.include_types.validate(&registry)?;
        self.logs.include_types.validate(&registry)?;
        if let Some(sink) = &self.sink {
            reqwest::Url::parse(&sink.endpoint).map_err(|e| {
                ValidationError::new(format!("invalid sink endpoint {:?}: {}", sink.endpoint, e))
            })?;
        }
        Ok(())
    }

    /// Converter for the configured signal.
    pub fn build_converter(&self) -> Result<Arc<dyn Converter>, ValidationError> {
        let stream = self.stream(self.signal);
        let encoder = FlowEncoder::new(stream.encoding.clone(), self.schema.tags.clone());
        let registry = self.registry();
        let prefix = self.fallback_service_name_prefix.clone();

        Ok(match self.signal {
            Signal::Logs => Arc::new(LogsConverter::new(
                encoder,
                &stream.include_types,
                &registry,
                prefix,
            )?),
            Signal::Traces => Arc::new(
                TracesConverter::new(encoder, &stream.include_types, &registry, prefix)?
                    .with_trace_headers(self.parse_trace_headers),
            ),
        })
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoding;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.fallback_service_name_prefix, "hubble-otel-unknown");
        assert_eq!(config.signal, Signal::Logs);
        assert!(!config.parse_trace_headers);
        for stream in [&config.logs, &config.traces] {
            assert_eq!(stream.encoding.encoding, Encoding::SemiFlatTypedMap);
            assert!(stream.encoding.labels_as_maps);
            assert!(stream.encoding.headers_as_maps);
            assert!(!stream.encoding.top_level_keys);
            assert!(!stream.encoding.payload_as_body);
            assert_eq!(stream.encoding.separator, '.');
            assert!(stream.include_types.make_filters(&config.registry()).is_empty());
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
buffer_size = 16
fallback_service_name_prefix = "flows"
signal = "traces"
parse_trace_headers = true
partial_batch = "discard"

[logs]
include_types = ["l7", "drop"]

[logs.encoding]
encoding = "TYPED_MAP"
payload_as_body = true

[traces]
include_types = ["l7"]

[traces.encoding]
encoding = "TYPED_MAP"
top_level_keys = true

[schema]
type_field = "type"

[schema.types]
l7 = 129
drop = 1

[sink]
endpoint = "http://localhost:4318/v1/logs"
token = "secret"
gzip = true

[sink.headers]
x-tenant = "a"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.partial_batch, PartialBatchPolicy::Discard);
        assert_eq!(config.signal, Signal::Traces);
        assert!(config.logs.encoding.payload_as_body);
        assert!(config.traces.encoding.top_level_keys);
        assert_eq!(config.stream(Signal::Logs).include_types, IncludeTypes::new(["l7", "drop"]));
        assert_eq!(config.schema.root_type, "flow");
        assert_eq!(config.schema.type_field, "type");
        assert_eq!(config.registry().code("l7"), Some(129));
        assert_eq!(config.registry().code("trace"), None);

        let sink = config.sink.as_ref().unwrap();
        assert_eq!(sink.token.as_deref(), Some("secret"));
        assert_eq!(sink.headers.get("x-tenant").map(String::as_str), Some("a"));
        assert!(config.validate().is_ok());
        assert!(config.build_converter().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            logs: StreamConfig {
                include_types: IncludeTypes::new(["all", "l7"]),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.message().contains("on its own"));

        let config = Config {
            sink: Some(HttpSinkConfig::new("not a url")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer_size = 4\n[logs]\ninclude_types = [\"*\"]").unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.buffer_size, 4);
        assert!(config.logs.include_types.matches_all());
    }

    #[test]
    fn test_load_config_not_found() {
        let result = load_config_from_path("/nonexistent/flow2otlp.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_rejects_invalid_filter() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logs]\ninclude_types = [\"\"]").unwrap();

        let err = load_config_from_path(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("empty string"));
    }

    #[test]
    fn test_both_streams_are_validated() {
        // the inactive traces stream still has to be valid
        let config = Config {
            traces: StreamConfig {
                encoding: EncodingOptions {
                    payload_as_body: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.signal, Signal::Logs);
        let err = config.validate().unwrap_err();
        assert!(err.message().contains("traces"));

        let config = Config {
            traces: StreamConfig {
                include_types: IncludeTypes::new(["nope"]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_converter_follows_signal() {
        let mut config = Config::default();
        config.logs.include_types = IncludeTypes::new(["l7"]);
        config.traces.include_types = IncludeTypes::new(["drop"]);

        let logs = config.build_converter().unwrap();
        assert!(logs.subscription().matches(129));
        assert!(!logs.subscription().matches(1));

        config.signal = Signal::Traces;
        let traces = config.build_converter().unwrap();
        assert!(traces.subscription().matches(1));
        assert!(!traces.subscription().matches(129));
    }
}
