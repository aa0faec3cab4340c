//! Flattening engine: turns a nested [`Record`] into attribute values.
//!
//! Two builder strategies share one traversal and one set of policies:
//! - [`NestedBuilder`] keeps the record shape, sub-records become maps.
//! - [`FlatBuilder`] produces a single list keyed by separator-joined paths.
//!
//! The strategy is picked once per pipeline through [`EncodingOptions::encoding`].

mod flat;
mod nested;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::record::{visit_fields, Field, FieldKind, FieldValue, FieldVisitor, Record, Scalar};
use crate::value::{AnyValue, AttributeList, KeyValue};

pub use flat::FlatBuilder;
pub use nested::NestedBuilder;

/// Errors raised while flattening a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// Malformed input, e.g. a header item without a name.
    Conversion(String),
    /// The key uniqueness invariant would be broken.
    Encoding(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Conversion(msg) => write!(f, "conversion error: {}", msg),
            EncodeError::Encoding(msg) => write!(f, "encoding error: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Output encoding of a converted record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Encoding {
    /// Nested maps mirroring the record shape.
    TypedMap,
    /// One flat list keyed by joined field paths.
    #[default]
    SemiFlatTypedMap,
    /// Nested maps rendered as a single JSON string.
    Json,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::TypedMap => "TYPED_MAP",
            Encoding::SemiFlatTypedMap => "SEMI_FLAT_TYPED_MAP",
            Encoding::Json => "JSON",
        }
    }

    fn produces_map(&self) -> bool {
        !matches!(self, Encoding::Json)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingOptions {
    pub encoding: Encoding,
    /// Merge label map entries into the enclosing level.
    pub labels_as_maps: bool,
    /// Fold repeated header names into one array-valued entry.
    pub headers_as_maps: bool,
    /// Promote the top-level entries of the payload into the envelope.
    pub top_level_keys: bool,
    /// Put the payload into the body slot instead of an attribute.
    pub payload_as_body: bool,
    pub separator: char,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            labels_as_maps: true,
            headers_as_maps: true,
            top_level_keys: false,
            payload_as_body: false,
            separator: '.',
        }
    }
}

impl EncodingOptions {
    fn validate_common(&self) -> Result<(), ValidationError> {
        if self.top_level_keys && !self.encoding.produces_map() {
            return Err(ValidationError::new(format!(
                "top_level_keys cannot be used with {} encoding",
                self.encoding.as_str()
            )));
        }
        if self.separator.is_control() {
            return Err(ValidationError::new("separator must be a printable character"));
        }
        Ok(())
    }

    pub fn validate_for_logs(&self) -> Result<(), ValidationError> {
        self.validate_common()?;
        if self.payload_as_body && self.top_level_keys {
            return Err(ValidationError::new(
                "payload_as_body and top_level_keys are mutually exclusive",
            ));
        }
        Ok(())
    }

    pub fn validate_for_traces(&self) -> Result<(), ValidationError> {
        self.validate_common()?;
        if self.payload_as_body {
            return Err(ValidationError::new("payload_as_body is not supported for traces"));
        }
        Ok(())
    }
}

impl fmt::Display for EncodingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encoding={},labels_as_maps={},headers_as_maps={},top_level_keys={},payload_as_body={}",
            self.encoding.as_str(),
            self.labels_as_maps,
            self.headers_as_maps,
            self.top_level_keys,
            self.payload_as_body,
        )
    }
}

/// Fully-qualified field names that get special treatment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaTags {
    pub label_maps: HashSet<String>,
    pub header_lists: HashSet<String>,
}

impl Default for SchemaTags {
    fn default() -> Self {
        Self {
            label_maps: ["flow.source.labels", "flow.destination.labels"]
                .into_iter()
                .map(String::from)
                .collect(),
            header_lists: ["flow.l7.http.headers"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Options and tags consulted at every visited field.
#[derive(Clone, Debug)]
pub(crate) struct Policy {
    labels_as_maps: bool,
    headers_as_maps: bool,
    separator: char,
    tags: SchemaTags,
}

impl Policy {
    pub(crate) fn new(options: &EncodingOptions, tags: SchemaTags) -> Self {
        Self {
            labels_as_maps: options.labels_as_maps,
            headers_as_maps: options.headers_as_maps,
            separator: options.separator,
            tags,
        }
    }

    fn is_label_map(&self, field: &Field<'_>) -> bool {
        self.labels_as_maps && self.tags.label_maps.contains(field.type_tag())
    }

    fn is_header_list(&self, field: &Field<'_>) -> bool {
        self.headers_as_maps
            && field.kind() == FieldKind::SubRecordList
            && self.tags.header_lists.contains(field.type_tag())
    }

    fn key_path(&self, prefix: &str, name: &str) -> String {
        fmt_key_path(prefix, name, self.separator)
    }
}

pub(crate) fn fmt_key_path(prefix: &str, name: &str, separator: char) -> String {
    if prefix.is_empty() {
        return name.to_string();
    }
    let mut path = String::with_capacity(prefix.len() + name.len() + 1);
    path.push_str(prefix);
    path.push(separator);
    path.push_str(name);
    path
}

/// A flattening strategy.
///
/// Implementors decide what one visited field turns into; the traversal and
/// the label/header policies are shared.
pub trait Builder: Send + Sync {
    /// Handle one field found under `key_path`: emit entries into `out` or recurse.
    fn leaf(
        &self,
        out: &mut AttributeList,
        key_path: &str,
        field: &Field<'_>,
    ) -> Result<(), EncodeError>;

    fn visit(
        &self,
        out: &mut AttributeList,
        key_path: &str,
        record: &dyn Record,
    ) -> Result<(), EncodeError> {
        let mut visitor = LeafVisitor {
            builder: self,
            out,
            key_path,
        };
        visit_fields(record, &mut visitor)
    }

    /// Top-level entries for `record`.
    fn items(&self, record: &dyn Record) -> Result<Vec<KeyValue>, EncodeError> {
        let mut out = AttributeList::new();
        self.visit(&mut out, "", record)?;
        Ok(out.into_entries())
    }

    fn consume(&self, record: &dyn Record) -> Result<AnyValue, EncodeError> {
        Ok(AnyValue::Map(self.items(record)?))
    }
}

struct LeafVisitor<'b, B: ?Sized> {
    builder: &'b B,
    out: &'b mut AttributeList,
    key_path: &'b str,
}

impl<B: Builder + ?Sized> FieldVisitor for LeafVisitor<'_, B> {
    fn visit(&mut self, field: &Field<'_>) -> Result<(), EncodeError> {
        self.builder.leaf(self.out, self.key_path, field)
    }
}

/// Plain value of a scalar or scalar-list field.
fn scalar_value(field: &Field<'_>) -> Option<AnyValue> {
    match field.value() {
        FieldValue::Scalar(s) => Some(s.into()),
        FieldValue::ScalarList(items) => Some(AnyValue::Array(items.iter().map(Into::into).collect())),
        _ => None,
    }
}

/// Entries of a label map field.
///
/// Labels arrive either as a sub-record of scalars or as `key=value` strings.
fn label_entries(field: &Field<'_>) -> Result<Vec<(String, AnyValue)>, EncodeError> {
    match field.value() {
        FieldValue::Scalar(Scalar::String(label)) => Ok(vec![split_label(label)]),
        FieldValue::ScalarList(items) => items
            .iter()
            .map(|item| match item {
                Scalar::String(label) => Ok(split_label(label)),
                other => Err(EncodeError::Conversion(format!(
                    "{}: label is not a string ({:?})",
                    field.type_tag(),
                    other
                ))),
            })
            .collect(),
        FieldValue::Record(sub) => sub
            .fields()?
            .iter()
            .map(|label| match label.as_scalar() {
                Some(value) => Ok((label.name().to_string(), value.into())),
                None => Err(EncodeError::Conversion(format!(
                    "{}: label {:?} is not a scalar",
                    field.type_tag(),
                    label.name()
                ))),
            })
            .collect(),
        _ => Err(EncodeError::Conversion(format!(
            "{}: unsupported label map layout",
            field.type_tag()
        ))),
    }
}

fn split_label(label: &str) -> (String, AnyValue) {
    match label.split_once('=') {
        Some((key, value)) => (key.to_string(), AnyValue::String(value.to_string())),
        None => (label.to_string(), AnyValue::String(String::new())),
    }
}

/// Parse one header item into its name and value.
pub(crate) fn parse_header(item: &dyn Record) -> Result<(String, AnyValue), EncodeError> {
    let mut name = None;
    let mut value = None;
    for field in item.fields()? {
        match (field.name(), field.as_scalar()) {
            ("key", Some(Scalar::String(s))) => name = Some(s.clone()),
            ("value", Some(Scalar::String(s))) => value = Some(s.clone()),
            _ => {}
        }
    }

    let name = name.filter(|n| !n.is_empty()).ok_or_else(|| {
        EncodeError::Conversion(format!("{}: header item has no key", item.type_name()))
    })?;
    Ok((name, AnyValue::String(value.unwrap_or_default())))
}

/// Pick the builder for `options.encoding`.
pub fn new_builder(options: &EncodingOptions, tags: SchemaTags) -> Box<dyn Builder> {
    let policy = Policy::new(options, tags);
    match options.encoding {
        Encoding::TypedMap | Encoding::Json => Box::new(NestedBuilder::new(policy)),
        Encoding::SemiFlatTypedMap => Box::new(FlatBuilder::new(policy)),
    }
}

/// Options plus the builder selected for them.
pub struct FlowEncoder {
    options: EncodingOptions,
    builder: Box<dyn Builder>,
}

impl FlowEncoder {
    pub fn new(options: EncodingOptions, tags: SchemaTags) -> Self {
        let builder = new_builder(&options, tags);
        Self { options, builder }
    }

    pub fn options(&self) -> &EncodingOptions {
        &self.options
    }

    pub fn encoding_format(&self) -> &'static str {
        self.options.encoding.as_str()
    }

    pub fn with_top_level_keys(&self) -> bool {
        self.options.top_level_keys && self.options.encoding.produces_map()
    }

    pub fn with_payload_as_body(&self) -> bool {
        self.options.payload_as_body
    }

    pub fn to_value(&self, record: &dyn Record) -> Result<AnyValue, EncodeError> {
        let value = self.builder.consume(record)?;
        match self.options.encoding {
            Encoding::Json => serde_json::to_string(&value.to_json())
                .map(AnyValue::String)
                .map_err(|e| EncodeError::Encoding(e.to_string())),
            Encoding::TypedMap | Encoding::SemiFlatTypedMap => Ok(value),
        }
    }
}
