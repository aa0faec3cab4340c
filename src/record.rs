//! Schema-agnostic record introspection.
//!
//! Encoders never look at concrete event types. They walk a [`Record`] and
//! classify each populated field by [`FieldKind`]; schema specific behaviour
//! (label maps, header lists) hangs off the field's type tag.

use bytes::Bytes;
use serde_json::{Map, Value as JsonValue};

use crate::encoder::EncodeError;
use crate::value::AnyValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    ScalarList,
    SubRecord,
    SubRecordList,
}

/// Static description of a field, as the record's schema reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Fully-qualified name, e.g. `flow.l7.http.headers`.
    pub full_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
    Bytes(Bytes),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&Scalar> for AnyValue {
    fn from(s: &Scalar) -> Self {
        match s {
            Scalar::String(v) => AnyValue::String(v.clone()),
            Scalar::Int(v) => AnyValue::Int(*v),
            Scalar::Bool(v) => AnyValue::Bool(*v),
            Scalar::Double(v) => AnyValue::Double(*v),
            Scalar::Bytes(v) => AnyValue::Bytes(v.clone()),
        }
    }
}

pub enum FieldValue<'a> {
    Scalar(Scalar),
    ScalarList(Vec<Scalar>),
    Record(Box<dyn Record + 'a>),
    RecordList(Vec<Box<dyn Record + 'a>>),
}

impl FieldValue<'_> {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Scalar(_) => FieldKind::Scalar,
            FieldValue::ScalarList(_) => FieldKind::ScalarList,
            FieldValue::Record(_) => FieldKind::SubRecord,
            FieldValue::RecordList(_) => FieldKind::SubRecordList,
        }
    }
}

/// A populated field of a record.
pub struct Field<'a> {
    descriptor: FieldDescriptor,
    value: FieldValue<'a>,
}

impl<'a> Field<'a> {
    pub fn new(name: impl Into<String>, full_name: impl Into<String>, value: FieldValue<'a>) -> Self {
        Self {
            descriptor: FieldDescriptor {
                name: name.into(),
                kind: value.kind(),
                full_name: full_name.into(),
            },
            value,
        }
    }

    pub fn kind(&self) -> FieldKind {
        self.descriptor.kind
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn type_tag(&self) -> &str {
        &self.descriptor.full_name
    }

    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    pub fn value(&self) -> &FieldValue<'a> {
        &self.value
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match &self.value {
            FieldValue::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// A nested, schema-described event record.
pub trait Record: Send + Sync {
    /// Fully-qualified type name; sub-record fields extend it with their name.
    fn type_name(&self) -> &str;

    /// Populated fields in schema order.
    fn fields(&self) -> Result<Vec<Field<'_>>, EncodeError>;

    /// Field lookup for derived attributes. A record whose fields cannot be
    /// listed has nothing to find here; encoding it reports the error.
    fn get(&self, name: &str) -> Option<Field<'_>> {
        self.fields()
            .ok()?
            .into_iter()
            .find(|field| field.name() == name)
    }

    /// True only for a well-formed record without populated fields.
    fn is_empty(&self) -> bool {
        matches!(self.fields(), Ok(fields) if fields.is_empty())
    }
}

pub trait FieldVisitor {
    fn visit(&mut self, field: &Field<'_>) -> Result<(), EncodeError>;
}

impl<F> FieldVisitor for F
where
    F: FnMut(&Field<'_>) -> Result<(), EncodeError>,
{
    fn visit(&mut self, field: &Field<'_>) -> Result<(), EncodeError> {
        self(field)
    }
}

/// Walk the populated fields of `record`, stopping at the first error.
pub fn visit_fields<V>(record: &dyn Record, visitor: &mut V) -> Result<(), EncodeError>
where
    V: FieldVisitor + ?Sized,
{
    for field in record.fields()? {
        visitor.visit(&field)?;
    }
    Ok(())
}

/// Resolve a dotted path (`l7.http.url`) through sub-records and hand the
/// field to `f`.
pub fn lookup<T>(record: &dyn Record, path: &str, f: impl FnOnce(&Field<'_>) -> T) -> Option<T> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let field = record.get(head)?;
    match rest {
        None => Some(f(&field)),
        Some(rest) => match field.value() {
            FieldValue::Record(sub) => lookup(sub.as_ref(), rest, f),
            _ => None,
        },
    }
}

pub fn lookup_str(record: &dyn Record, path: &str) -> Option<String> {
    lookup(record, path, |field| {
        field.as_scalar().and_then(Scalar::as_str).map(str::to_string)
    })
    .flatten()
}

pub fn lookup_int(record: &dyn Record, path: &str) -> Option<i64> {
    lookup(record, path, |field| field.as_scalar().and_then(Scalar::as_int)).flatten()
}

/// String items of a scalar-list field.
pub fn lookup_strings(record: &dyn Record, path: &str) -> Vec<String> {
    lookup(record, path, |field| match field.value() {
        FieldValue::ScalarList(items) => items
            .iter()
            .filter_map(|s| s.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    })
    .unwrap_or_default()
}

/// Owned record backed by a JSON object.
#[derive(Clone, Debug, PartialEq)]
pub struct JsonRecord {
    type_name: String,
    object: Map<String, JsonValue>,
}

impl JsonRecord {
    pub fn new(type_name: impl Into<String>, object: Map<String, JsonValue>) -> Self {
        Self {
            type_name: type_name.into(),
            object,
        }
    }

    /// Returns `None` when `value` is not a JSON object.
    pub fn from_value(type_name: impl Into<String>, value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(object) => Some(Self::new(type_name, object)),
            _ => None,
        }
    }

    pub fn as_object(&self) -> &Map<String, JsonValue> {
        &self.object
    }
}

impl Record for JsonRecord {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn fields(&self) -> Result<Vec<Field<'_>>, EncodeError> {
        json_fields(&self.type_name, &self.object)
    }
}

struct JsonRecordRef<'a> {
    type_name: String,
    object: &'a Map<String, JsonValue>,
}

impl Record for JsonRecordRef<'_> {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn fields(&self) -> Result<Vec<Field<'_>>, EncodeError> {
        json_fields(&self.type_name, self.object)
    }
}

fn json_fields<'a>(
    type_name: &str,
    object: &'a Map<String, JsonValue>,
) -> Result<Vec<Field<'a>>, EncodeError> {
    let mut fields = Vec::with_capacity(object.len());
    for (name, value) in object {
        let full_name = format!("{}.{}", type_name, name);
        let value = match value {
            JsonValue::Null => continue,
            JsonValue::Object(sub) => FieldValue::Record(Box::new(JsonRecordRef {
                type_name: full_name.clone(),
                object: sub,
            })),
            JsonValue::Array(items) if items.is_empty() => continue,
            JsonValue::Array(items) => json_list(&full_name, items)?,
            scalar => FieldValue::Scalar(json_scalar(&full_name, scalar)?),
        };
        fields.push(Field::new(name.as_str(), full_name, value));
    }
    Ok(fields)
}

fn json_list<'a>(full_name: &str, items: &'a [JsonValue]) -> Result<FieldValue<'a>, EncodeError> {
    if items.iter().all(JsonValue::is_object) {
        let records = items
            .iter()
            .filter_map(JsonValue::as_object)
            .map(|object| {
                Box::new(JsonRecordRef {
                    type_name: full_name.to_string(),
                    object,
                }) as Box<dyn Record + 'a>
            })
            .collect();
        return Ok(FieldValue::RecordList(records));
    }

    let scalars = items
        .iter()
        .map(|item| json_scalar(full_name, item))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FieldValue::ScalarList(scalars))
}

fn json_scalar(full_name: &str, value: &JsonValue) -> Result<Scalar, EncodeError> {
    match value {
        JsonValue::String(s) => Ok(Scalar::String(s.clone())),
        JsonValue::Bool(b) => Ok(Scalar::Bool(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(Scalar::Int(i)),
            None => n.as_f64().map(Scalar::Double).ok_or_else(|| {
                EncodeError::Conversion(format!("{}: unrepresentable number {}", full_name, n))
            }),
        },
        other => Err(EncodeError::Conversion(format!(
            "{}: list mixes records and scalars or nests lists ({})",
            full_name, other
        ))),
    }
}
