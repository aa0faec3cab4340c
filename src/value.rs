//! Attribute value model shared by the encoders, converters and sinks.

use base64::Engine;
use bytes::Bytes;

use crate::encoder::EncodeError;

/// Tagged attribute value, shaped after the OTLP `AnyValue`.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyValue {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
    Bytes(Bytes),
    Array(Vec<AnyValue>),
    Map(Vec<KeyValue>),
}

/// A single attribute entry.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: AnyValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl AnyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AnyValue]> {
        match self {
            AnyValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[KeyValue]> {
        match self {
            AnyValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&AnyValue> {
        self.as_map()?
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }

    pub fn string_array<I, S>(values: I) -> AnyValue
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AnyValue::Array(
            values
                .into_iter()
                .map(|v| AnyValue::String(v.into()))
                .collect(),
        )
    }

    /// Render as JSON. Bytes become base64, non-finite doubles become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AnyValue::String(s) => serde_json::Value::String(s.clone()),
            AnyValue::Int(i) => serde_json::Value::Number((*i).into()),
            AnyValue::Bool(b) => serde_json::Value::Bool(*b),
            AnyValue::Double(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => serde_json::Value::Number(n),
                None => {
                    tracing::debug!(value = %f, "dropping non-finite double during JSON rendering");
                    serde_json::Value::Null
                }
            },
            AnyValue::Bytes(b) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b.as_ref()),
            ),
            AnyValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(AnyValue::to_json).collect())
            }
            AnyValue::Map(entries) => serde_json::Value::Object(attributes_to_json(entries)),
        }
    }
}

impl From<&str> for AnyValue {
    fn from(s: &str) -> Self {
        AnyValue::String(s.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(s: String) -> Self {
        AnyValue::String(s)
    }
}

impl From<i64> for AnyValue {
    fn from(i: i64) -> Self {
        AnyValue::Int(i)
    }
}

impl From<bool> for AnyValue {
    fn from(b: bool) -> Self {
        AnyValue::Bool(b)
    }
}

impl From<f64> for AnyValue {
    fn from(f: f64) -> Self {
        AnyValue::Double(f)
    }
}

/// Render an entry list as a JSON object, keeping entry order.
pub fn attributes_to_json(entries: &[KeyValue]) -> serde_json::Map<String, serde_json::Value> {
    entries
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.to_json()))
        .collect()
}

/// Build string attributes in the order given.
pub fn string_attributes<'a, I>(pairs: I) -> Vec<KeyValue>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| KeyValue::new(k, AnyValue::String(v)))
        .collect()
}

/// Ordered entry list used while flattening a single record.
///
/// Keys are unique within one list. The only way to record the same key
/// twice is [`AttributeList::push_repeated`], which folds every occurrence
/// into one `Array` value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AttributeList {
    entries: Vec<KeyValue>,
}

impl AttributeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&AnyValue> {
        self.position(key).map(|i| &self.entries[i].value)
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|kv| kv.key == key)
    }

    pub fn push(&mut self, key: impl Into<String>, value: AnyValue) -> Result<(), EncodeError> {
        let key = key.into();
        if self.position(&key).is_some() {
            return Err(EncodeError::Encoding(format!("duplicate key {:?}", key)));
        }
        self.entries.push(KeyValue { key, value });
        Ok(())
    }

    /// Append `value` to the array stored under `key`, creating it on first use.
    pub fn push_repeated(
        &mut self,
        key: impl Into<String>,
        value: AnyValue,
    ) -> Result<(), EncodeError> {
        let key = key.into();
        match self.position(&key) {
            Some(i) => match &mut self.entries[i].value {
                AnyValue::Array(items) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(EncodeError::Encoding(format!(
                    "value of existing key {:?} is not an array",
                    key
                ))),
            },
            None => {
                self.entries.push(KeyValue {
                    key,
                    value: AnyValue::Array(vec![value]),
                });
                Ok(())
            }
        }
    }

    pub fn into_entries(self) -> Vec<KeyValue> {
        self.entries
    }

    pub fn into_value(self) -> AnyValue {
        AnyValue::Map(self.entries)
    }
}
