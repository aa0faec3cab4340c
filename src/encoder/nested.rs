use super::{label_entries, parse_header, scalar_value, Builder, EncodeError, Policy};
use crate::record::{Field, FieldValue};
use crate::value::{AnyValue, AttributeList};

/// Keeps the record shape: sub-records become maps, sub-record lists become
/// arrays of maps.
pub struct NestedBuilder {
    policy: Policy,
}

impl NestedBuilder {
    pub(crate) fn new(policy: Policy) -> Self {
        Self { policy }
    }
}

impl Builder for NestedBuilder {
    fn leaf(
        &self,
        out: &mut AttributeList,
        _key_path: &str,
        field: &Field<'_>,
    ) -> Result<(), EncodeError> {
        if self.policy.is_label_map(field) {
            for (key, value) in label_entries(field)? {
                out.push(key, value)?;
            }
            return Ok(());
        }

        let value = match field.value() {
            FieldValue::Record(sub) => {
                let mut inner = AttributeList::new();
                self.visit(&mut inner, "", sub.as_ref())?;
                inner.into_value()
            }
            FieldValue::RecordList(items) if self.policy.is_header_list(field) => {
                let mut headers = AttributeList::new();
                for item in items {
                    let (name, value) = parse_header(item.as_ref())?;
                    headers.push_repeated(name, value)?;
                }
                headers.into_value()
            }
            FieldValue::RecordList(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let mut inner = AttributeList::new();
                    self.visit(&mut inner, "", item.as_ref())?;
                    values.push(inner.into_value());
                }
                AnyValue::Array(values)
            }
            FieldValue::Scalar(_) | FieldValue::ScalarList(_) => match scalar_value(field) {
                Some(value) => value,
                None => return Ok(()),
            },
        };
        out.push(field.name(), value)
    }
}
