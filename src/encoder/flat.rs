use super::{label_entries, parse_header, scalar_value, Builder, EncodeError, Policy};
use crate::record::{Field, FieldValue};
use crate::value::AttributeList;

/// Inlines sub-records into one list keyed by `parent<sep>field` paths;
/// items of sub-record lists add their index to the path.
pub struct FlatBuilder {
    policy: Policy,
}

impl FlatBuilder {
    pub(crate) fn new(policy: Policy) -> Self {
        Self { policy }
    }
}

impl Builder for FlatBuilder {
    fn leaf(
        &self,
        out: &mut AttributeList,
        key_path: &str,
        field: &Field<'_>,
    ) -> Result<(), EncodeError> {
        // labels become siblings of the label field, not children
        if self.policy.is_label_map(field) {
            for (key, value) in label_entries(field)? {
                out.push(self.policy.key_path(key_path, &key), value)?;
            }
            return Ok(());
        }

        let path = self.policy.key_path(key_path, field.name());
        match field.value() {
            FieldValue::Record(sub) => self.visit(out, &path, sub.as_ref()),
            FieldValue::RecordList(items) if self.policy.is_header_list(field) => {
                for item in items {
                    let (name, value) = parse_header(item.as_ref())?;
                    out.push_repeated(self.policy.key_path(&path, &name), value)?;
                }
                Ok(())
            }
            FieldValue::RecordList(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = self.policy.key_path(&path, &i.to_string());
                    self.visit(out, &item_path, item.as_ref())?;
                }
                Ok(())
            }
            FieldValue::Scalar(_) | FieldValue::ScalarList(_) => match scalar_value(field) {
                Some(value) => out.push(path, value),
                None => Ok(()),
            },
        }
    }
}
