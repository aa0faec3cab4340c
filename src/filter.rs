//! Event type inclusion filter, validated before a stream is subscribed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Event type names known to the source, mapped to their numeric codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeRegistry {
    names: BTreeMap<String, i32>,
}

impl Default for TypeRegistry {
    /// Monitor message types of a Hubble flow stream.
    fn default() -> Self {
        Self::from_pairs([
            ("drop", 1),
            ("debug", 2),
            ("capture", 3),
            ("trace", 4),
            ("policy-verdict", 5),
            ("recorder", 6),
            ("trace-sock", 7),
            ("l7", 129),
            ("agent", 130),
        ])
    }
}

impl TypeRegistry {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        Self {
            names: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn code(&self, name: &str) -> Option<i32> {
        self.names.get(name).copied()
    }
}

/// Matches events whose type code equals `code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventTypeFilter {
    pub code: i32,
}

/// Allow-list of event type names; `*` or `all` alone accepts everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncludeTypes(pub Vec<String>);

impl IncludeTypes {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }

    pub fn validate(&self, registry: &TypeRegistry) -> Result<(), ValidationError> {
        for t in &self.0 {
            if registry.code(t).is_some() {
                continue;
            }
            match t.as_str() {
                "" => return Err(ValidationError::new("type filter cannot be an empty string")),
                "*" | "all" => {
                    if self.0.len() != 1 {
                        return Err(ValidationError::new(format!(
                            "type filter {:?} can only be specified on its own",
                            t
                        )));
                    }
                }
                _ => return Err(ValidationError::new(format!("unknown type filter {:?}", t))),
            }
        }
        Ok(())
    }

    pub fn matches_all(&self) -> bool {
        matches!(self.0.as_slice(), [only] if only == "*" || only == "all")
    }

    /// Filters to send upstream; empty means an unfiltered stream.
    pub fn make_filters(&self, registry: &TypeRegistry) -> Vec<EventTypeFilter> {
        if self.matches_all() {
            return Vec::new();
        }
        self.0
            .iter()
            .filter_map(|t| registry.code(t))
            .map(|code| EventTypeFilter { code })
            .collect()
    }
}

/// Stream request handed to an event source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub follow: bool,
    pub filters: Vec<EventTypeFilter>,
}

impl Subscription {
    pub fn new(filters: Vec<EventTypeFilter>) -> Self {
        Self {
            follow: true,
            filters,
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches(&self, code: i32) -> bool {
        self.is_unfiltered() || self.filters.iter().any(|f| f.code == code)
    }
}
