use std::collections::BTreeMap;

use serde_json::Value;

/// An equality filter over top-level document fields.
///
/// All clauses must match. String comparisons on the `email` field are
/// case-insensitive, matching the unique-index semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: BTreeMap<String, Value>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality clause.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether `doc` satisfies every clause.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            let actual = doc.get(field);
            if field == "email"
                && let (Some(Value::String(a)), Value::String(e)) = (actual, expected)
            {
                return a.to_lowercase() == e.to_lowercase();
            }
            actual == Some(expected)
        })
    }

    pub(crate) fn clauses(&self) -> &BTreeMap<String, Value> {
        &self.clauses
    }
}
