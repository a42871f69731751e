//! Per-endpoint request schema types.
//!
//! A schema maps body paths (`$.user.email`) to field descriptors. The
//! walker that applies a schema to a parsed request lives in the gateway
//! crate; these types only describe the rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    Email,
    Url,
    Date,
    Datetime,
    Uuid,
}

/// Descriptor for one field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Minimum: string length, numeric value, or array length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FieldFormat>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_items: Option<Box<FieldRule>>,
    /// Field-name-keyed rules for object values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_schema: Option<BTreeMap<String, FieldRule>>,
}

impl FieldRule {
    #[must_use]
    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            min: None,
            max: None,
            pattern: None,
            format: None,
            allowed: None,
            array_items: None,
            nested_schema: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// The stored schema for one endpoint, keyed by `endpoint_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSchema {
    pub endpoint_id: String,
    /// `$.path -> rule`.
    #[serde(default)]
    pub validation_schema: BTreeMap<String, FieldRule>,
}
