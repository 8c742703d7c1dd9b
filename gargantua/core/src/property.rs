//! Typed provider properties.
//!
//! Providers declare the configuration they accept and the machine information they report as a
//! map of named properties. Every value is carried as a string: scalars verbatim, arrays as a JSON
//! array, and maps as a JSON object. A property's data type determines how each element is parsed
//! and which validation rules apply.
//!
//! Data and value types are serialized in lowercase (`"string"`, `"scalar"`, ...).

use crate::field_error::FieldErrors;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "dataType", rename_all = "lowercase")]
pub enum Property {
    String(PropertyDef<StringValidation>),
    Integer(PropertyDef<IntegerValidation>),
    Float(PropertyDef<FloatValidation>),
    Boolean(PropertyDef<BooleanValidation>),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Scalar,
    Array,
    Map,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(bound = "V: JsonSchema + Default + Serialize")]
pub struct PropertyDef<V> {
    #[serde(default)]
    pub value_type: ValueType,

    #[serde(default)]
    pub required: bool,

    pub default: Option<String>,

    /// Array elements must be distinct.
    #[serde(default)]
    pub unique_items: bool,

    pub display_name: Option<String>,

    #[serde(default)]
    pub validation: V,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StringValidation {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    #[serde(rename = "enum")]
    pub enumeration: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntegerValidation {
    pub minimum: Option<i64>,
    pub maximum: Option<i64>,
    #[serde(rename = "enum")]
    pub enumeration: Option<Vec<i64>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FloatValidation {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct BooleanValidation {}

/// Parses and checks the elements of a single data type.
pub trait Validate {
    type Value: PartialEq + fmt::Debug;

    fn parse(&self, raw: &str) -> Result<Self::Value, String>;

    fn check(&self, value: &Self::Value) -> Result<(), String>;

    /// Reports inconsistencies in the validation rules themselves.
    fn check_definition(&self) -> Result<(), String> {
        Ok(())
    }
}

// === impl Property ===

impl Property {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(def) => def.value_type,
            Self::Integer(def) => def.value_type,
            Self::Float(def) => def.value_type,
            Self::Boolean(def) => def.value_type,
        }
    }

    pub fn required(&self) -> bool {
        match self {
            Self::String(def) => def.required,
            Self::Integer(def) => def.required,
            Self::Float(def) => def.required,
            Self::Boolean(def) => def.required,
        }
    }

    /// Validates a string-encoded value for this property, recording errors against `field`.
    pub fn validate(&self, field: &str, raw: Option<&str>, errors: &mut FieldErrors) {
        match self {
            Self::String(def) => def.validate(field, raw, errors),
            Self::Integer(def) => def.validate(field, raw, errors),
            Self::Float(def) => def.validate(field, raw, errors),
            Self::Boolean(def) => def.validate(field, raw, errors),
        }
    }

    /// Validates the property declaration itself.
    pub fn validate_definition(&self, field: &str, errors: &mut FieldErrors) {
        match self {
            Self::String(def) => def.validate_definition(field, errors),
            Self::Integer(def) => def.validate_definition(field, errors),
            Self::Float(def) => def.validate_definition(field, errors),
            Self::Boolean(def) => def.validate_definition(field, errors),
        }
    }
}

/// Validates a configuration map against a set of declared properties.
///
/// Every required property without a default must be set, every set value must satisfy its
/// property, and keys that are not declared are rejected.
pub fn validate_configuration(
    field: &str,
    properties: &BTreeMap<String, Property>,
    values: &BTreeMap<String, String>,
    errors: &mut FieldErrors,
) {
    for (name, property) in properties {
        let field = format!("{field}.{name}");
        property.validate(&field, values.get(name).map(String::as_str), errors);
    }
    for name in values.keys() {
        if !properties.contains_key(name) {
            errors.push(format!("{field}.{name}"), "unknown property");
        }
    }
}

// === impl PropertyDef ===

impl<V: Validate> PropertyDef<V> {
    fn validate(&self, field: &str, raw: Option<&str>, errors: &mut FieldErrors) {
        let raw = match raw.or(self.default.as_deref()) {
            Some(raw) => raw,
            None if self.required => {
                errors.push(field, "required value is missing");
                return;
            }
            None => return,
        };

        let elements = match split(self.value_type, raw) {
            Ok(elements) => elements,
            Err(error) => {
                errors.push(field, error);
                return;
            }
        };

        let mut seen = Vec::with_capacity(elements.len());
        for (key, element) in elements {
            let field = match key {
                Some(key) => format!("{field}[{key}]"),
                None => field.to_string(),
            };
            match self.validation.parse(&element) {
                Ok(value) => {
                    if let Err(error) = self.validation.check(&value) {
                        errors.push(&field, error);
                    }
                    if self.unique_items && self.value_type == ValueType::Array {
                        if seen.contains(&value) {
                            errors.push(&field, "duplicate item");
                        }
                        seen.push(value);
                    }
                }
                Err(error) => errors.push(&field, error),
            }
        }
    }

    fn validate_definition(&self, field: &str, errors: &mut FieldErrors) {
        if let Err(error) = self.validation.check_definition() {
            errors.push(format!("{field}.validation"), error);
        }
        if let Some(default) = self.default.as_deref() {
            let mut default_errors = FieldErrors::default();
            self.validate(&format!("{field}.default"), Some(default), &mut default_errors);
            errors.extend(default_errors);
        }
    }
}

/// Splits a string-encoded value into its elements. Array elements are keyed by index and map
/// elements by key.
fn split(value_type: ValueType, raw: &str) -> Result<Vec<(Option<String>, String)>, String> {
    fn element(value: serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }
    }

    match value_type {
        ValueType::Scalar => Ok(vec![(None, raw.to_string())]),
        ValueType::Array => {
            let items = serde_json::from_str::<Vec<serde_json::Value>>(raw)
                .map_err(|error| format!("expected a JSON array: {error}"))?;
            Ok(items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Some(i.to_string()), element(v)))
                .collect())
        }
        ValueType::Map => {
            let items = serde_json::from_str::<BTreeMap<String, serde_json::Value>>(raw)
                .map_err(|error| format!("expected a JSON object: {error}"))?;
            Ok(items
                .into_iter()
                .map(|(k, v)| (Some(k), element(v)))
                .collect())
        }
    }
}

// === impl StringValidation ===

impl Validate for StringValidation {
    type Value = String;

    fn parse(&self, raw: &str) -> Result<String, String> {
        Ok(raw.to_string())
    }

    fn check(&self, value: &String) -> Result<(), String> {
        let len = value.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                return Err(format!("must be at least {min} characters"));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(format!("must be at most {max} characters"));
            }
        }
        if let Some(pattern) = self.pattern.as_deref() {
            let re = Regex::new(pattern).map_err(|error| error.to_string())?;
            if !re.is_match(value) {
                return Err(format!("must match {pattern}"));
            }
        }
        if let Some(allowed) = self.enumeration.as_ref() {
            if !allowed.contains(value) {
                return Err(format!("must be one of {}", allowed.join(", ")));
            }
        }
        Ok(())
    }

    fn check_definition(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(format!("minLength {min} exceeds maxLength {max}"));
            }
        }
        if let Some(pattern) = self.pattern.as_deref() {
            Regex::new(pattern).map_err(|error| format!("invalid pattern: {error}"))?;
        }
        Ok(())
    }
}

// === impl IntegerValidation ===

impl Validate for IntegerValidation {
    type Value = i64;

    fn parse(&self, raw: &str) -> Result<i64, String> {
        raw.trim()
            .parse()
            .map_err(|_| format!("{raw:?} is not an integer"))
    }

    fn check(&self, value: &i64) -> Result<(), String> {
        if let Some(min) = self.minimum {
            if *value < min {
                return Err(format!("must be at least {min}"));
            }
        }
        if let Some(max) = self.maximum {
            if *value > max {
                return Err(format!("must be at most {max}"));
            }
        }
        if let Some(allowed) = self.enumeration.as_ref() {
            if !allowed.contains(value) {
                return Err(format!("must be one of {allowed:?}"));
            }
        }
        Ok(())
    }

    fn check_definition(&self) -> Result<(), String> {
        match (self.minimum, self.maximum) {
            (Some(min), Some(max)) if min > max => {
                Err(format!("minimum {min} exceeds maximum {max}"))
            }
            _ => Ok(()),
        }
    }
}

// === impl FloatValidation ===

impl Validate for FloatValidation {
    type Value = f64;

    fn parse(&self, raw: &str) -> Result<f64, String> {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("{raw:?} is not a number"))
    }

    fn check(&self, value: &f64) -> Result<(), String> {
        if let Some(min) = self.minimum {
            if *value < min {
                return Err(format!("must be at least {min}"));
            }
        }
        if let Some(max) = self.maximum {
            if *value > max {
                return Err(format!("must be at most {max}"));
            }
        }
        Ok(())
    }

    fn check_definition(&self) -> Result<(), String> {
        match (self.minimum, self.maximum) {
            (Some(min), Some(max)) if min > max => {
                Err(format!("minimum {min} exceeds maximum {max}"))
            }
            _ => Ok(()),
        }
    }
}

// === impl BooleanValidation ===

impl Validate for BooleanValidation {
    type Value = bool;

    fn parse(&self, raw: &str) -> Result<bool, String> {
        match raw.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(format!("{raw:?} is not a boolean")),
        }
    }

    fn check(&self, _: &bool) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn messages(errors: FieldErrors) -> Vec<String> {
        errors.into_iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn deserializes_lowercase_tags() {
        let property: Property = serde_json::from_value(serde_json::json!({
            "dataType": "integer",
            "valueType": "array",
            "required": true,
            "uniqueItems": true,
            "validation": { "minimum": 1, "maximum": 8 },
        }))
        .unwrap();
        assert_eq!(
            property,
            Property::Integer(PropertyDef {
                value_type: ValueType::Array,
                required: true,
                unique_items: true,
                validation: IntegerValidation {
                    minimum: Some(1),
                    maximum: Some(8),
                    enumeration: None,
                },
                ..Default::default()
            })
        );
    }

    #[test]
    fn validates_scalars() {
        let cpus = Property::Integer(PropertyDef {
            required: true,
            validation: IntegerValidation {
                minimum: Some(1),
                maximum: Some(8),
                ..Default::default()
            },
            ..Default::default()
        });

        let mut errors = FieldErrors::default();
        cpus.validate("spec.cpus", Some("4"), &mut errors);
        assert!(errors.is_empty());

        cpus.validate("spec.cpus", Some("16"), &mut errors);
        cpus.validate("spec.cpus", Some("four"), &mut errors);
        cpus.validate("spec.cpus", None, &mut errors);
        assert_eq!(
            messages(errors),
            vec![
                "spec.cpus: must be at most 8",
                "spec.cpus: \"four\" is not an integer",
                "spec.cpus: required value is missing",
            ]
        );
    }

    #[test]
    fn defaults_satisfy_required() {
        let image = Property::String(PropertyDef {
            required: true,
            default: Some("ubuntu".to_string()),
            ..Default::default()
        });
        let mut errors = FieldErrors::default();
        image.validate("image", None, &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn validates_arrays_and_maps() {
        let zones = Property::String(PropertyDef {
            value_type: ValueType::Array,
            unique_items: true,
            validation: StringValidation {
                enumeration: Some(vec!["a".to_string(), "b".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut errors = FieldErrors::default();
        zones.validate("zones", Some(r#"["a","c","a"]"#), &mut errors);
        assert_eq!(
            messages(errors),
            vec!["zones[1]: must be one of a, b", "zones[2]: duplicate item"]
        );

        let weights = Property::Float(PropertyDef {
            value_type: ValueType::Map,
            validation: FloatValidation {
                minimum: Some(0.0),
                maximum: Some(1.0),
            },
            ..Default::default()
        });
        let mut errors = FieldErrors::default();
        weights.validate("weights", Some(r#"{"x": 0.5, "y": 1.5}"#), &mut errors);
        assert_eq!(messages(errors), vec!["weights[y]: must be at most 1"]);

        let mut errors = FieldErrors::default();
        weights.validate("weights", Some("[1]"), &mut errors);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn validates_definitions() {
        let bad = Property::String(PropertyDef {
            default: Some("x".to_string()),
            validation: StringValidation {
                min_length: Some(3),
                max_length: Some(2),
                pattern: Some("(".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut errors = FieldErrors::default();
        bad.validate_definition("spec.providerConfiguration.name", &mut errors);
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| e.field.starts_with("spec.providerConfiguration.name")));
    }

    #[test]
    fn rejects_unknown_configuration() {
        let properties = btreemap! {
            "region".to_string() => Property::String(PropertyDef {
                required: true,
                ..Default::default()
            }),
            "spot".to_string() => Property::Boolean(PropertyDef::default()),
        };
        let values = btreemap! {
            "spot".to_string() => "yes".to_string(),
            "flavor".to_string() => "large".to_string(),
        };
        let mut errors = FieldErrors::default();
        validate_configuration("spec.providerConfiguration", &properties, &values, &mut errors);
        assert_eq!(
            messages(errors),
            vec![
                "spec.providerConfiguration.region: required value is missing",
                "spec.providerConfiguration.spot: \"yes\" is not a boolean",
                "spec.providerConfiguration.flavor: unknown property",
            ]
        );
    }
}
