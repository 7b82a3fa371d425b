//! The declarative mapping configuration, loaded from JSON or TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_data_type() -> String {
    "string".to_string()
}

fn default_true() -> bool {
    true
}

/// A named, versioned set of field mappings, custom rules and validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMappingConfiguration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub custom_rules: Vec<CustomMappingRule>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// A field path (`PID-5-1`) or a virtual field name (`MessageType`)
    pub source_field: String,
    pub target_field: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub transform_function: Option<String>,
    #[serde(default)]
    pub validation_pattern: Option<String>,
    /// All must hold for the mapping to apply.
    #[serde(default)]
    pub conditions: Vec<MappingCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingCondition {
    /// A context key, a field path or a virtual field name
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "eq", alias = "==")]
    Equals,
    #[serde(alias = "ne", alias = "!=")]
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    #[serde(alias = "matches")]
    Regex,
    #[serde(alias = "gt", alias = ">")]
    GreaterThan,
    #[serde(alias = "ge", alias = ">=")]
    GreaterThanOrEqual,
    #[serde(alias = "lt", alias = "<")]
    LessThan,
    #[serde(alias = "le", alias = "<=")]
    LessThanOrEqual,
    /// Value is a comma separated list
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMappingRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Output fields for transforms, input fields for built-ins
    #[serde(default)]
    pub applies_to: Vec<String>,
    pub rule_type: RuleType,
    pub expression: String,
    #[serde(default)]
    pub target_field: Option<String>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    FieldTransform,
    CalculatedField,
    ConditionalMapping,
    DataValidation,
    BuiltIn,
    #[serde(other)]
    Unknown,
}

/// A post-mapping check on the output record. Failures are warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    /// Target key in the output record
    pub field: String,
    pub rule: ValidationKind,
    #[serde(default)]
    pub parameter: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Required,
    Pattern,
    MinLength,
    MaxLength,
    AllowedValues,
}

impl FieldMappingConfiguration {
    pub fn new(name: impl Into<String>) -> FieldMappingConfiguration {
        FieldMappingConfiguration {
            name: name.into(),
            version: default_version(),
            description: None,
            field_mappings: Vec::new(),
            custom_rules: Vec::new(),
            validation_rules: Vec::new(),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a configuration file, TOML for a `.toml` extension and JSON otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml_str(&text)
        } else {
            Self::from_json_str(&text)
        }
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Runs every check [`TransformationEngine::new`](super::TransformationEngine::new) does.
    pub fn validate(&self) -> Result<(), ConfigError> {
        super::engine::compile(self).map(|_| ())
    }

    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.field_mappings.push(mapping);
        self
    }

    pub fn with_rule(mut self, rule: CustomMappingRule) -> Self {
        self.custom_rules.push(rule);
        self
    }

    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }
}

impl FieldMapping {
    /// A plain string mapping with every option off.
    pub fn new(source_field: impl Into<String>, target_field: impl Into<String>) -> FieldMapping {
        FieldMapping {
            source_field: source_field.into(),
            target_field: target_field.into(),
            data_type: default_data_type(),
            required: false,
            default_value: None,
            transform_function: None,
            validation_pattern: None,
            conditions: Vec::new(),
        }
    }

    pub fn data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn transform(mut self, function: impl Into<String>) -> Self {
        self.transform_function = Some(function.into());
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.validation_pattern = Some(pattern.into());
        self
    }

    pub fn when(mut self, field: impl Into<String>, operator: ConditionOperator, value: impl Into<String>) -> Self {
        self.conditions.push(MappingCondition {
            field: field.into(),
            operator,
            value: value.into(),
        });
        self
    }
}

impl CustomMappingRule {
    pub fn new(name: impl Into<String>, rule_type: RuleType, expression: impl Into<String>) -> CustomMappingRule {
        CustomMappingRule {
            name: name.into(),
            description: None,
            applies_to: Vec::new(),
            rule_type,
            expression: expression.into(),
            target_field: None,
            priority: 0,
            active: true,
        }
    }

    pub fn applies_to<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.applies_to = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn target(mut self, field: impl Into<String>) -> Self {
        self.target_field = Some(field.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
