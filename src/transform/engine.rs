use futures::stream::{Stream, StreamExt};
use log::{debug, warn};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use super::config::{
    ConditionOperator, FieldMapping, FieldMappingConfiguration, MappingCondition, ValidationKind, ValidationRule,
};
use super::functions::{coerce, DataType, TransformFunction};
use super::path::SourceField;
use super::rules::{Clock, CompiledRule, RuleEngine, SystemClock, TransformContext};
use super::value::{MappedRecord, MappedValue};
use crate::error::{ConfigError, TransformError};
use crate::hl7::{parse_message, Hl7Message};

struct CompiledCondition {
    field: String,
    source: Option<SourceField>,
    condition: MappingCondition,
    regex: Option<Regex>,
}

impl CompiledCondition {
    /// Context values shadow message fields.
    fn holds(&self, message: &Hl7Message, context: &TransformContext) -> bool {
        let actual = match context.get(&self.field) {
            Some(value) => value.to_string(),
            None => self
                .source
                .as_ref()
                .and_then(|s| s.resolve(message))
                .unwrap_or_default(),
        };
        self.condition
            .operator
            .evaluate(&actual, &self.condition.value, self.regex.as_ref())
    }
}

struct CompiledMapping {
    source: SourceField,
    target: String,
    data_type: DataType,
    required: bool,
    default_value: Option<String>,
    function: Option<TransformFunction>,
    pattern: Option<Regex>,
    conditions: Vec<CompiledCondition>,
}

struct CompiledValidation {
    rule: ValidationRule,
    pattern: Option<Regex>,
    length: Option<usize>,
}

pub(crate) struct Compiled {
    mappings: Vec<CompiledMapping>,
    rules: Vec<CompiledRule>,
    validations: Vec<CompiledValidation>,
}

fn compile_pattern(context: String, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        context,
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_mapping(mapping: &FieldMapping) -> Result<CompiledMapping, ConfigError> {
    if mapping.target_field.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "mapping of '{}' has no target field",
            mapping.source_field
        )));
    }
    let source: SourceField = mapping.source_field.parse().map_err(|e| {
        ConfigError::Invalid(format!("source field '{}': {}", mapping.source_field, e))
    })?;

    let data_type = DataType::from_name(&mapping.data_type).unwrap_or_else(|| {
        warn!(
            "Unknown data type '{}' for '{}', values pass through as text",
            mapping.data_type, mapping.target_field
        );
        DataType::Text
    });

    let function = mapping.transform_function.as_deref().and_then(|name| {
        let function = TransformFunction::from_name(name);
        if function.is_none() {
            warn!(
                "Unknown transform function '{}' for '{}', values pass through unchanged",
                name, mapping.target_field
            );
        }
        function
    });

    let pattern = mapping
        .validation_pattern
        .as_deref()
        .map(|p| compile_pattern(format!("mapping '{}'", mapping.target_field), p))
        .transpose()?;

    let conditions = mapping
        .conditions
        .iter()
        .map(|condition| -> Result<CompiledCondition, ConfigError> {
            let regex = match condition.operator {
                ConditionOperator::Regex => Some(compile_pattern(
                    format!("condition on '{}'", condition.field),
                    &condition.value,
                )?),
                _ => None,
            };
            Ok(CompiledCondition {
                field: condition.field.clone(),
                source: condition.field.parse().ok(),
                condition: condition.clone(),
                regex,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledMapping {
        source,
        target: mapping.target_field.clone(),
        data_type,
        required: mapping.required,
        default_value: mapping.default_value.clone(),
        function,
        pattern,
        conditions,
    })
}

fn compile_validation(rule: &ValidationRule) -> Result<CompiledValidation, ConfigError> {
    let parameter = || {
        rule.parameter
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid(format!("validation rule '{}' needs a parameter", rule.name)))
    };

    let (pattern, length) = match rule.rule {
        ValidationKind::Required => (None, None),
        ValidationKind::Pattern => (
            Some(compile_pattern(format!("validation rule '{}'", rule.name), parameter()?)?),
            None,
        ),
        ValidationKind::MinLength | ValidationKind::MaxLength => {
            let length = parameter()?.trim().parse::<usize>().map_err(|_| {
                ConfigError::Invalid(format!("validation rule '{}' needs a numeric length", rule.name))
            })?;
            (None, Some(length))
        }
        ValidationKind::AllowedValues => {
            parameter()?;
            (None, None)
        }
    };

    Ok(CompiledValidation {
        rule: rule.clone(),
        pattern,
        length,
    })
}

/// Validates a configuration into its executable form.
pub(crate) fn compile(config: &FieldMappingConfiguration) -> Result<Compiled, ConfigError> {
    if config.name.trim().is_empty() {
        return Err(ConfigError::Invalid("configuration has no name".to_string()));
    }

    let mut seen = HashSet::new();
    let mut mappings = Vec::with_capacity(config.field_mappings.len());
    for mapping in &config.field_mappings {
        let compiled = compile_mapping(mapping)?;
        if !seen.insert(compiled.source.clone()) {
            return Err(ConfigError::DuplicateSourceField(mapping.source_field.clone()));
        }
        mappings.push(compiled);
    }

    Ok(Compiled {
        mappings,
        rules: RuleEngine::compile(&config.custom_rules),
        validations: config
            .validation_rules
            .iter()
            .map(compile_validation)
            .collect::<Result<_, _>>()?,
    })
}

/// The result of transforming one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutcome {
    pub record: MappedRecord,
    /// Skipped mappings, failed rules and failed validations, in the order they happened
    pub warnings: Vec<String>,
}

/// Applies a validated [`FieldMappingConfiguration`] to parsed messages.
///
/// Construction rejects an invalid configuration; after that, transformation never fails
/// on message content. Problems become warnings and the record carries whatever could be mapped.
///
/// ```
/// use hl7_processor::transform::{FieldMapping, FieldMappingConfiguration, TransformationEngine};
///
/// let config = FieldMappingConfiguration::new("demo")
///     .with_mapping(FieldMapping::new("PID-5-1", "family_name"))
///     .with_mapping(FieldMapping::new("PID-5-2", "given_name").transform("uppercase"));
/// let engine = TransformationEngine::new(config).unwrap();
///
/// let record = engine
///     .transform_raw("MSH|^~\\&|A|B|C|D|20230101||ADT^A01|1|P|2.5\rPID|1||123||Doe^John")
///     .unwrap()
///     .record;
/// assert_eq!(record.text("family_name"), "Doe");
/// assert_eq!(record.text("given_name"), "JOHN");
/// ```
pub struct TransformationEngine {
    config: FieldMappingConfiguration,
    mappings: Vec<CompiledMapping>,
    rules: RuleEngine,
    validations: Vec<CompiledValidation>,
}

impl TransformationEngine {
    pub fn new(config: FieldMappingConfiguration) -> Result<TransformationEngine, ConfigError> {
        let compiled = compile(&config)?;
        debug!(
            "Compiled mapping '{}' v{}: {} mappings, {} rules, {} validations",
            config.name,
            config.version,
            compiled.mappings.len(),
            compiled.rules.len(),
            compiled.validations.len()
        );
        Ok(TransformationEngine {
            config,
            mappings: compiled.mappings,
            rules: RuleEngine::new(compiled.rules, Arc::new(SystemClock)),
            validations: compiled.validations,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.rules = self.rules.with_clock(clock);
        self
    }

    pub fn configuration(&self) -> &FieldMappingConfiguration {
        &self.config
    }

    pub fn transform(&self, message: &Hl7Message, context: &TransformContext) -> TransformOutcome {
        let mut record = MappedRecord::new();
        let mut warnings = Vec::new();

        for mapping in &self.mappings {
            self.apply_mapping(mapping, message, context, &mut record, &mut warnings);
        }
        self.rules.apply(&mut record, &mut warnings);
        for validation in &self.validations {
            if let Some(problem) = validate(validation, &record) {
                warn!("{}", problem);
                warnings.push(problem);
            }
        }

        debug!(
            "Transformed message {} into {} fields with {} warnings",
            message.id,
            record.len(),
            warnings.len()
        );
        TransformOutcome { record, warnings }
    }

    /// [`transform`](Self::transform) with an empty context, returning only the record.
    pub fn transform_message(&self, message: &Hl7Message) -> MappedRecord {
        self.transform(message, &TransformContext::default()).record
    }

    /// Parses and transforms raw text; fails only when the text has no usable header.
    pub fn transform_raw(&self, raw: &str) -> Result<TransformOutcome, TransformError> {
        let message = parse_message(raw);
        if message.header.is_none() {
            return Err(TransformError::MalformedMessage(
                message
                    .validation_errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "no MSH header".to_string()),
            ));
        }
        Ok(self.transform(&message, &TransformContext::default()))
    }

    /// One record per input, index aligned; a message that cannot be transformed yields an empty record.
    pub fn transform_messages<S: AsRef<str>>(&self, messages: &[S]) -> Vec<MappedRecord> {
        messages
            .iter()
            .enumerate()
            .map(|(index, raw)| self.transform_or_empty(index, raw.as_ref()))
            .collect()
    }

    /// Streaming form of [`transform_messages`](Self::transform_messages).
    pub fn transform_stream<'a, S>(&'a self, messages: S) -> impl Stream<Item = MappedRecord> + 'a
    where
        S: Stream<Item = String> + 'a,
    {
        messages
            .enumerate()
            .map(move |(index, raw)| self.transform_or_empty(index, &raw))
    }

    pub fn transform_to_json(&self, message: &Hl7Message) -> serde_json::Value {
        self.transform_message(message).to_json()
    }

    fn transform_or_empty(&self, index: usize, raw: &str) -> MappedRecord {
        match self.transform_raw(raw) {
            Ok(outcome) => outcome.record,
            Err(e) => {
                warn!("Message {} could not be transformed: {}", index, e);
                MappedRecord::new()
            }
        }
    }

    fn apply_mapping(
        &self,
        mapping: &CompiledMapping,
        message: &Hl7Message,
        context: &TransformContext,
        record: &mut MappedRecord,
        warnings: &mut Vec<String>,
    ) {
        if !mapping.conditions.iter().all(|c| c.holds(message, context)) {
            debug!("Conditions for '{}' not met", mapping.target);
            return;
        }

        let mut value = mapping.source.resolve(message).unwrap_or_default();
        if value.trim().is_empty() {
            if let Some(default) = &mapping.default_value {
                value = default.clone();
            }
        }

        if value.trim().is_empty() {
            if mapping.required {
                let problem = format!("Required field {} is missing for '{}'", mapping.source, mapping.target);
                warn!("{}", problem);
                warnings.push(problem);
            } else {
                record.insert(mapping.target.clone(), value);
            }
            return;
        }

        if let Some(function) = mapping.function {
            value = function.apply(&value, &message.delimiters);
        }

        if let Some(pattern) = &mapping.pattern {
            if !pattern.is_match(&value) {
                let problem = format!(
                    "Value '{}' for '{}' does not match pattern '{}'",
                    value,
                    mapping.target,
                    pattern.as_str()
                );
                warn!("{}", problem);
                warnings.push(problem);
                return;
            }
        }

        let typed = match coerce(&value, mapping.data_type) {
            Ok(typed) => typed,
            Err(reason) => {
                let problem = format!("{} for '{}', kept as text", reason, mapping.target);
                warn!("{}", problem);
                warnings.push(problem);
                MappedValue::Text(value)
            }
        };
        record.insert(mapping.target.clone(), typed);
    }
}

fn validate(validation: &CompiledValidation, record: &MappedRecord) -> Option<String> {
    let rule = &validation.rule;
    let value = record.text(&rule.field);
    let present = !value.trim().is_empty();

    let passed = match rule.rule {
        ValidationKind::Required => present,
        _ if !present => true,
        ValidationKind::Pattern => validation
            .pattern
            .as_ref()
            .map_or(true, |p| p.is_match(&value)),
        ValidationKind::MinLength => validation
            .length
            .map_or(true, |min| value.chars().count() >= min),
        ValidationKind::MaxLength => validation
            .length
            .map_or(true, |max| value.chars().count() <= max),
        ValidationKind::AllowedValues => rule
            .parameter
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .any(|allowed| allowed.trim() == value.trim()),
    };

    if passed {
        return None;
    }
    Some(rule.message.clone().unwrap_or_else(|| {
        format!("Validation '{}' failed for '{}'", rule.name, rule.field)
    }))
}
