//! Custom rules applied to a mapped record after field mapping.

use chrono::{Datelike, NaiveDate, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::config::{CustomMappingRule, RuleType};
use super::expression::{Bindings, Comparison, ConditionalAssignment, ExpressionError, ValueExpr};
use super::functions;
use super::value::{MappedRecord, MappedValue};

/// Source of "today" for age calculation.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// A clock pinned to one date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Caller supplied values visible to mapping conditions.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    values: HashMap<String, String>,
}

impl TransformContext {
    pub fn new() -> TransformContext {
        TransformContext::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltInRule {
    ConcatenateName,
    CalculateAge,
    FormatPhone,
    NormalizeGender,
}

const GIVEN_NAME_KEYS: &[&str] = &["first_name", "firstName", "given_name", "givenName"];
const MIDDLE_NAME_KEYS: &[&str] = &["middle_name", "middleName"];
const FAMILY_NAME_KEYS: &[&str] = &["last_name", "lastName", "family_name", "familyName"];
const BIRTH_DATE_KEYS: &[&str] = &["birth_date", "birthDate", "date_of_birth", "dateOfBirth", "dob"];
const PHONE_KEYS: &[&str] = &["phone", "phone_number", "phoneNumber", "home_phone"];
const GENDER_KEYS: &[&str] = &["gender", "sex"];

impl BuiltInRule {
    pub fn from_name(name: &str) -> Option<BuiltInRule> {
        match name.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "concatenate_name" | "concat_name" | "full_name" => Some(BuiltInRule::ConcatenateName),
            "calculate_age" | "age" => Some(BuiltInRule::CalculateAge),
            "format_phone" | "phone" => Some(BuiltInRule::FormatPhone),
            "normalize_gender" | "gender" => Some(BuiltInRule::NormalizeGender),
            _ => None,
        }
    }

    fn default_output(&self) -> Option<&'static str> {
        match self {
            BuiltInRule::ConcatenateName => Some("full_name"),
            BuiltInRule::CalculateAge => Some("age"),
            BuiltInRule::FormatPhone | BuiltInRule::NormalizeGender => None,
        }
    }
}

/// Whole-year age on `today`.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = i64::from(today.year() - birth.year());
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

pub fn normalize_gender(value: &str) -> String {
    match value.trim().to_ascii_uppercase().as_str() {
        "M" | "MALE" => "Male".to_string(),
        "F" | "FEMALE" => "Female".to_string(),
        "O" | "OTHER" => "Other".to_string(),
        "A" | "AMBIGUOUS" => "Ambiguous".to_string(),
        "N" => "Not applicable".to_string(),
        "" | "U" | "UNKNOWN" => "Unknown".to_string(),
        _ => value.to_string(),
    }
}

#[derive(Debug, Clone)]
enum RuleAction {
    Assign(ValueExpr),
    Conditional(ConditionalAssignment),
    Validate(Comparison),
    BuiltIn(BuiltInRule),
    /// Skipped on every run, with the reason it could not be compiled.
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub priority: i32,
    rule_type: RuleType,
    applies_to: Vec<String>,
    target: Option<String>,
    expression: String,
    action: RuleAction,
}

impl CompiledRule {
    /// Never fails: a rule whose expression does not compile is kept as a skipped rule
    /// that reports why on every run.
    pub fn compile(rule: &CustomMappingRule) -> CompiledRule {
        let action = match Self::action(rule) {
            Ok(action) => action,
            Err(reason) => {
                warn!("Rule '{}' will be skipped: {}", rule.name, reason);
                RuleAction::Unsupported(reason)
            }
        };

        CompiledRule {
            name: rule.name.clone(),
            priority: rule.priority,
            rule_type: rule.rule_type.clone(),
            applies_to: rule.applies_to.clone(),
            target: rule.target_field.clone(),
            expression: rule.expression.clone(),
            action,
        }
    }

    fn action(rule: &CustomMappingRule) -> Result<RuleAction, String> {
        let invalid = |e: ExpressionError| format!("invalid expression '{}': {}", rule.expression, e.0);

        Ok(match rule.rule_type {
            RuleType::FieldTransform | RuleType::CalculatedField => {
                if rule.target_field.is_none() && rule.applies_to.is_empty() {
                    return Err("rule has neither target_field nor applies_to".to_string());
                }
                RuleAction::Assign(ValueExpr::parse(&rule.expression).map_err(invalid)?)
            }
            RuleType::ConditionalMapping => {
                RuleAction::Conditional(ConditionalAssignment::parse(&rule.expression).map_err(invalid)?)
            }
            RuleType::DataValidation => RuleAction::Validate(Comparison::parse(&rule.expression).map_err(invalid)?),
            RuleType::BuiltIn => RuleAction::BuiltIn(
                BuiltInRule::from_name(&rule.expression)
                    .ok_or_else(|| format!("unknown built-in '{}'", rule.expression))?,
            ),
            RuleType::Unknown => return Err("unsupported rule type".to_string()),
        })
    }

    pub fn rule_type(&self) -> &RuleType {
        &self.rule_type
    }

    fn apply(&self, record: &mut MappedRecord, clock: &dyn Clock, warnings: &mut Vec<String>) {
        let mut skip = |reason: String| {
            warn!("Rule '{}' skipped: {}", self.name, reason);
            warnings.push(format!("Rule '{}' skipped: {}", self.name, reason));
        };

        match &self.action {
            RuleAction::Assign(expr) => {
                let targets: Vec<&str> = match &self.target {
                    Some(target) => vec![target.as_str()],
                    None => self.applies_to.iter().map(String::as_str).collect(),
                };
                for target in targets {
                    let current = record.get(target).map(|v| v.to_string());
                    let scope = Bindings {
                        record: &*record,
                        value: current.as_deref(),
                    };
                    match expr.evaluate(&scope) {
                        Ok(value) => {
                            record.insert(target, value);
                        }
                        Err(e) => skip(e.0),
                    }
                }
            }
            RuleAction::Conditional(conditional) => {
                if !conditional.condition.evaluate(&*record) {
                    debug!("Rule '{}' condition not met", self.name);
                    return;
                }
                match conditional.value.evaluate(&*record) {
                    Ok(value) => {
                        record.insert(conditional.target.clone(), value);
                    }
                    Err(e) => skip(e.0),
                }
            }
            RuleAction::Validate(check) => {
                if !check.evaluate(&*record) {
                    warn!("Validation rule '{}' failed: {}", self.name, self.expression);
                    warnings.push(format!("Validation rule '{}' failed: {}", self.name, self.expression));
                }
            }
            RuleAction::BuiltIn(builtin) => {
                if let Err(reason) = self.apply_builtin(*builtin, record, clock) {
                    skip(reason);
                }
            }
            RuleAction::Unsupported(reason) => skip(reason.clone()),
        }
    }

    fn inputs<'a>(&'a self, defaults: &'a [&'a str]) -> Vec<&'a str> {
        if self.applies_to.is_empty() {
            defaults.to_vec()
        } else {
            self.applies_to.iter().map(String::as_str).collect()
        }
    }

    fn output(&self, builtin: BuiltInRule) -> Option<&str> {
        self.target.as_deref().or(builtin.default_output())
    }

    fn apply_builtin(&self, builtin: BuiltInRule, record: &mut MappedRecord, clock: &dyn Clock) -> Result<(), String> {
        let first_present = |record: &MappedRecord, keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| record.get(k))
                .find(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        match builtin {
            BuiltInRule::ConcatenateName => {
                let parts: Vec<String> = if self.applies_to.is_empty() {
                    [GIVEN_NAME_KEYS, MIDDLE_NAME_KEYS, FAMILY_NAME_KEYS]
                        .iter()
                        .filter_map(|keys| first_present(record, keys))
                        .collect()
                } else {
                    self.applies_to
                        .iter()
                        .filter_map(|k| first_present(record, &[k.as_str()]))
                        .collect()
                };
                if parts.is_empty() {
                    return Err("no name fields present".to_string());
                }
                let output = self.output(builtin).unwrap_or("full_name");
                record.insert(output, parts.join(" "));
            }
            BuiltInRule::CalculateAge => {
                let inputs = self.inputs(BIRTH_DATE_KEYS);
                let birth = inputs
                    .iter()
                    .filter_map(|k| record.get(k))
                    .find(|v| !v.is_empty())
                    .ok_or_else(|| "no birth date present".to_string())?;
                let birth = birth
                    .as_date()
                    .ok_or_else(|| format!("'{}' is not a date", birth))?;
                let output = self.output(builtin).unwrap_or("age");
                record.insert(output, MappedValue::Integer(age_on(birth, clock.today())));
            }
            BuiltInRule::FormatPhone | BuiltInRule::NormalizeGender => {
                let defaults = if builtin == BuiltInRule::FormatPhone { PHONE_KEYS } else { GENDER_KEYS };
                let mut touched = false;
                for key in self.inputs(defaults) {
                    let Some(current) = record.get(key).map(|v| v.to_string()) else {
                        continue;
                    };
                    let formatted = if builtin == BuiltInRule::FormatPhone {
                        functions::format_phone(&current)
                    } else {
                        normalize_gender(&current)
                    };
                    let output = self.target.as_deref().unwrap_or(key);
                    record.insert(output, formatted);
                    touched = true;
                }
                if !touched {
                    return Err("none of its input fields are present".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Active rules, highest priority first, declaration order among equals.
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    clock: Arc<dyn Clock>,
}

impl RuleEngine {
    pub fn compile(rules: &[CustomMappingRule]) -> Vec<CompiledRule> {
        let mut compiled: Vec<CompiledRule> = rules.iter().filter(|r| r.active).map(CompiledRule::compile).collect();
        // stable, so ties keep declaration order
        compiled.sort_by(|a, b| b.priority.cmp(&a.priority));
        compiled
    }

    pub fn new(rules: Vec<CompiledRule>, clock: Arc<dyn Clock>) -> RuleEngine {
        RuleEngine { rules, clock }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn apply(&self, record: &mut MappedRecord, warnings: &mut Vec<String>) {
        for rule in &self.rules {
            debug!("Applying rule '{}' (priority {})", rule.name, rule.priority);
            rule.apply(record, self.clock.as_ref(), warnings);
        }
    }
}
