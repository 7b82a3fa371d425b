//! Typed output of a transformation.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::TransformError;
use crate::hl7::datetime;

/// One value in a [`MappedRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum MappedValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl MappedValue {
    pub fn text(value: impl Into<String>) -> MappedValue {
        MappedValue::Text(value.into())
    }

    /// Only text can be empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, MappedValue::Text(s) if s.trim().is_empty())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MappedValue::Text(_) => "string",
            MappedValue::Integer(_) => "long",
            MappedValue::Decimal(_) => "decimal",
            MappedValue::Boolean(_) => "bool",
            MappedValue::DateTime(_) => "datetime",
            MappedValue::Date(_) => "date",
            MappedValue::Time(_) => "time",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MappedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MappedValue::Integer(i) => Some(*i),
            MappedValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Dates, datetimes and text in either ISO or HL7 form.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            MappedValue::Date(d) => Some(*d),
            MappedValue::DateTime(dt) => Some(dt.date_naive()),
            MappedValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .or_else(|| datetime::parse_date(s)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            MappedValue::Text(s) => Value::String(s.clone()),
            MappedValue::Integer(i) => Value::from(*i),
            MappedValue::Decimal(d) => d
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(d.to_string())),
            MappedValue::Boolean(b) => Value::Bool(*b),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for MappedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappedValue::Text(s) => f.write_str(s),
            MappedValue::Integer(i) => write!(f, "{}", i),
            MappedValue::Decimal(d) => write!(f, "{}", d),
            MappedValue::Boolean(b) => write!(f, "{}", b),
            MappedValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            MappedValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            MappedValue::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
        }
    }
}

impl Serialize for MappedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for MappedValue {
    fn from(value: &str) -> Self {
        MappedValue::Text(value.to_string())
    }
}

impl From<String> for MappedValue {
    fn from(value: String) -> Self {
        MappedValue::Text(value)
    }
}

impl From<i64> for MappedValue {
    fn from(value: i64) -> Self {
        MappedValue::Integer(value)
    }
}

impl From<bool> for MappedValue {
    fn from(value: bool) -> Self {
        MappedValue::Boolean(value)
    }
}

impl From<Decimal> for MappedValue {
    fn from(value: Decimal) -> Self {
        MappedValue::Decimal(value)
    }
}

impl From<NaiveDate> for MappedValue {
    fn from(value: NaiveDate) -> Self {
        MappedValue::Date(value)
    }
}

/// The flat key/value projection of one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MappedRecord {
    values: BTreeMap<String, MappedValue>,
}

impl MappedRecord {
    pub fn new() -> MappedRecord {
        MappedRecord::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MappedValue>) -> Option<MappedValue> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&MappedValue> {
        self.values.get(key)
    }

    /// The value rendered as text, empty when absent.
    pub fn text(&self, key: &str) -> String {
        self.values
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MappedValue> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, MappedValue> {
        self.values.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Builds a typed result from this record.
    pub fn build<T: FromRecord>(&self) -> Result<T, TransformError> {
        T::from_record(self)
    }
}

impl IntoIterator for MappedRecord {
    type Item = (String, MappedValue);
    type IntoIter = btree_map::IntoIter<String, MappedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<K: Into<String>, V: Into<MappedValue>> FromIterator<(K, V)> for MappedRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MappedRecord {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Explicit construction of a concrete result type from a mapped record.
pub trait FromRecord: Sized {
    fn from_record(record: &MappedRecord) -> Result<Self, TransformError>;
}

/// Patient identity and demographics, built from the conventional target keys
/// (`patient_id`, `family_name`, `given_name`, `birth_date`, `gender`, `age`, `phone`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientDemographics {
    pub patient_id: String,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub age: Option<i64>,
    pub phone: Option<String>,
}

impl FromRecord for PatientDemographics {
    fn from_record(record: &MappedRecord) -> Result<Self, TransformError> {
        let text = |key: &str| -> Option<String> {
            record
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        let patient_id = text("patient_id").ok_or_else(|| TransformError::Build {
            target: "PatientDemographics".to_string(),
            message: "patient_id is missing".to_string(),
        })?;

        let birth_date = match record.get("birth_date").filter(|v| !v.is_empty()) {
            Some(value) => Some(value.as_date().ok_or_else(|| TransformError::Build {
                target: "PatientDemographics".to_string(),
                message: format!("birth_date '{}' is not a date", value),
            })?),
            None => None,
        };

        Ok(PatientDemographics {
            patient_id,
            family_name: text("family_name"),
            given_name: text("given_name"),
            birth_date,
            gender: text("gender"),
            age: record.get("age").and_then(MappedValue::as_i64),
            phone: text("phone"),
        })
    }
}
