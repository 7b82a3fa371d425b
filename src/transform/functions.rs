//! Named value transformations and target data type coercion.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::value::MappedValue;
use crate::hl7::{datetime, escape, Delimiters};

/// Transformation applied to an extracted value before type coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformFunction {
    Uppercase,
    Lowercase,
    Trim,
    FormatPhone,
    FormatDate,
    FormatName,
}

impl TransformFunction {
    pub fn from_name(name: &str) -> Option<TransformFunction> {
        match name.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "uppercase" | "upper" | "to_upper" => Some(TransformFunction::Uppercase),
            "lowercase" | "lower" | "to_lower" => Some(TransformFunction::Lowercase),
            "trim" => Some(TransformFunction::Trim),
            "format_phone" | "formatphone" | "phone" => Some(TransformFunction::FormatPhone),
            "format_date" | "formatdate" | "date" => Some(TransformFunction::FormatDate),
            "format_name" | "formatname" | "name" => Some(TransformFunction::FormatName),
            _ => None,
        }
    }

    pub fn apply(&self, value: &str, delimiters: &Delimiters) -> String {
        match self {
            TransformFunction::Uppercase => value.to_uppercase(),
            TransformFunction::Lowercase => value.to_lowercase(),
            TransformFunction::Trim => value.trim().to_string(),
            TransformFunction::FormatPhone => format_phone(value),
            TransformFunction::FormatDate => format_date(value),
            TransformFunction::FormatName => format_name(value, delimiters),
        }
    }
}

/// North American formatting for 7, 10 and 11 digit numbers; anything else is returned trimmed.
pub fn format_phone(value: &str) -> String {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        7 => format!("{}-{}", &digits[..3], &digits[3..]),
        10 => format!("({}) {}-{}", &digits[..3], &digits[3..6], &digits[6..]),
        11 if digits.starts_with('1') => {
            format!("+1 ({}) {}-{}", &digits[1..4], &digits[4..7], &digits[7..])
        }
        _ => value.trim().to_string(),
    }
}

/// HL7 dates become `YYYY-MM-DD`, timestamps `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn format_date(value: &str) -> String {
    let trimmed = value.trim();
    match datetime::parse_timestamp(trimmed) {
        Some(ts) if trimmed.len() <= 8 => ts.format("%Y-%m-%d").to_string(),
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => trimmed.to_string(),
    }
}

/// Renders an `XPN` name (`family^given^middle^suffix^prefix`) as "prefix given middle family suffix".
pub fn format_name(value: &str, delimiters: &Delimiters) -> String {
    if !value.contains(delimiters.component) {
        return escape::unescape(value.trim(), delimiters).into_owned();
    }
    let parts: Vec<String> = value
        .split(delimiters.component)
        .map(|p| escape::unescape(p.trim(), delimiters).into_owned())
        .collect();
    let part = |i: usize| parts.get(i).map(String::as_str).unwrap_or("");

    [part(4), part(1), part(2), part(0), part(3)]
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Target data types a mapping can coerce into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Text,
    Int,
    Long,
    Decimal,
    Bool,
    DateTime,
    Date,
    Time,
}

impl DataType {
    pub fn from_name(name: &str) -> Option<DataType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "string" | "text" | "str" => Some(DataType::Text),
            "int" | "integer" | "int32" => Some(DataType::Int),
            "long" | "int64" => Some(DataType::Long),
            "decimal" | "number" | "double" | "float" => Some(DataType::Decimal),
            "bool" | "boolean" => Some(DataType::Bool),
            "datetime" | "timestamp" => Some(DataType::DateTime),
            "date" => Some(DataType::Date),
            "time" => Some(DataType::Time),
            _ => None,
        }
    }
}

/// Coerces text into `data_type`; the error names what was wrong with the value.
pub fn coerce(value: &str, data_type: DataType) -> Result<MappedValue, String> {
    let trimmed = value.trim();
    let fail = |kind: &str| format!("'{}' is not a valid {}", value, kind);

    match data_type {
        DataType::Text => Ok(MappedValue::Text(value.to_string())),
        DataType::Int => trimmed
            .parse::<i32>()
            .map(|i| MappedValue::Integer(i64::from(i)))
            .map_err(|_| fail("int")),
        DataType::Long => trimmed
            .parse::<i64>()
            .map(MappedValue::Integer)
            .map_err(|_| fail("long")),
        DataType::Decimal => Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map(MappedValue::Decimal)
            .map_err(|_| fail("decimal")),
        DataType::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(MappedValue::Boolean(true)),
            "false" | "f" | "no" | "n" | "0" => Ok(MappedValue::Boolean(false)),
            _ => Err(fail("bool")),
        },
        DataType::DateTime => datetime::parse_timestamp(trimmed)
            .or_else(|| {
                DateTime::parse_from_rfc3339(trimmed)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .map(MappedValue::DateTime)
            .ok_or_else(|| fail("datetime")),
        DataType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .or_else(|| datetime::parse_date(trimmed))
            .map(MappedValue::Date)
            .ok_or_else(|| fail("date")),
        DataType::Time => parse_time(trimmed)
            .map(MappedValue::Time)
            .ok_or_else(|| fail("time")),
    }
}

/// `HH[MM[SS]]` or `HH:MM[:SS]`.
fn parse_time(value: &str) -> Option<NaiveTime> {
    if value.contains(':') {
        return NaiveTime::parse_from_str(value, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
            .ok();
    }
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let unit = |range: std::ops::Range<usize>| -> Option<u32> {
        match value.get(range) {
            Some(s) if !s.is_empty() => s.parse().ok(),
            _ => Some(0),
        }
    };
    match value.len() {
        2 | 4 | 6 => NaiveTime::from_hms_opt(unit(0..2)?, unit(2..4)?, unit(4..6)?),
        _ => None,
    }
}
