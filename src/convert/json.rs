//! HL7 ⇄ JSON in two shapes.
//!
//! The document shape keeps message properties plus a `segments` array whose `fields`
//! are index aligned with HL7 numbering (`fields[0]` is empty, `MSH` `fields[1]` is the
//! field separator). The flat shape is one object keyed `segment[occurrence]_field[_component[_sub]]`,
//! e.g. `pid_5_1`, `obx2_5` for the fifth field of the second `OBX`.
//!
//! Field values are carried in wire form, escape sequences intact, so both shapes
//! convert back to byte-identical segments.

use chrono::{DateTime, Utc};
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{assemble, checked_position, delimiters_from_header, segment_line};
use crate::error::Hl7Error;
use crate::hl7::delimiters::HEADER_SEGMENT;
use crate::hl7::{Delimiters, Hl7Message, Segment};

/// Segment order used when rebuilding from flat JSON; other types follow in order of appearance.
pub const CANONICAL_SEGMENT_ORDER: &[&str] = &["MSH", "EVN", "PID", "PV1", "OBX", "AL1", "DG1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonOptions {
    pub include_metadata: bool,
    pub pretty: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        JsonOptions {
            include_metadata: true,
            pretty: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    is_valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    validation_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<JsonMetadata>,
    #[serde(default)]
    delimiters: Option<JsonDelimiters>,
    segments: Vec<JsonSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonMetadata {
    sending_application: String,
    sending_facility: String,
    receiving_application: String,
    receiving_facility: String,
    message_code: String,
    trigger_event: String,
    control_id: String,
    processing_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonDelimiters {
    field: char,
    component: char,
    repetition: char,
    escape: char,
    sub_component: char,
}

impl From<Delimiters> for JsonDelimiters {
    fn from(d: Delimiters) -> Self {
        JsonDelimiters {
            field: d.field,
            component: d.component,
            repetition: d.repetition,
            escape: d.escape,
            sub_component: d.sub_component,
        }
    }
}

impl From<JsonDelimiters> for Delimiters {
    fn from(d: JsonDelimiters) -> Self {
        Delimiters {
            field: d.field,
            component: d.component,
            repetition: d.repetition,
            escape: d.escape,
            sub_component: d.sub_component,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonSegment {
    segment_type: String,
    #[serde(default)]
    fields: Vec<String>,
}

pub fn to_json(message: &Hl7Message, options: &JsonOptions) -> Value {
    let document = JsonMessage {
        message_id: message.id.clone(),
        message_type: message.message_type.code().to_string(),
        version: message.version.clone(),
        timestamp: Some(message.timestamp),
        is_valid: message.is_valid,
        validation_errors: message.validation_errors.clone(),
        metadata: message
            .header
            .as_ref()
            .filter(|_| options.include_metadata)
            .map(|h| JsonMetadata {
                sending_application: h.sending_application.clone(),
                sending_facility: h.sending_facility.clone(),
                receiving_application: h.receiving_application.clone(),
                receiving_facility: h.receiving_facility.clone(),
                message_code: h.message_code.clone(),
                trigger_event: h.trigger_event.clone(),
                control_id: h.control_id.clone(),
                processing_id: h.processing_id.clone(),
            }),
        delimiters: Some(message.delimiters.into()),
        segments: message
            .segments
            .iter()
            .map(|s| JsonSegment {
                segment_type: s.segment_type.clone(),
                fields: std::iter::once(String::new())
                    .chain(s.fields.iter().map(|f| f.to_wire(&message.delimiters)))
                    .collect(),
            })
            .collect(),
    };
    serde_json::to_value(document).unwrap_or(Value::Null)
}

pub fn to_json_string(message: &Hl7Message, options: &JsonOptions) -> Result<String, Hl7Error> {
    let value = to_json(message, options);
    Ok(if options.pretty {
        serde_json::to_string_pretty(&value)?
    } else {
        serde_json::to_string(&value)?
    })
}

/// Rebuilds a message from the document shape.
pub fn from_json(value: Value) -> Result<Hl7Message, Hl7Error> {
    let document: JsonMessage = serde_json::from_value(value)?;
    if document.segments.is_empty() {
        return Err(Hl7Error::InvalidStructure("JSON document has no segments".to_string()));
    }

    let header_fields = document
        .segments
        .iter()
        .find(|s| s.segment_type == HEADER_SEGMENT)
        .map(|s| &s.fields);
    let delimiters = match (document.delimiters, header_fields) {
        (Some(d), _) => Delimiters::from(d),
        (None, Some(fields)) => delimiters_from_header(
            fields.get(1).map(String::as_str),
            fields.get(2).map(String::as_str),
        ),
        (None, None) => Delimiters::default(),
    };

    let lines: Vec<String> = document
        .segments
        .iter()
        .map(|s| {
            let fields: Vec<&str> = s.fields.iter().skip(1).map(String::as_str).collect();
            segment_line(&s.segment_type, &fields, &delimiters)
        })
        .collect();
    Ok(assemble(&lines))
}

pub fn from_json_str(text: &str) -> Result<Hl7Message, Hl7Error> {
    from_json(serde_json::from_str(text)?)
}

fn segment_prefix(segment_type: &str, occurrence: usize) -> String {
    let lower = segment_type.to_ascii_lowercase();
    if occurrence > 1 {
        format!("{}{}", lower, occurrence)
    } else {
        lower
    }
}

/// Flattens every field of every segment, empty ones included.
pub fn to_flat_json(message: &Hl7Message) -> Value {
    let d = &message.delimiters;
    let mut out = Map::new();
    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();

    for segment in &message.segments {
        let occurrence = occurrences.entry(segment.segment_type.as_str()).or_insert(0);
        *occurrence += 1;
        let prefix = segment_prefix(&segment.segment_type, *occurrence);
        flatten_segment(segment, &prefix, d, &mut out);
    }
    Value::Object(out)
}

fn flatten_segment(segment: &Segment, prefix: &str, d: &Delimiters, out: &mut Map<String, Value>) {
    for field in &segment.fields {
        let key = format!("{}_{}", prefix, field.position);
        let literal = segment.is_header() && field.position <= 2;
        if literal || field.components.is_empty() || field.value.contains(d.repetition) {
            out.insert(key, Value::String(field.value.clone()));
            continue;
        }
        for component in &field.components {
            let key = format!("{}_{}", key, component.position);
            if component.sub_components.is_empty() {
                out.insert(key, Value::String(component.value.clone()));
            } else {
                for sub in &component.sub_components {
                    out.insert(format!("{}_{}", key, sub.position), Value::String(sub.value.clone()));
                }
            }
        }
    }
}

fn flat_key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([A-Za-z0-9]{3})(\d*)_(\d+)(?:_(\d+))?(?:_(\d+))?$").ok())
        .as_ref()
}

type Positions = BTreeMap<usize, BTreeMap<usize, BTreeMap<usize, String>>>;

#[derive(Default)]
struct FlatSegment {
    fields: Positions,
}

impl FlatSegment {
    fn field_value(&self, position: usize, d: &Delimiters) -> String {
        let Some(components) = self.fields.get(&position) else {
            return String::new();
        };
        if let (1, Some(subs)) = (components.len(), components.get(&0)) {
            return subs.get(&0).cloned().unwrap_or_default();
        }

        let max_component = components.keys().copied().max().unwrap_or(0);
        (1..=max_component)
            .map(|c| match components.get(&c) {
                None => String::new(),
                Some(subs) => match subs.get(&0) {
                    Some(whole) if subs.len() == 1 => whole.clone(),
                    _ => {
                        let max_sub = subs.keys().copied().max().unwrap_or(0);
                        (1..=max_sub)
                            .map(|s| subs.get(&s).cloned().unwrap_or_default())
                            .collect::<Vec<_>>()
                            .join(&d.sub_component.to_string())
                    }
                },
            })
            .collect::<Vec<_>>()
            .join(&d.component.to_string())
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Rebuilds a message from the flat shape.
///
/// Keys that do not follow the naming scheme are ignored. Segments come out in
/// [`CANONICAL_SEGMENT_ORDER`], then any other types in order of first appearance.
pub fn from_flat_json(value: &Value) -> Result<Hl7Message, Hl7Error> {
    let object = value
        .as_object()
        .ok_or_else(|| Hl7Error::InvalidStructure("flat JSON must be an object".to_string()))?;

    let pattern = flat_key_pattern()
        .ok_or_else(|| Hl7Error::InvalidStructure("flat key pattern unavailable".to_string()))?;
    let mut segments: BTreeMap<(String, usize), FlatSegment> = BTreeMap::new();
    let mut appearance: Vec<String> = Vec::new();

    for (key, value) in object {
        let Some(caps) = pattern.captures(key) else {
            debug!("Ignoring flat JSON key '{}'", key);
            continue;
        };
        let segment_type = caps[1].to_ascii_uppercase();
        let occurrence = match &caps[2] {
            "" => 1,
            digits => checked_position(digits)?.max(1),
        };
        let index = |i: usize| caps.get(i).map_or(Ok(0), |m| checked_position(m.as_str()));
        let (field, component, sub) = (index(3)?, index(4)?, index(5)?);
        if field == 0 {
            continue;
        }

        if !appearance.contains(&segment_type) {
            appearance.push(segment_type.clone());
        }
        segments
            .entry((segment_type, occurrence))
            .or_default()
            .fields
            .entry(field)
            .or_default()
            .entry(component)
            .or_default()
            .insert(sub, scalar(value));
    }

    let header = segments.get(&(HEADER_SEGMENT.to_string(), 1));
    let delimiters = match header {
        Some(msh) => delimiters_from_header(
            Some(msh.field_value(1, &Delimiters::default())).as_deref(),
            Some(msh.field_value(2, &Delimiters::default())).as_deref(),
        ),
        None => return Err(Hl7Error::MissingHeader),
    };

    let mut order: Vec<String> = CANONICAL_SEGMENT_ORDER.iter().map(|s| s.to_string()).collect();
    order.extend(appearance.into_iter().filter(|t| !CANONICAL_SEGMENT_ORDER.contains(&t.as_str())));

    let mut lines = Vec::new();
    for segment_type in &order {
        for ((_, _), segment) in segments.range((segment_type.clone(), 0)..=(segment_type.clone(), usize::MAX)) {
            let max_field = segment.fields.keys().copied().max().unwrap_or(0);
            let values: Vec<String> = (1..=max_field).map(|f| segment.field_value(f, &delimiters)).collect();
            let fields: Vec<&str> = values.iter().map(String::as_str).collect();
            lines.push(segment_line(segment_type, &fields, &delimiters));
        }
    }
    Ok(assemble(&lines))
}

pub fn from_flat_json_str(text: &str) -> Result<Hl7Message, Hl7Error> {
    from_flat_json(&serde_json::from_str(text)?)
}
