//! Projections of a parsed message into JSON and XML, and back.

pub mod json;
pub mod xml;

pub use json::{from_flat_json, from_json, to_flat_json, to_json, to_json_string, JsonOptions};
pub use xml::{from_xml, to_clinical_xml, to_xml};

use crate::error::Hl7Error;
use crate::hl7::delimiters::HEADER_SEGMENT;
use crate::hl7::{parse_message, Delimiters, Hl7Message};

/// Highest field, component or sub-component number accepted when rebuilding a message.
pub const MAX_POSITION: usize = 999;

/// Parses a 1-based position taken from a document, refusing anything above [`MAX_POSITION`].
pub(crate) fn checked_position(raw: &str) -> Result<usize, Hl7Error> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|p| *p <= MAX_POSITION)
        .ok_or_else(|| {
            Hl7Error::InvalidStructure(format!("position {} is out of range (max {})", raw, MAX_POSITION))
        })
}

/// Delimiters named by `MSH-1`/`MSH-2` values, default when either is missing or unusable.
pub(crate) fn delimiters_from_header(field: Option<&str>, encoding: Option<&str>) -> Delimiters {
    match (field, encoding) {
        (Some(f), Some(e)) => Delimiters::from_parts(f, e).unwrap_or_default(),
        _ => Delimiters::default(),
    }
}

/// `fields` are HL7 positions 1..n in wire form; for `MSH` the first two are the delimiters
/// and are taken from `delimiters` instead.
pub(crate) fn segment_line(segment_type: &str, fields: &[&str], delimiters: &Delimiters) -> String {
    let mut line = segment_type.to_string();
    let rest = if segment_type == HEADER_SEGMENT {
        line.push(delimiters.field);
        match fields.get(1).filter(|e| !e.is_empty()) {
            Some(encoding) => line.push_str(encoding),
            None => line.push_str(&delimiters.encoding_characters()),
        }
        fields.get(2..).unwrap_or_default()
    } else {
        fields
    };
    for field in rest {
        line.push(delimiters.field);
        line.push_str(field);
    }
    line
}

/// Joins segment lines with `\r`, terminates the last one, and parses the result.
pub(crate) fn assemble(lines: &[String]) -> Hl7Message {
    let mut raw = lines.join("\r");
    raw.push('\r');
    parse_message(&raw)
}
