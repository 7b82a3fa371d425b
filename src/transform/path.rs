//! Field paths such as `PID-5-1`, `PID.5.1`, `OBX[2]-5` or `PID-3[2]-1`, and the
//! header-derived virtual fields.

use std::fmt;
use std::str::FromStr;

use crate::hl7::{datetime, escape, Hl7Message};

/// A location inside a message. Indices are 1-based throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub segment: String,
    pub segment_occurrence: Option<usize>,
    pub field: usize,
    pub repetition: Option<usize>,
    pub component: Option<usize>,
    pub sub_component: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError(pub String);

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PathError {}

fn split_index(part: &str, what: &str) -> Result<(String, Option<usize>), PathError> {
    match part.find('[') {
        None => Ok((part.to_string(), None)),
        Some(open) => {
            let inner = part[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| PathError(format!("unterminated index in '{}'", part)))?;
            let index = positive(inner, what)?;
            Ok((part[..open].to_string(), Some(index)))
        }
    }
}

fn positive(text: &str, what: &str) -> Result<usize, PathError> {
    match text.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(PathError(format!("{} '{}' must be a positive number", what, text))),
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(['-', '.']).collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(PathError(format!("'{}' is not a field path", s)));
        }

        let (segment, segment_occurrence) = split_index(parts[0], "segment occurrence")?;
        let segment = segment.to_ascii_uppercase();
        if segment.len() != 3 || !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PathError(format!("'{}' is not a segment type", segment)));
        }

        let (field, repetition) = split_index(parts[1], "repetition")?;
        let field = positive(&field, "field")?;
        let component = parts.get(2).map(|c| positive(c, "component")).transpose()?;
        let sub_component = parts
            .get(3)
            .map(|c| positive(c, "sub-component"))
            .transpose()?;

        Ok(FieldPath {
            segment,
            segment_occurrence,
            field,
            repetition,
            component,
            sub_component,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segment)?;
        if let Some(n) = self.segment_occurrence {
            write!(f, "[{}]", n)?;
        }
        write!(f, "-{}", self.field)?;
        if let Some(n) = self.repetition {
            write!(f, "[{}]", n)?;
        }
        if let Some(c) = self.component {
            write!(f, "-{}", c)?;
        }
        if let Some(s) = self.sub_component {
            write!(f, "-{}", s)?;
        }
        Ok(())
    }
}

impl FieldPath {
    /// Extracts the value at this path, or `None` when the location does not exist.
    ///
    /// A leaf (a component, a sub-component, or a field without structure) is returned unescaped.
    /// A composite value keeps its wire form so its delimiters stay meaningful.
    pub fn extract(&self, message: &Hl7Message) -> Option<String> {
        let d = &message.delimiters;
        let segment = message.segment_occurrence(&self.segment, self.segment_occurrence.unwrap_or(1))?;
        let field = segment.field(self.field)?;

        // MSH-1 and MSH-2 hold delimiter characters and are never split
        if segment.is_header() && self.field <= 2 {
            return Some(field.value.clone());
        }

        let occurrence = match (self.repetition, self.component) {
            (None, None) => return Some(leaf(&field.value, message)),
            (Some(r), _) => field.value.split(d.repetition).nth(r - 1)?,
            (None, Some(_)) => field.value.split(d.repetition).next()?,
        };

        let Some(c) = self.component else {
            return Some(leaf(occurrence, message));
        };
        let component = occurrence.split(d.component).nth(c - 1)?;

        match self.sub_component {
            None => Some(leaf(component, message)),
            Some(s) => component
                .split(d.sub_component)
                .nth(s - 1)
                .map(|v| escape::unescape(v, d).into_owned()),
        }
    }
}

fn leaf(value: &str, message: &Hl7Message) -> String {
    let d = &message.delimiters;
    if value.contains([d.repetition, d.component, d.sub_component]) {
        value.to_string()
    } else {
        escape::unescape(value, d).into_owned()
    }
}

/// Values computed from the message header rather than addressed by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualField {
    MessageType,
    MessageId,
    ControlId,
    Timestamp,
    Version,
    TriggerEvent,
}

impl VirtualField {
    pub fn from_name(name: &str) -> Option<VirtualField> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "messagetype" => Some(VirtualField::MessageType),
            "messageid" => Some(VirtualField::MessageId),
            "controlid" | "messagecontrolid" => Some(VirtualField::ControlId),
            "timestamp" | "messagetimestamp" => Some(VirtualField::Timestamp),
            "version" | "versionid" => Some(VirtualField::Version),
            "triggerevent" | "eventtype" => Some(VirtualField::TriggerEvent),
            _ => None,
        }
    }

    pub fn resolve(&self, message: &Hl7Message) -> Option<String> {
        let value = match self {
            VirtualField::MessageType => message.message_type.code().to_string(),
            VirtualField::MessageId => message.id.clone(),
            VirtualField::ControlId => message.control_id()?.to_string(),
            VirtualField::Timestamp => datetime::format_timestamp(&message.timestamp),
            VirtualField::Version => message.version.clone(),
            VirtualField::TriggerEvent => message.trigger_event()?.to_string(),
        };
        Some(value)
    }
}

/// Where a mapping reads its value from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceField {
    Path(FieldPath),
    Virtual(VirtualField),
}

impl FromStr for SourceField {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match VirtualField::from_name(s) {
            Some(v) => Ok(SourceField::Virtual(v)),
            None => s.parse().map(SourceField::Path),
        }
    }
}

impl fmt::Display for SourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceField::Path(p) => p.fmt(f),
            SourceField::Virtual(v) => write!(f, "{:?}", v),
        }
    }
}

impl SourceField {
    pub fn resolve(&self, message: &Hl7Message) -> Option<String> {
        match self {
            SourceField::Path(p) => p.extract(message),
            SourceField::Virtual(v) => v.resolve(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hl7::parse_message;

    const MESSAGE: &str = "MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230101120000||ADT^A01|MSG0001|P|2.5\r\
        PID|1||12345^^^MRN~67890^^^SSN||DOE^JOHN^A||19900615|M|||123 MAIN\\T\\SONS ST^^CITY^ST^12345\r\
        OBX|1|NM|GLU^Glucose||95|mg/dL\r\
        OBX|2|NM|HGB^Hemoglobin||13.5|g/dL\r";

    fn path(s: &str) -> FieldPath {
        s.parse().unwrap()
    }

    #[test]
    fn parses_both_notations() {
        assert_eq!(path("PID-5-1"), path("pid.5.1"));
        let p = path("OBX[2]-5");
        assert_eq!(p.segment_occurrence, Some(2));
        assert_eq!(p.field, 5);
        let p = path("PID-3[2]-1");
        assert_eq!(p.repetition, Some(2));
        assert_eq!(p.component, Some(1));
        assert_eq!(p.to_string(), "PID-3[2]-1");
    }

    #[test]
    fn rejects_bad_paths() {
        for bad in ["PID", "PID-0", "PID-x", "PATIENT-5", "PID-5-1-1-1", "OBX[0]-5", "OBX[2-5"] {
            assert!(bad.parse::<FieldPath>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn extracts_values() {
        let message = parse_message(MESSAGE);
        assert_eq!(path("PID-5-1").extract(&message).as_deref(), Some("DOE"));
        assert_eq!(path("PID-5-2").extract(&message).as_deref(), Some("JOHN"));
        assert_eq!(path("PID-5").extract(&message).as_deref(), Some("DOE^JOHN^A"));
        assert_eq!(path("PID-7").extract(&message).as_deref(), Some("19900615"));
        assert_eq!(path("PID-11-1").extract(&message).as_deref(), Some("123 MAIN&SONS ST"));
        assert_eq!(path("PID-5-9").extract(&message), None);
        assert_eq!(path("PV1-2").extract(&message), None);
    }

    #[test]
    fn extracts_occurrences_and_repetitions() {
        let message = parse_message(MESSAGE);
        assert_eq!(path("OBX-5").extract(&message).as_deref(), Some("95"));
        assert_eq!(path("OBX[2]-5").extract(&message).as_deref(), Some("13.5"));
        assert_eq!(path("PID-3-1").extract(&message).as_deref(), Some("12345"));
        assert_eq!(path("PID-3[2]-1").extract(&message).as_deref(), Some("67890"));
        assert_eq!(path("PID-3[3]-1").extract(&message), None);
    }

    #[test]
    fn header_fields_follow_standard_numbering() {
        let message = parse_message(MESSAGE);
        assert_eq!(path("MSH-1").extract(&message).as_deref(), Some("|"));
        assert_eq!(path("MSH-2").extract(&message).as_deref(), Some("^~\\&"));
        assert_eq!(path("MSH-9-2").extract(&message).as_deref(), Some("A01"));
        assert_eq!(path("MSH-10").extract(&message).as_deref(), Some("MSG0001"));
    }

    #[test]
    fn resolves_virtual_fields() {
        let message = parse_message(MESSAGE);
        let resolve = |s: &str| s.parse::<SourceField>().unwrap().resolve(&message);
        assert_eq!(resolve("MessageType").as_deref(), Some("ADT"));
        assert_eq!(resolve("message_id").as_deref(), Some("MSG0001"));
        assert_eq!(resolve("ControlId").as_deref(), Some("MSG0001"));
        assert_eq!(resolve("Timestamp").as_deref(), Some("20230101120000"));
        assert_eq!(resolve("Version").as_deref(), Some("2.5"));
        assert_eq!(resolve("TriggerEvent").as_deref(), Some("A01"));
    }
}
