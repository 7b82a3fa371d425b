use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::delimiters::HEADER_SEGMENT;
use super::{escape, parser, Delimiters};

/// The message families this crate knows by name; everything else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Adt,
    Orm,
    Oru,
    Siu,
    Mdm,
    Dft,
    Bar,
    Rde,
    Vxu,
    Mfn,
    Qry,
    Ack,
    Unknown,
}

impl MessageType {
    /// From the first component of `MSH-9`, case-insensitively.
    pub fn from_code(code: &str) -> MessageType {
        match code.trim().to_ascii_uppercase().as_str() {
            "ADT" => MessageType::Adt,
            "ORM" => MessageType::Orm,
            "ORU" => MessageType::Oru,
            "SIU" => MessageType::Siu,
            "MDM" => MessageType::Mdm,
            "DFT" => MessageType::Dft,
            "BAR" => MessageType::Bar,
            "RDE" => MessageType::Rde,
            "VXU" => MessageType::Vxu,
            "MFN" => MessageType::Mfn,
            "QRY" => MessageType::Qry,
            "ACK" => MessageType::Ack,
            _ => MessageType::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MessageType::Adt => "ADT",
            MessageType::Orm => "ORM",
            MessageType::Oru => "ORU",
            MessageType::Siu => "SIU",
            MessageType::Mdm => "MDM",
            MessageType::Dft => "DFT",
            MessageType::Bar => "BAR",
            MessageType::Rde => "RDE",
            MessageType::Vxu => "VXU",
            MessageType::Mfn => "MFN",
            MessageType::Qry => "QRY",
            MessageType::Ack => "ACK",
            MessageType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The routing and identity values lifted from `MSH`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    /// `MSH-9-1`, e.g. `ADT`
    pub message_code: String,
    /// `MSH-9-2`, e.g. `A01`
    pub trigger_event: String,
    pub control_id: String,
    pub processing_id: String,
    pub version: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubComponent {
    pub position: usize,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub position: usize,
    pub value: String,
    /// Populated only when `value` contains the sub-component delimiter.
    pub sub_components: Vec<SubComponent>,
}

impl Component {
    pub fn parse(position: usize, value: &str, delimiters: &Delimiters) -> Component {
        let sub_components = if value.contains(delimiters.sub_component) {
            value
                .split(delimiters.sub_component)
                .enumerate()
                .map(|(i, v)| SubComponent {
                    position: i + 1,
                    value: v.to_string(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Component {
            position,
            value: value.to_string(),
            sub_components,
        }
    }

    pub fn to_wire(&self, delimiters: &Delimiters) -> String {
        if self.sub_components.is_empty() {
            return self.value.clone();
        }
        join(
            self.sub_components.iter().map(|s| s.value.as_str()),
            delimiters.sub_component,
        )
    }

    pub fn sub_component(&self, position: usize) -> Option<&str> {
        if self.sub_components.is_empty() {
            return (position == 1).then_some(self.value.as_str());
        }
        self.sub_components
            .get(position.checked_sub(1)?)
            .map(|s| s.value.as_str())
    }
}

/// One field of a segment, holding its wire text (escape sequences intact).
///
/// When `components` is non-empty it is authoritative for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub position: usize,
    pub value: String,
    /// Populated only when `value` contains the component delimiter.
    pub components: Vec<Component>,
}

impl Field {
    pub fn parse(position: usize, value: &str, delimiters: &Delimiters) -> Field {
        let components = if value.contains(delimiters.component) {
            value
                .split(delimiters.component)
                .enumerate()
                .map(|(i, c)| Component::parse(i + 1, c, delimiters))
                .collect()
        } else {
            Vec::new()
        };

        Field {
            position,
            value: value.to_string(),
            components,
        }
    }

    /// A field kept verbatim, never split (`MSH-1`, `MSH-2`).
    pub fn literal(position: usize, value: &str) -> Field {
        Field {
            position,
            value: value.to_string(),
            components: Vec::new(),
        }
    }

    pub fn empty(position: usize) -> Field {
        Field::literal(position, "")
    }

    pub fn to_wire(&self, delimiters: &Delimiters) -> String {
        if self.components.is_empty() {
            return self.value.clone();
        }
        join(
            self.components.iter().map(|c| c.to_wire(delimiters)),
            delimiters.component,
        )
    }

    pub fn set_value(&mut self, value: &str, delimiters: &Delimiters) {
        *self = Field::parse(self.position, value, delimiters);
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Wire text of component `position` (1-based); a field without components is its own first component.
    pub fn component(&self, position: usize) -> Option<&str> {
        if self.components.is_empty() {
            return (position == 1).then_some(self.value.as_str());
        }
        self.components
            .get(position.checked_sub(1)?)
            .map(|c| c.value.as_str())
    }

    /// The value with escape sequences resolved.
    pub fn decoded(&self, delimiters: &Delimiters) -> String {
        escape::unescape(&self.value, delimiters).into_owned()
    }

    pub fn has_repetitions(&self, delimiters: &Delimiters) -> bool {
        self.value.contains(delimiters.repetition)
    }

    /// Splits the field into its occurrences, in order, each parsed as a field at the same position.
    pub fn repetitions(&self, delimiters: &Delimiters) -> Vec<Field> {
        self.value
            .split(delimiters.repetition)
            .map(|r| Field::parse(self.position, r, delimiters))
            .collect()
    }

    /// Inverse of [`Field::repetitions`].
    pub fn from_repetitions(position: usize, repetitions: &[Field], delimiters: &Delimiters) -> Field {
        let value = join(
            repetitions.iter().map(|r| r.to_wire(delimiters)),
            delimiters.repetition,
        );
        Field::parse(position, &value, delimiters)
    }
}

/// One line of a message. Fields are 1-based: `fields[n - 1].position == n`. For `MSH`
/// that means `MSH-1` (the field separator) is stored as the first field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_type: String,
    pub fields: Vec<Field>,
    /// 1-based position of the segment within its message
    pub sequence: usize,
    pub raw: String,
}

impl Segment {
    pub fn is_header(&self) -> bool {
        self.segment_type == HEADER_SEGMENT
    }

    pub fn field(&self, position: usize) -> Option<&Field> {
        self.fields.get(position.checked_sub(1)?)
    }

    pub fn field_mut(&mut self, position: usize) -> Option<&mut Field> {
        self.fields.get_mut(position.checked_sub(1)?)
    }

    /// Wire text of field `position`, empty when absent.
    pub fn field_value(&self, position: usize) -> &str {
        self.field(position).map(|f| f.value.as_str()).unwrap_or("")
    }

    /// Replaces a field, padding with empty fields as needed, and refreshes `raw`.
    pub fn set_field(&mut self, position: usize, value: &str, delimiters: &Delimiters) {
        if position == 0 {
            return;
        }
        while self.fields.len() < position {
            let next = self.fields.len() + 1;
            self.fields.push(Field::empty(next));
        }
        let field = &mut self.fields[position - 1];
        if self.segment_type == HEADER_SEGMENT && position <= 2 {
            *field = Field::literal(position, value);
        } else {
            field.set_value(value, delimiters);
        }
        self.rebuild_raw(delimiters);
    }

    /// Serializes the field tree back to wire text.
    pub fn to_wire(&self, delimiters: &Delimiters) -> String {
        let mut out = self.segment_type.clone();
        // MSH-1 *is* the separator that follows the segment type
        let skip = if self.is_header() { 1 } else { 0 };
        for field in self.fields.iter().skip(skip) {
            out.push(delimiters.field);
            out.push_str(&field.to_wire(delimiters));
        }
        out
    }

    pub fn rebuild_raw(&mut self, delimiters: &Delimiters) {
        self.raw = self.to_wire(delimiters);
    }
}

/// A parsed message. Values in the tree are wire text; use [`Field::decoded`] or the
/// [path](crate::transform::path) accessors for unescaped data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hl7Message {
    /// `MSH-10` when present, otherwise a generated id
    pub id: String,
    pub message_type: MessageType,
    pub version: String,
    pub raw: String,
    pub segments: Vec<Segment>,
    pub header: Option<MessageHeader>,
    /// `MSH-7`, or the time of parsing when absent
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    pub delimiters: Delimiters,
    pub(crate) segment_separator: String,
    pub(crate) trailing_separator: bool,
}

impl Hl7Message {
    pub fn parse(raw: &str) -> Hl7Message {
        parser::parse_message(raw)
    }

    pub fn control_id(&self) -> Option<&str> {
        self.header
            .as_ref()
            .map(|h| h.control_id.as_str())
            .filter(|c| !c.is_empty())
    }

    /// `MSH-9` as on the wire, e.g. `ADT^A01`.
    pub fn message_type_code(&self) -> String {
        self.segment(HEADER_SEGMENT)
            .map(|msh| msh.field_value(9).to_string())
            .unwrap_or_default()
    }

    pub fn trigger_event(&self) -> Option<&str> {
        self.header
            .as_ref()
            .map(|h| h.trigger_event.as_str())
            .filter(|t| !t.is_empty())
    }

    /// First segment of the given type.
    pub fn segment(&self, segment_type: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.segment_type == segment_type)
    }

    pub fn segments_of<'a>(&'a self, segment_type: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments
            .iter()
            .filter(move |s| s.segment_type == segment_type)
    }

    /// The `occurrence`-th (1-based) segment of the given type.
    pub fn segment_occurrence(&self, segment_type: &str, occurrence: usize) -> Option<&Segment> {
        self.segments
            .iter()
            .filter(|s| s.segment_type == segment_type)
            .nth(occurrence.checked_sub(1)?)
    }

    /// Sets a field on the first segment of `segment_type` and refreshes the raw text.
    /// Returns false when no such segment exists.
    pub fn set_field_value(&mut self, segment_type: &str, position: usize, value: &str) -> bool {
        let delimiters = self.delimiters;
        let updated = match self.segments.iter_mut().find(|s| s.segment_type == segment_type) {
            Some(segment) => {
                segment.set_field(position, value, &delimiters);
                true
            }
            None => false,
        };
        if updated {
            self.raw = self.to_hl7_string();
        }
        updated
    }

    /// Serializes the segment tree, reproducing the original text for an unmodified message.
    /// Blank lines in the source are not kept, so they do not come back.
    pub fn to_hl7_string(&self) -> String {
        let mut out = self
            .segments
            .iter()
            .map(|s| s.to_wire(&self.delimiters))
            .collect::<Vec<_>>()
            .join(&self.segment_separator);
        if self.trailing_separator && !self.segments.is_empty() {
            out.push_str(&self.segment_separator);
        }
        out
    }

    pub fn rebuild_raw(&mut self) {
        let delimiters = self.delimiters;
        for segment in &mut self.segments {
            segment.rebuild_raw(&delimiters);
        }
        self.raw = self.to_hl7_string();
    }
}

impl fmt::Display for Hl7Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hl7_string())
    }
}

fn join<I, S>(parts: I, separator: char) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(separator);
        }
        out.push_str(part.as_ref());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d() -> Delimiters {
        Delimiters::default()
    }

    #[test]
    fn simple_field_has_no_components() {
        let field = Field::parse(3, "12345", &d());
        assert!(field.components.is_empty());
        assert_eq!(field.component(1), Some("12345"));
        assert_eq!(field.component(2), None);
    }

    #[test]
    fn components_and_sub_components_are_materialised() {
        let field = Field::parse(5, "DOE^JOHN&J^^III", &d());
        assert_eq!(field.components.len(), 4);
        assert_eq!(field.component(1), Some("DOE"));
        assert!(field.components[0].sub_components.is_empty());
        assert_eq!(field.components[1].sub_components.len(), 2);
        assert_eq!(field.components[1].sub_component(2), Some("J"));
        assert_eq!(field.to_wire(&d()), "DOE^JOHN&J^^III");
    }

    #[test]
    fn repetitions_split_and_join_in_order() {
        let field = Field::parse(3, "123^^^MRN~456^^^SSN", &d());
        let reps = field.repetitions(&d());
        assert_eq!(reps.len(), 2);
        assert_eq!(reps[1].component(4), Some("SSN"));

        let joined = Field::from_repetitions(3, &reps, &d());
        assert_eq!(joined.value, "123^^^MRN~456^^^SSN");
    }

    #[test]
    fn set_field_pads_and_rebuilds() {
        let mut segment = parser::parse_segment("PID|1", 2, &d());
        segment.set_field(5, "ROE^JANE", &d());
        assert_eq!(segment.raw, "PID|1||||ROE^JANE");
        assert_eq!(segment.field(5).unwrap().component(2), Some("JANE"));
    }

    #[test]
    fn decoded_resolves_escapes() {
        let field = Field::parse(1, "A\\T\\B", &d());
        assert_eq!(field.decoded(&d()), "A&B");
    }

    #[test]
    fn message_type_codes() {
        assert_eq!(MessageType::from_code("adt"), MessageType::Adt);
        assert_eq!(MessageType::from_code("ZZZ"), MessageType::Unknown);
        assert_eq!(MessageType::Oru.to_string(), "ORU");
    }
}
