//! Best-effort parsing of raw HL7 text into the segment tree.
//!
//! Parsing never fails: structural problems are recorded on
//! [`Hl7Message::validation_errors`] and the model is built from whatever is usable.

use chrono::Utc;
use log::{debug, warn};
use uuid::Uuid;

use super::delimiters::HEADER_SEGMENT;
use super::{datetime, Delimiters, Field, Hl7Message, MessageHeader, MessageType, Segment};

/// Detects the segment separator: `\r` per the standard, `\r\n` or `\n` when files were
/// edited by hand.
fn detect_separator(raw: &str) -> &'static str {
    if raw.contains("\r\n") {
        "\r\n"
    } else if raw.contains('\r') {
        "\r"
    } else if raw.contains('\n') {
        "\n"
    } else {
        "\r"
    }
}

/// Parses one segment line with an already resolved delimiter set.
pub fn parse_segment(raw: &str, sequence: usize, delimiters: &Delimiters) -> Segment {
    let mut tokens = raw.split(delimiters.field);
    let segment_type = tokens.next().unwrap_or_default().to_string();

    let mut fields = Vec::new();
    if segment_type == HEADER_SEGMENT {
        fields.push(Field::literal(1, &delimiters.field.to_string()));
        // MSH-2 holds the encoding characters and must not be split on them
        if let Some(encoding) = tokens.next() {
            fields.push(Field::literal(2, encoding));
        }
    }
    for token in tokens {
        let position = fields.len() + 1;
        fields.push(Field::parse(position, token, delimiters));
    }

    Segment {
        segment_type,
        fields,
        sequence,
        raw: raw.to_string(),
    }
}

fn is_valid_segment_type(segment_type: &str) -> bool {
    segment_type.len() == 3
        && segment_type
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Parses raw message text.
///
/// ```
/// use hl7_processor::hl7::{parse_message, MessageType};
/// let msg = parse_message("MSH|^~\\&|SND|SND|RCV|RCV|20230101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345||DOE^JOHN\r");
/// assert!(msg.is_valid);
/// assert_eq!(msg.message_type, MessageType::Adt);
/// assert_eq!(msg.segments[1].field(5).unwrap().component(2), Some("JOHN"));
/// ```
pub fn parse_message(raw: &str) -> Hl7Message {
    let separator = detect_separator(raw);
    let trailing_separator = raw.ends_with(separator);
    let pieces: Vec<&str> = raw.split(separator).collect();
    let lines: Vec<&str> = pieces.iter().copied().filter(|l| !l.is_empty()).collect();
    let blank = pieces.len() - lines.len() - usize::from(trailing_separator);
    if blank > 0 {
        debug!("Dropped {} blank line(s) between segments", blank);
    }

    let mut errors = Vec::new();
    let delimiters = match lines.first() {
        Some(first) if first.starts_with(HEADER_SEGMENT) => Delimiters::extract(first),
        Some(first) => {
            errors.push(format!(
                "First segment must be MSH, found '{}'",
                first.chars().take(3).collect::<String>()
            ));
            Delimiters::default()
        }
        None => {
            errors.push("Message is empty".to_string());
            Delimiters::default()
        }
    };

    let mut segments = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let segment = parse_segment(line, i + 1, &delimiters);
        if !is_valid_segment_type(&segment.segment_type) {
            errors.push(format!(
                "Segment {} has invalid type '{}'",
                i + 1,
                segment.segment_type
            ));
        } else if i > 0 && segment.is_header() {
            errors.push(format!("Unexpected MSH at segment {}", i + 1));
        }
        segments.push(segment);
    }

    let header = segments
        .first()
        .filter(|s| s.is_header())
        .map(|msh| read_header(msh, &delimiters, &mut errors));

    let message_type = header
        .as_ref()
        .map(|h| MessageType::from_code(&h.message_code))
        .unwrap_or(MessageType::Unknown);
    let version = header
        .as_ref()
        .map(|h| h.version.clone())
        .unwrap_or_default();
    let id = header
        .as_ref()
        .map(|h| h.control_id.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let timestamp = header
        .as_ref()
        .and_then(|h| h.timestamp)
        .unwrap_or_else(Utc::now);

    if errors.is_empty() {
        debug!(
            "Parsed {} message {} with {} segments",
            message_type,
            id,
            segments.len()
        );
    } else {
        warn!("Message {} parsed with {} problem(s): {:?}", id, errors.len(), errors);
    }

    Hl7Message {
        id,
        message_type,
        version,
        raw: raw.to_string(),
        segments,
        header,
        timestamp,
        is_valid: errors.is_empty(),
        validation_errors: errors,
        delimiters,
        segment_separator: separator.to_string(),
        trailing_separator,
    }
}

fn read_header(msh: &Segment, delimiters: &Delimiters, errors: &mut Vec<String>) -> MessageHeader {
    let decoded = |position: usize| -> String {
        msh.field(position)
            .map(|f| f.decoded(delimiters))
            .unwrap_or_default()
    };
    let component = |position: usize, component: usize| -> String {
        msh.field(position)
            .and_then(|f| f.component(component))
            .map(|c| super::escape::unescape(c, delimiters).into_owned())
            .unwrap_or_default()
    };

    let raw_timestamp = decoded(7);
    let timestamp = datetime::parse_timestamp(&raw_timestamp);
    if !raw_timestamp.is_empty() && timestamp.is_none() {
        errors.push(format!("MSH-7 '{}' is not a valid timestamp", raw_timestamp));
    }

    let header = MessageHeader {
        sending_application: component(3, 1),
        sending_facility: component(4, 1),
        receiving_application: component(5, 1),
        receiving_facility: component(6, 1),
        message_code: component(9, 1),
        trigger_event: component(9, 2),
        control_id: decoded(10),
        processing_id: component(11, 1),
        version: component(12, 1),
        timestamp,
    };

    if header.message_code.is_empty() {
        errors.push("MSH-9 message type is missing".to_string());
    }
    if header.control_id.is_empty() {
        errors.push("MSH-10 message control id is missing".to_string());
    }
    if header.version.is_empty() {
        errors.push("MSH-12 version id is missing".to_string());
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADT: &str = "MSH|^~\\&|SND|SND|RCV|RCV|20230101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345||DOE^JOHN\r";

    #[test]
    fn parses_header_metadata() {
        let msg = parse_message(ADT);
        assert!(msg.is_valid, "{:?}", msg.validation_errors);
        assert_eq!(msg.id, "MSG0001");
        assert_eq!(msg.version, "2.5");
        let header = msg.header.as_ref().unwrap();
        assert_eq!(header.sending_application, "SND");
        assert_eq!(header.trigger_event, "A01");
        assert_eq!(header.processing_id, "P");
        assert_eq!(msg.message_type_code(), "ADT^A01");
    }

    #[test]
    fn msh_fields_use_standard_numbering() {
        let msg = parse_message(ADT);
        let msh = msg.segment("MSH").unwrap();
        assert_eq!(msh.field_value(1), "|");
        assert_eq!(msh.field_value(2), "^~\\&");
        assert!(msh.field(2).unwrap().components.is_empty());
        assert_eq!(msh.field_value(3), "SND");
        assert_eq!(msh.field_value(10), "MSG0001");
    }

    #[test]
    fn round_trips_unmodified_text() {
        for raw in [
            ADT,
            "MSH|^~\\&|A|B|C|D|200405141144||ORU^R01|1|P|2.3\rOBX|1|NM|GLU^Glucose||5.5|mmol/L\rOBX|2|ST|NOTE||a\\T\\b~c&d||",
            "MSH|^~\\&|A|B\r\nPID|||1~2^^^X&Y\r\n",
            "MSH!@#$%!A!B!!!!!ADT@A04!X1!P!2.4\rPID!1!!9@@@MRN",
        ] {
            let msg = parse_message(raw);
            assert_eq!(msg.to_hl7_string(), raw);
        }
    }

    #[test]
    fn blank_lines_are_dropped() {
        let raw = "MSH|^~\\&|A|B|C|D|20230101||ADT^A01|1|P|2.5\r\rPID|1\r\r";
        let msg = parse_message(raw);
        assert!(msg.is_valid);
        assert_eq!(msg.segments.len(), 2);
        assert_eq!(msg.segments[1].sequence, 2);
        assert_eq!(msg.to_hl7_string(), "MSH|^~\\&|A|B|C|D|20230101||ADT^A01|1|P|2.5\rPID|1\r");
    }

    #[test]
    fn custom_delimiters_drive_the_whole_message() {
        let msg = parse_message("MSH!@#$%!A!B!!!!!ADT@A04!X1!P!2.4\rPID!1!!9@@@MRN");
        assert_eq!(msg.delimiters.field, '!');
        assert_eq!(msg.message_type, MessageType::Adt);
        assert_eq!(msg.trigger_event(), Some("A04"));
        let pid = msg.segment("PID").unwrap();
        assert_eq!(pid.field(3).unwrap().component(4), Some("MRN"));
    }

    #[test]
    fn missing_header_is_recorded_not_thrown() {
        let msg = parse_message("PID|1||12345\rPV1|1|I");
        assert!(!msg.is_valid);
        assert_eq!(msg.segments.len(), 2);
        assert!(msg.validation_errors[0].contains("First segment must be MSH"));
        assert_eq!(msg.message_type, MessageType::Unknown);
    }

    #[test]
    fn malformed_segments_are_kept_best_effort() {
        let msg = parse_message("MSH|^~\\&|A|B|C|D|||ADT^A01|9|P|2.5\rpid|x\rPID|1");
        assert!(!msg.is_valid);
        assert_eq!(msg.segments.len(), 3);
        assert!(msg.validation_errors.iter().any(|e| e.contains("invalid type 'pid'")));
    }

    #[test]
    fn empty_text_is_invalid() {
        let msg = parse_message("");
        assert!(!msg.is_valid);
        assert!(msg.segments.is_empty());
        assert_eq!(msg.to_hl7_string(), "");
    }

    #[test]
    fn missing_required_header_fields_are_reported() {
        let msg = parse_message("MSH|^~\\&|A");
        assert_eq!(msg.validation_errors.len(), 3);
    }

    #[test]
    fn set_field_value_updates_raw() {
        let mut msg = parse_message(ADT);
        assert!(msg.set_field_value("PID", 5, "ROE^JANE"));
        assert!(msg.raw.contains("PID|1||12345||ROE^JANE\r"));
        assert!(!msg.set_field_value("ZZZ", 1, "x"));
    }
}
