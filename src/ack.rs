//! HL7 acknowledgments: the codes, the `MSH`/`MSA`/`ERR` message the listener writes back,
//! and parsing of whatever a remote listener sent us.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MllpError;
use crate::hl7::{datetime, escape, parse_message, Delimiters, Hl7Message};
use crate::mllp;

pub const ACK_SENDING_APPLICATION: &str = "HL7Processor";
pub const ACK_SENDING_FACILITY: &str = "Local";
pub const ACK_RECEIVING_APPLICATION: &str = "Sender";
pub const ACK_RECEIVING_FACILITY: &str = "Remote";
pub const ACK_VERSION: &str = "2.5";

/// `MSA-1` acknowledgment codes, original (application) and enhanced (commit) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AckCode {
    #[default]
    ApplicationAccept,
    ApplicationError,
    ApplicationReject,
    CommitAccept,
    CommitError,
    CommitReject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::ApplicationAccept => "AA",
            AckCode::ApplicationError => "AE",
            AckCode::ApplicationReject => "AR",
            AckCode::CommitAccept => "CA",
            AckCode::CommitError => "CE",
            AckCode::CommitReject => "CR",
        }
    }

    /// Unknown codes map to `AA`.
    pub fn from_code(code: &str) -> AckCode {
        match code.trim().to_ascii_uppercase().as_str() {
            "AE" => AckCode::ApplicationError,
            "AR" => AckCode::ApplicationReject,
            "CA" => AckCode::CommitAccept,
            "CE" => AckCode::CommitError,
            "CR" => AckCode::CommitReject,
            _ => AckCode::ApplicationAccept,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, AckCode::ApplicationAccept | AckCode::CommitAccept)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the acknowledgment text (unframed) for `control_id`.
pub fn build_ack(control_id: &str, code: AckCode, error: Option<&str>) -> String {
    build_ack_at(control_id, code, error, Utc::now())
}

pub fn build_ack_at(
    control_id: &str,
    code: AckCode,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> String {
    let delimiters = Delimiters::default();
    let control_id = escape(control_id, &delimiters);

    let mut ack = format!(
        "MSH|^~\\&|{}|{}|{}|{}|{}||ACK^A01|{}|P|{}\rMSA|{}|{}\r",
        ACK_SENDING_APPLICATION,
        ACK_SENDING_FACILITY,
        ACK_RECEIVING_APPLICATION,
        ACK_RECEIVING_FACILITY,
        datetime::format_timestamp(&at),
        control_id,
        ACK_VERSION,
        code,
        control_id
    );
    if let Some(error) = error.filter(|e| !e.is_empty()) {
        ack.push_str("ERR|||");
        ack.push_str(&escape(error, &delimiters));
        ack.push('\r');
    }
    ack
}

/// What the listener decided to answer for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgment {
    pub code: AckCode,
    /// `MSH-10` of the inbound message, empty when it had none
    pub control_id: String,
    pub error: Option<String>,
    pub text: String,
}

impl Acknowledgment {
    /// `AA` for a valid message, `AE` when it parsed with problems, `AR` when it has no header at all.
    pub fn for_message(message: &Hl7Message) -> Acknowledgment {
        let control_id = message.control_id().unwrap_or_default().to_string();

        let (code, error) = if message.header.is_none() {
            (
                AckCode::ApplicationReject,
                Some("Message has no MSH header".to_string()),
            )
        } else if !message.is_valid {
            (
                AckCode::ApplicationError,
                Some(message.validation_errors.join("; ")),
            )
        } else {
            (AckCode::ApplicationAccept, None)
        };

        let text = build_ack(&control_id, code, error.as_deref());
        Acknowledgment {
            code,
            control_id,
            error,
            text,
        }
    }

    pub fn for_raw(raw: &str) -> Acknowledgment {
        Acknowledgment::for_message(&parse_message(raw))
    }
}

/// An acknowledgment received from a remote listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckInfo {
    pub code: AckCode,
    /// `MSA-1` exactly as received
    pub raw_code: String,
    /// `MSH-10` of the acknowledgment itself
    pub control_id: String,
    /// `MSA-2`, the control id being acknowledged
    pub acknowledged_control_id: String,
    pub text_message: Option<String>,
    pub error: Option<String>,
}

impl AckInfo {
    pub fn is_accept(&self) -> bool {
        self.code.is_accept()
    }
}

/// Parses an acknowledgment, framed or not.
pub fn parse_ack(data: &[u8]) -> Result<AckInfo, MllpError> {
    let payload = mllp::strip_frame(data);
    let text = std::str::from_utf8(payload)
        .map_err(|e| MllpError::protocol(format!("acknowledgment is not UTF-8: {}", e)))?;

    let message = parse_message(text);
    let delimiters = message.delimiters;

    let msa = message
        .segment("MSA")
        .ok_or_else(|| MllpError::protocol("acknowledgment has no MSA segment"))?;
    let decoded = |value: &str| escape::unescape(value, &delimiters).into_owned();

    let raw_code = msa.field_value(1).to_string();
    let text_message = Some(decoded(msa.field_value(3))).filter(|t| !t.is_empty());
    let error = message.segment("ERR").and_then(|err| {
        err.fields
            .iter()
            .rev()
            .find(|f| !f.is_empty())
            .map(|f| f.decoded(&delimiters))
    });

    Ok(AckInfo {
        code: AckCode::from_code(&raw_code),
        raw_code,
        control_id: message
            .segment("MSH")
            .map(|msh| decoded(msh.field_value(10)))
            .unwrap_or_default(),
        acknowledged_control_id: decoded(msa.field_value(2)),
        text_message,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn codes_map_both_ways() {
        for code in [
            AckCode::ApplicationAccept,
            AckCode::ApplicationError,
            AckCode::ApplicationReject,
            AckCode::CommitAccept,
            AckCode::CommitError,
            AckCode::CommitReject,
        ] {
            assert_eq!(AckCode::from_code(code.as_str()), code);
        }
        assert_eq!(AckCode::from_code("??"), AckCode::ApplicationAccept);
        assert_eq!(AckCode::default().as_str(), "AA");
    }

    #[test]
    fn builds_the_documented_layout() {
        let at = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap();
        let ack = build_ack_at("MSG0001", AckCode::ApplicationAccept, None, at);
        assert_eq!(
            ack,
            "MSH|^~\\&|HL7Processor|Local|Sender|Remote|20230101120000||ACK^A01|MSG0001|P|2.5\rMSA|AA|MSG0001\r"
        );
    }

    #[test]
    fn error_segment_is_escaped() {
        let at = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap();
        let ack = build_ack_at("1", AckCode::ApplicationError, Some("bad|field"), at);
        assert!(ack.ends_with("MSA|AE|1\rERR|||bad\\F\\field\r"));

        let info = parse_ack(ack.as_bytes()).unwrap();
        assert_eq!(info.error.as_deref(), Some("bad|field"));
        assert_eq!(info.code, AckCode::ApplicationError);
    }

    #[test]
    fn parses_framed_ack() {
        let ack = build_ack("MSG0001", AckCode::CommitAccept, None);
        let framed = mllp::wrap_frame(ack.as_bytes());
        let info = parse_ack(&framed).unwrap();
        assert!(info.is_accept());
        assert_eq!(info.raw_code, "CA");
        assert_eq!(info.control_id, "MSG0001");
        assert_eq!(info.acknowledged_control_id, "MSG0001");
        assert_eq!(info.error, None);
    }

    #[test]
    fn missing_msa_is_a_protocol_error() {
        let err = parse_ack(b"MSH|^~\\&|A|B|C|D|||ACK|1|P|2.5\r").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn acknowledgment_policy() {
        let ok = Acknowledgment::for_raw("MSH|^~\\&|A|B|C|D|20230101||ADT^A01|42|P|2.5\rPID|1");
        assert_eq!(ok.code, AckCode::ApplicationAccept);
        assert_eq!(ok.control_id, "42");

        let partial = Acknowledgment::for_raw("MSH|^~\\&|A|B|C|D|20230101||ADT^A01|43|P");
        assert_eq!(partial.code, AckCode::ApplicationError);
        assert!(partial.error.unwrap().contains("MSH-12"));

        let rejected = Acknowledgment::for_raw("PID|1||123");
        assert_eq!(rejected.code, AckCode::ApplicationReject);
        assert!(rejected.text.contains("ERR|||Message has no MSH header"));
    }
}
