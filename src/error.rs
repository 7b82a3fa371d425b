//! Error types for every layer of the crate.
//!
//! Per-message and per-field problems are not errors here: they surface as
//! validation strings on [`Hl7Message`](crate::hl7::Hl7Message) or as
//! warnings on a transformation outcome. What remains are transport failures,
//! structural failures and broken configuration.

use thiserror::Error;

/// Failures of the MLLP transport.
#[derive(Error, Debug)]
pub enum MllpError {
    /// Socket level failure (reset, refused, broken pipe...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes on the wire did not follow MLLP framing, or an ACK was not shaped like one
    #[error("MLLP protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Connection closed by remote peer")]
    ConnectionClosed,
}

impl MllpError {
    pub fn protocol(message: impl Into<String>) -> Self {
        MllpError::Protocol(message.into())
    }

    /// True for framing/shape errors, false for socket and timing failures.
    pub fn is_protocol(&self) -> bool {
        matches!(self, MllpError::Protocol(_))
    }
}

/// Structural failures of the HL7 codec and the format converters.
#[derive(Error, Debug)]
pub enum Hl7Error {
    #[error("Message has no MSH header segment")]
    MissingHeader,

    #[error("Invalid message structure: {0}")]
    InvalidStructure(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),
}

impl From<quick_xml::Error> for Hl7Error {
    fn from(err: quick_xml::Error) -> Self {
        Hl7Error::Xml(err.to_string())
    }
}

/// A mapping configuration that must be rejected before any message is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Source field '{0}' is mapped more than once")]
    DuplicateSourceField(String),

    #[error("Invalid pattern '{pattern}' in {context}: {source}")]
    InvalidPattern {
        context: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures of a whole-message transformation.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Hl7(#[from] Hl7Error),

    /// A typed result could not be built from a mapped record
    #[error("Cannot build {target}: {message}")]
    Build { target: String, message: String },
}

/// Failures of the persistence and queue collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No message stored with id '{0}'")]
    NotFound(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),
}
