//! The HL7 v2 codec: delimiters, escaping, timestamps and the
//! Message → Segment → Field → Component → SubComponent tree.

pub mod datetime;
pub mod delimiters;
pub mod escape;
pub mod message;
pub mod parser;

pub use delimiters::Delimiters;
pub use escape::{escape, unescape};
pub use message::{Component, Field, Hl7Message, MessageHeader, MessageType, Segment, SubComponent};
pub use parser::{parse_message, parse_segment};
