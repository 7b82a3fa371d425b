/*!
# HL7 v2 over MLLP, end to end.

 HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages over a TCP (or similar) transport.
 The full specification is available at [the HL7 site](https://www.hl7.org/documentcenter/private/standards/v3/V3_TRMLLP_R2_R2019.zip) (Note that they place the standards behind a free membership/login form).

 This crate covers the path from bytes on the wire to typed data and back:
 - [`MllpCodec`], a tokio [codec](https://docs.rs/tokio-util/latest/tokio_util/codec/index.html) for MLLP frames,
   plus a ready made listener ([`server::MllpServer`]) and publisher ([`client::MllpClient`]) that deal in
   HL7 acknowledgments.
 - [`hl7`], a delimiter-aware parser and serializer for the Segment/Field/Component/SubComponent tree.
   Serializing an unmodified message gives back the exact bytes it was parsed from, apart from blank
   lines between segments, which the parser drops.
 - [`transform`], a declarative mapping engine turning messages into flat typed records.
 - [`convert`], JSON and XML projections of a message.

 ## Example
 ### Publisher
 ```no_run
use bytes::*;
use tokio_util::codec::Framed;
use tokio::net::TcpStream;
use futures::{SinkExt, StreamExt};

use hl7_processor::MllpCodec;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Open a TCP stream to the socket address.
    let stream = TcpStream::connect("127.0.0.1:2575").await?;

    // Construct a MLLP transport using our codec
    let mut transport = Framed::new(stream, MllpCodec::new());

    // Send an HL7 message; the codec wraps it in the MLLP header/footer for us
    transport.send(BytesMut::from("MSH|^~\\&|SND|SND|RCV|RCV|20230101120000||ADT^A01|MSG0001|P|2.5\r")).await?;

    if let Some(response) = transport.next().await {
        match response {
            Ok(ack) => println!("  Received ack: {:?}", hl7_processor::ack::parse_ack(&ack)?),
            Err(e) => println!("  ERROR: {:?}", e)
        }
    }

    Ok(())
}
```

 ### Parsing and mapping
 ```
use hl7_processor::hl7::parse_message;
use hl7_processor::transform::{FieldMapping, FieldMappingConfiguration, TransformationEngine};

let message = parse_message("MSH|^~\\&|SND|SND|RCV|RCV|20230101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345||DOE^JOHN\r");
let config = FieldMappingConfiguration::new("demographics")
    .with_mapping(FieldMapping::new("PID-5-1", "familyName"));
let engine = TransformationEngine::new(config).unwrap();

assert_eq!(engine.transform_message(&message).text("familyName"), "DOE");
 ```
 */

pub mod ack;
pub mod client;
pub mod codecs;
pub mod convert;
pub mod error;
pub mod hl7;
pub mod mllp;
pub mod pipeline;
pub mod server;
pub mod settings;
pub mod store;
pub mod transform;

pub use codecs::MllpCodec;
pub use error::{ConfigError, Hl7Error, MllpError, StoreError, TransformError};
pub use hl7::{parse_message, Hl7Message};
