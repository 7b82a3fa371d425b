use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MllpError;
use crate::mllp::{self, FrameStatus, END_BLOCK};

/// Frames larger than this are treated as garbage and dropped.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// A tokio codec for MLLP frames, generally used within a
/// [Framed](https://docs.rs/tokio-util/latest/tokio_util/codec/struct.Framed.html).
///
/// Decoding yields the payload of each frame with the envelope removed. Framing problems
/// never end the stream: noise ahead of a start block is discarded, and a buffer that
/// outgrows `max_frame_length` without completing a frame is dropped so reading can
/// resume at the next start block.
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_length: usize,
}

impl Default for MllpCodec {
    fn default() -> Self {
        MllpCodec::new()
    }
}

impl MllpCodec {
    /// Creates a new Codec instance, but can be instantiated standalone for testing purposes etc.
    /// Example:
    /// ```
    /// use hl7_processor::MllpCodec;
    /// let mllp = MllpCodec::new();
    /// ```
    pub fn new() -> Self {
        MllpCodec {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        MllpCodec { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

// Support decoding data from an MLLP Frame.
// This is used for receiving the primary HL7 message in a listener, and also decoding any ACK/NACK responses in a publisher.
impl Decoder for MllpCodec {
    type Item = BytesMut;
    type Error = MllpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match mllp::extract_frame(src, src.len())? {
            FrameStatus::Complete(frame) => {
                if frame.skipped() > 0 {
                    warn!(
                        "MLLP: Discarding {} bytes received ahead of the start block",
                        frame.skipped()
                    );
                }

                // take exactly this frame, anything after it stays in src for the next call
                let mut payload = src.split_to(frame.consumed());
                payload.truncate(frame.end - END_BLOCK.len());
                payload.advance(frame.start + 1);

                debug!("MLLP: Decoded frame of {} bytes", payload.len());
                Ok(Some(payload))
            }
            FrameStatus::Incomplete => {
                if src.len() > self.max_frame_length {
                    warn!(
                        "MLLP: {} bytes buffered without a complete frame (max {}), dropping them",
                        src.len(),
                        self.max_frame_length
                    );
                    src.clear();
                } else {
                    trace!("MLLP: Waiting for more data, {} bytes buffered", src.len());
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    warn!(
                        "MLLP: Stream closed with {} bytes of an incomplete frame, dropping them",
                        buf.len()
                    );
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

// Support encoding data as an MLLP Frame.
// This is used for both the primary HL7 message sent from a publisher, and also any ACK/NACK messages sent from a Listener.
impl<T: AsRef<[u8]>> Encoder<T> for MllpCodec {
    type Error = MllpError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.as_ref();
        mllp::wrap_frame_into(payload, dst);
        debug!("MLLP: Encoded {} bytes for send", payload.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    fn wrap_for_mllp(s: &str) -> Bytes {
        Bytes::from(format!("\x0B{}\x1C\x0D", s))
    }

    fn wrap_for_mllp_mut(s: &str) -> BytesMut {
        BytesMut::from(format!("\x0B{}\x1C\x0D", s).as_str())
    }

    #[test]
    fn implements_default() {
        let m = MllpCodec::default();
        assert_eq!(m.max_frame_length(), DEFAULT_MAX_FRAME_LENGTH);
    }

    #[test]
    fn wraps_simple_data() {
        let mut m = MllpCodec::new();
        let mut output_buf = BytesMut::with_capacity(64);

        match m.encode("abcd", &mut output_buf) {
            Ok(()) => {}
            _ => panic!("Non OK value returned from encode"),
        }
        assert_eq!(output_buf.freeze(), wrap_for_mllp("abcd"));
    }

    #[test]
    fn ensure_decoder_finds_simple_message() {
        let mut data = wrap_for_mllp_mut("abcd");
        let mut m = MllpCodec::new();

        match m.decode(&mut data) {
            Ok(Some(message)) => assert_eq!(&message[..], b"abcd"),
            Ok(None) => panic!("Failed to find a simple message!"),
            Err(err) => panic!("Error looking for simple message: {:?}", err),
        }
    }

    #[test]
    fn ensure_data_after_end_is_kept_for_next_call() {
        let mut data = BytesMut::from("\x0BTest Data\x1C\x0D\x0BMore Data\x1C\x0D");
        let mut m = MllpCodec::new();

        match m.decode(&mut data) {
            Ok(Some(message)) => assert_eq!(&message[..], b"Test Data"),
            _ => panic!("Failed to decode first message"),
        }
        assert_eq!(&data[..], b"\x0BMore Data\x1C\x0D");

        match m.decode(&mut data) {
            Ok(Some(message)) => assert_eq!(&message[..], b"More Data"),
            _ => panic!("Failed to decode second message"),
        }
        assert!(data.is_empty());
    }

    #[test]
    fn ensure_no_data_is_left_on_the_stream() {
        let mut data = BytesMut::from("\x0BTest Data\x1C\x0D");
        let mut m = MllpCodec::new();

        let _result = m.decode(&mut data);

        assert_eq!(
            data.len(),
            0,
            "Decoder left data sitting in the buffer after read!"
        );
    }

    #[test]
    fn test_message_split_over_multiple_calls() {
        let mut mllp = MllpCodec::new();
        let mut buffer = BytesMut::from("\x0BTest");

        match mllp.decode(&mut buffer) {
            Ok(None) => {}
            _ => panic!("Data returned from call to decode() without footer!"),
        }

        buffer.put_slice(b" Data");
        match mllp.decode(&mut buffer) {
            Ok(None) => {}
            _ => panic!("Data returned from call to decode() without footer!"),
        }

        buffer.put_slice(b" Here\x1C\x0D");
        match mllp.decode(&mut buffer) {
            Ok(Some(message)) => assert_eq!(&message[..], b"Test Data Here"),
            Ok(None) => panic!("decode didn't find a message on the third call..."),
            Err(err) => panic!("Unexpected error when decoding split packets: {:?}", err),
        }
    }

    #[test]
    fn oversized_partial_frame_is_dropped() {
        let mut mllp = MllpCodec::with_max_frame_length(8);
        let mut buffer = BytesMut::from("\x0B0123456789");

        assert!(matches!(mllp.decode(&mut buffer), Ok(None)));
        assert!(buffer.is_empty());

        buffer.put_slice(b"\x0Bok\x1C\x0D");
        match mllp.decode(&mut buffer) {
            Ok(Some(message)) => assert_eq!(&message[..], b"ok"),
            other => panic!("decoder did not recover: {:?}", other),
        }
    }

    #[test]
    fn eof_with_partial_frame_is_not_an_error() {
        let mut mllp = MllpCodec::new();
        let mut buffer = BytesMut::from("\x0Bhalf a mess");

        assert!(matches!(mllp.decode_eof(&mut buffer), Ok(None)));
        assert!(buffer.is_empty());
    }
}
