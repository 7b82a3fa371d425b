//! The non-network half of MLLP: finding, stripping and adding the frame envelope.
//!
//! MLLP Spec: https://www.hl7.org/implement/standards/product_brief.cfm?product_id=55
//!
//! A frame is `<VT> payload <FS><CR>`. Both the [codec](crate::MllpCodec) and any
//! hand-rolled read loop use [`extract_frame`] to pull one frame at a time out of an
//! accumulating buffer, removing exactly [`Frame::consumed`] leading bytes afterwards so
//! that anything trailing the frame stays put for the next pass.

use bytes::{BufMut, BytesMut};
use log::trace;
use std::ops::Range;

use crate::error::MllpError;

/// Vertical-Tab char, the marker for the start of a message
pub const START_BLOCK: u8 = 0x0B;
/// File-Separator char + CR, the marker for the end of a message
pub const END_BLOCK: [u8; 2] = [0x1C, 0x0D];
/// Bytes added around the payload by the envelope
pub const FRAME_OVERHEAD: usize = 3;

/// Location of one complete frame inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Index of the start block byte
    pub start: usize,
    /// Index one past the final byte of the end block
    pub end: usize,
}

impl Frame {
    /// Number of leading bytes the caller must remove from its buffer: any noise before the
    /// start block plus the frame itself.
    pub fn consumed(&self) -> usize {
        self.end
    }

    /// Bytes before the start block that did not belong to any frame.
    pub fn skipped(&self) -> usize {
        self.start
    }

    pub fn payload_range(&self) -> Range<usize> {
        self.start + 1..self.end - END_BLOCK.len()
    }

    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload_range()]
    }
}

/// Outcome of a single extraction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete(Frame),
    /// No complete frame yet; the caller keeps every byte.
    Incomplete,
}

/// Scans the first `valid_len` bytes of `buf` for one complete frame.
///
/// The first start block wins; the frame runs to the first end block following it.
pub fn extract_frame(buf: &[u8], valid_len: usize) -> Result<FrameStatus, MllpError> {
    if valid_len > buf.len() {
        return Err(MllpError::protocol(format!(
            "valid length {} exceeds buffer of {} bytes",
            valid_len,
            buf.len()
        )));
    }
    let data = &buf[..valid_len];

    let start = match data.iter().position(|b| *b == START_BLOCK) {
        Some(start) => start,
        None => {
            trace!("MLLP: No start block in {} bytes", valid_len);
            return Ok(FrameStatus::Incomplete);
        }
    };
    trace!("MLLP: Found start block at index {}", start);

    match find_end_block(&data[start + 1..]) {
        Some(offset) => {
            let end = start + 1 + offset + END_BLOCK.len();
            trace!("MLLP: Found end block, frame spans {}..{}", start, end);
            Ok(FrameStatus::Complete(Frame { start, end }))
        }
        None => {
            trace!("MLLP: Unable to find end block...");
            Ok(FrameStatus::Incomplete)
        }
    }
}

fn find_end_block(data: &[u8]) -> Option<usize> {
    data.windows(END_BLOCK.len()).position(|w| w == END_BLOCK)
}

/// Appends `payload` wrapped in the MLLP envelope to `dst`.
pub fn wrap_frame_into(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + FRAME_OVERHEAD); //we need an extra 3 bytes of space on top of the message proper
    dst.put_u8(START_BLOCK);
    dst.put_slice(payload);
    dst.put_slice(&END_BLOCK);
}

pub fn wrap_frame(payload: &[u8]) -> BytesMut {
    let mut dst = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
    wrap_frame_into(payload, &mut dst);
    dst
}

/// Strips the envelope from a buffer that must hold exactly one frame.
pub fn unwrap_frame(data: &[u8]) -> Result<&[u8], MllpError> {
    if data.len() < FRAME_OVERHEAD {
        return Err(MllpError::protocol(format!(
            "{} bytes is shorter than the MLLP envelope",
            data.len()
        )));
    }
    if data[0] != START_BLOCK {
        return Err(MllpError::protocol("missing start block"));
    }
    if !data.ends_with(&END_BLOCK) {
        return Err(MllpError::protocol("missing end block"));
    }
    Ok(&data[1..data.len() - END_BLOCK.len()])
}

/// Returns the payload if `data` looks framed, otherwise `data` untouched.
pub fn strip_frame(data: &[u8]) -> &[u8] {
    match data.first() {
        Some(&START_BLOCK) => unwrap_frame(data).unwrap_or(&data[1..]),
        _ => data,
    }
}
