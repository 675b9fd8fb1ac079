//! `<EOF>`-delimited framing protocol.
//!
//! A logical message is an arbitrary byte sequence terminated by the literal
//! 5-byte marker `<EOF>` (`3C 45 4F 46 3E`). There is no header and no length
//! prefix, so the receiver has to scan the stream for the marker. The marker
//! is never part of the payload.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  <payload bytes><EOF>
//! Response: <handler output><EOF>
//!
//! Example:
//! Request:  This is a test<EOF>
//! Response: This is a test<EOF>
//! ```
//!
//! Each connection carries exactly one request and one response. The server
//! closes the connection after writing the response.
//!
//! ## Fragmentation
//!
//! TCP may deliver `payload + <EOF>` in any number of pieces, including a
//! split in the middle of the marker. [`FrameBuffer`] accumulates deliveries
//! and resumes its scan just before the previous end of data, so the marker
//! is found however the bytes are cut.

pub mod frame_buffer;

pub use frame_buffer::{
    FrameBuffer, FrameSettings, FrameStatus, UnterminatedPolicy, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_RECEIVE_BUFFER_SIZE,
};

use bytes::{BufMut, Bytes, BytesMut};

/// The frame delimiter.
pub const DELIMITER: &[u8] = b"<EOF>";

/// Frame a payload for the wire: `payload` followed by `<EOF>`.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + DELIMITER.len());
    frame.put_slice(payload);
    frame.put_slice(DELIMITER);
    frame.freeze()
}

/// Find the start of the first delimiter in `buffer`.
pub fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}
