//! Per-connection frame reassembly.
//!
//! A [`FrameBuffer`] owns two regions:
//! - a fixed-size scratch region that the completion port reads into, and
//! - a growable accumulator (`BytesMut`) holding everything received so far
//!   for the current message.
//!
//! The single-message API (`commit` / `append`) matches the one-request,
//! one-response exchange: the first delimited message completes the frame
//! and anything after it is dropped. The general API (`extend` /
//! `next_frame`) keeps trailing bytes so that several messages can be split
//! out of one accumulator.

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;

use super::{find_delimiter, DELIMITER};
use crate::error::ProtocolViolation;

/// Default scratch region size (bytes read per receive).
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 1024;

/// Default bound on an undelimited message (16MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Sizing for a connection's frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSettings {
    /// Size of the scratch region handed to each receive.
    pub receive_buffer_size: usize,
    /// Largest payload accepted before the delimiter must appear.
    pub max_message_size: usize,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// What to do when the peer closes the stream before sending `<EOF>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnterminatedPolicy {
    /// Report a protocol failure.
    #[default]
    Reject,
    /// Surface whatever was buffered (more than one byte) as the message.
    BestEffort,
}

/// Result of feeding bytes to the single-message API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// No delimiter yet; issue another read.
    Incomplete,
    /// The message preceding the delimiter.
    Complete(Bytes),
    /// The frame was already completed; the bytes were ignored.
    Drained,
}

/// Accumulates raw reads and detects the `<EOF>` delimiter.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Landing area for the most recent read.
    scratch: Box<[u8]>,
    /// Bytes of the message being reassembled.
    accumulated: BytesMut,
    /// Offset in `accumulated` where the next delimiter scan starts.
    scanned: usize,
    /// Set once the single-message API has produced its message.
    consumed: bool,
    max_message_size: usize,
}

impl FrameBuffer {
    pub fn new(settings: FrameSettings) -> Self {
        let scratch_size = settings.receive_buffer_size.max(1);
        Self {
            scratch: vec![0u8; scratch_size].into_boxed_slice(),
            accumulated: BytesMut::with_capacity(scratch_size),
            scanned: 0,
            consumed: false,
            max_message_size: settings.max_message_size,
        }
    }

    /// The region a receive operation fills.
    pub fn scratch_mut(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    /// Size of the scratch region.
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    /// Append the first `filled` bytes of the scratch region.
    pub fn commit(&mut self, filled: usize) -> Result<FrameStatus, ProtocolViolation> {
        if self.consumed {
            return Ok(FrameStatus::Drained);
        }
        let filled = filled.min(self.scratch.len());
        self.accumulated.extend_from_slice(&self.scratch[..filled]);
        self.complete_single()
    }

    /// Append raw bytes and check for a completed message.
    pub fn append(&mut self, raw: &[u8]) -> Result<FrameStatus, ProtocolViolation> {
        if self.consumed {
            return Ok(FrameStatus::Drained);
        }
        self.accumulated.extend_from_slice(raw);
        self.complete_single()
    }

    /// Append raw bytes without extracting anything (general framing).
    pub fn extend(&mut self, raw: &[u8]) {
        self.accumulated.extend_from_slice(raw);
    }

    /// Split the next delimited message off the accumulator, keeping any
    /// bytes after its delimiter for the following call.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolViolation> {
        self.split_next()
    }

    /// Best-effort result when the stream closed without a delimiter.
    ///
    /// Returns the buffered bytes when more than one byte is pending, and
    /// `None` for an empty (or single-byte) accumulator or an already
    /// consumed frame.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.consumed || self.accumulated.len() <= 1 {
            self.accumulated.clear();
            self.scanned = 0;
            return None;
        }
        self.consumed = true;
        self.scanned = 0;
        Some(self.accumulated.split().freeze())
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    /// Whether the single-message API already produced its message.
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Drop buffered bytes and start over.
    pub fn clear(&mut self) {
        self.accumulated.clear();
        self.scanned = 0;
        self.consumed = false;
    }

    fn complete_single(&mut self) -> Result<FrameStatus, ProtocolViolation> {
        match self.split_next()? {
            Some(message) => {
                self.consumed = true;
                self.accumulated.clear();
                self.scanned = 0;
                Ok(FrameStatus::Complete(message))
            }
            None => Ok(FrameStatus::Incomplete),
        }
    }

    fn split_next(&mut self) -> Result<Option<Bytes>, ProtocolViolation> {
        let start = self.scanned.min(self.accumulated.len());

        if let Some(pos) = find_delimiter(&self.accumulated[start..]) {
            let end = start + pos;
            if end > self.max_message_size {
                return Err(ProtocolViolation::Oversized {
                    limit: self.max_message_size,
                });
            }
            let message = self.accumulated.split_to(end).freeze();
            self.accumulated.advance(DELIMITER.len());
            self.scanned = 0;
            return Ok(Some(message));
        }

        // The last len-1 bytes may be the head of a split delimiter.
        self.scanned = self.accumulated.len().saturating_sub(DELIMITER.len() - 1);
        if self.scanned > self.max_message_size {
            return Err(ProtocolViolation::Oversized {
                limit: self.max_message_size,
            });
        }
        Ok(None)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(FrameSettings::default())
    }
}
