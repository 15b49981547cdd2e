//! Framing (C2): splits a raw byte stream into message boundaries.
//!
//! Both variants carry an internal partial-frame buffer and must handle arbitrary
//! splits across read callbacks — a single logical message may span several reads,
//! or several messages may arrive in one read.

mod length_prefixed;
mod line;

pub use length_prefixed::{LengthPrefixedFraming, DEFAULT_MAX_FRAME_SIZE};
pub use line::LineFraming;

use crate::error::Result;

/// Stateful message-boundary detector over a growing byte buffer.
pub trait Framing: Send {
    /// Appends freshly-read bytes to the internal buffer.
    fn feed(&mut self, bytes: &[u8]);

    /// Pops the next complete frame payload, if the buffer holds one.
    ///
    /// Called repeatedly until it returns `Ok(None)` — a single `feed` may unlock
    /// more than one frame.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Discards any partial buffer content.
    fn reset(&mut self);

    /// Number of buffered, not-yet-decodable bytes (diagnostics).
    fn buffered_len(&self) -> usize;

    /// Encodes a payload into the bytes that should be written to the transport.
    fn encode(&self, payload: &[u8]) -> Vec<u8>;
}
