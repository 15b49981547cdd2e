use super::Framing;
use crate::error::{CoreError, Result};

/// Default maximum frame payload size: 64 MiB (§4.2, §6).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length-prefixed framing used on the data channel: `u32_be(len) || payload`.
///
/// A declared length greater than `max_frame_size` is a framing error and is fatal
/// to the owning channel (§7 — framing errors terminate the channel).
#[derive(Debug)]
pub struct LengthPrefixedFraming {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl LengthPrefixedFraming {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }
}

impl Default for LengthPrefixedFraming {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Framing for LengthPrefixedFraming {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buffer[..4].try_into().unwrap()) as usize;
        if len > self.max_frame_size {
            return Err(CoreError::Framing(format!(
                "declared frame length {len} exceeds max {}",
                self.max_frame_size
            )));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let remainder = self.buffer.split_off(4 + len);
        let frame = std::mem::replace(&mut self.buffer, remainder);
        Ok(Some(frame[4..].to_vec()))
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_single_frame() {
        let mut f = LengthPrefixedFraming::default();
        let wire = f.encode(b"hello");
        f.feed(&wire);
        assert_eq!(f.next_frame().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(f.next_frame().unwrap(), None);
    }

    #[test]
    fn reassembles_a_frame_split_across_feeds() {
        let mut f = LengthPrefixedFraming::default();
        let wire = f.encode(b"hello world");
        f.feed(&wire[..3]);
        assert_eq!(f.next_frame().unwrap(), None);
        f.feed(&wire[3..]);
        assert_eq!(f.next_frame().unwrap(), Some(b"hello world".to_vec()));
    }

    #[test]
    fn oversized_declared_length_is_a_framing_error() {
        let mut f = LengthPrefixedFraming::new(4);
        f.feed(&10u32.to_be_bytes());
        assert!(matches!(f.next_frame(), Err(CoreError::Framing(_))));
    }

    #[test]
    fn decodes_multiple_frames_from_one_feed() {
        let mut f = LengthPrefixedFraming::default();
        let mut wire = f.encode(b"a");
        wire.extend(f.encode(b"bb"));
        f.feed(&wire);
        assert_eq!(f.next_frame().unwrap(), Some(b"a".to_vec()));
        assert_eq!(f.next_frame().unwrap(), Some(b"bb".to_vec()));
        assert_eq!(f.next_frame().unwrap(), None);
    }
}
