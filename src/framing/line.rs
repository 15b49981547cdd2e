use super::Framing;
use crate::error::Result;

/// Line-delimited framing used on the control channel.
///
/// Encode = `payload || '\n'`. Decode scans for `'\n'` and returns the prefix with
/// the terminator stripped. Chosen for the control channel because a child's
/// stdout/stderr is otherwise human-readable at the line level.
#[derive(Debug, Default)]
pub struct LineFraming {
    buffer: Vec<u8>,
}

impl LineFraming {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Framing for LineFraming {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            Ok(Some(line[..line.len() - 1].to_vec()))
        } else {
            Ok(None)
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.extend_from_slice(payload);
        out.push(b'\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_single_line() {
        let mut f = LineFraming::new();
        f.feed(b"hello\n");
        assert_eq!(f.next_frame().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(f.next_frame().unwrap(), None);
    }

    #[test]
    fn reassembles_a_line_split_across_feeds() {
        let mut f = LineFraming::new();
        f.feed(b"hel");
        assert_eq!(f.next_frame().unwrap(), None);
        f.feed(b"lo\n");
        assert_eq!(f.next_frame().unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn decodes_multiple_lines_from_one_feed() {
        let mut f = LineFraming::new();
        f.feed(b"a\nb\nc\n");
        assert_eq!(f.next_frame().unwrap(), Some(b"a".to_vec()));
        assert_eq!(f.next_frame().unwrap(), Some(b"b".to_vec()));
        assert_eq!(f.next_frame().unwrap(), Some(b"c".to_vec()));
        assert_eq!(f.next_frame().unwrap(), None);
    }

    #[test]
    fn reset_discards_partial_buffer() {
        let mut f = LineFraming::new();
        f.feed(b"partial");
        f.reset();
        assert_eq!(f.buffered_len(), 0);
    }
}
