//! Bounded scrollback for replay on reattach.
//!
//! Keeps the most recent `capacity` bytes of PTY output in emission order so
//! a reconnecting client can redraw its terminal without the server keeping
//! unbounded history.

use std::collections::VecDeque;

/// A byte buffer trimmed from the front once it exceeds its capacity.
#[derive(Debug)]
pub struct Scrollback {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Total bytes ever appended (used to detect trimming).
    total_written: u64,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total_written: 0,
        }
    }

    /// Append output, discarding the oldest bytes beyond capacity.
    pub fn append(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        self.total_written += chunk.len() as u64;

        if chunk.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(chunk);
    }

    /// Buffered bytes, oldest first.
    ///
    /// When the front has been trimmed, a partial UTF-8 sequence left at the
    /// start is skipped. An incomplete sequence at the end is held back until
    /// the rest of it arrives.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);

        if self.was_trimmed() {
            let partial = out
                .iter()
                .take(3)
                .take_while(|b| (**b & 0xC0) == 0x80)
                .count();
            out.drain(..partial);
        }
        let pending = incomplete_tail(&out);
        out.truncate(out.len() - pending);
        out
    }

    /// Snapshot as text for an `output` frame.
    pub fn snapshot_text(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    fn was_trimmed(&self) -> bool {
        self.total_written > self.buf.len() as u64
    }
}

/// Length of a UTF-8 sequence at the end of `bytes` that is still missing
/// continuation bytes.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_append_snapshot() {
        let mut sb = Scrollback::new(10);
        sb.append(b"hello");
        assert_eq!(sb.snapshot(), b"hello");
        assert_eq!(sb.len(), 5);
    }

    #[test]
    fn trims_oldest_first() {
        let mut sb = Scrollback::new(5);
        sb.append(b"abcde");
        sb.append(b"fg");
        assert_eq!(sb.snapshot(), b"cdefg");
        assert_eq!(sb.len(), 5);
        assert_eq!(sb.total_written(), 7);
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut sb = Scrollback::new(4);
        sb.append(b"xy");
        sb.append(b"0123456789");
        assert_eq!(sb.snapshot(), b"6789");
    }

    #[test]
    fn snapshot_is_suffix_of_everything_written() {
        let mut sb = Scrollback::new(64);
        let mut all = Vec::new();
        for i in 0..100 {
            let line = format!("line {i}\n");
            all.extend_from_slice(line.as_bytes());
            sb.append(line.as_bytes());
        }
        let snap = sb.snapshot();
        assert_eq!(snap.len(), 64);
        assert!(all.ends_with(&snap));
    }

    #[test]
    fn trimmed_snapshot_skips_partial_char() {
        let mut sb = Scrollback::new(4);
        // "é" is two bytes; trimming leaves its continuation byte first.
        sb.append("aé".as_bytes());
        sb.append(b"bcd");
        assert_eq!(sb.snapshot_text(), "bcd");
    }

    #[test]
    fn snapshot_holds_back_unfinished_char() {
        let mut sb = Scrollback::new(64);
        let euro = "€".as_bytes();
        sb.append(b"ab");
        sb.append(&euro[..2]);
        assert_eq!(sb.snapshot_text(), "ab");
        assert_eq!(sb.len(), 4);

        sb.append(&euro[2..]);
        assert_eq!(sb.snapshot_text(), "ab€");
    }

    #[test]
    fn complete_multibyte_tail_is_kept() {
        let mut sb = Scrollback::new(64);
        sb.append("é€😀".as_bytes());
        assert_eq!(sb.snapshot_text(), "é€😀");

        let mut sb = Scrollback::new(64);
        let emoji = "😀".as_bytes();
        sb.append(b"x");
        sb.append(&emoji[..3]);
        assert_eq!(sb.snapshot(), b"x");
    }

    #[test]
    fn empty_buffer() {
        let sb = Scrollback::new(10);
        assert!(sb.is_empty());
        assert_eq!(sb.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn zero_capacity() {
        let mut sb = Scrollback::new(0);
        sb.append(b"test");
        assert!(sb.is_empty());
    }
}
