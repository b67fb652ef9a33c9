//! Fixed-capacity, single-owner read/write cursor over a contiguous byte
//! region. The primitive used for I/O framing throughout the server:
//! the per-connection input buffer and every queued outbound response
//! buffer are instances of this type.
//!
//! Invariant: `read_pos <= write_pos <= size` always holds; every
//! method that moves a cursor maintains it.

use std::fmt;

#[derive(Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn with_capacity(size: usize) -> Self {
        Buffer {
            data: vec![0u8; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let write_pos = data.len();
        Buffer {
            data,
            read_pos: 0,
            write_pos,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Bytes available to append before the buffer is full.
    pub fn space(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Bytes available to read (`[read_pos, write_pos)`).
    pub fn left(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.left() == 0
    }

    /// The unread region.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// The writable tail `[write_pos, size)`, for filling directly
    /// from a `read()` syscall without an intermediate copy.
    pub fn write_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Record that `n` bytes were written into [`Buffer::write_slice_mut`].
    pub fn commit_write(&mut self, n: usize) {
        debug_assert!(self.write_pos + n <= self.data.len());
        self.write_pos += n;
    }

    /// Caller guarantees `bytes.len() <= self.space()`.
    pub fn append(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.space());
        let end = self.write_pos + bytes.len();
        self.data[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
    }

    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(self.read_pos + n <= self.write_pos);
        self.read_pos = (self.read_pos + n).min(self.write_pos);
    }

    pub fn reset_read(&mut self) {
        self.read_pos = 0;
    }

    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// First occurrence of `needle` within `[read_pos, write_pos)`, as
    /// an offset from `read_pos`, or `None` if absent.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.left() {
            return None;
        }
        self.unread()
            .windows(needle.len())
            .position(|w| w == needle)
    }

    /// Advance the read cursor past the first occurrence of `needle`.
    /// Leaves the cursor untouched and returns `false` if not found.
    pub fn shift_read_after(&mut self, needle: &[u8]) -> bool {
        match self.find(needle) {
            Some(pos) => {
                self.advance_read(pos + needle.len());
                true
            }
            None => false,
        }
    }

    /// Slide `[read_pos, write_pos)` down to offset 0, zero-filling the
    /// freed tail. Preserves all unread bytes.
    pub fn drop_read(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let len = self.left();
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        for b in &mut self.data[len..self.write_pos] {
            *b = 0;
        }
        self.read_pos = 0;
        self.write_pos = len;
    }

    /// Resize the backing storage to `n` bytes, preserving
    /// `[read_pos, write_pos)` as far as it fits. If `n` is smaller
    /// than the preserved length, both cursors clamp to `n`.
    pub fn resize(&mut self, n: usize) {
        self.drop_read();
        self.data.resize(n, 0);
        if self.write_pos > n {
            self.write_pos = n;
        }
        if self.read_pos > self.write_pos {
            self.read_pos = self.write_pos;
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_find() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(b"EHLO foo\r\n");
        assert_eq!(buf.find(b"\r\n"), Some(8));
    }

    #[test]
    fn shift_read_after_advances_past_needle() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(b"MAIL\r\nRCPT\r\n");
        assert!(buf.shift_read_after(b"\r\n"));
        assert_eq!(buf.unread(), b"RCPT\r\n");
    }

    #[test]
    fn shift_read_after_missing_needle_is_noop() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(b"MAIL");
        assert!(!buf.shift_read_after(b"\r\n"));
        assert_eq!(buf.unread(), b"MAIL");
    }

    #[test]
    fn drop_read_compacts_and_preserves_unread() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.advance_read(10);
        buf.drop_read();
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(buf.unread(), b"abcdef");
        assert_eq!(buf.space(), 10);
    }

    #[test]
    fn resize_preserves_unread_when_growing() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.advance_read(2);
        buf.resize(16);
        assert_eq!(buf.unread(), b"cdef");
        assert_eq!(buf.size(), 16);
    }

    #[test]
    fn resize_clamps_cursors_when_shrinking_below_unread_len() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.advance_read(4);
        buf.resize(6);
        assert_eq!(buf.size(), 6);
        assert!(buf.read_pos() <= buf.write_pos());
        assert!(buf.write_pos() <= 6);
    }

    #[test]
    fn resize_then_resize_preserves_content_law() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"hello!!!"[..6].into());
        buf.resize(4);
        let unread_after_first = buf.unread().to_vec();
        buf.resize(unread_after_first.len().max(10));
        assert_eq!(buf.unread(), &unread_after_first[..]);
    }

    #[test]
    fn invariant_read_le_write_le_size_holds() {
        let mut buf = Buffer::with_capacity(10);
        buf.append(b"abc");
        buf.advance_read(1);
        assert!(buf.read_pos() <= buf.write_pos());
        assert!(buf.write_pos() <= buf.size());
    }
}
