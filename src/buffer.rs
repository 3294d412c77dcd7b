//! Sliding read window over the target stream.

use std::io::{self, Read};

/// Upper bound of the initial window size.
pub const INIT_BUFFER_SIZE: usize = 16 * 1024;

/// Initial capacity for a window that must hold blocks of `block_size` bytes.
pub fn window_capacity(block_size: usize) -> usize {
    INIT_BUFFER_SIZE.min(block_size * 4).max(block_size + 1024)
}

/// A buffer with a cursor over a sequential reader.
///
/// Bytes before the cursor are consumed and may be discarded on the next
/// refill. Bytes at and after the cursor stay addressable until
/// [`advance`](Self::advance) moves past them, so a caller can look ahead as
/// far as it asks [`fill`](Self::fill) for and still back out.
pub struct TargetWindow<R> {
    reader: R,
    buffer: Vec<u8>,
    cursor: usize,
    end: usize,
    eof: bool,
    consumed: u64,
}

impl<R: Read> TargetWindow<R> {
    /// Creates a window reading from `reader` with the given initial capacity.
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: vec![0u8; capacity.max(1)],
            cursor: 0,
            end: 0,
            eof: false,
            consumed: 0,
        }
    }

    /// Returns the number of buffered bytes at and after the cursor.
    #[inline]
    pub fn available(&self) -> usize {
        self.end - self.cursor
    }

    /// Returns the number of bytes consumed so far.
    #[inline]
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// Reads until at least `want` bytes are available or the reader ends.
    ///
    /// Returns the number of available bytes, which is below `want` only at
    /// the end of the stream.
    pub fn fill(&mut self, want: usize) -> io::Result<usize> {
        while self.available() < want && !self.eof {
            if self.cursor + want > self.buffer.len() {
                self.compact();
                if want > self.buffer.len() {
                    self.buffer.resize(want.next_power_of_two(), 0);
                }
            }
            match self.reader.read(&mut self.buffer[self.end..]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.end += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(self.available())
    }

    /// Returns the next `len` buffered bytes without consuming them.
    #[inline]
    pub fn window(&self, len: usize) -> &[u8] {
        &self.buffer[self.cursor..self.cursor + len]
    }

    /// Returns the buffered byte `index` positions after the cursor.
    #[inline]
    pub fn byte_at(&self, index: usize) -> u8 {
        self.buffer[self.cursor + index]
    }

    /// Consumes `n` buffered bytes.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.cursor += n;
        self.consumed += n as u64;
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.buffer.copy_within(self.cursor..self.end, 0);
            self.end -= self.cursor;
            self.cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most `max` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        max: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.max).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_window_capacity() {
        assert_eq!(window_capacity(16), 16 + 1024);
        assert_eq!(window_capacity(1024), 4096);
        assert_eq!(window_capacity(8192), 16 * 1024);
        assert_eq!(window_capacity(20_000), 20_000 + 1024);
    }

    #[test]
    fn test_fill_and_advance() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut window = TargetWindow::with_capacity(
            Trickle {
                data: &data,
                max: 7,
            },
            16,
        );

        assert_eq!(window.fill(10).unwrap(), 14);
        assert_eq!(window.window(4), &[0, 1, 2, 3]);
        window.advance(12);
        assert_eq!(window.position(), 12);
        assert_eq!(window.byte_at(0), 12);

        // Looking further ahead than the initial capacity grows the buffer.
        assert!(window.fill(40).unwrap() >= 40);
        assert_eq!(window.window(40), &data[12..52]);
    }

    #[test]
    fn test_exhaustion() {
        let data = b"short";
        let mut window = TargetWindow::with_capacity(&data[..], 4);
        assert_eq!(window.fill(16).unwrap(), 5);
        window.advance(5);
        assert_eq!(window.fill(1).unwrap(), 0);
        assert_eq!(window.position(), 5);
    }
}
