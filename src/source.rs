//! Random-access byte sources.
//!
//! The match engine, the patcher and the merger all read their source at
//! absolute offsets. [`SeekableSource::read_at`] is the primitive they use, so
//! no component depends on where a previous caller left the cursor.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{DeltaError, Result};

/// A source of bytes that can be positioned and read.
pub trait SeekableSource {
    /// Returns the total length of the source in bytes.
    fn len(&self) -> u64;

    /// Returns true if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the cursor to `pos`. Fails if `pos` is past the end.
    fn seek(&mut self, pos: u64) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes at the cursor.
    ///
    /// Short reads are allowed; `Ok(0)` for a non-empty `buf` means the end
    /// of the source was reached.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads up to `buf.len()` bytes starting at absolute offset `pos`.
    ///
    /// Returns `Ok(0)` when `pos` is at or beyond the end.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if pos >= self.len() {
            return Ok(0);
        }
        self.seek(pos)?;
        self.read(buf)
    }

    /// Fills `buf` completely from absolute offset `pos`.
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = match self.read_at(pos + filled as u64, &mut buf[filled..]) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if n == 0 {
                return Err(DeltaError::UnexpectedEndOfSource {
                    offset: pos,
                    missing: (buf.len() - filled) as u64,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

impl<S: SeekableSource + ?Sized> SeekableSource for &mut S {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        (**self).seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(pos, buf)
    }
}

/// An in-memory source with a cursor.
#[derive(Debug, Clone)]
pub struct SliceSource<T> {
    data: T,
    cursor: usize,
}

impl<T: AsRef<[u8]>> SliceSource<T> {
    /// Wraps `data`, positioned at the start.
    pub fn new(data: T) -> Self {
        Self { data, cursor: 0 }
    }

    /// Returns the current cursor position.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Returns the number of bytes between the cursor and the end.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.as_ref().len().saturating_sub(self.cursor)
    }

    /// Returns a reference to the wrapped bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Consumes the source and returns the wrapped value.
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T: AsRef<[u8]>> SeekableSource for SliceSource<T> {
    #[inline]
    fn len(&self) -> u64 {
        self.data.as_ref().len() as u64
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if pos > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot seek to {} in a source of {} bytes", pos, self.len()),
            ));
        }
        self.cursor = pos as usize;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = &self.data.as_ref()[self.cursor..];
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.cursor += n;
        Ok(n)
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.as_ref();
        if pos >= data.len() as u64 {
            return Ok(0);
        }
        self.cursor = pos as usize;
        self.read(buf)
    }
}

/// A source over anything that is `Read + Seek`, such as a file.
///
/// Seeks are relative to the last known position, so a buffered reader keeps
/// its buffer across nearby reads.
#[derive(Debug)]
pub struct ReadSeekSource<R> {
    inner: R,
    len: u64,
    // Offset of `inner`, or `None` after a failed operation.
    position: Option<u64>,
}

impl ReadSeekSource<BufReader<File>> {
    /// Opens a file as a source.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> ReadSeekSource<R> {
    /// Wraps `inner`, measuring its length by seeking to the end.
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            len,
            position: Some(0),
        })
    }

    /// Consumes the source and returns the wrapped reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> SeekableSource for ReadSeekSource<R> {
    #[inline]
    fn len(&self) -> u64 {
        self.len
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if pos > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot seek to {} in a source of {} bytes", pos, self.len),
            ));
        }
        match self.position {
            Some(current) if current == pos => return Ok(()),
            Some(current) => {
                let result = self.inner.seek_relative(pos as i64 - current as i64);
                self.position = result.as_ref().ok().map(|_| pos);
                result?;
            }
            None => {
                self.inner.seek(SeekFrom::Start(pos))?;
                self.position = Some(pos);
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => {
                self.position = self.position.map(|p| p + n as u64);
                Ok(n)
            }
            Err(err) => {
                self.position = None;
                Err(err)
            }
        }
    }
}

/// Sequential [`Read`] view of a [`SeekableSource`] starting at an absolute offset.
///
/// Every read goes through [`SeekableSource::read_at`], so interleaving
/// cursors over the same source cannot disturb each other.
pub struct SourceCursor<'a, S: ?Sized> {
    source: &'a mut S,
    position: u64,
}

impl<'a, S: SeekableSource + ?Sized> SourceCursor<'a, S> {
    /// Creates a cursor positioned at `position`.
    pub fn new(source: &'a mut S, position: u64) -> Self {
        Self { source, position }
    }

    /// Returns the absolute offset of the next byte to be read.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Repositions the cursor.
    #[inline]
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    /// Returns the length of the underlying source.
    #[inline]
    pub fn source_len(&self) -> u64 {
        self.source.len()
    }
}

impl<S: SeekableSource + ?Sized> Read for SourceCursor<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{Cursor, Write};
    use std::rc::Rc;

    #[test]
    fn test_slice_source_seek_and_read() {
        let mut src = SliceSource::new(b"0123456789".to_vec());
        assert_eq!(src.len(), 10);

        src.seek(4).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(src.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");
        assert_eq!(src.position(), 7);
        assert_eq!(src.remaining(), 3);

        let mut big = [0u8; 8];
        assert_eq!(src.read(&mut big).unwrap(), 3);
        assert_eq!(src.read(&mut big).unwrap(), 0);
    }

    #[test]
    fn test_slice_source_rejects_seek_past_end() {
        let mut src = SliceSource::new(&b"abc"[..]);
        assert!(src.seek(3).is_ok());
        assert!(src.seek(4).is_err());
    }

    #[test]
    fn test_read_exact_at_reports_missing_bytes() {
        let mut src = SliceSource::new(&b"abcdef"[..]);
        let mut buf = [0u8; 4];
        src.read_exact_at(1, &mut buf).unwrap();
        assert_eq!(&buf, b"bcde");

        match src.read_exact_at(4, &mut buf) {
            Err(DeltaError::UnexpectedEndOfSource { offset, missing }) => {
                assert_eq!(offset, 4);
                assert_eq!(missing, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_read_seek_source_over_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"file backed source").unwrap();

        let mut src = ReadSeekSource::new(file).unwrap();
        assert_eq!(src.len(), 18);

        let mut buf = [0u8; 6];
        src.read_exact_at(5, &mut buf).unwrap();
        assert_eq!(&buf, b"backed");
        assert!(src.seek(19).is_err());
    }

    /// Counts the bytes served by the wrapped reader.
    struct Counting {
        inner: Cursor<Vec<u8>>,
        served: Rc<Cell<u64>>,
    }

    impl Read for Counting {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.served.set(self.served.get() + n as u64);
            Ok(n)
        }
    }

    impl Seek for Counting {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_buffered_source_keeps_buffer_on_sequential_reads() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let served = Rc::new(Cell::new(0));
        let reader = BufReader::new(Counting {
            inner: Cursor::new(data.clone()),
            served: Rc::clone(&served),
        });
        let mut src = ReadSeekSource::new(reader).unwrap();

        let mut out = Vec::new();
        let mut cursor = SourceCursor::new(&mut src, 0);
        let mut byte = [0u8; 1];
        while cursor.read(&mut byte).unwrap() == 1 {
            out.push(byte[0]);
        }
        assert_eq!(out, data);
        assert!(served.get() <= data.len() as u64 * 2, "served {}", served.get());

        // Backward and forward jumps still land on the right bytes.
        let mut buf = [0u8; 4];
        src.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(&buf, &data[10..14]);
        src.read_exact_at(150_000, &mut buf).unwrap();
        assert_eq!(&buf, &data[150_000..150_004]);
        src.read_exact_at(12, &mut buf).unwrap();
        assert_eq!(&buf, &data[12..16]);
    }

    #[test]
    fn test_source_cursor_reads_sequentially() {
        let mut src = ReadSeekSource::new(Cursor::new(b"hello world".to_vec())).unwrap();
        let mut out = String::new();
        {
            let mut cursor = SourceCursor::new(&mut src, 6);
            cursor.read_to_string(&mut out).unwrap();
            assert_eq!(cursor.position(), 11);
        }
        assert_eq!(out, "world");
    }
}
