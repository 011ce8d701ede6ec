//! `InputStream`: a `Read` with skip, available, mark/reset and explicit close
//!
//! The packet streams are built from components implementing this trait. The
//! defaults describe the weakest stream: no native skip, nothing available,
//! no mark support, a no-op close.

use std::io::{self, Cursor, Read};

use crate::error::CryptoError;

pub trait InputStream: Read {
    /// Skip up to `n` bytes without returning them. Returning 0 is always
    /// allowed; callers fall back to reading.
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let _ = n;
        Ok(0)
    }

    /// Bytes readable without blocking.
    fn available(&self) -> io::Result<u64> {
        Ok(0)
    }

    fn mark_supported(&self) -> bool {
        false
    }

    /// Remember the current position. `read_limit` is the number of bytes
    /// the caller may read before calling `reset`.
    fn mark(&mut self, read_limit: usize) {
        let _ = read_limit;
    }

    fn reset(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "mark/reset not supported",
        ))
    }

    /// Release the resources held by this stream. Must tolerate repeated calls.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: InputStream + ?Sized> InputStream for Box<S> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        (**self).skip(n)
    }

    fn available(&self) -> io::Result<u64> {
        (**self).available()
    }

    fn mark_supported(&self) -> bool {
        (**self).mark_supported()
    }

    fn mark(&mut self, read_limit: usize) {
        (**self).mark(read_limit)
    }

    fn reset(&mut self) -> io::Result<()> {
        (**self).reset()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<S: InputStream + ?Sized> InputStream for &mut S {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        (**self).skip(n)
    }

    fn available(&self) -> io::Result<u64> {
        (**self).available()
    }

    fn mark_supported(&self) -> bool {
        (**self).mark_supported()
    }

    fn mark(&mut self, read_limit: usize) {
        (**self).mark(read_limit)
    }

    fn reset(&mut self) -> io::Result<()> {
        (**self).reset()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// In-memory stream with native skip and mark/reset.
///
/// An unmarked stream resets to its start.
#[derive(Debug, Clone)]
pub struct BytesStream<T> {
    inner: Cursor<T>,
    mark: u64,
}

impl<T: AsRef<[u8]>> BytesStream<T> {
    pub fn new(bytes: T) -> Self {
        Self {
            inner: Cursor::new(bytes),
            mark: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    fn remaining(&self) -> u64 {
        let len = self.inner.get_ref().as_ref().len() as u64;
        len.saturating_sub(self.inner.position())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: AsRef<[u8]>> Read for BytesStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: AsRef<[u8]>> InputStream for BytesStream<T> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let skipped = n.min(self.remaining());
        self.inner.set_position(self.inner.position() + skipped);
        Ok(skipped)
    }

    fn available(&self) -> io::Result<u64> {
        Ok(self.remaining())
    }

    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, _read_limit: usize) {
        self.mark = self.inner.position();
    }

    fn reset(&mut self) -> io::Result<()> {
        self.inner.set_position(self.mark);
        Ok(())
    }
}

/// Adapts any `Read` (a network body, a file) into an `InputStream`.
///
/// `close` drops the reader, releasing whatever it holds; later reads fail
/// with [`CryptoError::StreamClosed`].
#[derive(Debug)]
pub struct ReadStream<R> {
    inner: Option<R>,
}

impl<R: Read> ReadStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }

    fn reader(&mut self) -> io::Result<&mut R> {
        self.inner
            .as_mut()
            .ok_or_else(|| CryptoError::StreamClosed.into())
    }
}

impl<R: Read> Read for ReadStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader()?.read(buf)
    }
}

impl<R: Read> InputStream for ReadStream<R> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let reader = self.reader()?;
        io::copy(&mut reader.take(n), &mut io::sink())
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner = None;
        Ok(())
    }
}

/// Read until `buf` is full or the stream ends, returning the bytes read.
pub(crate) fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
