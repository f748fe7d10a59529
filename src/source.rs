//! Random access over the bytes of an archive.
//!
//! ZIM archives are read by jumping around: header, pointer tables,
//! directory entries, then clusters. [`ByteSource`] wraps anything
//! `Read + Seek` (a file, a memory map in a `Cursor`, a `Vec<u8>`...)
//! with a read buffer and the handful of little-endian primitives the format needs.
//!
//! [`ByteSource`]: struct.ByteSource.html

use std::io::{self, prelude::*, BufReader, SeekFrom};

use memchr::memchr;

use crate::arch::usize;
use crate::result::*;

/// A buffered, seekable view of an archive.
pub struct ByteSource<R> {
    inner: BufReader<R>,
    len: u64,
}

fn eof(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, what)
}

impl<R: Read + Seek> ByteSource<R> {
    /// Wraps the given source, measuring its length and rewinding it.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner: BufReader::new(inner),
            len,
        })
    }

    /// The total length of the source in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Moves to the given absolute offset.
    ///
    /// Unlike `std::io::Seek`, seeking past the end is an error:
    /// every offset we seek to comes from the archive, so one past the end
    /// means the archive is truncated or corrupt.
    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        if offset > self.len {
            return Err(eof("Seek past the end of the archive"));
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// The current absolute offset
    pub fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    /// Bytes left between the current position and the end of the source
    fn remaining(&mut self) -> io::Result<u64> {
        Ok(self.len.saturating_sub(self.position()?))
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian u16
    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian u32
    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian u64
    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads exactly `n` bytes.
    ///
    /// Fails before allocating if fewer than `n` bytes remain,
    /// so a corrupt length can't make us allocate the moon.
    pub fn read_bytes(&mut self, n: u64) -> ZimResult<Vec<u8>> {
        if n > self.remaining()? {
            return Err(eof("Read past the end of the archive").into());
        }
        let mut buf = vec![0; usize(n)?];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a NUL-terminated UTF-8 string, consuming the NUL.
    ///
    /// Hitting the end of the source before a NUL is an I/O error.
    pub fn read_zero_terminated_string(&mut self) -> ZimResult<String> {
        let mut bytes = Vec::new();
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Err(eof("Unterminated string").into());
            }
            match memchr(0, available) {
                Some(nul) => {
                    bytes.extend_from_slice(&available[..nul]);
                    self.inner.consume(nul + 1);
                    break;
                }
                None => {
                    let consumed = available.len();
                    bytes.extend_from_slice(available);
                    self.inner.consume(consumed);
                }
            }
        }
        String::from_utf8(bytes).map_err(|e| ZimError::Encoding(e.utf8_error()))
    }

    /// Gives back the wrapped source, dropping the read buffer.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

// Decompressors stream straight out of the source.

impl<R: Read> Read for ByteSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read> BufRead for ByteSource<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}
