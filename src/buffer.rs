//! Receive-side line buffering.
//!
//! Bytes arrive from the socket in arbitrary fragments. `RecvBuffer`
//! accumulates them and hands out complete `\r\n`-terminated lines; whatever
//! follows the last separator stays buffered for the next call.

use crate::error::{ClientError, Result};
use crate::protocol::{find_crlf, SEPARATOR};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{ErrorKind, Read};
use tracing::trace;

/// Default size of a single socket read.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Per-connection receive accumulator.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: BytesMut,
    chunk_size: usize,
    /// Where to resume the separator search; everything before it has been
    /// scanned already.
    scanned: usize,
}

impl RecvBuffer {
    /// Create a buffer that refills in reads of at most `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            scanned: 0,
        }
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Number of buffered bytes not yet returned as lines.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read one line, without its separator, pulling from `src` as needed.
    ///
    /// Fails with `ConnectionClosed` if `src` reports end of stream before a
    /// separator is seen.
    pub fn read_line<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<Bytes> {
        loop {
            // A separator may straddle the previous scan boundary
            let from = self.scanned.saturating_sub(1);
            if let Some(pos) = find_crlf(&self.buf[from..]) {
                let line = self.buf.split_to(from + pos).freeze();
                self.buf.advance(SEPARATOR.len());
                self.scanned = 0;
                trace!(len = line.len(), "Line received");
                return Ok(line);
            }
            self.scanned = self.buf.len();
            self.fill(src)?;
        }
    }

    /// One blocking read of up to `chunk_size` bytes.
    fn fill<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<()> {
        let start = self.buf.len();
        self.buf.resize(start + self.chunk_size, 0);
        let n = loop {
            match src.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e.into());
                }
            }
        };
        self.buf.truncate(start + n);
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        trace!(bytes = n, buffered = self.buf.len(), "Socket read");
        Ok(())
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}
