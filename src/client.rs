//! Memcached text protocol client.
//!
//! Sends a request buffer holding one or more pipelined commands, then walks
//! the same buffer command by command and reads from the socket exactly as
//! many lines as each command's reply needs. All reply lines are returned as
//! one aggregate reply in command order.
//!
//! `send` and `recv` can be called separately so that several clients can
//! have requests in flight against the same server at once.

use crate::buffer::RecvBuffer;
use crate::config::ClientConfig;
use crate::connection::{Connection, Endpoint};
use crate::error::{ClientError, Result};
use crate::protocol::{CommandKind, CommandLine, ReplyLine, RequestLines, SEPARATOR};
use crate::reply::Reply;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};
use tracing::{debug, trace, warn};

/// Width of the rule printed above echoed requests and replies.
const ECHO_RULE_WIDTH: usize = 50;

/// A client connection to one memcached-compatible server.
pub struct MemcachedClient {
    conn: Connection,
    recv_buf: RecvBuffer,
    /// Request written by the last `send`, consumed by the next `recv`
    pending: Option<Bytes>,
    /// Where non-silent exchanges are echoed
    echo: Box<dyn Write + Send>,
}

impl MemcachedClient {
    /// Create a client for `host:port`. The socket is opened lazily on the
    /// first request, or explicitly with `connect`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(&ClientConfig::new(host, port))
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let conn = Connection::new(config.endpoint.clone())
            .with_connect_timeout(config.connect_timeout);
        Self {
            conn,
            recv_buf: RecvBuffer::new(config.recv_chunk_size),
            pending: None,
            echo: Box::new(io::stdout()),
        }
    }

    /// Replace the echo sink (stdout by default).
    pub fn with_echo(mut self, echo: impl Write + Send + 'static) -> Self {
        self.echo = Box::new(echo);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn connect(&mut self) -> Result<()> {
        self.recv_buf.clear();
        self.conn.connect()
    }

    pub fn disconnect(&mut self) {
        self.conn.disconnect();
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.recv_buf.clear();
        self.conn.reconnect()
    }

    /// Send a request and collect the complete reply.
    pub fn execute(&mut self, request: impl AsRef<[u8]>, silent: bool) -> Result<Reply> {
        self.send(request, silent)?;
        self.recv(silent)
    }

    /// Write a request, reconnecting first if the server closed the socket.
    ///
    /// The request is kept for the following `recv`, which needs it to know
    /// how many reply lines to expect.
    pub fn send(&mut self, request: impl AsRef<[u8]>, silent: bool) -> Result<()> {
        self.conn.ensure_live()?;

        let request = Bytes::copy_from_slice(request.as_ref());
        let stream = self.conn.stream_mut()?;
        if let Err(e) = stream.write_all(&request).and_then(|_| stream.flush()) {
            self.conn.disconnect();
            return Err(e.into());
        }
        debug!(endpoint = %self.conn.endpoint(), bytes = request.len(), "Request sent");

        if !silent {
            self.echo_text("<<", &request);
        }
        self.pending = Some(request);
        Ok(())
    }

    /// Collect the reply for the request written by the last `send`.
    pub fn recv(&mut self, silent: bool) -> Result<Reply> {
        let request = self.pending.take().ok_or(ClientError::NoPendingRequest)?;
        self.recv_buf.clear();

        let stream = self.conn.stream_mut()?;
        let mut collector = Collector::new(stream, &mut self.recv_buf);
        let outcome = collector.collect(&request);
        let peer_closed = collector.peer_closed;
        let reply = Reply::new(collector.finish());

        if let Err(e) = outcome {
            self.conn.disconnect();
            return Err(e);
        }
        if peer_closed {
            self.conn.disconnect();
        }
        debug!(endpoint = %self.conn.endpoint(), bytes = reply.len(), "Reply collected");

        if !silent {
            self.echo_text(">>", reply.as_bytes());
        }
        Ok(reply)
    }

    fn echo_text(&mut self, marker: &str, text: &[u8]) {
        let text = String::from_utf8_lossy(text);
        let result = writeln!(
            self.echo,
            "{}{}\n{}",
            marker,
            "-".repeat(ECHO_RULE_WIDTH),
            text.trim()
        )
        .and_then(|_| self.echo.flush());
        if let Err(e) = result {
            debug!(error = %e, "Failed to echo exchange");
        }
    }
}

impl fmt::Debug for MemcachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedClient")
            .field("endpoint", self.conn.endpoint())
            .field("connected", &self.conn.is_connected())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// Reassembles the reply for one request from the socket.
struct Collector<'a, R: Read> {
    src: &'a mut R,
    buf: &'a mut RecvBuffer,
    reply: BytesMut,
    /// The server closed the socket after `quit`
    peer_closed: bool,
}

impl<'a, R: Read> Collector<'a, R> {
    fn new(src: &'a mut R, buf: &'a mut RecvBuffer) -> Self {
        Self {
            src,
            buf,
            reply: BytesMut::new(),
            peer_closed: false,
        }
    }

    fn finish(self) -> Bytes {
        self.reply.freeze()
    }

    /// Walk the request and read each command's reply in order.
    fn collect(&mut self, request: &[u8]) -> Result<()> {
        let mut lines = RequestLines::new(request);

        while let Some(line) = lines.next_line() {
            if line.is_empty() {
                break;
            }

            let cmd = CommandLine::parse(line);
            trace!(kind = ?cmd.kind, noreply = cmd.noreply, "Collecting reply");

            match cmd.kind {
                CommandKind::Storage => {
                    // payload was already sent; nothing comes back for it
                    lines.skip_payload(cmd.payload_len);
                    self.single_line(&cmd)?;
                }
                CommandKind::Retrieval => self.retrieval()?,
                CommandKind::Stats => self.stats()?,
                CommandKind::Deletion | CommandKind::IncrDecr | CommandKind::Other => {
                    self.single_line(&cmd)?
                }
                CommandKind::Unknown => {
                    debug!(command = %String::from_utf8_lossy(line), "Unknown command");
                    let reply = self.read_line()?;
                    self.append(&reply);
                }
            }

            if self.peer_closed {
                break;
            }
        }

        Ok(())
    }

    /// One reply line unless the command ends with `noreply`.
    fn single_line(&mut self, cmd: &CommandLine<'_>) -> Result<()> {
        if cmd.noreply {
            return Ok(());
        }
        match self.read_line() {
            Ok(line) => {
                self.append(&line);
                Ok(())
            }
            Err(ClientError::ConnectionClosed) if cmd.quit => {
                self.peer_closed = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// VALUE blocks until END or an error line.
    fn retrieval(&mut self) -> Result<()> {
        loop {
            let line = self.read_line()?;
            self.append(&line);

            match ReplyLine::classify(&line) {
                ReplyLine::Value(Some(len)) => self.value_body(len)?,
                ReplyLine::Value(None) => {
                    warn!(line = %String::from_utf8_lossy(&line), "Malformed VALUE header");
                }
                ReplyLine::End | ReplyLine::Error => return Ok(()),
                ReplyLine::Other => {
                    self.annotate_unknown(&line);
                    return Ok(());
                }
            }
        }
    }

    /// Read a value body of `len` bytes.
    ///
    /// The body arrives as one or more physical lines when it contains the
    /// separator; each line counts toward `len` together with the separator
    /// that split it from the next one.
    fn value_body(&mut self, len: usize) -> Result<()> {
        let mut remaining = len;
        loop {
            let chunk = self.read_line()?;
            self.append(&chunk);
            if chunk.len() >= remaining {
                return Ok(());
            }
            remaining = (remaining - chunk.len()).saturating_sub(SEPARATOR.len());
        }
    }

    /// STAT lines until END or an error line.
    fn stats(&mut self) -> Result<()> {
        loop {
            let line = self.read_line()?;
            self.append(&line);

            if matches!(ReplyLine::classify(&line), ReplyLine::End | ReplyLine::Error) {
                return Ok(());
            }
        }
    }

    fn annotate_unknown(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        warn!(line = %line, "Unexpected line in retrieval reply");
        self.reply
            .extend_from_slice(format!("error: unknown line: '{}'", line).as_bytes());
        self.reply.extend_from_slice(SEPARATOR);
    }

    fn read_line(&mut self) -> Result<Bytes> {
        self.buf.read_line(&mut *self.src)
    }

    fn append(&mut self, line: &[u8]) {
        self.reply.extend_from_slice(line);
        self.reply.extend_from_slice(SEPARATOR);
    }
}
