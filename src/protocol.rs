//! Memcached text protocol classification for the client side.
//!
//! Splits an outbound request buffer into command lines, tags each command
//! with the shape of the reply it will produce, and classifies reply lines
//! read back from the server:
//! - Storage: set, add, replace, append, prepend, cas
//! - Retrieval: get, gets
//! - Deletion: delete
//! - Increment/decrement: incr, decr
//! - Stats: stats
//! - Other: flush_all, version, quit

/// Line separator used by the text protocol.
pub const SEPARATOR: &[u8] = b"\r\n";

/// Reply shape expected for a command, derived from its leading token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// set, add, replace, append, prepend, cas (followed by a payload line)
    Storage,
    /// get, gets (VALUE blocks terminated by END)
    Retrieval,
    /// delete
    Deletion,
    /// incr, decr
    IncrDecr,
    /// stats (STAT lines terminated by END)
    Stats,
    /// flush_all, version, quit
    Other,
    /// Anything else; one reply line is read unconditionally
    Unknown,
}

impl CommandKind {
    /// Classify a verb, case-insensitively.
    pub fn from_verb(verb: &[u8]) -> Self {
        const STORAGE: [&[u8]; 6] = [b"set", b"add", b"replace", b"append", b"prepend", b"cas"];

        if STORAGE.iter().any(|v| verb.eq_ignore_ascii_case(v)) {
            CommandKind::Storage
        } else if verb.eq_ignore_ascii_case(b"get") || verb.eq_ignore_ascii_case(b"gets") {
            CommandKind::Retrieval
        } else if verb.eq_ignore_ascii_case(b"delete") {
            CommandKind::Deletion
        } else if verb.eq_ignore_ascii_case(b"incr") || verb.eq_ignore_ascii_case(b"decr") {
            CommandKind::IncrDecr
        } else if verb.eq_ignore_ascii_case(b"stats") {
            CommandKind::Stats
        } else if verb.eq_ignore_ascii_case(b"flush_all")
            || verb.eq_ignore_ascii_case(b"version")
            || verb.eq_ignore_ascii_case(b"quit")
        {
            CommandKind::Other
        } else {
            CommandKind::Unknown
        }
    }
}

/// A single command line from a request buffer together with what was
/// extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine<'a> {
    /// Raw line, without separator
    pub line: &'a [u8],
    pub kind: CommandKind,
    /// Last token is `noreply` (case-insensitive)
    pub noreply: bool,
    /// Declared payload length for storage commands (`<bytes>` field)
    pub payload_len: Option<usize>,
    /// `quit`, after which the server closes the connection without replying
    pub quit: bool,
}

impl<'a> CommandLine<'a> {
    /// Parse a command line. The line must not include the separator.
    pub fn parse(line: &'a [u8]) -> Self {
        let tokens: Vec<&[u8]> = tokens(line).collect();
        let verb = tokens.first().copied().unwrap_or_default();
        let kind = CommandKind::from_verb(verb);
        let quit = verb.eq_ignore_ascii_case(b"quit");

        let noreply = tokens
            .last()
            .is_some_and(|last| last.eq_ignore_ascii_case(b"noreply"));

        // Format: <command> <key> <flags> <exptime> <bytes> [<cas unique>] [noreply]
        let payload_len = match kind {
            CommandKind::Storage => tokens.get(4).and_then(|t| parse_number(t)),
            _ => None,
        };

        CommandLine {
            line,
            kind,
            noreply,
            payload_len,
            quit,
        }
    }
}

/// Cursor over the command lines of an outbound request buffer.
pub struct RequestLines<'a> {
    buf: &'a [u8],
}

impl<'a> RequestLines<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Next line without its separator. A trailing fragment with no
    /// separator is returned as the final line.
    pub fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.buf.is_empty() {
            return None;
        }
        match find_crlf(self.buf) {
            Some(pos) => {
                let line = &self.buf[..pos];
                self.buf = &self.buf[pos + SEPARATOR.len()..];
                Some(line)
            }
            None => {
                let line = self.buf;
                self.buf = &[];
                Some(line)
            }
        }
    }

    /// Skip the payload block that follows a storage command.
    ///
    /// When the declared length is known and the request carries a separator
    /// right after that many bytes, exactly the block is skipped, so payloads
    /// containing `\r\n` stay intact. Otherwise the next line is skipped.
    pub fn skip_payload(&mut self, declared: Option<usize>) {
        if let Some(len) = declared {
            let end = len + SEPARATOR.len();
            if self.buf.len() >= end && &self.buf[len..end] == SEPARATOR {
                self.buf = &self.buf[end..];
                return;
            }
        }
        self.next_line();
    }

    /// Bytes not consumed yet.
    #[cfg(test)]
    fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

/// Classification of a reply line inside a multi-line reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLine {
    /// `VALUE <key> <flags> <bytes> [<cas>]`; `None` when the header is
    /// malformed (fewer than four fields or unparsable length)
    Value(Option<usize>),
    /// Exactly `END`
    End,
    /// Starts with `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR`
    Error,
    /// Anything else (e.g. `STAT` lines)
    Other,
}

impl ReplyLine {
    pub fn classify(line: &[u8]) -> Self {
        if line.starts_with(b"VALUE") {
            ReplyLine::Value(tokens(line).nth(3).and_then(parse_number))
        } else if line == b"END" {
            ReplyLine::End
        } else if is_error_line(line) {
            ReplyLine::Error
        } else {
            ReplyLine::Other
        }
    }
}

/// Whether a line is a server-reported error of any class.
pub fn is_error_line(line: &[u8]) -> bool {
    line.starts_with(b"ERROR")
        || line.starts_with(b"CLIENT_ERROR")
        || line.starts_with(b"SERVER_ERROR")
}

/// Whitespace-separated tokens of a line.
pub fn tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
}

/// Parse an unsigned decimal field.
pub fn parse_number(token: &[u8]) -> Option<usize> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

/// Find \r\n in buffer
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == SEPARATOR)
}
