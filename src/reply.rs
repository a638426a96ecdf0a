//! Aggregate reply returned by a client exchange.
//!
//! Every reply line is re-terminated with `\r\n`, so value bodies that
//! contained separators come back byte-identical and can be recovered from
//! the declared length in their `VALUE` header.

use crate::protocol::{find_crlf, parse_number, tokens, SEPARATOR};
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Problems found while extracting `VALUE` blocks from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("malformed VALUE header: {0}")]
    MalformedHeader(String),

    #[error("value body for '{key}' truncated: expected {expected} bytes")]
    Truncated { key: String, expected: usize },
}

/// One `VALUE` block decoded from a retrieval reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueBlock {
    pub key: String,
    pub flags: u32,
    /// Present for `gets` replies
    pub cas: Option<u64>,
    pub data: Bytes,
}

/// Ordered concatenation of all reply lines for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    data: Bytes,
}

impl Reply {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Physical lines, without separators.
    pub fn lines(&self) -> Lines<'_> {
        Lines { rest: &self.data }
    }

    /// Decode every `VALUE` block in the reply, in order.
    pub fn values(&self) -> Result<Vec<ValueBlock>, ReplyError> {
        let mut values = Vec::new();
        let mut pos = 0;

        while let Some(off) = find_crlf(&self.data[pos..]) {
            let line = &self.data[pos..pos + off];
            pos += off + SEPARATOR.len();

            if !line.starts_with(b"VALUE") {
                continue;
            }

            let (key, flags, len, cas) = parse_header(line)?;
            let end = pos + len;
            if self.data.len() < end + SEPARATOR.len()
                || &self.data[end..end + SEPARATOR.len()] != SEPARATOR
            {
                return Err(ReplyError::Truncated { key, expected: len });
            }

            values.push(ValueBlock {
                key,
                flags,
                cas,
                data: self.data.slice(pos..end),
            });
            pos = end + SEPARATOR.len();
        }

        Ok(values)
    }
}

/// `VALUE <key> <flags> <bytes> [<cas unique>]`
fn parse_header(line: &[u8]) -> Result<(String, u32, usize, Option<u64>), ReplyError> {
    let malformed = || ReplyError::MalformedHeader(String::from_utf8_lossy(line).into_owned());

    let fields: Vec<&[u8]> = tokens(line).collect();
    if fields.len() < 4 {
        return Err(malformed());
    }

    let key = String::from_utf8_lossy(fields[1]).into_owned();
    let flags = std::str::from_utf8(fields[2])
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let len = parse_number(fields[3]).ok_or_else(malformed)?;
    let cas = match fields.get(4) {
        Some(token) => Some(
            std::str::from_utf8(token)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(malformed)?,
        ),
        None => None,
    };

    Ok((key, flags, len, cas))
}

/// Iterator over the lines of a reply.
pub struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match find_crlf(self.rest) {
            Some(pos) => {
                let line = &self.rest[..pos];
                self.rest = &self.rest[pos + SEPARATOR.len()..];
                Some(line)
            }
            None => {
                let line = self.rest;
                self.rest = &[];
                Some(line)
            }
        }
    }
}

impl AsRef<[u8]> for Reply {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.data))
    }
}
