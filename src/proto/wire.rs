//! Codec primitives for the space-delimited textual wire format.
//!
//! Every message is UTF-8 text except for key bytes, which are arbitrary and
//! length-prefixed (`<klen> <key>`). Tokens never consume the separator that
//! follows them; grammar rules consume separators explicitly via [`Cursor::space`].

use thiserror::Error;

/// A failed parse. The caller decides whether this becomes a silent drop
/// (pub/push channels) or an invalid-request reply (reply channel).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("expected space separator")]
    MissingSeparator,
    #[error("invalid integer field")]
    BadInteger,
    #[error("key shorter than its declared length")]
    ShortKey,
    #[error("topic is not valid UTF-8")]
    BadTopic,
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
}

/// Forward-only reader over a received message.
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    pub fn at_end(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes up to the next space or the end of the message. The separator,
    /// if any, is left in place.
    pub fn token(&mut self) -> &'a [u8] {
        let end = self.buf.iter().position(|&b| b == b' ').unwrap_or(self.buf.len());
        let tok = &self.buf[..end];
        self.buf = &self.buf[end..];
        tok
    }

    /// Consume exactly one space separator.
    pub fn space(&mut self) -> Result<(), WireError> {
        match self.buf.first() {
            Some(b' ') => {
                self.buf = &self.buf[1..];
                Ok(())
            }
            _ => Err(WireError::MissingSeparator),
        }
    }

    /// Everything left in the message.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        parse_int(self.token())
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        parse_int(self.token())
    }

    /// A length-prefixed key: `<klen> <key>`. The key bytes are taken verbatim,
    /// so they may contain spaces or non-UTF-8 content.
    pub fn key(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u64()? as usize;
        self.space()?;
        if self.buf.len() < len {
            return Err(WireError::ShortKey);
        }
        let key = &self.buf[..len];
        self.buf = &self.buf[len..];
        Ok(key)
    }
}

fn parse_int<T: std::str::FromStr>(tok: &[u8]) -> Result<T, WireError> {
    std::str::from_utf8(tok)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::BadInteger)
}

/// Validate and own a topic token.
pub fn topic_from(tok: &[u8]) -> Result<String, WireError> {
    String::from_utf8(tok.to_vec()).map_err(|_| WireError::BadTopic)
}

/// Append a length-prefixed key.
pub fn put_key(buf: &mut Vec<u8>, key: &[u8]) {
    buf.extend_from_slice(key.len().to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(key);
}

/// Append a decimal integer.
pub fn put_int(buf: &mut Vec<u8>, n: impl ToString) {
    buf.extend_from_slice(n.to_string().as_bytes());
}
