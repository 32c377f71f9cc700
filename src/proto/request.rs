//! Queries sent on the replica's request channel and read from the
//! authority's reply channel.

use crate::types::{Key, Topic};

use super::wire::{put_key, topic_from, Cursor, WireError};

/// Wire-level request body. The replica-side bookkeeping (callback, deadline,
/// sent flag) lives in [`super::PendingRequest`]; the authority only ever sees
/// this part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Lookup { topic: Topic, key: Key },
    HasKey { topic: Topic, key: Key },
    Size { topic: Topic },
    Snapshot { topic: Topic },
}

impl Request {
    pub fn topic(&self) -> &str {
        match self {
            Request::Lookup { topic, .. }
            | Request::HasKey { topic, .. }
            | Request::Size { topic }
            | Request::Snapshot { topic } => topic,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut c = Cursor::new(buf);
        let topic = topic_from(c.token())?;
        c.space()?;
        match c.token() {
            b"SIZE" => Ok(Request::Size { topic }),
            b"SNAPSHOT" => Ok(Request::Snapshot { topic }),
            b"LOOKUP" => {
                c.space()?;
                let key = c.key()?.to_vec();
                Ok(Request::Lookup { topic, key })
            }
            b"HASKEY" => {
                c.space()?;
                let key = c.key()?.to_vec();
                Ok(Request::HasKey { topic, key })
            }
            other => Err(WireError::UnknownKind(String::from_utf8_lossy(other).into_owned())),
        }
    }

    pub fn prepare(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Lookup { topic, key } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" LOOKUP ");
                put_key(&mut buf, key);
            }
            Request::HasKey { topic, key } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" HASKEY ");
                put_key(&mut buf, key);
            }
            // The trailing space is part of the wire form.
            Request::Size { topic } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" SIZE ");
            }
            Request::Snapshot { topic } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" SNAPSHOT ");
            }
        }
        buf
    }
}
