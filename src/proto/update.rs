//! Fire-and-forget mutations pushed by replicas and pulled by the authority.
//!
//! No reply is ever produced; the replica observes the effect through the
//! publication the authority emits after applying the update.

use crate::types::{Key, Topic, Value};

use super::wire::{put_int, put_key, topic_from, Cursor, WireError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Insert { topic: Topic, key: Key, value: Value },
    Remove { topic: Topic, key: Key },
    Increment { topic: Topic, key: Key, by: Value },
    Decrement { topic: Topic, key: Key, by: Value },
    Clear { topic: Topic },
}

impl Update {
    pub fn topic(&self) -> &str {
        match self {
            Update::Insert { topic, .. }
            | Update::Remove { topic, .. }
            | Update::Increment { topic, .. }
            | Update::Decrement { topic, .. }
            | Update::Clear { topic } => topic,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut c = Cursor::new(buf);
        let topic = topic_from(c.token())?;
        c.space()?;
        match c.token() {
            b"CLEAR" => Ok(Update::Clear { topic }),
            b"REMOVE" => {
                c.space()?;
                let key = c.key()?.to_vec();
                Ok(Update::Remove { topic, key })
            }
            b"INSERT" => {
                c.space()?;
                let key = c.key()?.to_vec();
                c.space()?;
                let value = c.i64()?;
                Ok(Update::Insert { topic, key, value })
            }
            b"+=" => {
                c.space()?;
                let key = c.key()?.to_vec();
                c.space()?;
                let by = c.i64()?;
                Ok(Update::Increment { topic, key, by })
            }
            b"-=" => {
                c.space()?;
                let key = c.key()?.to_vec();
                c.space()?;
                let by = c.i64()?;
                Ok(Update::Decrement { topic, key, by })
            }
            other => Err(WireError::UnknownKind(String::from_utf8_lossy(other).into_owned())),
        }
    }

    pub fn prepare(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Update::Insert { topic, key, value } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" INSERT ");
                put_key(&mut buf, key);
                buf.push(b' ');
                put_int(&mut buf, value);
            }
            Update::Remove { topic, key } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" REMOVE ");
                put_key(&mut buf, key);
            }
            Update::Increment { topic, key, by } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" += ");
                put_key(&mut buf, key);
                buf.push(b' ');
                put_int(&mut buf, by);
            }
            Update::Decrement { topic, key, by } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" -= ");
                put_key(&mut buf, key);
                buf.push(b' ');
                put_int(&mut buf, by);
            }
            Update::Clear { topic } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" CLEAR");
            }
        }
        buf
    }
}
