//! One-way broadcasts from the authority's publish channel.
//!
//! Every authoritative mutation produces exactly one publication carrying the
//! post-mutation sequence number. A `ValUpdate` with an absent value encodes
//! a deletion; with a present value it carries the resulting value, never a
//! delta, so subscribers need no prior state to apply it.

use std::rc::Rc;

use crate::types::{Key, StoreMap, Topic, Value};

use super::wire::{put_int, put_key, topic_from, Cursor, WireError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    ValUpdate {
        topic: Topic,
        key: Key,
        /// `None` deletes the key; `Some` sets it to the carried value.
        value: Option<Value>,
        sequence: u64,
    },
    Clear { topic: Topic, sequence: u64 },
}

impl Publication {
    pub fn topic(&self) -> &str {
        match self {
            Publication::ValUpdate { topic, .. } | Publication::Clear { topic, .. } => topic,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Publication::ValUpdate { sequence, .. } | Publication::Clear { sequence, .. } => *sequence,
        }
    }

    /// Apply this publication to a local store copy.
    pub fn apply(&self, store: &mut StoreMap) {
        match self {
            Publication::ValUpdate { key, value: Some(v), .. } => {
                store.insert(key.clone(), *v);
            }
            Publication::ValUpdate { key, value: None, .. } => {
                store.remove(key);
            }
            Publication::Clear { .. } => store.clear(),
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut c = Cursor::new(buf);
        let topic = topic_from(c.token())?;
        c.space()?;
        match c.token() {
            b"UPDATE" => {
                c.space()?;
                let sequence = c.u64()?;
                c.space()?;
                let key = c.key()?.to_vec();
                let value = if c.at_end() {
                    None
                } else {
                    c.space()?;
                    Some(c.i64()?)
                };
                Ok(Publication::ValUpdate { topic, key, value, sequence })
            }
            b"CLEAR" => {
                c.space()?;
                let sequence = c.u64()?;
                Ok(Publication::Clear { topic, sequence })
            }
            other => Err(WireError::UnknownKind(String::from_utf8_lossy(other).into_owned())),
        }
    }

    pub fn prepare(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Publication::ValUpdate { topic, key, value, sequence } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" UPDATE ");
                put_int(&mut buf, sequence);
                buf.push(b' ');
                put_key(&mut buf, key);
                if let Some(v) = value {
                    buf.push(b' ');
                    put_int(&mut buf, v);
                }
            }
            Publication::Clear { topic, sequence } => {
                buf.extend_from_slice(topic.as_bytes());
                buf.extend_from_slice(b" CLEAR ");
                put_int(&mut buf, sequence);
            }
        }
        buf
    }
}

/// A publication with its wire bytes computed once at construction.
///
/// Mutations fan the same publication out to every attached backend, so the
/// prepared form is shared behind an `Rc` instead of re-serialized per queue.
#[derive(Debug)]
pub struct PreparedPublication {
    message: Publication,
    wire: Vec<u8>,
}

impl PreparedPublication {
    pub fn new(message: Publication) -> Self {
        let wire = message.prepare();
        PreparedPublication { message, wire }
    }

    pub fn message(&self) -> &Publication {
        &self.message
    }

    pub fn wire(&self) -> &[u8] {
        &self.wire
    }
}

pub type SharedPublication = Rc<PreparedPublication>;
